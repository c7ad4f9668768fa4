//! Drone bookkeeping on the control-plane side.
//!
//! A [`Drone`] pairs the scheduling state for one worker machine (capacity,
//! enablement, user allowlist) with an introspectable queue of RPC calls that
//! have been decided but not yet flushed. The queue is owned exclusively by
//! the control task; it is flushed through the [`DroneTransport`] once per
//! execution-actions cycle and must be empty before a new refresh is queued.

pub mod transport;

use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::DroneConfig;

pub use transport::{DroneTransport, ProcessRow, RefreshBundle};

/// One decided-but-unflushed RPC call against a drone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DroneCall {
    /// Prepare the drone's results tree.
    Initialize { results_root: PathBuf },
    /// Start a job. The command has already had its working-directory
    /// sentinel substituted.
    Execute {
        command: Vec<String>,
        working_directory: PathBuf,
        pidfile_name: String,
        log_file: Option<PathBuf>,
    },
    /// Write a small file before the job that needs it starts.
    WriteFile { path: PathBuf, contents: String },
    /// Copy within this drone's own filesystem.
    CopyFile {
        source: PathBuf,
        destination: PathBuf,
    },
    /// Copy from this drone to another host.
    SendFileTo {
        hostname: String,
        source: PathBuf,
        destination: PathBuf,
        can_fail: bool,
    },
    /// Kill a process previously observed on this drone.
    KillProcess { pid: u32 },
}

impl DroneCall {
    /// Short call name used in logs and protocol-violation errors.
    pub fn name(&self) -> &'static str {
        match self {
            DroneCall::Initialize { .. } => "initialize",
            DroneCall::Execute { .. } => "execute_command",
            DroneCall::WriteFile { .. } => "write_file",
            DroneCall::CopyFile { .. } => "copy_file",
            DroneCall::SendFileTo { .. } => "send_file_to",
            DroneCall::KillProcess { .. } => "kill_process",
        }
    }
}

impl fmt::Display for DroneCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Scheduling state and pending calls for one worker machine.
pub struct Drone {
    hostname: String,
    pub enabled: bool,
    pub max_processes: usize,
    /// Recomputed from registered pidfiles each refresh cycle, bumped
    /// optimistically at dispatch.
    pub active_processes: usize,
    pub allowed_users: Option<HashSet<String>>,
    pub supports_ssp: bool,
    /// Cleared when a refresh fails; such a drone keeps its stale snapshot
    /// but is not placed on until it refreshes successfully again.
    pub last_refresh_ok: bool,
    calls: Vec<DroneCall>,
    transport: Arc<dyn DroneTransport>,
}

impl Drone {
    pub fn new(config: &DroneConfig, transport: Arc<dyn DroneTransport>) -> Self {
        Self {
            hostname: config.hostname.clone(),
            enabled: config.enabled,
            max_processes: config.max_processes,
            active_processes: 0,
            allowed_users: config.allowed_users.clone(),
            supports_ssp: config.supports_ssp,
            last_refresh_ok: true,
            calls: Vec::new(),
            transport,
        }
    }

    /// Whether this drone may currently be chosen for placement.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.last_refresh_ok
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn transport(&self) -> Arc<dyn DroneTransport> {
        self.transport.clone()
    }

    /// Reapply scheduling configuration without touching refresh-derived
    /// state or the call queue.
    pub fn apply_config(&mut self, config: &DroneConfig) {
        self.enabled = config.enabled;
        self.max_processes = config.max_processes;
        self.allowed_users = config.allowed_users.clone();
        self.supports_ssp = config.supports_ssp;
    }

    pub fn usable_by(&self, user: Option<&str>) -> bool {
        match (&self.allowed_users, user) {
            (None, _) => true,
            (Some(allowed), Some(user)) => allowed.contains(user),
            (Some(_), None) => false,
        }
    }

    pub fn queue_call(&mut self, call: DroneCall) {
        tracing::debug!(hostname = %self.hostname, call = %call, "Queued drone call");
        self.calls.push(call);
    }

    pub fn queued_calls(&self) -> &[DroneCall] {
        &self.calls
    }

    /// Take every queued call, leaving the queue empty.
    pub fn drain_calls(&mut self) -> Vec<DroneCall> {
        std::mem::take(&mut self.calls)
    }

    pub fn clear_call_queue(&mut self) {
        self.calls.clear();
    }
}

impl fmt::Debug for Drone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drone")
            .field("hostname", &self.hostname)
            .field("enabled", &self.enabled)
            .field("max_processes", &self.max_processes)
            .field("active_processes", &self.active_processes)
            .field("queued_calls", &self.calls.len())
            .finish()
    }
}

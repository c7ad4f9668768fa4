//! Transport trait abstraction for reaching a drone.
//!
//! How a call actually travels (ssh, local exec, test double) is the host's
//! concern; the control plane only requires a queue-and-execute primitive
//! plus the composite refresh read.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::drone::DroneCall;
use crate::error::Result;

/// One row of a drone's process table, as reported by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRow {
    pub pid: u32,
    pub ppid: u32,
    pub pgid: u32,
    pub command: String,
}

/// Everything a drone reports back from one refresh request.
///
/// The two pidfile readings are taken at different points within the drone's
/// own refresh so callers can compare them to detect a job that completed
/// while the refresh was in flight.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshBundle {
    /// Snapshot of job-runner processes.
    pub processes: Vec<ProcessRow>,
    /// Snapshot of record-keeping (parser) processes.
    pub parse_processes: Vec<ProcessRow>,
    /// First reading of every requested pidfile's raw contents. Paths that
    /// do not exist on this drone are omitted, not reported as empty.
    pub pidfiles: HashMap<PathBuf, String>,
    /// Second, later reading of the same pidfiles.
    pub pidfiles_second_read: HashMap<PathBuf, String>,
}

/// RPC surface of one worker machine.
///
/// Implementations must apply their own timeouts; no manager operation
/// blocks indefinitely on a drone that never answers.
#[async_trait]
pub trait DroneTransport: Send + Sync {
    /// Read back the drone's process tables and the raw contents of every
    /// listed pidfile, twice.
    async fn refresh(&self, pidfile_paths: Vec<PathBuf>) -> Result<RefreshBundle>;

    /// Execute a batch of previously queued calls, in order.
    async fn execute_calls(&self, calls: Vec<DroneCall>) -> Result<()>;
}

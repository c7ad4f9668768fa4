//! In-memory snapshot of remote processes and tracked pidfiles.
//!
//! The registry is rebuilt from drone refresh bundles every cycle and owns
//! the aging/eviction of pidfile registrations. It is the single source the
//! dispatch facade answers point queries from between cycles.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};

use crate::drone::ProcessRow;
use crate::pidfile::{parse_pidfile_contents, PidfileContents, PidfileId, Process};

/// Command-name marker identifying job-runner processes in a process table.
pub const JOB_RUNNER_COMMAND: &str = "autoserv";

/// Bookkeeping for one watched pidfile.
#[derive(Debug, Clone)]
pub struct PidfileRegistration {
    /// Process slots the job behind this pidfile consumes.
    pub num_processes: usize,
    /// Refresh cycles since the last access or (re)registration.
    pub age_in_cycles: u32,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct Registry {
    /// Job-runner processes that are roots of their own process group.
    processes: HashSet<Process>,
    /// Record-keeping (parser) processes, same root-of-group filter.
    parse_processes: HashSet<Process>,
    /// Every observed process regardless of class, for liveness checks.
    all_processes: HashSet<(String, u32)>,
    pidfiles: HashMap<PidfileId, PidfileContents>,
    pidfiles_second_read: HashMap<PidfileId, PidfileContents>,
    registrations: HashMap<PidfileId, PidfileRegistration>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop pidfile views that no longer have a registration behind them.
    /// Run once per refresh cycle so abandoned paths cannot accumulate.
    pub fn prune_unregistered(&mut self) {
        let registrations = &self.registrations;
        self.pidfiles.retain(|id, _| registrations.contains_key(id));
        self.pidfiles_second_read
            .retain(|id, _| registrations.contains_key(id));
    }

    /// Drop one drone's process snapshot ahead of re-ingesting it. A drone
    /// whose refresh failed is never cleared, so its previous snapshot stays
    /// queryable for the cycle.
    pub fn clear_host(&mut self, hostname: &str) {
        self.processes.retain(|p| p.hostname != hostname);
        self.parse_processes.retain(|p| p.hostname != hostname);
        self.all_processes.retain(|(host, _)| host != hostname);
    }

    /// Ingest one drone's process-table snapshot.
    ///
    /// A job-runner row joins the process set only if it is the root of its
    /// own process group; child processes must not be mistaken for
    /// independent jobs. Every row lands in the all-processes index.
    pub fn ingest_process_table(&mut self, hostname: &str, rows: &[ProcessRow]) {
        for row in rows {
            self.all_processes.insert((hostname.to_string(), row.pid));
            if row.command.contains(JOB_RUNNER_COMMAND) && row.pgid == row.pid {
                self.processes
                    .insert(Process::new(hostname, row.pid).with_ppid(row.ppid));
            }
        }
    }

    /// Ingest one drone's parser-process snapshot.
    pub fn ingest_parse_process_table(&mut self, hostname: &str, rows: &[ProcessRow]) {
        for row in rows {
            self.all_processes.insert((hostname.to_string(), row.pid));
            if row.pgid == row.pid {
                self.parse_processes
                    .insert(Process::new(hostname, row.pid).with_ppid(row.ppid));
            }
        }
    }

    /// Run the codec over one drone's raw pidfile reads and store the results
    /// into the first-read or second-read view.
    pub fn ingest_pidfiles(
        &mut self,
        hostname: &str,
        raw_contents_by_path: &HashMap<PathBuf, String>,
        second_read: bool,
    ) {
        let target = if second_read {
            &mut self.pidfiles_second_read
        } else {
            &mut self.pidfiles
        };
        for (path, raw) in raw_contents_by_path {
            let contents = parse_pidfile_contents(hostname, raw);
            if contents.is_invalid() {
                tracing::warn!(pidfile = %path.display(), hostname, "Unparseable pidfile");
            }
            target.insert(PidfileId::new(path.clone()), contents);
        }
    }

    /// Idempotent; re-registration resets the age to 0.
    pub fn register_pidfile(&mut self, id: PidfileId, num_processes: usize) {
        match self.registrations.get_mut(&id) {
            Some(registration) => {
                registration.age_in_cycles = 0;
                registration.num_processes = num_processes;
            }
            None => {
                tracing::info!(pidfile = %id, num_processes, "Registered pidfile");
                self.registrations.insert(
                    id,
                    PidfileRegistration {
                        num_processes,
                        age_in_cycles: 0,
                        registered_at: Utc::now(),
                    },
                );
            }
        }
    }

    pub fn unregister_pidfile(&mut self, id: &PidfileId) {
        if self.registrations.remove(id).is_some() {
            tracing::debug!(pidfile = %id, "Unregistered pidfile");
        }
    }

    pub fn is_registered(&self, id: &PidfileId) -> bool {
        self.registrations.contains_key(id)
    }

    pub fn registration(&self, id: &PidfileId) -> Option<&PidfileRegistration> {
        self.registrations.get(id)
    }

    /// Paths of every watched pidfile, sent to drones with each refresh.
    pub fn registered_paths(&self) -> Vec<PathBuf> {
        self.registrations
            .keys()
            .map(|id| id.path().to_path_buf())
            .collect()
    }

    /// Age every registration by one cycle and drop the ones that reached the
    /// ceiling. A dropped registration is a leak: nobody queried or renewed
    /// it within `max_age` cycles. Returns the evicted ids.
    pub fn age_and_evict(&mut self, max_age: u32) -> Vec<PidfileId> {
        let mut evicted = Vec::new();
        self.registrations.retain(|id, registration| {
            registration.age_in_cycles += 1;
            if registration.age_in_cycles >= max_age {
                tracing::warn!(
                    pidfile = %id,
                    age_cycles = registration.age_in_cycles,
                    registered_at = %registration.registered_at,
                    "Evicting leaked pidfile"
                );
                evicted.push(id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }

    /// Stored contents for a watched pidfile, or the empty "not yet started"
    /// value. Any query is evidence of a live caller and resets the age.
    pub fn contents_for(&mut self, id: &PidfileId, use_second_read: bool) -> PidfileContents {
        if let Some(registration) = self.registrations.get_mut(id) {
            registration.age_in_cycles = 0;
        }
        let source = if use_second_read {
            &self.pidfiles_second_read
        } else {
            &self.pidfiles
        };
        source.get(id).cloned().unwrap_or_default()
    }

    /// A process is live if the latest snapshot saw it. Presence only in the
    /// all-processes index indicates a bookkeeping mismatch but still counts.
    pub fn is_process_live(&self, process: &Process) -> bool {
        if self.processes.contains(process) {
            return true;
        }
        if self
            .all_processes
            .contains(&(process.hostname.clone(), process.pid))
        {
            tracing::warn!(
                hostname = %process.hostname,
                pid = process.pid,
                "Process found but not an autoserv process"
            );
            return true;
        }
        false
    }

    /// Job-runner processes that have been reparented to init.
    pub fn orphaned_processes(&self) -> Vec<Process> {
        self.processes
            .iter()
            .filter(|p| p.is_orphaned())
            .cloned()
            .collect()
    }

    pub fn processes_for(&self, hostname: &str) -> Vec<Process> {
        self.processes
            .iter()
            .filter(|p| p.hostname == hostname)
            .cloned()
            .collect()
    }

    /// Process slots consumed on one drone: the sum of `num_processes` over
    /// registered pidfiles that are non-terminal and whose recorded process
    /// lives there.
    pub fn active_process_count(&self, hostname: &str) -> usize {
        self.registrations
            .iter()
            .filter_map(|(id, registration)| {
                let contents = self.pidfiles.get(id)?;
                let process = contents.process()?;
                if contents.exit_status().is_none() && process.hostname == hostname {
                    Some(registration.num_processes)
                } else {
                    None
                }
            })
            .sum()
    }

    /// Slots consumed across all drones by registrations that have not
    /// reported a terminal status, counting jobs that have not started
    /// writing yet.
    pub fn total_running_processes(&self) -> usize {
        self.registrations
            .iter()
            .filter(|(id, _)| {
                self.pidfiles
                    .get(id)
                    .map(|contents| contents.exit_status().is_none())
                    .unwrap_or(true)
            })
            .map(|(_, registration)| registration.num_processes)
            .sum()
    }

    pub fn registered_count(&self) -> usize {
        self.registrations.len()
    }
}

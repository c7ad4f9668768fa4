//! The dispatch facade and refresh coordinator.
//!
//! [`DroneManager`] is the public surface of the control plane: place a
//! command somewhere with capacity, stage files ahead of it, watch the
//! pidfile it leaves behind, and reconcile everything each refresh cycle.
//!
//! One instance is constructed at host startup and owned by the control
//! task. All mutable state (registry maps, capacity heap, per-drone call
//! queues) lives behind `&mut self`; concurrency exists only at the I/O
//! boundary, where refresh and flush fan one task per drone into a
//! [`JoinSet`] and join them all before state is touched again.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::capacity::{CapacityTracker, PlacementConstraints};
use crate::config::{DroneConfig, ManagerConfig};
use crate::drone::{Drone, DroneCall, DroneTransport, RefreshBundle};
use crate::error::{DroneManagerError, Result};
use crate::pidfile::{PidfileContents, PidfileId, Process};
use crate::registry::Registry;

/// Sentinel command token replaced with the absolute working directory at
/// dispatch, so callers can build command lines before placement is known.
pub const WORKING_DIRECTORY: &str = "$drone_working_directory";

/// Directory under the results root for files staged ahead of execution.
pub const TEMPORARY_DIRECTORY: &str = "drone_tmp";

/// One command dispatch. Paths are relative to the results root.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub command: Vec<String>,
    pub working_directory: PathBuf,
    pub pidfile_name: String,
    /// Process slots this job consumes for capacity accounting.
    pub num_processes: usize,
    pub log_file: Option<PathBuf>,
    /// Run on the drone already hosting this pidfile's process.
    pub paired_with_pidfile: Option<PidfileId>,
    pub username: Option<String>,
    pub drone_hostnames_allowed: Option<HashSet<String>>,
    pub require_ssp: bool,
}

impl ExecuteRequest {
    pub fn new(
        command: Vec<String>,
        working_directory: impl Into<PathBuf>,
        pidfile_name: impl Into<String>,
        num_processes: usize,
    ) -> Self {
        Self {
            command,
            working_directory: working_directory.into(),
            pidfile_name: pidfile_name.into(),
            num_processes,
            log_file: None,
            paired_with_pidfile: None,
            username: None,
            drone_hostnames_allowed: None,
            require_ssp: false,
        }
    }

    pub fn with_log_file(mut self, log_file: impl Into<PathBuf>) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    pub fn paired_with(mut self, pidfile_id: PidfileId) -> Self {
        self.paired_with_pidfile = Some(pidfile_id);
        self
    }

    pub fn as_user(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn restricted_to_hostnames<I, S>(mut self, hostnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.drone_hostnames_allowed = Some(hostnames.into_iter().map(Into::into).collect());
        self
    }

    pub fn requiring_ssp(mut self) -> Self {
        self.require_ssp = true;
        self
    }
}

/// Counted failure metrics. Faults recovered locally surface here instead of
/// as errors.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ManagerStats {
    pub refresh_failures: u64,
    pub flush_failures: u64,
    pub results_copy_failures: u64,
    pub pidfiles_evicted: u64,
}

/// Serializable per-drone summary for host status exports.
#[derive(Debug, Clone, Serialize)]
pub struct DroneStatus {
    pub hostname: String,
    pub enabled: bool,
    pub active_processes: usize,
    pub max_processes: usize,
    pub queued_calls: usize,
}

pub struct DroneManager {
    config: ManagerConfig,
    drones: BTreeMap<String, Drone>,
    registry: Registry,
    capacity: CapacityTracker,
    /// The results-repository host, modeled as a drone that is never
    /// scheduled on.
    results_repo: Drone,
    /// Files staged per working directory, flushed onto the chosen drone at
    /// dispatch.
    attached_files: HashMap<PathBuf, Vec<(PathBuf, String)>>,
    attach_counter: u64,
    in_flight_refresh: Option<JoinSet<(String, Result<RefreshBundle>)>>,
    stats: ManagerStats,
}

impl DroneManager {
    pub fn new(config: ManagerConfig, results_repo_transport: Arc<dyn DroneTransport>) -> Self {
        let results_repo = Drone::new(
            &DroneConfig::new(config.results_repo_hostname.clone(), 0).disabled(),
            results_repo_transport,
        );
        Self {
            config,
            drones: BTreeMap::new(),
            registry: Registry::new(),
            capacity: CapacityTracker::new(),
            results_repo,
            attached_files: HashMap::new(),
            attach_counter: 0,
            in_flight_refresh: None,
            stats: ManagerStats::default(),
        }
    }

    pub fn add_drone(&mut self, config: DroneConfig, transport: Arc<dyn DroneTransport>) {
        tracing::info!(hostname = %config.hostname, max_processes = config.max_processes, "Adding drone");
        let drone = Drone::new(&config, transport);
        self.drones.insert(config.hostname.clone(), drone);
        self.capacity.rebuild(self.drones.values());
    }

    /// Queue an initialize call on every drone and the results repository.
    pub fn initialize(&mut self) {
        let results_root = self.config.results_root.clone();
        for drone in self.drones.values_mut() {
            drone.queue_call(DroneCall::Initialize {
                results_root: results_root.clone(),
            });
        }
        self.results_repo.queue_call(DroneCall::Initialize { results_root });
    }

    /// Re-run drone initialization, e.g. after a results-tree relocation.
    pub fn reinitialize_drones(&mut self) {
        let results_root = self.config.results_root.clone();
        for drone in self.drones.values_mut() {
            drone.queue_call(DroneCall::Initialize {
                results_root: results_root.clone(),
            });
        }
    }

    /// Reapply per-drone scheduling configuration. Refresh-derived state is
    /// untouched; the heap is rebuilt to honor enablement changes.
    pub fn reapply_drone_config(&mut self, configs: &[DroneConfig]) {
        for config in configs {
            match self.drones.get_mut(&config.hostname) {
                Some(drone) => drone.apply_config(config),
                None => {
                    tracing::warn!(hostname = %config.hostname, "Config for unknown drone ignored")
                }
            }
        }
        self.capacity.rebuild(self.drones.values());
    }

    pub fn absolute_path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.results_root.join(path)
        }
    }

    fn temporary_path(&mut self, base_name: &str) -> PathBuf {
        let path = PathBuf::from(TEMPORARY_DIRECTORY)
            .join(format!("{}.{}", base_name, self.attach_counter));
        self.attach_counter += 1;
        path
    }

    // ------------------------------------------------------------------
    // Refresh cycle
    // ------------------------------------------------------------------

    /// Start a refresh cycle: age and evict registrations, then fan a
    /// refresh request out to every drone without blocking.
    ///
    /// A drone still holding queued calls from a previous cycle is a
    /// protocol violation: queuing a refresh on top of unflushed calls would
    /// corrupt ordering, so the whole refresh aborts before any request is
    /// sent.
    pub fn trigger_refresh(&mut self) -> Result<()> {
        for drone in self.drones.values() {
            if !drone.queued_calls().is_empty() {
                let calls = drone
                    .queued_calls()
                    .iter()
                    .map(|call| call.name())
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(DroneManagerError::StaleQueuedCalls {
                    hostname: drone.hostname().to_string(),
                    calls,
                });
            }
        }

        let evicted = self
            .registry
            .age_and_evict(self.config.max_pidfile_age_cycles);
        self.stats.pidfiles_evicted += evicted.len() as u64;
        self.registry.prune_unregistered();

        // Drones rejoin the heap as their refresh results are ingested; one
        // that fails stays out of placement for the cycle.
        self.capacity.clear();

        let pidfile_paths = self.registry.registered_paths();
        let mut join = JoinSet::new();
        for drone in self.drones.values() {
            let transport = drone.transport();
            let hostname = drone.hostname().to_string();
            let paths = pidfile_paths.clone();
            join.spawn(async move {
                let result = transport.refresh(paths).await;
                (hostname, result)
            });
        }
        self.in_flight_refresh = Some(join);
        Ok(())
    }

    /// Block until every drone's refresh completes, ingesting each result as
    /// it lands. A single drone's failure is counted and skipped; its prior
    /// snapshot stays in place and the cycle completes without it.
    pub async fn sync_refresh(&mut self) {
        let Some(mut join) = self.in_flight_refresh.take() else {
            return;
        };
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((hostname, Ok(bundle))) => self.ingest_bundle(&hostname, bundle),
                Ok((hostname, Err(error))) => {
                    tracing::warn!(%hostname, %error, "Drone refresh failed, keeping stale snapshot");
                    if let Some(drone) = self.drones.get_mut(&hostname) {
                        drone.last_refresh_ok = false;
                    }
                    self.stats.refresh_failures += 1;
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Refresh task aborted");
                    self.stats.refresh_failures += 1;
                }
            }
        }
    }

    /// One full refresh cycle: trigger, then sync.
    pub async fn refresh(&mut self) -> Result<()> {
        self.trigger_refresh()?;
        self.sync_refresh().await;
        Ok(())
    }

    fn ingest_bundle(&mut self, hostname: &str, bundle: RefreshBundle) {
        self.registry.clear_host(hostname);
        self.registry.ingest_process_table(hostname, &bundle.processes);
        self.registry
            .ingest_parse_process_table(hostname, &bundle.parse_processes);
        self.registry.ingest_pidfiles(hostname, &bundle.pidfiles, false);
        self.registry
            .ingest_pidfiles(hostname, &bundle.pidfiles_second_read, true);

        let active = self.registry.active_process_count(hostname);
        if let Some(drone) = self.drones.get_mut(hostname) {
            drone.active_processes = active;
            drone.last_refresh_ok = true;
            if drone.is_schedulable() {
                self.capacity.push_drone(drone);
            }
        }
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Place and queue a command, returning the pidfile handle to watch.
    ///
    /// Placement is pinned when the request pairs with an existing pidfile,
    /// otherwise the least-loaded usable drone takes it. Files staged for
    /// the working directory are written onto the chosen drone ahead of the
    /// execute call. The drone's slot count is bumped optimistically; the
    /// next refresh recomputes it from pidfile contents.
    pub fn execute_command(&mut self, request: ExecuteRequest) -> Result<PidfileId> {
        let abs_working_directory = self.absolute_path(&request.working_directory);
        let command: Vec<String> = request
            .command
            .iter()
            .map(|token| {
                if token == WORKING_DIRECTORY {
                    abs_working_directory.to_string_lossy().into_owned()
                } else {
                    token.clone()
                }
            })
            .collect();

        let hostname = match &request.paired_with_pidfile {
            Some(pidfile_id) => self.drone_for_pinned_execution(pidfile_id)?,
            None => {
                let constraints = PlacementConstraints {
                    user: request.username.as_deref(),
                    allowed_hostnames: request.drone_hostnames_allowed.as_ref(),
                    require_ssp: request.require_ssp,
                };
                self.capacity
                    .choose_drone(request.num_processes, &constraints, &self.drones)
                    .ok_or(DroneManagerError::NoDronesAvailable)?
            }
        };
        tracing::info!(
            %hostname,
            working_directory = %abs_working_directory.display(),
            pidfile_name = %request.pidfile_name,
            num_processes = request.num_processes,
            "Dispatching command"
        );

        let staged = self
            .attached_files
            .remove(&request.working_directory)
            .unwrap_or_default();
        let staged: Vec<(PathBuf, String)> = staged
            .into_iter()
            .map(|(path, contents)| (self.absolute_path(path), contents))
            .collect();
        let log_file = request.log_file.as_ref().map(|path| self.absolute_path(path));

        let drone = self
            .drones
            .get_mut(&hostname)
            .ok_or_else(|| DroneManagerError::UnknownDrone(hostname.clone()))?;
        for (path, contents) in staged {
            drone.queue_call(DroneCall::WriteFile { path, contents });
        }
        drone.queue_call(DroneCall::Execute {
            command,
            working_directory: abs_working_directory.clone(),
            pidfile_name: request.pidfile_name.clone(),
            log_file,
        });
        drone.active_processes += request.num_processes;
        self.capacity.rebuild(self.drones.values());

        let pidfile_id = PidfileId::new(abs_working_directory.join(&request.pidfile_name));
        self.registry
            .register_pidfile(pidfile_id.clone(), request.num_processes);
        Ok(pidfile_id)
    }

    /// The drone already hosting the process behind `pidfile_id`, for
    /// follow-up steps that must share a machine with their predecessor.
    pub fn drone_for_pinned_execution(&mut self, pidfile_id: &PidfileId) -> Result<String> {
        let contents = self.registry.contents_for(pidfile_id, false);
        let process = contents
            .process()
            .ok_or_else(|| DroneManagerError::PinnedProcessUnknown(pidfile_id.to_string()))?;
        if !self.drones.contains_key(&process.hostname) {
            return Err(DroneManagerError::UnknownDrone(process.hostname.clone()));
        }
        Ok(process.hostname.clone())
    }

    /// Stage a small file to be written on whichever drone later runs the
    /// job in `working_directory`. Returns the file's results-root-relative
    /// path for embedding into the command line.
    pub fn attach_file_to_execution(
        &mut self,
        working_directory: impl Into<PathBuf>,
        contents: impl Into<String>,
    ) -> PathBuf {
        let path = self.temporary_path("attach");
        self.attached_files
            .entry(working_directory.into())
            .or_default()
            .push((path.clone(), contents.into()));
        path
    }

    /// Write lines to a file on the drone hosting `paired_with_process`, or
    /// on the results repository when no process is given.
    pub fn write_lines_to_file(
        &mut self,
        path: impl AsRef<Path>,
        lines: &[String],
        paired_with_process: Option<&Process>,
    ) -> Result<()> {
        let path = self.absolute_path(path);
        let mut contents = lines.join("\n");
        contents.push('\n');
        let call = DroneCall::WriteFile { path, contents };
        match paired_with_process {
            Some(process) => self.owning_drone_mut(process)?.queue_call(call),
            None => self.results_repo.queue_call(call),
        }
        Ok(())
    }

    /// Queue a copy from the drone owning `process` to the results
    /// repository. Queued copies are retained for at most one
    /// execution-actions cycle: a failed flush drops them with a counted
    /// metric rather than retrying, so the scheduler never blocks on them.
    pub fn copy_to_results_repository(
        &mut self,
        process: &Process,
        source_path: impl AsRef<Path>,
        destination_path: Option<&Path>,
    ) -> Result<()> {
        let source = self.absolute_path(source_path.as_ref());
        let destination =
            self.absolute_path(destination_path.unwrap_or_else(|| source_path.as_ref()));
        let repo_hostname = self.results_repo.hostname().to_string();
        self.owning_drone_mut(process)?
            .queue_call(DroneCall::SendFileTo {
                hostname: repo_hostname,
                source,
                destination,
                can_fail: true,
            });
        Ok(())
    }

    /// Queue a same-host copy on the drone owning `process`.
    pub fn copy_results_on_drone(
        &mut self,
        process: &Process,
        source_path: impl AsRef<Path>,
        destination_path: impl AsRef<Path>,
    ) -> Result<()> {
        let source = self.absolute_path(source_path);
        let destination = self.absolute_path(destination_path);
        self.owning_drone_mut(process)?
            .queue_call(DroneCall::CopyFile {
                source,
                destination,
            });
        Ok(())
    }

    /// Queue a kill for a process previously observed on one of the drones.
    pub fn kill_process(&mut self, process: &Process) -> Result<()> {
        tracing::info!(hostname = %process.hostname, pid = process.pid, "Queueing kill");
        let pid = process.pid;
        self.owning_drone_mut(process)?
            .queue_call(DroneCall::KillProcess { pid });
        Ok(())
    }

    fn owning_drone_mut(&mut self, process: &Process) -> Result<&mut Drone> {
        self.drones
            .get_mut(&process.hostname)
            .ok_or_else(|| DroneManagerError::UnknownDrone(process.hostname.clone()))
    }

    /// Flush every drone's queued calls, one concurrent unit per drone, then
    /// the results repository's. Per-drone failures are counted and their
    /// calls dropped; a results-repository failure likewise clears its queue.
    /// Neither is ever fatal to the scheduler.
    pub async fn execute_actions(&mut self) {
        let mut join: JoinSet<(String, Result<()>)> = JoinSet::new();
        for drone in self.drones.values_mut() {
            let calls = drone.drain_calls();
            if calls.is_empty() {
                continue;
            }
            let transport = drone.transport();
            let hostname = drone.hostname().to_string();
            join.spawn(async move {
                let result = transport.execute_calls(calls).await;
                (hostname, result)
            });
        }
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {}
                Ok((hostname, Err(error))) => {
                    tracing::warn!(%hostname, %error, "Dropping queued calls after flush failure");
                    self.stats.flush_failures += 1;
                }
                Err(join_error) => {
                    tracing::error!(error = %join_error, "Flush task aborted");
                    self.stats.flush_failures += 1;
                }
            }
        }

        let calls = self.results_repo.drain_calls();
        if !calls.is_empty() {
            let num_calls = calls.len();
            let transport = self.results_repo.transport();
            if let Err(error) = transport.execute_calls(calls).await {
                tracing::warn!(
                    hostname = %self.results_repo.hostname(),
                    %error,
                    num_calls,
                    "Results repository flush failed, dropping queued calls"
                );
                self.stats.results_copy_failures += 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // Query surface
    // ------------------------------------------------------------------

    pub fn register_pidfile(&mut self, pidfile_id: PidfileId, num_processes: usize) {
        self.registry.register_pidfile(pidfile_id, num_processes);
    }

    pub fn unregister_pidfile(&mut self, pidfile_id: &PidfileId) {
        self.registry.unregister_pidfile(pidfile_id);
    }

    /// Contents of a watched pidfile as of the last sync. `use_second_read`
    /// selects the later of the cycle's two readings, for callers comparing
    /// the two to spot a job that finished mid-refresh.
    pub fn get_pidfile_contents(
        &mut self,
        pidfile_id: &PidfileId,
        use_second_read: bool,
    ) -> PidfileContents {
        self.registry.contents_for(pidfile_id, use_second_read)
    }

    pub fn is_process_running(&self, process: &Process) -> bool {
        self.registry.is_process_live(process)
    }

    pub fn get_orphaned_autoserv_processes(&self) -> Vec<Process> {
        self.registry.orphaned_processes()
    }

    pub fn total_running_processes(&self) -> usize {
        self.registry.total_running_processes()
    }

    /// Placement probe for batch sizing: the largest request a single usable
    /// drone could currently accept.
    pub fn max_runnable_processes(
        &self,
        user: Option<&str>,
        allowed_hostnames: Option<&HashSet<String>>,
    ) -> usize {
        let constraints = PlacementConstraints {
            user,
            allowed_hostnames,
            require_ssp: false,
        };
        self.capacity.max_runnable_processes(&constraints, &self.drones)
    }

    /// Placement probe without dispatching.
    pub fn choose_drone(
        &mut self,
        num_processes: usize,
        constraints: &PlacementConstraints<'_>,
    ) -> Option<String> {
        self.capacity
            .choose_drone(num_processes, constraints, &self.drones)
    }

    pub fn stats(&self) -> ManagerStats {
        self.stats
    }

    pub fn drone_statuses(&self) -> Vec<DroneStatus> {
        self.drones
            .values()
            .map(|drone| DroneStatus {
                hostname: drone.hostname().to_string(),
                enabled: drone.enabled,
                active_processes: drone.active_processes,
                max_processes: drone.max_processes,
                queued_calls: drone.queued_calls().len(),
            })
            .collect()
    }
}

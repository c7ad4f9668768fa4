use std::collections::HashSet;
use std::path::PathBuf;

/// How many refresh cycles a registered pidfile may go unqueried before it is
/// considered leaked and evicted.
pub const DEFAULT_MAX_PIDFILE_AGE_CYCLES: u32 = 2000;

/// Per-drone scheduling configuration.
///
/// Applied at startup and on configuration reload. Refresh-derived state
/// (active process counts) is never touched by a reload.
#[derive(Debug, Clone)]
pub struct DroneConfig {
    pub hostname: String,
    /// Process slots this drone may run concurrently.
    pub max_processes: usize,
    /// Disabled drones keep refreshing but are never chosen for placement.
    pub enabled: bool,
    /// Users allowed to place work on this drone. `None` means any user.
    pub allowed_users: Option<HashSet<String>>,
    /// Whether this drone can run jobs that require server-side packaging.
    pub supports_ssp: bool,
}

impl DroneConfig {
    pub fn new(hostname: impl Into<String>, max_processes: usize) -> Self {
        Self {
            hostname: hostname.into(),
            max_processes,
            enabled: true,
            allowed_users: None,
            supports_ssp: false,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_allowed_users<I, S>(mut self, users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_users = Some(users.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_ssp_support(mut self) -> Self {
        self.supports_ssp = true;
        self
    }
}

/// Configuration for the drone manager itself.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Root directory under which all working directories and pidfiles live.
    pub results_root: PathBuf,
    /// Hostname of the results repository machine.
    pub results_repo_hostname: String,
    /// Age ceiling for registered pidfiles, in refresh cycles.
    pub max_pidfile_age_cycles: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            results_root: PathBuf::from("/usr/local/autotest/results"),
            results_repo_hostname: "localhost".to_string(),
            max_pidfile_age_cycles: DEFAULT_MAX_PIDFILE_AGE_CYCLES,
        }
    }
}

impl ManagerConfig {
    pub fn new(results_root: impl Into<PathBuf>) -> Self {
        Self {
            results_root: results_root.into(),
            ..Default::default()
        }
    }

    pub fn with_results_repo(mut self, hostname: impl Into<String>) -> Self {
        self.results_repo_hostname = hostname.into();
        self
    }

    pub fn with_max_pidfile_age(mut self, cycles: u32) -> Self {
        self.max_pidfile_age_cycles = cycles;
        self
    }
}

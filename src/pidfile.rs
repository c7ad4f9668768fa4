//! Pidfile marker-file protocol.
//!
//! A running job reports progress by writing up to three newline-terminated
//! lines into a small marker file inside its working directory:
//!
//! 1. the OS process id of the job,
//! 2. the exit status, once the job has finished,
//! 3. the number of failed tests, written immediately after the exit status.
//!
//! The reader may observe the file between any two of those writes, so a
//! two-line file is a legitimate in-flight state and never treated as
//! corrupt.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Pidfile written by the main job process.
pub const AUTOSERV_PID_FILE: &str = ".autoserv_execute";
/// Pidfile written by the crash-info collection step.
pub const CRASHINFO_PID_FILE: &str = ".collect_crashinfo_execute";
/// Pidfile written by the results parser.
pub const PARSER_PID_FILE: &str = ".parser_execute";
/// Pidfile written by the results archiver.
pub const ARCHIVER_PID_FILE: &str = ".archiver_execute";

/// One observed OS process on a drone. Identity is (hostname, pid); the
/// parent pid is carried data and does not participate in equality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    pub hostname: String,
    pub pid: u32,
    pub ppid: Option<u32>,
}

impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.hostname == other.hostname && self.pid == other.pid
    }
}

impl Eq for Process {}

impl std::hash::Hash for Process {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hostname.hash(state);
        self.pid.hash(state);
    }
}

impl Process {
    pub fn new(hostname: impl Into<String>, pid: u32) -> Self {
        Self {
            hostname: hostname.into(),
            pid,
            ppid: None,
        }
    }

    pub fn with_ppid(mut self, ppid: u32) -> Self {
        self.ppid = Some(ppid);
        self
    }

    /// A process reparented to init has lost its original parent.
    pub fn is_orphaned(&self) -> bool {
        self.ppid == Some(1)
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hostname, self.pid)
    }
}

/// Handle a caller keeps to query a dispatched job's status later.
/// Equality and hashing are by pidfile path only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PidfileId {
    path: PathBuf,
}

impl PidfileId {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for PidfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Parsed view of one pidfile read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PidfileContents {
    /// Well-formed contents. All fields unset means the job has not started
    /// writing yet.
    Parsed {
        process: Option<Process>,
        exit_status: Option<i32>,
        num_tests_failed: Option<i32>,
    },
    /// Malformed contents. Carried as data so the scheduler can decide to
    /// treat it as a job failure.
    Invalid { error: String },
}

impl Default for PidfileContents {
    fn default() -> Self {
        Self::Parsed {
            process: None,
            exit_status: None,
            num_tests_failed: None,
        }
    }
}

impl PidfileContents {
    pub fn is_invalid(&self) -> bool {
        matches!(self, Self::Invalid { .. })
    }

    /// A job is running once its pid is recorded and until its exit status is.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            Self::Parsed {
                process: Some(_),
                exit_status: None,
                ..
            }
        )
    }

    pub fn process(&self) -> Option<&Process> {
        match self {
            Self::Parsed { process, .. } => process.as_ref(),
            Self::Invalid { .. } => None,
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self {
            Self::Parsed { exit_status, .. } => *exit_status,
            Self::Invalid { .. } => None,
        }
    }

    pub fn num_tests_failed(&self) -> Option<i32> {
        match self {
            Self::Parsed {
                num_tests_failed, ..
            } => *num_tests_failed,
            Self::Invalid { .. } => None,
        }
    }
}

/// Parse raw pidfile text into a [`PidfileContents`].
///
/// Pure function, invoked once per pidfile per refresh cycle per drone. The
/// hostname names the drone the contents were read from and becomes part of
/// the reported process identity.
pub fn parse_pidfile_contents(hostname: &str, raw: &str) -> PidfileContents {
    let lines: Vec<&str> = raw.lines().collect();

    if lines.is_empty() {
        // Job has not started writing yet.
        return PidfileContents::default();
    }

    if lines.len() > 3 {
        return invalid(lines.len(), raw);
    }

    let pid: u32 = match lines[0].trim().parse() {
        Ok(pid) => pid,
        Err(_) => return invalid(lines.len(), raw),
    };
    let process = Some(Process::new(hostname, pid));

    // One or two lines: the job is running. A two-line file is the tolerated
    // race between the exit-status write and the failure-count write and must
    // never surface a premature exit status.
    if lines.len() < 3 {
        return PidfileContents::Parsed {
            process,
            exit_status: None,
            num_tests_failed: None,
        };
    }

    let exit_status: i32 = match lines[1].trim().parse() {
        Ok(status) => status,
        Err(_) => return invalid(lines.len(), raw),
    };
    let num_tests_failed: i32 = match lines[2].trim().parse() {
        Ok(count) => count,
        Err(_) => return invalid(lines.len(), raw),
    };

    PidfileContents::Parsed {
        process,
        exit_status: Some(exit_status),
        num_tests_failed: Some(num_tests_failed),
    }
}

fn invalid(num_lines: usize, raw: &str) -> PidfileContents {
    PidfileContents::Invalid {
        error: format!("Corrupt pidfile ({} lines):\n{}", num_lines, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_contents_mean_not_started() {
        let contents = parse_pidfile_contents("drone1", "");
        assert_eq!(contents, PidfileContents::default());
        assert!(!contents.is_running());
        assert!(!contents.is_invalid());
    }

    #[test]
    fn single_line_is_running() {
        let contents = parse_pidfile_contents("drone1", "1234\n");
        assert!(contents.is_running());
        assert_eq!(contents.process(), Some(&Process::new("drone1", 1234)));
        assert_eq!(contents.exit_status(), None);
    }

    #[test]
    fn two_lines_still_running() {
        // Caught between the exit-status write and the failure-count write.
        let contents = parse_pidfile_contents("drone1", "1234\n0\n");
        assert!(contents.is_running());
        assert!(!contents.is_invalid());
        assert_eq!(contents.exit_status(), None);
    }

    #[test]
    fn three_lines_is_terminal() {
        let contents = parse_pidfile_contents("drone1", "1234\n3\n7\n");
        assert!(!contents.is_running());
        assert_eq!(contents.exit_status(), Some(3));
        assert_eq!(contents.num_tests_failed(), Some(7));
        assert_eq!(contents.process(), Some(&Process::new("drone1", 1234)));
    }

    #[test]
    fn non_numeric_pid_is_invalid() {
        let contents = parse_pidfile_contents("drone1", "not-a-pid\n");
        assert!(contents.is_invalid());
        assert!(!contents.is_running());
    }

    #[test]
    fn non_numeric_exit_status_is_invalid() {
        let contents = parse_pidfile_contents("drone1", "1234\nbad\n0\n");
        assert!(contents.is_invalid());
    }

    #[test]
    fn too_many_lines_is_invalid() {
        let contents = parse_pidfile_contents("drone1", "1\n2\n3\n4\n");
        match contents {
            PidfileContents::Invalid { error } => {
                assert!(error.contains("4 lines"));
                assert!(error.contains("4"));
            }
            other => panic!("expected invalid contents, got {:?}", other),
        }
    }

    #[test]
    fn invalid_exposes_no_process_or_status() {
        let contents = parse_pidfile_contents("drone1", "x\ny\nz\n");
        assert!(contents.is_invalid());
        assert!(contents.process().is_none());
        assert!(contents.exit_status().is_none());
        assert!(contents.num_tests_failed().is_none());
    }

    #[test]
    fn pidfile_id_equality_by_path() {
        let a = PidfileId::new("/results/1-job/.autoserv_execute");
        let b = PidfileId::new("/results/1-job/.autoserv_execute");
        let c = PidfileId::new("/results/2-job/.autoserv_execute");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn orphaned_process_detection() {
        let orphan = Process::new("drone1", 42).with_ppid(1);
        let child = Process::new("drone1", 43).with_ppid(42);
        assert!(orphan.is_orphaned());
        assert!(!child.is_orphaned());
        assert!(!Process::new("drone1", 44).is_orphaned());
    }
}

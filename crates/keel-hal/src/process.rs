//! Generic `ProcessControl` trait for spawning and supervising OS processes.
//!
//! Backends implement this trait; the rest of the supervisor only ever talks
//! to the trait, so the real OS can be swapped for a simulation without
//! touching the state machine.

use std::collections::BTreeMap;
use std::path::Path;

use keel_types::{KeelError, Pid, ResourceUsage};

/// Everything needed to launch one process.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    /// Service name, used for log file naming and error messages.
    pub service: &'a str,
    pub command: &'a str,
    pub args: &'a [String],
    /// Explicit environment pairs added on top of the parent environment.
    pub env: &'a BTreeMap<String, String>,
    /// Redirect stdout/stderr into `<log_dir>/<service>.log` when set.
    pub log_dir: Option<&'a Path>,
}

/// How to ask a process to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// `SIGTERM`: the process may clean up.
    Graceful,
    /// `SIGKILL`: immediate.
    Forced,
}

/// Result of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    /// The process is gone.  The code is `None` when it was killed by a
    /// signal or was not our child.
    Exited(Option<i32>),
}

impl ProcessStatus {
    pub fn is_running(self) -> bool {
        matches!(self, ProcessStatus::Running)
    }
}

/// One row of the process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: Pid,
    /// Image name as reported by the OS.
    pub name: String,
}

/// The OS-facing operations the supervisor relies on.
///
/// Probes and table scans are synchronous and bounded by OS latency.
pub trait ProcessControl: Send {
    /// Launch a process and return its PID.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Spawn`] if the executable cannot be found or
    /// launched.
    fn spawn(&mut self, request: &SpawnRequest<'_>) -> Result<Pid, KeelError>;

    /// Non-blocking liveness probe.  Never fails: an unknown PID is reported
    /// as exited.
    fn status(&mut self, pid: Pid) -> ProcessStatus;

    /// Deliver a termination request.  Terminating a process that is already
    /// gone succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::ProcessControl`] when the signal cannot be
    /// delivered (e.g. permission denied).
    fn terminate(&mut self, pid: Pid, mode: Termination) -> Result<(), KeelError>;

    /// Snapshot of the process table.
    fn processes(&mut self) -> Vec<ProcessEntry>;

    /// Image name of `pid`, or `None` if no such process exists.
    fn process_name(&mut self, pid: Pid) -> Option<String>;

    /// CPU time and memory of `pid`, or `None` if the read raced with exit.
    fn usage(&mut self, pid: Pid) -> Option<ResourceUsage>;
}

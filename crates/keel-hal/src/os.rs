//! [`OsProcessControl`] – the production process backend.
//!
//! Children are launched with [`std::process::Command`] and their [`Child`]
//! handles are kept so that exits are reaped and exit codes recorded.
//! Processes that are not our children (the companion app, stale instances)
//! are probed with `kill(pid, 0)` and inspected through `sysinfo`.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::process::{Child, Command, Stdio};

use keel_types::{KeelError, Pid, ResourceUsage};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid as NixPid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::process::{ProcessControl, ProcessEntry, ProcessStatus, SpawnRequest, Termination};

/// Process control backed by the host operating system.
pub struct OsProcessControl {
    children: HashMap<Pid, Child>,
    /// Exit codes of reaped children.  A reaped PID may be reused by an
    /// unrelated process, so it is never signalled again.
    reaped: HashMap<Pid, Option<i32>>,
    system: System,
}

impl Default for OsProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl OsProcessControl {
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
            reaped: HashMap::new(),
            system: System::new(),
        }
    }

    fn refresh_one(&mut self, pid: Pid, kind: ProcessRefreshKind) -> Option<&sysinfo::Process> {
        let spid = sysinfo::Pid::from_u32(pid);
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::Some(&[spid]), true, kind);
        self.system.process(spid)
    }

    /// Liveness of a process we did not spawn.
    fn probe_foreign(&mut self, pid: Pid) -> ProcessStatus {
        let Ok(raw) = i32::try_from(pid) else {
            return ProcessStatus::Exited(None);
        };
        match kill(NixPid::from_raw(raw), None) {
            // EPERM: the process exists but belongs to someone else.
            Ok(()) | Err(Errno::EPERM) => {}
            Err(_) => return ProcessStatus::Exited(None),
        }
        let zombie = self
            .refresh_one(pid, ProcessRefreshKind::nothing())
            .is_some_and(|p| p.status() == sysinfo::ProcessStatus::Zombie);
        if zombie {
            ProcessStatus::Exited(None)
        } else {
            ProcessStatus::Running
        }
    }
}

impl ProcessControl for OsProcessControl {
    fn spawn(&mut self, request: &SpawnRequest<'_>) -> Result<Pid, KeelError> {
        let spawn_error = |details: String| KeelError::Spawn {
            service: request.service.to_string(),
            details,
        };

        let mut cmd = Command::new(request.command);
        cmd.args(request.args)
            .envs(request.env)
            .stdin(Stdio::null());

        if let Some(dir) = request.log_dir {
            fs::create_dir_all(dir)
                .map_err(|e| spawn_error(format!("cannot create {}: {e}", dir.display())))?;
            let path = dir.join(format!("{}.log", request.service));
            let stdout = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| spawn_error(format!("cannot open {}: {e}", path.display())))?;
            let stderr = stdout
                .try_clone()
                .map_err(|e| spawn_error(format!("cannot clone log handle: {e}")))?;
            cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
        }

        let child = cmd
            .spawn()
            .map_err(|e| spawn_error(format!("{}: {e}", request.command)))?;
        let pid = child.id();
        debug!(service = request.service, pid, "spawned");
        self.reaped.remove(&pid);
        self.children.insert(pid, child);
        Ok(pid)
    }

    fn status(&mut self, pid: Pid) -> ProcessStatus {
        if let Some(child) = self.children.get_mut(&pid) {
            match child.try_wait() {
                Ok(None) => return ProcessStatus::Running,
                Ok(Some(exit)) => {
                    let code = exit.code();
                    self.children.remove(&pid);
                    self.reaped.insert(pid, code);
                    return ProcessStatus::Exited(code);
                }
                Err(e) => {
                    warn!(pid, error = %e, "try_wait failed; falling back to signal probe");
                }
            }
        } else if let Some(code) = self.reaped.get(&pid) {
            return ProcessStatus::Exited(*code);
        }
        self.probe_foreign(pid)
    }

    fn terminate(&mut self, pid: Pid, mode: Termination) -> Result<(), KeelError> {
        if !self.children.contains_key(&pid) && self.reaped.contains_key(&pid) {
            return Ok(());
        }
        let raw = i32::try_from(pid).map_err(|_| KeelError::ProcessControl {
            pid,
            details: "pid out of range".to_string(),
        })?;
        let signal = match mode {
            Termination::Graceful => Signal::SIGTERM,
            Termination::Forced => Signal::SIGKILL,
        };
        match kill(NixPid::from_raw(raw), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(KeelError::ProcessControl {
                pid,
                details: format!("{signal}: {e}"),
            }),
        }
    }

    fn processes(&mut self) -> Vec<ProcessEntry> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        self.system
            .processes()
            .iter()
            .filter(|(_, p)| p.thread_kind().is_none())
            .map(|(pid, p)| ProcessEntry {
                pid: pid.as_u32(),
                name: p.name().to_string_lossy().into_owned(),
            })
            .collect()
    }

    fn process_name(&mut self, pid: Pid) -> Option<String> {
        self.refresh_one(pid, ProcessRefreshKind::nothing())
            .map(|p| p.name().to_string_lossy().into_owned())
    }

    fn usage(&mut self, pid: Pid) -> Option<ResourceUsage> {
        let kind = ProcessRefreshKind::nothing().with_cpu().with_memory();
        self.refresh_one(pid, kind).map(|p| ResourceUsage {
            cpu_time_ms: p.accumulated_cpu_time(),
            cpu_percent: p.cpu_usage(),
            memory_bytes: p.memory(),
        })
    }
}

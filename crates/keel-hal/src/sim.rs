//! Simulated backends for tests and dry runs.
//!
//! [`SimProcessControl`] keeps a fake process table in memory.  It is `Clone`
//! and every clone shares the same table, so a test can hand one clone to the
//! supervisor and keep another to inject crashes and inspect what happened.
//!
//! | Hook | Effect |
//! |---|---|
//! | [`SimProcessControl::exit_with`] | the process exits with a code |
//! | [`SimProcessControl::kill_external`] | the process dies from a signal |
//! | [`SimProcessControl::add_foreign`] | a process appears that was not spawned by us |
//! | [`SimProcessControl::with_missing_executable`] | spawning that command fails |
//! | [`SimProcessControl::ignore_sigterm`] | graceful termination is ignored |

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keel_types::{DeviceState, HostUsage, KeelError, Pid, ResourceUsage};
use serde_json::json;

use crate::metrics::{DeviceStateSource, SystemMetrics};
use crate::process::{ProcessControl, ProcessEntry, ProcessStatus, SpawnRequest, Termination};

const FIRST_PID: Pid = 1000;

/// Usage reported for every live simulated process unless overridden.
pub const SIM_USAGE: ResourceUsage = ResourceUsage {
    cpu_time_ms: 120,
    cpu_percent: 2.5,
    memory_bytes: 8 * 1024 * 1024,
};

/// One successful spawn, as recorded by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRecord {
    pub pid: Pid,
    pub service: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug)]
struct SimProcess {
    name: String,
    status: ProcessStatus,
    usage: ResourceUsage,
}

#[derive(Debug, Default)]
struct SimTable {
    next_pid: Pid,
    procs: BTreeMap<Pid, SimProcess>,
    missing: HashSet<String>,
    stubborn: HashSet<Pid>,
    spawned: Vec<SpawnRecord>,
    status_calls: HashMap<Pid, usize>,
    terminations: Vec<(Pid, Termination)>,
}

impl SimTable {
    fn allocate(&mut self, name: String) -> Pid {
        if self.next_pid < FIRST_PID {
            self.next_pid = FIRST_PID;
        }
        let pid = self.next_pid;
        self.next_pid += 1;
        self.procs.insert(
            pid,
            SimProcess {
                name,
                status: ProcessStatus::Running,
                usage: SIM_USAGE,
            },
        );
        pid
    }

    fn live(&self, pid: Pid) -> Option<&SimProcess> {
        self.procs.get(&pid).filter(|p| p.status.is_running())
    }
}

/// In-memory process table.
#[derive(Debug, Clone, Default)]
pub struct SimProcessControl {
    table: Arc<Mutex<SimTable>>,
}

impl SimProcessControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, SimTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every spawn of `command` fail as if the executable were absent.
    pub fn with_missing_executable(self, command: impl Into<String>) -> Self {
        self.table().missing.insert(command.into());
        self
    }

    /// Let `pid` survive `SIGTERM`; only a forced kill ends it.
    pub fn ignore_sigterm(&self, pid: Pid) {
        self.table().stubborn.insert(pid);
    }

    /// Register a running process that was not spawned through this backend.
    pub fn add_foreign(&self, name: impl Into<String>) -> Pid {
        self.table().allocate(name.into())
    }

    /// The process exits on its own with `code`.
    pub fn exit_with(&self, pid: Pid, code: i32) {
        if let Some(p) = self.table().procs.get_mut(&pid) {
            p.status = ProcessStatus::Exited(Some(code));
        }
    }

    /// The process is killed by something outside the supervisor.
    pub fn kill_external(&self, pid: Pid) {
        if let Some(p) = self.table().procs.get_mut(&pid) {
            p.status = ProcessStatus::Exited(None);
        }
    }

    pub fn set_usage(&self, pid: Pid, usage: ResourceUsage) {
        if let Some(p) = self.table().procs.get_mut(&pid) {
            p.usage = usage;
        }
    }

    /// Every successful spawn, oldest first.
    pub fn spawned(&self) -> Vec<SpawnRecord> {
        self.table().spawned.clone()
    }

    /// Spawns recorded for `service`.
    pub fn spawns_of(&self, service: &str) -> Vec<SpawnRecord> {
        self.table()
            .spawned
            .iter()
            .filter(|r| r.service == service)
            .cloned()
            .collect()
    }

    /// Number of liveness probes issued for `pid`.
    pub fn status_calls(&self, pid: Pid) -> usize {
        self.table().status_calls.get(&pid).copied().unwrap_or(0)
    }

    /// Termination requests delivered to `pid`, in order.
    pub fn terminations(&self, pid: Pid) -> Vec<Termination> {
        self.table()
            .terminations
            .iter()
            .filter(|(p, _)| *p == pid)
            .map(|(_, mode)| *mode)
            .collect()
    }

    /// `true` if `pid` is in the table and has not exited.
    pub fn is_running(&self, pid: Pid) -> bool {
        self.table().live(pid).is_some()
    }

    /// PIDs of every live process.
    pub fn running(&self) -> Vec<Pid> {
        self.table()
            .procs
            .iter()
            .filter(|(_, p)| p.status.is_running())
            .map(|(pid, _)| *pid)
            .collect()
    }
}

impl ProcessControl for SimProcessControl {
    fn spawn(&mut self, request: &SpawnRequest<'_>) -> Result<Pid, KeelError> {
        let mut table = self.table();
        if table.missing.contains(request.command) {
            return Err(KeelError::Spawn {
                service: request.service.to_string(),
                details: format!("{}: No such file or directory", request.command),
            });
        }
        let name = Path::new(request.command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| request.command.to_string());
        let pid = table.allocate(name);
        table.spawned.push(SpawnRecord {
            pid,
            service: request.service.to_string(),
            command: request.command.to_string(),
            args: request.args.to_vec(),
            env: request.env.clone(),
        });
        Ok(pid)
    }

    fn status(&mut self, pid: Pid) -> ProcessStatus {
        let mut table = self.table();
        *table.status_calls.entry(pid).or_default() += 1;
        table
            .procs
            .get(&pid)
            .map(|p| p.status)
            .unwrap_or(ProcessStatus::Exited(None))
    }

    fn terminate(&mut self, pid: Pid, mode: Termination) -> Result<(), KeelError> {
        let mut table = self.table();
        table.terminations.push((pid, mode));
        let stubborn = table.stubborn.contains(&pid);
        if let Some(p) = table.procs.get_mut(&pid)
            && p.status.is_running()
            && (mode == Termination::Forced || !stubborn)
        {
            p.status = ProcessStatus::Exited(None);
        }
        Ok(())
    }

    fn processes(&mut self) -> Vec<ProcessEntry> {
        self.table()
            .procs
            .iter()
            .filter(|(_, p)| p.status.is_running())
            .map(|(pid, p)| ProcessEntry {
                pid: *pid,
                name: p.name.clone(),
            })
            .collect()
    }

    fn process_name(&mut self, pid: Pid) -> Option<String> {
        self.table().live(pid).map(|p| p.name.clone())
    }

    fn usage(&mut self, pid: Pid) -> Option<ResourceUsage> {
        self.table().live(pid).map(|p| p.usage)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Metrics
// ─────────────────────────────────────────────────────────────────────────────

/// Fixed host figures and device state.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Number of `host_usage` calls served.
    pub reads: usize,
}

impl SystemMetrics for SimMetrics {
    fn host_usage(&mut self) -> HostUsage {
        self.reads += 1;
        HostUsage {
            cpu_percent: vec![10.0, 20.0],
            total_memory_bytes: 4 * 1024 * 1024 * 1024,
            used_memory_bytes: 1024 * 1024 * 1024,
            available_memory_bytes: 3 * 1024 * 1024 * 1024,
        }
    }
}

impl DeviceStateSource for SimMetrics {
    fn device_state(&mut self) -> DeviceState {
        DeviceState(json!({
            "uptime_secs": 60,
            "load_average": [0.5, 0.4, 0.3],
            "memory_percent": 25.0,
            "simulated": true,
        }))
    }
}

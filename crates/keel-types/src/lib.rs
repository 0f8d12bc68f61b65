use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// OS process identifier as reported by the process table.
pub type Pid = u32;

/// Target platform a service may be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Desktop,
}

impl Platform {
    /// The platform this binary was compiled for.
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else {
            Platform::Desktop
        }
    }
}

fn default_monitored() -> bool {
    true
}

/// Static definition of one managed service.
///
/// Immutable once loaded; the supervisor shares it between successive
/// process handles of the same service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique service name (e.g. `"controlsd"`).
    pub name: String,
    /// Executable to launch.
    pub command: String,
    /// Ordered argument list.
    #[serde(default)]
    pub args: Vec<String>,
    /// Respawn the service when a monitored instance dies.
    #[serde(default)]
    pub restart_on_crash: bool,
    /// When `false` the service is started once and never probed again.
    #[serde(default = "default_monitored")]
    pub monitored: bool,
    /// Start before the readiness gate opens.
    #[serde(default)]
    pub start_immediately: bool,
    /// Platforms the service runs on. `None` means every platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<BTreeSet<Platform>>,
    /// Explicit environment pairs passed to the spawned process.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Expected OS image name; defaults to [`ServiceDescriptor::name`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl ServiceDescriptor {
    /// A monitored, non-restarting, gated service with no arguments.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            restart_on_crash: false,
            monitored: true,
            start_immediately: false,
            platforms: None,
            env: BTreeMap::new(),
            image: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn restart_on_crash(mut self, restart: bool) -> Self {
        self.restart_on_crash = restart;
        self
    }

    pub fn monitored(mut self, monitored: bool) -> Self {
        self.monitored = monitored;
        self
    }

    pub fn start_immediately(mut self, immediate: bool) -> Self {
        self.start_immediately = immediate;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// The OS image name a running instance of this service is expected to
    /// carry in the process table.
    pub fn image_name(&self) -> &str {
        self.image.as_deref().unwrap_or(&self.name)
    }

    /// `true` if the service should run on `platform`.
    pub fn runs_on(&self, platform: Platform) -> bool {
        self.platforms
            .as_ref()
            .is_none_or(|set| set.contains(&platform))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Telemetry payloads
// ────────────────────────────────────────────────────────────────────────────

/// One row of the manager-state message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessState {
    pub name: String,
    pub pid: Option<Pid>,
    pub monitored: bool,
    pub should_be_running: bool,
    pub running: bool,
    pub restart_count: u32,
    pub exit_code: Option<i32>,
}

/// Health of every managed service, in descriptor order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerState {
    /// `false` only on the final message published while shutting down.
    pub ready: bool,
    pub processes: Vec<ProcessState>,
}

/// Point-in-time resource figures for one process.
///
/// The all-zero [`Default`] value is the "unknown" sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Accumulated CPU time (user + system) in milliseconds.
    pub cpu_time_ms: u64,
    /// CPU usage since the previous reading, in percent of one core.
    pub cpu_percent: f32,
    /// Resident set size in bytes.
    pub memory_bytes: u64,
}

/// Per-service entry of the process log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub name: String,
    pub pid: Pid,
    #[serde(flatten)]
    pub usage: ResourceUsage,
}

/// Host-wide CPU and memory figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostUsage {
    /// Usage of every logical core, in percent.
    pub cpu_percent: Vec<f32>,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
    pub available_memory_bytes: u64,
}

/// Resource usage of the managed processes plus host totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcLog {
    pub procs: Vec<ProcessUsage>,
    pub host: HostUsage,
}

/// Opaque device-state document forwarded unmodified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceState(pub serde_json::Value);

// ────────────────────────────────────────────────────────────────────────────
// Bus events
// ────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the supervisor bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g., "keel-runtime::publisher"
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    /// Wrap `payload` with a fresh id and the current time.
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    ManagerState(ManagerState),
    ProcLog(ProcLog),
    DeviceState(DeviceState),
    /// The discrete "go" token accepted by the readiness gate.
    StartSignal,
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Global error type spanning boot, process control and transport failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KeelError {
    #[error("Duplicate service name: {0}")]
    DuplicateService(String),

    #[error("Service list error: {0}")]
    ServiceList(String),

    #[error("Spawn failed for {service}: {details}")]
    Spawn { service: String, details: String },

    #[error("Another supervisor holds the lock at {0}")]
    LockContention(String),

    #[error("Parameter store error: {0}")]
    Params(String),

    #[error("Process control error on pid {pid}: {details}")]
    ProcessControl { pid: Pid, details: String },

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Supervisor fault: {0}")]
    Fault(String),
}

/// How a supervisor run ended, mapped to a process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitKind {
    /// Voluntary, fully drained shutdown.
    Clean,
    /// Another supervisor holds the singleton lock.
    LockContention,
    /// Load or spawn failure during `INIT` / `WAIT_FOR_START`.
    BootFailure,
    /// Unrecoverable fault while `RUNNING`.
    RuntimeFault,
}

impl ExitKind {
    pub fn exit_code(self) -> i32 {
        match self {
            ExitKind::Clean => 0,
            ExitKind::LockContention => 2,
            ExitKind::BootFailure => 3,
            ExitKind::RuntimeFault => 4,
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitKind::Clean => write!(f, "clean shutdown"),
            ExitKind::LockContention => write!(f, "lock contention"),
            ExitKind::BootFailure => write!(f, "boot failure"),
            ExitKind::RuntimeFault => write!(f, "runtime fault"),
        }
    }
}

//! [`Supervisor`] – the lifecycle state machine.
//!
//! ```text
//!  INIT ──► WAIT_FOR_START ──► RUNNING ──► SHUTTING_DOWN ──► TERMINATED
//!   │              │               │              ▲
//!   └── fatal ─────┴─── fatal ─────┴── signal ────┘
//! ```
//!
//! | Phase | Work |
//! |---|---|
//! | `INIT` | take the singleton lock, reset ephemeral params, seed defaults, validate the service list, kill stale instances |
//! | `WAIT_FOR_START` | start `start_immediately` services once, then poll the readiness gate every tick |
//! | `RUNNING` | set the ready flag, start the gated services once, then every tick: probe, restart or fail, snapshot, publish |
//! | `SHUTTING_DOWN` | clear the ready flag, publish a final `ready = false` state, stop every handle |
//!
//! Every exit from `WAIT_FOR_START` or `RUNNING`, clean or not, goes through
//! `SHUTTING_DOWN`.  A panic inside a tick is caught and reported as a
//! runtime fault after the shutdown sequence has run.  If the [`Supervisor::run`] future is dropped before
//! reaching `TERMINATED`, [`Drop`] force-kills whatever is still running.
//!
//! The loop is single-threaded: one tick at a time, and the interval wait is
//! the only suspension point besides bounded stop/restart waits.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use keel_hal::{ProcessControl, Termination};
use keel_kernel::{
    LaunchExtras, ProcessHandle, ReadinessGate, RestartError, ServiceSet, SingletonGuard,
};
use keel_middleware::ParamStore;
use keel_middleware::params::{KEEL_VERSION, PASSIVE, SUPERVISOR_READY};
use keel_types::{
    ExitKind, KeelError, ManagerState, ProcessState, ProcessUsage, ServiceDescriptor,
};
use thiserror::Error;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};

use crate::publisher::TelemetryPublisher;

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    WaitForStart,
    Running,
    ShuttingDown,
    Terminated,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::WaitForStart => "WAIT_FOR_START",
            Phase::Running => "RUNNING",
            Phase::ShuttingDown => "SHUTTING_DOWN",
            Phase::Terminated => "TERMINATED",
        }
    }
}

/// Why a run ended abnormally.
#[derive(Debug, Error)]
#[error("{kind}: {source}")]
pub struct RunError {
    pub kind: ExitKind,
    #[source]
    pub source: KeelError,
}

impl RunError {
    pub fn new(kind: ExitKind, source: KeelError) -> Self {
        Self { kind, source }
    }

    /// Classify a [`SingletonGuard::acquire`] failure.
    pub fn lock(source: KeelError) -> Self {
        let kind = match source {
            KeelError::LockContention(_) => ExitKind::LockContention,
            _ => ExitKind::BootFailure,
        };
        Self::new(kind, source)
    }

    fn boot(source: KeelError) -> Self {
        Self::new(ExitKind::BootFailure, source)
    }

    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tunables for one supervisor run.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Period `F` of the loop.
    pub tick_period: Duration,
    /// Grace period for each service at shutdown.
    pub stop_timeout: Duration,
    /// Grace period when stopping a crashed service before respawning it.
    pub restart_stop_timeout: Duration,
    /// Directory holding the singleton lock file.
    pub lock_dir: PathBuf,
    /// Lock file stem (`<lock_dir>/<lock_name>.lock`).
    pub lock_name: String,
    /// Per-service stdout/stderr files go here when set.
    pub log_dir: Option<PathBuf>,
    pub extras: LaunchExtras,
    /// Parameter values written at boot unless already present.
    pub default_params: BTreeMap<String, String>,
    /// Value for the `Passive` parameter, when known.
    pub passive: Option<bool>,
    /// Fail `INIT` when `Passive` is still unset after seeding.
    pub require_passive: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_period: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
            restart_stop_timeout: Duration::from_secs(1),
            lock_dir: std::env::temp_dir(),
            lock_name: "keel".to_string(),
            log_dir: None,
            extras: LaunchExtras::none(),
            default_params: BTreeMap::new(),
            passive: None,
            require_passive: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service bookkeeping
// ─────────────────────────────────────────────────────────────────────────────

struct ServiceSlot {
    descriptor: Arc<ServiceDescriptor>,
    handle: Option<ProcessHandle>,
    /// Monitored, non-restartable and dead: reported, never touched again.
    failed: bool,
}

impl ServiceSlot {
    fn new(descriptor: Arc<ServiceDescriptor>) -> Self {
        Self {
            descriptor,
            handle: None,
            failed: false,
        }
    }

    fn state(&self) -> ProcessState {
        let handle = self.handle.as_ref();
        ProcessState {
            name: self.descriptor.name.clone(),
            pid: handle.map(ProcessHandle::pid),
            monitored: self.descriptor.monitored,
            should_be_running: !self.failed,
            running: handle.is_some_and(ProcessHandle::last_known_alive),
            restart_count: handle.map_or(0, ProcessHandle::restart_count),
            exit_code: handle.and_then(ProcessHandle::exit_code),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Owns every process handle of a run and drives them through the phases.
pub struct Supervisor {
    config: SupervisorConfig,
    ctl: Box<dyn ProcessControl>,
    params: Arc<dyn ParamStore>,
    gate: ReadinessGate,
    publisher: TelemetryPublisher,
    shutdown: Arc<AtomicBool>,
    phase: Phase,
    slots: Vec<ServiceSlot>,
    last_tick: Option<DateTime<Utc>>,
    guard: Option<SingletonGuard>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        ctl: Box<dyn ProcessControl>,
        params: Arc<dyn ParamStore>,
        gate: ReadinessGate,
        publisher: TelemetryPublisher,
    ) -> Self {
        Self {
            config,
            ctl,
            params,
            gate,
            publisher,
            shutdown: Arc::new(AtomicBool::new(false)),
            phase: Phase::Init,
            slots: Vec::new(),
            last_tick: None,
            guard: None,
        }
    }

    /// Use `flag` as the termination request.  Setting it to `true` makes
    /// the loop leave at the next tick boundary.
    pub fn with_shutdown(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = flag;
        self
    }

    /// Run under a lock the caller already holds instead of taking one in
    /// `INIT`.
    pub fn with_guard(mut self, guard: SingletonGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Time of the last completed `RUNNING` tick.
    pub fn last_tick(&self) -> Option<DateTime<Utc>> {
        self.last_tick
    }

    /// Run to completion.
    ///
    /// # Errors
    ///
    /// The [`RunError::kind`] says which exit status the process should use.
    /// Lock contention returns before any process or parameter is touched.
    pub async fn run(mut self, descriptors: Vec<ServiceDescriptor>) -> Result<(), RunError> {
        if let Err(e) = self.init(descriptors) {
            error!(error = %e, "supervisor failed to initialise");
            self.phase = Phase::Terminated;
            return Err(e);
        }
        let outcome = match AssertUnwindSafe(self.drive()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(RunError::new(
                ExitKind::RuntimeFault,
                KeelError::Fault(format!("panic: {}", panic_message(&*payload))),
            )),
        };
        if let Err(e) = &outcome {
            error!(error = %e, phase = self.phase.name(), "supervisor aborting");
        }
        self.shutdown().await;
        outcome
    }

    fn enter(&mut self, phase: Phase) {
        info!(from = self.phase.name(), to = phase.name(), "phase transition");
        self.phase = phase;
    }

    fn stop_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn ticker(&self) -> Interval {
        let mut ticker = interval(self.config.tick_period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    // ── INIT ────────────────────────────────────────────────────────────────

    fn init(&mut self, descriptors: Vec<ServiceDescriptor>) -> Result<(), RunError> {
        if self.guard.is_none() {
            let guard = SingletonGuard::acquire(&self.config.lock_dir, &self.config.lock_name)
                .map_err(RunError::lock)?;
            self.guard = Some(guard);
        }

        self.params.clear_all_ephemeral().map_err(RunError::boot)?;
        self.seed_params().map_err(RunError::boot)?;

        let services = ServiceSet::new(descriptors).map_err(RunError::boot)?;
        if services.is_empty() {
            warn!("service list is empty");
        }
        info!(services = services.len(), "service list loaded");
        self.kill_stale(&services);
        self.slots = services.into_iter().map(ServiceSlot::new).collect();
        Ok(())
    }

    fn seed_params(&self) -> Result<(), KeelError> {
        for (key, value) in &self.config.default_params {
            if self.params.get(key)?.is_none() {
                self.params.put(key, value.as_bytes())?;
            }
        }
        self.params
            .put(KEEL_VERSION, env!("CARGO_PKG_VERSION").as_bytes())?;
        if let Some(passive) = self.config.passive {
            self.params.put_bool(PASSIVE, passive)?;
        }
        if self.config.require_passive && self.params.get(PASSIVE)?.is_none() {
            return Err(KeelError::Params(format!("{PASSIVE} must be set")));
        }
        Ok(())
    }

    /// Kill leftovers of a previous run: any process whose image name is the
    /// expected image of one of our services.  Never ourselves.
    fn kill_stale(&mut self, services: &ServiceSet) {
        let me = std::process::id();
        for entry in self.ctl.processes() {
            if entry.pid == me || services.by_image(&entry.name).is_none() {
                continue;
            }
            warn!(pid = entry.pid, image = %entry.name, "killing stale instance");
            if let Err(e) = self.ctl.terminate(entry.pid, Termination::Forced) {
                warn!(pid = entry.pid, error = %e, "cannot kill stale instance");
            }
        }
    }

    // ── WAIT_FOR_START / RUNNING ────────────────────────────────────────────

    async fn drive(&mut self) -> Result<(), RunError> {
        self.enter(Phase::WaitForStart);
        self.start_immediate()?;

        let mut ticker = self.ticker();
        loop {
            ticker.tick().await;
            if self.stop_requested() {
                return Ok(());
            }
            if self.gate.poll(self.ctl.as_mut()) {
                break;
            }
            debug!("waiting for start signal");
        }

        self.enter(Phase::Running);
        self.params
            .put_bool(SUPERVISOR_READY, true)
            .map_err(|e| RunError::new(ExitKind::RuntimeFault, e))?;
        self.start_gated();

        let mut ticker = self.ticker();
        loop {
            ticker.tick().await;
            if self.stop_requested() {
                return Ok(());
            }
            self.tick().await;
        }
    }

    fn start_immediate(&mut self) -> Result<(), RunError> {
        let log_dir = self.config.log_dir.as_deref();
        for slot in self.slots.iter_mut().filter(|s| s.descriptor.start_immediately) {
            let handle = ProcessHandle::start(
                Arc::clone(&slot.descriptor),
                &self.config.extras,
                self.ctl.as_mut(),
                log_dir,
            )
            .map_err(RunError::boot)?;
            slot.handle = Some(handle);
        }
        Ok(())
    }

    fn start_gated(&mut self) {
        let log_dir = self.config.log_dir.as_deref();
        for slot in self.slots.iter_mut().filter(|s| !s.descriptor.start_immediately) {
            let desc = &slot.descriptor;
            match ProcessHandle::start(Arc::clone(desc), &self.config.extras, self.ctl.as_mut(), log_dir) {
                Ok(handle) => slot.handle = Some(handle),
                Err(e) if desc.monitored && !desc.restart_on_crash => {
                    warn!(service = %desc.name, error = %e, "start failed; marking failed");
                    slot.failed = true;
                }
                Err(e) => {
                    warn!(service = %desc.name, error = %e, "start failed");
                }
            }
        }
    }

    /// One `RUNNING` tick: resolve crashes, then snapshot and publish.
    async fn tick(&mut self) {
        self.check_services().await;

        let state = self.manager_state(true);
        let running = state.processes.iter().filter(|p| p.running).count();
        let procs = self.usage_snapshot();
        let delivered = self.publisher.publish_tick(state, procs);
        self.last_tick = Some(Utc::now());
        debug!(running, services = self.slots.len(), delivered, "tick");
    }

    async fn check_services(&mut self) {
        let extras = &self.config.extras;
        let log_dir = self.config.log_dir.as_deref();
        let timeout = self.config.restart_stop_timeout;

        for slot in &mut self.slots {
            if slot.failed || !slot.descriptor.monitored {
                continue;
            }
            let Some(mut handle) = slot.handle.take() else {
                // Never came up; only restartable services are retried.
                if slot.descriptor.restart_on_crash {
                    match ProcessHandle::start(Arc::clone(&slot.descriptor), extras, self.ctl.as_mut(), log_dir) {
                        Ok(handle) => slot.handle = Some(handle),
                        Err(e) => warn!(service = %slot.descriptor.name, error = %e, "start retry failed"),
                    }
                }
                continue;
            };

            if handle.is_alive(self.ctl.as_mut()) {
                slot.handle = Some(handle);
                continue;
            }

            if !slot.descriptor.restart_on_crash {
                warn!(
                    service = %slot.descriptor.name,
                    pid = handle.pid(),
                    exit_code = ?handle.exit_code(),
                    "service died; marking failed"
                );
                slot.failed = true;
                slot.handle = Some(handle);
                continue;
            }

            warn!(
                service = %slot.descriptor.name,
                pid = handle.pid(),
                exit_code = ?handle.exit_code(),
                restarts = handle.restart_count(),
                "service died; restarting"
            );
            let next = match handle.restart(extras, self.ctl.as_mut(), log_dir, timeout).await {
                Ok(next) => {
                    info!(service = %slot.descriptor.name, pid = next.pid(), restarts = next.restart_count(), "restarted");
                    next
                }
                Err(RestartError { previous, error }) => {
                    warn!(service = %slot.descriptor.name, error = %error, "respawn failed; retrying next tick");
                    previous
                }
            };
            slot.handle = Some(next);
        }
    }

    fn manager_state(&self, ready: bool) -> ManagerState {
        ManagerState {
            ready,
            processes: self.slots.iter().map(ServiceSlot::state).collect(),
        }
    }

    fn usage_snapshot(&mut self) -> Vec<ProcessUsage> {
        let mut procs = Vec::with_capacity(self.slots.len());
        for slot in &mut self.slots {
            if let Some(handle) = slot.handle.as_mut() {
                procs.push(ProcessUsage {
                    name: slot.descriptor.name.clone(),
                    pid: handle.pid(),
                    usage: handle.usage(self.ctl.as_mut()),
                });
            }
        }
        procs
    }

    // ── SHUTTING_DOWN ───────────────────────────────────────────────────────

    async fn shutdown(&mut self) {
        self.enter(Phase::ShuttingDown);
        if let Err(e) = self.params.put_bool(SUPERVISOR_READY, false) {
            warn!(error = %e, "cannot clear ready flag");
        }
        let state = self.manager_state(false);
        self.publisher.publish_manager_state(state);

        let timeout = self.config.stop_timeout;
        for slot in &mut self.slots {
            if let Some(handle) = slot.handle.as_mut() {
                handle.stop(self.ctl.as_mut(), timeout).await;
            }
        }
        self.enter(Phase::Terminated);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string payload"
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if self.phase == Phase::Terminated {
            return;
        }
        warn!(phase = self.phase.name(), "supervisor dropped mid-run; killing services");
        for slot in &mut self.slots {
            if let Some(handle) = slot.handle.as_mut() {
                handle.kill(self.ctl.as_mut());
            }
        }
        if self.phase != Phase::Init
            && let Err(e) = self.params.put_bool(SUPERVISOR_READY, false)
        {
            warn!(error = %e, "cannot clear ready flag");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_hal::{ProcessEntry, ProcessStatus, SimMetrics, SimProcessControl, SpawnRequest};
    use keel_middleware::params::COMPANION_PID;
    use keel_middleware::{
        BusStartChannel, EventBus, MemoryParams, TelemetrySink, Topic, TopicReceiver,
    };
    use keel_types::{Event, EventPayload, Pid, ResourceUsage};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;
    use tokio::time::sleep;

    const TICK: Duration = Duration::from_millis(100);

    struct Harness {
        ctl: SimProcessControl,
        params: Arc<MemoryParams>,
        bus: EventBus,
        shutdown: Arc<AtomicBool>,
        lock_dir: TempDir,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                ctl: SimProcessControl::new(),
                params: Arc::new(MemoryParams::new()),
                bus: EventBus::default(),
                shutdown: Arc::new(AtomicBool::new(false)),
                lock_dir: tempfile::tempdir().expect("tmp dir"),
            }
        }

        fn config(&self) -> SupervisorConfig {
            SupervisorConfig {
                tick_period: TICK,
                stop_timeout: Duration::from_millis(200),
                restart_stop_timeout: Duration::from_millis(50),
                lock_dir: self.lock_dir.path().to_path_buf(),
                ..SupervisorConfig::default()
            }
        }

        fn supervisor_with(&self, config: SupervisorConfig, sink: Arc<dyn TelemetrySink>) -> Supervisor {
            self.build(config, Box::new(self.ctl.clone()), self.params.clone(), sink)
        }

        fn build(
            &self,
            config: SupervisorConfig,
            ctl: Box<dyn ProcessControl>,
            params: Arc<dyn ParamStore>,
            sink: Arc<dyn TelemetrySink>,
        ) -> Supervisor {
            let gate = ReadinessGate::new(
                Arc::clone(&params),
                Box::new(BusStartChannel::new(&self.bus)),
                ["java", "ai.flow.android", "java.exe", "ai.flow.app"],
            );
            let publisher = TelemetryPublisher::new(
                sink,
                Box::new(SimMetrics::default()),
                Box::new(SimMetrics::default()),
            );
            Supervisor::new(config, ctl, params, gate, publisher)
                .with_shutdown(Arc::clone(&self.shutdown))
        }

        fn spawn(&self, services: Vec<ServiceDescriptor>) -> JoinHandle<Result<(), RunError>> {
            let sup = self.supervisor_with(self.config(), Arc::new(self.bus.clone()));
            tokio::spawn(sup.run(services))
        }

        fn send_start(&self) {
            self.bus
                .publish_to(Topic::Control, Event::new("test", EventPayload::StartSignal))
                .unwrap();
        }

        fn ready(&self) -> bool {
            self.params.get_bool(SUPERVISOR_READY).unwrap()
        }

        async fn stop(&self, task: JoinHandle<Result<(), RunError>>) -> Result<(), RunError> {
            self.shutdown.store(true, Ordering::SeqCst);
            task.await.expect("supervisor task panicked")
        }

        fn pid_of(&self, service: &str) -> Pid {
            self.ctl.spawns_of(service).last().expect("service spawned").pid
        }
    }

    fn latest_state(rx: &mut TopicReceiver) -> Option<ManagerState> {
        std::iter::from_fn(|| rx.try_recv())
            .filter_map(|e| match e.payload {
                EventPayload::ManagerState(state) => Some(state),
                _ => None,
            })
            .last()
    }

    fn entry<'a>(state: &'a ManagerState, name: &str) -> &'a ProcessState {
        state
            .processes
            .iter()
            .find(|p| p.name == name)
            .expect("service in manager state")
    }

    #[tokio::test(start_paused = true)]
    async fn crashed_service_is_restarted_within_one_tick() {
        let h = Harness::new();
        let mut rx = h.bus.subscribe_to(Topic::ManagerState);
        let task = h.spawn(vec![
            ServiceDescriptor::new("controlsd", "./controlsd")
                .restart_on_crash(true)
                .monitored(true),
        ]);
        h.send_start();
        sleep(TICK * 2).await;

        let before = h.pid_of("controlsd");
        h.ctl.kill_external(before);
        sleep(TICK + TICK / 2).await;

        let state = latest_state(&mut rx).expect("telemetry published");
        let controlsd = entry(&state, "controlsd");
        assert!(controlsd.running);
        assert_eq!(controlsd.restart_count, 1);
        assert_ne!(controlsd.pid, Some(before));
        assert!(h.ctl.is_running(h.pid_of("controlsd")));

        h.stop(task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_services_start_before_the_gate_and_gated_ones_after() {
        let h = Harness::new();
        let mut rx = h.bus.subscribe_to(Topic::ManagerState);
        let task = h.spawn(vec![
            ServiceDescriptor::new("A", "./a").start_immediately(true),
            ServiceDescriptor::new("B", "./b"),
        ]);
        sleep(TICK * 5).await;

        let a = h.pid_of("A");
        assert!(h.ctl.is_running(a));
        assert!(h.ctl.spawns_of("B").is_empty());
        assert!(!h.ready());
        assert!(latest_state(&mut rx).is_none());

        h.send_start();
        sleep(TICK * 2).await;

        assert_eq!(h.ctl.spawns_of("B").len(), 1);
        assert_eq!(h.ctl.spawns_of("A").len(), 1);
        assert!(h.ctl.is_running(a));
        assert!(h.ctl.terminations(a).is_empty());
        assert!(h.ready());
        let state = latest_state(&mut rx).expect("telemetry published");
        assert!(state.ready);
        assert_eq!(entry(&state, "A").restart_count, 0);

        h.stop(task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn trusted_companion_opens_the_gate_without_a_token() {
        let h = Harness::new();
        let app = h.ctl.add_foreign("ai.flow.app");
        h.params.put(COMPANION_PID, app.to_string().as_bytes()).unwrap();

        let task = h.spawn(vec![ServiceDescriptor::new("modeld", "./modeld")]);
        sleep(TICK * 2).await;

        assert_eq!(h.ctl.spawns_of("modeld").len(), 1);
        assert!(h.ready());
        h.stop(task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn untrusted_companion_keeps_the_gate_closed() {
        let h = Harness::new();
        let rogue = h.ctl.add_foreign("bash");
        h.params.put(COMPANION_PID, rogue.to_string().as_bytes()).unwrap();

        let task = h.spawn(vec![ServiceDescriptor::new("modeld", "./modeld")]);
        sleep(TICK * 10).await;

        assert!(h.ctl.spawns_of("modeld").is_empty());
        assert!(!h.ready());
        h.stop(task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn non_restartable_service_is_marked_failed() {
        let h = Harness::new();
        let mut rx = h.bus.subscribe_to(Topic::ManagerState);
        let task = h.spawn(vec![ServiceDescriptor::new("plannerd", "./plannerd")]);
        h.send_start();
        sleep(TICK * 2).await;

        let pid = h.pid_of("plannerd");
        h.ctl.exit_with(pid, 1);
        sleep(TICK * 5).await;

        assert_eq!(h.ctl.spawns_of("plannerd").len(), 1);
        let state = latest_state(&mut rx).expect("telemetry published");
        let plannerd = entry(&state, "plannerd");
        assert!(!plannerd.should_be_running);
        assert!(!plannerd.running);
        assert_eq!(plannerd.exit_code, Some(1));
        assert_eq!(plannerd.restart_count, 0);

        // A failed handle is not probed again.
        let probes = h.ctl.status_calls(pid);
        sleep(TICK * 3).await;
        assert_eq!(h.ctl.status_calls(pid), probes);

        h.stop(task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unmonitored_service_is_never_probed() {
        let h = Harness::new();
        let mut rx = h.bus.subscribe_to(Topic::ManagerState);
        let task = h.spawn(vec![
            ServiceDescriptor::new("logmessaged", "./logmessaged")
                .monitored(false)
                .start_immediately(true)
                .restart_on_crash(true),
        ]);
        h.send_start();
        sleep(TICK * 3).await;

        let pid = h.pid_of("logmessaged");
        h.ctl.kill_external(pid);
        sleep(TICK * 3).await;

        assert_eq!(h.ctl.status_calls(pid), 0);
        assert_eq!(h.ctl.spawns_of("logmessaged").len(), 1);
        let state = latest_state(&mut rx).expect("telemetry published");
        let entry = entry(&state, "logmessaged");
        assert!(!entry.monitored);
        assert!(entry.should_be_running);
        assert_eq!(entry.restart_count, 0);

        h.stop(task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_respawn_is_retried_without_counting() {
        let h = Harness::new();
        let mut rx = h.bus.subscribe_to(Topic::ManagerState);
        let task = h.spawn(vec![
            ServiceDescriptor::new("camerad", "./camerad").restart_on_crash(true),
        ]);
        h.send_start();
        sleep(TICK * 2).await;

        let _ = h.ctl.clone().with_missing_executable("./camerad");
        h.ctl.kill_external(h.pid_of("camerad"));
        sleep(TICK * 3).await;

        let state = latest_state(&mut rx).expect("telemetry published");
        let camerad = entry(&state, "camerad");
        assert!(!camerad.running);
        assert!(camerad.should_be_running);
        assert_eq!(camerad.restart_count, 0);

        h.stop(task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_reports_not_ready_and_stops_everything() {
        let h = Harness::new();
        let mut rx = h.bus.subscribe_to(Topic::ManagerState);
        let task = h.spawn(vec![
            ServiceDescriptor::new("ui", "./ui").start_immediately(true).monitored(false),
            ServiceDescriptor::new("controlsd", "./controlsd").restart_on_crash(true),
            ServiceDescriptor::new("plannerd", "./plannerd"),
        ]);
        h.send_start();
        sleep(TICK * 2).await;
        h.ctl.exit_with(h.pid_of("plannerd"), 2);
        sleep(TICK * 2).await;
        assert!(h.ready());

        h.stop(task).await.unwrap();

        assert!(h.ctl.running().is_empty());
        assert!(!h.ready());
        let last = latest_state(&mut rx).expect("final state");
        assert!(!last.ready);
        assert_eq!(last.processes.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_while_waiting_stops_immediate_services() {
        let h = Harness::new();
        let task = h.spawn(vec![
            ServiceDescriptor::new("A", "./a").start_immediately(true),
            ServiceDescriptor::new("B", "./b"),
        ]);
        sleep(TICK * 2).await;

        h.stop(task).await.unwrap();
        assert!(h.ctl.running().is_empty());
        assert!(h.ctl.spawns_of("B").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_cadence_follows_tick_period() {
        let h = Harness::new();
        let app = h.ctl.add_foreign("ai.flow.app");
        h.params.put(COMPANION_PID, app.to_string().as_bytes()).unwrap();
        let mut rx = h.bus.subscribe_to(Topic::ProcLog);

        let task = h.spawn(vec![ServiceDescriptor::new("modeld", "./modeld")]);
        sleep(TICK * 10).await;
        let published = std::iter::from_fn(|| rx.try_recv()).count();
        assert!((9..=11).contains(&published), "published {published} in 10 ticks");

        h.stop(task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failures_do_not_stop_the_loop() {
        struct BrokenSink(AtomicUsize);
        impl TelemetrySink for BrokenSink {
            fn publish_to(&self, topic: Topic, _event: Event) -> Result<usize, KeelError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(KeelError::Channel(format!("{} down", topic.name())))
            }
        }

        let h = Harness::new();
        let sink = Arc::new(BrokenSink(AtomicUsize::new(0)));
        let sup = h.supervisor_with(h.config(), sink.clone());
        let task = tokio::spawn(sup.run(vec![
            ServiceDescriptor::new("controlsd", "./controlsd").restart_on_crash(true),
        ]));
        h.send_start();
        sleep(TICK * 2).await;

        h.ctl.kill_external(h.pid_of("controlsd"));
        sleep(TICK * 3).await;

        assert_eq!(h.ctl.spawns_of("controlsd").len(), 2);
        assert!(sink.0.load(Ordering::SeqCst) >= 9);
        h.stop(task).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn lock_contention_touches_nothing() {
        let h = Harness::new();
        let _held = SingletonGuard::acquire(h.lock_dir.path(), "keel").unwrap();
        h.params.put_bool(SUPERVISOR_READY, true).unwrap();
        let stale = h.ctl.add_foreign("controlsd");

        let err = h
            .spawn(vec![ServiceDescriptor::new("controlsd", "./controlsd").start_immediately(true)])
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind, ExitKind::LockContention);
        assert_eq!(err.exit_code(), 2);
        assert!(h.ctl.spawned().is_empty());
        assert!(h.ctl.is_running(stale));
        assert!(h.ready());
    }

    #[tokio::test(start_paused = true)]
    async fn caller_held_lock_is_reused() {
        let h = Harness::new();
        let guard = SingletonGuard::acquire(h.lock_dir.path(), "keel").unwrap();
        h.shutdown.store(true, Ordering::SeqCst);

        let sup = h
            .supervisor_with(h.config(), Arc::new(h.bus.clone()))
            .with_guard(guard);
        sup.run(vec![ServiceDescriptor::new("ui", "./ui").start_immediately(true)])
            .await
            .unwrap();

        assert_eq!(h.ctl.spawns_of("ui").len(), 1);
        assert!(SingletonGuard::acquire(h.lock_dir.path(), "keel").is_ok());
    }

    #[test]
    fn lock_errors_are_classified() {
        let contended = RunError::lock(KeelError::LockContention("/tmp/keel.lock".into()));
        assert_eq!(contended.exit_code(), 2);
        let broken = RunError::lock(KeelError::Fault("read-only fs".into()));
        assert_eq!(broken.exit_code(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_spawn_failure_is_a_boot_failure() {
        let h = Harness::new();
        let _ = h.ctl.clone().with_missing_executable("./broken");
        let err = h
            .spawn(vec![
                ServiceDescriptor::new("first", "./first").start_immediately(true),
                ServiceDescriptor::new("broken", "./broken").start_immediately(true),
                ServiceDescriptor::new("gated", "./gated"),
            ])
            .await
            .unwrap()
            .unwrap_err();

        assert_eq!(err.kind, ExitKind::BootFailure);
        assert_eq!(err.exit_code(), 3);
        assert!(matches!(err.source, KeelError::Spawn { .. }));
        assert!(h.ctl.running().is_empty());
        assert!(h.ctl.spawns_of("gated").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_service_names_are_a_boot_failure() {
        let h = Harness::new();
        let err = h
            .spawn(vec![
                ServiceDescriptor::new("ui", "./ui"),
                ServiceDescriptor::new("ui", "./ui2"),
            ])
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.source, KeelError::DuplicateService("ui".to_string()));
        assert!(h.ctl.spawned().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn init_kills_stale_instances_and_seeds_params() {
        let h = Harness::new();
        let stale = h.ctl.add_foreign("camerad");
        let bystander = h.ctl.add_foreign("sshd");
        h.params.put("CarParams", b"old").unwrap();
        h.params.put("EnabledToggle", b"0").unwrap();

        let mut config = h.config();
        config.default_params = BTreeMap::from([
            ("EnabledToggle".to_string(), "1".to_string()),
            ("HasAcceptedTerms".to_string(), "1".to_string()),
        ]);
        config.passive = Some(true);
        // Leave at the first tick of WAIT_FOR_START.
        h.shutdown.store(true, Ordering::SeqCst);

        let sup = h.supervisor_with(config, Arc::new(h.bus.clone()));
        sup.run(vec![ServiceDescriptor::new("camerad", "./camerad")])
            .await
            .unwrap();

        assert_eq!(h.ctl.terminations(stale), vec![Termination::Forced]);
        assert!(h.ctl.terminations(bystander).is_empty());
        assert_eq!(h.params.get("CarParams").unwrap(), None);
        assert_eq!(h.params.get("EnabledToggle").unwrap(), Some(b"0".to_vec()));
        assert_eq!(h.params.get("HasAcceptedTerms").unwrap(), Some(b"1".to_vec()));
        assert!(h.params.get_bool(PASSIVE).unwrap());
        assert_eq!(
            h.params.get(KEEL_VERSION).unwrap(),
            Some(env!("CARGO_PKG_VERSION").as_bytes().to_vec())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_running_supervisor_kills_its_services() {
        let h = Harness::new();
        let task = h.spawn(vec![
            ServiceDescriptor::new("A", "./a").start_immediately(true),
            ServiceDescriptor::new("B", "./b"),
        ]);
        h.send_start();
        sleep(TICK * 2).await;
        assert_eq!(h.ctl.running().len(), 2);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(h.ctl.running().is_empty());
        assert!(!h.ready());
    }

    /// Delegates to the simulator but panics when asked for resource usage.
    struct PanicOnUsage(SimProcessControl);

    impl ProcessControl for PanicOnUsage {
        fn spawn(&mut self, request: &SpawnRequest<'_>) -> Result<Pid, KeelError> {
            self.0.spawn(request)
        }
        fn status(&mut self, pid: Pid) -> ProcessStatus {
            self.0.status(pid)
        }
        fn terminate(&mut self, pid: Pid, mode: Termination) -> Result<(), KeelError> {
            self.0.terminate(pid, mode)
        }
        fn processes(&mut self) -> Vec<ProcessEntry> {
            self.0.processes()
        }
        fn process_name(&mut self, pid: Pid) -> Option<String> {
            self.0.process_name(pid)
        }
        fn usage(&mut self, _pid: Pid) -> Option<ResourceUsage> {
            panic!("usage table corrupted")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_tick_still_shuts_down() {
        let h = Harness::new();
        let mut rx = h.bus.subscribe_to(Topic::ManagerState);
        let sup = h.build(
            h.config(),
            Box::new(PanicOnUsage(h.ctl.clone())),
            h.params.clone(),
            Arc::new(h.bus.clone()),
        );
        let task = tokio::spawn(sup.run(vec![
            ServiceDescriptor::new("ui", "./ui").start_immediately(true),
            ServiceDescriptor::new("modeld", "./modeld"),
        ]));
        h.send_start();

        let err = task.await.expect("panic is caught").unwrap_err();
        assert_eq!(err.kind, ExitKind::RuntimeFault);
        assert_eq!(err.exit_code(), 4);
        match &err.source {
            KeelError::Fault(msg) => assert!(msg.contains("usage table corrupted"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }

        let modeld = h.pid_of("modeld");
        assert!(h.ctl.terminations(modeld).contains(&Termination::Graceful));
        assert!(h.ctl.running().is_empty());
        assert!(!h.ready());
        let last = latest_state(&mut rx).expect("final state");
        assert!(!last.ready);
    }

    #[tokio::test(start_paused = true)]
    async fn unset_passive_is_a_boot_failure_when_required() {
        let h = Harness::new();
        let mut config = h.config();
        config.require_passive = true;

        let sup = h.supervisor_with(config, Arc::new(h.bus.clone()));
        let err = sup
            .run(vec![ServiceDescriptor::new("ui", "./ui").start_immediately(true)])
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 3);
        assert!(matches!(err.source, KeelError::Params(ref msg) if msg.contains(PASSIVE)));
        assert!(h.ctl.spawned().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stored_passive_satisfies_the_requirement() {
        let h = Harness::new();
        h.params.put_bool(PASSIVE, false).unwrap();
        let mut config = h.config();
        config.require_passive = true;
        h.shutdown.store(true, Ordering::SeqCst);

        let sup = h.supervisor_with(config, Arc::new(h.bus.clone()));
        sup.run(vec![ServiceDescriptor::new("ui", "./ui").start_immediately(true)])
            .await
            .unwrap();

        assert_eq!(h.ctl.spawns_of("ui").len(), 1);
        assert!(!h.params.get_bool(PASSIVE).unwrap());
    }

    /// Memory store whose writes can be switched off.
    struct ReadOnlyAfter {
        inner: MemoryParams,
        frozen: AtomicBool,
    }

    impl ParamStore for ReadOnlyAfter {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KeelError> {
            self.inner.get(key)
        }
        fn put(&self, key: &str, value: &[u8]) -> Result<(), KeelError> {
            if self.frozen.load(Ordering::SeqCst) {
                return Err(KeelError::Params(format!("{key}: read-only")));
            }
            self.inner.put(key, value)
        }
        fn delete(&self, key: &str) -> Result<(), KeelError> {
            self.inner.delete(key)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drop_kills_services_even_if_ready_flag_cannot_be_cleared() {
        let h = Harness::new();
        let params = Arc::new(ReadOnlyAfter {
            inner: MemoryParams::new(),
            frozen: AtomicBool::new(false),
        });
        let sup = h.build(
            h.config(),
            Box::new(h.ctl.clone()),
            params.clone(),
            Arc::new(h.bus.clone()),
        );
        let task = tokio::spawn(sup.run(vec![ServiceDescriptor::new("A", "./a")]));
        h.send_start();
        sleep(TICK * 2).await;
        assert!(params.get_bool(SUPERVISOR_READY).unwrap());

        params.frozen.store(true, Ordering::SeqCst);
        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(h.ctl.running().is_empty());
        assert!(params.get_bool(SUPERVISOR_READY).unwrap());
    }

    #[test]
    fn phase_names() {
        assert_eq!(Phase::WaitForStart.name(), "WAIT_FOR_START");
        assert_eq!(Phase::Terminated.name(), "TERMINATED");
    }
}

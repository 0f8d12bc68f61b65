//! [`ProcessHandle`] – one running attempt of a service.
//!
//! A handle binds a [`ServiceDescriptor`] to the PID it was spawned as.  It
//! never watches itself: the supervisor decides when to probe, stop or
//! restart it, and a restart consumes the old handle and returns a new one.
//!
//! All OS access goes through the [`ProcessControl`] passed to each call, so
//! the handle itself holds no OS resources.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keel_hal::{ProcessControl, ProcessStatus, SpawnRequest, Termination};
use keel_types::{KeelError, Pid, ResourceUsage, ServiceDescriptor};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::extras::LaunchExtras;

/// Interval between liveness probes while waiting for a graceful exit.
const STOP_POLL: Duration = Duration::from_millis(20);

/// Runtime binding between a descriptor and a spawned process.
#[derive(Debug)]
pub struct ProcessHandle {
    descriptor: Arc<ServiceDescriptor>,
    pid: Pid,
    started_at: DateTime<Utc>,
    alive: bool,
    restart_count: u32,
    /// Set once, when the exit is first observed.
    exit_code: Option<i32>,
    last_usage: ResourceUsage,
    stopped: bool,
}

/// A restart whose respawn failed.
///
/// The previous handle is returned, already stopped, so the caller keeps
/// reporting it and may try again later.
#[derive(Debug)]
pub struct RestartError {
    pub previous: ProcessHandle,
    pub error: KeelError,
}

impl ProcessHandle {
    /// Spawn `descriptor` and return a live handle with a restart count of 0.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Spawn`] if the executable cannot be launched.
    pub fn start(
        descriptor: Arc<ServiceDescriptor>,
        extras: &LaunchExtras,
        ctl: &mut dyn ProcessControl,
        log_dir: Option<&Path>,
    ) -> Result<Self, KeelError> {
        let args = extras.args_for(&descriptor);
        let pid = ctl.spawn(&SpawnRequest {
            service: &descriptor.name,
            command: &descriptor.command,
            args: &args,
            env: &descriptor.env,
            log_dir,
        })?;
        info!(service = %descriptor.name, pid, "started");
        Ok(Self {
            descriptor,
            pid,
            started_at: Utc::now(),
            alive: true,
            restart_count: 0,
            exit_code: None,
            last_usage: ResourceUsage::default(),
            stopped: false,
        })
    }

    pub fn descriptor(&self) -> &Arc<ServiceDescriptor> {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    /// Last-known liveness, without probing.
    pub fn last_known_alive(&self) -> bool {
        self.alive
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Probe the OS.  Once a process has been seen dead the handle stays
    /// dead and is not probed again.
    pub fn is_alive(&mut self, ctl: &mut dyn ProcessControl) -> bool {
        if !self.alive {
            return false;
        }
        if let ProcessStatus::Exited(code) = ctl.status(self.pid) {
            self.mark_exited(code);
        }
        self.alive
    }

    fn mark_exited(&mut self, code: Option<i32>) {
        self.alive = false;
        if self.exit_code.is_none() {
            self.exit_code = code;
        }
    }

    /// Ask the process to exit, wait up to `timeout`, then force-kill it.
    ///
    /// Idempotent: a second call, or a call on a process that already exited,
    /// does nothing.  Failures are logged, never returned.
    pub async fn stop(&mut self, ctl: &mut dyn ProcessControl, timeout: Duration) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if !self.is_alive(ctl) {
            return;
        }

        if let Err(e) = ctl.terminate(self.pid, Termination::Graceful) {
            warn!(service = %self.descriptor.name, pid = self.pid, error = %e, "graceful stop failed");
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.is_alive(ctl) {
                debug!(service = %self.descriptor.name, pid = self.pid, "stopped");
                return;
            }
            sleep(STOP_POLL).await;
        }
        if !self.is_alive(ctl) {
            return;
        }

        warn!(service = %self.descriptor.name, pid = self.pid, ?timeout, "did not exit in time; killing");
        if let Err(e) = ctl.terminate(self.pid, Termination::Forced) {
            warn!(service = %self.descriptor.name, pid = self.pid, error = %e, "forced stop failed");
        }
        if self.is_alive(ctl) {
            // SIGKILL delivered; the exit itself may not be observable yet.
            self.mark_exited(None);
        }
    }

    /// Synchronous forced kill, for teardown paths that cannot await.
    pub fn kill(&mut self, ctl: &mut dyn ProcessControl) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if self.alive {
            if let Err(e) = ctl.terminate(self.pid, Termination::Forced) {
                warn!(service = %self.descriptor.name, pid = self.pid, error = %e, "kill failed");
            }
            self.mark_exited(None);
        }
    }

    /// Stop this attempt (waiting at most `timeout`) and spawn a replacement
    /// whose restart count is one higher.
    ///
    /// # Errors
    ///
    /// When the respawn fails the stopped previous handle is handed back in
    /// [`RestartError`].
    pub async fn restart(
        mut self,
        extras: &LaunchExtras,
        ctl: &mut dyn ProcessControl,
        log_dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<Self, RestartError> {
        self.stop(ctl, timeout).await;
        match Self::start(Arc::clone(&self.descriptor), extras, ctl, log_dir) {
            Ok(mut next) => {
                next.restart_count = self.restart_count + 1;
                next.last_usage = self.last_usage;
                Ok(next)
            }
            Err(error) => Err(RestartError {
                previous: self,
                error,
            }),
        }
    }

    /// CPU time and memory of the process.
    ///
    /// Best-effort: when the OS read fails (typically because the process just
    /// exited) the last successful reading is returned, or zeros if there was
    /// none.
    pub fn usage(&mut self, ctl: &mut dyn ProcessControl) -> ResourceUsage {
        if self.alive
            && let Some(usage) = ctl.usage(self.pid)
        {
            self.last_usage = usage;
        }
        self.last_usage
    }
}

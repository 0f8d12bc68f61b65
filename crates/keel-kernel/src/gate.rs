//! [`ReadinessGate`] – withholds gated services until the stack is armed.
//!
//! The gate opens on whichever of two conditions is seen first:
//!
//! 1. **Companion detection** – the parameter store holds a PID
//!    ([`COMPANION_PID`]) and the process table shows a live process with that
//!    PID whose image name is on the trusted list.
//! 2. **Start token** – the [`StartChannel`] delivers the discrete "start"
//!    token.
//!
//! Both are checked on every [`poll`](ReadinessGate::poll), in that order.  The
//! gate has no timeout.

use std::collections::BTreeSet;
use std::sync::Arc;

use keel_hal::ProcessControl;
use keel_middleware::params::{COMPANION_PID, decode_pid};
use keel_middleware::{ParamStore, StartChannel};
use keel_types::Pid;
use tracing::{debug, info, warn};

/// What opened the gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateTrigger {
    /// A trusted companion application was found alive.
    Companion { pid: Pid, image: String },
    /// The start token arrived on the readiness channel.
    Token,
}

/// Readiness precondition evaluated once per tick.
pub struct ReadinessGate {
    params: Arc<dyn ParamStore>,
    start: Box<dyn StartChannel>,
    trusted: BTreeSet<String>,
    opened_by: Option<GateTrigger>,
}

impl ReadinessGate {
    /// Build a gate over `params` and `start`, trusting exactly the image
    /// names in `trusted`.
    pub fn new<I, S>(params: Arc<dyn ParamStore>, start: Box<dyn StartChannel>, trusted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            params,
            start,
            trusted: trusted.into_iter().map(Into::into).collect(),
            opened_by: None,
        }
    }

    pub fn trusted(&self) -> &BTreeSet<String> {
        &self.trusted
    }

    /// The condition that opened the gate, once it is open.
    pub fn opened_by(&self) -> Option<&GateTrigger> {
        self.opened_by.as_ref()
    }

    /// Non-blocking check.  Once open, the gate stays open.
    pub fn poll(&mut self, ctl: &mut dyn ProcessControl) -> bool {
        if self.opened_by.is_some() {
            return true;
        }
        let trigger = match self.companion(ctl) {
            Some(trigger) => trigger,
            None if self.start.try_recv_start() => GateTrigger::Token,
            None => return false,
        };
        info!(?trigger, "readiness gate opened");
        self.opened_by = Some(trigger);
        true
    }

    fn companion(&self, ctl: &mut dyn ProcessControl) -> Option<GateTrigger> {
        let raw = match self.params.get(COMPANION_PID) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(error = %e, "cannot read companion pid");
                return None;
            }
        };
        let Some(pid) = decode_pid(&raw) else {
            debug!(bytes = raw.len(), "companion pid is not decodable");
            return None;
        };
        let image = ctl.process_name(pid)?;
        if self.trusted.contains(&image) {
            Some(GateTrigger::Companion { pid, image })
        } else {
            debug!(pid, %image, "companion pid belongs to an untrusted image");
            None
        }
    }
}

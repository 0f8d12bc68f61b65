//! [`TelemetryPublisher`] – per-tick health and resource broadcast.
//!
//! Three independent messages go out every tick:
//!
//! | Channel | Payload | Built from |
//! |---|---|---|
//! | `managerState` | [`ManagerState`] | the supervisor's process handles |
//! | `procLog` | [`ProcLog`] | per-handle usage plus [`SystemMetrics`] |
//! | `deviceState` | [`DeviceState`] | [`DeviceStateSource`], unmodified |
//!
//! Publishing is fire-and-forget: a failed send is logged and the remaining
//! channels are still attempted.

use std::sync::Arc;

use keel_hal::{DeviceStateSource, SystemMetrics};
use keel_middleware::{TelemetrySink, Topic};
use keel_types::{DeviceState, Event, EventPayload, ManagerState, ProcLog, ProcessUsage};
use tracing::{trace, warn};

const SOURCE: &str = "keel-runtime::publisher";

/// Emits supervisor telemetry on a [`TelemetrySink`].
pub struct TelemetryPublisher {
    sink: Arc<dyn TelemetrySink>,
    metrics: Box<dyn SystemMetrics>,
    device: Box<dyn DeviceStateSource>,
}

impl TelemetryPublisher {
    pub fn new(
        sink: Arc<dyn TelemetrySink>,
        metrics: Box<dyn SystemMetrics>,
        device: Box<dyn DeviceStateSource>,
    ) -> Self {
        Self {
            sink,
            metrics,
            device,
        }
    }

    /// Publish all three messages for one tick.  Returns how many of them
    /// were handed to the sink without error.
    pub fn publish_tick(&mut self, state: ManagerState, procs: Vec<ProcessUsage>) -> usize {
        let proc_log = ProcLog {
            procs,
            host: self.metrics.host_usage(),
        };
        let device: DeviceState = self.device.device_state();

        [
            (Topic::ManagerState, EventPayload::ManagerState(state)),
            (Topic::ProcLog, EventPayload::ProcLog(proc_log)),
            (Topic::DeviceState, EventPayload::DeviceState(device)),
        ]
        .into_iter()
        .map(|(topic, payload)| self.emit(topic, payload))
        .filter(|delivered| *delivered)
        .count()
    }

    /// Publish a lone manager-state message (used for the final "not ready"
    /// report).
    pub fn publish_manager_state(&mut self, state: ManagerState) -> bool {
        self.emit(Topic::ManagerState, EventPayload::ManagerState(state))
    }

    fn emit(&self, topic: Topic, payload: EventPayload) -> bool {
        match self.sink.publish_to(topic, Event::new(SOURCE, payload)) {
            Ok(receivers) => {
                trace!(topic = topic.name(), receivers, "published");
                true
            }
            Err(e) => {
                warn!(topic = topic.name(), error = %e, "telemetry publish failed");
                false
            }
        }
    }
}

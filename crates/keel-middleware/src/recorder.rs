//! [`TelemetryRecorder`] – appends bus telemetry to a JSON-lines file.
//!
//! Each line is `{"topic": "<channel name>", "event": <Event>}`.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use keel_types::{Event, KeelError};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::{EventBus, Topic};

/// Writes telemetry events to a file, one JSON object per line.
pub struct TelemetryRecorder {
    writer: BufWriter<File>,
}

impl TelemetryRecorder {
    /// Open `path` for appending, creating it if necessary.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, KeelError> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                KeelError::Serialization(format!("cannot open {}: {e}", path.display()))
            })?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    /// Append one event and flush.
    pub fn record(&mut self, topic: Topic, event: &Event) -> Result<(), KeelError> {
        let line = json!({ "topic": topic.name(), "event": event });
        serde_json::to_writer(&mut self.writer, &line)
            .map_err(|e| KeelError::Serialization(e.to_string()))?;
        self.writer
            .write_all(b"\n")
            .and_then(|()| self.writer.flush())
            .map_err(|e| KeelError::Serialization(e.to_string()))
    }

    /// Subscribe to every telemetry topic of `bus` and record until the bus
    /// closes.
    pub fn spawn(mut self, bus: &EventBus) -> JoinHandle<()> {
        let [mut manager, mut proc_log, mut device] = Topic::TELEMETRY.map(|t| bus.subscribe_to(t));
        tokio::spawn(async move {
            loop {
                let (topic, received) = tokio::select! {
                    r = manager.recv() => (Topic::ManagerState, r),
                    r = proc_log.recv() => (Topic::ProcLog, r),
                    r = device.recv() => (Topic::DeviceState, r),
                };
                match received {
                    Ok(event) => {
                        if let Err(e) = self.record(topic, &event) {
                            warn!(topic = topic.name(), error = %e, "telemetry record failed");
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(topic = topic.name(), lagged_by = n, "telemetry recorder lagged");
                    }
                    Err(RecvError::Closed) => {
                        debug!("bus closed; telemetry recorder stopping");
                        break;
                    }
                }
            }
        })
    }
}

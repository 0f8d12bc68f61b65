//! Headless, typed, topic-based publish/subscribe event bus.
//!
//! Uses [`tokio::sync::broadcast`] channels under the hood so that every
//! subscriber receives every message without any single subscriber blocking
//! the others.
//!
//! # Topics
//!
//! | Topic | Typical traffic |
//! |---|---|
//! | [`Topic::ManagerState`] | Per-service running / restart / exit state, once per tick |
//! | [`Topic::ProcLog`] | Per-process CPU and memory plus host totals, once per tick |
//! | [`Topic::DeviceState`] | Opaque device-state document, once per tick |
//! | [`Topic::Control`] | Inbound control tokens such as the readiness "start" signal |

use keel_types::{Event, KeelError};
use tokio::sync::broadcast;
use tracing::warn;

/// Default channel capacity (number of buffered events before old ones are
/// dropped for slow subscribers).
const DEFAULT_CAPACITY: usize = 256;

/// Enumeration of all routing topics on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    ManagerState,
    ProcLog,
    DeviceState,
    Control,
}

impl Topic {
    /// The three channels the supervisor publishes on every tick.
    pub const TELEMETRY: [Topic; 3] = [Topic::ManagerState, Topic::ProcLog, Topic::DeviceState];

    /// Stable channel name, used in logs and recorded telemetry.
    pub fn name(self) -> &'static str {
        match self {
            Topic::ManagerState => "managerState",
            Topic::ProcLog => "procLog",
            Topic::DeviceState => "deviceState",
            Topic::Control => "control",
        }
    }
}

/// Anything the telemetry publisher can emit on.
///
/// [`EventBus`] is the production implementation; tests substitute sinks that
/// fail on demand.
pub trait TelemetrySink: Send + Sync {
    /// Publish `event` on `topic`, returning the number of receivers reached.
    fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, KeelError>;
}

/// Shared event bus. Clone it cheaply – all clones share the same underlying
/// broadcast channels.
#[derive(Clone, Debug)]
pub struct EventBus {
    manager_state: broadcast::Sender<Event>,
    proc_log: broadcast::Sender<Event>,
    device_state: broadcast::Sender<Event>,
    control: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    ///
    /// The `capacity` is applied to every topic channel independently.
    pub fn new(capacity: usize) -> Self {
        let (manager_state, _) = broadcast::channel(capacity);
        let (proc_log, _) = broadcast::channel(capacity);
        let (device_state, _) = broadcast::channel(capacity);
        let (control, _) = broadcast::channel(capacity);
        Self {
            manager_state,
            proc_log,
            device_state,
            control,
        }
    }

    /// Publish `event` to the given [`Topic`] channel.
    ///
    /// Returns the number of active receivers that were handed the event.
    /// Returns `Ok(0)` when no subscribers are currently listening on the
    /// topic (this is a normal condition, not an error).
    pub fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, KeelError> {
        let sender = self.topic_sender(topic);
        if sender.receiver_count() == 0 {
            return Ok(0);
        }
        sender
            .send(event)
            .map_err(|e| KeelError::Channel(format!("{} send error: {e}", topic.name())))
    }

    /// Subscribe to a specific [`Topic`] channel.
    pub fn subscribe_to(&self, topic: Topic) -> TopicReceiver {
        TopicReceiver {
            topic,
            receiver: self.topic_sender(topic).subscribe(),
        }
    }

    fn topic_sender(&self, topic: Topic) -> &broadcast::Sender<Event> {
        match topic {
            Topic::ManagerState => &self.manager_state,
            Topic::ProcLog => &self.proc_log,
            Topic::DeviceState => &self.device_state,
            Topic::Control => &self.control,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl TelemetrySink for EventBus {
    fn publish_to(&self, topic: Topic, event: Event) -> Result<usize, KeelError> {
        EventBus::publish_to(self, topic, event)
    }
}

// ---------------------------------------------------------------------------
// Topic-based receiver
// ---------------------------------------------------------------------------

/// A receiver bound to a single [`Topic`] channel.
///
/// Obtained via [`EventBus::subscribe_to`].
pub struct TopicReceiver {
    topic: Topic,
    receiver: broadcast::Receiver<Event>,
}

impl TopicReceiver {
    /// Wait for the next event on this topic.
    ///
    /// Returns:
    /// * `Ok(event)` – a successfully received event.
    /// * `Err(broadcast::error::RecvError::Lagged(n))` – the subscriber fell
    ///   behind and `n` messages were dropped.
    /// * `Err(broadcast::error::RecvError::Closed)` – the bus has shut down.
    pub async fn recv(&mut self) -> Result<Event, broadcast::error::RecvError> {
        self.receiver.recv().await
    }

    /// Non-blocking receive.  Returns `None` when nothing is queued or the bus
    /// has closed; lagged messages are skipped with a warning.
    pub fn try_recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    warn!(topic = self.topic.name(), lagged_by = n, "TopicReceiver lagged");
                    continue;
                }
                Err(_) => return None,
            }
        }
    }

    /// The [`Topic`] this receiver is bound to.
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

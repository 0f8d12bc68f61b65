//! `keel-middleware` – Transport and shared state
//!
//! Moves data between the supervisor and the rest of the stack without caring
//! about its meaning.
//!
//! # Modules
//!
//! - [`bus`] – typed, topic-based publish/subscribe bus built on Tokio
//!   broadcast channels.  Carries the per-tick telemetry.
//! - [`params`] – the key/value [`ParamStore`][params::ParamStore] shared with
//!   other processes (readiness flag, companion PID, seeded defaults).
//! - [`signal`] – the readiness [`StartChannel`][signal::StartChannel] that
//!   delivers the discrete "start" token.
//! - [`recorder`] – appends telemetry events to a JSON-lines file.

pub mod bus;
pub mod params;
pub mod recorder;
pub mod signal;

pub use bus::{EventBus, TelemetrySink, Topic, TopicReceiver};
pub use params::{FileParams, KeyKind, MemoryParams, ParamStore};
pub use recorder::TelemetryRecorder;
pub use signal::{BusStartChannel, SocketStartChannel, StartChannel, send_start};

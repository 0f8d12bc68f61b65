//! `keel-runtime` – The supervisor loop
//!
//! Drives the kernel primitives through the supervisor's lifecycle and
//! reports on it.
//!
//! # Modules
//!
//! - [`supervisor`] – [`Supervisor`][supervisor::Supervisor]: the
//!   `INIT → WAIT_FOR_START → RUNNING → SHUTTING_DOWN → TERMINATED` state
//!   machine that owns every process handle.
//! - [`publisher`] – [`TelemetryPublisher`][publisher::TelemetryPublisher]:
//!   assembles the manager-state, process-log and device-state messages and
//!   emits them best-effort on the bus.
//! - [`logging`] – [`init_tracing`][logging::init_tracing]: global `tracing`
//!   subscriber with an optional OTLP span exporter.

pub mod logging;
pub mod publisher;
pub mod supervisor;

pub use publisher::TelemetryPublisher;
pub use supervisor::{Phase, RunError, Supervisor, SupervisorConfig};

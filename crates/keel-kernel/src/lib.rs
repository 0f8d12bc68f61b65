//! `keel-kernel` – Supervision primitives
//!
//! The pieces the supervisor loop is assembled from.  None of them runs a
//! loop of its own: every operation is driven by the caller, one tick at a
//! time.
//!
//! # Modules
//!
//! - [`registry`] – [`ServiceSet`][registry::ServiceSet]: the validated,
//!   ordered list of service descriptors for one run.
//! - [`extras`] – [`LaunchExtras`][extras::LaunchExtras]: explicit
//!   `-e NAME VALUE` launch parameters for the companion application.
//! - [`handle`] – [`ProcessHandle`][handle::ProcessHandle]: one running
//!   attempt of a service, with start, probe, stop, restart and resource
//!   readings.
//! - [`gate`] – [`ReadinessGate`][gate::ReadinessGate]: holds back gated
//!   services until a trusted companion app is alive or a start token
//!   arrives.
//! - [`guard`] – [`SingletonGuard`][guard::SingletonGuard]: exclusive file
//!   lock held for the whole run.

pub mod extras;
pub mod gate;
pub mod guard;
pub mod handle;
pub mod registry;

pub use extras::LaunchExtras;
pub use gate::{GateTrigger, ReadinessGate};
pub use guard::SingletonGuard;
pub use handle::{ProcessHandle, RestartError};
pub use registry::ServiceSet;

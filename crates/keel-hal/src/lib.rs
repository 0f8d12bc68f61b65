//! `keel-hal` – Process control surface
//!
//! Everything the supervisor needs from the operating system, behind traits so
//! the supervisor can run against real processes or a deterministic simulation.
//!
//! # Modules
//!
//! - [`process`] – the [`ProcessControl`][process::ProcessControl] trait:
//!   spawn, probe, terminate, list and measure processes.
//! - [`os`] – [`OsProcessControl`][os::OsProcessControl], the production
//!   backend built on `std::process`, `nix` signals and `sysinfo`.
//! - [`metrics`] – host-wide [`SystemMetrics`][metrics::SystemMetrics] and the
//!   opaque [`DeviceStateSource`][metrics::DeviceStateSource], with a
//!   `sysinfo` implementation.
//! - [`sim`] – in-memory backends for tests and headless runs.

pub mod metrics;
pub mod os;
pub mod process;
pub mod sim;

pub use metrics::{DeviceStateSource, SysinfoMetrics, SystemMetrics};
pub use os::OsProcessControl;
pub use process::{ProcessControl, ProcessEntry, ProcessStatus, SpawnRequest, Termination};
pub use sim::{SIM_USAGE, SimMetrics, SimProcessControl, SpawnRecord};

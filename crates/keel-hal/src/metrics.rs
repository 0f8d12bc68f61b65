//! Host-wide metrics and device state.
//!
//! Both are collaborators of the telemetry publisher: [`SystemMetrics`]
//! supplies the host figures of the process log, [`DeviceStateSource`]
//! supplies the opaque device-state document forwarded as-is.

use keel_types::{DeviceState, HostUsage};
use serde_json::json;
use sysinfo::{Disks, System};

/// Source of host CPU and memory figures.
pub trait SystemMetrics: Send {
    fn host_usage(&mut self) -> HostUsage;
}

/// Source of the device-state payload.
pub trait DeviceStateSource: Send {
    fn device_state(&mut self) -> DeviceState;
}

/// `sysinfo`-backed implementation of both collaborators.
///
/// Per-core CPU usage is computed between consecutive calls, so the first
/// reading after construction is zero.
pub struct SysinfoMetrics {
    system: System,
}

impl Default for SysinfoMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoMetrics {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl SystemMetrics for SysinfoMetrics {
    fn host_usage(&mut self) -> HostUsage {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();
        HostUsage {
            cpu_percent: self.system.cpus().iter().map(|c| c.cpu_usage()).collect(),
            total_memory_bytes: self.system.total_memory(),
            used_memory_bytes: self.system.used_memory(),
            available_memory_bytes: self.system.available_memory(),
        }
    }
}

impl DeviceStateSource for SysinfoMetrics {
    fn device_state(&mut self) -> DeviceState {
        self.system.refresh_memory();
        let load = System::load_average();
        let total = self.system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 * 100.0 / total as f64
        };

        let disks = Disks::new_with_refreshed_list();
        let root = disks
            .list()
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"));
        let free_space_percent = root
            .filter(|d| d.total_space() > 0)
            .map(|d| d.available_space() as f64 * 100.0 / d.total_space() as f64);

        DeviceState(json!({
            "uptime_secs": System::uptime(),
            "load_average": [load.one, load.five, load.fifteen],
            "memory_percent": memory_percent,
            "free_space_percent": free_space_percent,
            "host_name": System::host_name(),
        }))
    }
}

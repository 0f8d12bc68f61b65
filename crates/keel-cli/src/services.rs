//! Service list loader.
//!
//! ```yaml
//! services:
//!   ui:
//!     command: ./ui
//!     start_immediately: true
//!     monitored: false
//!   controlsd:
//!     command: python3
//!     args: [-m, selfdrive.controls.controlsd]
//!     image: python3
//!     restart_on_crash: true
//!   flowpilot:
//!     command: am
//!     args: [start, -n, ai.flow.app/.MainActivity]
//!     platforms: [android]
//! ```
//!
//! Mapping order is descriptor order.  Entries whose `platforms` exclude the
//! current platform are dropped before the supervisor sees them.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use keel_types::{KeelError, Platform, ServiceDescriptor};
use serde::Deserialize;
use serde_yaml::Value;
use tracing::debug;

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    restart_on_crash: bool,
    #[serde(default = "yes")]
    monitored: bool,
    #[serde(default)]
    start_immediately: bool,
    #[serde(default)]
    platforms: Option<BTreeSet<Platform>>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    image: Option<String>,
}

impl ServiceEntry {
    fn into_descriptor(self, name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            command: self.command,
            args: self.args,
            restart_on_crash: self.restart_on_crash,
            monitored: self.monitored,
            start_immediately: self.start_immediately,
            platforms: self.platforms,
            env: self.env,
            image: self.image,
        }
    }
}

/// Read and parse the service list at `path`.
pub fn load(path: &Path, platform: Platform) -> Result<Vec<ServiceDescriptor>, KeelError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| KeelError::ServiceList(format!("cannot read {}: {e}", path.display())))?;
    parse(&raw, platform)
}

/// Parse a service list document, keeping the entries that run on `platform`.
pub fn parse(raw: &str, platform: Platform) -> Result<Vec<ServiceDescriptor>, KeelError> {
    let doc: Value =
        serde_yaml::from_str(raw).map_err(|e| KeelError::ServiceList(e.to_string()))?;
    let services = match doc.get("services") {
        Some(Value::Mapping(map)) => map,
        Some(Value::Null) => return Ok(Vec::new()),
        _ => {
            return Err(KeelError::ServiceList(
                "expected a top-level `services` mapping".to_string(),
            ));
        }
    };

    let mut descriptors = Vec::with_capacity(services.len());
    for (key, value) in services {
        let name = key
            .as_str()
            .ok_or_else(|| KeelError::ServiceList(format!("service name must be a string, got {key:?}")))?;
        let entry: ServiceEntry = serde_yaml::from_value(value.clone())
            .map_err(|e| KeelError::ServiceList(format!("{name}: {e}")))?;
        let descriptor = entry.into_descriptor(name);
        if descriptor.runs_on(platform) {
            descriptors.push(descriptor);
        } else {
            debug!(service = name, ?platform, "skipping service for other platform");
        }
    }
    Ok(descriptors)
}

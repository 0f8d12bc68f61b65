//! Launch parameters for the companion application.
//!
//! The companion app is started through an activity launcher that only sees
//! what it is handed on the command line, so selected supervisor environment
//! variables are forwarded as `-e NAME VALUE` argument triples.  Every other
//! service inherits the parent environment and needs nothing extra.

use keel_types::ServiceDescriptor;

/// Explicit key/value launch parameters for one target image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchExtras {
    target: Option<String>,
    vars: Vec<(String, String)>,
}

impl LaunchExtras {
    /// No extras for any service.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(target: impl Into<String>, vars: Vec<(String, String)>) -> Self {
        Self {
            target: Some(target.into()),
            vars,
        }
    }

    /// Collect every variable in `names` that is set in the current
    /// environment.  Unset variables are skipped.
    pub fn from_env(target: impl Into<String>, names: &[String]) -> Self {
        let vars = names
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect();
        Self::new(target, vars)
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    /// Full argument list for `descriptor`: its own arguments, followed by the
    /// extras when the descriptor's image is the target.
    pub fn args_for(&self, descriptor: &ServiceDescriptor) -> Vec<String> {
        let mut args = descriptor.args.clone();
        if self.target.as_deref() == Some(descriptor.image_name()) {
            for (name, value) in &self.vars {
                args.extend(["-e".to_string(), name.clone(), value.clone()]);
            }
        }
        args
    }
}

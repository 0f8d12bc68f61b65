//! [`ServiceSet`] – the validated service list for one run.

use std::collections::HashSet;
use std::sync::Arc;

use keel_types::{KeelError, ServiceDescriptor};

/// Ordered, name-unique collection of service descriptors.
///
/// Descriptors are shared (`Arc`) with the process handles created from
/// them, so a restart never copies the definition.
#[derive(Debug, Clone, Default)]
pub struct ServiceSet {
    services: Vec<Arc<ServiceDescriptor>>,
}

impl ServiceSet {
    /// Validate `descriptors`, keeping their order.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::DuplicateService`] for the first repeated name.
    pub fn new(descriptors: Vec<ServiceDescriptor>) -> Result<Self, KeelError> {
        let mut seen = HashSet::with_capacity(descriptors.len());
        for d in &descriptors {
            if !seen.insert(d.name.as_str()) {
                return Err(KeelError::DuplicateService(d.name.clone()));
            }
        }
        Ok(Self {
            services: descriptors.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServiceDescriptor>> {
        self.services.iter()
    }

    /// The descriptor whose expected image name is `image`, if any.
    pub fn by_image(&self, image: &str) -> Option<&Arc<ServiceDescriptor>> {
        self.services.iter().find(|d| d.image_name() == image)
    }
}

impl IntoIterator for ServiceSet {
    type Item = Arc<ServiceDescriptor>;
    type IntoIter = std::vec::IntoIter<Arc<ServiceDescriptor>>;

    fn into_iter(self) -> Self::IntoIter {
        self.services.into_iter()
    }
}

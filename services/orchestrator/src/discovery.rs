//! Lookup of definitions that were never registered.
//!
//! When a start names an unknown service and asks for discovery, the manager
//! consults a [`ServiceDiscovery`] and registers whatever it returns.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::definition::ServiceDefinition;

#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// The definition for `name`, if this source knows one.
    async fn discover(&self, name: &str) -> Option<ServiceDefinition>;
}

/// In-memory catalog of definitions available for discovery.
#[derive(Default)]
pub struct CatalogDiscovery {
    entries: RwLock<HashMap<String, ServiceDefinition>>,
}

impl CatalogDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, definition: ServiceDefinition) -> Self {
        self.insert(definition);
        self
    }

    /// Adds or replaces the entry for the definition's name.
    pub fn insert(&self, definition: ServiceDefinition) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(definition.name.clone(), definition);
    }

    pub fn remove(&self, name: &str) -> Option<ServiceDefinition> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ServiceDiscovery for CatalogDiscovery {
    async fn discover(&self, name: &str) -> Option<ServiceDefinition> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catalog_lookup() {
        let catalog = CatalogDiscovery::new().with(ServiceDefinition::new("worker", "run"));
        assert_eq!(catalog.len(), 1);
        assert_eq!(
            catalog.discover("worker").await.map(|d| d.name),
            Some("worker".to_string())
        );
        assert!(catalog.discover("web-1").await.is_none());

        catalog.remove("worker");
        assert!(catalog.is_empty());
    }
}

//! Registry of adapter implementations the host can choose between.

use std::sync::Arc;

use crate::config::AdapterConfig;
use crate::error::{AdapterError, AdapterResult};
use crate::traits::StorageAdapter;

/// What an adapter implementation offers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub name: String,
    /// Entries outlive the process.
    pub persistent: bool,
}

impl AdapterCapabilities {
    pub fn new(name: impl Into<String>, persistent: bool) -> Self {
        Self {
            name: name.into(),
            persistent,
        }
    }
}

/// Builds an adapter from its configuration.
pub type AdapterFactory =
    Box<dyn Fn(AdapterConfig) -> AdapterResult<Arc<dyn StorageAdapter>> + Send + Sync>;

struct Registration {
    capabilities: AdapterCapabilities,
    factory: AdapterFactory,
}

/// Adapter implementations known to the host, in registration order.
#[derive(Default)]
pub struct AdapterRegistry {
    registrations: Vec<Registration>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an implementation. Names must be unique.
    pub fn register(
        &mut self,
        capabilities: AdapterCapabilities,
        factory: AdapterFactory,
    ) -> AdapterResult<()> {
        if self.get(&capabilities.name).is_some() {
            return Err(AdapterError::DuplicateAdapter(capabilities.name));
        }
        tracing::debug!(adapter = %capabilities.name, persistent = capabilities.persistent, "adapter registered");
        self.registrations.push(Registration {
            capabilities,
            factory,
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&AdapterCapabilities> {
        self.registrations
            .iter()
            .map(|r| &r.capabilities)
            .find(|c| c.name == name)
    }

    /// Capabilities of every registered implementation.
    pub fn list(&self) -> Vec<&AdapterCapabilities> {
        self.registrations.iter().map(|r| &r.capabilities).collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// Pick an implementation. With `prefer_persistent`, the first persistent
    /// one wins if there is any; otherwise the first registered.
    pub fn select(&self, prefer_persistent: bool) -> Option<&AdapterCapabilities> {
        let first = self.registrations.first().map(|r| &r.capabilities);
        if !prefer_persistent {
            return first;
        }
        self.registrations
            .iter()
            .map(|r| &r.capabilities)
            .find(|c| c.persistent)
            .or(first)
    }

    /// Build the implementation called `name`.
    pub fn create(
        &self,
        name: &str,
        config: AdapterConfig,
    ) -> AdapterResult<Arc<dyn StorageAdapter>> {
        let registration = self
            .registrations
            .iter()
            .find(|r| r.capabilities.name == name)
            .ok_or_else(|| AdapterError::UnknownAdapter(name.to_string()))?;
        (registration.factory)(config)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PersistentAdapter;
    use serde_json::json;
    use stash_store::MemoryBackend;

    fn unavailable() -> AdapterFactory {
        Box::new(|_config| Err(AdapterError::Config("not available here".into())))
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(AdapterCapabilities::new("memory", false), unavailable())
            .unwrap();
        let err = registry
            .register(AdapterCapabilities::new("memory", true), unavailable())
            .unwrap_err();
        assert!(matches!(err, AdapterError::DuplicateAdapter(name) if name == "memory"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn select_prefers_persistent_when_asked() {
        let mut registry = AdapterRegistry::new();
        assert!(registry.select(true).is_none());

        registry
            .register(AdapterCapabilities::new("memory", false), unavailable())
            .unwrap();
        assert_eq!(registry.select(true).unwrap().name, "memory");

        registry
            .register(PersistentAdapter::capabilities(), unavailable())
            .unwrap();
        assert_eq!(registry.select(true).unwrap().name, "persistent");
        assert_eq!(registry.select(false).unwrap().name, "memory");
    }

    #[test]
    fn unknown_adapter() {
        let registry = AdapterRegistry::new();
        let err = registry
            .create("nope", AdapterConfig::default())
            .err()
            .expect("create should fail");
        assert_eq!(err.to_string(), "unknown adapter: nope");
    }

    #[tokio::test]
    async fn creates_working_persistent_adapter() {
        let mut registry = AdapterRegistry::new();
        registry
            .register(
                PersistentAdapter::capabilities(),
                PersistentAdapter::factory(Arc::new(MemoryBackend::new())),
            )
            .unwrap();

        let name = registry.select(true).unwrap().name.clone();
        let adapter = registry
            .create(&name, AdapterConfig::new("registry", 10_000))
            .unwrap();
        assert_eq!(adapter.name(), "persistent");

        adapter.set_item("k", json!("v").into()).await.unwrap();
        assert_eq!(adapter.get_item("k").await.unwrap(), Some(json!("v")));
        adapter.sweep().await.unwrap();
    }
}

//! Store registry for resolving remote stores by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::RemoteStore;
use worldback_common::{Error, Result};

/// Factory function type for creating stores from JSON configuration.
pub type StoreFactory = Box<dyn Fn(Value) -> Result<Arc<dyn RemoteStore>> + Send + Sync>;

/// Normalize a store name: trimmed, lowercase, spaces as underscores.
///
/// `"Google Drive"` and `"google_drive"` resolve to the same entry.
pub fn normalize_name(name: &str) -> String {
    name.trim().to_lowercase().replace(' ', "_")
}

/// Registry for remote store factories.
///
/// Once [`lock`](Self::lock) has been called no further stores can be
/// registered, so the set of available stores is fixed after startup.
pub struct StoreRegistry {
    factories: HashMap<String, StoreFactory>,
    locked: bool,
}

impl StoreRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            locked: false,
        }
    }

    /// Register a store factory.
    ///
    /// # Preconditions
    /// - Registry is not locked
    /// - Normalized `name` is unique and non-empty
    ///
    /// # Errors
    /// - `NotPermitted` if the registry is locked
    /// - `AlreadyExists` if the name is already registered
    pub fn register(&mut self, name: &str, factory: StoreFactory) -> Result<()> {
        if self.locked {
            return Err(Error::NotPermitted(format!(
                "Cannot register store '{}': registry is locked",
                name
            )));
        }

        let key = normalize_name(name);
        if key.is_empty() {
            return Err(Error::InvalidInput("Store name is empty".to_string()));
        }
        if self.factories.contains_key(&key) {
            return Err(Error::AlreadyExists(format!(
                "Store '{}' is already registered",
                key
            )));
        }

        tracing::debug!("Registered store '{}'", key);
        self.factories.insert(key, factory);
        Ok(())
    }

    /// Prevent further registrations.
    pub fn lock(&mut self) {
        self.locked = true;
    }

    /// Whether the registry has been locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Resolve a store by name and configuration.
    ///
    /// # Errors
    /// - `NotFound` if no store is registered under the name
    /// - Whatever the factory returns for invalid configuration
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RemoteStore>> {
        let key = normalize_name(name);
        let factory = self
            .factories
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("Store '{}' is not registered", key)))?;
        factory(config)
    }

    /// Registered store names, sorted.
    pub fn stores(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a store is registered.
    pub fn has_store(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize_name(name))
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a locked registry with the built-in stores.
///
/// - `memory`: no configuration
/// - `local`: `{"root": "<dir>"}`
/// - `googledrive`: see [`crate::gdrive::GDriveConfig`]
pub fn create_default_registry() -> Result<StoreRegistry> {
    let mut registry = StoreRegistry::new();

    registry.register(
        "memory",
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStore::new()))),
    )?;

    registry.register(
        "local",
        Box::new(|config| {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    Error::InvalidInput("Local store requires 'root' path".to_string())
                })?;
            Ok(Arc::new(crate::local::LocalStore::new(root)?))
        }),
    )?;

    registry.register(
        "googledrive",
        Box::new(crate::gdrive::create_gdrive_store),
    )?;

    registry.lock();
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn memory_factory() -> StoreFactory {
        Box::new(|_| Ok(Arc::new(MemoryStore::new())))
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = StoreRegistry::new();
        registry.register("test", memory_factory()).unwrap();

        let store = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(store.name(), "memory");
    }

    #[test]
    fn test_names_are_normalized() {
        let mut registry = StoreRegistry::new();
        registry.register("  Google Drive ", memory_factory()).unwrap();

        assert!(registry.has_store("google_drive"));
        assert!(registry.has_store("GOOGLE DRIVE"));
        assert_eq!(registry.stores(), vec!["google_drive".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = StoreRegistry::new();
        registry.register("test", memory_factory()).unwrap();

        let result = registry.register("TEST", memory_factory());
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_locked_registry_rejects_registration() {
        let mut registry = StoreRegistry::new();
        registry.lock();

        let result = registry.register("test", memory_factory());
        assert!(matches!(result, Err(Error::NotPermitted(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = StoreRegistry::new();
        assert!(matches!(
            registry.resolve("unknown", Value::Null),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry().unwrap();
        assert!(registry.is_locked());
        assert_eq!(
            registry.stores(),
            vec![
                "googledrive".to_string(),
                "local".to_string(),
                "memory".to_string()
            ]
        );

        let temp = tempfile::TempDir::new().unwrap();
        let store = registry
            .resolve("local", serde_json::json!({ "root": temp.path() }))
            .unwrap();
        assert_eq!(store.name(), "local");

        assert!(registry.resolve("local", Value::Null).is_err());
    }
}

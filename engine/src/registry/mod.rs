//! Plugin registry
//!
//! In-memory catalog of loaded plugins keyed by id. No I/O and no locking of
//! its own; the loader holds it behind an `RwLock` and serialises work per
//! plugin id.

use crate::runtime::{CapabilityScope, PluginInstance};
use sdk::errors::EngineError;
use sdk::{Capability, PluginManifest};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A plugin that passed activation
///
/// Only `enabled` changes after registration.
pub struct LoadedPlugin {
    pub manifest: PluginManifest,
    pub enabled: bool,
    pub loaded_at: i64,
    /// Capabilities the plugin exposes, checked against the manifest
    pub methods: BTreeSet<Capability>,
    pub scope: CapabilityScope,
    pub instance: Arc<dyn PluginInstance>,
}

impl LoadedPlugin {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn summary(&self) -> PluginSummary {
        PluginSummary {
            id: self.manifest.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            author: self.manifest.author.clone(),
            enabled: self.enabled,
            loaded_at: self.loaded_at,
            methods: self.methods.iter().copied().collect(),
        }
    }
}

/// Read-only view of a loaded plugin for results and listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub enabled: bool,
    pub loaded_at: i64,
    pub methods: Vec<Capability>,
}

#[derive(Default)]
pub struct PluginRegistry {
    plugins: HashMap<String, LoadedPlugin>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, plugin_id: &str) -> bool {
        self.plugins.contains_key(plugin_id)
    }

    pub fn get(&self, plugin_id: &str) -> Option<&LoadedPlugin> {
        self.plugins.get(plugin_id)
    }

    pub fn get_mut(&mut self, plugin_id: &str) -> Option<&mut LoadedPlugin> {
        self.plugins.get_mut(plugin_id)
    }

    /// # Errors
    ///
    /// Returns `EngineError::PluginAlreadyLoaded` if the id is taken; the
    /// existing entry is left untouched.
    pub fn register(&mut self, plugin: LoadedPlugin) -> Result<(), EngineError> {
        let id = plugin.id().to_string();
        if self.plugins.contains_key(&id) {
            return Err(EngineError::PluginAlreadyLoaded(id));
        }
        self.plugins.insert(id, plugin);
        Ok(())
    }

    pub fn unregister(&mut self, plugin_id: &str) -> Option<LoadedPlugin> {
        self.plugins.remove(plugin_id)
    }

    /// Returns `false` if the plugin is not registered
    pub fn set_enabled(&mut self, plugin_id: &str, enabled: bool) -> bool {
        match self.plugins.get_mut(plugin_id) {
            Some(plugin) => {
                plugin.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// Summaries sorted by id
    pub fn list(&self) -> Vec<PluginSummary> {
        let mut summaries: Vec<_> = self.plugins.values().map(LoadedPlugin::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    pub fn ids(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::db::Database;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct NoopInstance;

    #[async_trait]
    impl PluginInstance for NoopInstance {
        async fn invoke(
            &self,
            _capability: Capability,
            input: &[u8],
        ) -> Result<Vec<u8>, EngineError> {
            Ok(input.to_vec())
        }

        async fn dispose(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn plugin(id: &str, audit: &AuditLogger) -> LoadedPlugin {
        LoadedPlugin {
            manifest: PluginManifest {
                id: id.to_string(),
                name: "Test".to_string(),
                version: "1.0.0".to_string(),
                ..Default::default()
            },
            enabled: false,
            loaded_at: 1,
            methods: BTreeSet::from([Capability::Ui]),
            scope: CapabilityScope::new(id, BTreeSet::from([Capability::Ui]), audit.clone()),
            instance: Arc::new(NoopInstance),
        }
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_id() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let audit = AuditLogger::new(db.audit());
        let mut registry = PluginRegistry::new();

        registry.register(plugin("com.example.a", &audit)).unwrap();
        let err = registry.register(plugin("com.example.a", &audit)).unwrap_err();

        assert!(matches!(err, EngineError::PluginAlreadyLoaded(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_enable_list_unregister() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let audit = AuditLogger::new(db.audit());
        let mut registry = PluginRegistry::new();

        registry.register(plugin("com.example.b", &audit)).unwrap();
        registry.register(plugin("com.example.a", &audit)).unwrap();

        assert!(registry.set_enabled("com.example.b", true));
        assert!(!registry.set_enabled("com.example.zzz", true));

        let listed = registry.list();
        assert_eq!(listed[0].id, "com.example.a");
        assert!(listed[1].enabled);

        assert!(registry.unregister("com.example.a").is_some());
        assert!(!registry.has("com.example.a"));
        assert!(registry.unregister("com.example.a").is_none());
    }
}

//! Manifest types for plugin identity and declared capabilities
//!
//! A manifest is shipped next to the plugin code as `plugin.json`. Required
//! fields deserialize to empty values when absent so that the engine's
//! validator can report every missing field at once instead of failing on
//! the first one.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use crate::types::UnknownVariant;

/// Closed set of capabilities a plugin may declare and the sandbox may invoke
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Capability {
    #[serde(rename = "editor")]
    Editor,
    #[serde(rename = "ai")]
    Ai,
    #[serde(rename = "ui")]
    Ui,
    #[serde(rename = "dataProcessor")]
    DataProcessor,
    #[serde(rename = "integration")]
    Integration,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::Editor,
        Capability::Ai,
        Capability::Ui,
        Capability::DataProcessor,
        Capability::Integration,
    ];

    /// Name used in manifests and as the sandbox export name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Editor => "editor",
            Self::Ai => "ai",
            Self::Ui => "ui",
            Self::DataProcessor => "dataProcessor",
            Self::Integration => "integration",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| UnknownVariant {
                kind: "capability",
                value: s.to_string(),
            })
    }
}

/// Plugin manifest (`plugin.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    /// Reverse-domain identifier, e.g. `com.example.word-count`
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    /// Entry reference; the WASM sandbox treats it as the activation export
    #[serde(default)]
    pub main: String,
    /// Declared capabilities; `None` when the manifest omits the object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_points: Option<BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    /// Plugin id to semver requirement
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_config: Option<serde_json::Value>,
}

impl PluginManifest {
    /// Parse manifest from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize manifest to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Canonical JSON bytes used for signature digests
    ///
    /// Field order is fixed by the struct and every map is ordered, so two
    /// equal manifests always produce identical bytes.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Capabilities that are both known and enabled
    pub fn declared_capabilities(&self) -> BTreeSet<Capability> {
        self.extension_points
            .iter()
            .flatten()
            .filter(|(_, enabled)| **enabled)
            .filter_map(|(name, _)| name.parse().ok())
            .collect()
    }

    /// Extension point keys that are not part of the capability allow-list
    pub fn unknown_extension_points(&self) -> Vec<&str> {
        self.extension_points
            .iter()
            .flatten()
            .map(|(name, _)| name.as_str())
            .filter(|name| name.parse::<Capability>().is_err())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "id": "com.example.word-count",
            "name": "Word Count",
            "version": "1.2.0",
            "description": "Counts words",
            "author": "Example Inc",
            "main": "activate",
            "extensionPoints": { "editor": true, "ui": false, "teleport": true }
        }"#
    }

    #[test]
    fn test_manifest_parse() {
        let manifest = PluginManifest::from_json(sample_json()).unwrap();

        assert_eq!(manifest.id, "com.example.word-count");
        assert_eq!(manifest.main, "activate");
        assert!(manifest.dependencies.is_empty());
    }

    #[test]
    fn test_missing_fields_default_to_empty() {
        let manifest = PluginManifest::from_json(r#"{"id": "com.example.x"}"#).unwrap();

        assert!(manifest.main.is_empty());
        assert!(manifest.extension_points.is_none());
    }

    #[test]
    fn test_declared_capabilities_skip_disabled_and_unknown() {
        let manifest = PluginManifest::from_json(sample_json()).unwrap();

        let caps = manifest.declared_capabilities();
        assert_eq!(caps.len(), 1);
        assert!(caps.contains(&Capability::Editor));
        assert_eq!(manifest.unknown_extension_points(), vec!["teleport"]);
    }

    #[test]
    fn test_canonical_bytes_are_stable() {
        let a = PluginManifest::from_json(sample_json()).unwrap();
        let json = a.to_json().unwrap();
        let b = PluginManifest::from_json(&json).unwrap();

        assert_eq!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
    }

    #[test]
    fn test_capability_names() {
        assert_eq!(
            "dataProcessor".parse::<Capability>().unwrap(),
            Capability::DataProcessor
        );
        assert!("data_processor".parse::<Capability>().is_err());
    }
}

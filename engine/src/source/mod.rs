//! Plugin source
//!
//! Where manifest and code bytes come from. The engine never scans the
//! filesystem itself; the signature service and the loader ask a
//! `PluginSource` for a plugin by id.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use sdk::PluginManifest;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Manifest file name inside a plugin directory
pub const MANIFEST_FILE: &str = "plugin.json";

/// Code file used when `<main>.wasm` is absent
pub const DEFAULT_CODE_FILE: &str = "plugin.wasm";

/// Manifest and code bytes for one plugin
#[derive(Debug, Clone)]
pub struct PluginBundle {
    pub manifest: PluginManifest,
    pub code: Vec<u8>,
}

/// Supplies plugin manifests and code
#[async_trait]
pub trait PluginSource: Send + Sync {
    /// Fetch the manifest and code for `plugin_id`
    async fn fetch(&self, plugin_id: &str) -> Result<PluginBundle>;

    /// Ids available from this source
    async fn list_ids(&self) -> Result<Vec<String>>;
}

/// Reads `<root>/<id>/plugin.json` plus `<root>/<id>/<main>.wasm`
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn plugin_dir(&self, plugin_id: &str) -> Result<PathBuf> {
        // Ids become path components; refuse anything that could escape the root
        if plugin_id.is_empty()
            || plugin_id.contains(['/', '\\'])
            || plugin_id.starts_with('.')
        {
            bail!("Invalid plugin id for directory lookup: {:?}", plugin_id);
        }
        Ok(self.root.join(plugin_id))
    }

    async fn code_path(dir: &Path, main: &str) -> Option<PathBuf> {
        if !main.is_empty() && !main.contains(['/', '\\']) {
            let named = dir.join(format!("{}.wasm", main));
            if tokio::fs::try_exists(&named).await.unwrap_or(false) {
                return Some(named);
            }
        }
        let fallback = dir.join(DEFAULT_CODE_FILE);
        if tokio::fs::try_exists(&fallback).await.unwrap_or(false) {
            return Some(fallback);
        }
        None
    }
}

#[async_trait]
impl PluginSource for DirectorySource {
    async fn fetch(&self, plugin_id: &str) -> Result<PluginBundle> {
        let dir = self.plugin_dir(plugin_id)?;
        let manifest_path = dir.join(MANIFEST_FILE);

        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .with_context(|| format!("Failed to read manifest: {}", manifest_path.display()))?;
        let manifest = PluginManifest::from_json(&raw)
            .with_context(|| format!("Failed to parse manifest: {}", manifest_path.display()))?;

        let code_path = Self::code_path(&dir, &manifest.main)
            .await
            .with_context(|| format!("No plugin code found in {}", dir.display()))?;
        let code = tokio::fs::read(&code_path)
            .await
            .with_context(|| format!("Failed to read plugin code: {}", code_path.display()))?;

        debug!(
            "Fetched plugin {} ({} bytes of code) from {}",
            plugin_id,
            code.len(),
            dir.display()
        );

        Ok(PluginBundle { manifest, code })
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();

        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read plugins directory: {}", self.root.display())
                })
            }
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if !tokio::fs::try_exists(entry.path().join(MANIFEST_FILE))
                .await
                .unwrap_or(false)
            {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                ids.push(name.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn write_plugin(root: &Path, id: &str, main: &str, code_file: &str) {
        let dir = root.join(id);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let manifest = serde_json::json!({
            "id": id,
            "name": "Test",
            "version": "1.0.0",
            "description": "test plugin",
            "author": "tester",
            "main": main,
            "extensionPoints": { "ui": true }
        });
        tokio::fs::write(dir.join(MANIFEST_FILE), manifest.to_string())
            .await
            .unwrap();
        tokio::fs::write(dir.join(code_file), b"\0asm").await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_prefers_main_named_module() {
        let temp_dir = TempDir::new().unwrap();
        write_plugin(temp_dir.path(), "com.example.a", "activate", "activate.wasm").await;

        let source = DirectorySource::new(temp_dir.path());
        let bundle = source.fetch("com.example.a").await.unwrap();

        assert_eq!(bundle.manifest.id, "com.example.a");
        assert_eq!(bundle.code, b"\0asm");
    }

    #[tokio::test]
    async fn test_fetch_falls_back_to_plugin_wasm() {
        let temp_dir = TempDir::new().unwrap();
        write_plugin(temp_dir.path(), "com.example.b", "activate", DEFAULT_CODE_FILE).await;

        let source = DirectorySource::new(temp_dir.path());
        assert!(source.fetch("com.example.b").await.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_rejects_path_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let source = DirectorySource::new(temp_dir.path());

        assert!(source.fetch("../etc").await.is_err());
        assert!(source.fetch("a/b").await.is_err());
    }

    #[tokio::test]
    async fn test_list_ids_skips_dirs_without_manifest() {
        let temp_dir = TempDir::new().unwrap();
        write_plugin(temp_dir.path(), "com.example.b", "m", DEFAULT_CODE_FILE).await;
        write_plugin(temp_dir.path(), "com.example.a", "m", DEFAULT_CODE_FILE).await;
        tokio::fs::create_dir_all(temp_dir.path().join("empty"))
            .await
            .unwrap();

        let source = DirectorySource::new(temp_dir.path());
        assert_eq!(
            source.list_ids().await.unwrap(),
            vec!["com.example.a".to_string(), "com.example.b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_root_lists_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let source = DirectorySource::new(temp_dir.path().join("nope"));
        assert!(source.list_ids().await.unwrap().is_empty());
    }
}

//! WASM sandbox backed by Extism
//!
//! Plugin code is a WASM module. The guest exports:
//!
//! - the function named by `manifest.main`, called once with
//!   `{"pluginId", "capabilities", "config"}` and returning
//!   `{"methods": [...]}`
//! - one function per capability it implements, named after the capability
//! - optionally `dispose`
//!
//! The guest can call the host function `warden_authorize(capability)`,
//! which answers `"ok"` or `"denied"` from the plugin's `CapabilityScope`.
//!
//! Extism calls are synchronous, so every call runs on the blocking pool.
//! The Extism manifest timeout bounds guest execution even when the
//! awaiting side has already given up.

use super::{Activation, ActivationRequest, CapabilityScope, PluginInstance, Sandbox};
use async_trait::async_trait;
use extism::{
    CurrentPlugin, Function, Manifest as ExtismManifest, Plugin, UserData, Val, Wasm, PTR,
};
use sdk::errors::EngineError;
use sdk::Capability;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Optional export called on unload
pub const DISPOSE_EXPORT: &str = "dispose";

/// Host function exposed to guests
pub const AUTHORIZE_HOST_FN: &str = "warden_authorize";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ActivationInput<'a> {
    plugin_id: &'a str,
    capabilities: Vec<&'static str>,
    config: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct ActivationOutput {
    #[serde(default)]
    methods: Vec<String>,
}

/// Extism-backed `Sandbox`
pub struct WasmSandbox {
    execution_timeout: Duration,
}

impl WasmSandbox {
    /// `execution_timeout` bounds every guest call, activation included
    pub fn new(execution_timeout: Duration) -> Self {
        Self { execution_timeout }
    }
}

#[allow(clippy::needless_pass_by_value)] // Signature required by Extism callback API
fn warden_authorize_impl(
    plugin: &mut CurrentPlugin,
    inputs: &[Val],
    outputs: &mut [Val],
    user_data: UserData<CapabilityScope>,
) -> Result<(), extism::Error> {
    let requested: String = plugin.memory_get_val(&inputs[0])?;

    let ud = user_data.get()?;
    let scope = ud
        .lock()
        .map_err(|e| extism::Error::msg(format!("capability scope lock poisoned: {e}")))?;

    let answer = match requested.parse::<Capability>() {
        Ok(capability) if scope.authorize(capability).is_ok() => "ok",
        Ok(_) => "denied",
        Err(_) => {
            tracing::warn!(
                "Plugin {} asked for unknown capability '{}'",
                scope.plugin_id(),
                requested
            );
            "denied"
        }
    };
    drop(scope);

    let mem = plugin.memory_new(answer)?;
    outputs[0] = plugin.memory_to_val(mem);
    Ok(())
}

fn host_functions(scope: CapabilityScope) -> Vec<Function> {
    vec![Function::new(
        AUTHORIZE_HOST_FN,
        [PTR],
        [PTR],
        UserData::new(scope),
        warden_authorize_impl,
    )]
}

/// Whether a missing export is an error or a no-op
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Export {
    Required,
    Optional,
}

/// Run one guest export on the blocking pool
///
/// The instance lock is only ever taken inside the blocking task, so a long
/// guest call never stalls an async worker.
async fn call_export(
    plugin: Arc<Mutex<Plugin>>,
    plugin_id: String,
    export: String,
    input: Vec<u8>,
    kind: Export,
) -> Result<Vec<u8>, EngineError> {
    tokio::task::spawn_blocking(move || {
        let mut plugin = plugin.lock().map_err(|_| {
            EngineError::Plugin(format!("Plugin '{}' instance lock poisoned", plugin_id))
        })?;

        if kind == Export::Optional && !plugin.function_exists(&export) {
            return Ok(Vec::new());
        }

        plugin
            .call::<&[u8], Vec<u8>>(&export, &input)
            .map_err(|e| {
                tracing::error!("Plugin '{}' export '{}' failed: {}", plugin_id, export, e);
                EngineError::Plugin(format!("Export '{}' failed: {}", export, e))
            })
    })
    .await
    .map_err(|e| EngineError::Plugin(format!("Plugin call task failed: {}", e)))?
}

#[async_trait]
impl Sandbox for WasmSandbox {
    fn name(&self) -> &str {
        "wasm"
    }

    async fn activate(&self, request: ActivationRequest) -> Result<Activation, EngineError> {
        let ActivationRequest {
            manifest,
            code,
            api,
            config,
        } = request;

        let plugin_id = manifest.id.clone();
        let timeout = self.execution_timeout;
        let host_fns = host_functions(api.clone());

        tracing::info!("Instantiating WASM module for '{}'", plugin_id);

        let plugin = tokio::task::spawn_blocking(move || {
            let extism_manifest = ExtismManifest::new([Wasm::data(code)]).with_timeout(timeout);
            Plugin::new(&extism_manifest, host_fns, true)
        })
        .await
        .map_err(|e| EngineError::Activation(format!("Instantiation task failed: {}", e)))?
        .map_err(|e| {
            tracing::error!("Failed to create Extism plugin for '{}': {}", plugin_id, e);
            EngineError::Activation(format!("Failed to instantiate module: {}", e))
        })?;

        if !plugin.function_exists(&manifest.main) {
            return Err(EngineError::Activation(format!(
                "Module does not export entry function '{}'",
                manifest.main
            )));
        }

        let input = serde_json::to_vec(&ActivationInput {
            plugin_id: &plugin_id,
            capabilities: api.granted().iter().map(|c| c.as_str()).collect(),
            config: &config,
        })
        .map_err(|e| {
            EngineError::Activation(format!("Failed to encode activation input: {}", e))
        })?;

        let plugin = Arc::new(Mutex::new(plugin));
        let output = call_export(
            plugin.clone(),
            plugin_id.clone(),
            manifest.main.clone(),
            input,
            Export::Required,
        )
        .await
            .map_err(|e| EngineError::Activation(e.to_string()))?;

        let parsed: ActivationOutput = serde_json::from_slice(&output).map_err(|e| {
            EngineError::Activation(format!(
                "Entry function must return {{\"methods\": [...]}}: {}",
                e
            ))
        })?;

        Ok(Activation {
            methods: parsed.methods,
            instance: Box::new(WasmInstance { plugin_id, plugin }),
        })
    }
}

/// A live Extism plugin
pub struct WasmInstance {
    plugin_id: String,
    plugin: Arc<Mutex<Plugin>>,
}

#[async_trait]
impl PluginInstance for WasmInstance {
    async fn invoke(&self, capability: Capability, input: &[u8]) -> Result<Vec<u8>, EngineError> {
        tracing::debug!("Calling '{}' on plugin '{}'", capability, self.plugin_id);

        call_export(
            self.plugin.clone(),
            self.plugin_id.clone(),
            capability.as_str().to_string(),
            input.to_vec(),
            Export::Required,
        )
        .await
    }

    async fn dispose(&self) -> Result<(), EngineError> {
        call_export(
            self.plugin.clone(),
            self.plugin_id.clone(),
            DISPOSE_EXPORT.to_string(),
            Vec::new(),
            Export::Optional,
        )
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::db::Database;
    use sdk::PluginManifest;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_garbage_module_fails_activation() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let audit = AuditLogger::new(db.audit());

        let manifest = PluginManifest {
            id: "com.example.garbage".to_string(),
            main: "activate".to_string(),
            extension_points: Some(BTreeMap::from([("ui".to_string(), true)])),
            ..Default::default()
        };

        let sandbox = WasmSandbox::new(Duration::from_secs(5));
        let result = sandbox
            .activate(ActivationRequest {
                api: CapabilityScope::new(
                    manifest.id.clone(),
                    BTreeSet::from([Capability::Ui]),
                    audit,
                ),
                manifest,
                code: b"definitely not wasm".to_vec(),
                config: serde_json::json!({}),
            })
            .await;

        assert!(matches!(result, Err(EngineError::Activation(_))));
    }

    /// Smallest valid module: magic and version, no exports
    const EMPTY_MODULE: &[u8] = b"\0asm\x01\0\0\0";

    fn empty_instance() -> WasmInstance {
        let manifest = ExtismManifest::new([Wasm::data(EMPTY_MODULE.to_vec())]);
        let plugin = Plugin::new(&manifest, Vec::<Function>::new(), true).unwrap();
        WasmInstance {
            plugin_id: "com.example.empty".to_string(),
            plugin: Arc::new(Mutex::new(plugin)),
        }
    }

    #[tokio::test]
    async fn test_dispose_without_export_is_noop() {
        let instance = empty_instance();

        instance.dispose().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispose_does_not_block_on_busy_instance() {
        let instance = empty_instance();
        let plugin = instance.plugin.clone();

        // Hold the instance lock the way a long guest call would
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _busy = plugin.lock().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(1_500));
        });
        locked_rx.recv().unwrap();

        let started = std::time::Instant::now();
        let outcome = tokio::time::timeout(Duration::from_millis(100), instance.dispose()).await;

        assert!(outcome.is_err(), "dispose should still be waiting on the blocking pool");
        assert!(started.elapsed() < Duration::from_millis(1_000));

        holder.join().unwrap();
    }

    #[test]
    fn test_activation_input_shape() {
        let config = serde_json::json!({ "theme": "dark" });
        let input = ActivationInput {
            plugin_id: "com.example.a",
            capabilities: vec!["editor", "ui"],
            config: &config,
        };

        let json = serde_json::to_value(&input).unwrap();
        assert_eq!(json["pluginId"], "com.example.a");
        assert_eq!(json["capabilities"][1], "ui");
        assert_eq!(json["config"]["theme"], "dark");
    }
}

//! Plugin loader
//!
//! The only component with a lifecycle state machine:
//!
//! ```text
//! unloaded -> validating -> verifying -> activating -> loaded
//!                 |             |             |
//!                 +-------------+-------------+--> failed
//! ```
//!
//! `verifying` is skipped unless a signature is required. `failed` is
//! absorbing for that attempt; a later load starts again from `validating`.
//!
//! Load, unload and reload for the same id are serialised by a per-id async
//! mutex so at most one live instance exists per id. None of the public
//! lifecycle operations return `Err`; failures are reported in the result.

use crate::audit::AuditLogger;
use crate::config::LoaderConfig;
use crate::db::now_millis;
use crate::message_bus::{Event, MessageBus};
use crate::rate_limiter::RateLimiter;
use crate::registry::{LoadedPlugin, PluginRegistry, PluginSummary};
use crate::runtime::{ActivationRequest, CapabilityScope, PluginInstance, Sandbox};
use crate::signature::SignatureService;
use crate::source::PluginSource;
use crate::validator::ManifestValidator;
use futures::FutureExt;
use sdk::errors::EngineError;
use sdk::{Capability, PluginManifest, Severity, VerificationResult};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the most recent attempt for a plugin id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Validating,
    Verifying,
    Activating,
    Loaded,
    Failed,
}

impl LoadState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Validating => "validating",
            Self::Verifying => "verifying",
            Self::Activating => "activating",
            Self::Loaded => "loaded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for LoadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for one load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadOptions {
    pub enable_immediately: bool,
    pub require_signature: bool,
    /// Passed to the entry function; falls back to the manifest's
    /// `defaultConfig`
    pub config: Option<serde_json::Value>,
    /// Recorded on verification and audit entries
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<PluginSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub state: LoadState,
}

impl LoadResult {
    fn loaded(plugin: PluginSummary) -> Self {
        Self {
            success: true,
            plugin: Some(plugin),
            error: None,
            state: LoadState::Loaded,
        }
    }

    fn failed(error: &EngineError) -> Self {
        Self {
            success: false,
            plugin: None,
            error: Some(error.to_string()),
            state: LoadState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnloadResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Dispose problem that did not stop the unload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

/// Orchestrates validate, verify, activate and register
pub struct PluginLoader {
    registry: Arc<RwLock<PluginRegistry>>,
    validator: ManifestValidator,
    signatures: SignatureService,
    sandbox: Arc<dyn Sandbox>,
    audit: AuditLogger,
    rate_limiter: Arc<RateLimiter>,
    config: LoaderConfig,
    bus: Option<Arc<MessageBus>>,
    source: Option<Arc<dyn PluginSource>>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    states: Mutex<HashMap<String, LoadState>>,
    last_options: Mutex<HashMap<String, LoadOptions>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PluginLoader {
    pub fn new(
        registry: Arc<RwLock<PluginRegistry>>,
        signatures: SignatureService,
        sandbox: Arc<dyn Sandbox>,
        audit: AuditLogger,
        rate_limiter: Arc<RateLimiter>,
        config: LoaderConfig,
    ) -> Result<Self, EngineError> {
        let validator = ManifestValidator::new()
            .map_err(|e| EngineError::Config(format!("Failed to build validator: {}", e)))?;

        Ok(Self {
            registry,
            validator,
            signatures,
            sandbox,
            audit,
            rate_limiter,
            config,
            bus: None,
            source: None,
            locks: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
            last_options: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_message_bus(mut self, bus: Arc<MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Source used by `reload_plugin` when no code is passed
    pub fn with_source(mut self, source: Arc<dyn PluginSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn registry(&self) -> Arc<RwLock<PluginRegistry>> {
        self.registry.clone()
    }

    /// State reached by the latest attempt for `plugin_id`
    pub fn state_of(&self, plugin_id: &str) -> LoadState {
        guard(&self.states)
            .get(plugin_id)
            .copied()
            .unwrap_or(LoadState::Unloaded)
    }

    fn set_state(&self, plugin_id: &str, state: LoadState) {
        debug!("Plugin {} -> {}", plugin_id, state);
        guard(&self.states).insert(plugin_id.to_string(), state);
    }

    fn lock_for(&self, plugin_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        guard(&self.locks)
            .entry(plugin_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop the per-id lock once no other call holds or waits on it
    ///
    /// Called after unloads and rejected loads, with the caller's guard
    /// already released. A later call for the id starts a fresh lock.
    fn release_lock(&self, plugin_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = guard(&self.locks);
        let idle = locks
            .get(plugin_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &lock) && Arc::strong_count(&lock) == 2);
        if idle {
            locks.remove(plugin_id);
        }
    }

    /// Number of ids with a live per-id lock
    pub fn tracked_ids(&self) -> usize {
        guard(&self.locks).len()
    }

    async fn publish(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event).await;
        }
    }

    fn activation_timeout(&self) -> Duration {
        Duration::from_millis(self.config.activation_timeout_ms)
    }

    fn dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.config.dispose_timeout_ms)
    }

    fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.config.execution_timeout_ms)
    }

    /// Run the load path for a manifest and its code
    pub async fn load_plugin(
        &self,
        manifest: PluginManifest,
        code: Vec<u8>,
        options: LoadOptions,
    ) -> LoadResult {
        let plugin_id = manifest.id.clone();
        let lock = self.lock_for(&plugin_id);
        let result = {
            let _held = lock.lock().await;
            self.load_locked(manifest, code, options).await
        };
        if !result.success {
            self.release_lock(&plugin_id, lock);
        }
        result
    }

    async fn load_locked(
        &self,
        manifest: PluginManifest,
        code: Vec<u8>,
        options: LoadOptions,
    ) -> LoadResult {
        let plugin_id = manifest.id.clone();

        // A live instance keeps its state; the new attempt never starts
        if self.registry.read().await.has(&plugin_id) {
            let e = EngineError::PluginAlreadyLoaded(plugin_id.clone());
            warn!("Rejected load of {}: {}", plugin_id, e);
            return LoadResult::failed(&e);
        }

        match self.try_load(manifest, code, &options).await {
            Ok(summary) => {
                self.set_state(&plugin_id, LoadState::Loaded);
                guard(&self.last_options).insert(plugin_id.clone(), options);
                info!("Plugin {} loaded (enabled: {})", plugin_id, summary.enabled);
                self.publish(Event::PluginLoaded {
                    plugin_id,
                    enabled: summary.enabled,
                })
                .await;
                LoadResult::loaded(summary)
            }
            Err(e) => {
                self.set_state(&plugin_id, LoadState::Failed);
                warn!("Plugin {} failed to load: {}", plugin_id, e);
                self.publish(Event::PluginLoadFailed {
                    plugin_id,
                    error: e.to_string(),
                })
                .await;
                LoadResult::failed(&e)
            }
        }
    }

    async fn try_load(
        &self,
        manifest: PluginManifest,
        code: Vec<u8>,
        options: &LoadOptions,
    ) -> Result<PluginSummary, EngineError> {
        let plugin_id = manifest.id.clone();
        let user_id = options.user_id.as_deref();

        // validating
        self.set_state(&plugin_id, LoadState::Validating);

        let report = self.validator.validate(&manifest);
        for warning in &report.warnings {
            warn!("Manifest warning for {}: {}", plugin_id, warning);
        }
        if !report.valid {
            return Err(EngineError::Validation(report.errors));
        }

        // verifying
        if options.require_signature || self.config.require_signature {
            self.set_state(&plugin_id, LoadState::Verifying);
            let outcome = self
                .signatures
                .verify(&plugin_id, &manifest, &code, None, user_id)
                .await;

            let detail = outcome.error_message.unwrap_or_default();
            match outcome.result {
                VerificationResult::Valid => {}
                VerificationResult::Missing => {
                    return Err(EngineError::SignatureMissing(plugin_id))
                }
                VerificationResult::Invalid => return Err(EngineError::SignatureInvalid(detail)),
                VerificationResult::Error => {
                    return Err(EngineError::SignatureVerification(detail))
                }
            }
        }

        // activating
        self.set_state(&plugin_id, LoadState::Activating);
        let scope = CapabilityScope::for_manifest(&manifest, self.audit.clone());
        let config = options
            .config
            .clone()
            .or_else(|| manifest.default_config.clone())
            .unwrap_or_else(|| serde_json::json!({}));

        let request = ActivationRequest {
            manifest: manifest.clone(),
            code,
            api: scope.clone(),
            config,
        };

        let limit = self.activation_timeout();
        let activation = match tokio::time::timeout(
            limit,
            AssertUnwindSafe(self.sandbox.activate(request)).catch_unwind(),
        )
        .await
        {
            Ok(Ok(Ok(activation))) => activation,
            Ok(Ok(Err(e))) => {
                let e = match e {
                    EngineError::Activation(_) => e,
                    other => EngineError::Activation(other.to_string()),
                };
                self.audit
                    .log_plugin_error(&plugin_id, user_id, &e.to_string(), Severity::Medium);
                return Err(e);
            }
            Ok(Err(_panic)) => {
                error!("Sandbox '{}' panicked activating {}", self.sandbox.name(), plugin_id);
                let e = EngineError::Activation("sandbox panicked during activation".to_string());
                self.audit
                    .log_plugin_error(&plugin_id, user_id, &e.to_string(), Severity::High);
                return Err(e);
            }
            Err(_) => {
                let e = EngineError::Timeout {
                    operation: "activation".to_string(),
                    limit_ms: limit.as_millis() as u64,
                };
                self.audit
                    .log_plugin_error(&plugin_id, user_id, &e.to_string(), Severity::High);
                return Err(e);
            }
        };

        let instance: Arc<dyn PluginInstance> = Arc::from(activation.instance);

        let methods = match Self::check_methods(&activation.methods, &scope) {
            Ok(methods) => methods,
            Err(e) => {
                self.audit
                    .log_plugin_error(&plugin_id, user_id, &e.to_string(), Severity::Medium);
                self.dispose_quietly(&plugin_id, instance.as_ref()).await;
                return Err(e);
            }
        };

        // loaded
        let loaded = LoadedPlugin {
            manifest,
            enabled: options.enable_immediately,
            loaded_at: now_millis(),
            methods,
            scope,
            instance: instance.clone(),
        };
        let summary = loaded.summary();

        let registered = self.registry.write().await.register(loaded);
        if let Err(e) = registered {
            self.dispose_quietly(&plugin_id, instance.as_ref()).await;
            return Err(e);
        }

        Ok(summary)
    }

    /// Methods must be known capabilities within the declared extension points
    fn check_methods(
        methods: &[String],
        scope: &CapabilityScope,
    ) -> Result<BTreeSet<Capability>, EngineError> {
        let mut checked = BTreeSet::new();

        for method in methods {
            let capability: Capability = method.parse().map_err(|_| {
                EngineError::Activation(format!("activation returned unknown method '{}'", method))
            })?;
            if !scope.allows(capability) {
                return Err(EngineError::Activation(format!(
                    "method '{}' is not a declared extension point",
                    method
                )));
            }
            checked.insert(capability);
        }

        Ok(checked)
    }

    async fn dispose_quietly(&self, plugin_id: &str, instance: &dyn PluginInstance) {
        match tokio::time::timeout(self.dispose_timeout(), instance.dispose()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Dispose of rejected plugin {} failed: {}", plugin_id, e),
            Err(_) => debug!("Dispose of rejected plugin {} timed out", plugin_id),
        }
    }

    /// Dispose and unregister a plugin
    ///
    /// Unregistration happens even when `dispose()` fails or times out.
    pub async fn unload_plugin(&self, plugin_id: &str) -> UnloadResult {
        let lock = self.lock_for(plugin_id);
        let result = {
            let _held = lock.lock().await;
            self.unload_locked(plugin_id).await
        };
        self.release_lock(plugin_id, lock);
        result
    }

    async fn unload_locked(&self, plugin_id: &str) -> UnloadResult {
        let instance = match self.registry.read().await.get(plugin_id) {
            Some(plugin) => plugin.instance.clone(),
            None => {
                warn!("Unload requested for {} which is not loaded", plugin_id);
                return UnloadResult {
                    success: false,
                    error: Some(EngineError::PluginNotLoaded(plugin_id.to_string()).to_string()),
                    warning: None,
                };
            }
        };

        let limit = self.dispose_timeout();
        let warning = match tokio::time::timeout(limit, instance.dispose()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => {
                warn!("Dispose failed for {}: {}", plugin_id, e);
                self.audit.log_plugin_error(
                    plugin_id,
                    None,
                    &format!("dispose failed: {}", e),
                    Severity::Medium,
                );
                Some(e.to_string())
            }
            Err(_) => {
                let e = EngineError::Timeout {
                    operation: "dispose".to_string(),
                    limit_ms: limit.as_millis() as u64,
                };
                warn!("Forcing unload of {}: {}", plugin_id, e);
                self.audit
                    .log_plugin_terminated(plugin_id, None, &e.to_string(), Severity::High);
                self.publish(Event::PluginTerminated {
                    plugin_id: plugin_id.to_string(),
                    reason: e.to_string(),
                })
                .await;
                Some(e.to_string())
            }
        };

        self.registry.write().await.unregister(plugin_id);
        self.rate_limiter.reset(plugin_id);
        guard(&self.states).remove(plugin_id);
        guard(&self.last_options).remove(plugin_id);

        info!("Plugin {} unloaded", plugin_id);
        self.publish(Event::PluginUnloaded {
            plugin_id: plugin_id.to_string(),
        })
        .await;

        UnloadResult {
            success: true,
            error: None,
            warning,
        }
    }

    /// Unload if loaded, then load again from `validating`
    ///
    /// Reuses the registered manifest and the options of the last successful
    /// load. Code comes from `code` or, when absent, from the plugin source.
    pub async fn reload_plugin(&self, plugin_id: &str, code: Option<Vec<u8>>) -> LoadResult {
        let lock = self.lock_for(plugin_id);
        let result = {
            let _held = lock.lock().await;
            self.reload_locked(plugin_id, code).await
        };
        if !result.success {
            self.release_lock(plugin_id, lock);
        }
        result
    }

    async fn reload_locked(&self, plugin_id: &str, code: Option<Vec<u8>>) -> LoadResult {
        let previous = self
            .registry
            .read()
            .await
            .get(plugin_id)
            .map(|p| p.manifest.clone());
        let options = guard(&self.last_options)
            .get(plugin_id)
            .cloned()
            .unwrap_or_default();

        if previous.is_some() {
            let unloaded = self.unload_locked(plugin_id).await;
            if let Some(warning) = unloaded.warning {
                debug!("Ignoring unload problem during reload of {}: {}", plugin_id, warning);
            }
        }

        let (manifest, code) = match (previous, code) {
            (Some(manifest), Some(code)) => (manifest, code),
            (previous, code) => match self.fetch(plugin_id).await {
                Ok(bundle) => (
                    previous.unwrap_or(bundle.manifest),
                    code.unwrap_or(bundle.code),
                ),
                Err(e) => {
                    self.set_state(plugin_id, LoadState::Failed);
                    return LoadResult::failed(&e);
                }
            },
        };

        self.load_locked(manifest, code, options).await
    }

    async fn fetch(&self, plugin_id: &str) -> Result<crate::source::PluginBundle, EngineError> {
        let source = self.source.as_ref().ok_or_else(|| {
            EngineError::Config(format!(
                "No code supplied for {} and no plugin source configured",
                plugin_id
            ))
        })?;
        source
            .fetch(plugin_id)
            .await
            .map_err(|e| EngineError::Plugin(format!("{:#}", e)))
    }

    /// Call one capability on a loaded plugin
    ///
    /// Checks, in order: loaded and enabled, capability granted, rate limits.
    /// The call runs under the execution timeout and is audited either way.
    pub async fn invoke(
        &self,
        plugin_id: &str,
        capability: Capability,
        input: &[u8],
        user_id: Option<&str>,
    ) -> Result<Vec<u8>, EngineError> {
        let (scope, instance, exposed) = {
            let registry = self.registry.read().await;
            let plugin = registry
                .get(plugin_id)
                .ok_or_else(|| EngineError::PluginNotLoaded(plugin_id.to_string()))?;
            if !plugin.enabled {
                return Err(EngineError::PluginDisabled(plugin_id.to_string()));
            }
            (
                plugin.scope.clone(),
                plugin.instance.clone(),
                plugin.methods.contains(&capability),
            )
        };

        scope.authorize_for(capability, user_id)?;
        if !exposed {
            return Err(EngineError::Plugin(format!(
                "{} does not implement '{}'",
                plugin_id, capability
            )));
        }

        let _permit = match self.rate_limiter.check_api_call(plugin_id) {
            Ok(permit) => permit,
            Err(e) => {
                if let EngineError::RateLimitExceeded {
                    reason,
                    retry_after_ms,
                    ..
                } = &e
                {
                    self.audit.log_rate_limit_violation(
                        plugin_id,
                        user_id,
                        capability.as_str(),
                        reason,
                        *retry_after_ms,
                    );
                }
                return Err(e);
            }
        };

        let started = Instant::now();
        let limit = self.execution_timeout();
        let result = match tokio::time::timeout(limit, instance.invoke(capability, input)).await {
            Ok(result) => result,
            Err(_) => {
                let limit_ms = limit.as_millis() as u64;
                self.audit
                    .log_execution_timeout(plugin_id, user_id, capability.as_str(), limit_ms);
                Err(EngineError::Timeout {
                    operation: format!("{} call", capability),
                    limit_ms,
                })
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => self.audit.log_api_call(
                plugin_id,
                user_id,
                capability.as_str(),
                true,
                duration_ms,
                None,
            ),
            Err(e) => self.audit.log_api_call(
                plugin_id,
                user_id,
                capability.as_str(),
                false,
                duration_ms,
                Some(&e.to_string()),
            ),
        }

        result
    }

    /// Reserve storage for a loaded plugin and audit the access
    pub async fn reserve_storage(
        &self,
        plugin_id: &str,
        operation: &str,
        bytes: u64,
        user_id: Option<&str>,
    ) -> Result<(), EngineError> {
        if !self.registry.read().await.has(plugin_id) {
            return Err(EngineError::PluginNotLoaded(plugin_id.to_string()));
        }

        let used = self.rate_limiter.usage(plugin_id).storage_bytes;
        let result = self.rate_limiter.check_storage(plugin_id, bytes);
        self.audit.log_storage_access(
            plugin_id,
            user_id,
            operation,
            used.saturating_add(bytes),
            Some(self.rate_limiter.max_storage_bytes()),
        );
        result
    }

    pub async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<(), EngineError> {
        if self.registry.write().await.set_enabled(plugin_id, enabled) {
            info!("Plugin {} enabled: {}", plugin_id, enabled);
            Ok(())
        } else {
            Err(EngineError::PluginNotLoaded(plugin_id.to_string()))
        }
    }

    pub async fn is_loaded(&self, plugin_id: &str) -> bool {
        self.registry.read().await.has(plugin_id)
    }

    pub async fn list(&self) -> Vec<PluginSummary> {
        self.registry.read().await.list()
    }

    /// Unload every registered plugin concurrently
    pub async fn unload_all(&self) -> Vec<(String, UnloadResult)> {
        let ids = self.registry.read().await.ids();
        info!("Unloading {} plugins", ids.len());

        let unloads = ids.into_iter().map(|id| async move {
            let result = self.unload_plugin(&id).await;
            (id, result)
        });
        futures::future::join_all(unloads).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_state_names() {
        assert_eq!(LoadState::Verifying.to_string(), "verifying");
        assert_eq!(
            serde_json::to_value(LoadState::Failed).unwrap(),
            serde_json::json!("failed")
        );
    }

    #[test]
    fn test_failed_result_carries_message() {
        let result = LoadResult::failed(&EngineError::Validation(vec![
            "manifest.main is required".to_string(),
        ]));

        assert!(!result.success);
        assert!(result.plugin.is_none());
        assert_eq!(result.state, LoadState::Failed);
        assert!(result.error.unwrap().contains("manifest.main"));
    }
}

//! Sandbox contract for executing plugin code
//!
//! The loader never runs plugin code directly. It hands manifest, code and a
//! `CapabilityScope` to a `Sandbox`, which returns the capability table the
//! plugin exposes plus an instance handle that owns invocation and
//! disposal.
//!
//! `WasmSandbox` is the shipped implementation; hosts may supply their own.

use crate::audit::AuditLogger;
use async_trait::async_trait;
use sdk::errors::EngineError;
use sdk::{Capability, PluginManifest};
use std::collections::BTreeSet;

pub mod wasm;

pub use wasm::WasmSandbox;

/// Capability-scoped API handed to a plugin at activation
///
/// The granted set is the manifest's enabled extension points. Every check
/// that fails is recorded as an `unauthorized_access_attempt`.
#[derive(Clone)]
pub struct CapabilityScope {
    plugin_id: String,
    granted: BTreeSet<Capability>,
    audit: AuditLogger,
}

impl CapabilityScope {
    pub fn new(
        plugin_id: impl Into<String>,
        granted: BTreeSet<Capability>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            granted,
            audit,
        }
    }

    /// Scope granting exactly the manifest's enabled, known extension points
    pub fn for_manifest(manifest: &PluginManifest, audit: AuditLogger) -> Self {
        Self::new(manifest.id.clone(), manifest.declared_capabilities(), audit)
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn granted(&self) -> &BTreeSet<Capability> {
        &self.granted
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }

    /// # Errors
    ///
    /// Returns `EngineError::CapabilityDenied` when `capability` was not
    /// declared, after recording the attempt.
    pub fn authorize(&self, capability: Capability) -> Result<(), EngineError> {
        self.authorize_for(capability, None)
    }

    pub fn authorize_for(
        &self,
        capability: Capability,
        user_id: Option<&str>,
    ) -> Result<(), EngineError> {
        if self.allows(capability) {
            return Ok(());
        }

        tracing::warn!(
            "Plugin {} attempted undeclared capability '{}'",
            self.plugin_id,
            capability
        );
        self.audit
            .log_unauthorized_access(&self.plugin_id, user_id, capability);

        Err(EngineError::CapabilityDenied {
            plugin_id: self.plugin_id.clone(),
            capability: capability.to_string(),
        })
    }
}

/// Everything a sandbox needs to activate one plugin
pub struct ActivationRequest {
    pub manifest: PluginManifest,
    pub code: Vec<u8>,
    pub api: CapabilityScope,
    pub config: serde_json::Value,
}

/// What a successful activation returns
///
/// `methods` is raw; the loader checks it against the capability set and
/// the manifest before anything is registered.
pub struct Activation {
    pub methods: Vec<String>,
    pub instance: Box<dyn PluginInstance>,
}

/// A live plugin instance inside a sandbox
#[async_trait]
pub trait PluginInstance: Send + Sync {
    /// Run one capability with opaque input bytes
    async fn invoke(&self, capability: Capability, input: &[u8]) -> Result<Vec<u8>, EngineError>;

    /// Release everything the instance holds
    async fn dispose(&self) -> Result<(), EngineError>;
}

/// Isolated execution environment for plugin code
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Instantiate the plugin and call its entry function
    async fn activate(&self, request: ActivationRequest) -> Result<Activation, EngineError>;
}

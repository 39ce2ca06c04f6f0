//! Warden SDK
//!
//! Shared vocabulary for the Warden plugin security engine: the plugin
//! manifest model, the closed capability set, security enums and the error
//! taxonomy. Host applications depend on this crate to describe plugins
//! without pulling in the engine.

/// Error types and handling
pub mod errors;

/// Security enums (severity, event and alert types, statuses)
pub mod types;

/// Manifest types
pub mod manifest;

// Re-export commonly used types
pub use errors::{EngineError, WardenErrorExt};
pub use manifest::{Capability, PluginManifest};
pub use types::{
    AlertStatus, AlertType, AuditEventType, Severity, SignatureAlgorithm, UnknownVariant,
    VerificationResult,
};

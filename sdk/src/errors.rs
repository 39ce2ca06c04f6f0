//! Error types and handling
//!
//! This module provides the error types used throughout the Warden engine.
//! All errors implement the `WardenErrorExt` trait which provides
//! operator-facing hints and indicates whether errors are recoverable.
//!
//! # Taxonomy
//!
//! - **Validation**: the manifest is malformed
//! - **Signature**: missing, invalid, or unverifiable signature
//! - **Activation**: the plugin entry point failed or returned the wrong shape
//! - **Timeout**: dispose or execution exceeded its bound
//! - **Storage**: audit/alert persistence failure
//!
//! Validation, signature and activation errors end a load attempt and are
//! reported in the loader's result. Storage errors are logged and swallowed
//! wherever they would otherwise fail a plugin operation.

use thiserror::Error;

/// Trait for Warden error extensions
///
/// This trait provides additional context for errors, including
/// operator-facing hints and recoverability information.
pub trait WardenErrorExt {
    /// Returns a short hint that is safe to display to end users
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors require the plugin or its signature to change.
    fn is_recoverable(&self) -> bool;
}

/// Main engine error type
///
/// # Examples
///
/// ```
/// use sdk::errors::{EngineError, WardenErrorExt};
///
/// let error = EngineError::Validation(vec!["manifest.main is required".to_string()]);
/// assert!(error.to_string().contains("manifest.main"));
/// assert!(!error.is_recoverable());
///
/// let timeout = EngineError::Timeout { operation: "dispose".to_string(), limit_ms: 5000 };
/// assert!(timeout.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum EngineError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Manifest errors
    #[error("Manifest validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    // Signature errors
    #[error("No signature on record for plugin {0}")]
    SignatureMissing(String),

    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Signature verification error: {0}")]
    SignatureVerification(String),

    #[error("Malformed key: {0}")]
    MalformedKey(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    // Lifecycle errors
    #[error("Activation failed: {0}")]
    Activation(String),

    #[error("{operation} timed out after {limit_ms}ms")]
    Timeout { operation: String, limit_ms: u64 },

    #[error("Plugin not loaded: {0}")]
    PluginNotLoaded(String),

    #[error("Plugin already loaded: {0}")]
    PluginAlreadyLoaded(String),

    #[error("Plugin disabled: {0}")]
    PluginDisabled(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    // Capability and quota errors
    #[error("Plugin {plugin_id} is not permitted to use capability '{capability}'")]
    CapabilityDenied {
        plugin_id: String,
        capability: String,
    },

    #[error("Rate limit exceeded for {plugin_id}: {reason}")]
    RateLimitExceeded {
        plugin_id: String,
        reason: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Storage quota exceeded for {plugin_id}: {used} + {requested} > {limit} bytes")]
    StorageQuotaExceeded {
        plugin_id: String,
        used: u64,
        requested: u64,
        limit: u64,
    },

    // Alert errors
    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    #[error("Alert cannot move from {from} to {to}")]
    InvalidAlertTransition { from: String, to: String },

    // Persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Short category name used in logs and CLI output
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Validation(_) => "validation",
            Self::SignatureMissing(_)
            | Self::SignatureInvalid(_)
            | Self::SignatureVerification(_)
            | Self::MalformedKey(_)
            | Self::KeyGeneration(_) => "signature",
            Self::Activation(_) => "activation",
            Self::Timeout { .. } => "timeout",
            Self::PluginNotLoaded(_)
            | Self::PluginAlreadyLoaded(_)
            | Self::PluginDisabled(_)
            | Self::Plugin(_) => "plugin",
            Self::CapabilityDenied { .. } => "capability",
            Self::RateLimitExceeded { .. } | Self::StorageQuotaExceeded { .. } => "quota",
            Self::AlertNotFound(_) | Self::InvalidAlertTransition { .. } => "alert",
            Self::Storage(_) | Self::Io(_) => "storage",
        }
    }
}

impl WardenErrorExt for EngineError {
    fn user_hint(&self) -> &str {
        match self {
            Self::Config(_) => "Check your config.toml file for errors",

            Self::Validation(_) => "Fix the listed plugin.json fields and try again",

            Self::SignatureMissing(_) => "Sign the plugin with 'warden sign' before loading",
            Self::SignatureInvalid(_) => "Plugin code changed after signing. It may be tampered",
            Self::SignatureVerification(_) => "Signature or key could not be parsed",
            Self::MalformedKey(_) => "Key is not in the expected format",
            Self::KeyGeneration(_) => "Key generation failed. Try again",

            Self::Activation(_) => "Plugin failed to start. Check plugin logs",
            Self::Timeout { .. } => "Plugin took too long to respond",
            Self::PluginNotLoaded(_) => "Plugin is not loaded",
            Self::PluginAlreadyLoaded(_) => "Unload or reload the plugin instead",
            Self::PluginDisabled(_) => "Enable the plugin before calling it",
            Self::Plugin(_) => "Plugin execution failed. Check plugin logs",

            Self::CapabilityDenied { .. } => "Plugin did not declare this capability",
            Self::RateLimitExceeded { .. } => "Rate limit exceeded. Wait before trying again",
            Self::StorageQuotaExceeded { .. } => "Plugin storage quota exhausted",

            Self::AlertNotFound(_) => "No alert with that id",
            Self::InvalidAlertTransition { .. } => "Resolved and dismissed alerts are final",

            Self::Storage(_) => "Database operation failed. Check the data directory",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            Self::Validation(_)
            | Self::SignatureInvalid(_)
            | Self::CapabilityDenied { .. }
            | Self::InvalidAlertTransition { .. } => false,

            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_every_error() {
        let err = EngineError::Validation(vec![
            "manifest.name is required".to_string(),
            "manifest.main is required".to_string(),
        ]);

        let msg = err.to_string();
        assert!(msg.contains("manifest.name"));
        assert!(msg.contains("manifest.main"));
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn test_signature_errors_share_kind() {
        assert_eq!(
            EngineError::SignatureMissing("com.a.b".into()).kind(),
            "signature"
        );
        assert_eq!(
            EngineError::SignatureInvalid("digest mismatch".into()).kind(),
            "signature"
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(!EngineError::SignatureInvalid("x".into()).is_recoverable());
        assert!(EngineError::Storage("locked".into()).is_recoverable());
        assert!(EngineError::Timeout {
            operation: "dispose".into(),
            limit_ms: 10
        }
        .is_recoverable());
    }

    #[test]
    fn test_every_error_has_hint() {
        let errors = vec![
            EngineError::Config("x".into()),
            EngineError::Activation("x".into()),
            EngineError::AlertNotFound("x".into()),
            EngineError::InvalidAlertTransition {
                from: "resolved".into(),
                to: "open".into(),
            },
        ];

        for e in errors {
            assert!(!e.user_hint().is_empty());
        }
    }
}

//! Warden Engine Library
//!
//! Plugin security core: manifest validation, code signing, sandboxed
//! loading, security auditing and anomaly alerting. It is used by both the
//! `warden` binary and integration tests.

/// Configuration management module
pub mod config;

/// Key generation, signing and verification primitives
pub mod crypto;

/// Signature service over the signature store
pub mod signature;

/// Manifest validation module
pub mod validator;

/// In-memory plugin registry
pub mod registry;

/// Security audit logger
pub mod audit;

/// Rate limiting module
pub mod rate_limiter;

/// Sandbox contract and the WASM sandbox
pub mod runtime;

/// Plugin loader state machine
pub mod loader;

/// Anomaly detection and alerting
pub mod alerts;

/// Message bus for lifecycle events
pub mod message_bus;

/// Plugin manifest and code sources
pub mod source;

/// Database persistence module
pub mod db;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

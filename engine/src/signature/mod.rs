//! Signature service
//!
//! Binds a plugin's manifest and code to a key pair and checks that binding
//! later. Signing replaces any prior signature for the plugin id. Every
//! verification attempt, whatever its outcome, appends one row to the
//! verification log.
//!
//! Private keys pass through this service and are never stored.

use crate::crypto::{self, KeyPair, SignedPayload};
use crate::db::{now_millis, SignatureRecord, SignatureRepository, VerificationRecord};
use crate::source::PluginSource;
use sdk::errors::EngineError;
use sdk::{PluginManifest, SignatureAlgorithm, VerificationResult};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of `sign`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignOutcome {
    pub signature: String,
    pub code_hash: String,
    pub signed_at: i64,
}

/// Result of `sign_plugin`
///
/// `public_key` and `private_key` are only set when a fresh pair was
/// generated for the call.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignPluginOutcome {
    pub signature: String,
    pub code_hash: String,
    pub signed_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// Result of a verification attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOutcome {
    pub result: VerificationResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl VerifyOutcome {
    fn new(result: VerificationResult, error_message: Option<String>) -> Self {
        Self {
            result,
            error_message,
        }
    }
}

/// Generate a key pair off the async executor
pub async fn generate_key_pair(algorithm: SignatureAlgorithm) -> Result<KeyPair, EngineError> {
    tokio::task::spawn_blocking(move || crypto::generate_key_pair(algorithm))
        .await
        .map_err(|e| EngineError::KeyGeneration(format!("Key generation task failed: {}", e)))?
}

/// Signing and verification over the signature store
#[derive(Clone)]
pub struct SignatureService {
    repo: SignatureRepository,
    source: Option<Arc<dyn PluginSource>>,
}

impl SignatureService {
    pub fn new(repo: SignatureRepository) -> Self {
        Self { repo, source: None }
    }

    /// Attach a plugin source for the `*_plugin` forms
    pub fn with_source(mut self, source: Arc<dyn PluginSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Sign a plugin's manifest and code, replacing any prior signature
    ///
    /// # Errors
    ///
    /// Returns `EngineError::MalformedKey` for an unusable private key and
    /// `EngineError::Storage` if the signature cannot be stored.
    pub async fn sign(
        &self,
        plugin_id: &str,
        manifest: &PluginManifest,
        code: &[u8],
        private_key: &str,
        algorithm: SignatureAlgorithm,
    ) -> Result<SignOutcome, EngineError> {
        let code_hash = crypto::code_digest(manifest, code)?;
        let signed_at = now_millis();

        let payload = SignedPayload {
            plugin_id,
            version: &manifest.version,
            code_hash: &code_hash,
            timestamp: signed_at,
            author: &manifest.author,
        }
        .to_bytes()?;

        let signature = crypto::sign_message(algorithm, private_key, &payload)?;
        let public_key = crypto::public_key_for(algorithm, private_key)?;

        self.repo
            .upsert_signature(&SignatureRecord {
                plugin_id: plugin_id.to_string(),
                algorithm,
                signature: signature.clone(),
                public_key,
                code_hash: code_hash.clone(),
                signed_at,
            })
            .await
            .map_err(|e| EngineError::Storage(format!("{:#}", e)))?;

        info!("Signed plugin {} with {}", plugin_id, algorithm);

        Ok(SignOutcome {
            signature,
            code_hash,
            signed_at,
        })
    }

    /// Verify a plugin's manifest and code against its stored signature
    ///
    /// `public_key` overrides the key stored with the signature. Exactly one
    /// verification log row is appended per call.
    pub async fn verify(
        &self,
        plugin_id: &str,
        manifest: &PluginManifest,
        code: &[u8],
        public_key: Option<&str>,
        user_id: Option<&str>,
    ) -> VerifyOutcome {
        let outcome = self.check(plugin_id, manifest, code, public_key).await;
        self.log_verification(plugin_id, user_id, &outcome).await;
        outcome
    }

    async fn check(
        &self,
        plugin_id: &str,
        manifest: &PluginManifest,
        code: &[u8],
        public_key: Option<&str>,
    ) -> VerifyOutcome {
        let stored = match self.repo.get_signature(plugin_id).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                return VerifyOutcome::new(
                    VerificationResult::Missing,
                    Some(EngineError::SignatureMissing(plugin_id.to_string()).to_string()),
                )
            }
            Err(e) => {
                warn!("Failed to read signature for {}: {:#}", plugin_id, e);
                return VerifyOutcome::new(
                    VerificationResult::Error,
                    Some(EngineError::Storage(format!("{:#}", e)).to_string()),
                );
            }
        };

        let current_hash = match crypto::code_digest(manifest, code) {
            Ok(hash) => hash,
            Err(e) => return VerifyOutcome::new(VerificationResult::Error, Some(e.to_string())),
        };

        if current_hash != stored.code_hash {
            debug!(
                "Digest mismatch for {}: signed {} current {}",
                plugin_id, stored.code_hash, current_hash
            );
            return VerifyOutcome::new(
                VerificationResult::Invalid,
                Some(
                    EngineError::SignatureInvalid(
                        "plugin contents changed since signing".to_string(),
                    )
                    .to_string(),
                ),
            );
        }

        let payload = match (SignedPayload {
            plugin_id,
            version: &manifest.version,
            code_hash: &stored.code_hash,
            timestamp: stored.signed_at,
            author: &manifest.author,
        })
        .to_bytes()
        {
            Ok(bytes) => bytes,
            Err(e) => return VerifyOutcome::new(VerificationResult::Error, Some(e.to_string())),
        };

        let key = public_key.unwrap_or(&stored.public_key);
        match crypto::verify_message(key, &payload, &stored.signature) {
            Ok(true) => VerifyOutcome::new(VerificationResult::Valid, None),
            Ok(false) => VerifyOutcome::new(
                VerificationResult::Invalid,
                Some(
                    EngineError::SignatureInvalid("signature does not match key".to_string())
                        .to_string(),
                ),
            ),
            Err(e) => VerifyOutcome::new(VerificationResult::Error, Some(e.to_string())),
        }
    }

    async fn log_verification(
        &self,
        plugin_id: &str,
        user_id: Option<&str>,
        outcome: &VerifyOutcome,
    ) {
        let record = VerificationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            plugin_id: plugin_id.to_string(),
            user_id: user_id.map(str::to_string),
            result: outcome.result,
            error_message: outcome.error_message.clone(),
            verified_at: now_millis(),
        };

        if let Err(e) = self.repo.insert_verification(&record).await {
            warn!("Failed to log verification for {}: {:#}", plugin_id, e);
        }
    }

    /// Sign a plugin fetched from the attached source
    ///
    /// With `generate_new_key_pair` a fresh pair is generated and returned
    /// alongside the signature; otherwise `private_key` is required.
    pub async fn sign_plugin(
        &self,
        plugin_id: &str,
        private_key: Option<&str>,
        algorithm: SignatureAlgorithm,
        generate_new_key_pair: bool,
    ) -> Result<SignPluginOutcome, EngineError> {
        let bundle = self.fetch(plugin_id).await?;

        if generate_new_key_pair {
            let pair = generate_key_pair(algorithm).await?;
            let signed = self
                .sign(plugin_id, &bundle.manifest, &bundle.code, pair.private_key(), algorithm)
                .await?;
            return Ok(SignPluginOutcome {
                signature: signed.signature,
                code_hash: signed.code_hash,
                signed_at: signed.signed_at,
                public_key: Some(pair.public_key.clone()),
                private_key: Some(pair.private_key().to_string()),
            });
        }

        let private_key = private_key.ok_or_else(|| {
            EngineError::SignatureVerification(
                "A private key is required unless a new key pair is generated".to_string(),
            )
        })?;

        let signed = self
            .sign(plugin_id, &bundle.manifest, &bundle.code, private_key, algorithm)
            .await?;
        Ok(SignPluginOutcome {
            signature: signed.signature,
            code_hash: signed.code_hash,
            signed_at: signed.signed_at,
            public_key: None,
            private_key: None,
        })
    }

    /// Verify a plugin fetched from the attached source with its stored key
    pub async fn verify_plugin(&self, plugin_id: &str, user_id: Option<&str>) -> VerifyOutcome {
        match self.fetch(plugin_id).await {
            Ok(bundle) => {
                self.verify(plugin_id, &bundle.manifest, &bundle.code, None, user_id)
                    .await
            }
            Err(e) => {
                let outcome = VerifyOutcome::new(VerificationResult::Error, Some(e.to_string()));
                self.log_verification(plugin_id, user_id, &outcome).await;
                outcome
            }
        }
    }

    /// Signature on record for a plugin
    pub async fn signature_for(
        &self,
        plugin_id: &str,
    ) -> Result<Option<SignatureRecord>, EngineError> {
        self.repo
            .get_signature(plugin_id)
            .await
            .map_err(|e| EngineError::Storage(format!("{:#}", e)))
    }

    /// Most recent verification attempts for a plugin, newest first
    pub async fn verification_history(
        &self,
        plugin_id: &str,
        limit: i64,
    ) -> Result<Vec<VerificationRecord>, EngineError> {
        self.repo
            .recent_verifications(plugin_id, limit)
            .await
            .map_err(|e| EngineError::Storage(format!("{:#}", e)))
    }

    async fn fetch(&self, plugin_id: &str) -> Result<crate::source::PluginBundle, EngineError> {
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| EngineError::Config("No plugin source configured".to_string()))?;
        source
            .fetch(plugin_id)
            .await
            .map_err(|e| EngineError::Plugin(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn manifest() -> PluginManifest {
        PluginManifest {
            id: "com.example.signed".to_string(),
            name: "Signed".to_string(),
            version: "1.0.0".to_string(),
            description: "signed plugin".to_string(),
            author: "Example".to_string(),
            main: "activate".to_string(),
            extension_points: Some(BTreeMap::from([("editor".to_string(), true)])),
            ..Default::default()
        }
    }

    async fn service(temp_dir: &TempDir) -> (Database, SignatureService) {
        let db = Database::new(&temp_dir.path().join("test.db")).await.unwrap();
        let service = SignatureService::new(db.signatures());
        (db, service)
    }

    #[tokio::test]
    async fn test_verify_without_signature_is_missing() {
        let temp_dir = TempDir::new().unwrap();
        let (db, service) = service(&temp_dir).await;

        let outcome = service
            .verify("com.example.signed", &manifest(), b"code", None, Some("alice"))
            .await;

        assert_eq!(outcome.result, VerificationResult::Missing);
        let history = db
            .signatures()
            .recent_verifications("com.example.signed", 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].user_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_sign_then_verify_then_tamper() {
        let temp_dir = TempDir::new().unwrap();
        let (_db, service) = service(&temp_dir).await;
        let pair = crypto::generate_key_pair(SignatureAlgorithm::Ed25519).unwrap();
        let m = manifest();

        service
            .sign(&m.id, &m, b"code", pair.private_key(), SignatureAlgorithm::Ed25519)
            .await
            .unwrap();

        let ok = service.verify(&m.id, &m, b"code", None, None).await;
        assert_eq!(ok.result, VerificationResult::Valid);
        assert!(ok.error_message.is_none());

        let tampered = service.verify(&m.id, &m, b"codf", None, None).await;
        assert_eq!(tampered.result, VerificationResult::Invalid);
    }

    #[tokio::test]
    async fn test_foreign_public_key_is_invalid_and_garbage_key_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let (_db, service) = service(&temp_dir).await;
        let signer = crypto::generate_key_pair(SignatureAlgorithm::Ed25519).unwrap();
        let other = crypto::generate_key_pair(SignatureAlgorithm::Ed25519).unwrap();
        let m = manifest();

        service
            .sign(&m.id, &m, b"code", signer.private_key(), SignatureAlgorithm::Ed25519)
            .await
            .unwrap();

        let foreign = service
            .verify(&m.id, &m, b"code", Some(&other.public_key), None)
            .await;
        assert_eq!(foreign.result, VerificationResult::Invalid);

        let garbage = service
            .verify(&m.id, &m, b"code", Some("ed25519:xyz"), None)
            .await;
        assert_eq!(garbage.result, VerificationResult::Error);
    }

    #[tokio::test]
    async fn test_sign_with_malformed_key_fails_without_storing() {
        let temp_dir = TempDir::new().unwrap();
        let (_db, service) = service(&temp_dir).await;
        let m = manifest();

        let err = service
            .sign(&m.id, &m, b"code", "ed25519:00", SignatureAlgorithm::Ed25519)
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::MalformedKey(_)));
        assert!(service.signature_for(&m.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sign_plugin_without_source_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let (_db, service) = service(&temp_dir).await;

        let err = service
            .sign_plugin("com.example.signed", None, SignatureAlgorithm::Ed25519, true)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}

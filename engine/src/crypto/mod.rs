//! Cryptographic primitives module
//!
//! This module provides the building blocks of the plugin trust chain:
//! - Ed25519 and RSA-2048 (PKCS#1 v1.5 / SHA-256) key generation
//! - SHA-256 digest over the canonical manifest plus code bytes
//! - Deterministic signed payloads
//! - Signing and verification of payload bytes
//!
//! Persistence and verification logging live in `crate::signature`; this
//! module has no I/O.
//!
//! # Encodings
//!
//! - Ed25519 keys: `ed25519:` followed by 32 bytes of hex
//! - RSA keys: PEM (PKCS#8 private key, SPKI public key)
//! - Signatures: `ed25519:<hex>` or `rsa:<hex>`

use ed25519_dalek::{
    Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey, PUBLIC_KEY_LENGTH,
    SECRET_KEY_LENGTH, SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use rsa::pkcs1v15::{
    Signature as RsaSignature, SigningKey as RsaSigningKey, VerifyingKey as RsaVerifyingKey,
};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer as _, Verifier as _};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sdk::errors::EngineError;
use sdk::{PluginManifest, SignatureAlgorithm};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, Zeroizing};

/// RSA modulus size for generated keys
pub const RSA_KEY_BITS: usize = 2048;

const ED25519_PREFIX: &str = "ed25519:";
const RSA_PREFIX: &str = "rsa:";
const PEM_MARKER: &str = "-----BEGIN";

/// Freshly generated key pair
///
/// The private key is handed to the caller exactly once and is wiped from
/// memory when the pair is dropped.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPair {
    pub algorithm: SignatureAlgorithm,
    pub public_key: String,
    private_key: String,
}

impl KeyPair {
    pub fn private_key(&self) -> &str {
        &self.private_key
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("algorithm", &self.algorithm)
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

impl Drop for KeyPair {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

/// The exact bytes that get signed for a plugin
///
/// Field order is part of the format and must not change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedPayload<'a> {
    pub plugin_id: &'a str,
    pub version: &'a str,
    pub code_hash: &'a str,
    pub timestamp: i64,
    pub author: &'a str,
}

impl SignedPayload<'_> {
    pub fn to_bytes(&self) -> Result<Vec<u8>, EngineError> {
        serde_json::to_vec(self).map_err(|e| {
            EngineError::SignatureVerification(format!("Failed to encode payload: {}", e))
        })
    }
}

/// Generate a key pair for the given algorithm
///
/// RSA generation is CPU-heavy; call it from `spawn_blocking` on async paths.
///
/// # Errors
///
/// Returns `EngineError::KeyGeneration` if the RNG or key encoding fails.
pub fn generate_key_pair(algorithm: SignatureAlgorithm) -> Result<KeyPair, EngineError> {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let signing_key = SigningKey::generate(&mut OsRng);
            let seed = Zeroizing::new(signing_key.to_bytes());

            Ok(KeyPair {
                algorithm,
                public_key: format!(
                    "{}{}",
                    ED25519_PREFIX,
                    hex::encode(signing_key.verifying_key().as_bytes())
                ),
                private_key: format!("{}{}", ED25519_PREFIX, hex::encode(&*seed)),
            })
        }
        SignatureAlgorithm::Rsa => {
            let private = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
                .map_err(|e| EngineError::KeyGeneration(e.to_string()))?;
            let private_pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| EngineError::KeyGeneration(e.to_string()))?;
            let public_pem = RsaPublicKey::from(&private)
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| EngineError::KeyGeneration(e.to_string()))?;

            Ok(KeyPair {
                algorithm,
                public_key: public_pem,
                private_key: private_pem.as_str().to_string(),
            })
        }
    }
}

/// SHA-256 over the canonical manifest bytes followed by the code, as hex
pub fn code_digest(manifest: &PluginManifest, code: &[u8]) -> Result<String, EngineError> {
    let manifest_bytes = manifest.canonical_bytes().map_err(|e| {
        EngineError::SignatureVerification(format!("Failed to canonicalize manifest: {}", e))
    })?;

    let mut hasher = Sha256::new();
    hasher.update(&manifest_bytes);
    hasher.update(code);
    Ok(hex::encode(hasher.finalize()))
}

/// Guess the algorithm of an encoded key
pub fn detect_algorithm(key: &str) -> Option<SignatureAlgorithm> {
    let key = key.trim();
    if key.starts_with(ED25519_PREFIX) {
        Some(SignatureAlgorithm::Ed25519)
    } else if key.starts_with(PEM_MARKER) {
        Some(SignatureAlgorithm::Rsa)
    } else if key.len() == SECRET_KEY_LENGTH * 2 && key.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(SignatureAlgorithm::Ed25519)
    } else {
        None
    }
}

/// Sign `message` with a private key, returning the encoded signature
///
/// # Errors
///
/// Returns `EngineError::MalformedKey` if the key cannot be parsed for the
/// requested algorithm.
pub fn sign_message(
    algorithm: SignatureAlgorithm,
    private_key: &str,
    message: &[u8],
) -> Result<String, EngineError> {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let signing_key = parse_ed25519_private(private_key)?;
            let signature = signing_key.sign(message);
            Ok(format!("{}{}", ED25519_PREFIX, hex::encode(signature.to_bytes())))
        }
        SignatureAlgorithm::Rsa => {
            let private = RsaPrivateKey::from_pkcs8_pem(private_key.trim())
                .map_err(|e| EngineError::MalformedKey(format!("Invalid RSA private key: {}", e)))?;
            let signing_key = RsaSigningKey::<Sha256>::new(private);
            let signature = signing_key
                .try_sign(message)
                .map_err(|e| EngineError::SignatureVerification(e.to_string()))?;
            Ok(format!("{}{}", RSA_PREFIX, hex::encode(signature.to_bytes())))
        }
    }
}

/// Derive the encoded public key that pairs with `private_key`
pub fn public_key_for(
    algorithm: SignatureAlgorithm,
    private_key: &str,
) -> Result<String, EngineError> {
    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let signing_key = parse_ed25519_private(private_key)?;
            Ok(format!(
                "{}{}",
                ED25519_PREFIX,
                hex::encode(signing_key.verifying_key().as_bytes())
            ))
        }
        SignatureAlgorithm::Rsa => {
            let private = RsaPrivateKey::from_pkcs8_pem(private_key.trim())
                .map_err(|e| EngineError::MalformedKey(format!("Invalid RSA private key: {}", e)))?;
            RsaPublicKey::from(&private)
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| EngineError::MalformedKey(e.to_string()))
        }
    }
}

/// Check `signature` over `message` against `public_key`
///
/// Returns `Ok(false)` when the inputs are well formed but the signature does
/// not match. Malformed keys or signatures are errors, so callers can tell
/// tampering apart from bad input.
///
/// # Errors
///
/// Returns `EngineError::MalformedKey` or `EngineError::SignatureVerification`
/// for unparseable input, or when the key and signature algorithms differ.
pub fn verify_message(
    public_key: &str,
    message: &[u8],
    signature: &str,
) -> Result<bool, EngineError> {
    let algorithm = detect_algorithm(public_key).ok_or_else(|| {
        EngineError::MalformedKey("Unrecognized public key encoding".to_string())
    })?;

    match algorithm {
        SignatureAlgorithm::Ed25519 => {
            let verifying_key = parse_ed25519_public(public_key)?;
            let signature = parse_ed25519_signature(signature)?;
            Ok(verifying_key.verify(message, &signature).is_ok())
        }
        SignatureAlgorithm::Rsa => {
            let public = RsaPublicKey::from_public_key_pem(public_key.trim())
                .map_err(|e| EngineError::MalformedKey(format!("Invalid RSA public key: {}", e)))?;
            let hex_sig = signature.strip_prefix(RSA_PREFIX).ok_or_else(|| {
                EngineError::SignatureVerification(
                    "Signature algorithm does not match public key".to_string(),
                )
            })?;
            let bytes = hex::decode(hex_sig).map_err(|e| {
                EngineError::SignatureVerification(format!("Invalid signature hex: {}", e))
            })?;
            let signature = RsaSignature::try_from(bytes.as_slice())
                .map_err(|e| EngineError::SignatureVerification(e.to_string()))?;
            let verifying_key = RsaVerifyingKey::<Sha256>::new(public);
            Ok(verifying_key.verify(message, &signature).is_ok())
        }
    }
}

/// Parse an Ed25519 private key in format "ed25519:hex_seed"
fn parse_ed25519_private(key: &str) -> Result<SigningKey, EngineError> {
    let hex_str = key.trim();
    let hex_str = hex_str.strip_prefix(ED25519_PREFIX).unwrap_or(hex_str);

    let bytes = Zeroizing::new(hex::decode(hex_str).map_err(|e| {
        EngineError::MalformedKey(format!("Invalid Ed25519 private key hex: {}", e))
    })?);

    let seed: &[u8; SECRET_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        EngineError::MalformedKey(format!(
            "Invalid Ed25519 private key length: expected {}, got {}",
            SECRET_KEY_LENGTH,
            bytes.len()
        ))
    })?;

    Ok(SigningKey::from_bytes(seed))
}

/// Parse an Ed25519 public key in format "ed25519:hex"
fn parse_ed25519_public(key: &str) -> Result<VerifyingKey, EngineError> {
    let hex_str = key.trim();
    let hex_str = hex_str.strip_prefix(ED25519_PREFIX).unwrap_or(hex_str);

    let bytes = hex::decode(hex_str).map_err(|e| {
        EngineError::MalformedKey(format!("Invalid Ed25519 public key hex: {}", e))
    })?;

    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        EngineError::MalformedKey(format!(
            "Invalid Ed25519 public key length: expected {}, got {}",
            PUBLIC_KEY_LENGTH,
            bytes.len()
        ))
    })?;

    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| EngineError::MalformedKey(format!("Invalid Ed25519 public key: {}", e)))
}

/// Parse a signature string in format "ed25519:hex_string"
fn parse_ed25519_signature(sig_str: &str) -> Result<Signature, EngineError> {
    if sig_str.starts_with(RSA_PREFIX) {
        return Err(EngineError::SignatureVerification(
            "Signature algorithm does not match public key".to_string(),
        ));
    }
    let hex_str = sig_str.strip_prefix(ED25519_PREFIX).unwrap_or(sig_str);

    let bytes = hex::decode(hex_str).map_err(|e| {
        tracing::error!("Failed to decode signature hex: {}", e);
        EngineError::SignatureVerification(format!("Invalid signature hex: {}", e))
    })?;

    let bytes: [u8; SIGNATURE_LENGTH] = bytes.as_slice().try_into().map_err(|_| {
        EngineError::SignatureVerification(format!(
            "Invalid signature length: expected {}, got {}",
            SIGNATURE_LENGTH,
            bytes.len()
        ))
    })?;

    Ok(Signature::from_bytes(&bytes))
}

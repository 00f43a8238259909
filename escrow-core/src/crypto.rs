//! Cryptographic operations for delegated authorization
//!
//! This module provides:
//! - Ed25519 key pairs whose verifying key doubles as the signer address
//! - Signing and verification over 32-byte structured digests

use crate::types::{Address, Hash32};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

/// Opaque signature bytes
///
/// 64 bytes for key signers; arbitrary for program signers, whose
/// validation logic defines the format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(Vec<u8>);

impl Signature {
    /// Create from bytes
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Get bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Ed25519 key pair for signing
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Address of this signer (the verifying key bytes)
    pub fn address(&self) -> Address {
        Address::from_bytes(self.verifying_key.to_bytes())
    }

    /// Sign a structured digest
    pub fn sign_digest(&self, digest: &Hash32) -> Signature {
        let signature = self.signing_key.sign(digest);
        Signature::from_bytes(signature.to_bytes().to_vec())
    }
}

/// Verify an ed25519 signature over `digest` against a signer address
///
/// Returns false for malformed keys or signatures instead of erroring: the
/// caller decides whether a program-based fallback applies.
pub fn verify_digest(digest: &Hash32, signature: &Signature, signer: &Address) -> bool {
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature.as_bytes()) else {
        return false;
    };
    let dalek_sig = DalekSignature::from_bytes(&sig_bytes);

    let verifying_key = match VerifyingKey::from_bytes(signer.as_bytes()) {
        Ok(key) => key,
        Err(_) => return false,
    };

    verifying_key.verify(digest, &dalek_sig).is_ok()
}

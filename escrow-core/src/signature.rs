//! Signature and replay guard for delegated additions
//!
//! A third-party seller authorizes an addition off-chain by signing a
//! structured digest over the payload, bound to a deployment-specific
//! domain separator. Verification tries key-based validation first; if that
//! fails and the declared seller is a program, the program itself is asked
//! to validate the signature. Each signer has a monotonic nonce that the
//! payload must match exactly; it is bumped by one on use.

use crate::config::SigningConfig;
use crate::crypto::{verify_digest, Signature};
use crate::hashing::{hash_bytes, CanonicalHasher};
use crate::types::{Address, Amount, AssetId, Hash32, ProcessId};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const DOMAIN_TAG: &[u8] = b"SRP/domain/v1";
const ADDITION_TAG: &[u8] = b"SRP/signed-addition/v1";

/// Binds digests to one deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainSeparator(Hash32);

impl DomainSeparator {
    /// Derive from signing config and the custody address
    pub fn new(config: &SigningConfig, custody: &Address) -> Self {
        let mut hasher = CanonicalHasher::new(DOMAIN_TAG);
        hasher
            .write_bytes(config.domain_name.as_bytes())
            .write_u64(config.chain_id)
            .write_address(custody);
        Self(hasher.finish())
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &Hash32 {
        &self.0
    }
}

/// Off-chain authorization for adding an SRP to a process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAddition {
    /// Target process
    pub process_id: ProcessId,
    /// Third-party seller (signer)
    pub seller: Address,
    /// Nominal amount contributed
    pub amount: Amount,
    /// Asset; must equal the process asset
    pub token: AssetId,
    /// Process cumulative value after this addition
    pub cumulative_value: Amount,
    /// Unix-seconds deadline
    pub deadline: u64,
    /// Signer nonce
    pub nonce: u64,
    /// Opaque metadata
    #[serde(default)]
    pub metadata: Vec<u8>,
}

impl SignedAddition {
    /// Structured digest the seller signs
    pub fn digest(&self, domain: &DomainSeparator) -> Hash32 {
        let mut inner = CanonicalHasher::new(ADDITION_TAG);
        inner
            .write_u64(self.process_id.0)
            .write_address(&self.seller)
            .write_u128(self.amount)
            .write_address(self.token.address())
            .write_u128(self.cumulative_value)
            .write_u64(self.deadline)
            .write_u64(self.nonce)
            .write_hash(&hash_bytes(&self.metadata));
        let struct_hash = inner.finish();

        // 0x19 0x01 prefix keeps these digests disjoint from any raw message
        let mut outer = Vec::with_capacity(66);
        outer.extend_from_slice(&[0x19, 0x01]);
        outer.extend_from_slice(domain.as_bytes());
        outer.extend_from_slice(&struct_hash);
        hash_bytes(&outer)
    }
}

/// Substrate capability: which addresses are programs, and their validation
pub trait ProgramRegistry: Send + Sync {
    /// Whether `address` denotes executable code
    fn is_program(&self, address: &Address) -> bool;

    /// Ask the program at `address` whether `signature` is valid for `digest`
    fn is_valid_signature(&self, address: &Address, digest: &Hash32, signature: &Signature)
        -> bool;
}

/// Registry with no programs
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrograms;

impl ProgramRegistry for NoPrograms {
    fn is_program(&self, _address: &Address) -> bool {
        false
    }

    fn is_valid_signature(&self, _: &Address, _: &Hash32, _: &Signature) -> bool {
        false
    }
}

/// In-memory registry of programs that accept a fixed set of digests
#[derive(Debug, Default)]
pub struct StaticProgramRegistry {
    approvals: parking_lot::RwLock<HashMap<Address, HashSet<Hash32>>>,
}

impl StaticProgramRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `address` as a program
    pub fn register(&self, address: Address) {
        self.approvals.write().entry(address).or_default();
    }

    /// Have the program at `address` approve `digest`
    pub fn approve_digest(&self, address: Address, digest: Hash32) {
        self.approvals.write().entry(address).or_default().insert(digest);
    }
}

impl ProgramRegistry for StaticProgramRegistry {
    fn is_program(&self, address: &Address) -> bool {
        self.approvals.read().contains_key(address)
    }

    fn is_valid_signature(&self, address: &Address, digest: &Hash32, _: &Signature) -> bool {
        self.approvals
            .read()
            .get(address)
            .is_some_and(|digests| digests.contains(digest))
    }
}

/// One way of validating a signer's signature
pub trait SignatureVerifier {
    /// Whether `signature` authorizes `digest` for `signer`
    fn verify(&self, signer: &Address, digest: &Hash32, signature: &Signature) -> bool;
}

/// Key-based validation: the address is the ed25519 verifying key
#[derive(Debug, Default, Clone, Copy)]
pub struct KeySigner;

impl SignatureVerifier for KeySigner {
    fn verify(&self, signer: &Address, digest: &Hash32, signature: &Signature) -> bool {
        verify_digest(digest, signature, signer)
    }
}

/// Capability-based validation delegated to the signer program
pub struct ProgramSigner<'a> {
    registry: &'a dyn ProgramRegistry,
}

impl<'a> ProgramSigner<'a> {
    /// Wrap a registry
    pub fn new(registry: &'a dyn ProgramRegistry) -> Self {
        Self { registry }
    }
}

impl SignatureVerifier for ProgramSigner<'_> {
    fn verify(&self, signer: &Address, digest: &Hash32, signature: &Signature) -> bool {
        self.registry.is_program(signer)
            && self.registry.is_valid_signature(signer, digest, signature)
    }
}

/// Verifies delegated-addition payloads
#[derive(Clone)]
pub struct SignatureGuard {
    domain: DomainSeparator,
    programs: Arc<dyn ProgramRegistry>,
}

impl std::fmt::Debug for SignatureGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureGuard")
            .field("domain", &self.domain)
            .finish()
    }
}

impl SignatureGuard {
    /// Create guard
    pub fn new(domain: DomainSeparator, programs: Arc<dyn ProgramRegistry>) -> Self {
        Self { domain, programs }
    }

    /// Domain separator in use
    pub fn domain(&self) -> &DomainSeparator {
        &self.domain
    }

    /// Check deadline and signature; returns the payload digest
    ///
    /// Expired payloads are rejected before the signature is looked at.
    pub fn verify(&self, payload: &SignedAddition, signature: &Signature, now: u64) -> Result<Hash32> {
        if payload.deadline < now {
            return Err(Error::Expired {
                deadline: payload.deadline,
                now,
            });
        }

        let digest = payload.digest(&self.domain);
        if KeySigner.verify(&payload.seller, &digest, signature) {
            return Ok(digest);
        }
        if ProgramSigner::new(self.programs.as_ref()).verify(&payload.seller, &digest, signature) {
            tracing::debug!(seller = %payload.seller, "Signature validated by program");
            return Ok(digest);
        }
        Err(Error::InvalidSignature(payload.seller))
    }
}

/// Require `declared` to equal the stored nonce, then bump it by one
pub fn consume_nonce(nonces: &mut HashMap<Address, u64>, signer: &Address, declared: u64) -> Result<()> {
    let stored = nonces.entry(*signer).or_insert(0);
    if *stored != declared {
        return Err(Error::InvalidNonce {
            signer: *signer,
            expected: *stored,
            actual: declared,
        });
    }
    *stored = stored.checked_add(1).ok_or(Error::Overflow("nonce"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    fn domain() -> DomainSeparator {
        DomainSeparator::new(&SigningConfig::default(), &Address::from_low_u64(0xC0))
    }

    fn payload(seller: Address) -> SignedAddition {
        SignedAddition {
            process_id: ProcessId(1),
            seller,
            amount: 500,
            token: AssetId::new(Address::from_low_u64(0xA0)),
            cumulative_value: 1500,
            deadline: 1_000,
            nonce: 0,
            metadata: b"order-17".to_vec(),
        }
    }

    #[test]
    fn test_key_signature_accepted() {
        let keypair = KeyPair::from_seed(&[1u8; 32]);
        let payload = payload(keypair.address());
        let signature = keypair.sign_digest(&payload.digest(&domain()));

        let guard = SignatureGuard::new(domain(), Arc::new(NoPrograms));
        assert!(guard.verify(&payload, &signature, 999).is_ok());
    }

    #[test]
    fn test_expired_rejected_even_if_valid() {
        let keypair = KeyPair::from_seed(&[1u8; 32]);
        let payload = payload(keypair.address());
        let signature = keypair.sign_digest(&payload.digest(&domain()));

        let guard = SignatureGuard::new(domain(), Arc::new(NoPrograms));
        assert!(matches!(
            guard.verify(&payload, &signature, 1_001),
            Err(Error::Expired { .. })
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let keypair = KeyPair::from_seed(&[1u8; 32]);
        let mut payload = payload(keypair.address());
        let signature = keypair.sign_digest(&payload.digest(&domain()));
        payload.amount += 1;

        let guard = SignatureGuard::new(domain(), Arc::new(NoPrograms));
        assert!(matches!(
            guard.verify(&payload, &signature, 0),
            Err(Error::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_domain_binding() {
        let keypair = KeyPair::from_seed(&[1u8; 32]);
        let payload = payload(keypair.address());
        let signature = keypair.sign_digest(&payload.digest(&domain()));

        let other = DomainSeparator::new(
            &SigningConfig {
                domain_name: "SRP Escrow".to_string(),
                chain_id: 2,
            },
            &Address::from_low_u64(0xC0),
        );
        let guard = SignatureGuard::new(other, Arc::new(NoPrograms));
        assert!(guard.verify(&payload, &signature, 0).is_err());
    }

    #[test]
    fn test_program_signer_fallback() {
        let program = Address::from_low_u64(0x5AFE);
        let payload = payload(program);
        let registry = Arc::new(StaticProgramRegistry::new());
        registry.approve_digest(program, payload.digest(&domain()));

        let guard = SignatureGuard::new(domain(), registry.clone());
        let opaque = Signature::from_bytes(b"multisig-bundle".to_vec());
        assert!(guard.verify(&payload, &opaque, 0).is_ok());

        // Program that did not approve this digest
        let other = Address::from_low_u64(0x5AFF);
        registry.register(other);
        assert!(guard.verify(&self::payload(other), &opaque, 0).is_err());
    }

    #[test]
    fn test_nonce_monotonic() {
        let signer = Address::from_low_u64(1);
        let mut nonces = HashMap::new();
        consume_nonce(&mut nonces, &signer, 0).unwrap();
        assert!(matches!(
            consume_nonce(&mut nonces, &signer, 0),
            Err(Error::InvalidNonce { expected: 1, actual: 0, .. })
        ));
        assert!(consume_nonce(&mut nonces, &signer, 2).is_err());
        consume_nonce(&mut nonces, &signer, 1).unwrap();
        assert_eq!(nonces[&signer], 2);
    }
}

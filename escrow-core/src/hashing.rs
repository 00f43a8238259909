//! Hash-chain linking and state versioning
//!
//! Each SRP carries a creation hash linking it to the previous chain tail of
//! its process, and every transition recomputes a version hash over
//! (creation hash, state code, escrowed balance). Consumers of state-change
//! reports deduplicate on (SRP id, version hash).
//!
//! All digests are SHA-256 over a canonical encoding: fixed field order,
//! fixed-width big-endian integers, raw 32-byte addresses.

use crate::types::{Address, Amount, AssetId, Hash32, SrpState};
use sha2::{Digest, Sha256};

/// Domain tags keep the two digest families disjoint
const CREATION_TAG: &[u8] = b"SRP/creation/v1";
const VERSION_TAG: &[u8] = b"SRP/version/v1";

/// Canonical field writer feeding a SHA-256 state
pub struct CanonicalHasher {
    hasher: Sha256,
}

impl CanonicalHasher {
    /// Create new hasher seeded with a domain tag
    pub fn new(tag: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update((tag.len() as u32).to_be_bytes());
        hasher.update(tag);
        Self { hasher }
    }

    /// Write raw 32 bytes
    pub fn write_hash(&mut self, hash: &Hash32) -> &mut Self {
        self.hasher.update(hash);
        self
    }

    /// Write an address
    pub fn write_address(&mut self, address: &Address) -> &mut Self {
        self.hasher.update(address.as_bytes());
        self
    }

    /// Write u8
    pub fn write_u8(&mut self, n: u8) -> &mut Self {
        self.hasher.update([n]);
        self
    }

    /// Write u64 (big-endian)
    pub fn write_u64(&mut self, n: u64) -> &mut Self {
        self.hasher.update(n.to_be_bytes());
        self
    }

    /// Write u128 (big-endian)
    pub fn write_u128(&mut self, n: u128) -> &mut Self {
        self.hasher.update(n.to_be_bytes());
        self
    }

    /// Write length-prefixed bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update((bytes.len() as u32).to_be_bytes());
        self.hasher.update(bytes);
        self
    }

    /// Finalize digest
    pub fn finish(self) -> Hash32 {
        self.hasher.finalize().into()
    }
}

/// Fields that define an SRP's place in its process chain
#[derive(Debug, Clone, Copy)]
pub struct ChainInput<'a> {
    /// Current chain tail of the process (zero for the root)
    pub previous_hash: &'a Hash32,
    /// Depositor
    pub seller: &'a Address,
    /// Counterparty
    pub buyer: &'a Address,
    /// Nominal amount
    pub amount: Amount,
    /// Asset
    pub token: &'a AssetId,
    /// Process cumulative value including this SRP
    pub cumulative_value: Amount,
}

/// Creation hash: digest(previous tail, seller, buyer, amount, asset, cumulative value)
pub fn creation_hash(input: &ChainInput<'_>) -> Hash32 {
    let mut hasher = CanonicalHasher::new(CREATION_TAG);
    hasher
        .write_hash(input.previous_hash)
        .write_address(input.seller)
        .write_address(input.buyer)
        .write_u128(input.amount)
        .write_address(input.token.address())
        .write_u128(input.cumulative_value);
    hasher.finish()
}

/// Version hash: digest(creation hash, state code, escrowed balance)
pub fn version_hash(creation_hash: &Hash32, state: SrpState, balance: Amount) -> Hash32 {
    let mut hasher = CanonicalHasher::new(VERSION_TAG);
    hasher
        .write_hash(creation_hash)
        .write_u8(state.code())
        .write_u128(balance);
    hasher.finish()
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

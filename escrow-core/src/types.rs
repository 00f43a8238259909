//! Core types for the escrow ledger
//!
//! All types are designed for:
//! - Deterministic hashing (fixed-width big-endian encodings)
//! - Exact arithmetic (integer token units, checked operations)
//! - Cheap undo (plain owned records, no pointers between them)

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Token units. All amounts are whole units of the asset.
pub type Amount = u128;

/// 32-byte digest
pub type Hash32 = [u8; 32];

/// Digest used as the chain tail of an empty process
pub const ZERO_HASH: Hash32 = [0u8; 32];

/// Party, custody or program address
///
/// For key-based signers the address is the ed25519 verifying key itself,
/// so verifying against the address is equivalent to recovering the signer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address([u8; 32]);

impl Address {
    /// The null address
    pub const ZERO: Address = Address([0u8; 32]);

    /// Create from raw bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Test helper: address whose last byte is `n`
    pub const fn from_low_u64(n: u64) -> Self {
        let mut bytes = [0u8; 32];
        let be = n.to_be_bytes();
        let mut i = 0;
        while i < 8 {
            bytes[24 + i] = be[i];
            i += 1;
        }
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Whether this is the null address
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps test output readable
        write!(f, "Address(0x{}…)", hex::encode(&self.0[..4]))
    }
}

impl FromStr for Address {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped)
            .map_err(|e| crate::Error::Config(format!("Invalid address {}: {}", s, e)))?;
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            crate::Error::Config(format!("Invalid address {}: expected 32 bytes", s))
        })?;
        Ok(Self(bytes))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_str(&s).map_err(de::Error::custom)
    }
}

/// Identifier of a value-transfer asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(Address);

impl AssetId {
    /// Create from the asset's address
    pub const fn new(address: Address) -> Self {
        Self(address)
    }

    /// Asset address
    pub fn address(&self) -> &Address {
        &self.0
    }

    /// Whether this is the null asset
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SRP identifier (globally unique, monotonically assigned)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SrpId(pub u64);

impl fmt::Display for SrpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "srp#{}", self.0)
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "process#{}", self.0)
    }
}

/// SRP lifecycle state
///
/// The numeric code is part of the version hash and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SrpState {
    /// Seller deposit escrowed, awaiting buyer
    Created = 0,
    /// Buyer deposit escrowed
    Locked = 1,
    /// Buyer share returned, seller may refund
    Released = 2,
    /// Seller paid out (terminal)
    Refunded = 3,
    /// Seller withdrew before lock (terminal)
    Cancelled = 4,
}

impl SrpState {
    /// Numeric state code
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Check if SRP is in terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, SrpState::Refunded | SrpState::Cancelled)
    }

    /// Stable label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            SrpState::Created => "created",
            SrpState::Locked => "locked",
            SrpState::Released => "released",
            SrpState::Refunded => "refunded",
            SrpState::Cancelled => "cancelled",
        }
    }
}

/// Service Request Process record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrpRecord {
    /// SRP id
    pub id: SrpId,

    /// Owning process
    pub process_id: ProcessId,

    /// Depositor
    pub seller: Address,

    /// Counterparty
    pub buyer: Address,

    /// Nominal value being exchanged
    pub amount: Amount,

    /// Value-transfer asset
    pub token: AssetId,

    /// Currently escrowed balance
    pub coordination_capital_balance: Amount,

    /// Lifecycle state
    pub state: SrpState,

    /// Chain link over the previous tail and this SRP's defining fields
    #[serde(with = "hex_hash")]
    pub creation_hash: Hash32,

    /// Previous SRP in the process chain (None for the root)
    pub previous_srp: Option<SrpId>,

    /// Chain tail hash this SRP was linked to
    #[serde(with = "hex_hash")]
    pub previous_hash: Hash32,

    /// Process cumulative value at the time this SRP was linked
    pub cumulative_at_creation: Amount,

    /// Last reported version hash
    #[serde(with = "hex_hash")]
    pub version_hash: Hash32,
}

impl SrpRecord {
    /// Recompute the version hash from stored fields
    pub fn compute_version_hash(&self) -> Hash32 {
        crate::hashing::version_hash(
            &self.creation_hash,
            self.state,
            self.coordination_capital_balance,
        )
    }

    /// Recompute the creation hash from stored fields
    pub fn compute_creation_hash(&self) -> Hash32 {
        crate::hashing::creation_hash(&crate::hashing::ChainInput {
            previous_hash: &self.previous_hash,
            seller: &self.seller,
            buyer: &self.buyer,
            amount: self.amount,
            token: &self.token,
            cumulative_value: self.cumulative_at_creation,
        })
    }
}

/// Buyer-funded bounty recorded at release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupDeposit {
    /// Aggregate deposit held for the process
    pub total: Amount,
    /// Deposit per released member
    pub per_item: Amount,
    /// Earliest archive time (unix seconds)
    pub archivable_after: u64,
}

/// Current end of a process's hash chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    /// Last SRP linked
    pub srp_id: SrpId,
    /// Its creation hash
    #[serde(with = "hex_hash")]
    pub hash: Hash32,
}

/// Process record: one root SRP plus progressively added members
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    /// Process id
    pub id: ProcessId,

    /// Member SRPs in link order; the root is always index 0
    pub members: Vec<SrpId>,

    /// Shared counterparty
    pub buyer: Address,

    /// Shared asset
    pub token: AssetId,

    /// Members currently Locked
    pub locked_count: u32,

    /// Cumulative nominal value across members
    pub cumulative_value: Amount,

    /// Chain tail
    pub chain_tail: ChainLink,

    /// Cleanup deposit, set once at release
    pub cleanup: Option<CleanupDeposit>,

    /// Creation time (unix seconds)
    pub created_at: u64,
}

impl ProcessRecord {
    /// Root SRP id
    pub fn root(&self) -> SrpId {
        // members is never empty: the root is pushed at construction
        self.members[0]
    }
}

/// Serde adapter writing 32-byte hashes as 0x-prefixed hex
pub mod hex_hash {
    use super::Hash32;
    use serde::{de, Deserialize, Deserializer, Serializer};

    /// Serialize as hex string
    pub fn serialize<S: Serializer>(hash: &Hash32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(hash)))
    }

    /// Deserialize from hex string
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Hash32, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(&s)).map_err(de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| de::Error::custom("expected 32-byte hash"))
    }
}

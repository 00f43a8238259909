//! Reports emitted for external indexers
//!
//! Consumers mirror SRP state idempotently by deduplicating state-change
//! reports on `(srp_id, version_hash)`.

use crate::types::{hex_hash, Address, Amount, AssetId, Hash32, ProcessId, SrpId, SrpState};
use serde::{Deserialize, Serialize};

/// New SRP linked into a process chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationReport {
    /// New SRP
    pub srp_id: SrpId,
    /// Owning process
    pub process_id: ProcessId,
    /// Chain link of the new SRP
    #[serde(with = "hex_hash")]
    pub creation_hash: Hash32,
    /// Previous SRP in the chain
    pub previous_srp_id: Option<SrpId>,
    /// Previous chain tail
    #[serde(with = "hex_hash")]
    pub previous_hash: Hash32,
    /// Depositor
    pub seller: Address,
    /// Counterparty
    pub buyer: Address,
    /// Asset
    pub token: AssetId,
    /// Nominal amount
    pub amount: Amount,
    /// Process cumulative value after linking
    pub cumulative_value: Amount,
}

/// SRP transition (including the initial Created state)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeReport {
    /// SRP
    pub srp_id: SrpId,
    /// Owning process
    pub process_id: ProcessId,
    /// Party that triggered the transition
    pub actor: Address,
    /// Depositor
    pub seller: Address,
    /// Counterparty
    pub buyer: Address,
    /// Chain tail this SRP was linked to
    #[serde(with = "hex_hash")]
    pub previous_hash: Hash32,
    /// Post-transition version hash
    #[serde(with = "hex_hash")]
    pub version_hash: Hash32,
    /// Source state (None on creation)
    pub from_state: Option<SrpState>,
    /// Target state
    pub to_state: SrpState,
    /// Signed change to the escrowed balance
    pub balance_delta: i128,
    /// Escrowed balance after the transition
    pub new_balance: Amount,
    /// Process cumulative value
    pub cumulative_value: Amount,
}

/// Consent granted or revoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentReport {
    /// Third-party seller
    pub seller: Address,
    /// Delegate
    pub delegate: Address,
    /// New flag
    pub approved: bool,
}

/// Cleanup deposit recorded at release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupDepositReport {
    /// Process
    pub process_id: ProcessId,
    /// Depositing buyer
    pub buyer: Address,
    /// Aggregate deposit
    pub total: Amount,
    /// Per released member
    pub per_item: Amount,
    /// Earliest archive time
    pub archivable_after: u64,
}

/// SRP record deleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrpArchivedReport {
    /// Deleted SRP
    pub srp_id: SrpId,
    /// Its process
    pub process_id: ProcessId,
    /// Terminal state at deletion
    pub final_state: SrpState,
}

/// Process bookkeeping deleted and bounty paid
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessArchivedReport {
    /// Deleted process
    pub process_id: ProcessId,
    /// Archiving caller
    pub caller: Address,
    /// Bounty paid
    pub payout: Amount,
    /// Deleted SRPs
    pub archived_ids: Vec<SrpId>,
}

/// Any report produced by a committed invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Report {
    /// SRP created
    Creation(CreationReport),
    /// SRP transition
    StateChange(StateChangeReport),
    /// Consent flag changed
    Consent(ConsentReport),
    /// Cleanup deposit placed
    CleanupDepositPlaced(CleanupDepositReport),
    /// SRP archived
    SrpArchived(SrpArchivedReport),
    /// Process archived
    ProcessArchived(ProcessArchivedReport),
}

impl Report {
    /// Deduplication key for state-change reports
    pub fn dedup_key(&self) -> Option<(SrpId, Hash32)> {
        match self {
            Report::StateChange(r) => Some((r.srp_id, r.version_hash)),
            _ => None,
        }
    }
}

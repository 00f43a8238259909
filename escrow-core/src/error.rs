//! Error types for the escrow core

use crate::types::{Address, Amount, AssetId, ProcessId, SrpId, SrpState};
use thiserror::Error;

/// Result type for escrow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure class of an [`Error`]
///
/// Every class aborts the whole invocation; none is retried by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input rejected before any state mutation
    Validation,
    /// Caller does not hold the role the entry point requires
    Authorization,
    /// Entity is not in the required source state
    State,
    /// Allowance, transfer or asset-behaviour failure
    Funding,
    /// Batch or process size limit, arithmetic overflow
    Capacity,
    /// Stale nonce, expired deadline or bad signature
    Replay,
    /// Nested invocation while the guard is held
    Reentrancy,
    /// Configuration, IO, metrics
    Infrastructure,
}

impl ErrorKind {
    /// Stable label used for metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authorization => "authorization",
            ErrorKind::State => "state",
            ErrorKind::Funding => "funding",
            ErrorKind::Capacity => "capacity",
            ErrorKind::Replay => "replay",
            ErrorKind::Reentrancy => "reentrancy",
            ErrorKind::Infrastructure => "infrastructure",
        }
    }
}

/// Escrow errors
#[derive(Error, Debug)]
pub enum Error {
    /// Null address supplied for a required party or asset
    #[error("Zero address supplied for {0}")]
    ZeroAddress(&'static str),

    /// Seller and buyer are the same party
    #[error("Seller and buyer must differ: {0}")]
    SameParty(Address),

    /// Nominal amount of zero
    #[error("Amount must be positive")]
    ZeroAmount,

    /// Batch entry point called with no items
    #[error("Batch is empty")]
    EmptyBatch,

    /// Same entity listed twice in one batch
    #[error("Duplicate item in batch: {0}")]
    DuplicateItem(String),

    /// Signed payload asset differs from the process asset
    #[error("Asset mismatch: process uses {expected}, got {actual}")]
    AssetMismatch {
        /// Asset of the process
        expected: AssetId,
        /// Asset named by the request
        actual: AssetId,
    },

    /// Wrong caller for the role
    #[error("Unauthorized: {caller} is not the {role}")]
    Unauthorized {
        /// Role the entry point requires
        role: &'static str,
        /// Actual caller
        caller: Address,
    },

    /// Third-party seller has not consented to the delegate
    #[error("Seller {seller} has not granted consent to {delegate}")]
    ConsentMissing {
        /// Third-party seller
        seller: Address,
        /// Delegate attempting the addition
        delegate: Address,
    },

    /// SRP not found
    #[error("SRP not found: {0}")]
    SrpNotFound(SrpId),

    /// Process not found
    #[error("Process not found: {0}")]
    ProcessNotFound(ProcessId),

    /// Transition attempted from the wrong source state
    #[error("Invalid state for SRP {srp}: expected {expected:?}, found {actual:?}")]
    InvalidState {
        /// Target SRP
        srp: SrpId,
        /// Required source state
        expected: SrpState,
        /// Stored state
        actual: SrpState,
    },

    /// Process cannot be archived yet
    #[error("Process {process} is not archivable: {reason}")]
    NotArchivable {
        /// Target process
        process: ProcessId,
        /// Why not
        reason: String,
    },

    /// Payer has not authorized enough units
    #[error("Insufficient allowance: required {required}, available {available}")]
    InsufficientAllowance {
        /// capital + fee
        required: Amount,
        /// Current allowance
        available: Amount,
    },

    /// Payer balance below the amount requested
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// Amount requested
        required: Amount,
        /// Current balance
        available: Amount,
    },

    /// Received amount differs from the requested amount
    #[error("Transfer mismatch: expected {expected}, received {actual}")]
    TransferMismatch {
        /// Requested
        expected: Amount,
        /// Observed balance delta
        actual: Amount,
    },

    /// Probe transfer lost value in flight
    #[error("Non-standard asset {asset}: sent {sent}, received {received}")]
    NonStandardAsset {
        /// Probed asset
        asset: AssetId,
        /// Units sent
        sent: Amount,
        /// Units received
        received: Amount,
    },

    /// Token backend refused the transfer
    #[error("Transfer rejected: {0}")]
    TransferRejected(String),

    /// Per-item cleanup deposit below the configured minimum
    #[error("Cleanup deposit too low: minimum {minimum}, got {actual}")]
    CleanupDepositTooLow {
        /// Configured minimum
        minimum: Amount,
        /// Offered
        actual: Amount,
    },

    /// Batch exceeds the item cap
    #[error("Batch too large: {size} items, maximum {max}")]
    BatchTooLarge {
        /// Items supplied
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Process would exceed the member cap
    #[error("Process {process} is full: maximum {max} members")]
    ProcessFull {
        /// Target process
        process: ProcessId,
        /// Configured maximum
        max: usize,
    },

    /// Checked arithmetic failed
    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),

    /// Delegated payload past its deadline
    #[error("Payload expired: deadline {deadline}, now {now}")]
    Expired {
        /// Payload deadline (unix seconds)
        deadline: u64,
        /// Current logical time
        now: u64,
    },

    /// Nonce does not match the signer's stored counter
    #[error("Invalid nonce for {signer}: expected {expected}, got {actual}")]
    InvalidNonce {
        /// Signer address
        signer: Address,
        /// Stored nonce
        expected: u64,
        /// Declared nonce
        actual: u64,
    },

    /// Neither key recovery nor program validation accepted the signature
    #[error("Invalid signature for {0}")]
    InvalidSignature(Address),

    /// Declared cumulative value does not match the process
    #[error("Stale cumulative value: expected {expected}, declared {declared}")]
    StaleCumulative {
        /// Process cumulative after the addition
        expected: Amount,
        /// Value in the signed payload
        declared: Amount,
    },

    /// Nested call into a guarded entry point
    #[error("Reentrant call rejected")]
    Reentrancy,

    /// Stored accounting disagrees with itself
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Taxonomy class of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ZeroAddress(_)
            | Error::SameParty(_)
            | Error::ZeroAmount
            | Error::EmptyBatch
            | Error::DuplicateItem(_)
            | Error::AssetMismatch { .. } => ErrorKind::Validation,
            Error::Unauthorized { .. } | Error::ConsentMissing { .. } => ErrorKind::Authorization,
            Error::SrpNotFound(_)
            | Error::ProcessNotFound(_)
            | Error::InvalidState { .. }
            | Error::NotArchivable { .. }
            | Error::InvariantViolation(_) => ErrorKind::State,
            Error::InsufficientAllowance { .. }
            | Error::InsufficientBalance { .. }
            | Error::TransferMismatch { .. }
            | Error::NonStandardAsset { .. }
            | Error::TransferRejected(_)
            | Error::CleanupDepositTooLow { .. } => ErrorKind::Funding,
            Error::BatchTooLarge { .. } | Error::ProcessFull { .. } | Error::Overflow(_) => {
                ErrorKind::Capacity
            }
            Error::Expired { .. }
            | Error::InvalidNonce { .. }
            | Error::InvalidSignature(_)
            | Error::StaleCumulative { .. } => ErrorKind::Replay,
            Error::Reentrancy => ErrorKind::Reentrancy,
            Error::Config(_) | Error::Metrics(_) | Error::Io(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(format!("Failed to parse config: {}", err))
    }
}

//! SRP Escrow Core
//!
//! Multi-party escrow coordination: sellers and buyers post coordination
//! capital into custody, a small state machine moves each Service Request
//! Process (SRP) through Created, Locked, Released and Refunded (or
//! Cancelled), and processes grow by linking further SRPs onto a
//! tamper-evident hash chain.
//!
//! # Architecture
//!
//! - **Guarded invocations**: every entry point runs under a reentrancy guard
//!   and commits or rolls back as a whole
//! - **Effects before transfers**: state is written before any value moves
//! - **Two-pass batches**: validate every item, then apply with one aggregate
//!   transfer per asset
//! - **Hash chain**: creation hashes link members, version hashes key
//!   idempotent report consumers
//!
//! # Invariants
//!
//! - Conservation: custody holds exactly the escrowed balances plus cleanup
//!   deposits; nothing is created or destroyed
//! - Terminal SRPs (Refunded, Cancelled) hold a zero balance
//! - Stored creation and version hashes are reproducible from stored fields

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod accountant;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod hashing;
pub mod metrics;
pub mod signature;
pub mod token;
pub mod types;

// Re-exports
pub use config::Config;
pub use engine::{AdditionHook, NewProcess, SignedAdditionRequest, SrpEngine};
pub use error::{Error, ErrorKind, Result};
pub use events::Report;
pub use types::{Address, Amount, AssetId, ProcessId, SrpId, SrpState};

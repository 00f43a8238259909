//! End-to-end lifecycle tests against the in-memory token backend
//!
//! Covers:
//! - Reference scenario: create, lock, release, refund with exact amounts
//! - Access control and illegal transitions
//! - Rollback when a transfer fails after state was written
//! - Reentrant calls from transfer hooks
//! - Batch atomicity and aggregation
//! - Consent and signed additions, permits, program signers
//! - Archival and cleanup bounties

use escrow_core::accountant::FixedRateFeeCalculator;
use escrow_core::clock::ManualClock;
use escrow_core::crypto::{KeyPair, Signature};
use escrow_core::signature::{SignedAddition, StaticProgramRegistry};
use escrow_core::token::{
    permit_digest, MemoryTokenBackend, Permit, TokenBackend, TransferNotice,
};
use escrow_core::types::ZERO_HASH;
use escrow_core::{
    Address, AdditionHook, Amount, AssetId, Config, Error, ErrorKind, NewProcess, ProcessId,
    Report, SignedAdditionRequest, SrpEngine, SrpId, SrpState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const START: u64 = 1_700_000_000;
const WEEK: u64 = 7 * 24 * 60 * 60;

struct Harness {
    engine: Arc<SrpEngine>,
    tokens: Arc<MemoryTokenBackend>,
    clock: Arc<ManualClock>,
    asset: AssetId,
    seller: Address,
    buyer: Address,
    custody: Address,
    fee_recipient: Address,
}

fn harness() -> Harness {
    harness_custom(Config::default(), |engine| engine)
}

fn harness_custom(config: Config, customize: impl FnOnce(SrpEngine) -> SrpEngine) -> Harness {
    let tokens = Arc::new(MemoryTokenBackend::new());
    let clock = Arc::new(ManualClock::new(START));

    let custody = config.custody;
    let fee_recipient = config.fees.fee_recipient;
    let engine = SrpEngine::new(config, tokens.clone())
        .unwrap()
        .with_clock(clock.clone());

    Harness {
        engine: Arc::new(customize(engine)),
        tokens,
        clock,
        asset: AssetId::new(Address::from_low_u64(0xA55E7)),
        seller: Address::from_low_u64(0x5E11),
        buyer: Address::from_low_u64(0xB0B),
        custody,
        fee_recipient,
    }
}

impl Harness {
    fn fund(&self, party: &Address, amount: Amount) {
        self.tokens.mint(&self.asset, party, amount);
        self.tokens.approve(&self.asset, party, &self.custody, amount);
    }

    fn balance(&self, party: &Address) -> Amount {
        self.tokens.balance_of(&self.asset, party)
    }

    fn assert_conserved(&self) {
        assert_eq!(
            self.balance(&self.custody),
            self.engine.escrowed_total(&self.asset).unwrap()
        );
    }

    /// Root-only process (nominal `amount`) locked by the buyer
    fn locked_process(&self, amount: Amount) -> (ProcessId, SrpId) {
        self.fund(&self.seller, 1_000_000);
        self.fund(&self.buyer, 1_000_000);
        let (process_id, root) = self
            .engine
            .create_process(&self.seller, self.buyer, amount, self.asset)
            .unwrap();
        self.engine.lock(&self.buyer, root).unwrap();
        (process_id, root)
    }

    fn signed(&self, signer: &KeyPair, payload: &SignedAddition) -> Signature {
        signer.sign_digest(&payload.digest(&self.engine.domain_separator()))
    }
}

fn payload(
    process_id: ProcessId,
    seller: Address,
    asset: AssetId,
    amount: Amount,
    cumulative_value: Amount,
    nonce: u64,
) -> SignedAddition {
    SignedAddition {
        process_id,
        seller,
        amount,
        token: asset,
        cumulative_value,
        deadline: START + 600,
        nonce,
        metadata: b"order-42".to_vec(),
    }
}

// ============================================================================
// Reference scenario
// ============================================================================

#[test]
fn test_reference_lifecycle() {
    let h = harness();

    // Seller deposit: 2000 capital + 6 fee
    h.fund(&h.seller, 2006);
    let (process_id, srp_id) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();
    let srp = h.engine.srp(srp_id).unwrap();
    assert_eq!(srp.coordination_capital_balance, 2000);
    assert_eq!(srp.state, SrpState::Created);
    assert_eq!(h.balance(&h.seller), 0);
    assert_eq!(h.balance(&h.fee_recipient), 6);
    h.assert_conserved();

    // Buyer lock mirrors the seller
    h.fund(&h.buyer, 2006);
    h.engine.lock(&h.buyer, srp_id).unwrap();
    let srp = h.engine.srp(srp_id).unwrap();
    assert_eq!(srp.coordination_capital_balance, 4000);
    assert_eq!(srp.state, SrpState::Locked);
    assert_eq!(h.engine.process(process_id).unwrap().locked_count, 1);
    h.assert_conserved();

    // Release: buyer gets 1000 back minus the 1-unit cleanup deposit
    let released = h
        .engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .unwrap();
    assert_eq!(released, vec![srp_id]);
    let srp = h.engine.srp(srp_id).unwrap();
    assert_eq!(srp.coordination_capital_balance, 3000);
    assert_eq!(srp.state, SrpState::Released);
    assert_eq!(h.balance(&h.buyer), 999);
    let process = h.engine.process(process_id).unwrap();
    assert_eq!(process.locked_count, 0);
    let cleanup = process.cleanup.unwrap();
    assert_eq!(cleanup.total, 1);
    assert_eq!(cleanup.per_item, 1);
    assert_eq!(cleanup.archivable_after, START + WEEK);
    h.assert_conserved();

    // Refund: seller receives exactly 3000
    h.engine.refund(&h.seller, srp_id).unwrap();
    let srp = h.engine.srp(srp_id).unwrap();
    assert_eq!(srp.coordination_capital_balance, 0);
    assert_eq!(srp.state, SrpState::Refunded);
    assert_eq!(h.balance(&h.seller), 3000);
    assert_eq!(h.balance(&h.custody), 1);
    assert_eq!(h.balance(&h.fee_recipient), 12);
    h.assert_conserved();

    h.engine.verify_process_chain(process_id).unwrap();
}

#[test]
fn test_reports_carry_reproducible_version_hashes() {
    let h = harness();
    let (process_id, srp_id) = h.locked_process(1000);
    h.engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .unwrap();
    h.engine.refund(&h.seller, srp_id).unwrap();

    let reports = h.engine.take_reports();
    assert!(matches!(reports[0], Report::Creation(_)));

    let changes: Vec<_> = reports
        .iter()
        .filter_map(|report| match report {
            Report::StateChange(change) => Some(change.clone()),
            _ => None,
        })
        .collect();
    let states: Vec<_> = changes.iter().map(|c| c.to_state).collect();
    assert_eq!(
        states,
        vec![
            SrpState::Created,
            SrpState::Locked,
            SrpState::Released,
            SrpState::Refunded
        ]
    );
    assert_eq!(changes[0].from_state, None);
    assert_eq!(changes[1].balance_delta, 2000);
    assert_eq!(changes[2].balance_delta, -1000);
    assert_eq!(changes[3].balance_delta, -3000);

    // Every post-transition state has a distinct dedup key
    let mut keys: Vec<_> = reports.iter().filter_map(Report::dedup_key).collect();
    keys.dedup();
    assert_eq!(keys.len(), 4);

    let stored = h.engine.srp(srp_id).unwrap();
    assert_eq!(changes[3].version_hash, stored.version_hash);
    assert_eq!(stored.compute_version_hash(), stored.version_hash);

    assert!(reports
        .iter()
        .any(|r| matches!(r, Report::CleanupDepositPlaced(c) if c.total == 1)));
    assert!(h.engine.take_reports().is_empty());
}

#[test]
fn test_cancel_returns_seller_deposit() {
    let h = harness();
    h.fund(&h.seller, 10_000);
    let (process_id, srp_id) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();
    assert_eq!(h.balance(&h.seller), 10_000 - 2006);

    h.engine.cancel(&h.seller, srp_id).unwrap();
    let srp = h.engine.srp(srp_id).unwrap();
    assert_eq!(srp.state, SrpState::Cancelled);
    assert_eq!(srp.coordination_capital_balance, 0);
    assert_eq!(h.balance(&h.seller), 10_000 - 6);
    h.assert_conserved();
    h.engine.verify_process_chain(process_id).unwrap();
}

// ============================================================================
// Access control and validation
// ============================================================================

#[test]
fn test_illegal_transitions_and_roles() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    h.fund(&h.buyer, 1_000_000);
    let (process_id, srp_id) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();

    let err = h.engine.lock(&h.seller, srp_id).unwrap_err();
    assert!(matches!(err, Error::Unauthorized { role: "buyer", .. }));
    assert_eq!(err.kind(), ErrorKind::Authorization);

    let err = h.engine.refund(&h.seller, srp_id).unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            expected: SrpState::Released,
            actual: SrpState::Created,
            ..
        }
    ));

    let err = h
        .engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
    assert_eq!(err.kind(), ErrorKind::State);

    h.engine.lock(&h.buyer, srp_id).unwrap();
    assert!(matches!(
        h.engine.lock(&h.buyer, srp_id),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        h.engine.cancel(&h.seller, srp_id),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        h.engine
            .release_process_with_cleanup_deposit(&h.seller, process_id, 1),
        Err(Error::Unauthorized {
            role: "root buyer",
            ..
        })
    ));

    h.engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .unwrap();
    assert!(matches!(
        h.engine.refund(&h.buyer, srp_id),
        Err(Error::Unauthorized { role: "seller", .. })
    ));
}

#[test]
fn test_creation_input_validation() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);

    assert!(matches!(
        h.engine.create_process(&h.seller, h.buyer, 0, h.asset),
        Err(Error::ZeroAmount)
    ));
    assert!(matches!(
        h.engine.create_process(&h.seller, h.seller, 10, h.asset),
        Err(Error::SameParty(_))
    ));
    assert!(matches!(
        h.engine.create_process(&h.seller, Address::ZERO, 10, h.asset),
        Err(Error::ZeroAddress("buyer"))
    ));
    assert!(matches!(
        h.engine
            .create_process(&h.seller, h.buyer, 10, AssetId::new(Address::ZERO)),
        Err(Error::ZeroAddress("token"))
    ));
    assert!(h.engine.srp(SrpId(1)).is_none());
    assert_eq!(h.balance(&h.seller), 1_000_000);
}

#[test]
fn test_cleanup_deposit_minimum() {
    let h = harness();
    let (process_id, _) = h.locked_process(1000);
    let err = h
        .engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 0)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::CleanupDepositTooLow {
            minimum: 1,
            actual: 0
        }
    ));
}

// ============================================================================
// Funding: fees, probe, allowances
// ============================================================================

#[test]
fn test_probe_rejects_value_deducting_asset() {
    let h = harness();
    h.fund(&h.seller, 10_000);
    h.tokens.set_transfer_tax(&h.asset, 1);

    let err = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap_err();
    assert!(matches!(err, Error::NonStandardAsset { sent: 1, .. }));
    assert_eq!(err.kind(), ErrorKind::Funding);

    // Probe movement rolled back with everything else
    assert_eq!(h.balance(&h.seller), 10_000);
    assert_eq!(h.balance(&h.custody), 0);
    assert_eq!(
        h.tokens.allowance(&h.asset, &h.seller, &h.custody),
        10_000
    );
    assert!(h.engine.process(ProcessId(1)).is_none());
}

#[test]
fn test_collection_catches_tax_without_probe_headroom() {
    let h = harness();
    h.fund(&h.seller, 2006);
    h.tokens.set_transfer_tax(&h.asset, 1);

    let err = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap_err();
    assert!(matches!(err, Error::TransferMismatch { .. }));
    assert_eq!(h.balance(&h.seller), 2006);
}

#[test]
fn test_insufficient_allowance() {
    let h = harness();
    h.fund(&h.seller, 2005);
    let err = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InsufficientAllowance {
            required: 2006,
            available: 2005
        }
    ));
}

#[test]
fn test_custom_fee_calculator() {
    let h = harness_custom(Config::default(), |engine| {
        engine.with_fee_calculator(Arc::new(FixedRateFeeCalculator::new(0)))
    });
    assert_eq!(h.engine.calculate_fee(10_000).unwrap(), 0);

    h.fund(&h.seller, 2000);
    h.engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();
    assert_eq!(h.balance(&h.seller), 0);
    assert_eq!(h.balance(&h.fee_recipient), 0);
}

#[test]
fn test_default_fee_rounding() {
    let h = harness();
    assert_eq!(h.engine.calculate_fee(333).unwrap(), 0);
    assert_eq!(h.engine.calculate_fee(10_000).unwrap(), 30);
    assert_eq!(h.engine.calculate_fee(2000).unwrap(), 6);
}

// ============================================================================
// Rollback and reentrancy
// ============================================================================

#[test]
fn test_failed_payout_rolls_back_state() {
    let h = harness();
    let (process_id, srp_id) = h.locked_process(1000);
    h.engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .unwrap();
    h.engine.take_reports();

    h.tokens.freeze(&h.asset, &h.seller);
    let err = h.engine.refund(&h.seller, srp_id).unwrap_err();
    assert!(matches!(err, Error::TransferRejected(_)));

    let srp = h.engine.srp(srp_id).unwrap();
    assert_eq!(srp.state, SrpState::Released);
    assert_eq!(srp.coordination_capital_balance, 3000);
    assert!(h.engine.take_reports().is_empty());
    h.assert_conserved();

    h.tokens.unfreeze(&h.asset, &h.seller);
    h.engine.refund(&h.seller, srp_id).unwrap();
    assert_eq!(h.engine.srp(srp_id).unwrap().state, SrpState::Refunded);
}

#[test]
fn test_failed_release_restores_process() {
    let h = harness();
    let (process_id, root) = h.locked_process(1000);
    let buyer_before = h.balance(&h.buyer);

    h.tokens.freeze(&h.asset, &h.buyer);
    assert!(h
        .engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .is_err());

    let process = h.engine.process(process_id).unwrap();
    assert_eq!(process.locked_count, 1);
    assert!(process.cleanup.is_none());
    assert_eq!(h.engine.srp(root).unwrap().state, SrpState::Locked);
    assert_eq!(h.balance(&h.buyer), buyer_before);
    assert_eq!(
        h.engine
            .metrics()
            .failures
            .with_label_values(&["funding"])
            .get(),
        1
    );
}

#[test]
fn test_reentrant_call_from_transfer_hook_rejected() {
    let h = harness();
    let (process_id, root) = h.locked_process(1000);

    let nested: Arc<Mutex<Option<escrow_core::Result<()>>>> = Arc::new(Mutex::new(None));
    let slot = nested.clone();
    let engine = h.engine.clone();
    let seller = h.seller;
    h.tokens.set_receive_hook(
        &h.buyer,
        Arc::new(move |_notice: &TransferNotice| {
            let outcome = engine.refund(&seller, root);
            *slot.lock().unwrap() = Some(outcome);
        }),
    );

    h.engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .unwrap();

    let outcome = nested.lock().unwrap().take();
    assert!(matches!(outcome, Some(Err(Error::Reentrancy))));

    // Outer invocation committed untouched by the nested attempt
    let srp = h.engine.srp(root).unwrap();
    assert_eq!(srp.state, SrpState::Released);
    assert_eq!(srp.coordination_capital_balance, 3000);
    assert_eq!(
        h.engine
            .metrics()
            .failures
            .with_label_values(&["reentrancy"])
            .get(),
        1
    );
    h.assert_conserved();
}

#[test]
fn test_panicking_transfer_hook_rolls_back_invocation() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    h.fund(&h.buyer, 1_000_000);
    let (process_id, root) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();
    h.engine.take_reports();
    let buyer_before = h.balance(&h.buyer);
    let custody_before = h.balance(&h.custody);

    h.tokens.set_receive_hook(
        &h.custody,
        Arc::new(|_notice: &TransferNotice| panic!("custody hook exploded")),
    );
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        h.engine.lock(&h.buyer, root)
    }));
    assert!(outcome.is_err());

    let srp = h.engine.srp(root).unwrap();
    assert_eq!(srp.state, SrpState::Created);
    assert_eq!(srp.coordination_capital_balance, 2000);
    assert_eq!(h.engine.process(process_id).unwrap().locked_count, 0);
    assert!(h.engine.verify_process_chain(process_id).is_ok());
    assert_eq!(h.balance(&h.buyer), buyer_before);
    assert_eq!(h.balance(&h.custody), custody_before);
    assert!(h.engine.take_reports().is_empty());
    assert_eq!(
        h.engine
            .metrics()
            .failures
            .with_label_values(&["infrastructure"])
            .get(),
        1
    );
    h.assert_conserved();

    // Guard and checkpoint were released; the next lock goes through
    h.tokens
        .set_receive_hook(&h.custody, Arc::new(|_notice: &TransferNotice| {}));
    h.engine.lock(&h.buyer, root).unwrap();
    assert_eq!(h.balance(&h.custody), 4000);
    h.assert_conserved();
}

// ============================================================================
// Batches
// ============================================================================

#[test]
fn test_batch_create_is_all_or_nothing() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    let items = [
        NewProcess {
            buyer: h.buyer,
            amount: 100,
            token: h.asset,
        },
        NewProcess {
            buyer: h.buyer,
            amount: 200,
            token: h.asset,
        },
        NewProcess {
            buyer: h.buyer,
            amount: 0,
            token: h.asset,
        },
    ];

    let err = h
        .engine
        .batch_create_processes(&h.seller, &items)
        .unwrap_err();
    assert!(matches!(err, Error::ZeroAmount));
    assert!(h.engine.process(ProcessId(1)).is_none());
    assert_eq!(h.balance(&h.seller), 1_000_000);
    assert!(h.engine.take_reports().is_empty());

    // Id counters were rolled back too
    let (process_id, srp_id) = h
        .engine
        .create_process(&h.seller, h.buyer, 100, h.asset)
        .unwrap();
    assert_eq!(process_id, ProcessId(1));
    assert_eq!(srp_id, SrpId(1));
}

#[test]
fn test_batch_create_charges_fee_on_aggregate() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    let items: Vec<_> = (0..3)
        .map(|_| NewProcess {
            buyer: h.buyer,
            amount: 100,
            token: h.asset,
        })
        .collect();

    let created = h.engine.batch_create_processes(&h.seller, &items).unwrap();
    assert_eq!(created.len(), 3);

    // Each item alone would pay floor(200 * 30 / 10000) = 0; the batch pays on 600
    assert_eq!(h.balance(&h.fee_recipient), 1);
    assert_eq!(h.balance(&h.seller), 1_000_000 - 601);
    // probe out, probe back, fee, capital
    assert_eq!(h.engine.metrics().transfers.get(), 4);
    h.assert_conserved();
}

#[test]
fn test_batch_lock_rejects_duplicates_and_unknown_ids() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    h.fund(&h.buyer, 1_000_000);
    let (_, a) = h
        .engine
        .create_process(&h.seller, h.buyer, 100, h.asset)
        .unwrap();
    let (_, b) = h
        .engine
        .create_process(&h.seller, h.buyer, 100, h.asset)
        .unwrap();

    assert!(matches!(
        h.engine.batch_lock(&h.buyer, &[a, b, a]),
        Err(Error::DuplicateItem(_))
    ));
    assert!(matches!(
        h.engine.batch_lock(&h.buyer, &[a, b, SrpId(99)]),
        Err(Error::SrpNotFound(SrpId(99)))
    ));
    assert_eq!(h.engine.srp(a).unwrap().state, SrpState::Created);
    assert_eq!(h.engine.srp(b).unwrap().state, SrpState::Created);
    assert_eq!(h.balance(&h.buyer), 1_000_000);

    h.engine.batch_lock(&h.buyer, &[a, b]).unwrap();
    assert_eq!(h.engine.srp(a).unwrap().coordination_capital_balance, 400);
    assert_eq!(h.engine.srp(b).unwrap().coordination_capital_balance, 400);
}

#[test]
fn test_batch_lock_roots() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    h.fund(&h.buyer, 1_000_000);
    let (p1, r1) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();
    let (p2, r2) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();

    h.engine.batch_lock_roots(&h.buyer, &[p1, p2]).unwrap();
    assert_eq!(h.engine.srp(r1).unwrap().state, SrpState::Locked);
    assert_eq!(h.engine.srp(r2).unwrap().state, SrpState::Locked);
    // 4000 capital, fee 12
    assert_eq!(h.balance(&h.buyer), 1_000_000 - 4012);
    assert!(matches!(
        h.engine.batch_lock_roots(&h.buyer, &[ProcessId(42)]),
        Err(Error::ProcessNotFound(ProcessId(42)))
    ));
}

#[test]
fn test_batch_release_nets_one_transfer() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    h.fund(&h.buyer, 4012);
    let (p1, r1) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();
    let (p2, r2) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();
    h.engine.lock(&h.buyer, r1).unwrap();
    h.engine.lock(&h.buyer, r2).unwrap();
    assert_eq!(h.balance(&h.buyer), 0);

    let released = h.engine.batch_release(&h.buyer, &[p1, p2], 1).unwrap();
    assert_eq!(released, vec![r1, r2]);
    assert_eq!(h.balance(&h.buyer), 1998);

    h.engine.batch_refund(&h.seller, &[r1, r2]).unwrap();
    assert_eq!(h.engine.srp(r1).unwrap().state, SrpState::Refunded);
    assert_eq!(h.balance(&h.custody), 2);
    h.assert_conserved();
}

#[test]
fn test_release_pulls_when_deposit_exceeds_refund() {
    let h = harness();
    let (process_id, root) = h.locked_process(10);
    let buyer_before = h.balance(&h.buyer);

    h.engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 20)
        .unwrap();
    assert_eq!(h.balance(&h.buyer), buyer_before - 10);
    assert_eq!(h.engine.srp(root).unwrap().coordination_capital_balance, 30);
    h.assert_conserved();
}

#[test]
fn test_batch_cancel() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    let (_, a) = h
        .engine
        .create_process(&h.seller, h.buyer, 100, h.asset)
        .unwrap();
    let (_, b) = h
        .engine
        .create_process(&h.seller, h.buyer, 300, h.asset)
        .unwrap();

    assert!(matches!(
        h.engine.batch_cancel(&h.buyer, &[a, b]),
        Err(Error::Unauthorized { .. })
    ));
    h.engine.batch_cancel(&h.seller, &[a, b]).unwrap();
    assert_eq!(h.engine.srp(a).unwrap().state, SrpState::Cancelled);
    assert_eq!(h.engine.srp(b).unwrap().state, SrpState::Cancelled);
    assert_eq!(h.balance(&h.custody), 0);
}

#[test]
fn test_batch_and_process_capacity() {
    let mut config = Config::default();
    config.limits.max_batch_size = 3;
    let h = harness_custom(config, |engine| engine);
    h.fund(&h.seller, 1_000_000);
    h.fund(&h.buyer, 1_000_000);

    let items: Vec<_> = (0..4)
        .map(|_| NewProcess {
            buyer: h.buyer,
            amount: 10,
            token: h.asset,
        })
        .collect();
    let err = h
        .engine
        .batch_create_processes(&h.seller, &items)
        .unwrap_err();
    assert!(matches!(err, Error::BatchTooLarge { size: 4, max: 3 }));
    assert_eq!(err.kind(), ErrorKind::Capacity);
    assert!(matches!(
        h.engine.batch_create_processes(&h.seller, &[]),
        Err(Error::EmptyBatch)
    ));

    let (process_id, root) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();
    h.engine.lock(&h.buyer, root).unwrap();
    h.engine
        .seller_batch_add(&h.seller, process_id, &[(h.seller, 10), (h.seller, 20)])
        .unwrap();
    assert_eq!(h.engine.process(process_id).unwrap().members.len(), 3);

    assert!(matches!(
        h.engine
            .add_srp_to_process(&h.seller, process_id, h.seller, 5),
        Err(Error::ProcessFull { max: 3, .. })
    ));
}

// ============================================================================
// Progressive additions
// ============================================================================

#[test]
fn test_consent_gated_addition() {
    let h = harness();
    let (process_id, root) = h.locked_process(1000);
    let third = Address::from_low_u64(0x7777);
    h.fund(&third, 100_000);

    assert!(matches!(
        h.engine.add_srp_to_process(&h.seller, process_id, third, 500),
        Err(Error::ConsentMissing { .. })
    ));

    h.engine
        .grant_root_seller_consent(&third, h.seller, true)
        .unwrap();
    assert!(h.engine.has_consent(&third, &h.seller));

    let member = h
        .engine
        .add_srp_to_process(&h.seller, process_id, third, 500)
        .unwrap();

    // Capital is twice the cumulative value after the addition: 2 * 1500
    assert_eq!(h.balance(&third), 100_000 - 3009);
    let process = h.engine.process(process_id).unwrap();
    assert_eq!(process.cumulative_value, 1500);
    assert_eq!(process.members, vec![root, member]);
    assert_eq!(process.chain_tail.srp_id, member);

    let record = h.engine.srp(member).unwrap();
    let root_record = h.engine.srp(root).unwrap();
    assert_eq!(record.state, SrpState::Created);
    assert_eq!(record.coordination_capital_balance, 3000);
    assert_eq!(record.buyer, h.buyer);
    assert_eq!(record.previous_srp, Some(root));
    assert_eq!(record.previous_hash, root_record.creation_hash);
    assert_eq!(root_record.previous_hash, ZERO_HASH);
    h.engine.verify_process_chain(process_id).unwrap();
    h.assert_conserved();

    h.engine
        .grant_root_seller_consent(&third, h.seller, false)
        .unwrap();
    assert!(matches!(
        h.engine.add_srp_to_process(&h.seller, process_id, third, 1),
        Err(Error::ConsentMissing { .. })
    ));

    assert!(matches!(
        h.engine.add_srp_to_process(&third, process_id, third, 1),
        Err(Error::Unauthorized {
            role: "root seller",
            ..
        })
    ));
}

#[test]
fn test_consent_validation() {
    let h = harness();
    assert!(matches!(
        h.engine
            .grant_root_seller_consent(&h.seller, Address::ZERO, true),
        Err(Error::ZeroAddress("delegate"))
    ));
    assert!(matches!(
        h.engine.grant_root_seller_consent(&h.seller, h.seller, true),
        Err(Error::SameParty(_))
    ));

    let a = Address::from_low_u64(1);
    let b = Address::from_low_u64(2);
    h.engine
        .batch_grant_root_seller_consent(&h.seller, &[(a, true), (b, true)])
        .unwrap();
    assert!(h.engine.has_consent(&h.seller, &a));
    assert!(h.engine.has_consent(&h.seller, &b));
    let reports = h.engine.take_reports();
    assert_eq!(reports.len(), 2);
}

#[test]
fn test_addition_requires_locked_root() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    let (process_id, root) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();
    let err = h
        .engine
        .add_srp_to_process(&h.seller, process_id, h.seller, 10)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidState {
            srp,
            expected: SrpState::Locked,
            actual: SrpState::Created,
        } if srp == root
    ));
}

#[test]
fn test_multi_party_process_settles_completely() {
    let h = harness();
    let (process_id, root) = h.locked_process(1000);
    let third = Address::from_low_u64(0x7777);
    let keeper = Address::from_low_u64(0xEE);
    h.fund(&third, 100_000);
    h.engine
        .grant_root_seller_consent(&third, h.seller, true)
        .unwrap();
    let member = h
        .engine
        .add_srp_to_process(&h.seller, process_id, third, 500)
        .unwrap();

    // Releasing with an unlocked member is refused
    assert!(matches!(
        h.engine
            .release_process_with_cleanup_deposit(&h.buyer, process_id, 1),
        Err(Error::InvalidState { srp, .. }) if srp == member
    ));

    // Buyer mirrors the member's own nominal amount: 1000 + 3 fee
    h.engine.lock(&h.buyer, member).unwrap();
    assert_eq!(h.engine.srp(member).unwrap().coordination_capital_balance, 4000);
    assert_eq!(h.engine.process(process_id).unwrap().locked_count, 2);

    let released = h
        .engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .unwrap();
    assert_eq!(released, vec![root, member]);
    assert_eq!(h.engine.srp(member).unwrap().coordination_capital_balance, 3500);
    assert_eq!(h.engine.process(process_id).unwrap().cleanup.unwrap().total, 2);

    h.engine.refund(&h.seller, root).unwrap();
    h.engine.refund(&third, member).unwrap();
    h.engine.verify_process_chain(process_id).unwrap();

    h.clock.advance(WEEK);
    assert_eq!(h.engine.archive_process(&keeper, process_id).unwrap(), 2);

    assert_eq!(h.balance(&h.seller), 1_000_000 - 2006 + 3000);
    assert_eq!(h.balance(&h.buyer), 1_000_000 - 2006 - 1003 + 1498);
    assert_eq!(h.balance(&third), 100_000 - 3009 + 3500);
    assert_eq!(h.balance(&h.fee_recipient), 24);
    assert_eq!(h.balance(&keeper), 2);
    assert_eq!(h.balance(&h.custody), 0);
    h.assert_conserved();
}

#[test]
fn test_release_skips_cancelled_members() {
    let h = harness();
    let (process_id, root) = h.locked_process(1000);
    let third = Address::from_low_u64(0x7777);
    h.fund(&third, 100_000);
    h.engine
        .grant_root_seller_consent(&third, h.seller, true)
        .unwrap();
    let member = h
        .engine
        .add_srp_to_process(&h.seller, process_id, third, 500)
        .unwrap();
    h.engine.cancel(&third, member).unwrap();
    assert_eq!(h.balance(&third), 100_000 - 9);

    let released = h
        .engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .unwrap();
    assert_eq!(released, vec![root]);
    assert_eq!(h.engine.process(process_id).unwrap().cleanup.unwrap().total, 1);
    h.assert_conserved();
}

#[test]
fn test_addition_hook_failures_are_isolated() {
    struct FlakyHook {
        calls: AtomicUsize,
    }

    impl AdditionHook for FlakyHook {
        fn on_srp_added(
            &self,
            _process_id: ProcessId,
            _srp_id: SrpId,
        ) -> std::result::Result<(), String> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err("indexer offline".to_string()),
                _ => panic!("hook crashed"),
            }
        }
    }

    let hook = Arc::new(FlakyHook {
        calls: AtomicUsize::new(0),
    });
    let installed = hook.clone();
    let h = harness_custom(Config::default(), move |engine| engine.with_hook(installed));
    let (process_id, _) = h.locked_process(1000);

    let added = h
        .engine
        .seller_batch_add(&h.seller, process_id, &[(h.seller, 10), (h.seller, 20)])
        .unwrap();
    assert_eq!(added.len(), 2);
    assert_eq!(hook.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.engine.process(process_id).unwrap().members.len(), 3);

    // Third call panics; the guard is still released and the addition commits
    h.engine
        .add_srp_to_process(&h.seller, process_id, h.seller, 5)
        .unwrap();
    assert_eq!(hook.calls.load(Ordering::SeqCst), 3);
    h.engine.lock(&h.buyer, added[0]).unwrap();
}

// ============================================================================
// Signed additions
// ============================================================================

#[test]
fn test_signed_addition_and_replay_protection() {
    let h = harness();
    let (process_id, _) = h.locked_process(1000);
    let signer = KeyPair::from_seed(&[9u8; 32]);
    let seller = signer.address();
    h.fund(&seller, 100_000);
    let relayer = Address::from_low_u64(0x4E1A7);

    let first = payload(process_id, seller, h.asset, 500, 1500, 0);
    let signature = h.signed(&signer, &first);
    let member = h
        .engine
        .add_srp_signed(&relayer, &first, &signature, None)
        .unwrap();
    assert_eq!(h.engine.nonce_of(&seller), 1);
    assert_eq!(h.engine.srp(member).unwrap().seller, seller);
    assert_eq!(h.balance(&seller), 100_000 - 3009);

    // Replay of the same payload
    let err = h
        .engine
        .add_srp_signed(&relayer, &first, &signature, None)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidNonce {
            expected: 1,
            actual: 0,
            ..
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Replay);

    // Expired, even though correctly signed
    let mut expired = payload(process_id, seller, h.asset, 500, 2000, 1);
    expired.deadline = START - 1;
    let signature = h.signed(&signer, &expired);
    assert!(matches!(
        h.engine.add_srp_signed(&relayer, &expired, &signature, None),
        Err(Error::Expired { .. })
    ));

    // Cumulative value no longer matches the process
    let stale = payload(process_id, seller, h.asset, 500, 1500, 1);
    let signature = h.signed(&signer, &stale);
    assert!(matches!(
        h.engine.add_srp_signed(&relayer, &stale, &signature, None),
        Err(Error::StaleCumulative {
            expected: 2000,
            declared: 1500
        })
    ));

    // Wrong asset
    let other_asset = AssetId::new(Address::from_low_u64(0xD1FF));
    let mismatched = payload(process_id, seller, other_asset, 500, 2000, 1);
    let signature = h.signed(&signer, &mismatched);
    assert!(matches!(
        h.engine
            .add_srp_signed(&relayer, &mismatched, &signature, None),
        Err(Error::AssetMismatch { .. })
    ));

    // Signed by someone else
    let impostor = KeyPair::from_seed(&[10u8; 32]);
    let next = payload(process_id, seller, h.asset, 500, 2000, 1);
    let forged = h.signed(&impostor, &next);
    assert!(matches!(
        h.engine.add_srp_signed(&relayer, &next, &forged, None),
        Err(Error::InvalidSignature(_))
    ));

    assert_eq!(h.engine.nonce_of(&seller), 1);
    let signature = h.signed(&signer, &next);
    h.engine
        .add_srp_signed(&relayer, &next, &signature, None)
        .unwrap();
    assert_eq!(h.engine.nonce_of(&seller), 2);
    h.engine.verify_process_chain(process_id).unwrap();
}

#[test]
fn test_signed_batch_sequences_nonces() {
    let h = harness();
    let (process_id, _) = h.locked_process(1000);
    let signer = KeyPair::from_seed(&[9u8; 32]);
    let seller = signer.address();
    h.fund(&seller, 100_000);

    let request = |p: SignedAddition| SignedAdditionRequest {
        signature: h.signed(&signer, &p),
        payload: p,
        permit: None,
    };

    // Out of order: whole batch rejected
    let reversed = [
        request(payload(process_id, seller, h.asset, 500, 1500, 1)),
        request(payload(process_id, seller, h.asset, 200, 1700, 0)),
    ];
    assert!(matches!(
        h.engine.add_srp_signed_batch(&h.buyer, &reversed),
        Err(Error::InvalidNonce { .. })
    ));
    assert_eq!(h.engine.nonce_of(&seller), 0);

    let ordered = [
        request(payload(process_id, seller, h.asset, 500, 1500, 0)),
        request(payload(process_id, seller, h.asset, 200, 1700, 1)),
    ];
    let added = h.engine.add_srp_signed_batch(&h.buyer, &ordered).unwrap();
    assert_eq!(added.len(), 2);
    assert_eq!(h.engine.nonce_of(&seller), 2);

    // One collection on 3000 + 3400 capital: fee floor(6400 * 30 / 10000) = 19
    assert_eq!(h.balance(&seller), 100_000 - 6419);
    assert_eq!(h.engine.process(process_id).unwrap().cumulative_value, 1700);
    h.engine.verify_process_chain(process_id).unwrap();
    h.assert_conserved();
}

#[test]
fn test_program_signer_authorizes_addition() {
    let registry = Arc::new(StaticProgramRegistry::new());
    let programs = registry.clone();
    let h = harness_custom(Config::default(), move |engine| {
        engine.with_program_registry(programs)
    });
    let (process_id, _) = h.locked_process(1000);

    let program = Address::from_low_u64(0x5AFE);
    h.fund(&program, 100_000);
    let terms = payload(process_id, program, h.asset, 500, 1500, 0);
    let opaque = Signature::from_bytes(b"multisig-approval".to_vec());

    assert!(matches!(
        h.engine.add_srp_signed(&h.seller, &terms, &opaque, None),
        Err(Error::InvalidSignature(_))
    ));

    registry.approve_digest(program, terms.digest(&h.engine.domain_separator()));
    h.engine
        .add_srp_signed(&h.seller, &terms, &opaque, None)
        .unwrap();
    assert_eq!(h.engine.nonce_of(&program), 1);
}

#[test]
fn test_permit_supplies_allowance() {
    let h = harness();
    let (process_id, _) = h.locked_process(1000);
    let signer = KeyPair::from_seed(&[11u8; 32]);
    let seller = signer.address();
    h.tokens.mint(&h.asset, &seller, 100_000);

    let terms = payload(process_id, seller, h.asset, 500, 1500, 0);
    let signature = h.signed(&signer, &terms);

    // Permit signed for the wrong value is ignored; collection then fails
    let deadline = START + 600;
    let bad = Permit {
        owner: seller,
        value: 3009,
        deadline,
        nonce: 0,
        signature: signer.sign_digest(&permit_digest(&h.asset, &seller, &h.custody, 1, deadline, 0)),
    };
    assert!(matches!(
        h.engine
            .add_srp_signed(&h.seller, &terms, &signature, Some(&bad)),
        Err(Error::InsufficientAllowance { .. })
    ));
    assert_eq!(h.engine.nonce_of(&seller), 0);

    let good = Permit {
        owner: seller,
        value: 3009,
        deadline,
        nonce: h.tokens.permit_nonce(&h.asset, &seller),
        signature: signer.sign_digest(&permit_digest(
            &h.asset, &seller, &h.custody, 3009, deadline, 0,
        )),
    };
    h.engine
        .add_srp_signed(&h.seller, &terms, &signature, Some(&good))
        .unwrap();
    assert_eq!(h.balance(&seller), 100_000 - 3009);
    assert_eq!(h.tokens.allowance(&h.asset, &seller, &h.custody), 0);
    assert_eq!(h.tokens.permit_nonce(&h.asset, &seller), 1);

    // The spent permit cannot restore the allowance
    assert!(matches!(
        h.tokens.permit(&h.asset, &h.custody, &good, START),
        Err(Error::InvalidNonce { .. })
    ));
    assert_eq!(h.tokens.allowance(&h.asset, &seller, &h.custody), 0);
}

#[test]
fn test_permit_deadline_follows_engine_clock() {
    let h = harness();
    let (process_id, _) = h.locked_process(1000);
    let signer = KeyPair::from_seed(&[12u8; 32]);
    let seller = signer.address();
    h.tokens.mint(&h.asset, &seller, 100_000);

    let terms = payload(process_id, seller, h.asset, 500, 1500, 0);
    let signature = h.signed(&signer, &terms);
    let deadline = START + 10;
    let permit = Permit {
        owner: seller,
        value: 3009,
        deadline,
        nonce: 0,
        signature: signer.sign_digest(&permit_digest(
            &h.asset, &seller, &h.custody, 3009, deadline, 0,
        )),
    };

    // Past the permit deadline on the engine clock, still within the payload's
    h.clock.advance(20);
    assert!(matches!(
        h.engine
            .add_srp_signed(&h.seller, &terms, &signature, Some(&permit)),
        Err(Error::InsufficientAllowance { .. })
    ));
    assert_eq!(h.tokens.permit_nonce(&h.asset, &seller), 0);

    h.clock.set(START);
    h.engine
        .add_srp_signed(&h.seller, &terms, &signature, Some(&permit))
        .unwrap();
    assert_eq!(h.tokens.permit_nonce(&h.asset, &seller), 1);
}

// ============================================================================
// Archival
// ============================================================================

#[test]
fn test_archive_pays_bounty_after_delay() {
    let h = harness();
    let (process_id, root) = h.locked_process(1000);
    let keeper = Address::from_low_u64(0xEE);

    // Not terminal yet
    h.engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .unwrap();
    assert!(matches!(
        h.engine.archive_process(&keeper, process_id),
        Err(Error::NotArchivable { .. })
    ));

    h.engine.refund(&h.seller, root).unwrap();
    h.clock.advance(WEEK - 1);
    assert!(matches!(
        h.engine.archive_process(&keeper, process_id),
        Err(Error::NotArchivable { .. })
    ));

    h.clock.advance(1);
    h.engine.take_reports();
    assert_eq!(h.engine.archive_process(&keeper, process_id).unwrap(), 1);
    assert_eq!(h.balance(&keeper), 1);
    assert!(h.engine.srp(root).is_none());
    assert!(h.engine.process(process_id).is_none());
    assert!(matches!(
        h.engine.process_members(process_id),
        Err(Error::ProcessNotFound(_))
    ));

    let reports = h.engine.take_reports();
    assert!(reports.iter().any(|r| matches!(
        r,
        Report::SrpArchived(a) if a.srp_id == root && a.final_state == SrpState::Refunded
    )));
    assert!(reports.iter().any(|r| matches!(
        r,
        Report::ProcessArchived(p) if p.payout == 1 && p.archived_ids == vec![root]
    )));
    h.assert_conserved();
}

#[test]
fn test_cancelled_process_archives_without_bounty() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    let (process_id, root) = h
        .engine
        .create_process(&h.seller, h.buyer, 1000, h.asset)
        .unwrap();
    h.engine.cancel(&h.seller, root).unwrap();

    assert!(matches!(
        h.engine.archive_process(&h.buyer, process_id),
        Err(Error::NotArchivable { .. })
    ));
    h.clock.advance(WEEK);
    assert_eq!(h.engine.archive_process(&h.buyer, process_id).unwrap(), 0);
    assert!(h.engine.process(process_id).is_none());
}

#[test]
fn test_batch_archive_aggregates_bounties() {
    let h = harness();
    h.fund(&h.seller, 1_000_000);
    h.fund(&h.buyer, 1_000_000);
    let keeper = Address::from_low_u64(0xEE);

    let mut processes = Vec::new();
    for _ in 0..2 {
        let (process_id, root) = h
            .engine
            .create_process(&h.seller, h.buyer, 1000, h.asset)
            .unwrap();
        h.engine.lock(&h.buyer, root).unwrap();
        h.engine
            .release_process_with_cleanup_deposit(&h.buyer, process_id, 5)
            .unwrap();
        h.engine.refund(&h.seller, root).unwrap();
        processes.push(process_id);
    }
    h.clock.advance(WEEK);

    assert!(matches!(
        h.engine
            .batch_archive_processes(&keeper, &[processes[0], processes[0]]),
        Err(Error::DuplicateItem(_))
    ));
    assert_eq!(
        h.engine
            .batch_archive_processes(&keeper, &processes)
            .unwrap(),
        10
    );
    assert_eq!(h.balance(&keeper), 10);
    assert_eq!(h.balance(&h.custody), 0);
}

// ============================================================================
// Observability
// ============================================================================

#[test]
fn test_metrics_track_invocations_and_transitions() {
    let h = harness();
    let (process_id, root) = h.locked_process(1000);
    h.engine
        .release_process_with_cleanup_deposit(&h.buyer, process_id, 1)
        .unwrap();
    h.engine.refund(&h.seller, root).unwrap();
    let _ = h.engine.refund(&h.seller, root);

    let metrics = h.engine.metrics();
    assert_eq!(
        metrics
            .invocations
            .with_label_values(&["create_process"])
            .get(),
        1
    );
    assert_eq!(metrics.invocations.with_label_values(&["refund"]).get(), 2);
    for state in ["created", "locked", "released", "refunded"] {
        assert_eq!(metrics.transitions.with_label_values(&[state]).get(), 1);
    }
    assert_eq!(metrics.failures.with_label_values(&["state"]).get(), 1);
    assert!(!metrics.registry().gather().is_empty());
}

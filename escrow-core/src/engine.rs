//! State machine / ledger core
//!
//! [`SrpEngine`] owns every SRP and process record, the consent flags and
//! the signer nonces. All mutation happens inside a guarded invocation:
//!
//! 1. the reentrancy guard is taken (nested calls fail fast)
//! 2. the ledger state starts an undo log and the token backend is
//!    checkpointed
//! 3. the entry point validates every item, commits its state effects, and
//!    only then performs transfers
//! 4. version hashes are computed over the post-transfer state and reports
//!    are staged
//! 5. on success the checkpoint is committed and reports are journaled; on
//!    an error or a panic the undo log is replayed and the checkpoint
//!    reverted (a panic then resumes unwinding)
//!
//! Step 5 stands in for the substrate's all-or-nothing guarantee, so a
//! failed invocation leaves no trace.
//!
//! # Transition graph
//!
//! ```text
//! Created --lock (buyer)--> Locked --release (root buyer)--> Released --refund (seller)--> Refunded
//! Created --cancel (seller)--> Cancelled
//! ```

mod addition;
mod archive;
mod consent;
mod create;
mod transitions;

pub use addition::{AdditionHook, SignedAdditionRequest};
pub use create::NewProcess;

use crate::accountant::{EscrowAccountant, FeeCalculator, FixedRateFeeCalculator};
use crate::clock::{Clock, SystemClock};
use crate::events::{Report, StateChangeReport};
use crate::guard::ReentrancyGuard;
use crate::metrics::Metrics;
use crate::signature::{
    consume_nonce, DomainSeparator, NoPrograms, ProgramRegistry, SignatureGuard,
};
use crate::token::TokenBackend;
use crate::types::{
    Address, Amount, AssetId, ProcessId, ProcessRecord, SrpId, SrpRecord, SrpState, ZERO_HASH,
};
use crate::{Config, Error, ErrorKind, Result};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Prior values of everything an open invocation has touched
///
/// Each key is recorded on first touch only, so rollback work is bounded by
/// what the invocation wrote rather than by the size of the ledger.
#[derive(Debug, Default)]
struct UndoLog {
    srps: BTreeMap<SrpId, Option<SrpRecord>>,
    processes: BTreeMap<ProcessId, Option<ProcessRecord>>,
    consents: HashMap<(Address, Address), bool>,
    nonces: HashMap<Address, Option<u64>>,
    next_srp_id: u64,
    next_process_id: u64,
}

/// Everything the core owns
///
/// Mutations go through the methods below so an open invocation can undo
/// them.
#[derive(Debug)]
pub(crate) struct LedgerState {
    srps: BTreeMap<SrpId, SrpRecord>,
    processes: BTreeMap<ProcessId, ProcessRecord>,
    /// (third-party seller, delegate)
    consents: HashSet<(Address, Address)>,
    nonces: HashMap<Address, u64>,
    next_srp_id: u64,
    next_process_id: u64,
    undo: Option<UndoLog>,
}

impl LedgerState {
    /// Both sequences start at 1 so id 0 never names a record
    fn new() -> Self {
        Self {
            srps: BTreeMap::new(),
            processes: BTreeMap::new(),
            consents: HashSet::new(),
            nonces: HashMap::new(),
            next_srp_id: 1,
            next_process_id: 1,
            undo: None,
        }
    }

    /// Start recording prior values
    fn begin(&mut self) {
        self.undo = Some(UndoLog {
            next_srp_id: self.next_srp_id,
            next_process_id: self.next_process_id,
            ..UndoLog::default()
        });
    }

    /// Keep every change since `begin`
    fn commit(&mut self) {
        self.undo = None;
    }

    /// Put back every value touched since `begin`
    fn rollback(&mut self) {
        let Some(undo) = self.undo.take() else {
            return;
        };
        for (id, prior) in undo.srps {
            match prior {
                Some(record) => self.srps.insert(id, record),
                None => self.srps.remove(&id),
            };
        }
        for (id, prior) in undo.processes {
            match prior {
                Some(record) => self.processes.insert(id, record),
                None => self.processes.remove(&id),
            };
        }
        for (key, present) in undo.consents {
            if present {
                self.consents.insert(key);
            } else {
                self.consents.remove(&key);
            }
        }
        for (signer, prior) in undo.nonces {
            match prior {
                Some(nonce) => self.nonces.insert(signer, nonce),
                None => self.nonces.remove(&signer),
            };
        }
        self.next_srp_id = undo.next_srp_id;
        self.next_process_id = undo.next_process_id;
    }

    fn touch_srp(&mut self, id: &SrpId) {
        if let Some(undo) = self.undo.as_mut() {
            let srps = &self.srps;
            undo.srps.entry(*id).or_insert_with(|| srps.get(id).cloned());
        }
    }

    fn touch_process(&mut self, id: &ProcessId) {
        if let Some(undo) = self.undo.as_mut() {
            let processes = &self.processes;
            undo.processes
                .entry(*id)
                .or_insert_with(|| processes.get(id).cloned());
        }
    }

    pub(crate) fn allocate_srp_id(&mut self) -> Result<SrpId> {
        let id = SrpId(self.next_srp_id);
        self.next_srp_id = self
            .next_srp_id
            .checked_add(1)
            .ok_or(Error::Overflow("srp id"))?;
        Ok(id)
    }

    pub(crate) fn allocate_process_id(&mut self) -> Result<ProcessId> {
        let id = ProcessId(self.next_process_id);
        self.next_process_id = self
            .next_process_id
            .checked_add(1)
            .ok_or(Error::Overflow("process id"))?;
        Ok(id)
    }

    pub(crate) fn srp(&self, id: &SrpId) -> Result<&SrpRecord> {
        self.srps.get(id).ok_or(Error::SrpNotFound(*id))
    }

    pub(crate) fn srp_mut(&mut self, id: &SrpId) -> Result<&mut SrpRecord> {
        self.touch_srp(id);
        self.srps.get_mut(id).ok_or(Error::SrpNotFound(*id))
    }

    pub(crate) fn insert_srp(&mut self, record: SrpRecord) {
        self.touch_srp(&record.id);
        self.srps.insert(record.id, record);
    }

    pub(crate) fn remove_srp(&mut self, id: &SrpId) {
        self.touch_srp(id);
        self.srps.remove(id);
    }

    pub(crate) fn process(&self, id: &ProcessId) -> Result<&ProcessRecord> {
        self.processes.get(id).ok_or(Error::ProcessNotFound(*id))
    }

    pub(crate) fn process_mut(&mut self, id: &ProcessId) -> Result<&mut ProcessRecord> {
        self.touch_process(id);
        self.processes.get_mut(id).ok_or(Error::ProcessNotFound(*id))
    }

    pub(crate) fn insert_process(&mut self, record: ProcessRecord) {
        self.touch_process(&record.id);
        self.processes.insert(record.id, record);
    }

    pub(crate) fn remove_process(&mut self, id: &ProcessId) {
        self.touch_process(id);
        self.processes.remove(id);
    }

    pub(crate) fn has_consent(&self, seller: &Address, delegate: &Address) -> bool {
        self.consents.contains(&(*seller, *delegate))
    }

    pub(crate) fn set_consent(&mut self, seller: Address, delegate: Address, approved: bool) {
        let key = (seller, delegate);
        if let Some(undo) = self.undo.as_mut() {
            let consents = &self.consents;
            undo.consents
                .entry(key)
                .or_insert_with(|| consents.contains(&key));
        }
        if approved {
            self.consents.insert(key);
        } else {
            self.consents.remove(&key);
        }
    }

    pub(crate) fn nonce(&self, signer: &Address) -> u64 {
        self.nonces.get(signer).copied().unwrap_or(0)
    }

    pub(crate) fn consume_nonce(&mut self, signer: &Address, declared: u64) -> Result<()> {
        if let Some(undo) = self.undo.as_mut() {
            let nonces = &self.nonces;
            undo.nonces
                .entry(*signer)
                .or_insert_with(|| nonces.get(signer).copied());
        }
        consume_nonce(&mut self.nonces, signer, declared)
    }
}

/// Per-key running totals with overflow-checked accumulation
///
/// Linear lookup: batches are capped at `max_batch_size`, so the O(n²)
/// worst case stays small and the aggregation order is deterministic.
#[derive(Debug, Clone)]
pub(crate) struct Totals<K> {
    entries: Vec<(K, Amount)>,
}

impl<K: PartialEq + Copy> Totals<K> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub(crate) fn add(&mut self, key: K, amount: Amount, what: &'static str) -> Result<()> {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some((_, total)) => {
                *total = total.checked_add(amount).ok_or(Error::Overflow(what))?;
            }
            None => self.entries.push((key, amount)),
        }
        Ok(())
    }

    pub(crate) fn get(&self, key: &K) -> Amount {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, total)| *total)
            .unwrap_or(0)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &(K, Amount)> {
        self.entries.iter()
    }
}

/// Reject a batch that lists the same item twice
pub(crate) fn ensure_unique<T: PartialEq + std::fmt::Display>(items: &[T]) -> Result<()> {
    for (i, item) in items.iter().enumerate() {
        if items[..i].contains(item) {
            return Err(Error::DuplicateItem(item.to_string()));
        }
    }
    Ok(())
}

/// Amount as a positive balance delta
pub(crate) fn credit(amount: Amount) -> Result<i128> {
    i128::try_from(amount).map_err(|_| Error::Overflow("balance delta"))
}

/// Amount as a negative balance delta
pub(crate) fn debit(amount: Amount) -> Result<i128> {
    credit(amount).map(|delta| -delta)
}

/// State of one guarded invocation
pub(crate) struct Invocation<'e> {
    engine: &'e SrpEngine,
    pub(crate) caller: Address,
    pub(crate) now: u64,
    reports: Vec<Report>,
}

impl<'e> Invocation<'e> {
    pub(crate) fn engine(&self) -> &'e SrpEngine {
        self.engine
    }

    pub(crate) fn state(&self) -> RwLockReadGuard<'e, LedgerState> {
        self.engine.state.read()
    }

    pub(crate) fn state_mut(&self) -> RwLockWriteGuard<'e, LedgerState> {
        self.engine.state.write()
    }

    pub(crate) fn accountant(&self) -> &'e EscrowAccountant {
        &self.engine.accountant
    }

    pub(crate) fn emit(&mut self, report: Report) {
        self.reports.push(report);
    }

    /// Recompute the version hash over stored state and stage a state-change report
    pub(crate) fn record_transition(
        &mut self,
        srp_id: SrpId,
        from_state: Option<SrpState>,
        balance_delta: i128,
    ) -> Result<()> {
        let report = {
            let mut state = self.state_mut();
            let process_id = state.srp(&srp_id)?.process_id;
            let cumulative_value = state.process(&process_id)?.cumulative_value;
            let srp = state.srp_mut(&srp_id)?;
            srp.version_hash = srp.compute_version_hash();
            StateChangeReport {
                srp_id,
                process_id,
                actor: self.caller,
                seller: srp.seller,
                buyer: srp.buyer,
                previous_hash: srp.previous_hash,
                version_hash: srp.version_hash,
                from_state,
                to_state: srp.state,
                balance_delta,
                new_balance: srp.coordination_capital_balance,
                cumulative_value,
            }
        };
        self.emit(Report::StateChange(report));
        Ok(())
    }
}

/// The escrow coordination engine
pub struct SrpEngine {
    config: Config,
    state: RwLock<LedgerState>,
    journal: Mutex<Vec<Report>>,
    guard: ReentrancyGuard,
    accountant: EscrowAccountant,
    signatures: SignatureGuard,
    clock: Arc<dyn Clock>,
    hook: Option<Arc<dyn AdditionHook>>,
    metrics: Metrics,
}

impl std::fmt::Debug for SrpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SrpEngine")
            .field("service", &self.config.service_name)
            .field("srps", &state.srps.len())
            .field("processes", &state.processes.len())
            .finish()
    }
}

impl SrpEngine {
    /// Create engine with the configured fixed-rate fee, wall clock and no programs
    pub fn new(config: Config, tokens: Arc<dyn TokenBackend>) -> Result<Self> {
        config.validate()?;
        let metrics = Metrics::new()?;
        let fees: Arc<dyn FeeCalculator> =
            Arc::new(FixedRateFeeCalculator::new(config.fees.fee_rate_bps));
        let accountant = EscrowAccountant::new(
            tokens,
            fees,
            config.custody,
            config.fees.fee_recipient,
            metrics.clone(),
        );
        let signatures = SignatureGuard::new(
            DomainSeparator::new(&config.signing, &config.custody),
            Arc::new(NoPrograms),
        );

        tracing::info!(
            service = %config.service_name,
            custody = %config.custody,
            fee_bps = config.fees.fee_rate_bps,
            max_batch = config.limits.max_batch_size,
            "Escrow engine initialized"
        );

        Ok(Self {
            config,
            state: RwLock::new(LedgerState::new()),
            journal: Mutex::new(Vec::new()),
            guard: ReentrancyGuard::new(),
            accountant,
            signatures,
            clock: Arc::new(SystemClock),
            hook: None,
            metrics,
        })
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the fee collaborator
    pub fn with_fee_calculator(mut self, fees: Arc<dyn FeeCalculator>) -> Self {
        self.accountant = EscrowAccountant::new(
            self.accountant.tokens().clone(),
            fees,
            self.config.custody,
            self.config.fees.fee_recipient,
            self.metrics.clone(),
        );
        self
    }

    /// Enable program-based signature validation
    pub fn with_program_registry(mut self, programs: Arc<dyn ProgramRegistry>) -> Self {
        self.signatures = SignatureGuard::new(*self.signatures.domain(), programs);
        self
    }

    /// Install the optional post-addition hook
    pub fn with_hook(mut self, hook: Arc<dyn AdditionHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Run `op` as one all-or-nothing guarded invocation
    pub(crate) fn invoke<T>(
        &self,
        entry_point: &'static str,
        caller: &Address,
        op: impl FnOnce(&mut Invocation<'_>) -> Result<T>,
    ) -> Result<T> {
        let _entered = self.guard.enter().map_err(|err| {
            self.metrics.record_failure(err.kind());
            tracing::warn!(entry_point, caller = %caller, "Reentrant call rejected");
            err
        })?;
        self.metrics.record_invocation(entry_point);
        tracing::debug!(entry_point, caller = %caller, "Invocation started");

        self.state.write().begin();
        let tokens = self.accountant.tokens();
        tokens.checkpoint();

        let mut invocation = Invocation {
            engine: self,
            caller: *caller,
            now: self.clock.now(),
            reports: Vec::new(),
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| op(&mut invocation)));
        match outcome {
            Ok(Ok(value)) => {
                self.state.write().commit();
                tokens.commit();
                let reports = invocation.reports;
                for report in &reports {
                    if let Report::StateChange(change) = report {
                        self.metrics.record_transition(change.to_state);
                    }
                }
                tracing::info!(
                    entry_point,
                    caller = %caller,
                    reports = reports.len(),
                    "Invocation committed"
                );
                self.journal.lock().extend(reports);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.state.write().rollback();
                tokens.revert();
                self.metrics.record_failure(err.kind());
                tracing::warn!(
                    entry_point,
                    caller = %caller,
                    kind = err.kind().as_str(),
                    error = %err,
                    "Invocation rolled back"
                );
                Err(err)
            }
            Err(payload) => {
                self.state.write().rollback();
                tokens.revert();
                self.metrics.record_failure(ErrorKind::Infrastructure);
                tracing::error!(entry_point, caller = %caller, "Invocation panicked, rolled back");
                resume_unwind(payload)
            }
        }
    }

    /// Enforce the per-invocation item cap
    pub(crate) fn check_batch(&self, items: usize) -> Result<()> {
        if items == 0 {
            return Err(Error::EmptyBatch);
        }
        let max = self.config.limits.max_batch_size;
        if items > max {
            return Err(Error::BatchTooLarge { size: items, max });
        }
        self.metrics.record_batch(items);
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Read accessors
    // ----------------------------------------------------------------------

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Custody address
    pub fn custody(&self) -> &Address {
        self.accountant.custody()
    }

    /// Domain separator for delegated-addition digests
    pub fn domain_separator(&self) -> DomainSeparator {
        *self.signatures.domain()
    }

    /// SRP record
    pub fn srp(&self, id: SrpId) -> Option<SrpRecord> {
        self.state.read().srps.get(&id).cloned()
    }

    /// Process record
    pub fn process(&self, id: ProcessId) -> Option<ProcessRecord> {
        self.state.read().processes.get(&id).cloned()
    }

    /// Member SRP records in link order
    pub fn process_members(&self, id: ProcessId) -> Result<Vec<SrpRecord>> {
        let state = self.state.read();
        let process = state.process(&id)?;
        process
            .members
            .iter()
            .map(|member| state.srp(member).cloned())
            .collect()
    }

    /// Next nonce `signer` must use
    pub fn nonce_of(&self, signer: &Address) -> u64 {
        self.state.read().nonce(signer)
    }

    /// Whether `seller` lets `delegate` add SRPs on its behalf
    pub fn has_consent(&self, seller: &Address, delegate: &Address) -> bool {
        self.state.read().has_consent(seller, delegate)
    }

    /// Fee owed on `amount` of coordination capital
    pub fn calculate_fee(&self, amount: Amount) -> Result<Amount> {
        self.accountant.fee_for(amount)
    }

    /// Custody liabilities in `asset`: escrowed balances plus cleanup deposits
    pub fn escrowed_total(&self, asset: &AssetId) -> Result<Amount> {
        let state = self.state.read();
        let escrowed = state
            .srps
            .values()
            .filter(|srp| srp.token == *asset)
            .map(|srp| srp.coordination_capital_balance);
        let deposits = state
            .processes
            .values()
            .filter(|process| process.token == *asset)
            .filter_map(|process| process.cleanup.map(|c| c.total));
        escrowed
            .chain(deposits)
            .try_fold(0, |total: Amount, amount| total.checked_add(amount))
            .ok_or(Error::Overflow("escrowed total"))
    }

    /// Recompute every member's creation and version hash and compare to storage
    pub fn verify_process_chain(&self, id: ProcessId) -> Result<()> {
        let state = self.state.read();
        let process = state.process(&id)?;

        let mut expected_previous = (None, ZERO_HASH);
        for member in &process.members {
            let srp = state.srp(member)?;
            if (srp.previous_srp, srp.previous_hash) != expected_previous {
                return Err(Error::InvariantViolation(format!(
                    "{} is not linked to the preceding chain tail",
                    member
                )));
            }
            if srp.compute_creation_hash() != srp.creation_hash {
                return Err(Error::InvariantViolation(format!(
                    "{} creation hash does not match its fields",
                    member
                )));
            }
            if srp.compute_version_hash() != srp.version_hash {
                return Err(Error::InvariantViolation(format!(
                    "{} version hash does not match its state",
                    member
                )));
            }
            expected_previous = (Some(srp.id), srp.creation_hash);
        }

        if (Some(process.chain_tail.srp_id), process.chain_tail.hash) != expected_previous {
            return Err(Error::InvariantViolation(format!(
                "{} chain tail does not match its last member",
                id
            )));
        }
        Ok(())
    }

    /// Drain committed reports
    pub fn take_reports(&self) -> Vec<Report> {
        std::mem::take(&mut *self.journal.lock())
    }
}

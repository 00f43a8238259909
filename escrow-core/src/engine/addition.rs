//! Progressive multi-party additions
//!
//! Once a process's root SRP is Locked, further SRPs can be linked onto its
//! chain for third-party sellers. Authorization comes either from a consent
//! record (the root seller acts as delegate) or from the third party's signed
//! payload, which any caller may relay. Each added SRP escrows twice the
//! process's cumulative value after the addition.

use super::{credit, Invocation, LedgerState, SrpEngine, Totals};
use crate::accountant::coordination_capital;
use crate::crypto::Signature;
use crate::events::{CreationReport, Report};
use crate::hashing::{creation_hash, ChainInput};
use crate::signature::SignedAddition;
use crate::token::Permit;
use crate::types::{
    Address, Amount, AssetId, ChainLink, ProcessId, SrpId, SrpRecord, SrpState, ZERO_HASH,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Best-effort notification after SRPs are added
///
/// Runs after the invocation has committed. Errors and panics are logged and
/// never affect the addition.
pub trait AdditionHook: Send + Sync {
    /// Called once per added SRP
    fn on_srp_added(&self, process_id: ProcessId, srp_id: SrpId) -> std::result::Result<(), String>;
}

/// One signed addition as relayed by a caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAdditionRequest {
    /// Signed terms
    pub payload: SignedAddition,
    /// Seller's signature over the payload digest
    pub signature: Signature,
    /// Optional allowance applied before collection
    #[serde(default)]
    pub permit: Option<Permit>,
}

struct PlannedAddition {
    process_id: ProcessId,
    seller: Address,
    buyer: Address,
    amount: Amount,
    token: AssetId,
    cumulative_after: Amount,
    capital: Amount,
    nonce: Option<u64>,
    permit: Option<Permit>,
}

/// Running view of a process while a batch is planned
struct Cursor {
    process_id: ProcessId,
    cumulative: Amount,
    members: usize,
}

impl SrpEngine {
    /// Root seller adds an SRP for a consenting seller (or itself)
    pub fn add_srp_to_process(
        &self,
        caller: &Address,
        process_id: ProcessId,
        seller: Address,
        amount: Amount,
    ) -> Result<SrpId> {
        let added = self.invoke("add_srp_to_process", caller, |inv| {
            let plans = plan_consented(inv, process_id, &[(seller, amount)])?;
            apply_additions(inv, plans)
        })?;
        self.notify_added(&added);
        first_added(added)
    }

    /// Root seller adds several SRPs to one process
    pub fn seller_batch_add(
        &self,
        caller: &Address,
        process_id: ProcessId,
        items: &[(Address, Amount)],
    ) -> Result<Vec<SrpId>> {
        let added = self.invoke("seller_batch_add", caller, |inv| {
            let plans = plan_consented(inv, process_id, items)?;
            apply_additions(inv, plans)
        })?;
        self.notify_added(&added);
        Ok(added.into_iter().map(|(_, srp_id)| srp_id).collect())
    }

    /// Relay a seller-signed addition
    pub fn add_srp_signed(
        &self,
        caller: &Address,
        payload: &SignedAddition,
        signature: &Signature,
        permit: Option<&Permit>,
    ) -> Result<SrpId> {
        let request = SignedAdditionRequest {
            payload: payload.clone(),
            signature: signature.clone(),
            permit: permit.cloned(),
        };
        let added = self.invoke("add_srp_signed", caller, |inv| {
            let plans = plan_signed(inv, std::slice::from_ref(&request))?;
            apply_additions(inv, plans)
        })?;
        self.notify_added(&added);
        first_added(added)
    }

    /// Relay several signed additions, possibly across processes
    pub fn add_srp_signed_batch(
        &self,
        caller: &Address,
        requests: &[SignedAdditionRequest],
    ) -> Result<Vec<SrpId>> {
        let added = self.invoke("add_srp_signed_batch", caller, |inv| {
            let plans = plan_signed(inv, requests)?;
            apply_additions(inv, plans)
        })?;
        self.notify_added(&added);
        Ok(added.into_iter().map(|(_, srp_id)| srp_id).collect())
    }

    fn notify_added(&self, added: &[(ProcessId, SrpId)]) {
        let Some(hook) = &self.hook else {
            return;
        };
        for (process_id, srp_id) in added {
            match catch_unwind(AssertUnwindSafe(|| hook.on_srp_added(*process_id, *srp_id))) {
                Ok(Ok(())) => {}
                Ok(Err(reason)) => {
                    tracing::warn!(process = %process_id, srp = %srp_id, reason = %reason, "Addition hook failed");
                }
                Err(_) => {
                    tracing::warn!(process = %process_id, srp = %srp_id, "Addition hook panicked");
                }
            }
        }
    }
}

fn first_added(added: Vec<(ProcessId, SrpId)>) -> Result<SrpId> {
    added
        .into_iter()
        .next()
        .map(|(_, srp_id)| srp_id)
        .ok_or_else(|| Error::InvariantViolation("addition produced no srp".to_string()))
}

fn plan_consented(
    inv: &Invocation<'_>,
    process_id: ProcessId,
    items: &[(Address, Amount)],
) -> Result<Vec<PlannedAddition>> {
    let delegate = inv.caller;
    let max_members = inv.engine().config().limits.max_batch_size;
    inv.engine().check_batch(items.len())?;

    let state = inv.state();
    let process = state.process(&process_id)?;
    let root = state.srp(&process.root())?;
    if root.seller != delegate {
        return Err(Error::Unauthorized {
            role: "root seller",
            caller: delegate,
        });
    }

    let mut cursors = Vec::new();
    let mut plans = Vec::with_capacity(items.len());
    for (seller, amount) in items {
        if *seller != delegate && !state.has_consent(seller, &delegate) {
            return Err(Error::ConsentMissing {
                seller: *seller,
                delegate,
            });
        }
        plans.push(plan_one(
            &state,
            &mut cursors,
            max_members,
            process_id,
            *seller,
            *amount,
            None,
        )?);
    }
    Ok(plans)
}

fn plan_signed(
    inv: &Invocation<'_>,
    requests: &[SignedAdditionRequest],
) -> Result<Vec<PlannedAddition>> {
    let engine = inv.engine();
    let max_members = engine.config().limits.max_batch_size;
    engine.check_batch(requests.len())?;

    let state = inv.state();
    let mut cursors = Vec::new();
    let mut pending_nonces: HashMap<Address, u64> = HashMap::new();
    let mut plans = Vec::with_capacity(requests.len());
    for request in requests {
        let payload = &request.payload;
        engine.signatures.verify(payload, &request.signature, inv.now)?;

        let expected = pending_nonces
            .get(&payload.seller)
            .copied()
            .unwrap_or_else(|| state.nonce(&payload.seller));
        if payload.nonce != expected {
            return Err(Error::InvalidNonce {
                signer: payload.seller,
                expected,
                actual: payload.nonce,
            });
        }
        let next = expected.checked_add(1).ok_or(Error::Overflow("nonce"))?;
        pending_nonces.insert(payload.seller, next);

        let mut plan = plan_one(
            &state,
            &mut cursors,
            max_members,
            payload.process_id,
            payload.seller,
            payload.amount,
            Some(payload.token),
        )?;
        if plan.cumulative_after != payload.cumulative_value {
            return Err(Error::StaleCumulative {
                expected: plan.cumulative_after,
                declared: payload.cumulative_value,
            });
        }
        plan.nonce = Some(payload.nonce);
        plan.permit = request.permit.clone();
        plans.push(plan);
    }
    Ok(plans)
}

/// Validate one addition against the process as already extended by the batch
fn plan_one(
    state: &LedgerState,
    cursors: &mut Vec<Cursor>,
    max_members: usize,
    process_id: ProcessId,
    seller: Address,
    amount: Amount,
    declared_token: Option<AssetId>,
) -> Result<PlannedAddition> {
    let process = state.process(&process_id)?;
    let root = state.srp(&process.root())?;
    if root.state != SrpState::Locked {
        return Err(Error::InvalidState {
            srp: root.id,
            expected: SrpState::Locked,
            actual: root.state,
        });
    }
    if let Some(token) = declared_token {
        if token != process.token {
            return Err(Error::AssetMismatch {
                expected: process.token,
                actual: token,
            });
        }
    }
    if seller.is_zero() {
        return Err(Error::ZeroAddress("seller"));
    }
    if seller == process.buyer {
        return Err(Error::SameParty(seller));
    }
    if amount == 0 {
        return Err(Error::ZeroAmount);
    }

    let index = match cursors.iter().position(|c| c.process_id == process_id) {
        Some(index) => index,
        None => {
            cursors.push(Cursor {
                process_id,
                cumulative: process.cumulative_value,
                members: process.members.len(),
            });
            cursors.len() - 1
        }
    };
    let cursor = &mut cursors[index];
    if cursor.members >= max_members {
        return Err(Error::ProcessFull {
            process: process_id,
            max: max_members,
        });
    }
    let cumulative_after = cursor
        .cumulative
        .checked_add(amount)
        .ok_or(Error::Overflow("cumulative value"))?;
    let capital = coordination_capital(cumulative_after)?;
    cursor.cumulative = cumulative_after;
    cursor.members += 1;

    Ok(PlannedAddition {
        process_id,
        seller,
        buyer: process.buyer,
        amount,
        token: process.token,
        cumulative_after,
        capital,
        nonce: None,
        permit: None,
    })
}

fn apply_additions(
    inv: &mut Invocation<'_>,
    plans: Vec<PlannedAddition>,
) -> Result<Vec<(ProcessId, SrpId)>> {
    // Effects: nonces, records and chain links
    let mut links = Vec::with_capacity(plans.len());
    {
        let mut state = inv.state_mut();
        for plan in &plans {
            if let Some(nonce) = plan.nonce {
                state.consume_nonce(&plan.seller, nonce)?;
            }
            let srp_id = state.allocate_srp_id()?;
            let tail = state.process(&plan.process_id)?.chain_tail;
            let hash = creation_hash(&ChainInput {
                previous_hash: &tail.hash,
                seller: &plan.seller,
                buyer: &plan.buyer,
                amount: plan.amount,
                token: &plan.token,
                cumulative_value: plan.cumulative_after,
            });
            state.insert_srp(SrpRecord {
                id: srp_id,
                process_id: plan.process_id,
                seller: plan.seller,
                buyer: plan.buyer,
                amount: plan.amount,
                token: plan.token,
                coordination_capital_balance: 0,
                state: SrpState::Created,
                creation_hash: hash,
                previous_srp: Some(tail.srp_id),
                previous_hash: tail.hash,
                cumulative_at_creation: plan.cumulative_after,
                version_hash: ZERO_HASH,
            });
            let process = state.process_mut(&plan.process_id)?;
            process.members.push(srp_id);
            process.cumulative_value = plan.cumulative_after;
            process.chain_tail = ChainLink { srp_id, hash };
            links.push((srp_id, tail, hash));
        }
    }

    // Transfers: permits, then one collection per (asset, payer)
    let accountant = inv.accountant();
    let custody = *accountant.custody();
    let now = inv.now;
    let mut capital_by_payer: Totals<(AssetId, Address)> = Totals::new();
    for plan in &plans {
        if let Some(permit) = &plan.permit {
            if let Err(err) = accountant.tokens().permit(&plan.token, &custody, permit, now) {
                tracing::warn!(owner = %permit.owner, error = %err, "Permit not applied, using existing allowance");
            }
        }
        capital_by_payer.add((plan.token, plan.seller), plan.capital, "addition capital")?;
    }
    for ((asset, payer), capital) in capital_by_payer.iter() {
        let fee = accountant.collect(asset, payer, *capital)?;
        tracing::info!(%asset, seller = %payer, capital, fee, "Addition capital collected");
    }

    let mut added = Vec::with_capacity(plans.len());
    for (plan, (srp_id, tail, hash)) in plans.iter().zip(links) {
        {
            let mut state = inv.state_mut();
            state.srp_mut(&srp_id)?.coordination_capital_balance = plan.capital;
        }
        inv.emit(Report::Creation(CreationReport {
            srp_id,
            process_id: plan.process_id,
            creation_hash: hash,
            previous_srp_id: Some(tail.srp_id),
            previous_hash: tail.hash,
            seller: plan.seller,
            buyer: plan.buyer,
            token: plan.token,
            amount: plan.amount,
            cumulative_value: plan.cumulative_after,
        }));
        inv.record_transition(srp_id, None, credit(plan.capital)?)?;
        added.push((plan.process_id, srp_id));
    }

    tracing::info!(added = added.len(), "SRPs added to processes");
    Ok(added)
}

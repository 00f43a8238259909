//! Process creation

use super::{credit, Invocation, SrpEngine, Totals};
use crate::accountant::coordination_capital;
use crate::events::{CreationReport, Report};
use crate::hashing::{creation_hash, ChainInput};
use crate::types::{
    Address, Amount, AssetId, ChainLink, ProcessId, ProcessRecord, SrpId, SrpRecord, SrpState,
    ZERO_HASH,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Terms of a process to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewProcess {
    /// Counterparty
    pub buyer: Address,
    /// Nominal amount
    pub amount: Amount,
    /// Asset
    pub token: AssetId,
}

pub(crate) fn validate_parties(seller: &Address, buyer: &Address) -> Result<()> {
    if seller.is_zero() {
        return Err(Error::ZeroAddress("seller"));
    }
    if buyer.is_zero() {
        return Err(Error::ZeroAddress("buyer"));
    }
    if seller == buyer {
        return Err(Error::SameParty(*seller));
    }
    Ok(())
}

impl SrpEngine {
    /// Open a process with one root SRP; caller is the seller
    pub fn create_process(
        &self,
        caller: &Address,
        buyer: Address,
        amount: Amount,
        token: AssetId,
    ) -> Result<(ProcessId, SrpId)> {
        let item = NewProcess {
            buyer,
            amount,
            token,
        };
        self.invoke("create_process", caller, |inv| {
            create_processes(inv, std::slice::from_ref(&item))
        })?
        .into_iter()
        .next()
        .ok_or_else(|| Error::InvariantViolation("creation produced no process".to_string()))
    }

    /// Open several processes; capital is collected once per asset
    pub fn batch_create_processes(
        &self,
        caller: &Address,
        items: &[NewProcess],
    ) -> Result<Vec<(ProcessId, SrpId)>> {
        self.invoke("batch_create_processes", caller, |inv| {
            create_processes(inv, items)
        })
    }
}

fn create_processes(inv: &mut Invocation<'_>, items: &[NewProcess]) -> Result<Vec<(ProcessId, SrpId)>> {
    let seller = inv.caller;
    inv.engine().check_batch(items.len())?;

    // Pass 1: validate and aggregate
    let mut capital_by_asset = Totals::new();
    let mut capitals = Vec::with_capacity(items.len());
    for item in items {
        validate_parties(&seller, &item.buyer)?;
        if item.amount == 0 {
            return Err(Error::ZeroAmount);
        }
        if item.token.is_zero() {
            return Err(Error::ZeroAddress("token"));
        }
        let capital = coordination_capital(item.amount)?;
        capital_by_asset.add(item.token, capital, "batch capital")?;
        capitals.push(capital);
    }

    // Pass 2: register records with zero balance
    let mut created = Vec::with_capacity(items.len());
    {
        let mut state = inv.state_mut();
        for item in items {
            let process_id = state.allocate_process_id()?;
            let srp_id = state.allocate_srp_id()?;
            state.insert_srp(SrpRecord {
                id: srp_id,
                process_id,
                seller,
                buyer: item.buyer,
                amount: item.amount,
                token: item.token,
                coordination_capital_balance: 0,
                state: SrpState::Created,
                creation_hash: ZERO_HASH,
                previous_srp: None,
                previous_hash: ZERO_HASH,
                cumulative_at_creation: item.amount,
                version_hash: ZERO_HASH,
            });
            state.insert_process(ProcessRecord {
                id: process_id,
                members: vec![srp_id],
                buyer: item.buyer,
                token: item.token,
                locked_count: 0,
                cumulative_value: item.amount,
                chain_tail: ChainLink {
                    srp_id,
                    hash: ZERO_HASH,
                },
                cleanup: None,
                created_at: inv.now,
            });
            created.push((process_id, srp_id));
        }
    }

    // Transfers: probe then collect, one collection per asset
    let accountant = inv.accountant();
    for (asset, capital) in capital_by_asset.iter() {
        let required = accountant.required_total(*capital)?;
        accountant.probe(asset, &seller, required)?;
        let fee = accountant.collect(asset, &seller, *capital)?;
        tracing::info!(%asset, seller = %seller, capital, fee, "Creation capital collected");
    }

    // Finalize: balances, chain links and reports
    for ((process_id, srp_id), (item, capital)) in created.iter().zip(items.iter().zip(&capitals)) {
        let report = {
            let mut state = inv.state_mut();
            let srp = state.srp_mut(srp_id)?;
            srp.coordination_capital_balance = *capital;
            srp.creation_hash = creation_hash(&ChainInput {
                previous_hash: &ZERO_HASH,
                seller: &seller,
                buyer: &item.buyer,
                amount: item.amount,
                token: &item.token,
                cumulative_value: item.amount,
            });
            let hash = srp.creation_hash;
            state.process_mut(process_id)?.chain_tail.hash = hash;
            CreationReport {
                srp_id: *srp_id,
                process_id: *process_id,
                creation_hash: hash,
                previous_srp_id: None,
                previous_hash: ZERO_HASH,
                seller,
                buyer: item.buyer,
                token: item.token,
                amount: item.amount,
                cumulative_value: item.amount,
            }
        };
        inv.emit(Report::Creation(report));
        inv.record_transition(*srp_id, None, credit(*capital)?)?;
    }

    tracing::info!(seller = %seller, processes = created.len(), "Processes created");
    Ok(created)
}

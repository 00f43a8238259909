//! Lock, release, refund and cancel

use super::{credit, debit, ensure_unique, Invocation, SrpEngine, Totals};
use crate::accountant::coordination_capital;
use crate::events::{CleanupDepositReport, Report};
use crate::types::{Address, Amount, AssetId, CleanupDeposit, ProcessId, SrpId, SrpState};
use crate::{Error, Result};

/// Validated release of one process
struct ReleasePlan {
    process_id: ProcessId,
    buyer: Address,
    released: Vec<(SrpId, Amount)>,
    deposit: Amount,
}

impl SrpEngine {
    /// Buyer deposit on a Created SRP
    pub fn lock(&self, caller: &Address, srp_id: SrpId) -> Result<()> {
        self.invoke("lock", caller, |inv| lock_srps(inv, &[srp_id]))
    }

    /// Lock several SRPs; deposits are collected once per asset
    pub fn batch_lock(&self, caller: &Address, srp_ids: &[SrpId]) -> Result<()> {
        self.invoke("batch_lock", caller, |inv| lock_srps(inv, srp_ids))
    }

    /// Lock the root SRP of each listed process
    pub fn batch_lock_roots(&self, caller: &Address, process_ids: &[ProcessId]) -> Result<()> {
        self.invoke("batch_lock_roots", caller, |inv| {
            let mut roots = Vec::with_capacity(process_ids.len());
            {
                let state = inv.state();
                for id in process_ids {
                    roots.push(state.process(id)?.root());
                }
            }
            lock_srps(inv, &roots)
        })
    }

    /// Release every Locked member of a process and post the cleanup deposit
    ///
    /// Returns the released SRP ids in link order.
    pub fn release_process_with_cleanup_deposit(
        &self,
        caller: &Address,
        process_id: ProcessId,
        per_item_deposit: Amount,
    ) -> Result<Vec<SrpId>> {
        self.invoke("release_process_with_cleanup_deposit", caller, |inv| {
            release_processes(inv, &[process_id], per_item_deposit)
        })
    }

    /// Release several processes with one net transfer per asset
    pub fn batch_release(
        &self,
        caller: &Address,
        process_ids: &[ProcessId],
        per_item_deposit: Amount,
    ) -> Result<Vec<SrpId>> {
        self.invoke("batch_release", caller, |inv| {
            release_processes(inv, process_ids, per_item_deposit)
        })
    }

    /// Seller withdraws the remaining balance of a Released SRP
    pub fn refund(&self, caller: &Address, srp_id: SrpId) -> Result<()> {
        self.invoke("refund", caller, |inv| {
            settle_srps(inv, &[srp_id], SrpState::Released, SrpState::Refunded)
        })
    }

    /// Refund several SRPs with one payout per asset
    pub fn batch_refund(&self, caller: &Address, srp_ids: &[SrpId]) -> Result<()> {
        self.invoke("batch_refund", caller, |inv| {
            settle_srps(inv, srp_ids, SrpState::Released, SrpState::Refunded)
        })
    }

    /// Seller withdraws a Created SRP before any lock
    pub fn cancel(&self, caller: &Address, srp_id: SrpId) -> Result<()> {
        self.invoke("cancel", caller, |inv| {
            settle_srps(inv, &[srp_id], SrpState::Created, SrpState::Cancelled)
        })
    }

    /// Cancel several SRPs with one payout per asset
    pub fn batch_cancel(&self, caller: &Address, srp_ids: &[SrpId]) -> Result<()> {
        self.invoke("batch_cancel", caller, |inv| {
            settle_srps(inv, srp_ids, SrpState::Created, SrpState::Cancelled)
        })
    }
}

fn lock_srps(inv: &mut Invocation<'_>, srp_ids: &[SrpId]) -> Result<()> {
    let buyer = inv.caller;
    inv.engine().check_batch(srp_ids.len())?;
    ensure_unique(srp_ids)?;

    // Pass 1
    let mut capital_by_asset = Totals::new();
    let mut capitals = Vec::with_capacity(srp_ids.len());
    {
        let state = inv.state();
        for id in srp_ids {
            let srp = state.srp(id)?;
            if srp.buyer != buyer {
                return Err(Error::Unauthorized {
                    role: "buyer",
                    caller: buyer,
                });
            }
            if srp.state != SrpState::Created {
                return Err(Error::InvalidState {
                    srp: *id,
                    expected: SrpState::Created,
                    actual: srp.state,
                });
            }
            let capital = coordination_capital(srp.amount)?;
            capital_by_asset.add(srp.token, capital, "batch capital")?;
            capitals.push(capital);
        }
    }

    // Pass 2: state and counters before any transfer
    {
        let mut state = inv.state_mut();
        for id in srp_ids {
            let srp = state.srp_mut(id)?;
            srp.state = SrpState::Locked;
            let process_id = srp.process_id;
            let process = state.process_mut(&process_id)?;
            process.locked_count = process
                .locked_count
                .checked_add(1)
                .ok_or(Error::Overflow("locked count"))?;
        }
    }

    let accountant = inv.accountant();
    for (asset, capital) in capital_by_asset.iter() {
        let fee = accountant.collect(asset, &buyer, *capital)?;
        tracing::info!(%asset, buyer = %buyer, capital, fee, "Lock capital collected");
    }

    for (id, capital) in srp_ids.iter().zip(capitals) {
        {
            let mut state = inv.state_mut();
            let srp = state.srp_mut(id)?;
            srp.coordination_capital_balance = srp
                .coordination_capital_balance
                .checked_add(capital)
                .ok_or(Error::Overflow("escrowed balance"))?;
        }
        inv.record_transition(*id, Some(SrpState::Created), credit(capital)?)?;
    }

    tracing::info!(buyer = %buyer, count = srp_ids.len(), "SRPs locked");
    Ok(())
}

fn release_processes(
    inv: &mut Invocation<'_>,
    process_ids: &[ProcessId],
    per_item_deposit: Amount,
) -> Result<Vec<SrpId>> {
    let caller = inv.caller;
    let engine = inv.engine();
    engine.check_batch(process_ids.len())?;
    ensure_unique(process_ids)?;

    let minimum = engine.config().limits.min_cleanup_deposit();
    if per_item_deposit < minimum {
        return Err(Error::CleanupDepositTooLow {
            minimum,
            actual: per_item_deposit,
        });
    }
    let archivable_after = inv
        .now
        .checked_add(engine.config().archive.archive_delay_secs)
        .ok_or(Error::Overflow("archive time"))?;

    // Pass 1
    let mut plans = Vec::with_capacity(process_ids.len());
    let mut refunds: Totals<AssetId> = Totals::new();
    let mut deposits: Totals<AssetId> = Totals::new();
    {
        let state = inv.state();
        for process_id in process_ids {
            let process = state.process(process_id)?;
            let root = state.srp(&process.root())?;
            if root.buyer != caller {
                return Err(Error::Unauthorized {
                    role: "root buyer",
                    caller,
                });
            }
            if root.state != SrpState::Locked {
                return Err(Error::InvalidState {
                    srp: root.id,
                    expected: SrpState::Locked,
                    actual: root.state,
                });
            }

            let mut released = Vec::with_capacity(process.members.len());
            let mut refund: Amount = 0;
            for member in &process.members {
                let srp = state.srp(member)?;
                match srp.state {
                    SrpState::Locked => {
                        refund = refund
                            .checked_add(srp.amount)
                            .ok_or(Error::Overflow("release refund"))?;
                        released.push((srp.id, srp.amount));
                    }
                    SrpState::Cancelled => {}
                    actual => {
                        return Err(Error::InvalidState {
                            srp: srp.id,
                            expected: SrpState::Locked,
                            actual,
                        })
                    }
                }
            }

            let count = Amount::try_from(released.len()).map_err(|_| Error::Overflow("member count"))?;
            let deposit = per_item_deposit
                .checked_mul(count)
                .ok_or(Error::Overflow("cleanup deposit"))?;
            refunds.add(process.token, refund, "release refund")?;
            deposits.add(process.token, deposit, "cleanup deposit")?;
            plans.push(ReleasePlan {
                process_id: *process_id,
                buyer: process.buyer,
                released,
                deposit,
            });
        }
    }

    // Pass 2
    {
        let mut state = inv.state_mut();
        for plan in &plans {
            for (id, amount) in &plan.released {
                let srp = state.srp_mut(id)?;
                srp.coordination_capital_balance = srp
                    .coordination_capital_balance
                    .checked_sub(*amount)
                    .ok_or_else(|| {
                        Error::InvariantViolation(format!("{} balance below nominal amount", id))
                    })?;
                srp.state = SrpState::Released;
            }
            let process = state.process_mut(&plan.process_id)?;
            let released = u32::try_from(plan.released.len()).map_err(|_| Error::Overflow("member count"))?;
            process.locked_count = process.locked_count.checked_sub(released).ok_or_else(|| {
                Error::InvariantViolation(format!("{} locked count underflow", plan.process_id))
            })?;
            process.cleanup = Some(CleanupDeposit {
                total: plan.deposit,
                per_item: per_item_deposit,
                archivable_after,
            });
        }
    }

    // Net transfer per asset: refund share minus cleanup deposit
    let accountant = inv.accountant();
    for (asset, refund) in refunds.iter() {
        let deposit = deposits.get(asset);
        if *refund >= deposit {
            accountant.pay_out(asset, &caller, refund - deposit)?;
        } else {
            accountant.pull(asset, &caller, deposit - refund)?;
        }
        tracing::info!(%asset, buyer = %caller, refund, deposit, "Release settled");
    }

    let mut released_ids = Vec::new();
    for plan in &plans {
        for (id, amount) in &plan.released {
            inv.record_transition(*id, Some(SrpState::Locked), debit(*amount)?)?;
            released_ids.push(*id);
        }
        inv.emit(Report::CleanupDepositPlaced(CleanupDepositReport {
            process_id: plan.process_id,
            buyer: plan.buyer,
            total: plan.deposit,
            per_item: per_item_deposit,
            archivable_after,
        }));
    }

    tracing::info!(buyer = %caller, processes = plans.len(), released = released_ids.len(), "Processes released");
    Ok(released_ids)
}

/// Pay the seller the whole remaining balance and move to a terminal state
fn settle_srps(
    inv: &mut Invocation<'_>,
    srp_ids: &[SrpId],
    from: SrpState,
    to: SrpState,
) -> Result<()> {
    let seller = inv.caller;
    inv.engine().check_batch(srp_ids.len())?;
    ensure_unique(srp_ids)?;

    // Pass 1
    let mut payouts = Totals::new();
    {
        let state = inv.state();
        for id in srp_ids {
            let srp = state.srp(id)?;
            if srp.seller != seller {
                return Err(Error::Unauthorized {
                    role: "seller",
                    caller: seller,
                });
            }
            if srp.state != from {
                return Err(Error::InvalidState {
                    srp: *id,
                    expected: from,
                    actual: srp.state,
                });
            }
            payouts.add(srp.token, srp.coordination_capital_balance, "payout")?;
        }
    }

    // Pass 2
    let mut paid = Vec::with_capacity(srp_ids.len());
    {
        let mut state = inv.state_mut();
        for id in srp_ids {
            let srp = state.srp_mut(id)?;
            paid.push(srp.coordination_capital_balance);
            srp.coordination_capital_balance = 0;
            srp.state = to;
        }
    }

    let accountant = inv.accountant();
    for (asset, amount) in payouts.iter() {
        accountant.pay_out(asset, &seller, *amount)?;
        tracing::info!(%asset, seller = %seller, amount, to = to.as_str(), "Seller paid out");
    }

    for (id, amount) in srp_ids.iter().zip(paid) {
        inv.record_transition(*id, Some(from), debit(amount)?)?;
    }
    Ok(())
}

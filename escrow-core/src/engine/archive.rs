//! Permissionless archival of settled processes

use super::{ensure_unique, Invocation, SrpEngine, Totals};
use crate::events::{ProcessArchivedReport, Report, SrpArchivedReport};
use crate::types::{Address, Amount, ProcessId, SrpId, SrpState};
use crate::{Error, Result};

struct ArchivePlan {
    process_id: ProcessId,
    members: Vec<(SrpId, SrpState)>,
    payout: Amount,
}

impl SrpEngine {
    /// Delete a settled process and pay the caller its cleanup deposit
    pub fn archive_process(&self, caller: &Address, process_id: ProcessId) -> Result<Amount> {
        self.invoke("archive_process", caller, |inv| {
            archive_processes(inv, &[process_id])
        })
    }

    /// Archive several processes; bounties are paid once per asset
    ///
    /// Returns the total bounty paid to the caller.
    pub fn batch_archive_processes(
        &self,
        caller: &Address,
        process_ids: &[ProcessId],
    ) -> Result<Amount> {
        self.invoke("batch_archive_processes", caller, |inv| {
            archive_processes(inv, process_ids)
        })
    }
}

fn archive_processes(inv: &mut Invocation<'_>, process_ids: &[ProcessId]) -> Result<Amount> {
    let caller = inv.caller;
    let engine = inv.engine();
    engine.check_batch(process_ids.len())?;
    ensure_unique(process_ids)?;
    let delay = engine.config().archive.archive_delay_secs;

    // Pass 1
    let mut plans = Vec::with_capacity(process_ids.len());
    let mut payouts = Totals::new();
    let mut total: Amount = 0;
    {
        let state = inv.state();
        for process_id in process_ids {
            let process = state.process(process_id)?;

            let mut members = Vec::with_capacity(process.members.len());
            for member in &process.members {
                let srp = state.srp(member)?;
                if !srp.state.is_terminal() {
                    return Err(Error::NotArchivable {
                        process: *process_id,
                        reason: format!("{} is {}", member, srp.state.as_str()),
                    });
                }
                members.push((srp.id, srp.state));
            }

            // Without a cleanup record (root cancelled) the delay runs from creation
            let (archivable_after, payout) = match process.cleanup {
                Some(cleanup) => (cleanup.archivable_after, cleanup.total),
                None => (
                    process
                        .created_at
                        .checked_add(delay)
                        .ok_or(Error::Overflow("archive time"))?,
                    0,
                ),
            };
            if inv.now < archivable_after {
                return Err(Error::NotArchivable {
                    process: *process_id,
                    reason: format!("archivable after {}, now {}", archivable_after, inv.now),
                });
            }

            payouts.add(process.token, payout, "archive bounty")?;
            total = total
                .checked_add(payout)
                .ok_or(Error::Overflow("archive bounty"))?;
            plans.push(ArchivePlan {
                process_id: *process_id,
                members,
                payout,
            });
        }
    }

    // Pass 2
    {
        let mut state = inv.state_mut();
        for plan in &plans {
            for (id, _) in &plan.members {
                state.remove_srp(id);
            }
            state.remove_process(&plan.process_id);
        }
    }

    let accountant = inv.accountant();
    for (asset, payout) in payouts.iter() {
        accountant.pay_out(asset, &caller, *payout)?;
    }

    for plan in plans {
        for (srp_id, final_state) in &plan.members {
            inv.emit(Report::SrpArchived(SrpArchivedReport {
                srp_id: *srp_id,
                process_id: plan.process_id,
                final_state: *final_state,
            }));
        }
        inv.emit(Report::ProcessArchived(ProcessArchivedReport {
            process_id: plan.process_id,
            caller,
            payout: plan.payout,
            archived_ids: plan.members.iter().map(|(id, _)| *id).collect(),
        }));
    }

    tracing::info!(caller = %caller, processes = process_ids.len(), bounty = total, "Processes archived");
    Ok(total)
}

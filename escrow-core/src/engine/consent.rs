//! Consent records letting a root seller act for a third-party seller

use super::{Invocation, SrpEngine};
use crate::events::{ConsentReport, Report};
use crate::types::Address;
use crate::{Error, Result};

impl SrpEngine {
    /// Caller (a third-party seller) grants or revokes `delegate`
    pub fn grant_root_seller_consent(
        &self,
        caller: &Address,
        delegate: Address,
        approved: bool,
    ) -> Result<()> {
        self.invoke("grant_root_seller_consent", caller, |inv| {
            set_consents(inv, &[(delegate, approved)])
        })
    }

    /// Set several consent flags at once
    pub fn batch_grant_root_seller_consent(
        &self,
        caller: &Address,
        grants: &[(Address, bool)],
    ) -> Result<()> {
        self.invoke("batch_grant_root_seller_consent", caller, |inv| {
            set_consents(inv, grants)
        })
    }
}

fn set_consents(inv: &mut Invocation<'_>, grants: &[(Address, bool)]) -> Result<()> {
    let seller = inv.caller;
    inv.engine().check_batch(grants.len())?;

    for (delegate, _) in grants {
        if delegate.is_zero() {
            return Err(Error::ZeroAddress("delegate"));
        }
        if *delegate == seller {
            return Err(Error::SameParty(seller));
        }
    }

    {
        let mut state = inv.state_mut();
        for (delegate, approved) in grants {
            state.set_consent(seller, *delegate, *approved);
        }
    }

    for (delegate, approved) in grants {
        tracing::info!(seller = %seller, delegate = %delegate, approved, "Consent updated");
        inv.emit(Report::Consent(ConsentReport {
            seller,
            delegate: *delegate,
            approved: *approved,
        }));
    }
    Ok(())
}

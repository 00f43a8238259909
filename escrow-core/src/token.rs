//! Value-transfer backend
//!
//! The core never owns token balances; it talks to a [`TokenBackend`] that
//! exposes the usual balance/allowance/transfer surface plus the substrate's
//! all-or-nothing hooks. [`MemoryTokenBackend`] is a complete in-memory
//! implementation used by the simulator and the test suites. It can model
//! value-deducting assets, frozen accounts and programmable receive hooks.

use crate::crypto::{verify_digest, Signature};
use crate::hashing::CanonicalHasher;
use crate::types::{Address, Amount, AssetId, Hash32};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const PERMIT_TAG: &[u8] = b"SRP/permit/v1";

/// Standard token interface plus substrate transaction hooks
pub trait TokenBackend: Send + Sync {
    /// Balance of `owner`
    fn balance_of(&self, asset: &AssetId, owner: &Address) -> Amount;

    /// Units `owner` has authorized `spender` to move
    fn allowance(&self, asset: &AssetId, owner: &Address, spender: &Address) -> Amount;

    /// Move `amount` from `from` (the caller's own custody) to `to`
    fn transfer(&self, asset: &AssetId, from: &Address, to: &Address, amount: Amount)
        -> Result<()>;

    /// Move `amount` from `from` to `to` using `spender`'s allowance
    fn transfer_from(
        &self,
        asset: &AssetId,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<()>;

    /// Next permit nonce `owner` must sign for `asset`
    fn permit_nonce(&self, asset: &AssetId, owner: &Address) -> u64;

    /// Apply an off-chain signed allowance, rejecting it past its deadline at `now`
    fn permit(&self, asset: &AssetId, spender: &Address, permit: &Permit, now: u64) -> Result<()>;

    /// Open an all-or-nothing scope
    fn checkpoint(&self);

    /// Keep every change made since the matching checkpoint
    fn commit(&self);

    /// Discard every change made since the matching checkpoint
    fn revert(&self);
}

/// Signed allowance presented alongside a delegated addition
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Permit {
    /// Token owner granting the allowance
    pub owner: Address,
    /// Allowance value
    pub value: Amount,
    /// Unix-seconds deadline
    pub deadline: u64,
    /// Owner's permit nonce for the asset; each value is usable once
    pub nonce: u64,
    /// Owner's signature over [`permit_digest`]
    pub signature: Signature,
}

/// Digest an owner signs to authorize a permit
pub fn permit_digest(
    asset: &AssetId,
    owner: &Address,
    spender: &Address,
    value: Amount,
    deadline: u64,
    nonce: u64,
) -> Hash32 {
    let mut hasher = CanonicalHasher::new(PERMIT_TAG);
    hasher
        .write_address(asset.address())
        .write_address(owner)
        .write_address(spender)
        .write_u128(value)
        .write_u64(deadline)
        .write_u64(nonce);
    hasher.finish()
}

/// Notification passed to receive hooks after a transfer lands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferNotice {
    /// Asset moved
    pub asset: AssetId,
    /// Sender
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Units credited to the recipient
    pub amount: Amount,
}

/// Callback fired after a transfer credits its recipient
pub type ReceiveHook = Arc<dyn Fn(&TransferNotice) + Send + Sync>;

#[derive(Debug, Clone, Default)]
struct Books {
    balances: HashMap<(AssetId, Address), Amount>,
    allowances: HashMap<(AssetId, Address, Address), Amount>,
    permit_nonces: HashMap<(AssetId, Address), u64>,
}

#[derive(Default)]
struct Inner {
    books: Books,
    checkpoints: Vec<Books>,
    transfer_tax_bps: HashMap<AssetId, u32>,
    frozen: HashSet<(AssetId, Address)>,
    hooks: HashMap<Address, ReceiveHook>,
}

/// In-memory token ledger
#[derive(Default)]
pub struct MemoryTokenBackend {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for MemoryTokenBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryTokenBackend")
            .field("accounts", &inner.books.balances.len())
            .field("checkpoints", &inner.checkpoints.len())
            .finish()
    }
}

impl MemoryTokenBackend {
    /// Create empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit `amount` to `owner` out of thin air
    pub fn mint(&self, asset: &AssetId, owner: &Address, amount: Amount) {
        let mut inner = self.inner.lock();
        let balance = inner.books.balances.entry((*asset, *owner)).or_default();
        *balance = balance.saturating_add(amount);
    }

    /// Set the allowance `owner` grants `spender`
    pub fn approve(&self, asset: &AssetId, owner: &Address, spender: &Address, amount: Amount) {
        self.inner
            .lock()
            .books
            .allowances
            .insert((*asset, *owner, *spender), amount);
    }

    /// Make every transfer of `asset` burn `bps` of the amount (rounded up)
    pub fn set_transfer_tax(&self, asset: &AssetId, bps: u32) {
        self.inner.lock().transfer_tax_bps.insert(*asset, bps);
    }

    /// Reject transfers touching `owner` for `asset`
    pub fn freeze(&self, asset: &AssetId, owner: &Address) {
        self.inner.lock().frozen.insert((*asset, *owner));
    }

    /// Lift a freeze
    pub fn unfreeze(&self, asset: &AssetId, owner: &Address) {
        self.inner.lock().frozen.remove(&(*asset, *owner));
    }

    /// Install a hook fired whenever `recipient` is credited
    pub fn set_receive_hook(&self, recipient: &Address, hook: ReceiveHook) {
        self.inner.lock().hooks.insert(*recipient, hook);
    }

    fn tax(inner: &Inner, asset: &AssetId, amount: Amount) -> Amount {
        match inner.transfer_tax_bps.get(asset) {
            Some(&bps) if bps > 0 && amount > 0 => {
                // Ceil so even a single-unit transfer is visibly short
                let tax = amount.saturating_mul(Amount::from(bps)).div_ceil(10_000);
                tax.min(amount)
            }
            _ => 0,
        }
    }

    /// Debit/credit under the lock; returns the hook to fire, if any
    fn move_funds(
        &self,
        asset: &AssetId,
        from: &Address,
        to: &Address,
        amount: Amount,
        spender: Option<&Address>,
    ) -> Result<Option<(ReceiveHook, TransferNotice)>> {
        let mut inner = self.inner.lock();

        if inner.frozen.contains(&(*asset, *from)) || inner.frozen.contains(&(*asset, *to)) {
            return Err(Error::TransferRejected(format!(
                "account frozen for asset {}",
                asset
            )));
        }

        if let Some(spender) = spender {
            let key = (*asset, *from, *spender);
            let available = inner.books.allowances.get(&key).copied().unwrap_or(0);
            if available < amount {
                return Err(Error::InsufficientAllowance {
                    required: amount,
                    available,
                });
            }
            inner.books.allowances.insert(key, available - amount);
        }

        let available = inner
            .books
            .balances
            .get(&(*asset, *from))
            .copied()
            .unwrap_or(0);
        if available < amount {
            return Err(Error::InsufficientBalance {
                required: amount,
                available,
            });
        }

        let received = amount - Self::tax(&inner, asset, amount);
        inner.books.balances.insert((*asset, *from), available - amount);
        let credit = inner.books.balances.entry((*asset, *to)).or_default();
        *credit = credit
            .checked_add(received)
            .ok_or(Error::Overflow("token balance"))?;

        let notice = TransferNotice {
            asset: *asset,
            from: *from,
            to: *to,
            amount: received,
        };
        Ok(inner.hooks.get(to).cloned().map(|hook| (hook, notice)))
    }
}

impl TokenBackend for MemoryTokenBackend {
    fn balance_of(&self, asset: &AssetId, owner: &Address) -> Amount {
        self.inner
            .lock()
            .books
            .balances
            .get(&(*asset, *owner))
            .copied()
            .unwrap_or(0)
    }

    fn allowance(&self, asset: &AssetId, owner: &Address, spender: &Address) -> Amount {
        self.inner
            .lock()
            .books
            .allowances
            .get(&(*asset, *owner, *spender))
            .copied()
            .unwrap_or(0)
    }

    fn transfer(
        &self,
        asset: &AssetId,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<()> {
        // Hooks run with the books unlocked so they may call back in
        if let Some((hook, notice)) = self.move_funds(asset, from, to, amount, None)? {
            hook(&notice);
        }
        Ok(())
    }

    fn transfer_from(
        &self,
        asset: &AssetId,
        spender: &Address,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<()> {
        if let Some((hook, notice)) = self.move_funds(asset, from, to, amount, Some(spender))? {
            hook(&notice);
        }
        Ok(())
    }

    fn permit_nonce(&self, asset: &AssetId, owner: &Address) -> u64 {
        self.inner
            .lock()
            .books
            .permit_nonces
            .get(&(*asset, *owner))
            .copied()
            .unwrap_or(0)
    }

    fn permit(&self, asset: &AssetId, spender: &Address, permit: &Permit, now: u64) -> Result<()> {
        if permit.deadline < now {
            return Err(Error::Expired {
                deadline: permit.deadline,
                now,
            });
        }
        let digest = permit_digest(
            asset,
            &permit.owner,
            spender,
            permit.value,
            permit.deadline,
            permit.nonce,
        );
        if !verify_digest(&digest, &permit.signature, &permit.owner) {
            return Err(Error::InvalidSignature(permit.owner));
        }

        let mut inner = self.inner.lock();
        let key = (*asset, permit.owner);
        let expected = inner.books.permit_nonces.get(&key).copied().unwrap_or(0);
        if permit.nonce != expected {
            return Err(Error::InvalidNonce {
                signer: permit.owner,
                expected,
                actual: permit.nonce,
            });
        }
        let next = expected
            .checked_add(1)
            .ok_or(Error::Overflow("permit nonce"))?;
        inner.books.permit_nonces.insert(key, next);
        inner
            .books
            .allowances
            .insert((*asset, permit.owner, *spender), permit.value);
        Ok(())
    }

    fn checkpoint(&self) {
        let mut inner = self.inner.lock();
        let snapshot = inner.books.clone();
        inner.checkpoints.push(snapshot);
    }

    fn commit(&self) {
        self.inner.lock().checkpoints.pop();
    }

    fn revert(&self) {
        let mut inner = self.inner.lock();
        if let Some(snapshot) = inner.checkpoints.pop() {
            inner.books = snapshot;
        }
    }
}

//! Escrow accounting: deposits, fees and verified transfers
//!
//! Every transfer the core performs goes through [`EscrowAccountant`], which
//! compares post-transfer balances to pre-transfer balances and accepts only
//! exact receipt. Value-deducting assets are caught earlier by the creation
//! probe; anything that slips through fails here.

use crate::metrics::Metrics;
use crate::token::TokenBackend;
use crate::types::{Address, Amount, AssetId};
use crate::{Error, Result};
use std::sync::Arc;

/// Basis-point denominator
pub const BPS_DENOMINATOR: Amount = 10_000;

/// Deposit multiple applied to nominal value
pub const COORDINATION_MULTIPLIER: Amount = 2;

/// Fee collaborator (governance of the rate lives outside the core)
pub trait FeeCalculator: Send + Sync {
    /// Fee owed on `amount` of coordination capital
    fn calculate_fee(&self, amount: Amount) -> Result<Amount>;
}

/// Fixed-rate fee: floor(amount × bps / 10000)
#[derive(Debug, Clone, Copy)]
pub struct FixedRateFeeCalculator {
    fee_rate_bps: u32,
}

impl FixedRateFeeCalculator {
    /// Create with a rate in basis points
    pub fn new(fee_rate_bps: u32) -> Self {
        Self { fee_rate_bps }
    }
}

impl FeeCalculator for FixedRateFeeCalculator {
    fn calculate_fee(&self, amount: Amount) -> Result<Amount> {
        amount
            .checked_mul(Amount::from(self.fee_rate_bps))
            .map(|scaled| scaled / BPS_DENOMINATOR)
            .ok_or(Error::Overflow("fee"))
    }
}

/// Coordination capital for a nominal value
pub fn coordination_capital(nominal: Amount) -> Result<Amount> {
    nominal
        .checked_mul(COORDINATION_MULTIPLIER)
        .ok_or(Error::Overflow("coordination capital"))
}

/// Performs and verifies every value movement of the core
#[derive(Clone)]
pub struct EscrowAccountant {
    tokens: Arc<dyn TokenBackend>,
    fees: Arc<dyn FeeCalculator>,
    custody: Address,
    fee_recipient: Address,
    metrics: Metrics,
}

impl std::fmt::Debug for EscrowAccountant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EscrowAccountant")
            .field("custody", &self.custody)
            .field("fee_recipient", &self.fee_recipient)
            .finish()
    }
}

impl EscrowAccountant {
    /// Create accountant
    pub fn new(
        tokens: Arc<dyn TokenBackend>,
        fees: Arc<dyn FeeCalculator>,
        custody: Address,
        fee_recipient: Address,
        metrics: Metrics,
    ) -> Self {
        Self {
            tokens,
            fees,
            custody,
            fee_recipient,
            metrics,
        }
    }

    /// Custody address
    pub fn custody(&self) -> &Address {
        &self.custody
    }

    /// Token backend
    pub fn tokens(&self) -> &Arc<dyn TokenBackend> {
        &self.tokens
    }

    /// Fee on `capital`
    pub fn fee_for(&self, capital: Amount) -> Result<Amount> {
        self.fees.calculate_fee(capital)
    }

    /// capital + fee
    pub fn required_total(&self, capital: Amount) -> Result<Amount> {
        capital
            .checked_add(self.fee_for(capital)?)
            .ok_or(Error::Overflow("required total"))
    }

    /// Round-trip one unit to detect value-deducting assets
    ///
    /// Runs only when the depositor holds at least one unit and has
    /// authorized at least `required_total + 1`, so the probe never eats
    /// into the allowance the collection needs.
    pub fn probe(&self, asset: &AssetId, depositor: &Address, required_total: Amount) -> Result<()> {
        let allowance = self.tokens.allowance(asset, depositor, &self.custody);
        let needed = required_total
            .checked_add(1)
            .ok_or(Error::Overflow("probe allowance"))?;
        if self.tokens.balance_of(asset, depositor) < 1 || allowance < needed {
            tracing::debug!(%asset, %depositor, "Skipping asset probe");
            return Ok(());
        }

        let before = self.tokens.balance_of(asset, &self.custody);
        self.tokens
            .transfer_from(asset, &self.custody, depositor, &self.custody, 1)?;
        self.metrics.record_transfer();
        let received = self
            .tokens
            .balance_of(asset, &self.custody)
            .saturating_sub(before);

        if received != 1 {
            tracing::warn!(%asset, received, "Asset deducts value on transfer");
            return Err(Error::NonStandardAsset {
                asset: *asset,
                sent: 1,
                received,
            });
        }

        self.tokens.transfer(asset, &self.custody, depositor, 1)?;
        self.metrics.record_transfer();
        Ok(())
    }

    /// Collect `capital` into custody and the fee to the fee recipient
    ///
    /// Returns the fee charged.
    pub fn collect(&self, asset: &AssetId, payer: &Address, capital: Amount) -> Result<Amount> {
        let fee = self.fee_for(capital)?;
        let required = capital
            .checked_add(fee)
            .ok_or(Error::Overflow("required total"))?;

        let available = self.tokens.allowance(asset, payer, &self.custody);
        if available < required {
            return Err(Error::InsufficientAllowance {
                required,
                available,
            });
        }

        if fee > 0 {
            let recipient = self.fee_recipient;
            self.pull_exact(asset, payer, &recipient, fee)?;
        }
        let custody = self.custody;
        self.pull_exact(asset, payer, &custody, capital)?;

        tracing::debug!(%asset, %payer, capital, fee, "Collected coordination capital");
        Ok(fee)
    }

    /// Collect `amount` into custody without a fee
    pub fn pull(&self, asset: &AssetId, payer: &Address, amount: Amount) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let available = self.tokens.allowance(asset, payer, &self.custody);
        if available < amount {
            return Err(Error::InsufficientAllowance {
                required: amount,
                available,
            });
        }
        let custody = self.custody;
        self.pull_exact(asset, payer, &custody, amount)
    }

    /// Pay `amount` out of custody to `to`
    pub fn pay_out(&self, asset: &AssetId, to: &Address, amount: Amount) -> Result<()> {
        if amount == 0 {
            return Ok(());
        }
        let before = self.tokens.balance_of(asset, to);
        self.tokens.transfer(asset, &self.custody, to, amount)?;
        self.metrics.record_transfer();
        let received = self.tokens.balance_of(asset, to).saturating_sub(before);
        if received != amount {
            return Err(Error::TransferMismatch {
                expected: amount,
                actual: received,
            });
        }
        tracing::debug!(%asset, %to, amount, "Paid out of custody");
        Ok(())
    }

    fn pull_exact(&self, asset: &AssetId, payer: &Address, to: &Address, amount: Amount) -> Result<()> {
        let before = self.tokens.balance_of(asset, to);
        self.tokens
            .transfer_from(asset, &self.custody, payer, to, amount)?;
        self.metrics.record_transfer();
        let received = self.tokens.balance_of(asset, to).saturating_sub(before);
        if received != amount {
            return Err(Error::TransferMismatch {
                expected: amount,
                actual: received,
            });
        }
        Ok(())
    }
}

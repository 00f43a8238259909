//! Configuration for the escrow core

use crate::types::{Address, Amount};
use serde::{Deserialize, Serialize};

/// Escrow core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Address the core holds escrowed funds under
    pub custody: Address,

    /// Fee configuration
    pub fees: FeeConfig,

    /// Capacity limits
    pub limits: LimitConfig,

    /// Archival configuration
    pub archive: ArchiveConfig,

    /// Structured-signature domain
    pub signing: SigningConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "escrow-core".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            custody: Address::from_low_u64(0xC0FFEE),
            fees: FeeConfig::default(),
            limits: LimitConfig::default(),
            archive: ArchiveConfig::default(),
            signing: SigningConfig::default(),
        }
    }
}

/// Fee configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    /// Fee rate in basis points, applied to coordination capital
    pub fee_rate_bps: u32,

    /// Recipient of collected fees
    pub fee_recipient: Address,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            fee_rate_bps: 30, // 0.30%
            fee_recipient: Address::from_low_u64(0xFEE),
        }
    }
}

/// Capacity limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Maximum items per batch and members per process
    pub max_batch_size: usize,

    /// Minimum cleanup deposit per released member (token units)
    pub min_cleanup_deposit: u64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            min_cleanup_deposit: 1,
        }
    }
}

impl LimitConfig {
    /// Minimum cleanup deposit as an amount
    pub fn min_cleanup_deposit(&self) -> Amount {
        Amount::from(self.min_cleanup_deposit)
    }
}

/// Archival configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Delay between release and earliest archive (seconds)
    pub archive_delay_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            archive_delay_secs: 7 * 24 * 60 * 60, // 7 days
        }
    }
}

/// Structured-signature domain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Domain name bound into every delegated-addition digest
    pub domain_name: String,

    /// Deployment / chain identifier
    pub chain_id: u64,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            domain_name: "SRP Escrow".to_string(),
            chain_id: 1,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(bps) = std::env::var("ESCROW_FEE_BPS") {
            config.fees.fee_rate_bps = bps
                .parse()
                .map_err(|e| crate::Error::Config(format!("ESCROW_FEE_BPS: {}", e)))?;
        }

        if let Ok(max) = std::env::var("ESCROW_MAX_BATCH") {
            config.limits.max_batch_size = max
                .parse()
                .map_err(|e| crate::Error::Config(format!("ESCROW_MAX_BATCH: {}", e)))?;
        }

        if let Ok(delay) = std::env::var("ESCROW_ARCHIVE_DELAY_SECS") {
            config.archive.archive_delay_secs = delay
                .parse()
                .map_err(|e| crate::Error::Config(format!("ESCROW_ARCHIVE_DELAY_SECS: {}", e)))?;
        }

        if let Ok(custody) = std::env::var("ESCROW_CUSTODY") {
            config.custody = custody.parse()?;
        }

        if let Ok(recipient) = std::env::var("ESCROW_FEE_RECIPIENT") {
            config.fees.fee_recipient = recipient.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> crate::Result<()> {
        if self.fees.fee_rate_bps > 10_000 {
            return Err(crate::Error::Config(format!(
                "fee_rate_bps {} exceeds 10000",
                self.fees.fee_rate_bps
            )));
        }
        if self.limits.max_batch_size == 0 {
            return Err(crate::Error::Config("max_batch_size must be positive".to_string()));
        }
        if self.custody.is_zero() || self.fees.fee_recipient.is_zero() {
            return Err(crate::Error::Config(
                "custody and fee_recipient must be non-null".to_string(),
            ));
        }
        if self.custody == self.fees.fee_recipient {
            return Err(crate::Error::Config(
                "custody and fee_recipient must differ".to_string(),
            ));
        }
        Ok(())
    }
}

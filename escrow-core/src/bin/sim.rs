//! Escrow Simulation Binary
//!
//! Runs a two-party process with one signed third-party addition end to end
//! against the in-memory token backend and prints every committed report as
//! one JSON line on stdout. Logs go to stderr.
//!
//! Configuration comes from the TOML file named by the first argument, or
//! from `ESCROW_*` environment variables when no argument is given.

use anyhow::{ensure, Context};
use escrow_core::clock::{Clock, ManualClock};
use escrow_core::crypto::KeyPair;
use escrow_core::signature::SignedAddition;
use escrow_core::token::{MemoryTokenBackend, TokenBackend};
use escrow_core::{Address, AssetId, Config, SrpEngine};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ESCROW_LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading config from: {}", path);
            Config::from_file(&path).with_context(|| format!("loading {}", path))?
        }
        None => {
            info!("Loading config from environment variables");
            Config::from_env().context("loading config from environment")?
        }
    };
    let archive_delay = config.archive.archive_delay_secs;

    let tokens = Arc::new(MemoryTokenBackend::new());
    let clock = Arc::new(ManualClock::new(
        u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0),
    ));

    let engine = SrpEngine::new(config, tokens.clone())?.with_clock(clock.clone());
    let custody = *engine.custody();

    let asset = AssetId::new(Address::from_low_u64(0xA55E7));
    let seller = Address::from_low_u64(0x5E11);
    let buyer = Address::from_low_u64(0xB0B);
    let keeper = Address::from_low_u64(0xEE);
    let third_party = KeyPair::from_seed(&[7u8; 32]);

    for party in [seller, buyer, third_party.address()] {
        tokens.mint(&asset, &party, 100_000);
        tokens.approve(&asset, &party, &custody, 100_000);
    }

    // Root SRP: seller deposits 2x nominal plus fee, buyer mirrors it
    let (process_id, root_id) = engine.create_process(&seller, buyer, 1_000, asset)?;
    engine.lock(&buyer, root_id)?;

    // Third party joins through a signed payload relayed by the seller
    let payload = SignedAddition {
        process_id,
        seller: third_party.address(),
        amount: 500,
        token: asset,
        cumulative_value: 1_500,
        deadline: clock.now() + 3_600,
        nonce: engine.nonce_of(&third_party.address()),
        metadata: b"sim: third-party supply".to_vec(),
    };
    let signature = third_party.sign_digest(&payload.digest(&engine.domain_separator()));
    let member_id = engine.add_srp_signed(&seller, &payload, &signature, None)?;
    engine.lock(&buyer, member_id)?;

    let released = engine.release_process_with_cleanup_deposit(&buyer, process_id, 1)?;
    info!(released = released.len(), "Process released");

    engine.refund(&seller, root_id)?;
    engine.refund(&third_party.address(), member_id)?;
    engine.verify_process_chain(process_id)?;

    clock.advance(archive_delay);
    let bounty = engine.archive_process(&keeper, process_id)?;

    ensure!(
        tokens.balance_of(&asset, &custody) == engine.escrowed_total(&asset)?,
        "custody balance diverged from escrowed total"
    );
    info!(
        bounty,
        seller = tokens.balance_of(&asset, &seller),
        buyer = tokens.balance_of(&asset, &buyer),
        third_party = tokens.balance_of(&asset, &third_party.address()),
        fees = tokens.balance_of(&asset, &engine.config().fees.fee_recipient),
        "Simulation finished"
    );

    for report in engine.take_reports() {
        println!("{}", serde_json::to_string(&report)?);
    }
    Ok(())
}

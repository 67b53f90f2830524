// =============================================================================
// Meridian Grid Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Shadow mode unless the config explicitly selects
// Production: every exchange call is routed to the in-process sandbox and no
// real funds can move.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod alert;
mod capital;
mod config;
mod coordinator;
mod data;
mod decision;
mod exchange;
mod grid;
mod indicators;
mod risk;
mod selector;
mod sentiment;
mod supervisor;
mod types;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alert::Alerter;
use crate::config::EngineConfig;
use crate::coordinator::Coordinator;
use crate::data::{DataFeed, MarketCache};
use crate::exchange::{Exchange, PaperExchange, SymbolMeta};
use crate::risk::RiskMonitor;
use crate::sentiment::{sources, SentimentAgent};
use crate::supervisor::Supervisor;
use crate::types::{OperationMode, Severity, Venue};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║         Meridian Grid Engine — Starting Up               ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("MERIDIAN_CONFIG").unwrap_or_else(|_| "engine_config.json".to_string());
    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        EngineConfig::default()
    });

    // A bad configuration refuses to start: exit non-zero.
    config
        .validate()
        .context("configuration validation failed")?;

    info!(
        operation_mode = %config.operation_mode,
        max_concurrent_pairs = config.trading.max_concurrent_pairs,
        preferred = ?config.trading.preferred_pairs,
        "engine configured"
    );

    // ── 2. Exchange handle ───────────────────────────────────────────────
    let api_key = std::env::var("MERIDIAN_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("MERIDIAN_API_SECRET").unwrap_or_default();
    if config.operation_mode == OperationMode::Production && api_secret.is_empty() {
        anyhow::bail!("production mode requires MERIDIAN_API_KEY / MERIDIAN_API_SECRET");
    }

    let exchange = Arc::new(Exchange::new(config.operation_mode, api_key, api_secret));
    if let Exchange::Paper(paper) = exchange.as_ref() {
        seed_sandbox(paper, &config);
    }

    // ── 3. Shared services ───────────────────────────────────────────────
    let alerter = Arc::new(Alerter::from_env());
    let cache = Arc::new(MarketCache::new(config.cycles.cache_ttls.clone()));
    let feed = Arc::new(DataFeed::new(
        exchange.clone(),
        cache,
        Duration::from_secs(config.cycles.feed_refresh_secs),
    ));

    let sentiment = Arc::new(SentimentAgent::new(
        config.sentiment.clone(),
        sources::default_sources(),
        alerter.clone(),
    ));
    let risk = Arc::new(RiskMonitor::new(config.risk.clone(), alerter.clone()));

    let supervisor = Arc::new(Supervisor::new(
        config.clone(),
        exchange.clone(),
        feed.clone(),
        alerter.clone(),
        risk.clone(),
    ));
    supervisor.load_symbol_metas().await?;

    let coordinator = Arc::new(Coordinator::new(
        config.clone(),
        exchange.clone(),
        feed.clone(),
        sentiment.clone(),
        risk.clone(),
        supervisor.clone(),
    ));

    // ── 4. Service tasks ─────────────────────────────────────────────────
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut services = Vec::new();
    services.push(("data-feed", tokio::spawn(feed.clone().run(stop_rx.clone()))));
    services.push((
        "sentiment",
        tokio::spawn(sentiment.clone().run(stop_rx.clone())),
    ));
    services.push((
        "risk-monitor",
        tokio::spawn(risk.clone().run(
            feed.clone(),
            Duration::from_secs(config.cycles.risk_interval_secs),
            stop_rx.clone(),
        )),
    ));
    services.push((
        "supervisor",
        tokio::spawn(supervisor.clone().run(stop_rx.clone())),
    ));
    services.push((
        "coordinator",
        tokio::spawn(coordinator.clone().run(stop_rx.clone())),
    ));

    alerter.send(
        &format!("Meridian engine started in {} mode", config.operation_mode),
        Severity::Info,
    );
    info!("all subsystems running — press Ctrl+C to stop");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    let _ = stop_tx.send(true);
    supervisor.shutdown().await;

    let grace = Duration::from_secs(config.cycles.shutdown_grace_secs);
    for (name, handle) in services {
        match tokio::time::timeout(grace, handle).await {
            Ok(_) => info!(service = name, "service stopped"),
            Err(_) => {
                error!(service = name, "service did not stop inside the grace period");
            }
        }
    }

    if let Err(e) = config.save(&config_path) {
        warn!(error = %e, "failed to save config on shutdown");
    }

    alerter.send("Meridian engine shut down", Severity::Info);
    info!("Meridian shut down complete");
    Ok(())
}

/// Seed the shadow-mode sandbox: paper balances plus metadata and marks for
/// the preferred pairs, so the engine can trade without touching the venue.
fn seed_sandbox(paper: &PaperExchange, config: &EngineConfig) {
    let balance: f64 = std::env::var("MERIDIAN_PAPER_BALANCE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1_000.0);

    let spot_share = config.capital.spot_percentage / 100.0;
    paper.deposit(Venue::Spot, balance * spot_share);
    paper.deposit(Venue::Derivatives, balance * (1.0 - spot_share));

    // The sandbox lists every pair on the derivatives venue; the spot balance
    // exists so inter-venue transfers stay exercisable in shadow mode.
    for (i, symbol) in config.trading.preferred_pairs.iter().enumerate() {
        // Deterministic placeholder marks; live prices arrive once the data
        // feed starts polling real tickers in production.
        let mark = 100.0 * (i + 1) as f64;
        paper.register_symbol(SymbolMeta {
            symbol: symbol.clone(),
            venue: Venue::Derivatives,
            base_asset: symbol.trim_end_matches("USDT").to_string(),
            quote_asset: "USDT".to_string(),
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            max_qty: 1_000_000.0,
            min_notional: 5.0,
            price_precision: 2,
            qty_precision: 3,
            max_leverage: 20,
        });
        paper.set_mark_price(symbol, mark);
    }

    info!(
        balance,
        pairs = config.trading.preferred_pairs.len(),
        "shadow sandbox seeded"
    );
}

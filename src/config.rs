// =============================================================================
// Engine Configuration — effective settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Every tunable parameter
// lives here; the loader/secret store is external and only the effective
// object matters.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file. `validate()` runs once at startup; a
// bad config makes the supervisor refuse to start.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::OperationMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_preferred_pairs() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "SOLUSDT".to_string(),
        "ADAUSDT".to_string(),
    ]
}

fn default_max_concurrent_pairs() -> usize {
    5
}

fn default_min_capital_per_pair_usd() -> f64 {
    5.0
}

fn default_safety_buffer_fraction() -> f64 {
    0.1
}

fn default_spot_percentage() -> f64 {
    40.0
}

fn default_derivatives_percentage() -> f64 {
    60.0
}

fn default_max_single_asset_weight() -> f64 {
    0.3
}

fn default_leverage() -> u32 {
    10
}

fn default_transfer_floor_usd() -> f64 {
    100.0
}

fn default_min_transfer_usd() -> f64 {
    5.0
}

fn default_venue_reserve_usd() -> f64 {
    10.0
}

fn default_initial_levels() -> usize {
    10
}

fn default_min_levels() -> usize {
    4
}

fn default_max_levels() -> usize {
    30
}

fn default_initial_spacing_fraction() -> f64 {
    0.005
}

fn default_atr_period() -> usize {
    14
}

fn default_atr_multiplier() -> f64 {
    1.5
}

fn default_min_spacing_fraction() -> f64 {
    0.001
}

fn default_tp_fraction() -> f64 {
    0.01
}

fn default_sl_fraction() -> f64 {
    0.05
}

fn default_recenter_threshold_levels() -> f64 {
    2.0
}

fn default_order_budget_per_cycle() -> usize {
    10
}

fn default_max_failed_cycles() -> u32 {
    5
}

fn default_max_portfolio_var() -> f64 {
    0.1
}

fn default_max_drawdown() -> f64 {
    0.15
}

fn default_max_correlation_exposure() -> f64 {
    0.8
}

fn default_alert_cooldown_minutes() -> u64 {
    30
}

fn default_margin_ratio_floor() -> f64 {
    0.15
}

fn default_fetch_interval_minutes() -> u64 {
    10
}

fn default_smoothing_window() -> usize {
    10
}

fn default_source_weights() -> HashMap<String, f64> {
    let mut weights = HashMap::new();
    weights.insert("forum".to_string(), 0.4);
    weights.insert("news".to_string(), 0.4);
    weights.insert("social".to_string(), 0.2);
    weights
}

fn default_alert_threshold_positive() -> f64 {
    0.5
}

fn default_alert_threshold_negative() -> f64 {
    -0.5
}

fn default_retrain_trade_threshold() -> u64 {
    100
}

fn default_min_volume_usd_24h() -> f64 {
    1_000_000.0
}

fn default_min_price() -> f64 {
    0.01
}

fn default_max_spread_fraction() -> f64 {
    0.002
}

fn default_update_interval_hours() -> u64 {
    6
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_worker_interval_secs() -> u64 {
    5
}

fn default_coordinator_interval_secs() -> u64 {
    60
}

fn default_risk_interval_secs() -> u64 {
    30
}

fn default_feed_refresh_secs() -> u64 {
    15
}

fn default_ticker_ttl_secs() -> u64 {
    30
}

fn default_klines_ttl_secs() -> u64 {
    60
}

fn default_positions_ttl_secs() -> u64 {
    10
}

fn default_balances_ttl_secs() -> u64 {
    30
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_state_dir() -> String {
    "state".to_string()
}

// =============================================================================
// Sections
// =============================================================================

/// Worker-set and top-level trading limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Hard cap on concurrently running pair workers.
    #[serde(default = "default_max_concurrent_pairs")]
    pub max_concurrent_pairs: usize,

    /// Exchange floor below which a pair cannot be traded at all.
    #[serde(default = "default_min_capital_per_pair_usd")]
    pub min_capital_per_pair_usd: f64,

    /// Symbols always included in the candidate universe.
    #[serde(default = "default_preferred_pairs")]
    pub preferred_pairs: Vec<String>,

    /// Directory for persisted per-symbol grid snapshots.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_pairs: default_max_concurrent_pairs(),
            min_capital_per_pair_usd: default_min_capital_per_pair_usd(),
            preferred_pairs: default_preferred_pairs(),
            state_dir: default_state_dir(),
        }
    }
}

/// Grid ladder construction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_initial_levels")]
    pub initial_levels: usize,
    #[serde(default = "default_min_levels")]
    pub min_levels: usize,
    #[serde(default = "default_max_levels")]
    pub max_levels: usize,

    /// Fractional distance between adjacent levels (0.005 = 0.5 %).
    #[serde(default = "default_initial_spacing_fraction")]
    pub initial_spacing_fraction: f64,

    /// When enabled, spacing is derived from ATR instead of the fixed value.
    #[serde(default = "default_true")]
    pub use_dynamic_spacing: bool,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_atr_multiplier")]
    pub atr_multiplier: f64,
    /// Floor applied to ATR-derived spacing.
    #[serde(default = "default_min_spacing_fraction")]
    pub min_spacing_fraction: f64,

    /// Take-profit distance from weighted entry, as a fraction.
    #[serde(default = "default_tp_fraction")]
    pub tp_fraction: f64,
    /// Stop-loss distance from weighted entry, as a fraction.
    #[serde(default = "default_sl_fraction")]
    pub sl_fraction: f64,

    /// Recenter when the mark drifts this many grid levels from center.
    #[serde(default = "default_recenter_threshold_levels")]
    pub recenter_threshold_levels: f64,

    /// Maximum cancels and maximum places applied per cycle.
    #[serde(default = "default_order_budget_per_cycle")]
    pub order_budget_per_cycle: usize,

    /// Consecutive failed cycles before the worker halts with a critical alert.
    #[serde(default = "default_max_failed_cycles")]
    pub max_failed_cycles: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            initial_levels: default_initial_levels(),
            min_levels: default_min_levels(),
            max_levels: default_max_levels(),
            initial_spacing_fraction: default_initial_spacing_fraction(),
            use_dynamic_spacing: true,
            atr_period: default_atr_period(),
            atr_multiplier: default_atr_multiplier(),
            min_spacing_fraction: default_min_spacing_fraction(),
            tp_fraction: default_tp_fraction(),
            sl_fraction: default_sl_fraction(),
            recenter_threshold_levels: default_recenter_threshold_levels(),
            order_budget_per_cycle: default_order_budget_per_cycle(),
            max_failed_cycles: default_max_failed_cycles(),
        }
    }
}

/// Which override wins when a manual venue choice conflicts with the
/// rebalancing pass that enforces the spot/derivatives split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverridePrecedence {
    ManualWins,
    RebalanceWins,
}

impl Default for OverridePrecedence {
    fn default() -> Self {
        Self::ManualWins
    }
}

/// Capital partitioning across venues and pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalConfig {
    /// Fraction of total equity withheld from allocation.
    #[serde(default = "default_safety_buffer_fraction")]
    pub safety_buffer_fraction: f64,

    /// Target spot share of allocated capital, percent. Must sum to 100 with
    /// `derivatives_percentage`.
    #[serde(default = "default_spot_percentage")]
    pub spot_percentage: f64,
    #[serde(default = "default_derivatives_percentage")]
    pub derivatives_percentage: f64,

    /// Cap on a single symbol's allocation as a fraction of total equity.
    #[serde(default = "default_max_single_asset_weight")]
    pub max_single_asset_weight: f64,

    /// Leverage applied to derivatives allocations.
    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Inter-venue transfers are skipped entirely below this total balance.
    #[serde(default = "default_transfer_floor_usd")]
    pub transfer_floor_usd: f64,
    /// Smallest transfer worth executing.
    #[serde(default = "default_min_transfer_usd")]
    pub min_transfer_usd: f64,
    /// Balance left behind on the source venue after a transfer.
    #[serde(default = "default_venue_reserve_usd")]
    pub venue_reserve_usd: f64,

    /// Manual symbol → venue overrides.
    #[serde(default)]
    pub venue_overrides: HashMap<String, crate::types::Venue>,

    #[serde(default)]
    pub override_precedence: OverridePrecedence,
}

impl Default for CapitalConfig {
    fn default() -> Self {
        Self {
            safety_buffer_fraction: default_safety_buffer_fraction(),
            spot_percentage: default_spot_percentage(),
            derivatives_percentage: default_derivatives_percentage(),
            max_single_asset_weight: default_max_single_asset_weight(),
            leverage: default_leverage(),
            transfer_floor_usd: default_transfer_floor_usd(),
            min_transfer_usd: default_min_transfer_usd(),
            venue_reserve_usd: default_venue_reserve_usd(),
            venue_overrides: HashMap::new(),
            override_precedence: OverridePrecedence::default(),
        }
    }
}

/// Risk monitor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_portfolio_var")]
    pub max_portfolio_var: f64,
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,
    #[serde(default = "default_max_single_asset_weight")]
    pub max_single_asset_weight: f64,
    #[serde(default = "default_max_correlation_exposure")]
    pub max_correlation_exposure: f64,
    #[serde(default = "default_alert_cooldown_minutes")]
    pub alert_cooldown_minutes: u64,
    /// Available-margin ratio below which a critical alert fires.
    #[serde(default = "default_margin_ratio_floor")]
    pub margin_ratio_floor: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_portfolio_var: default_max_portfolio_var(),
            max_drawdown: default_max_drawdown(),
            max_single_asset_weight: default_max_single_asset_weight(),
            max_correlation_exposure: default_max_correlation_exposure(),
            alert_cooldown_minutes: default_alert_cooldown_minutes(),
            margin_ratio_floor: default_margin_ratio_floor(),
        }
    }
}

/// Sentiment aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentimentConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_fetch_interval_minutes")]
    pub fetch_interval_minutes: u64,
    /// Rolling-window length for the smoothed score.
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
    #[serde(default = "default_source_weights")]
    pub source_weights: HashMap<String, f64>,
    #[serde(default = "default_alert_threshold_positive")]
    pub alert_threshold_positive: f64,
    #[serde(default = "default_alert_threshold_negative")]
    pub alert_threshold_negative: f64,
    #[serde(default = "default_alert_cooldown_minutes")]
    pub alert_cooldown_minutes: u64,
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fetch_interval_minutes: default_fetch_interval_minutes(),
            smoothing_window: default_smoothing_window(),
            source_weights: default_source_weights(),
            alert_threshold_positive: default_alert_threshold_positive(),
            alert_threshold_negative: default_alert_threshold_negative(),
            alert_cooldown_minutes: default_alert_cooldown_minutes(),
        }
    }
}

/// Model-retraining trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrainConfig {
    /// Fills since the last retrain that trigger a new job. 0 disables.
    #[serde(default = "default_retrain_trade_threshold")]
    pub trade_threshold: u64,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            trade_threshold: default_retrain_trade_threshold(),
        }
    }
}

/// Pair-selection filters and cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairSelectionConfig {
    #[serde(default = "default_min_volume_usd_24h")]
    pub min_volume_usd_24h: f64,
    #[serde(default = "default_min_price")]
    pub min_price: f64,
    #[serde(default = "default_max_spread_fraction")]
    pub max_spread_fraction: f64,
    #[serde(default = "default_update_interval_hours")]
    pub update_interval_hours: u64,
    /// Only symbols quoted in this asset are considered.
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Weight of the sentiment tilt in the composite score (0 disables).
    #[serde(default)]
    pub sentiment_weight: f64,
    /// Cap on selected pairs per venue. None means only the global cap
    /// applies.
    #[serde(default)]
    pub max_per_venue: Option<usize>,
}

impl Default for PairSelectionConfig {
    fn default() -> Self {
        Self {
            min_volume_usd_24h: default_min_volume_usd_24h(),
            min_price: default_min_price(),
            max_spread_fraction: default_max_spread_fraction(),
            update_interval_hours: default_update_interval_hours(),
            quote_asset: default_quote_asset(),
            sentiment_weight: 0.1,
            max_per_venue: None,
        }
    }
}

/// TTLs for the four data-cache entry classes, seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheTtls {
    #[serde(default = "default_ticker_ttl_secs")]
    pub tickers_secs: u64,
    #[serde(default = "default_klines_ttl_secs")]
    pub klines_secs: u64,
    #[serde(default = "default_positions_ttl_secs")]
    pub positions_secs: u64,
    #[serde(default = "default_balances_ttl_secs")]
    pub balances_secs: u64,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            tickers_secs: default_ticker_ttl_secs(),
            klines_secs: default_klines_ttl_secs(),
            positions_secs: default_positions_ttl_secs(),
            balances_secs: default_balances_ttl_secs(),
        }
    }
}

/// Service cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleConfig {
    #[serde(default = "default_worker_interval_secs")]
    pub worker_interval_secs: u64,
    #[serde(default = "default_coordinator_interval_secs")]
    pub coordinator_interval_secs: u64,
    #[serde(default = "default_risk_interval_secs")]
    pub risk_interval_secs: u64,
    /// Cadence of the data-feed background refresher.
    #[serde(default = "default_feed_refresh_secs")]
    pub feed_refresh_secs: u64,
    /// Grace period granted to workers and service tasks on shutdown.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub cache_ttls: CacheTtls,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            worker_interval_secs: default_worker_interval_secs(),
            coordinator_interval_secs: default_coordinator_interval_secs(),
            risk_interval_secs: default_risk_interval_secs(),
            feed_refresh_secs: default_feed_refresh_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            cache_ttls: CacheTtls::default(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level effective configuration for the Meridian engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub operation_mode: OperationMode,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub capital: CapitalConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub sentiment: SentimentConfig,
    #[serde(default)]
    pub retrain: RetrainConfig,
    #[serde(default)]
    pub pair_selection: PairSelectionConfig,
    #[serde(default)]
    pub cycles: CycleConfig,
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;

        info!(
            path = %path.display(),
            operation_mode = %config.operation_mode,
            max_concurrent_pairs = config.trading.max_concurrent_pairs,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise engine config")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    /// Startup validation. Any violation makes the supervisor refuse to start
    /// and exit non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.trading.max_concurrent_pairs == 0 {
            bail!("trading.max_concurrent_pairs must be at least 1");
        }
        if self.trading.min_capital_per_pair_usd <= 0.0 {
            bail!("trading.min_capital_per_pair_usd must be positive");
        }

        let split = self.capital.spot_percentage + self.capital.derivatives_percentage;
        if (split - 100.0).abs() > 1e-9 {
            bail!(
                "capital.spot_percentage + capital.derivatives_percentage must sum to 100, got {split}"
            );
        }
        if !(0.0..1.0).contains(&self.capital.safety_buffer_fraction) {
            bail!("capital.safety_buffer_fraction must be in [0, 1)");
        }
        if !(0.0..=1.0).contains(&self.capital.max_single_asset_weight) {
            bail!("capital.max_single_asset_weight must be in (0, 1]");
        }
        if self.capital.leverage == 0 {
            bail!("capital.leverage must be at least 1");
        }

        if self.grid.min_levels < 2 {
            bail!("grid.min_levels must be at least 2");
        }
        if self.grid.min_levels > self.grid.max_levels {
            bail!("grid.min_levels must not exceed grid.max_levels");
        }
        if !(self.grid.min_levels..=self.grid.max_levels).contains(&self.grid.initial_levels) {
            bail!("grid.initial_levels must lie within [min_levels, max_levels]");
        }
        if self.grid.initial_spacing_fraction <= 0.0 {
            bail!("grid.initial_spacing_fraction must be positive");
        }
        if self.grid.tp_fraction <= 0.0 || self.grid.sl_fraction <= 0.0 {
            bail!("grid.tp_fraction and grid.sl_fraction must be positive");
        }
        if self.grid.order_budget_per_cycle == 0 {
            bail!("grid.order_budget_per_cycle must be at least 1");
        }

        if self.sentiment.smoothing_window == 0 {
            bail!("sentiment.smoothing_window must be at least 1");
        }
        if self.sentiment.alert_threshold_negative >= self.sentiment.alert_threshold_positive {
            bail!("sentiment alert thresholds must satisfy negative < positive");
        }

        if self.cycles.worker_interval_secs == 0 || self.cycles.coordinator_interval_secs == 0 {
            bail!("cycle intervals must be positive");
        }

        Ok(())
    }
}

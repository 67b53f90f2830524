// =============================================================================
// Decision engine — overview strategy label plus per-symbol tuning actions
// =============================================================================
//
// Overview mode runs once per coordinator cycle and reduces the market
// overview to a strategy label with a confidence. Per-symbol mode combines
// indicator readings with that label into one bounded tuning action plus
// suggested parameters, always explainable in a reasoning string.
//
// Suggested parameters must survive the dynamic order sizer; a failing
// suggestion degrades to Hold with the reason. Per-symbol analyses run in
// bounded concurrency and results are cached for a short TTL keyed by
// (symbol, snapshot hash).
// =============================================================================

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::capital::sizer::size_order;
use crate::config::GridConfig;
use crate::exchange::{Kline, SymbolMeta};
use crate::grid::engine::TuneAction;
use crate::indicators::adx::latest_adx;
use crate::indicators::bollinger::latest_bollinger;
use crate::indicators::macd::latest_macd_standard;
use crate::indicators::patterns::latest_pattern_score;
use crate::indicators::rsi::latest_rsi;
use crate::selector::{MarketOverview, TrendLabel};

/// Concurrent per-symbol analyses in one batch.
const BATCH_CONCURRENCY: usize = 3;
/// How long a cached per-symbol decision stays valid.
const DECISION_CACHE_TTL: Duration = Duration::from_secs(45);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StrategyLabel {
    Aggressive,
    Conservative,
    Balanced,
}

impl std::fmt::Display for StrategyLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aggressive => write!(f, "aggressive"),
            Self::Conservative => write!(f, "conservative"),
            Self::Balanced => write!(f, "balanced"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverviewDecision {
    pub label: StrategyLabel,
    pub confidence: f64,
}

/// Per-symbol context handed in by the coordinator.
#[derive(Debug, Clone)]
pub struct SymbolContext {
    pub symbol: String,
    pub price: f64,
    pub klines: Vec<Kline>,
    pub current_levels: usize,
    pub current_spacing: f64,
    /// Capital backing one grid level.
    pub per_level_budget: f64,
    pub target_fraction: f64,
    pub sentiment: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SymbolDecision {
    pub symbol: String,
    pub action: TuneAction,
    pub confidence: f64,
    pub reasoning: String,
}

pub struct DecisionEngine {
    grid: GridConfig,
    cache: Mutex<HashMap<(String, u64), (SymbolDecision, Instant)>>,
}

impl DecisionEngine {
    pub fn new(grid: GridConfig) -> Self {
        Self {
            grid,
            cache: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Overview mode
    // -------------------------------------------------------------------------

    /// Reduce the market overview to an overall strategy label. Without an
    /// external advisor the label derives from volume and volatility
    /// thresholds.
    pub fn overview(&self, overview: &MarketOverview) -> OverviewDecision {
        if overview.total_pairs == 0 {
            return OverviewDecision {
                label: StrategyLabel::Conservative,
                confidence: 0.3,
            };
        }

        let volatile = overview.avg_volatility > 0.06;
        let liquid = overview.avg_volume > 5e7;

        let (label, confidence) = match (overview.trend_label, volatile, liquid) {
            (TrendLabel::Bullish, _, true) => (StrategyLabel::Aggressive, 0.8),
            (TrendLabel::Bullish, _, false) => (StrategyLabel::Aggressive, 0.6),
            (TrendLabel::Bearish, true, _) => (StrategyLabel::Conservative, 0.8),
            (TrendLabel::Bearish, false, _) => (StrategyLabel::Conservative, 0.6),
            (TrendLabel::Neutral, true, _) => (StrategyLabel::Balanced, 0.6),
            (TrendLabel::Neutral, false, _) => (StrategyLabel::Balanced, 0.7),
        };

        debug!(label = %label, confidence, "overview strategy decided");
        OverviewDecision { label, confidence }
    }

    // -------------------------------------------------------------------------
    // Per-symbol mode
    // -------------------------------------------------------------------------

    /// Decide the tuning action for one symbol. Pure over the context; cached
    /// by (symbol, snapshot hash).
    pub fn decide_symbol(
        &self,
        ctx: &SymbolContext,
        overall: &OverviewDecision,
        meta: &SymbolMeta,
    ) -> SymbolDecision {
        let key = (ctx.symbol.clone(), snapshot_hash(ctx));
        {
            let cache = self.cache.lock();
            if let Some((decision, at)) = cache.get(&key) {
                if at.elapsed() < DECISION_CACHE_TTL {
                    return decision.clone();
                }
            }
        }

        let decision = self.analyse(ctx, overall, meta);

        let mut cache = self.cache.lock();
        cache.retain(|_, (_, at)| at.elapsed() < DECISION_CACHE_TTL);
        cache.insert(key, (decision.clone(), Instant::now()));
        decision
    }

    fn analyse(
        &self,
        ctx: &SymbolContext,
        overall: &OverviewDecision,
        meta: &SymbolMeta,
    ) -> SymbolDecision {
        let closes: Vec<f64> = ctx.klines.iter().map(|k| k.close).collect();

        let rsi = latest_rsi(&closes, 14);
        let adx = latest_adx(&ctx.klines, 14);
        let macd = latest_macd_standard(&closes);
        let bands = latest_bollinger(&closes, 20, 2.0);
        let patterns = latest_pattern_score(&ctx.klines);

        let aggressive = overall.label == StrategyLabel::Aggressive;

        // Explainable rules, most specific first.
        let (action, confidence, reasoning) = if closes.len() < 30 {
            (
                TuneAction::Hold,
                0.2,
                "insufficient history for indicators".to_string(),
            )
        } else if let Some(rsi_v) = rsi.filter(|r| *r >= 75.0) {
            (
                TuneAction::BiasBearish,
                0.7,
                format!("RSI {rsi_v:.1} deeply overbought, tilting sells"),
            )
        } else if let Some(rsi_v) = rsi.filter(|r| *r <= 25.0) {
            (
                TuneAction::BiasBullish,
                0.7,
                format!("RSI {rsi_v:.1} deeply oversold, tilting buys"),
            )
        } else if let Some(adx_v) = adx.filter(|a| *a >= 30.0) {
            // Strong trend: follow it, harder when the overview agrees.
            let bullish = macd.map_or(false, |m| m.histogram > 0.0)
                || patterns.as_ref().map_or(false, |p| p.score > 0.25)
                || ctx.sentiment > 0.4;
            if bullish {
                let action = if aggressive {
                    TuneAction::AggressiveBullish
                } else {
                    TuneAction::BiasBullish
                };
                (
                    action,
                    0.6 + overall.confidence * 0.2,
                    format!("ADX {adx_v:.1} uptrend with bullish momentum"),
                )
            } else {
                let action = if aggressive {
                    TuneAction::AggressiveBearish
                } else {
                    TuneAction::BiasBearish
                };
                (
                    action,
                    0.6 + overall.confidence * 0.2,
                    format!("ADX {adx_v:.1} trend with bearish momentum"),
                )
            }
        } else if let Some(bands_v) = bands.as_ref().filter(|b| b.width > 0.08) {
            (
                TuneAction::WiderSpacing,
                0.6,
                format!(
                    "band width {:.3} signals high volatility, widening spacing",
                    bands_v.width
                ),
            )
        } else if let Some(bands_v) = bands.as_ref().filter(|b| b.width < 0.015) {
            // Quiet range: densify the grid to harvest small oscillations.
            let action = if aggressive {
                TuneAction::MoreLevels
            } else {
                TuneAction::TighterSpacing
            };
            (
                action,
                0.55,
                format!("band width {:.3} signals a quiet range", bands_v.width),
            )
        } else {
            (TuneAction::Hold, 0.5, "no strong signal".to_string())
        };

        // Every suggestion must survive the order sizer before it reaches a
        // worker; a failing suggestion degrades to Hold with the reason.
        let validated = self.validate(ctx, meta, action);
        match validated {
            Ok(()) => SymbolDecision {
                symbol: ctx.symbol.clone(),
                action,
                confidence,
                reasoning,
            },
            Err(reason) => SymbolDecision {
                symbol: ctx.symbol.clone(),
                action: TuneAction::Hold,
                confidence: 0.3,
                reasoning: format!("suggestion rejected by sizer: {reason}"),
            },
        }
    }

    /// Check that the parameters implied by `action` still size valid orders.
    fn validate(
        &self,
        ctx: &SymbolContext,
        meta: &SymbolMeta,
        action: TuneAction,
    ) -> Result<(), String> {
        if action == TuneAction::Hold || ctx.price <= 0.0 {
            return Ok(());
        }

        let levels = match action {
            TuneAction::MoreLevels | TuneAction::AggressiveBullish | TuneAction::AggressiveBearish => {
                ((ctx.current_levels as f64 * 1.2).round() as usize)
                    .clamp(self.grid.min_levels, self.grid.max_levels)
            }
            TuneAction::FewerLevels => ((ctx.current_levels as f64 * 0.8).round() as usize)
                .clamp(self.grid.min_levels, self.grid.max_levels),
            _ => ctx.current_levels,
        };

        let scale = ctx.current_levels as f64 / levels.max(1) as f64;
        let budget = ctx.per_level_budget * scale;

        size_order(meta, budget, ctx.price, ctx.target_fraction)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    // -------------------------------------------------------------------------
    // Batched mode
    // -------------------------------------------------------------------------

    /// Analyse a batch of symbols with bounded concurrency.
    pub async fn decide_batch(
        &self,
        contexts: Vec<SymbolContext>,
        overall: OverviewDecision,
        metas: &HashMap<String, SymbolMeta>,
    ) -> Vec<SymbolDecision> {
        stream::iter(contexts)
            .map(|ctx| async move {
                let Some(meta) = metas.get(&ctx.symbol) else {
                    return SymbolDecision {
                        symbol: ctx.symbol.clone(),
                        action: TuneAction::Hold,
                        confidence: 0.0,
                        reasoning: "no symbol metadata".to_string(),
                    };
                };
                self.decide_symbol(&ctx, &overall, meta)
            })
            .buffer_unordered(BATCH_CONCURRENCY)
            .collect()
            .await
    }
}

/// Hash of the parts of a context that make a decision stale.
fn snapshot_hash(ctx: &SymbolContext) -> u64 {
    let mut hasher = DefaultHasher::new();
    ctx.symbol.hash(&mut hasher);
    ctx.klines.len().hash(&mut hasher);
    if let Some(last) = ctx.klines.last() {
        last.close_time.hash(&mut hasher);
        last.close.to_bits().hash(&mut hasher);
    }
    ctx.price.to_bits().hash(&mut hasher);
    ctx.current_levels.hash(&mut hasher);
    ctx.current_spacing.to_bits().hash(&mut hasher);
    hasher.finish()
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Venue;

    fn meta() -> SymbolMeta {
        SymbolMeta {
            symbol: "ETHUSDT".to_string(),
            venue: Venue::Derivatives,
            base_asset: "ETH".to_string(),
            quote_asset: "USDT".to_string(),
            tick_size: 0.01,
            step_size: 0.001,
            min_qty: 0.001,
            max_qty: 10_000.0,
            min_notional: 5.0,
            price_precision: 2,
            qty_precision: 3,
            max_leverage: 20,
        }
    }

    fn kline(close: f64, t: i64) -> Kline {
        Kline {
            open_time: t,
            close_time: t + 60_000,
            open: close,
            high: close * 1.001,
            low: close * 0.999,
            close,
            volume: 100.0,
        }
    }

    fn context(closes: &[f64]) -> SymbolContext {
        SymbolContext {
            symbol: "ETHUSDT".to_string(),
            price: *closes.last().unwrap_or(&2_000.0),
            klines: closes
                .iter()
                .enumerate()
                .map(|(i, &c)| kline(c, i as i64 * 60_000))
                .collect(),
            current_levels: 10,
            current_spacing: 0.005,
            per_level_budget: 50.0,
            target_fraction: 0.7,
            sentiment: 0.0,
        }
    }

    fn overview(trend: TrendLabel, volatility: f64) -> MarketOverview {
        MarketOverview {
            total_pairs: 20,
            avg_volume: 1e8,
            avg_volatility: volatility,
            trend_label: trend,
            hot_symbols: Vec::new(),
            conditions_label: "normal".to_string(),
        }
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(GridConfig::default())
    }

    #[test]
    fn overview_labels_follow_trend() {
        let engine = engine();
        assert_eq!(
            engine.overview(&overview(TrendLabel::Bullish, 0.03)).label,
            StrategyLabel::Aggressive
        );
        assert_eq!(
            engine.overview(&overview(TrendLabel::Bearish, 0.03)).label,
            StrategyLabel::Conservative
        );
        assert_eq!(
            engine.overview(&overview(TrendLabel::Neutral, 0.03)).label,
            StrategyLabel::Balanced
        );
    }

    #[test]
    fn empty_overview_is_conservative() {
        let engine = engine();
        let decision = engine.overview(&MarketOverview::empty());
        assert_eq!(decision.label, StrategyLabel::Conservative);
        assert!(decision.confidence <= 0.5);
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        let engine = engine();
        for trend in [TrendLabel::Bullish, TrendLabel::Bearish, TrendLabel::Neutral] {
            for vol in [0.0, 0.05, 0.2] {
                let d = engine.overview(&overview(trend, vol));
                assert!((0.0..=1.0).contains(&d.confidence));
            }
        }
    }

    #[test]
    fn short_history_holds() {
        let engine = engine();
        let ctx = context(&[2_000.0; 10]);
        let overall = engine.overview(&overview(TrendLabel::Neutral, 0.03));
        let decision = engine.decide_symbol(&ctx, &overall, &meta());
        assert_eq!(decision.action, TuneAction::Hold);
        assert!(decision.reasoning.contains("insufficient"));
    }

    #[test]
    fn overbought_rsi_tilts_bearish() {
        let engine = engine();
        // Strictly rising closes: RSI saturates at 100.
        let closes: Vec<f64> = (0..60).map(|i| 2_000.0 + i as f64 * 5.0).collect();
        let ctx = context(&closes);
        let overall = engine.overview(&overview(TrendLabel::Neutral, 0.03));
        let decision = engine.decide_symbol(&ctx, &overall, &meta());
        assert_eq!(decision.action, TuneAction::BiasBearish);
        assert!(decision.reasoning.contains("overbought"));
    }

    #[test]
    fn oversold_rsi_tilts_bullish() {
        let engine = engine();
        let closes: Vec<f64> = (0..60).map(|i| 2_500.0 - i as f64 * 5.0).collect();
        let ctx = context(&closes);
        let overall = engine.overview(&overview(TrendLabel::Neutral, 0.03));
        let decision = engine.decide_symbol(&ctx, &overall, &meta());
        assert_eq!(decision.action, TuneAction::BiasBullish);
    }

    #[test]
    fn failing_sizer_degrades_to_hold() {
        let engine = engine();
        let closes: Vec<f64> = (0..60).map(|i| 2_000.0 + i as f64 * 5.0).collect();
        let mut ctx = context(&closes);
        // Budget far below min-notional: any non-Hold suggestion must fail.
        ctx.per_level_budget = 1.0;
        ctx.target_fraction = 0.5;
        let overall = engine.overview(&overview(TrendLabel::Neutral, 0.03));
        let decision = engine.decide_symbol(&ctx, &overall, &meta());
        assert_eq!(decision.action, TuneAction::Hold);
        assert!(decision.reasoning.contains("sizer"));
    }

    #[test]
    fn decisions_are_cached_by_snapshot() {
        let engine = engine();
        let closes: Vec<f64> = (0..60).map(|i| 2_000.0 + i as f64 * 5.0).collect();
        let ctx = context(&closes);
        let overall = engine.overview(&overview(TrendLabel::Neutral, 0.03));

        let first = engine.decide_symbol(&ctx, &overall, &meta());
        let second = engine.decide_symbol(&ctx, &overall, &meta());
        assert_eq!(first.action, second.action);
        assert_eq!(engine.cache.lock().len(), 1);

        // A different snapshot occupies a new cache slot.
        let other = context(&closes[..50]);
        engine.decide_symbol(&other, &overall, &meta());
        assert_eq!(engine.cache.lock().len(), 2);
    }

    #[tokio::test]
    async fn batch_covers_every_symbol() {
        let engine = engine();
        let closes: Vec<f64> = (0..60).map(|i| 2_000.0 + (i as f64 * 0.5).sin()).collect();

        let mut metas = HashMap::new();
        metas.insert("ETHUSDT".to_string(), meta());

        let mut ctx_a = context(&closes);
        let mut ctx_b = context(&closes);
        ctx_b.symbol = "MISSINGUSDT".to_string();
        ctx_a.symbol = "ETHUSDT".to_string();

        let overall = engine.overview(&overview(TrendLabel::Neutral, 0.03));
        let decisions = engine.decide_batch(vec![ctx_a, ctx_b], overall, &metas).await;
        assert_eq!(decisions.len(), 2);

        let missing = decisions.iter().find(|d| d.symbol == "MISSINGUSDT").unwrap();
        assert_eq!(missing.action, TuneAction::Hold);
        assert!(missing.reasoning.contains("metadata"));
    }
}

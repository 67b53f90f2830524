// =============================================================================
// Pair selector — ranks the candidate universe and aggregates an overview
// =============================================================================
//
// Candidate universe: configured preferred list ∪ venue-listed symbols in the
// configured quote asset. One batched 24 h ticker call per venue; symbols
// failing the min-volume / min-price / max-spread filters are dropped.
//
// Composite score per surviving symbol:
//   volume percentile + |price change| + ADX percentile + sentiment tilt
//
// The market overview is aggregated over the FULL filtered set, not just the
// selected top K.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{PairSelectionConfig, TradingConfig};
use crate::exchange::{Exchange, ExchangeResult, Ticker24h};
use crate::indicators::adx::latest_adx;
use crate::types::Venue;

/// How many top-volume candidates get a kline fetch for the ADX component.
const ADX_CANDIDATE_CAP: usize = 20;
const ADX_PERIOD: usize = 14;
const ADX_KLINE_LIMIT: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrendLabel {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for TrendLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// Aggregate view of the filtered candidate universe, produced once per
/// coordinator cycle and consumed by the decision engine.
#[derive(Debug, Clone, Serialize)]
pub struct MarketOverview {
    pub total_pairs: usize,
    pub avg_volume: f64,
    /// Mean 24 h range as a fraction of the low.
    pub avg_volatility: f64,
    pub trend_label: TrendLabel,
    /// Top movers by absolute 24 h change.
    pub hot_symbols: Vec<String>,
    pub conditions_label: String,
}

impl MarketOverview {
    pub fn empty() -> Self {
        Self {
            total_pairs: 0,
            avg_volume: 0.0,
            avg_volatility: 0.0,
            trend_label: TrendLabel::Neutral,
            hot_symbols: Vec::new(),
            conditions_label: "no_data".to_string(),
        }
    }
}

/// One selected symbol plus the venue whose listing ranked it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedPair {
    pub symbol: String,
    pub venue: Venue,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectionResult {
    pub selected: Vec<SelectedPair>,
    pub overview: MarketOverview,
}

#[derive(Debug, Clone)]
struct Candidate {
    ticker: Ticker24h,
    venue: Venue,
    score: f64,
}

pub struct PairSelector {
    config: PairSelectionConfig,
    trading: TradingConfig,
}

impl PairSelector {
    pub fn new(config: PairSelectionConfig, trading: TradingConfig) -> Self {
        Self { config, trading }
    }

    // -------------------------------------------------------------------------
    // Entry point
    // -------------------------------------------------------------------------

    /// Select the top pairs and produce the market overview.
    pub async fn select(
        &self,
        exchange: &Arc<Exchange>,
        sentiment: f64,
    ) -> ExchangeResult<SelectionResult> {
        // One batched ticker call per venue; derivatives listing preferred
        // when a symbol trades on both.
        let mut tickers: HashMap<String, (Ticker24h, Venue)> = HashMap::new();
        for venue in [Venue::Spot, Venue::Derivatives] {
            match exchange.tickers_24h(venue).await {
                Ok(list) => {
                    for ticker in list {
                        tickers.insert(ticker.symbol.clone(), (ticker, venue));
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(venue = %venue, error = %e, "ticker batch failed, continuing with other venue")
                }
                Err(e) => return Err(e),
            }
        }

        let filtered = self.filter_candidates(tickers);

        // ADX for the top-volume slice only, to bound kline fetches.
        let mut by_volume: Vec<&(Ticker24h, Venue)> = filtered.values().collect();
        by_volume.sort_by(|a, b| b.0.quote_volume.total_cmp(&a.0.quote_volume));
        let mut adx_by_symbol = HashMap::new();
        for (ticker, venue) in by_volume.into_iter().take(ADX_CANDIDATE_CAP) {
            if let Ok(klines) = exchange
                .klines(&ticker.symbol, "1h", ADX_KLINE_LIMIT, *venue)
                .await
            {
                if let Some(adx) = latest_adx(&klines, ADX_PERIOD) {
                    adx_by_symbol.insert(ticker.symbol.clone(), adx);
                }
            }
        }

        Ok(self.rank(filtered, &adx_by_symbol, sentiment))
    }

    // -------------------------------------------------------------------------
    // Filtering
    // -------------------------------------------------------------------------

    fn filter_candidates(
        &self,
        tickers: HashMap<String, (Ticker24h, Venue)>,
    ) -> HashMap<String, (Ticker24h, Venue)> {
        let quote = &self.config.quote_asset;
        tickers
            .into_iter()
            .filter(|(symbol, (ticker, _))| {
                let preferred = self.trading.preferred_pairs.contains(symbol);
                if !preferred && !symbol.ends_with(quote.as_str()) {
                    return false;
                }
                ticker.quote_volume >= self.config.min_volume_usd_24h
                    && ticker.last_price >= self.config.min_price
                    && ticker.spread_fraction() <= self.config.max_spread_fraction
            })
            .collect()
    }

    // -------------------------------------------------------------------------
    // Ranking (pure — exercised directly by tests)
    // -------------------------------------------------------------------------

    pub fn rank(
        &self,
        filtered: HashMap<String, (Ticker24h, Venue)>,
        adx_by_symbol: &HashMap<String, f64>,
        sentiment: f64,
    ) -> SelectionResult {
        if filtered.is_empty() {
            debug!("no candidates survived the filters");
            return SelectionResult {
                selected: Vec::new(),
                overview: MarketOverview::empty(),
            };
        }

        let overview = self.build_overview(&filtered);

        // Percentile ranks over the filtered set.
        let mut volumes: Vec<f64> = filtered.values().map(|(t, _)| t.quote_volume).collect();
        volumes.sort_by(f64::total_cmp);
        let mut adx_values: Vec<f64> = adx_by_symbol.values().copied().collect();
        adx_values.sort_by(f64::total_cmp);

        let mut candidates: Vec<Candidate> = filtered
            .into_values()
            .map(|(ticker, venue)| {
                let volume_pct = percentile_rank(&volumes, ticker.quote_volume);
                let change_component = (ticker.price_change_pct.abs() / 10.0).min(1.0);
                let adx_component = adx_by_symbol
                    .get(&ticker.symbol)
                    .map(|adx| percentile_rank(&adx_values, *adx))
                    .unwrap_or(0.0);
                // Tilt toward symbols whose momentum agrees with sentiment.
                let tilt = self.config.sentiment_weight
                    * sentiment
                    * ticker.price_change_pct.signum();

                let score = volume_pct + change_component + adx_component + tilt;
                Candidate {
                    ticker,
                    venue,
                    score,
                }
            })
            .collect();

        // Descending by score; ties broken by higher quote volume.
        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.ticker.quote_volume.total_cmp(&a.ticker.quote_volume))
        });

        let max_pairs = self.trading.max_concurrent_pairs;
        let per_venue_cap = self.config.max_per_venue.unwrap_or(max_pairs).max(1);
        let mut per_venue: HashMap<Venue, usize> = HashMap::new();
        let mut selected = Vec::new();

        for candidate in candidates {
            if selected.len() >= max_pairs {
                break;
            }
            let count = per_venue.entry(candidate.venue).or_insert(0);
            if *count >= per_venue_cap {
                continue;
            }
            *count += 1;
            selected.push(SelectedPair {
                symbol: candidate.ticker.symbol,
                venue: candidate.venue,
            });
        }

        info!(
            selected = ?selected.iter().map(|p| p.symbol.as_str()).collect::<Vec<_>>(),
            universe = overview.total_pairs,
            trend = %overview.trend_label,
            "pair selection complete"
        );

        SelectionResult { selected, overview }
    }

    fn build_overview(&self, filtered: &HashMap<String, (Ticker24h, Venue)>) -> MarketOverview {
        let n = filtered.len() as f64;
        let avg_volume = filtered.values().map(|(t, _)| t.quote_volume).sum::<f64>() / n;
        let avg_change = filtered
            .values()
            .map(|(t, _)| t.price_change_pct)
            .sum::<f64>()
            / n;
        let avg_volatility = filtered
            .values()
            .map(|(t, _)| {
                if t.low > 0.0 {
                    (t.high - t.low) / t.low
                } else {
                    0.0
                }
            })
            .sum::<f64>()
            / n;

        let trend_label = if avg_change > 1.0 {
            TrendLabel::Bullish
        } else if avg_change < -1.0 {
            TrendLabel::Bearish
        } else {
            TrendLabel::Neutral
        };

        let mut movers: Vec<&(Ticker24h, Venue)> = filtered.values().collect();
        movers.sort_by(|a, b| {
            b.0.price_change_pct
                .abs()
                .total_cmp(&a.0.price_change_pct.abs())
        });
        let hot_symbols = movers
            .iter()
            .take(3)
            .map(|(t, _)| t.symbol.clone())
            .collect();

        let conditions_label = match (avg_volatility, trend_label) {
            (v, _) if v > 0.08 => "high_volatility",
            (v, TrendLabel::Neutral) if v < 0.02 => "calm",
            (_, TrendLabel::Bullish) => "trending_up",
            (_, TrendLabel::Bearish) => "trending_down",
            _ => "normal",
        }
        .to_string();

        MarketOverview {
            total_pairs: filtered.len(),
            avg_volume,
            avg_volatility,
            trend_label,
            hot_symbols,
            conditions_label,
        }
    }
}

/// Fraction of `sorted` at or below `value`, in [0, 1].
fn percentile_rank(sorted: &[f64], value: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let below = sorted.iter().filter(|&&v| v <= value).count();
    below as f64 / sorted.len() as f64
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(symbol: &str, price: f64, change_pct: f64, volume: f64) -> Ticker24h {
        Ticker24h {
            symbol: symbol.to_string(),
            last_price: price,
            price_change_pct: change_pct,
            quote_volume: volume,
            high: price * 1.05,
            low: price * 0.95,
            bid: price * 0.9995,
            ask: price * 1.0005,
        }
    }

    fn selector(max_pairs: usize) -> PairSelector {
        let mut trading = TradingConfig::default();
        trading.max_concurrent_pairs = max_pairs;
        PairSelector::new(PairSelectionConfig::default(), trading)
    }

    fn universe(entries: &[(&str, f64, f64, f64)]) -> HashMap<String, (Ticker24h, Venue)> {
        entries
            .iter()
            .map(|(s, p, c, v)| {
                (
                    s.to_string(),
                    (ticker(s, *p, *c, *v), Venue::Derivatives),
                )
            })
            .collect()
    }

    #[test]
    fn empty_universe_yields_empty_selection() {
        let result = selector(5).rank(HashMap::new(), &HashMap::new(), 0.0);
        assert!(result.selected.is_empty());
        assert_eq!(result.overview.total_pairs, 0);
        assert_eq!(result.overview.conditions_label, "no_data");
    }

    #[test]
    fn top_k_respects_max_pairs() {
        let filtered = universe(&[
            ("BTCUSDT", 45_000.0, 2.0, 5e9),
            ("ETHUSDT", 2_000.0, 3.0, 3e9),
            ("SOLUSDT", 150.0, 5.0, 1e9),
            ("ADAUSDT", 0.5, 1.0, 5e8),
        ]);
        let result = selector(2).rank(filtered, &HashMap::new(), 0.0);
        assert_eq!(result.selected.len(), 2);
        // Overview still aggregates the full filtered set.
        assert_eq!(result.overview.total_pairs, 4);
    }

    #[test]
    fn per_venue_cap_skips_over_full_venues() {
        let mut config = PairSelectionConfig::default();
        config.max_per_venue = Some(1);
        let mut trading = TradingConfig::default();
        trading.max_concurrent_pairs = 3;
        let selector = PairSelector::new(config, trading);

        let mut filtered = universe(&[
            ("AAAUSDT", 10.0, 5.0, 3e9),
            ("BBBUSDT", 10.0, 4.0, 2e9),
        ]);
        filtered.insert(
            "CCCUSDT".to_string(),
            (ticker("CCCUSDT", 10.0, 3.0, 1e9), Venue::Spot),
        );

        let result = selector.rank(filtered, &HashMap::new(), 0.0);
        // One derivatives pick, one spot pick; the second derivatives
        // candidate is skipped by the per-venue cap.
        assert_eq!(result.selected.len(), 2);
        let venues: Vec<Venue> = result.selected.iter().map(|p| p.venue).collect();
        assert!(venues.contains(&Venue::Derivatives));
        assert!(venues.contains(&Venue::Spot));
    }

    #[test]
    fn higher_volume_wins_ties() {
        let filtered = universe(&[
            ("AAAUSDT", 10.0, 2.0, 1e9),
            ("BBBUSDT", 10.0, 2.0, 2e9),
        ]);
        let result = selector(1).rank(filtered, &HashMap::new(), 0.0);
        assert_eq!(result.selected[0].symbol, "BBBUSDT");
    }

    #[test]
    fn adx_percentile_lifts_trending_symbols() {
        let filtered = universe(&[
            ("AAAUSDT", 10.0, 2.0, 1e9),
            ("BBBUSDT", 10.0, 2.0, 1e9),
        ]);
        let mut adx = HashMap::new();
        adx.insert("AAAUSDT".to_string(), 40.0);
        adx.insert("BBBUSDT".to_string(), 10.0);
        let result = selector(2).rank(filtered, &adx, 0.0);
        assert_eq!(result.selected[0].symbol, "AAAUSDT");
    }

    #[test]
    fn sentiment_tilt_prefers_aligned_momentum() {
        let filtered = universe(&[
            ("UPUSDT", 10.0, 4.0, 1e9),
            ("DOWNUSDT", 10.0, -4.0, 1e9),
        ]);
        // Strongly negative sentiment should favour the falling symbol.
        let result = selector(2).rank(filtered, &HashMap::new(), -1.0);
        assert_eq!(result.selected[0].symbol, "DOWNUSDT");
    }

    #[test]
    fn overview_trend_labels() {
        let bullish = selector(5).rank(
            universe(&[("AUSDT", 10.0, 5.0, 1e9), ("BUSDT", 10.0, 3.0, 1e9)]),
            &HashMap::new(),
            0.0,
        );
        assert_eq!(bullish.overview.trend_label, TrendLabel::Bullish);

        let bearish = selector(5).rank(
            universe(&[("AUSDT", 10.0, -5.0, 1e9), ("BUSDT", 10.0, -3.0, 1e9)]),
            &HashMap::new(),
            0.0,
        );
        assert_eq!(bearish.overview.trend_label, TrendLabel::Bearish);

        let neutral = selector(5).rank(
            universe(&[("AUSDT", 10.0, 0.5, 1e9), ("BUSDT", 10.0, -0.5, 1e9)]),
            &HashMap::new(),
            0.0,
        );
        assert_eq!(neutral.overview.trend_label, TrendLabel::Neutral);
    }

    #[test]
    fn hot_symbols_are_top_movers() {
        let filtered = universe(&[
            ("AUSDT", 10.0, 1.0, 1e9),
            ("BUSDT", 10.0, -9.0, 1e9),
            ("CUSDT", 10.0, 4.0, 1e9),
            ("DUSDT", 10.0, 0.2, 1e9),
        ]);
        let result = selector(5).rank(filtered, &HashMap::new(), 0.0);
        assert_eq!(result.overview.hot_symbols.len(), 3);
        assert_eq!(result.overview.hot_symbols[0], "BUSDT");
    }

    #[test]
    fn filters_drop_thin_markets() {
        let selector = selector(5);
        let mut tickers = HashMap::new();
        // Fails min volume.
        tickers.insert(
            "THINUSDT".to_string(),
            (ticker("THINUSDT", 10.0, 2.0, 100.0), Venue::Spot),
        );
        // Fails min price.
        tickers.insert(
            "DUSTUSDT".to_string(),
            (ticker("DUSTUSDT", 0.0001, 2.0, 1e9), Venue::Spot),
        );
        // Wrong quote asset.
        tickers.insert(
            "BTCEUR".to_string(),
            (ticker("BTCEUR", 40_000.0, 2.0, 1e9), Venue::Spot),
        );
        // Survives.
        tickers.insert(
            "GOODUSDT".to_string(),
            (ticker("GOODUSDT", 10.0, 2.0, 1e9), Venue::Spot),
        );

        let filtered = selector.filter_candidates(tickers);
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("GOODUSDT"));
    }

    #[test]
    fn percentile_rank_basics() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile_rank(&sorted, 4.0), 1.0);
        assert_eq!(percentile_rank(&sorted, 1.0), 0.25);
        assert_eq!(percentile_rank(&[], 1.0), 0.0);
    }
}

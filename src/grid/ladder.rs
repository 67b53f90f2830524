// =============================================================================
// Grid ladder — the set of resting limit orders around the center price
// =============================================================================
//
// Prices compound outward from the center: level i on the buy side sits at
// center × (1 - spacing)^i, on the sell side at center × (1 + spacing)^i.
// After tick rounding, collisions are resolved by expanding outward so that
// two consecutive levels always differ by at least one tick.
//
// Quantities come from the dynamic order sizer against the per-level budget;
// levels whose order cannot be made valid are dropped, and a ladder that
// cannot keep `min_levels` is refused.
// =============================================================================

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::capital::sizer::{size_order, SizerError};
use crate::exchange::SymbolMeta;
use crate::types::OrderSide;

/// Bias applied to per-side quantity when the coordinator tilts the grid.
const BIAS_QTY_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: f64,
    pub side: OrderSide,
    pub qty: f64,
    /// Exchange order id once the level is live.
    pub order_id: Option<u64>,
}

/// Ordered ladder of levels, ascending by price. Buys sit below the center,
/// sells above.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ladder {
    pub center_price: f64,
    pub spacing_fraction: f64,
    pub levels: Vec<GridLevel>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LadderError {
    #[error("only {survived} levels survived sizing, need at least {min_levels}")]
    TooFewLevels { survived: usize, min_levels: usize },

    #[error("spacing fraction must be positive, got {spacing}")]
    BadSpacing { spacing: f64 },

    #[error(transparent)]
    Sizer(#[from] SizerError),
}

/// Construction parameters for one ladder.
#[derive(Debug, Clone)]
pub struct LadderParams<'a> {
    pub meta: &'a SymbolMeta,
    pub center: f64,
    pub spacing_fraction: f64,
    pub grid_levels: usize,
    /// -1 bearish, 0 neutral, +1 bullish.
    pub direction_bias: i8,
    /// Margin capital the ladder divides across its levels.
    pub capital: f64,
    /// Sizer target fraction of the per-level budget.
    pub target_fraction: f64,
    pub min_levels: usize,
}

/// Build a ladder from `params`. See module docs for the rules.
pub fn build_ladder(params: &LadderParams<'_>) -> Result<Ladder, LadderError> {
    let LadderParams {
        meta,
        center,
        spacing_fraction,
        grid_levels,
        direction_bias,
        capital,
        target_fraction,
        min_levels,
    } = *params;

    if spacing_fraction <= 0.0 || !spacing_fraction.is_finite() {
        return Err(LadderError::BadSpacing {
            spacing: spacing_fraction,
        });
    }
    if center <= 0.0 || !center.is_finite() {
        return Err(SizerError::BadPrice { price: center }.into());
    }

    // Even counts split evenly; an odd count gives the extra level to the
    // biased side (buy side when neutral).
    let half = grid_levels / 2;
    let (buy_count, sell_count) = if grid_levels % 2 == 0 {
        (half, half)
    } else if direction_bias < 0 {
        (half, half + 1)
    } else {
        (half + 1, half)
    };

    let per_level_budget = capital / grid_levels.max(1) as f64;

    // --- Raw prices, rounded, deduplicated outward ---------------------------
    let buy_prices = side_prices(meta, center, spacing_fraction, buy_count, OrderSide::Buy);
    let sell_prices = side_prices(meta, center, spacing_fraction, sell_count, OrderSide::Sell);

    // --- Quantities via the sizer; invalid levels are dropped ----------------
    let mut levels: Vec<GridLevel> = Vec::with_capacity(buy_count + sell_count);
    for (side, prices) in [(OrderSide::Buy, buy_prices), (OrderSide::Sell, sell_prices)] {
        let biased = (direction_bias > 0 && side == OrderSide::Buy)
            || (direction_bias < 0 && side == OrderSide::Sell);
        for price in prices {
            let Ok(base_qty) = size_order(meta, per_level_budget, price, target_fraction) else {
                debug!(symbol = %meta.symbol, price, "level dropped by sizer");
                continue;
            };
            let qty = if biased {
                // Bias sizes up, but never past the per-level budget.
                let scaled = meta.floor_qty_to_step(base_qty * BIAS_QTY_FACTOR);
                if scaled * price <= per_level_budget + 1e-9 {
                    scaled.max(base_qty)
                } else {
                    base_qty
                }
            } else {
                base_qty
            };
            levels.push(GridLevel {
                price,
                side,
                qty,
                order_id: None,
            });
        }
    }

    if levels.len() < min_levels {
        return Err(LadderError::TooFewLevels {
            survived: levels.len(),
            min_levels,
        });
    }

    levels.sort_by(|a, b| a.price.total_cmp(&b.price));

    let ladder = Ladder {
        center_price: center,
        spacing_fraction,
        levels,
    };
    debug_assert!(ladder.validate(meta).is_ok());
    Ok(ladder)
}

/// Rounded, deduplicated prices for one side, nearest-to-center first.
fn side_prices(
    meta: &SymbolMeta,
    center: f64,
    spacing: f64,
    count: usize,
    side: OrderSide,
) -> Vec<f64> {
    let step = match side {
        OrderSide::Buy => 1.0 - spacing,
        OrderSide::Sell => 1.0 + spacing,
    };

    let mut prices = Vec::with_capacity(count);
    let mut factor = 1.0;
    for _ in 0..count {
        factor *= step;
        let mut price = meta.round_price_to_tick(center * factor);

        // The innermost level must sit strictly beyond the center.
        if prices.is_empty() {
            match side {
                OrderSide::Buy => {
                    let cap = meta.round_price_to_tick(center - meta.tick_size);
                    price = price.min(cap);
                }
                OrderSide::Sell => {
                    let floor = meta.round_price_to_tick(center + meta.tick_size);
                    price = price.max(floor);
                }
            }
        }

        // Collision with the previous level: expand one tick outward.
        if let Some(&prev) = prices.last() {
            let gap: f64 = match side {
                OrderSide::Buy => prev - price,
                OrderSide::Sell => price - prev,
            };
            if gap < meta.tick_size - 1e-12 {
                price = match side {
                    OrderSide::Buy => meta.round_price_to_tick(prev - meta.tick_size),
                    OrderSide::Sell => meta.round_price_to_tick(prev + meta.tick_size),
                };
            }
        }
        if price <= 0.0 {
            break;
        }
        prices.push(price);
    }
    prices
}

impl Ladder {
    pub fn buys(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.iter().filter(|l| l.side == OrderSide::Buy)
    }

    pub fn sells(&self) -> impl Iterator<Item = &GridLevel> {
        self.levels.iter().filter(|l| l.side == OrderSide::Sell)
    }

    /// Count of levels carrying a live order.
    pub fn live_count(&self) -> usize {
        self.levels.iter().filter(|l| l.order_id.is_some()).count()
    }

    /// Level owning `order_id`, if any.
    pub fn level_by_order(&self, order_id: u64) -> Option<&GridLevel> {
        self.levels.iter().find(|l| l.order_id == Some(order_id))
    }

    /// The price one spacing inside the innermost level of `side` — where the
    /// mirror order goes after a fill on the opposite side. With sells resting
    /// at center×(1+s)^i for i ≥ 1, the vacated slot is the center itself.
    pub fn mirror_price(&self, meta: &SymbolMeta, side: OrderSide) -> f64 {
        let innermost = match side {
            // Innermost sell = lowest sell price.
            OrderSide::Sell => self.sells().map(|l| l.price).fold(f64::MAX, f64::min),
            // Innermost buy = highest buy price.
            OrderSide::Buy => self.buys().map(|l| l.price).fold(f64::MIN, f64::max),
        };

        let raw = match side {
            OrderSide::Sell if innermost != f64::MAX => innermost / (1.0 + self.spacing_fraction),
            OrderSide::Buy if innermost != f64::MIN => innermost / (1.0 - self.spacing_fraction),
            _ => self.center_price,
        };
        meta.round_price_to_tick(raw)
    }

    /// Check ladder invariants: strictly ascending prices, at least one tick
    /// between consecutive levels, buys below sells.
    pub fn validate(&self, meta: &SymbolMeta) -> Result<(), String> {
        for pair in self.levels.windows(2) {
            let gap = pair[1].price - pair[0].price;
            if gap < meta.tick_size - 1e-9 {
                return Err(format!(
                    "levels {:.8} and {:.8} closer than one tick",
                    pair[0].price, pair[1].price
                ));
            }
            if pair[0].side == crate::types::OrderSide::Sell
                && pair[1].side == crate::types::OrderSide::Buy
            {
                return Err("buy level above a sell level".to_string());
            }
        }
        for level in &self.levels {
            let ticks = level.price / meta.tick_size;
            if (ticks - ticks.round()).abs() > 1e-6 {
                return Err(format!("price {:.8} not tick-aligned", level.price));
            }
        }
        Ok(())
    }

    /// How many levels of drift the mark sits away from the center.
    pub fn drift_levels(&self, mark: f64) -> f64 {
        if self.center_price <= 0.0 || self.spacing_fraction <= 0.0 {
            return 0.0;
        }
        (mark - self.center_price).abs() / (self.center_price * self.spacing_fraction)
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

    fn params<'a>(meta: &'a SymbolMeta) -> LadderParams<'a> {
        LadderParams {
            meta,
            center: 2_000.0,
            spacing_fraction: 0.005,
            grid_levels: 4,
            direction_bias: 0,
            capital: 100.0,
            target_fraction: 0.4,
            min_levels: 2,
        }
    }

    #[test]
    fn ladder_matches_reference_prices() {
        // 4 levels around 2000 at 0.5% spacing:
        // buys 1990.00, 1980.05; sells 2010.00, 2020.05.
        let meta = meta();
        let ladder = build_ladder(&params(&meta)).unwrap();

        let buys: Vec<f64> = ladder.buys().map(|l| l.price).collect();
        let sells: Vec<f64> = ladder.sells().map(|l| l.price).collect();
        assert_eq!(buys, vec![1_980.05, 1_990.00]);
        assert_eq!(sells, vec![2_010.00, 2_020.05]);

        // Per-level qty: $25 budget at 40% => $10 target => 0.005 ETH at 1990.
        let level_1990 = ladder.levels.iter().find(|l| l.price == 1_990.00).unwrap();
        assert!((level_1990.qty - 0.005).abs() < 1e-12);
        assert!(level_1990.qty * 1_990.0 >= 5.0);
    }

    #[test]
    fn ladder_validates_invariants() {
        let meta = meta();
        let ladder = build_ladder(&params(&meta)).unwrap();
        assert!(ladder.validate(&meta).is_ok());
    }

    #[test]
    fn tick_collisions_expand_outward() {
        // Spacing smaller than one tick forces every raw price onto the same
        // rounded value; dedup must walk them outward one tick apart.
        let mut tight = meta();
        tight.tick_size = 0.5;
        tight.price_precision = 1;
        let p = LadderParams {
            meta: &tight,
            center: 1_000.0,
            spacing_fraction: 0.0001, // 0.1 raw gap vs 0.5 tick
            grid_levels: 6,
            direction_bias: 0,
            capital: 600.0,
            target_fraction: 1.0,
            min_levels: 2,
        };
        let ladder = build_ladder(&p).unwrap();
        assert!(ladder.validate(&tight).is_ok());
        assert_eq!(ladder.levels.len(), 6);
    }

    #[test]
    fn undersized_levels_are_dropped_and_min_enforced() {
        let meta = meta();
        let mut p = params(&meta);
        p.capital = 8.0; // $2 per level cannot carry a $5 min-notional order
        p.min_levels = 2;
        let err = build_ladder(&p).unwrap_err();
        assert!(matches!(err, LadderError::TooFewLevels { survived: 0, .. }));
    }

    #[test]
    fn odd_level_count_gives_extra_to_bias_side() {
        let meta = meta();
        let mut p = params(&meta);
        p.grid_levels = 5;
        p.capital = 200.0;

        p.direction_bias = 1;
        let bullish = build_ladder(&p).unwrap();
        assert_eq!(bullish.buys().count(), 3);
        assert_eq!(bullish.sells().count(), 2);

        p.direction_bias = -1;
        let bearish = build_ladder(&p).unwrap();
        assert_eq!(bearish.buys().count(), 2);
        assert_eq!(bearish.sells().count(), 3);
    }

    #[test]
    fn bullish_bias_sizes_up_buy_side() {
        let meta = meta();
        let mut p = params(&meta);
        p.capital = 200.0; // roomy budget so the bias multiplier fits
        p.direction_bias = 1;
        let ladder = build_ladder(&p).unwrap();

        let buy_qty: f64 = ladder.buys().map(|l| l.qty).sum();
        let sell_qty: f64 = ladder.sells().map(|l| l.qty).sum();
        assert!(buy_qty > sell_qty, "buy {buy_qty} should exceed sell {sell_qty}");
    }

    #[test]
    fn mirror_price_fills_the_vacated_slot() {
        let meta = meta();
        let ladder = build_ladder(&params(&meta)).unwrap();
        // Sells rest at 2010.00 and 2020.05; the vacated sell slot is the
        // center itself.
        assert_eq!(ladder.mirror_price(&meta, OrderSide::Sell), 2_000.0);
        assert_eq!(ladder.mirror_price(&meta, OrderSide::Buy), 2_000.0);
    }

    #[test]
    fn drift_measured_in_levels() {
        let meta = meta();
        let mut p = params(&meta);
        p.center = 45_000.0;
        p.capital = 10_000.0;
        let ladder = build_ladder(&p).unwrap();
        // Mark 45750 at 0.5% spacing = 3.33 levels of drift.
        let drift = ladder.drift_levels(45_750.0);
        assert!((drift - 3.333).abs() < 0.01);
    }

    #[test]
    fn zero_spacing_is_refused() {
        let meta = meta();
        let mut p = params(&meta);
        p.spacing_fraction = 0.0;
        assert!(matches!(
            build_ladder(&p),
            Err(LadderError::BadSpacing { .. })
        ));
    }
}

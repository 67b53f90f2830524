// =============================================================================
// Dynamic order sizer — total-function quantity derivation
// =============================================================================
//
// Given a budget and a price, produce a venue-valid quantity or a structured
// reason why none exists:
//   1. target notional = budget * target_fraction
//   2. qty = floor(target notional / price) to step size
//   3. clip to [min_qty, max_qty]
//   4. bump up to reach min_notional if required
//   5. if the bumped order would exceed the full budget, fail
//
// Used by the capital manager when deriving grid parameters and by the grid
// engine for every level and every tuning action.
// =============================================================================

use thiserror::Error;

use crate::exchange::SymbolMeta;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SizerError {
    #[error("price must be positive, got {price}")]
    BadPrice { price: f64 },

    #[error("budget {budget:.4} with fraction {fraction:.2} yields zero quantity at price {price:.4}")]
    ZeroQuantity {
        budget: f64,
        fraction: f64,
        price: f64,
    },

    #[error(
        "min-notional bump needs {required:.4} but budget is {budget:.4} ({symbol} @ {price:.4})"
    )]
    BumpExceedsBudget {
        symbol: String,
        required: f64,
        budget: f64,
        price: f64,
    },

    #[error("cannot fit {min_levels} levels into budget {budget:.4} for {symbol}")]
    CannotFitLevels {
        symbol: String,
        budget: f64,
        min_levels: usize,
    },
}

/// Derive a valid order quantity. See module docs for the algorithm.
pub fn size_order(
    meta: &SymbolMeta,
    budget: f64,
    price: f64,
    target_fraction: f64,
) -> Result<f64, SizerError> {
    if price <= 0.0 || !price.is_finite() {
        return Err(SizerError::BadPrice { price });
    }

    let target_notional = budget * target_fraction;
    let mut qty = meta.floor_qty_to_step(target_notional / price);

    // Clip into the venue's [min_qty, max_qty] band.
    if qty < meta.min_qty {
        qty = meta.ceil_qty_to_step(meta.min_qty);
    }
    qty = qty.min(meta.floor_qty_to_step(meta.max_qty));

    if qty <= 0.0 {
        return Err(SizerError::ZeroQuantity {
            budget,
            fraction: target_fraction,
            price,
        });
    }

    // Bump to the notional floor.
    if !meta.meets_min_notional(price, qty) {
        qty = meta.ceil_qty_to_step(meta.min_notional / price);
        while !meta.meets_min_notional(price, qty) {
            qty = meta.ceil_qty_to_step(qty + meta.step_size);
        }
    }

    let notional = price * qty;
    if notional > budget + 1e-9 {
        return Err(SizerError::BumpExceedsBudget {
            symbol: meta.symbol.clone(),
            required: notional,
            budget,
            price,
        });
    }

    Ok(qty)
}

/// Reduce `levels` until the per-level order passes the sizer, or fail once
/// fewer than `min_levels` remain.
///
/// Returns the largest level count `<= levels` for which
/// `size_order(allocated / count, price, target_fraction)` succeeds.
pub fn fit_levels(
    meta: &SymbolMeta,
    allocated: f64,
    price: f64,
    target_fraction: f64,
    levels: usize,
    min_levels: usize,
) -> Result<usize, SizerError> {
    let mut count = levels;
    while count >= min_levels.max(1) {
        let per_level = allocated / count as f64;
        if size_order(meta, per_level, price, target_fraction).is_ok() {
            return Ok(count);
        }
        count -= 1;
    }
    Err(SizerError::CannotFitLevels {
        symbol: meta.symbol.clone(),
        budget: allocated,
        min_levels,
    })
}

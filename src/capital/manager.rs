// =============================================================================
// Capital manager — partitions the multi-venue bankroll into allocations
// =============================================================================
//
// Pipeline per reallocation:
//   1. Withhold the safety buffer from total equity.
//   2. Feasible pair count = min(configured max, available / min-per-pair).
//   3. Per symbol, choose a venue (manual override or scored auto-choice),
//      then rebalance venue choices against the target spot/derivatives
//      split. Precedence between manual and rebalancing overrides is an
//      explicit config flag.
//   4. Per-pair capital = available / feasible, capped by the single-asset
//      weight limit.
//   5. When the chosen venue lacks free balance, attempt an inter-venue
//      transfer for the shortfall (only above the transfer-worthwhile floor
//      and leaving the per-venue reserve); fall back to the other venue on
//      failure.
//   6. Derive grid parameters from capital tiers and validate them through
//      the order sizer, shrinking the level count when needed.
//
// Computations are pure over the balance snapshot; only transfers touch the
// exchange, serialized by the single allocation pass.
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::capital::sizer::fit_levels;
use crate::config::{CapitalConfig, GridConfig, OverridePrecedence, TradingConfig};
use crate::exchange::{Exchange, SymbolMeta, Ticker24h, TransferDirection};
use crate::selector::SelectedPair;
use crate::types::{BalanceSnapshot, Venue};

const QUOTE_ASSET: &str = "USDT";

/// The contract a grid worker trades under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub symbol: String,
    pub venue: Venue,
    pub allocated_usd: f64,
    pub max_position_usd: f64,
    pub grid_levels: usize,
    pub spacing_fraction: f64,
    pub leverage: u32,
}

impl Allocation {
    /// Fraction of the per-level budget the sizer targets.
    pub fn position_cap_fraction(&self) -> f64 {
        if self.allocated_usd > 0.0 {
            (self.max_position_usd / self.allocated_usd).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Capital the ladder actually spans (leverage-scaled on derivatives).
    pub fn effective_capital(&self) -> f64 {
        self.allocated_usd * self.leverage as f64
    }
}

/// Result of one allocation pass.
#[derive(Debug, Clone, Default)]
pub struct AllocationOutcome {
    pub allocations: Vec<Allocation>,
    pub warnings: Vec<String>,
}

/// Everything the allocation pass reads, snapshotted up front.
pub struct AllocationInputs<'a> {
    pub balances: &'a BalanceSnapshot,
    pub candidates: &'a [SelectedPair],
    pub tickers: &'a HashMap<String, Ticker24h>,
    /// Symbol metadata per venue; a symbol absent from a venue map is not
    /// listed there.
    pub metas: &'a HashMap<Venue, HashMap<String, SymbolMeta>>,
}

pub struct CapitalManager {
    capital: CapitalConfig,
    grid: GridConfig,
    trading: TradingConfig,
}

impl CapitalManager {
    pub fn new(capital: CapitalConfig, grid: GridConfig, trading: TradingConfig) -> Self {
        Self {
            capital,
            grid,
            trading,
        }
    }

    // -------------------------------------------------------------------------
    // Allocation pass
    // -------------------------------------------------------------------------

    pub async fn allocate(
        &self,
        exchange: &Exchange,
        inputs: AllocationInputs<'_>,
    ) -> AllocationOutcome {
        let mut outcome = AllocationOutcome::default();

        let total_equity = inputs.balances.total_equity();
        let min_per_pair = self.trading.min_capital_per_pair_usd;

        if total_equity < min_per_pair {
            let msg = format!(
                "insufficient capital: total equity {total_equity:.2} below the {min_per_pair:.2} per-pair floor"
            );
            warn!("{msg}");
            outcome.warnings.push(msg);
            return outcome;
        }

        let available = total_equity * (1.0 - self.capital.safety_buffer_fraction);
        let max_by_capital = (available / min_per_pair).floor() as usize;
        let feasible = self
            .trading
            .max_concurrent_pairs
            .min(max_by_capital)
            .min(inputs.candidates.len());

        if feasible == 0 {
            let msg = format!(
                "no pair can be funded: {available:.2} available after buffer, {} candidates",
                inputs.candidates.len()
            );
            warn!("{msg}");
            outcome.warnings.push(msg);
            return outcome;
        }

        let per_pair = (available / feasible as f64)
            .min(self.capital.max_single_asset_weight * total_equity);

        // Free balances tracked locally as the pass consumes them.
        let mut free: HashMap<Venue, f64> = HashMap::new();
        free.insert(Venue::Spot, inputs.balances.venue(Venue::Spot).free);
        free.insert(
            Venue::Derivatives,
            inputs.balances.venue(Venue::Derivatives).free,
        );

        // Target split only applies while both venues hold balance.
        let both_funded = free[&Venue::Spot] > 0.0 && free[&Venue::Derivatives] > 0.0;
        let total_to_allocate = per_pair * feasible as f64;
        let target_spot = if both_funded {
            (total_to_allocate * self.capital.spot_percentage / 100.0).min(free[&Venue::Spot])
        } else {
            0.0
        };
        let target_derivatives = if both_funded {
            (total_to_allocate * self.capital.derivatives_percentage / 100.0)
                .min(free[&Venue::Derivatives])
        } else {
            0.0
        };

        let mut allocated_per_venue: HashMap<Venue, f64> = HashMap::new();

        for pair in inputs.candidates.iter().take(feasible) {
            let symbol = &pair.symbol;

            let manual = self
                .capital
                .venue_overrides
                .get(symbol)
                .copied()
                .filter(|venue| Self::is_listed(inputs.metas, symbol, *venue));

            let mut venue = match manual {
                Some(v) => v,
                None => self.auto_choose_venue(symbol, pair.venue, &inputs, &free),
            };

            // Rebalancing pass toward the configured split. A manual override
            // only participates when the config says rebalancing wins.
            let rebalance_may_move = manual.is_none()
                || self.capital.override_precedence == OverridePrecedence::RebalanceWins;
            if both_funded && rebalance_may_move {
                let spot_done = allocated_per_venue.get(&Venue::Spot).copied().unwrap_or(0.0);
                let deriv_done = allocated_per_venue
                    .get(&Venue::Derivatives)
                    .copied()
                    .unwrap_or(0.0);
                if venue == Venue::Spot
                    && spot_done >= target_spot
                    && deriv_done < target_derivatives
                    && Self::is_listed(inputs.metas, symbol, Venue::Derivatives)
                {
                    venue = Venue::Derivatives;
                } else if venue == Venue::Derivatives
                    && deriv_done >= target_derivatives
                    && spot_done < target_spot
                    && Self::is_listed(inputs.metas, symbol, Venue::Spot)
                {
                    venue = Venue::Spot;
                }
            }

            // Funding: transfer the shortfall or fall back to the other venue.
            if free[&venue] + 1e-9 < per_pair {
                match self
                    .fund_venue(exchange, venue, per_pair, &mut free, &mut outcome.warnings)
                    .await
                {
                    Ok(()) => {}
                    Err(()) => {
                        let other = other_venue(venue);
                        if free[&other] + 1e-9 >= per_pair
                            && Self::is_listed(inputs.metas, symbol, other)
                        {
                            info!(symbol = %symbol, from = %venue, to = %other, "falling back to the other venue");
                            venue = other;
                        } else {
                            let msg =
                                format!("{symbol}: insufficient balance on both venues, skipped");
                            warn!("{msg}");
                            outcome.warnings.push(msg);
                            continue;
                        }
                    }
                }
            }

            // Grid parameters from capital tiers, validated by the sizer.
            let (mut levels, spacing, cap_fraction, leverage) =
                self.derive_grid_parameters(per_pair, venue);

            let Some(meta) = inputs.metas.get(&venue).and_then(|m| m.get(symbol)) else {
                let msg = format!("{symbol}: no symbol metadata on {venue}, skipped");
                warn!("{msg}");
                outcome.warnings.push(msg);
                continue;
            };
            let Some(price) = inputs.tickers.get(symbol).map(|t| t.last_price) else {
                let msg = format!("{symbol}: no ticker price, skipped");
                warn!("{msg}");
                outcome.warnings.push(msg);
                continue;
            };

            // Sizing runs on margin capital; leverage only shapes the tiers.
            match fit_levels(
                meta,
                per_pair,
                price,
                cap_fraction,
                levels,
                self.grid.min_levels,
            ) {
                Ok(valid_levels) => {
                    if valid_levels < levels {
                        info!(
                            symbol = %symbol,
                            requested = levels,
                            reduced = valid_levels,
                            "level count reduced to satisfy min-notional"
                        );
                    }
                    levels = valid_levels;
                }
                Err(e) => {
                    let msg = format!("{symbol}: {e}, skipped");
                    warn!("{msg}");
                    outcome.warnings.push(msg);
                    continue;
                }
            }

            *free.entry(venue).or_default() -= per_pair;
            *allocated_per_venue.entry(venue).or_default() += per_pair;

            outcome.allocations.push(Allocation {
                symbol: symbol.clone(),
                venue,
                allocated_usd: per_pair,
                max_position_usd: per_pair * cap_fraction,
                grid_levels: levels,
                spacing_fraction: spacing,
                leverage,
            });
        }

        let spot_total = allocated_per_venue.get(&Venue::Spot).copied().unwrap_or(0.0);
        let deriv_total = allocated_per_venue
            .get(&Venue::Derivatives)
            .copied()
            .unwrap_or(0.0);
        info!(
            pairs = outcome.allocations.len(),
            per_pair,
            spot_total,
            derivatives_total = deriv_total,
            "allocation pass complete"
        );

        outcome
    }

    // -------------------------------------------------------------------------
    // Venue choice
    // -------------------------------------------------------------------------

    /// Scored auto-choice between venues: volume depth, volatility, liquidity
    /// tier of the symbol, and free-balance skew. Falls back to the venue
    /// holding more balance on a near-tie.
    fn auto_choose_venue(
        &self,
        symbol: &str,
        listing_hint: Venue,
        inputs: &AllocationInputs<'_>,
        free: &HashMap<Venue, f64>,
    ) -> Venue {
        let listed_spot = Self::is_listed(inputs.metas, symbol, Venue::Spot);
        let listed_deriv = Self::is_listed(inputs.metas, symbol, Venue::Derivatives);
        match (listed_spot, listed_deriv) {
            (true, false) => return Venue::Spot,
            (false, true) => return Venue::Derivatives,
            (false, false) => return listing_hint,
            (true, true) => {}
        }

        let mut score = 0.0_f64; // positive favours derivatives

        if let Some(ticker) = inputs.tickers.get(symbol) {
            // Deep books trade better on the derivatives venue.
            if ticker.quote_volume > 1e9 {
                score += 1.0;
            }
            // High volatility favours the leveraged venue.
            if ticker.price_change_pct.abs() > 3.0 {
                score += 1.0;
            }
        }
        // Top-tier symbols carry the deepest derivatives liquidity.
        if self.trading.preferred_pairs.iter().any(|p| p == symbol) {
            score += 0.5;
        }
        // Free-balance skew.
        let spot_free = free.get(&Venue::Spot).copied().unwrap_or(0.0);
        let deriv_free = free.get(&Venue::Derivatives).copied().unwrap_or(0.0);
        if deriv_free > spot_free {
            score += 0.5;
        } else if spot_free > deriv_free {
            score -= 0.5;
        }

        if score > 0.5 {
            Venue::Derivatives
        } else if score < -0.5 {
            Venue::Spot
        } else if deriv_free >= spot_free {
            Venue::Derivatives
        } else {
            Venue::Spot
        }
    }

    fn is_listed(
        metas: &HashMap<Venue, HashMap<String, SymbolMeta>>,
        symbol: &str,
        venue: Venue,
    ) -> bool {
        metas
            .get(&venue)
            .map(|m| m.contains_key(symbol))
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Transfers
    // -------------------------------------------------------------------------

    /// Try to cover the shortfall on `venue` by transferring from the other
    /// venue. `Err(())` means the caller should fall back or skip.
    async fn fund_venue(
        &self,
        exchange: &Exchange,
        venue: Venue,
        per_pair: f64,
        free: &mut HashMap<Venue, f64>,
        warnings: &mut Vec<String>,
    ) -> Result<(), ()> {
        let shortfall = per_pair - free[&venue];
        let other = other_venue(venue);
        let total: f64 = free.values().sum();

        if total < self.capital.transfer_floor_usd {
            // Not worth shuffling a tiny bankroll around.
            return Err(());
        }
        if shortfall < self.capital.min_transfer_usd {
            return Err(());
        }
        if free[&other] < shortfall + self.capital.venue_reserve_usd {
            return Err(());
        }

        let direction = match venue {
            Venue::Spot => TransferDirection::DerivativesToSpot,
            Venue::Derivatives => TransferDirection::SpotToDerivatives,
        };

        match exchange.transfer(QUOTE_ASSET, shortfall, direction).await {
            Ok(()) => {
                info!(amount = shortfall, direction = %direction, "inter-venue transfer executed");
                *free.entry(other).or_default() -= shortfall;
                *free.entry(venue).or_default() += shortfall;
                Ok(())
            }
            Err(e) => {
                let msg = format!("transfer {direction} of {shortfall:.2} failed: {e}");
                warn!("{msg}");
                warnings.push(msg);
                Err(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Grid parameter tiers
    // -------------------------------------------------------------------------

    /// (levels, spacing_fraction, position_cap_fraction, leverage) derived
    /// from the allocated capital and venue.
    fn derive_grid_parameters(&self, allocated: f64, venue: Venue) -> (usize, f64, f64, u32) {
        let base_levels = self.grid.initial_levels;
        let base_spacing = self.grid.initial_spacing_fraction;

        let (levels, spacing, cap_fraction, leverage) = match venue {
            Venue::Derivatives => {
                let leverage = self.capital.leverage.max(1);
                let effective = allocated * leverage as f64;
                // Leverage funds denser grids with tighter spacing.
                if effective < 50.0 {
                    (base_levels.max(8), base_spacing * 0.5, 0.9, leverage)
                } else if effective < 200.0 {
                    (base_levels + 5, base_spacing * 0.3, 0.8, leverage)
                } else {
                    (25.min(base_levels + 10), base_spacing * 0.2, 0.7, leverage)
                }
            }
            Venue::Spot => {
                if allocated < 10.0 {
                    (base_levels.div_euclid(2).max(5), base_spacing * 1.5, 0.8, 1)
                } else if allocated < 50.0 {
                    (base_levels, base_spacing, 0.7, 1)
                } else {
                    (20.min(base_levels + 5), base_spacing * 0.8, 0.6, 1)
                }
            }
        };

        let levels = levels.clamp(self.grid.min_levels, self.grid.max_levels);
        (levels, spacing, cap_fraction, leverage)
    }
}

fn other_venue(venue: Venue) -> Venue {
    match venue {
        Venue::Spot => Venue::Derivatives,
        Venue::Derivatives => Venue::Spot,
    }
}

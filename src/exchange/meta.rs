// =============================================================================
// Symbol metadata — tick size, step size, notional floor per symbol
// =============================================================================
//
// Immutable per symbol, parsed once from the venue's exchange-info payload and
// cached. Every quoted price must be a multiple of `tick_size`, every quantity
// a multiple of `step_size`, and every order value at least `min_notional`.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::types::Venue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolMeta {
    pub symbol: String,
    pub venue: Venue,
    pub base_asset: String,
    pub quote_asset: String,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
    pub max_qty: f64,
    pub min_notional: f64,
    pub price_precision: u32,
    pub qty_precision: u32,
    pub max_leverage: u32,
}

impl SymbolMeta {
    /// Round `price` to the nearest multiple of the tick size.
    pub fn round_price_to_tick(&self, price: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return price;
        }
        let ticks = (price / self.tick_size).round();
        round_to_precision(ticks * self.tick_size, self.price_precision)
    }

    /// Round `qty` down to the nearest multiple of the step size.
    pub fn floor_qty_to_step(&self, qty: f64) -> f64 {
        if self.step_size <= 0.0 {
            return qty;
        }
        let steps = (qty / self.step_size + 1e-9).floor();
        round_to_precision(steps * self.step_size, self.qty_precision)
    }

    /// Round `qty` up to the nearest multiple of the step size.
    pub fn ceil_qty_to_step(&self, qty: f64) -> f64 {
        if self.step_size <= 0.0 {
            return qty;
        }
        let steps = (qty / self.step_size - 1e-9).ceil();
        round_to_precision(steps * self.step_size, self.qty_precision)
    }

    /// True when `price * qty` satisfies the venue's notional floor.
    pub fn meets_min_notional(&self, price: f64, qty: f64) -> bool {
        price * qty >= self.min_notional - 1e-9
    }

    /// Parse one symbol entry from an exchange-info payload.
    ///
    /// Filter layout follows the common venue convention:
    ///   PRICE_FILTER.tickSize, LOT_SIZE.{stepSize,minQty,maxQty},
    ///   MIN_NOTIONAL.minNotional (or NOTIONAL.minNotional on derivatives).
    pub fn parse(venue: Venue, entry: &serde_json::Value) -> ExchangeResult<Self> {
        let op = "exchange_info";
        let symbol = entry["symbol"]
            .as_str()
            .ok_or_else(|| ExchangeError::permanent(op, "symbol entry missing 'symbol'"))?
            .to_string();
        let base_asset = entry["baseAsset"].as_str().unwrap_or_default().to_string();
        let quote_asset = entry["quoteAsset"].as_str().unwrap_or_default().to_string();

        let price_precision = entry["pricePrecision"]
            .as_u64()
            .or_else(|| entry["quotePrecision"].as_u64())
            .unwrap_or(8) as u32;
        let qty_precision = entry["quantityPrecision"]
            .as_u64()
            .or_else(|| entry["baseAssetPrecision"].as_u64())
            .unwrap_or(8) as u32;

        let mut tick_size = 0.0;
        let mut step_size = 0.0;
        let mut min_qty = 0.0;
        let mut max_qty = f64::MAX;
        let mut min_notional = 0.0;

        if let Some(filters) = entry["filters"].as_array() {
            for filter in filters {
                match filter["filterType"].as_str() {
                    Some("PRICE_FILTER") => {
                        tick_size = parse_filter_f64(&filter["tickSize"]);
                    }
                    Some("LOT_SIZE") => {
                        step_size = parse_filter_f64(&filter["stepSize"]);
                        min_qty = parse_filter_f64(&filter["minQty"]);
                        let parsed_max = parse_filter_f64(&filter["maxQty"]);
                        if parsed_max > 0.0 {
                            max_qty = parsed_max;
                        }
                    }
                    Some("MIN_NOTIONAL") | Some("NOTIONAL") => {
                        min_notional = parse_filter_f64(&filter["minNotional"])
                            .max(parse_filter_f64(&filter["notional"]));
                    }
                    _ => {}
                }
            }
        }

        if tick_size <= 0.0 || step_size <= 0.0 {
            return Err(ExchangeError::permanent(
                op,
                format!("symbol {symbol} has no usable PRICE_FILTER/LOT_SIZE"),
            ));
        }

        let max_leverage = entry["maxLeverage"].as_u64().unwrap_or(match venue {
            Venue::Spot => 1,
            Venue::Derivatives => 20,
        }) as u32;

        Ok(Self {
            symbol,
            venue,
            base_asset,
            quote_asset,
            tick_size,
            step_size,
            min_qty,
            max_qty,
            min_notional,
            price_precision,
            qty_precision,
            max_leverage,
        })
    }
}

fn parse_filter_f64(val: &serde_json::Value) -> f64 {
    if let Some(s) = val.as_str() {
        s.parse().unwrap_or(0.0)
    } else {
        val.as_f64().unwrap_or(0.0)
    }
}

/// Round to `precision` decimal places, cleaning up binary-float dust left by
/// tick/step arithmetic.
fn round_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision.min(12) as i32);
    (value * factor).round() / factor
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn test_meta(symbol: &str, venue: Venue) -> SymbolMeta {
        SymbolMeta {
            symbol: symbol.to_string(),
            venue,
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

    #[test]
    fn price_rounds_to_nearest_tick() {
        let meta = test_meta("ETHUSDT", Venue::Derivatives);
        assert_eq!(meta.round_price_to_tick(1990.004), 1990.0);
        assert_eq!(meta.round_price_to_tick(1990.006), 1990.01);
        assert_eq!(meta.round_price_to_tick(2004.8753), 2004.88);
    }

    #[test]
    fn qty_floors_to_step() {
        let meta = test_meta("ETHUSDT", Venue::Derivatives);
        assert_eq!(meta.floor_qty_to_step(0.0129), 0.012);
        assert_eq!(meta.floor_qty_to_step(0.005), 0.005);
        assert_eq!(meta.ceil_qty_to_step(0.0041), 0.005);
    }

    #[test]
    fn min_notional_check() {
        let meta = test_meta("ETHUSDT", Venue::Derivatives);
        assert!(meta.meets_min_notional(1990.0, 0.005)); // $9.95
        assert!(!meta.meets_min_notional(1990.0, 0.002)); // $3.98
        // Exactly at the floor passes.
        assert!(meta.meets_min_notional(5.0, 1.0));
    }

    #[test]
    fn parse_from_exchange_info_entry() {
        let entry = serde_json::json!({
            "symbol": "ETHUSDT",
            "baseAsset": "ETH",
            "quoteAsset": "USDT",
            "pricePrecision": 2,
            "quantityPrecision": 3,
            "filters": [
                { "filterType": "PRICE_FILTER", "tickSize": "0.01" },
                { "filterType": "LOT_SIZE", "stepSize": "0.001", "minQty": "0.001", "maxQty": "10000" },
                { "filterType": "MIN_NOTIONAL", "minNotional": "5.0" }
            ]
        });
        let meta = SymbolMeta::parse(Venue::Derivatives, &entry).unwrap();
        assert_eq!(meta.symbol, "ETHUSDT");
        assert_eq!(meta.tick_size, 0.01);
        assert_eq!(meta.step_size, 0.001);
        assert_eq!(meta.min_notional, 5.0);
        assert_eq!(meta.max_qty, 10_000.0);
    }

    #[test]
    fn parse_rejects_missing_filters() {
        let entry = serde_json::json!({ "symbol": "XXXUSDT", "filters": [] });
        assert!(SymbolMeta::parse(Venue::Spot, &entry).is_err());
    }
}

// =============================================================================
// Paper exchange — shadow-mode sandbox with deterministic fills
// =============================================================================
//
// Every exchange call in shadow mode lands here; no request ever leaves the
// process and no real funds move. The sandbox keeps quote-asset balances per
// venue, resting limit orders, net positions, and a user-trade log.
//
// Fill rule (deterministic): a resting buy fills when the mark moves at or
// below its price, a resting sell when the mark moves at or above it. Market
// orders fill at the current mark immediately.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::exchange::error::{ExchangeError, ExchangeResult};
use crate::exchange::meta::SymbolMeta;
use crate::exchange::{
    AccountSummary, AssetBalance, Kline, OpenOrder, OrderAck, OrderSpec, PositionInfo, Ticker24h,
    TransferDirection, UserTrade,
};
use crate::types::{OrderSide, OrderType, Venue};

const QUOTE_ASSET: &str = "USDT";

#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: u64,
    symbol: String,
    venue: Venue,
    side: OrderSide,
    price: f64,
    quantity: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct QuoteBalance {
    free: f64,
    locked: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct NetPosition {
    size: f64,
    entry_price: f64,
}

#[derive(Debug, Default)]
struct Inner {
    metas: HashMap<String, SymbolMeta>,
    balances: HashMap<Venue, QuoteBalance>,
    marks: HashMap<String, f64>,
    open_orders: Vec<PaperOrder>,
    trades: Vec<UserTrade>,
    klines: HashMap<String, Vec<Kline>>,
    positions: HashMap<String, NetPosition>,
    next_order_id: u64,
    next_trade_id: u64,
    clock_ms: i64,
    /// Test hooks: simulate venue-side rejections.
    reject_orders: bool,
    fail_transfers: bool,
    transient_order_errors: bool,
}

/// In-process sandbox venue.
#[derive(Debug, Default)]
pub struct PaperExchange {
    inner: Mutex<Inner>,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    // -------------------------------------------------------------------------
    // Sandbox setup (used by shadow bootstrap and tests)
    // -------------------------------------------------------------------------

    /// Make `meta` tradable on the sandbox.
    pub fn register_symbol(&self, meta: SymbolMeta) {
        self.inner.lock().metas.insert(meta.symbol.clone(), meta);
    }

    /// Credit free quote balance on `venue`.
    pub fn deposit(&self, venue: Venue, amount: f64) {
        self.inner.lock().balances.entry(venue).or_default().free += amount;
    }

    /// Replace the kline history served for `symbol`.
    pub fn push_klines(&self, symbol: &str, klines: Vec<Kline>) {
        self.inner.lock().klines.insert(symbol.to_string(), klines);
    }

    /// Move the mark and fill any resting orders it crosses.
    pub fn set_mark_price(&self, symbol: &str, price: f64) {
        let mut inner = self.inner.lock();
        inner.marks.insert(symbol.to_string(), price);
        inner.clock_ms += 1;
        Self::match_orders(&mut inner, symbol, price);
    }

    /// Simulate the venue rejecting every subsequent order.
    pub fn set_reject_orders(&self, reject: bool) {
        self.inner.lock().reject_orders = reject;
    }

    /// Simulate transfer failures.
    pub fn set_fail_transfers(&self, fail: bool) {
        self.inner.lock().fail_transfers = fail;
    }

    /// Simulate a degraded venue: every place/cancel fails transiently.
    pub fn set_transient_order_errors(&self, fail: bool) {
        self.inner.lock().transient_order_errors = fail;
    }

    /// Total count of executed fills (test observability).
    pub fn fill_count(&self) -> usize {
        self.inner.lock().trades.len()
    }

    // -------------------------------------------------------------------------
    // Matching
    // -------------------------------------------------------------------------

    fn match_orders(inner: &mut Inner, symbol: &str, mark: f64) {
        let crossed: Vec<PaperOrder> = inner
            .open_orders
            .iter()
            .filter(|o| {
                o.symbol == symbol
                    && match o.side {
                        OrderSide::Buy => mark <= o.price,
                        OrderSide::Sell => mark >= o.price,
                    }
            })
            .cloned()
            .collect();

        for order in crossed {
            inner.open_orders.retain(|o| o.order_id != order.order_id);
            Self::execute_fill(inner, &order.symbol, order.venue, order.side, order.price, order.quantity, order.order_id);
        }
    }

    fn execute_fill(
        inner: &mut Inner,
        symbol: &str,
        venue: Venue,
        side: OrderSide,
        price: f64,
        qty: f64,
        order_id: u64,
    ) {
        let notional = price * qty;
        let balance = inner.balances.entry(venue).or_default();
        match side {
            OrderSide::Buy => {
                // Release the reserved notional and spend it.
                let released = notional.min(balance.locked);
                balance.locked -= released;
                let remainder = notional - released;
                balance.free = (balance.free - remainder).max(0.0);
            }
            OrderSide::Sell => {
                balance.free += notional;
            }
        }

        let position = inner.positions.entry(symbol.to_string()).or_default();
        let signed_qty = side.sign() * qty;
        let new_size = position.size + signed_qty;
        if position.size == 0.0 || position.size.signum() == signed_qty.signum() {
            // Add: weighted-average entry.
            let prev_notional = position.entry_price * position.size.abs();
            let total = position.size.abs() + qty;
            position.entry_price = if total > 0.0 {
                (prev_notional + notional) / total
            } else {
                0.0
            };
        }
        position.size = new_size;
        if position.size == 0.0 {
            position.entry_price = 0.0;
        }

        inner.next_trade_id += 1;
        let trade = UserTrade {
            trade_id: inner.next_trade_id,
            order_id,
            symbol: symbol.to_string(),
            side,
            price,
            qty,
            timestamp_ms: inner.clock_ms,
        };
        debug!(symbol, side = %side, price, qty, "paper fill");
        inner.trades.push(trade);
    }

    // -------------------------------------------------------------------------
    // Exchange surface (mirrors `Exchange`)
    // -------------------------------------------------------------------------

    pub fn exchange_info(&self, venue: Venue) -> ExchangeResult<Vec<SymbolMeta>> {
        let inner = self.inner.lock();
        Ok(inner
            .metas
            .values()
            .filter(|m| m.venue == venue)
            .cloned()
            .collect())
    }

    pub fn balances(&self, venue: Venue) -> ExchangeResult<Vec<AssetBalance>> {
        let inner = self.inner.lock();
        let balance = inner.balances.get(&venue).copied().unwrap_or_default();
        Ok(vec![AssetBalance {
            asset: QUOTE_ASSET.to_string(),
            free: balance.free,
            locked: balance.locked,
        }])
    }

    pub fn account(&self, venue: Venue) -> ExchangeResult<AccountSummary> {
        let inner = self.inner.lock();
        let balance = inner.balances.get(&venue).copied().unwrap_or_default();

        let unrealized: f64 = inner
            .positions
            .iter()
            .filter_map(|(symbol, pos)| {
                let meta_venue = inner.metas.get(symbol).map(|m| m.venue)?;
                if meta_venue != venue || pos.size == 0.0 {
                    return None;
                }
                let mark = inner.marks.get(symbol).copied()?;
                Some((mark - pos.entry_price) * pos.size)
            })
            .sum();

        Ok(AccountSummary {
            venue,
            equity: balance.free + balance.locked + unrealized,
            available_margin: balance.free,
            unrealized_pnl: unrealized,
        })
    }

    pub fn ticker(&self, symbol: &str) -> ExchangeResult<Ticker24h> {
        let inner = self.inner.lock();
        let mark = inner
            .marks
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::permanent("ticker", format!("unknown symbol {symbol}")))?;
        Ok(Ticker24h {
            symbol: symbol.to_string(),
            last_price: mark,
            price_change_pct: 0.0,
            quote_volume: 10_000_000.0,
            high: mark,
            low: mark,
            bid: mark * 0.9995,
            ask: mark * 1.0005,
        })
    }

    pub fn tickers_24h(&self, venue: Venue) -> ExchangeResult<Vec<Ticker24h>> {
        let symbols: Vec<String> = {
            let inner = self.inner.lock();
            inner
                .metas
                .values()
                .filter(|m| m.venue == venue)
                .map(|m| m.symbol.clone())
                .collect()
        };
        Ok(symbols
            .iter()
            .filter_map(|s| self.ticker(s).ok())
            .collect())
    }

    pub fn klines(&self, symbol: &str, limit: u32) -> ExchangeResult<Vec<Kline>> {
        let inner = self.inner.lock();
        let series = inner.klines.get(symbol).cloned().unwrap_or_default();
        let start = series.len().saturating_sub(limit as usize);
        Ok(series[start..].to_vec())
    }

    pub fn positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<PositionInfo>> {
        let inner = self.inner.lock();
        Ok(inner
            .positions
            .iter()
            .filter(|(s, pos)| pos.size != 0.0 && symbol.map_or(true, |want| want == s.as_str()))
            .map(|(s, pos)| {
                let mark = inner.marks.get(s).copied().unwrap_or(pos.entry_price);
                PositionInfo {
                    symbol: s.clone(),
                    venue: inner
                        .metas
                        .get(s)
                        .map(|m| m.venue)
                        .unwrap_or(Venue::Derivatives),
                    size: pos.size,
                    entry_price: pos.entry_price,
                    unrealized_pnl: (mark - pos.entry_price) * pos.size,
                    leverage: 1,
                }
            })
            .collect())
    }

    pub fn place_order(&self, spec: &OrderSpec) -> ExchangeResult<OrderAck> {
        let mut inner = self.inner.lock();

        if inner.transient_order_errors {
            return Err(ExchangeError::transient(
                "place_order",
                "sandbox venue degraded",
            ));
        }
        if inner.reject_orders {
            return Err(ExchangeError::permanent(
                "place_order",
                "sandbox configured to reject orders",
            ));
        }
        if !inner.metas.contains_key(&spec.symbol) {
            return Err(ExchangeError::permanent(
                "place_order",
                format!("unknown symbol {}", spec.symbol),
            ));
        }
        if spec.quantity <= 0.0 {
            return Err(ExchangeError::permanent("place_order", "quantity must be positive"));
        }

        let mark = inner.marks.get(&spec.symbol).copied().unwrap_or(0.0);
        inner.next_order_id += 1;
        let order_id = inner.next_order_id;

        match spec.order_type {
            OrderType::Market => {
                if mark <= 0.0 {
                    return Err(ExchangeError::permanent(
                        "place_order",
                        format!("no mark price for {}", spec.symbol),
                    ));
                }
                Self::execute_fill(
                    &mut inner, &spec.symbol, spec.venue, spec.side, mark, spec.quantity, order_id,
                );
                Ok(OrderAck {
                    order_id,
                    symbol: spec.symbol.clone(),
                    side: spec.side,
                    price: mark,
                    quantity: spec.quantity,
                    executed_qty: spec.quantity,
                })
            }
            OrderType::Limit | OrderType::Stop | OrderType::StopMarket => {
                let price = spec.price.or(spec.stop_price).ok_or_else(|| {
                    ExchangeError::permanent("place_order", "limit order requires a price")
                })?;

                // Reserve notional for resting buys.
                if spec.side == OrderSide::Buy {
                    let notional = price * spec.quantity;
                    let balance = inner.balances.entry(spec.venue).or_default();
                    if balance.free < notional {
                        return Err(ExchangeError::permanent(
                            "place_order",
                            format!(
                                "insufficient balance: need {notional:.2}, free {:.2}",
                                balance.free
                            ),
                        ));
                    }
                    balance.free -= notional;
                    balance.locked += notional;
                }

                inner.open_orders.push(PaperOrder {
                    order_id,
                    symbol: spec.symbol.clone(),
                    venue: spec.venue,
                    side: spec.side,
                    price,
                    quantity: spec.quantity,
                });

                // A limit order already inside the mark fills immediately.
                if mark > 0.0 {
                    Self::match_orders(&mut inner, &spec.symbol.clone(), mark);
                }

                let executed = if inner.open_orders.iter().any(|o| o.order_id == order_id) {
                    0.0
                } else {
                    spec.quantity
                };

                Ok(OrderAck {
                    order_id,
                    symbol: spec.symbol.clone(),
                    side: spec.side,
                    price,
                    quantity: spec.quantity,
                    executed_qty: executed,
                })
            }
        }
    }

    pub fn cancel_order(&self, symbol: &str, order_id: u64) -> ExchangeResult<()> {
        let mut inner = self.inner.lock();
        if inner.transient_order_errors {
            return Err(ExchangeError::transient(
                "cancel_order",
                "sandbox venue degraded",
            ));
        }
        let idx = inner
            .open_orders
            .iter()
            .position(|o| o.symbol == symbol && o.order_id == order_id)
            .ok_or_else(|| {
                ExchangeError::permanent("cancel_order", format!("unknown order {order_id}"))
            })?;
        let order = inner.open_orders.remove(idx);

        // Release reserved notional for buys.
        if order.side == OrderSide::Buy {
            let notional = order.price * order.quantity;
            let balance = inner.balances.entry(order.venue).or_default();
            let released = notional.min(balance.locked);
            balance.locked -= released;
            balance.free += released;
        }
        info!(symbol, order_id, "paper order cancelled");
        Ok(())
    }

    pub fn open_orders(&self, symbol: &str) -> ExchangeResult<Vec<OpenOrder>> {
        let inner = self.inner.lock();
        Ok(inner
            .open_orders
            .iter()
            .filter(|o| o.symbol == symbol)
            .map(|o| OpenOrder {
                order_id: o.order_id,
                symbol: o.symbol.clone(),
                side: o.side,
                price: o.price,
                quantity: o.quantity,
            })
            .collect())
    }

    pub fn my_trades(&self, symbol: &str, from_id: Option<u64>) -> ExchangeResult<Vec<UserTrade>> {
        let inner = self.inner.lock();
        Ok(inner
            .trades
            .iter()
            .filter(|t| t.symbol == symbol && from_id.map_or(true, |id| t.trade_id > id))
            .cloned()
            .collect())
    }

    pub fn transfer(
        &self,
        _asset: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> ExchangeResult<()> {
        let mut inner = self.inner.lock();
        if inner.fail_transfers {
            return Err(ExchangeError::transient("transfer", "sandbox transfer failure"));
        }
        if amount <= 0.0 {
            return Err(ExchangeError::permanent("transfer", "amount must be positive"));
        }

        let (from, to) = match direction {
            TransferDirection::SpotToDerivatives => (Venue::Spot, Venue::Derivatives),
            TransferDirection::DerivativesToSpot => (Venue::Derivatives, Venue::Spot),
        };

        let from_free = inner.balances.entry(from).or_default().free;
        if from_free < amount {
            return Err(ExchangeError::permanent(
                "transfer",
                format!("insufficient {from} balance: {from_free:.2} < {amount:.2}"),
            ));
        }

        inner.balances.entry(from).or_default().free -= amount;
        inner.balances.entry(to).or_default().free += amount;
        info!(amount, direction = %direction, "paper transfer executed");
        Ok(())
    }
}

// =============================================================================
// Exchange adapter — the operation surface the core consumes
// =============================================================================
//
// Two backends behind one handle:
//   - `RestClient` — HMAC-signed REST against the live venue.
//   - `PaperExchange` — the shadow-mode sandbox with deterministic fills.
//
// `Exchange::new` picks the backend from the operation mode, so shadow mode
// can never reach the live venue. Retries and backoff live here, not in the
// core: callers see either a successful response or a classified error.
// =============================================================================

pub mod client;
pub mod error;
pub mod meta;
pub mod paper;

use serde::{Deserialize, Serialize};

pub use client::RestClient;
pub use error::{ExchangeError, ExchangeResult};
pub use meta::SymbolMeta;
pub use paper::PaperExchange;

use crate::types::{OperationMode, OrderSide, OrderType, TimeInForce, Venue};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// One OHLCV bar, oldest-first in every slice the adapter returns.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// 24-hour rolling ticker for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker24h {
    pub symbol: String,
    pub last_price: f64,
    /// Signed percent change over the window (e.g. -3.2).
    pub price_change_pct: f64,
    pub quote_volume: f64,
    pub high: f64,
    pub low: f64,
    pub bid: f64,
    pub ask: f64,
}

impl Ticker24h {
    /// Bid/ask spread as a fraction of the mid price.
    pub fn spread_fraction(&self) -> f64 {
        let mid = (self.bid + self.ask) / 2.0;
        if mid > 0.0 && self.ask >= self.bid {
            (self.ask - self.bid) / mid
        } else {
            0.0
        }
    }
}

/// Order specification submitted to the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub symbol: String,
    pub venue: Venue,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub stop_price: Option<f64>,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default)]
    pub reduce_only: bool,
}

impl OrderSpec {
    pub fn limit(symbol: &str, venue: Venue, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            venue,
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
        }
    }

    pub fn market(symbol: &str, venue: Venue, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.to_string(),
            venue,
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
        }
    }
}

/// Acknowledgement returned by `place_order`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    /// Quantity already executed at ack time (market orders fill immediately).
    pub executed_qty: f64,
}

/// One resting order as reported by `open_orders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
}

/// One executed fill from the user-trade stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTrade {
    pub trade_id: u64,
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub qty: f64,
    pub timestamp_ms: i64,
}

/// Derivatives position as reported by the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub venue: Venue,
    /// Signed size: positive long, negative short, zero flat.
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

/// Free/locked balance for a single asset on one venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

/// Account-level summary for one venue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub venue: Venue,
    pub equity: f64,
    pub available_margin: f64,
    pub unrealized_pnl: f64,
}

impl AccountSummary {
    /// Available margin as a fraction of equity (1.0 when nothing is in use).
    pub fn margin_ratio(&self) -> f64 {
        if self.equity > 0.0 {
            (self.available_margin / self.equity).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    SpotToDerivatives,
    DerivativesToSpot,
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SpotToDerivatives => write!(f, "spot->derivatives"),
            Self::DerivativesToSpot => write!(f, "derivatives->spot"),
        }
    }
}

// ---------------------------------------------------------------------------
// Exchange handle
// ---------------------------------------------------------------------------

/// The handle every subsystem holds. Shadow mode always routes to the paper
/// venue; production routes to the signed REST client.
#[derive(Debug)]
pub enum Exchange {
    Live(RestClient),
    Paper(PaperExchange),
}

impl Exchange {
    pub fn new(mode: OperationMode, api_key: String, api_secret: String) -> Self {
        match mode {
            OperationMode::Production => Self::Live(RestClient::new(api_key, api_secret)),
            OperationMode::Shadow => Self::Paper(PaperExchange::new()),
        }
    }

    pub fn is_paper(&self) -> bool {
        matches!(self, Self::Paper(_))
    }

    pub async fn exchange_info(&self, venue: Venue) -> ExchangeResult<Vec<SymbolMeta>> {
        match self {
            Self::Live(c) => c.exchange_info(venue).await,
            Self::Paper(p) => p.exchange_info(venue),
        }
    }

    pub async fn balances(&self, venue: Venue) -> ExchangeResult<Vec<AssetBalance>> {
        match self {
            Self::Live(c) => c.balances(venue).await,
            Self::Paper(p) => p.balances(venue),
        }
    }

    pub async fn account(&self, venue: Venue) -> ExchangeResult<AccountSummary> {
        match self {
            Self::Live(c) => c.account(venue).await,
            Self::Paper(p) => p.account(venue),
        }
    }

    pub async fn ticker(&self, symbol: &str, venue: Venue) -> ExchangeResult<Ticker24h> {
        match self {
            Self::Live(c) => c.ticker(symbol, venue).await,
            Self::Paper(p) => p.ticker(symbol),
        }
    }

    /// Single batched call returning the 24 h ticker for every listed symbol.
    pub async fn tickers_24h(&self, venue: Venue) -> ExchangeResult<Vec<Ticker24h>> {
        match self {
            Self::Live(c) => c.tickers_24h(venue).await,
            Self::Paper(p) => p.tickers_24h(venue),
        }
    }

    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        venue: Venue,
    ) -> ExchangeResult<Vec<Kline>> {
        match self {
            Self::Live(c) => c.klines(symbol, interval, limit, venue).await,
            Self::Paper(p) => p.klines(symbol, limit),
        }
    }

    /// Derivatives positions, optionally filtered by symbol.
    pub async fn positions(&self, symbol: Option<&str>) -> ExchangeResult<Vec<PositionInfo>> {
        match self {
            Self::Live(c) => c.positions(symbol).await,
            Self::Paper(p) => p.positions(symbol),
        }
    }

    pub async fn place_order(&self, spec: &OrderSpec) -> ExchangeResult<OrderAck> {
        match self {
            Self::Live(c) => c.place_order(spec).await,
            Self::Paper(p) => p.place_order(spec),
        }
    }

    pub async fn cancel_order(
        &self,
        symbol: &str,
        venue: Venue,
        order_id: u64,
    ) -> ExchangeResult<()> {
        match self {
            Self::Live(c) => c.cancel_order(symbol, venue, order_id).await,
            Self::Paper(p) => p.cancel_order(symbol, order_id),
        }
    }

    pub async fn open_orders(&self, symbol: &str, venue: Venue) -> ExchangeResult<Vec<OpenOrder>> {
        match self {
            Self::Live(c) => c.open_orders(symbol, venue).await,
            Self::Paper(p) => p.open_orders(symbol),
        }
    }

    /// Executed user trades for `symbol`, newest last, restricted to ids
    /// greater than `from_id` when provided.
    pub async fn my_trades(
        &self,
        symbol: &str,
        venue: Venue,
        from_id: Option<u64>,
    ) -> ExchangeResult<Vec<UserTrade>> {
        match self {
            Self::Live(c) => c.my_trades(symbol, venue, from_id).await,
            Self::Paper(p) => p.my_trades(symbol, from_id),
        }
    }

    pub async fn transfer(
        &self,
        asset: &str,
        amount: f64,
        direction: TransferDirection,
    ) -> ExchangeResult<()> {
        match self {
            Self::Live(c) => c.transfer(asset, amount, direction).await,
            Self::Paper(p) => p.transfer(asset, amount, direction),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_mode_builds_paper_backend() {
        let exchange = Exchange::new(OperationMode::Shadow, String::new(), String::new());
        assert!(exchange.is_paper());
    }

    #[test]
    fn production_mode_builds_live_backend() {
        let exchange = Exchange::new(
            OperationMode::Production,
            "key".to_string(),
            "secret".to_string(),
        );
        assert!(!exchange.is_paper());
    }

    #[test]
    fn spread_fraction_from_quotes() {
        let ticker = Ticker24h {
            symbol: "BTCUSDT".to_string(),
            last_price: 100.0,
            price_change_pct: 1.0,
            quote_volume: 1e9,
            high: 101.0,
            low: 99.0,
            bid: 99.95,
            ask: 100.05,
        };
        assert!((ticker.spread_fraction() - 0.001).abs() < 1e-9);
    }

    #[test]
    fn margin_ratio_clamps() {
        let account = AccountSummary {
            venue: Venue::Derivatives,
            equity: 100.0,
            available_margin: 25.0,
            unrealized_pnl: 0.0,
        };
        assert_eq!(account.margin_ratio(), 0.25);

        let empty = AccountSummary {
            venue: Venue::Derivatives,
            equity: 0.0,
            available_margin: 0.0,
            unrealized_pnl: 0.0,
        };
        assert_eq!(empty.margin_ratio(), 0.0);
    }

    #[test]
    fn order_spec_constructors() {
        let limit = OrderSpec::limit("ETHUSDT", Venue::Spot, OrderSide::Buy, 0.5, 1990.0);
        assert_eq!(limit.order_type, OrderType::Limit);
        assert_eq!(limit.price, Some(1990.0));

        let market = OrderSpec::market("ETHUSDT", Venue::Spot, OrderSide::Sell, 0.5);
        assert_eq!(market.order_type, OrderType::Market);
        assert!(market.price.is_none());
    }
}

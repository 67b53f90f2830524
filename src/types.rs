// =============================================================================
// Shared types used across the Meridian grid-trading engine
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Which exchange venue an order or balance belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Venue {
    Spot,
    Derivatives,
}

impl std::fmt::Display for Venue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Spot => write!(f, "spot"),
            Self::Derivatives => write!(f, "derivatives"),
        }
    }
}

/// Whether exchange calls are routed to the sandbox or to the live venue.
///
/// Shadow mode must never move real funds: the `Exchange` handle is built from
/// this mode and routes every call to the paper venue when shadowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationMode {
    Shadow,
    Production,
}

impl Default for OperationMode {
    fn default() -> Self {
        Self::Shadow
    }
}

impl std::fmt::Display for OperationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shadow => write!(f, "Shadow"),
            Self::Production => write!(f, "Production"),
        }
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side on the opposite face of the ladder.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1.0 for buys, -1.0 for sells.
    pub fn sign(self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Order types the engine submits. Grid levels rest as `Limit`; TP/SL exits
/// and flattening use `Market`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Limit,
    Market,
    Stop,
    StopMarket,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Limit => write!(f, "LIMIT"),
            Self::Market => write!(f, "MARKET"),
            Self::Stop => write!(f, "STOP"),
            Self::StopMarket => write!(f, "STOP_MARKET"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

impl Default for TimeInForce {
    fn default() -> Self {
        Self::Gtc
    }
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gtc => write!(f, "GTC"),
            Self::Ioc => write!(f, "IOC"),
            Self::Fok => write!(f, "FOK"),
        }
    }
}

/// Alert severity understood by the alert sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// What produced a trade record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSource {
    Grid,
    TakeProfit,
    StopLoss,
    Manual,
}

impl std::fmt::Display for TradeSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grid => write!(f, "grid"),
            Self::TakeProfit => write!(f, "tp"),
            Self::StopLoss => write!(f, "sl"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Free/locked balance plus account equity for one venue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VenueBalance {
    pub free: f64,
    pub locked: f64,
    pub equity: f64,
    pub unrealized_pnl: f64,
}

/// Ordered mapping of venue to balance, refreshed by the data cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub venues: BTreeMap<Venue, VenueBalance>,
}

impl BalanceSnapshot {
    pub fn venue(&self, venue: Venue) -> VenueBalance {
        self.venues.get(&venue).copied().unwrap_or_default()
    }

    /// Free balance summed across both venues.
    pub fn total_free(&self) -> f64 {
        self.venues.values().map(|b| b.free).sum()
    }

    /// Total equity across both venues.
    pub fn total_equity(&self) -> f64 {
        self.venues.values().map(|b| b.equity).sum()
    }
}

/// Side of the single logical position a grid worker holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Flat,
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Flat => write!(f, "flat"),
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// The one logical position per grid worker. Entry price updates as a
/// weighted average on adds; reducing fills realize PnL; returning to zero
/// clears the side and the TP/SL marks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub side: PositionSide,
    /// Unsigned size in base units.
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub tp_price: Option<f64>,
    pub sl_price: Option<f64>,
}

impl Default for Position {
    fn default() -> Self {
        Self::flat()
    }
}

impl Position {
    pub fn flat() -> Self {
        Self {
            side: PositionSide::Flat,
            size: 0.0,
            entry_price: 0.0,
            unrealized_pnl: 0.0,
            tp_price: None,
            sl_price: None,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side == PositionSide::Flat || self.size <= 0.0
    }

    /// Signed size: positive long, negative short.
    pub fn signed_size(&self) -> f64 {
        match self.side {
            PositionSide::Long => self.size,
            PositionSide::Short => -self.size,
            PositionSide::Flat => 0.0,
        }
    }

    /// Fold one fill into the position. Returns the realized PnL of the fill
    /// (zero for adds).
    pub fn apply_fill(&mut self, side: OrderSide, qty: f64, price: f64) -> f64 {
        if qty <= 0.0 {
            return 0.0;
        }
        let signed = self.signed_size() + side.sign() * qty;
        let mut realized = 0.0;

        let adds = match self.side {
            PositionSide::Flat => true,
            PositionSide::Long => side == OrderSide::Buy,
            PositionSide::Short => side == OrderSide::Sell,
        };

        if adds {
            let prev_notional = self.entry_price * self.size;
            let total = self.size + qty;
            self.entry_price = (prev_notional + price * qty) / total;
            self.size = total;
        } else {
            // Reducing (or flipping through flat).
            let closed = qty.min(self.size);
            let direction = match self.side {
                PositionSide::Long => 1.0,
                PositionSide::Short => -1.0,
                PositionSide::Flat => 0.0,
            };
            realized = direction * (price - self.entry_price) * closed;
            self.size -= closed;
            if qty > closed {
                // Flip: the remainder opens a fresh position at this price.
                self.size = qty - closed;
                self.entry_price = price;
            }
        }

        self.side = if signed > 1e-12 {
            PositionSide::Long
        } else if signed < -1e-12 {
            PositionSide::Short
        } else {
            PositionSide::Flat
        };

        if self.side == PositionSide::Flat {
            self.size = 0.0;
            self.entry_price = 0.0;
            self.unrealized_pnl = 0.0;
            self.tp_price = None;
            self.sl_price = None;
        }

        realized
    }

    /// Recompute unrealized PnL against `mark`.
    pub fn update_mark(&mut self, mark: f64) {
        self.unrealized_pnl = match self.side {
            PositionSide::Long => (mark - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - mark) * self.size,
            PositionSide::Flat => 0.0,
        };
    }

    /// +1 for long, -1 for short, 0 flat — the sign used in TP/SL formulas.
    pub fn side_sign(&self) -> f64 {
        match self.side {
            PositionSide::Long => 1.0,
            PositionSide::Short => -1.0,
            PositionSide::Flat => 0.0,
        }
    }
}

/// One completed fill, appended to the bounded trade journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp_ms: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub qty: f64,
    pub realized_pnl: f64,
    pub source: TradeSource,
}

/// Append-only trade journal bounded to the most recent `cap` records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeJournal {
    records: Vec<TradeRecord>,
    cap: usize,
}

impl TradeJournal {
    pub fn new(cap: usize) -> Self {
        Self {
            records: Vec::new(),
            cap,
        }
    }

    pub fn push(&mut self, record: TradeRecord) {
        self.records.push(record);
        while self.records.len() > self.cap {
            self.records.remove(0);
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TradeRecord] {
        &self.records
    }

    /// Sum of realized PnL over all retained records.
    pub fn realized_pnl(&self) -> f64 {
        self.records.iter().map(|r| r.realized_pnl).sum()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_and_sign() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
        assert_eq!(OrderSide::Buy.sign(), 1.0);
        assert_eq!(OrderSide::Sell.sign(), -1.0);
    }

    #[test]
    fn balance_snapshot_totals() {
        let mut snap = BalanceSnapshot::default();
        snap.venues.insert(
            Venue::Spot,
            VenueBalance {
                free: 40.0,
                locked: 10.0,
                equity: 50.0,
                unrealized_pnl: 0.0,
            },
        );
        snap.venues.insert(
            Venue::Derivatives,
            VenueBalance {
                free: 60.0,
                locked: 0.0,
                equity: 65.0,
                unrealized_pnl: 5.0,
            },
        );
        assert_eq!(snap.total_free(), 100.0);
        assert_eq!(snap.total_equity(), 115.0);
        assert_eq!(snap.venue(Venue::Spot).locked, 10.0);
    }

    #[test]
    fn missing_venue_is_zeroed() {
        let snap = BalanceSnapshot::default();
        assert_eq!(snap.venue(Venue::Derivatives).free, 0.0);
    }

    #[test]
    fn journal_is_bounded() {
        let mut journal = TradeJournal::new(3);
        for i in 0..5 {
            journal.push(TradeRecord {
                timestamp_ms: i,
                symbol: "BTCUSDT".to_string(),
                side: OrderSide::Buy,
                price: 100.0,
                qty: 1.0,
                realized_pnl: 1.0,
                source: TradeSource::Grid,
            });
        }
        assert_eq!(journal.len(), 3);
        assert_eq!(journal.records()[0].timestamp_ms, 2);
        assert_eq!(journal.realized_pnl(), 3.0);
    }

    #[test]
    fn position_weighted_average_entry() {
        // Two buys of 0.005 @ 1990 and 0.005 @ 1980.05.
        let mut position = Position::flat();
        assert_eq!(position.apply_fill(OrderSide::Buy, 0.005, 1990.0), 0.0);
        assert_eq!(position.side, PositionSide::Long);
        assert_eq!(position.apply_fill(OrderSide::Buy, 0.005, 1980.05), 0.0);
        assert!((position.entry_price - 1985.025).abs() < 1e-9);
        assert!((position.size - 0.010).abs() < 1e-12);
    }

    #[test]
    fn reducing_fill_realizes_pnl() {
        let mut position = Position::flat();
        position.apply_fill(OrderSide::Buy, 1.0, 100.0);
        let realized = position.apply_fill(OrderSide::Sell, 0.4, 110.0);
        assert!((realized - 4.0).abs() < 1e-9);
        assert!((position.size - 0.6).abs() < 1e-12);
        assert_eq!(position.side, PositionSide::Long);
    }

    #[test]
    fn full_close_returns_to_flat_and_clears_marks() {
        let mut position = Position::flat();
        position.apply_fill(OrderSide::Buy, 1.0, 100.0);
        position.tp_price = Some(101.0);
        position.sl_price = Some(95.0);
        let realized = position.apply_fill(OrderSide::Sell, 1.0, 105.0);
        assert!((realized - 5.0).abs() < 1e-9);
        assert!(position.is_flat());
        assert_eq!(position.tp_price, None);
        assert_eq!(position.sl_price, None);
        assert_eq!(position.entry_price, 0.0);
    }

    #[test]
    fn flip_through_flat_opens_opposite() {
        let mut position = Position::flat();
        position.apply_fill(OrderSide::Buy, 1.0, 100.0);
        let realized = position.apply_fill(OrderSide::Sell, 1.5, 110.0);
        assert!((realized - 10.0).abs() < 1e-9);
        assert_eq!(position.side, PositionSide::Short);
        assert!((position.size - 0.5).abs() < 1e-12);
        assert_eq!(position.entry_price, 110.0);
    }

    #[test]
    fn short_position_pnl_signs() {
        let mut position = Position::flat();
        position.apply_fill(OrderSide::Sell, 1.0, 100.0);
        assert_eq!(position.side, PositionSide::Short);
        position.update_mark(90.0);
        assert!((position.unrealized_pnl - 10.0).abs() < 1e-9);
        let realized = position.apply_fill(OrderSide::Buy, 1.0, 95.0);
        assert!((realized - 5.0).abs() < 1e-9);
        assert!(position.is_flat());
    }

    #[test]
    fn display_formats_match_wire_conventions() {
        assert_eq!(OrderSide::Buy.to_string(), "BUY");
        assert_eq!(OrderType::StopMarket.to_string(), "STOP_MARKET");
        assert_eq!(TimeInForce::Gtc.to_string(), "GTC");
        assert_eq!(Venue::Derivatives.to_string(), "derivatives");
    }
}

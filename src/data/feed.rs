// =============================================================================
// Data feed — cache-through fetching plus subscriber fan-out
// =============================================================================
//
// One background refresher task serves every subscribed symbol at a fixed
// cadence: fetch ticker + klines (+ position on derivatives), update the
// cache, invoke callbacks with the refreshed tuple. Callbacks must be cheap;
// a panicking callback is isolated so it cannot stall the others. A failed
// refresh leaves the previous cached value in place and logs.
// =============================================================================

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::data::cache::MarketCache;
use crate::exchange::{Exchange, ExchangeResult, Kline, PositionInfo, Ticker24h};
use crate::types::{BalanceSnapshot, Venue, VenueBalance};

/// Hard cap on callbacks registered per symbol.
const MAX_SUBSCRIBERS_PER_SYMBOL: usize = 8;
/// Kline series maintained for subscribers.
const FEED_KLINE_INTERVAL: &str = "1m";
const FEED_KLINE_LIMIT: u32 = 120;
/// Cleanup runs every N refresh ticks.
const CLEANUP_EVERY_TICKS: u64 = 10;

/// The tuple handed to subscribers after a successful refresh.
#[derive(Debug, Clone)]
pub struct SymbolRefresh {
    pub symbol: String,
    pub venue: Venue,
    pub ticker: Ticker24h,
    pub klines: Vec<Kline>,
    pub position: Option<PositionInfo>,
}

type Callback = Box<dyn Fn(&SymbolRefresh) + Send + Sync>;

pub struct DataFeed {
    exchange: Arc<Exchange>,
    cache: Arc<MarketCache>,
    refresh_interval: Duration,
    subscribers: RwLock<HashMap<String, Vec<Callback>>>,
    /// Venue each subscribed symbol trades on.
    venues: RwLock<HashMap<String, Venue>>,
}

impl DataFeed {
    pub fn new(exchange: Arc<Exchange>, cache: Arc<MarketCache>, refresh_interval: Duration) -> Self {
        Self {
            exchange,
            cache,
            refresh_interval,
            subscribers: RwLock::new(HashMap::new()),
            venues: RwLock::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<MarketCache> {
        &self.cache
    }

    // -------------------------------------------------------------------------
    // Subscription
    // -------------------------------------------------------------------------

    /// Register `callback` for refreshes of `symbol`. Subscriber lists are
    /// bounded; exceeding the cap is an error rather than a silent drop.
    pub fn subscribe(
        &self,
        symbol: &str,
        venue: Venue,
        callback: impl Fn(&SymbolRefresh) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut subscribers = self.subscribers.write();
        let list = subscribers.entry(symbol.to_string()).or_default();
        if list.len() >= MAX_SUBSCRIBERS_PER_SYMBOL {
            bail!("subscriber cap reached for {symbol}");
        }
        list.push(Box::new(callback));
        self.venues.write().insert(symbol.to_string(), venue);
        debug!(symbol, count = list.len(), "feed subscriber registered");
        Ok(())
    }

    /// Record which venue `symbol` trades on, without registering a callback.
    /// Workers call this so their polls hit the right endpoints.
    pub fn set_symbol_venue(&self, symbol: &str, venue: Venue) {
        self.venues.write().insert(symbol.to_string(), venue);
    }

    /// Drop every subscriber for `symbol` (worker retired).
    pub fn unsubscribe(&self, symbol: &str) {
        self.subscribers.write().remove(symbol);
        self.venues.write().remove(symbol);
        debug!(symbol, "feed subscribers removed");
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscribers.read().keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Cache-through accessors
    // -------------------------------------------------------------------------

    /// Ticker for `symbol`, served from cache when fresh.
    pub async fn ticker(&self, symbol: &str, venue: Venue) -> ExchangeResult<Ticker24h> {
        if let Some(cached) = self.cache.ticker(symbol) {
            return Ok(cached);
        }
        let ticker = self.exchange.ticker(symbol, venue).await?;
        self.cache.set_ticker(ticker.clone());
        Ok(ticker)
    }

    /// Klines for `(symbol, interval)`, served from cache when fresh.
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
        venue: Venue,
    ) -> ExchangeResult<Vec<Kline>> {
        if let Some(cached) = self.cache.klines(symbol, interval) {
            if cached.len() >= limit as usize {
                return Ok(cached);
            }
        }
        let klines = self.exchange.klines(symbol, interval, limit, venue).await?;
        self.cache.set_klines(symbol, interval, klines.clone());
        Ok(klines)
    }

    /// Net derivatives position for `symbol`, cache-through.
    pub async fn position(&self, symbol: &str) -> ExchangeResult<Option<PositionInfo>> {
        if let Some(cached) = self.cache.position(symbol) {
            return Ok(cached);
        }
        let positions = self.exchange.positions(Some(symbol)).await?;
        let position = positions.into_iter().next();
        self.cache.set_position(symbol, position.clone());
        Ok(position)
    }

    /// Balance snapshot across both venues, cache-through.
    pub async fn balances(&self) -> ExchangeResult<BalanceSnapshot> {
        if let Some(cached) = self.cache.balances() {
            return Ok(cached);
        }
        let snapshot = self.fetch_balances().await?;
        self.cache.set_balances(snapshot.clone());
        Ok(snapshot)
    }

    async fn fetch_balances(&self) -> ExchangeResult<BalanceSnapshot> {
        let mut snapshot = BalanceSnapshot::default();
        for venue in [Venue::Spot, Venue::Derivatives] {
            let balances = self.exchange.balances(venue).await?;
            let account = self.exchange.account(venue).await?;
            let quote = balances
                .iter()
                .find(|b| b.asset == "USDT")
                .map(|b| (b.free, b.locked))
                .unwrap_or((0.0, 0.0));
            snapshot.venues.insert(
                venue,
                VenueBalance {
                    free: quote.0,
                    locked: quote.1,
                    equity: account.equity,
                    unrealized_pnl: account.unrealized_pnl,
                },
            );
        }
        Ok(snapshot)
    }

    // -------------------------------------------------------------------------
    // Refresh loop
    // -------------------------------------------------------------------------

    /// Refresh one symbol and return the refreshed tuple.
    pub async fn refresh_symbol(&self, symbol: &str) -> ExchangeResult<SymbolRefresh> {
        let venue = self
            .venues
            .read()
            .get(symbol)
            .copied()
            .unwrap_or(Venue::Derivatives);

        let ticker = self.exchange.ticker(symbol, venue).await?;
        self.cache.set_ticker(ticker.clone());

        let klines = self
            .exchange
            .klines(symbol, FEED_KLINE_INTERVAL, FEED_KLINE_LIMIT, venue)
            .await?;
        self.cache.set_klines(symbol, FEED_KLINE_INTERVAL, klines.clone());

        let position = if venue == Venue::Derivatives {
            let positions = self.exchange.positions(Some(symbol)).await?;
            let position = positions.into_iter().next();
            self.cache.set_position(symbol, position.clone());
            position
        } else {
            None
        };

        Ok(SymbolRefresh {
            symbol: symbol.to_string(),
            venue,
            ticker,
            klines,
            position,
        })
    }

    /// Deliver `refresh` to every subscriber of its symbol, isolating panics.
    fn fan_out(&self, refresh: &SymbolRefresh) {
        let subscribers = self.subscribers.read();
        let Some(list) = subscribers.get(&refresh.symbol) else {
            return;
        };
        for (idx, callback) in list.iter().enumerate() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(refresh)));
            if result.is_err() {
                warn!(
                    symbol = %refresh.symbol,
                    subscriber = idx,
                    "feed subscriber panicked — isolated"
                );
            }
        }
    }

    /// Background refresher: serves all subscribed symbols until `stop`.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        info!(interval = ?self.refresh_interval, "data feed refresher started");
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ticks: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }

            ticks += 1;
            let symbols = self.subscribed_symbols();
            for symbol in symbols {
                match self.refresh_symbol(&symbol).await {
                    Ok(refresh) => self.fan_out(&refresh),
                    // Previous cached value stays; subscribers only ever see
                    // successful refreshes.
                    Err(e) => warn!(symbol = %symbol, error = %e, "symbol refresh failed"),
                }
            }

            // Refresh the shared balance snapshot alongside symbols.
            if let Ok(snapshot) = self.fetch_balances().await {
                self.cache.set_balances(snapshot);
            }

            if ticks % CLEANUP_EVERY_TICKS == 0 {
                self.cache.purge_expired();
            }
        }
        info!("data feed refresher stopped");
    }
}

impl std::fmt::Debug for DataFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFeed")
            .field("subscribed", &self.subscribers.read().len())
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheTtls;
    use crate::exchange::{PaperExchange, SymbolMeta};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn meta(symbol: &str, venue: Venue) -> SymbolMeta {
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

    fn feed() -> (Arc<DataFeed>, Arc<Exchange>) {
        let paper = PaperExchange::new();
        paper.register_symbol(meta("ETHUSDT", Venue::Derivatives));
        paper.deposit(Venue::Derivatives, 1_000.0);
        paper.set_mark_price("ETHUSDT", 2_000.0);
        let exchange = Arc::new(Exchange::Paper(paper));
        let cache = Arc::new(MarketCache::new(CacheTtls::default()));
        let feed = Arc::new(DataFeed::new(
            exchange.clone(),
            cache,
            Duration::from_millis(10),
        ));
        (feed, exchange)
    }

    #[tokio::test]
    async fn ticker_is_cached_after_first_fetch() {
        let (feed, exchange) = feed();
        let first = feed.ticker("ETHUSDT", Venue::Derivatives).await.unwrap();
        assert_eq!(first.last_price, 2_000.0);

        // Move the mark; the cached value should still be served.
        if let Exchange::Paper(paper) = exchange.as_ref() {
            paper.set_mark_price("ETHUSDT", 2_100.0);
        }
        let second = feed.ticker("ETHUSDT", Venue::Derivatives).await.unwrap();
        assert_eq!(second.last_price, 2_000.0);
    }

    #[tokio::test]
    async fn balances_snapshot_covers_both_venues() {
        let (feed, _) = feed();
        let snapshot = feed.balances().await.unwrap();
        assert_eq!(snapshot.venue(Venue::Derivatives).free, 1_000.0);
        assert_eq!(snapshot.venue(Venue::Spot).free, 0.0);
    }

    #[tokio::test]
    async fn refresh_invokes_subscribers() {
        let (feed, _) = feed();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        feed.subscribe("ETHUSDT", Venue::Derivatives, move |refresh| {
            assert_eq!(refresh.symbol, "ETHUSDT");
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let refresh = feed.refresh_symbol("ETHUSDT").await.unwrap();
        feed.fan_out(&refresh);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_stall_others() {
        let (feed, _) = feed();
        let calls = Arc::new(AtomicUsize::new(0));

        feed.subscribe("ETHUSDT", Venue::Derivatives, |_| {
            panic!("bad subscriber");
        })
        .unwrap();
        let seen = calls.clone();
        feed.subscribe("ETHUSDT", Venue::Derivatives, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let refresh = feed.refresh_symbol("ETHUSDT").await.unwrap();
        feed.fan_out(&refresh);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn subscriber_cap_is_enforced() {
        let (feed, _) = feed();
        for _ in 0..MAX_SUBSCRIBERS_PER_SYMBOL {
            feed.subscribe("ETHUSDT", Venue::Derivatives, |_| {}).unwrap();
        }
        assert!(feed.subscribe("ETHUSDT", Venue::Derivatives, |_| {}).is_err());
    }

    #[tokio::test]
    async fn unsubscribe_clears_symbol() {
        let (feed, _) = feed();
        feed.subscribe("ETHUSDT", Venue::Derivatives, |_| {}).unwrap();
        assert_eq!(feed.subscribed_symbols(), vec!["ETHUSDT".to_string()]);
        feed.unsubscribe("ETHUSDT");
        assert!(feed.subscribed_symbols().is_empty());
    }

    #[tokio::test]
    async fn refresh_loop_stops_on_signal() {
        let (feed, _) = feed();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(feed.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refresher must stop within the grace period")
            .unwrap();
    }
}

// =============================================================================
// Market data cache — TTL store for tickers, klines, positions, balances
// =============================================================================
//
// Four entry classes with separate TTLs. Expired entries are removed on
// access; a periodic cleanup pass (driven by the data feed) purges the rest.
// Multiple readers, one background writer; updates are atomic per key.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use crate::config::CacheTtls;
use crate::exchange::{Kline, PositionInfo, Ticker24h};
use crate::types::BalanceSnapshot;

/// Key for one cached entry. Klines are keyed per (symbol, interval).
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum CacheKey {
    Ticker(String),
    Klines(String, String),
    Position(String),
    Balances,
}

#[derive(Debug, Clone)]
pub enum CacheValue {
    Ticker(Ticker24h),
    Klines(Vec<Kline>),
    /// `None` means the venue reported a flat book for the symbol.
    Position(Option<PositionInfo>),
    Balances(BalanceSnapshot),
}

#[derive(Debug, Clone)]
struct Entry {
    value: CacheValue,
    created: Instant,
}

/// Hit/miss counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct MarketCache {
    ttls: CacheTtls,
    entries: RwLock<HashMap<CacheKey, Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl MarketCache {
    pub fn new(ttls: CacheTtls) -> Self {
        Self {
            ttls,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn ttl_for(&self, key: &CacheKey) -> Duration {
        let secs = match key {
            CacheKey::Ticker(_) => self.ttls.tickers_secs,
            CacheKey::Klines(_, _) => self.ttls.klines_secs,
            CacheKey::Position(_) => self.ttls.positions_secs,
            CacheKey::Balances => self.ttls.balances_secs,
        };
        Duration::from_secs(secs)
    }

    // -------------------------------------------------------------------------
    // Raw get/set
    // -------------------------------------------------------------------------

    /// Store `value` under `key`, stamping creation time.
    pub fn set(&self, key: CacheKey, value: CacheValue) {
        let mut entries = self.entries.write();
        entries.insert(
            key,
            Entry {
                value,
                created: Instant::now(),
            },
        );
    }

    /// Fetch `key` if present and fresh; an expired entry is removed on
    /// access. `ttl_override` replaces the class TTL for this lookup.
    pub fn get(&self, key: &CacheKey, ttl_override: Option<Duration>) -> Option<CacheValue> {
        let ttl = ttl_override.unwrap_or_else(|| self.ttl_for(key));

        {
            let entries = self.entries.read();
            if let Some(entry) = entries.get(key) {
                if entry.created.elapsed() <= ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        }

        // Entry exists but is stale: evict it under the write lock.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if entry.created.elapsed() <= ttl {
                // Another writer refreshed it in between.
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            entries.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Remove every expired entry. Returns the count purged.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        let ttls = &self.ttls;
        entries.retain(|key, entry| {
            let secs = match key {
                CacheKey::Ticker(_) => ttls.tickers_secs,
                CacheKey::Klines(_, _) => ttls.klines_secs,
                CacheKey::Position(_) => ttls.positions_secs,
                CacheKey::Balances => ttls.balances_secs,
            };
            entry.created.elapsed() <= Duration::from_secs(secs)
        });
        let purged = before - entries.len();
        if purged > 0 {
            self.evictions.fetch_add(purged as u64, Ordering::Relaxed);
            debug!(purged, remaining = entries.len(), "cache cleanup pass");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    // -------------------------------------------------------------------------
    // Typed accessors
    // -------------------------------------------------------------------------

    pub fn ticker(&self, symbol: &str) -> Option<Ticker24h> {
        match self.get(&CacheKey::Ticker(symbol.to_string()), None) {
            Some(CacheValue::Ticker(t)) => Some(t),
            _ => None,
        }
    }

    pub fn set_ticker(&self, ticker: Ticker24h) {
        self.set(
            CacheKey::Ticker(ticker.symbol.clone()),
            CacheValue::Ticker(ticker),
        );
    }

    pub fn klines(&self, symbol: &str, interval: &str) -> Option<Vec<Kline>> {
        match self.get(
            &CacheKey::Klines(symbol.to_string(), interval.to_string()),
            None,
        ) {
            Some(CacheValue::Klines(k)) => Some(k),
            _ => None,
        }
    }

    pub fn set_klines(&self, symbol: &str, interval: &str, klines: Vec<Kline>) {
        self.set(
            CacheKey::Klines(symbol.to_string(), interval.to_string()),
            CacheValue::Klines(klines),
        );
    }

    pub fn position(&self, symbol: &str) -> Option<Option<PositionInfo>> {
        match self.get(&CacheKey::Position(symbol.to_string()), None) {
            Some(CacheValue::Position(p)) => Some(p),
            _ => None,
        }
    }

    pub fn set_position(&self, symbol: &str, position: Option<PositionInfo>) {
        self.set(
            CacheKey::Position(symbol.to_string()),
            CacheValue::Position(position),
        );
    }

    pub fn balances(&self) -> Option<BalanceSnapshot> {
        match self.get(&CacheKey::Balances, None) {
            Some(CacheValue::Balances(b)) => Some(b),
            _ => None,
        }
    }

    pub fn set_balances(&self, snapshot: BalanceSnapshot) {
        self.set(CacheKey::Balances, CacheValue::Balances(snapshot));
    }
}

impl std::fmt::Debug for MarketCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketCache")
            .field("entries", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(symbol: &str, price: f64) -> Ticker24h {
        Ticker24h {
            symbol: symbol.to_string(),
            last_price: price,
            price_change_pct: 0.0,
            quote_volume: 1.0,
            high: price,
            low: price,
            bid: price,
            ask: price,
        }
    }

    fn short_ttls() -> CacheTtls {
        CacheTtls {
            tickers_secs: 0, // expires immediately
            klines_secs: 60,
            positions_secs: 60,
            balances_secs: 60,
        }
    }

    #[test]
    fn set_then_get_roundtrip() {
        let cache = MarketCache::new(CacheTtls::default());
        cache.set_ticker(ticker("BTCUSDT", 45_000.0));
        let got = cache.ticker("BTCUSDT").unwrap();
        assert_eq!(got.last_price, 45_000.0);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn miss_on_absent_key() {
        let cache = MarketCache::new(CacheTtls::default());
        assert!(cache.ticker("NOPE").is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn expired_entry_removed_on_access() {
        let cache = MarketCache::new(short_ttls());
        cache.set_ticker(ticker("BTCUSDT", 45_000.0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.ticker("BTCUSDT").is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn ttl_override_extends_lookup() {
        let cache = MarketCache::new(short_ttls());
        cache.set_ticker(ticker("BTCUSDT", 45_000.0));
        std::thread::sleep(Duration::from_millis(5));
        // Class TTL says expired, but an explicit long TTL still sees it.
        let got = cache.get(
            &CacheKey::Ticker("BTCUSDT".to_string()),
            Some(Duration::from_secs(60)),
        );
        assert!(got.is_some());
    }

    #[test]
    fn klines_keyed_per_interval() {
        let cache = MarketCache::new(CacheTtls::default());
        let bar = Kline {
            open_time: 0,
            close_time: 0,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 10.0,
        };
        cache.set_klines("ETHUSDT", "1m", vec![bar]);
        assert!(cache.klines("ETHUSDT", "1m").is_some());
        assert!(cache.klines("ETHUSDT", "5m").is_none());
    }

    #[test]
    fn purge_removes_only_expired() {
        let cache = MarketCache::new(short_ttls());
        cache.set_ticker(ticker("BTCUSDT", 1.0)); // ttl 0
        cache.set_balances(BalanceSnapshot::default()); // ttl 60
        std::thread::sleep(Duration::from_millis(5));
        let purged = cache.purge_expired();
        assert_eq!(purged, 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.balances().is_some());
    }

    #[test]
    fn flat_position_is_cached_as_none() {
        let cache = MarketCache::new(CacheTtls::default());
        cache.set_position("ETHUSDT", None);
        // Outer Some: cache hit. Inner None: flat.
        assert_eq!(cache.position("ETHUSDT"), Some(None));
        assert!(cache.position("BTCUSDT").is_none());
    }
}

pub mod cache;
pub mod feed;

pub use cache::{CacheKey, CacheStats, MarketCache};
pub use feed::{DataFeed, SymbolRefresh};

use crate::quote::{PriceQuote, Timeframe};
use parking_lot::RwLock;
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

/// Cached quote and the instant it was stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedQuote {
    pub quote: PriceQuote,
    pub stored_at: Instant,
}

impl CachedQuote {
    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }

    /// Determine if the entry is still within its freshness TTL.
    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }
}

/// Short-lived in-memory quote cache, keyed by [`Timeframe`].
///
/// Entries are replaced whole and never expire: stale entries remain servable as the
/// better-than-nothing tier.
#[derive(Debug, Default)]
pub struct QuoteCache {
    entries: RwLock<HashMap<Timeframe, CachedQuote>>,
}

impl QuoteCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, quote: PriceQuote) {
        self.entries.write().insert(
            quote.timeframe,
            CachedQuote {
                quote,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn get(&self, timeframe: Timeframe) -> Option<CachedQuote> {
        self.entries.read().get(&timeframe).copied()
    }

    /// Most recently stored quote of any timeframe, used to anchor synthetic data.
    pub fn latest(&self) -> Option<CachedQuote> {
        self.entries
            .read()
            .values()
            .max_by_key(|entry| entry.stored_at)
            .copied()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote::Direction;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn quote(price: Decimal, timeframe: Timeframe) -> PriceQuote {
        PriceQuote {
            price,
            absolute_change: dec!(1),
            percent_change: dec!(0.01),
            direction: Direction::Up,
            timeframe,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_freshness() {
        let cache = QuoteCache::new();
        assert!(cache.get(Timeframe::OneDay).is_none());

        cache.store(quote(dec!(100), Timeframe::OneDay));
        let ttl = Duration::from_secs(60);
        assert!(cache.get(Timeframe::OneDay).unwrap().is_fresh(ttl));

        tokio::time::advance(Duration::from_secs(61)).await;
        let entry = cache.get(Timeframe::OneDay).unwrap();
        assert!(!entry.is_fresh(ttl));
        assert_eq!(entry.quote.price, dec!(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_latest() {
        let cache = QuoteCache::new();
        cache.store(quote(dec!(100), Timeframe::OneDay));
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.store(quote(dec!(105), Timeframe::OneWeek));

        assert_eq!(cache.latest().unwrap().quote.price, dec!(105));

        cache.clear();
        assert!(cache.latest().is_none());
    }
}

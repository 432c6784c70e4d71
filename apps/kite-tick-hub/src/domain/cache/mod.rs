//! Tick Cache
//!
//! Last-known tick per instrument. Used to give a newly-subscribed client
//! an immediate snapshot. Entries are never evicted.

use std::collections::HashMap;

use crate::domain::streaming::{InstrumentToken, Tick};

/// Most recent tick per instrument token.
#[derive(Debug, Default)]
pub struct TickCache {
    ticks: HashMap<InstrumentToken, Tick>,
}

impl TickCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `tick`, replacing any previous tick for the same token.
    ///
    /// Last write wins by arrival order; callers feed ticks in the order
    /// they came off the wire.
    pub fn update(&mut self, tick: Tick) {
        self.ticks.insert(tick.instrument_token, tick);
    }

    /// Most recent tick for `token`.
    #[must_use]
    pub fn get(&self, token: InstrumentToken) -> Option<&Tick> {
        self.ticks.get(&token)
    }

    /// Number of instruments with a cached tick.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    /// Whether no tick has been cached yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::*;

    #[test]
    fn empty_cache_misses() {
        let cache = TickCache::new();

        assert!(cache.is_empty());
        assert!(cache.get(InstrumentToken::new(256_265)).is_none());
    }

    #[test]
    fn last_write_wins() {
        let token = InstrumentToken::new(738_561);
        let mut cache = TickCache::new();

        cache.update(Tick::ltp(token, Decimal::from(2500)));
        cache.update(Tick::ltp(token, Decimal::from(2501)));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(token).map(|t| t.last_price), Some(Decimal::from(2501)));
    }

    #[test]
    fn tokens_are_independent() {
        let mut cache = TickCache::new();

        cache.update(Tick::ltp(InstrumentToken::new(1), Decimal::ONE));
        cache.update(Tick::ltp(InstrumentToken::new(2), Decimal::TWO));

        assert_eq!(cache.len(), 2);
        assert_eq!(
            cache.get(InstrumentToken::new(1)).map(|t| t.last_price),
            Some(Decimal::ONE)
        );
    }
}

use chrono::{DateTime, Duration as TimeDelta, Utc};
use kbridge_core::{DepthSnapshot, MarketError, QuoteSnapshot};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::warn;

/// Snapshots that carry the exchange time they describe.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for QuoteSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for DepthSnapshot {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// A cached snapshot plus how far it lags the wall clock, when that lag
/// exceeds the staleness threshold.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub stale_by: Option<TimeDelta>,
}

impl<T> Cached<T> {
    pub fn is_stale(&self) -> bool {
        self.stale_by.is_some()
    }
}

/// Most-recent-value store for pushed market data, keyed by instrument code.
///
/// Written only from the dispatch context; read from any task.
pub struct RealTimeCache<T> {
    entries: RwLock<HashMap<String, T>>,
    stale_after: TimeDelta,
    label: &'static str,
}

impl<T: Clone + Timestamped> RealTimeCache<T> {
    pub fn new(label: &'static str, stale_after: TimeDelta) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stale_after,
            label,
        }
    }

    /// Replace the snapshot for `code` wholesale.
    pub fn update(&self, code: &str, snapshot: T) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(code.to_string(), snapshot);
    }

    /// Latest snapshot for `code`, judged against the current wall clock.
    pub fn get(&self, code: &str) -> Result<Cached<T>, MarketError> {
        self.get_at(code, Utc::now())
    }

    /// Latest snapshot for `code`, judged against `now`.
    ///
    /// A snapshot lagging by more than the threshold is still returned; the
    /// lag is logged and reported in `stale_by`.
    pub fn get_at(&self, code: &str, now: DateTime<Utc>) -> Result<Cached<T>, MarketError> {
        let value = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(code)
            .cloned()
            .ok_or_else(|| MarketError::NotYetAvailable(format!("{} {}", self.label, code)))?;

        let lag = now - value.timestamp();
        let stale_by = (lag > self.stale_after).then_some(lag);
        if let Some(lag) = stale_by {
            warn!(
                code,
                feed = self.label,
                lag_secs = lag.num_seconds(),
                "Real-time data lags the wall clock; trading may be halted for this instrument"
            );
        }
        Ok(Cached { value, stale_by })
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(code)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(at: DateTime<Utc>, last: i64) -> QuoteSnapshot {
        QuoteSnapshot {
            timestamp: at,
            last,
            open: 69_000,
            high: 71_000,
            low: 68_500,
        }
    }

    fn cache() -> RealTimeCache<QuoteSnapshot> {
        RealTimeCache::new("price", TimeDelta::seconds(10))
    }

    #[test]
    fn test_missing_code_is_not_yet_available() {
        let cache = cache();
        assert!(matches!(
            cache.get("005930"),
            Err(MarketError::NotYetAvailable(_))
        ));
    }

    #[test]
    fn test_update_overwrites_wholesale() {
        let cache = cache();
        let now = Utc::now();
        cache.update("005930", quote(now, 70_000));
        cache.update("005930", quote(now, 70_100));
        let cached = cache.get_at("005930", now).unwrap();
        assert_eq!(cached.value.last, 70_100);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_stale_snapshot_is_returned_with_lag() {
        let cache = cache();
        let now = Utc::now();
        cache.update("005930", quote(now - TimeDelta::seconds(30), 70_000));

        let cached = cache.get_at("005930", now).unwrap();
        assert_eq!(cached.value.last, 70_000);
        assert!(cached.is_stale());
        assert_eq!(cached.stale_by, Some(TimeDelta::seconds(30)));
    }

    #[test]
    fn test_fresh_snapshot_is_not_stale() {
        let cache = cache();
        let now = Utc::now();
        cache.update("005930", quote(now - TimeDelta::seconds(10), 70_000));
        assert!(!cache.get_at("005930", now).unwrap().is_stale());
    }
}

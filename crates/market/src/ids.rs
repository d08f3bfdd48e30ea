use kbridge_core::{FeedChannel, RequestId, ScreenNo};
use std::sync::atomic::{AtomicU64, Ordering};

/// Highest screen number handed out by [`ScreenAllocator`].
pub const MAX_QUERY_SCREEN: u16 = 100;

/// Fixed screen owned by the real-time price channel.
pub const PRICE_FEED_SCREEN: ScreenNo = ScreenNo::new(101);

/// Fixed screen owned by the real-time depth channel.
pub const DEPTH_FEED_SCREEN: ScreenNo = ScreenNo::new(102);

/// Screen that carries registrations for `channel`.
///
/// Each channel keeps one screen so that a replacing registration clears
/// exactly that channel.
pub fn feed_screen(channel: FeedChannel) -> ScreenNo {
    match channel {
        FeedChannel::Price => PRICE_FEED_SCREEN,
        FeedChannel::Depth => DEPTH_FEED_SCREEN,
    }
}

/// Generates unique request ids of the form `<prefix><label>-<seq>`.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self, label: &str) -> RequestId {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        RequestId::new(format!("{}{}-{:06}", self.prefix, label, seq))
    }
}

/// Hands out query screens cyclically in `0001..=0100`.
#[derive(Debug, Default)]
pub struct ScreenAllocator {
    next: AtomicU64,
}

impl ScreenAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> ScreenNo {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        ScreenNo::new((n % u64::from(MAX_QUERY_SCREEN)) as u16 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_request_ids_are_unique() {
        let ids = RequestIdGenerator::new("");
        let seen: HashSet<_> = (0..500).map(|_| ids.next("GetDeposit")).collect();
        assert_eq!(seen.len(), 500);
        assert!(ids.next("GetBalance").as_str().starts_with("GetBalance-"));
    }

    #[test]
    fn test_screens_wrap_after_one_hundred() {
        let screens = ScreenAllocator::new();
        assert_eq!(screens.next().to_string(), "0001");
        for _ in 0..98 {
            screens.next();
        }
        assert_eq!(screens.next().to_string(), "0100");
        assert_eq!(screens.next().to_string(), "0001");
    }

    #[test]
    fn test_feed_screens_are_outside_query_range() {
        assert!(PRICE_FEED_SCREEN.value() > MAX_QUERY_SCREEN);
        assert_ne!(feed_screen(FeedChannel::Price), feed_screen(FeedChannel::Depth));
    }
}

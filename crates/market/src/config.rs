use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning for the market facade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Deadline for login, condition and TR round trips. `None` waits forever.
    pub request_timeout_ms: Option<u64>,
    /// Deadline for `get_order_info`. `None` waits until the order completes.
    pub order_timeout_ms: Option<u64>,
    /// Backoff between polls of the real-time cache.
    pub feed_poll_interval_ms: u64,
    /// How long to poll for the first real-time value. `None` polls forever.
    pub feed_timeout_ms: Option<u64>,
    /// Lag behind the wall clock after which a snapshot is reported stale.
    pub stale_after_secs: i64,
    /// Calls allowed per rate-limit window, per category.
    pub rate_limit_capacity: u32,
    pub rate_limit_window_ms: u64,
    /// Attempts made by `login_with_retry`.
    pub login_attempts: u32,
    pub login_backoff_ms: u64,
    /// Capacity of the push-event broadcast channel.
    pub event_buffer: usize,
    /// Completed order records kept for `get_order_info`, oldest evicted first.
    pub completed_order_retention: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: Some(30_000),
            order_timeout_ms: None,
            feed_poll_interval_ms: 100,
            feed_timeout_ms: Some(10_000),
            stale_after_secs: 10,
            rate_limit_capacity: 5,
            rate_limit_window_ms: 1_000,
            login_attempts: 3,
            login_backoff_ms: 1_000,
            event_buffer: 1024,
            completed_order_retention: crate::orders::DEFAULT_RETENTION,
        }
    }
}

impl MarketConfig {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn order_timeout(&self) -> Option<Duration> {
        self.order_timeout_ms.map(Duration::from_millis)
    }

    pub fn feed_poll_interval(&self) -> Duration {
        Duration::from_millis(self.feed_poll_interval_ms.max(1))
    }

    pub fn feed_timeout(&self) -> Option<Duration> {
        self.feed_timeout_ms.map(Duration::from_millis)
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_after_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_millis(self.rate_limit_window_ms)
    }

    pub fn login_backoff(&self) -> Duration {
        Duration::from_millis(self.login_backoff_ms)
    }
}

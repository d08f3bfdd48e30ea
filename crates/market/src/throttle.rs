use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Which broker rate limit a call counts against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThrottleKind {
    Query,
    Order,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    window_start: Instant,
}

/// Fixed-window token bucket: `capacity` calls per `window`, refilled in full
/// when the window rolls over. Exhausted callers sleep until the next window.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    window: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(capacity: u32, window: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            window,
            state: Mutex::new(BucketState {
                tokens: capacity,
                window_start: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available. Returns how long
    /// the caller waited.
    pub async fn acquire(&self) -> Duration {
        let started = Instant::now();
        // Held across the sleep so waiters are served in arrival order.
        let mut state = self.state.lock().await;
        loop {
            let now = Instant::now();
            if now.duration_since(state.window_start) >= self.window {
                state.tokens = self.capacity;
                state.window_start = now;
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                break;
            }
            let resume_at = state.window_start + self.window;
            debug!(
                wait_ms = resume_at.saturating_duration_since(now).as_millis() as u64,
                "Rate limit reached, waiting for the next window"
            );
            tokio::time::sleep_until(resume_at).await;
        }
        started.elapsed()
    }
}

/// The two independent broker limits.
#[derive(Debug)]
pub struct Throttle {
    query: TokenBucket,
    order: TokenBucket,
}

impl Throttle {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            query: TokenBucket::new(capacity, window),
            order: TokenBucket::new(capacity, window),
        }
    }

    pub async fn acquire(&self, kind: ThrottleKind) -> Duration {
        match kind {
            ThrottleKind::Query => self.query.acquire().await,
            ThrottleKind::Order => self.order.acquire().await,
        }
    }
}

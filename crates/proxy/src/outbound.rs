use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

/// What to do when a slow client lets its outbound queue fill up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the oldest queued line to make room.
    #[default]
    DropOldest,
    /// Close the connection.
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("outbound queue overflowed")]
    Overflow,
    #[error("outbound queue is closed")]
    Closed,
}

#[derive(Debug, Default)]
struct State {
    lines: VecDeque<String>,
    closed: bool,
    dropped: u64,
}

/// Bounded per-connection line queue drained by a single writer task.
///
/// Producers never wait on the socket.
#[derive(Debug)]
pub struct OutboundQueue {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue one line, applying the overflow policy if the queue is full.
    pub fn push(&self, line: String) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.lines.len() >= self.capacity {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.lines.pop_front();
                        state.dropped += 1;
                        warn!(dropped = state.dropped, capacity = self.capacity, "Outbound queue full, dropped oldest line");
                    }
                    OverflowPolicy::Disconnect => {
                        state.lines.clear();
                        state.closed = true;
                        drop(state);
                        warn!(capacity = self.capacity, "Outbound queue full, disconnecting client");
                        self.notify.notify_one();
                        return Err(QueueError::Overflow);
                    }
                }
            }
            state.lines.push_back(line);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Next line to write. `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<String> {
        loop {
            {
                let mut state = self.lock();
                if let Some(line) = state.lines.pop_front() {
                    return Some(line);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting lines. Lines already queued are still delivered.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines discarded under [`OverflowPolicy::DropOldest`].
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }
}

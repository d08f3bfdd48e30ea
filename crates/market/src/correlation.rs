//! Single-use rendezvous slots between a waiting caller and the dispatch
//! context that later delivers its result.

use kbridge_core::MarketError;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Slot<V> = oneshot::Sender<Result<V, MarketError>>;

struct Slots<K, V> {
    entries: HashMap<K, (u64, Slot<V>)>,
    next_token: u64,
}

/// Table of pending slots keyed by request id, order number or condition name.
///
/// Only the table itself is locked; waiting happens on each slot's own
/// oneshot channel, so distinct keys never contend.
pub struct CorrelationStore<K, V> {
    slots: Mutex<Slots<K, V>>,
}

impl<K, V> Default for CorrelationStore<K, V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: HashMap::new(),
                next_token: 0,
            }),
        }
    }
}

impl<K, V> CorrelationStore<K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots<K, V>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create an empty slot for `key`.
    pub fn register(&self, key: K) -> Result<Pending<'_, K, V>, MarketError> {
        let (tx, rx) = oneshot::channel();
        let mut slots = self.lock();
        if slots.entries.contains_key(&key) {
            return Err(MarketError::DuplicateKey(key.to_string()));
        }
        slots.next_token += 1;
        let token = slots.next_token;
        slots.entries.insert(key.clone(), (token, tx));
        Ok(Pending {
            store: self,
            key,
            token,
            rx: Some(rx),
        })
    }

    /// Fulfil the slot for `key` with `value`.
    ///
    /// A missing slot (late, duplicate or orphaned callback) yields
    /// `UnknownKey` and changes nothing.
    pub fn resolve(&self, key: &K, value: V) -> Result<(), MarketError> {
        self.complete(key, Ok(value))
    }

    /// Fulfil the slot for `key` with an error.
    pub fn fail(&self, key: &K, error: MarketError) -> Result<(), MarketError> {
        self.complete(key, Err(error))
    }

    fn complete(&self, key: &K, result: Result<V, MarketError>) -> Result<(), MarketError> {
        let slot = self.lock().entries.remove(key);
        match slot {
            Some((_, tx)) => {
                if tx.send(result).is_err() {
                    debug!(key = %key, "Waiter went away before its result arrived");
                }
                Ok(())
            }
            None => Err(MarketError::UnknownKey(key.to_string())),
        }
    }

    /// Fail every slot whose key matches `pred`. Returns how many were failed.
    pub fn fail_matching<F>(&self, mut pred: F, error: &MarketError) -> usize
    where
        F: FnMut(&K) -> bool,
    {
        let drained: Vec<_> = {
            let mut slots = self.lock();
            let keys: Vec<K> = slots.entries.keys().filter(|k| pred(k)).cloned().collect();
            keys.into_iter()
                .filter_map(|k| slots.entries.remove(&k))
                .collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Fail every pending slot.
    pub fn fail_all(&self, error: &MarketError) -> usize {
        let count = self.fail_matching(|_| true, error);
        if count > 0 {
            warn!(count, error = %error, "Force-resolved pending requests");
        }
        count
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn discard(&self, key: &K, token: u64) {
        let mut slots = self.lock();
        if slots.entries.get(key).is_some_and(|(t, _)| *t == token) {
            slots.entries.remove(key);
        }
    }
}

/// The caller's side of a registered slot.
///
/// Dropping it without waiting removes the slot, so a cancelled caller never
/// leaves an entry behind.
pub struct Pending<'a, K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    store: &'a CorrelationStore<K, V>,
    key: K,
    token: u64,
    rx: Option<oneshot::Receiver<Result<V, MarketError>>>,
}

impl<K, V> Pending<'_, K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Wait for the slot to be resolved, up to `deadline` if one is given.
    ///
    /// On expiry the slot is removed and `Timeout` is returned; a stray
    /// resolve arriving afterwards is reported as `UnknownKey`.
    pub async fn wait(mut self, deadline: Option<Duration>) -> Result<V, MarketError> {
        let Some(rx) = self.rx.take() else {
            return Err(MarketError::ConnectionLost);
        };
        let received = match deadline {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(key = %self.key, ?limit, "Request timed out");
                    return Err(MarketError::Timeout(self.key.to_string()));
                }
            },
            None => rx.await,
        };
        // The sender only disappears unanswered if the store is torn down.
        received.unwrap_or(Err(MarketError::ConnectionLost))
    }
}

impl<K, V> Drop for Pending<'_, K, V>
where
    K: Eq + Hash + Clone + fmt::Display,
{
    fn drop(&mut self) {
        self.store.discard(&self.key, self.token);
    }
}

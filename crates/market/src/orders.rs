use chrono::Utc;
use kbridge_core::{ExecutionKind, ExecutionReport, MarketError, OrderNumber, OrderRecord, OrderStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Completed records kept by [`OrderTable::new`].
pub const DEFAULT_RETENTION: usize = 10_000;

#[derive(Default)]
struct Inner {
    records: HashMap<OrderNumber, OrderRecord>,
    waiters: HashMap<OrderNumber, Vec<oneshot::Sender<OrderRecord>>>,
    /// Cancel order number -> the order it cancels.
    aliases: HashMap<OrderNumber, OrderNumber>,
    /// Terminal records, oldest first.
    completed: VecDeque<OrderNumber>,
}

impl Inner {
    fn target(&self, order_number: &OrderNumber) -> OrderNumber {
        self.aliases
            .get(order_number)
            .unwrap_or(order_number)
            .clone()
    }

    fn evict_beyond(&mut self, retention: usize) {
        while self.completed.len() > retention {
            let Some(oldest) = self.completed.pop_front() else {
                break;
            };
            self.records.remove(&oldest);
            self.aliases.retain(|_, original| *original != oldest);
            debug!(order_number = %oldest, "Evicted completed order record");
        }
    }
}

/// Fill and cancel records keyed by broker order number.
///
/// Records are built only from execution reports applied by the dispatch
/// context. Callers wait for a record to reach a terminal status. Only the
/// most recent `retention` completed records are kept.
pub struct OrderTable {
    inner: Mutex<Inner>,
    retention: usize,
}

impl Default for OrderTable {
    fn default() -> Self {
        Self::with_retention(DEFAULT_RETENTION)
    }
}

impl OrderTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retention: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            retention: retention.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `cancel_number`, the number the broker assigned to a cancel,
    /// refer to the record of the order it cancels.
    pub fn alias(&self, cancel_number: &OrderNumber, original: &OrderNumber) {
        let mut inner = self.lock();
        inner.aliases.insert(cancel_number.clone(), original.clone());
        if let Some(waiters) = inner.waiters.remove(cancel_number) {
            inner.waiters.entry(original.clone()).or_default().extend(waiters);
        }
        let done = inner
            .records
            .get(original)
            .filter(|record| record.status.is_terminal())
            .cloned();
        if let Some(done) = done {
            if let Some(waiters) = inner.waiters.remove(original) {
                for tx in waiters {
                    let _ = tx.send(done.clone());
                }
            }
        }
    }

    /// Apply one execution report. Returns the record if this report made it
    /// terminal.
    pub fn apply(&self, report: &ExecutionReport) -> Option<OrderRecord> {
        let mut inner = self.lock();
        let record = inner
            .records
            .entry(report.order_number.clone())
            .or_insert_with(|| OrderRecord {
                order_number: report.order_number.clone(),
                code: report.code.clone(),
                side: report.side,
                requested_quantity: report.order_quantity,
                filled_quantity: 0,
                fill_price: None,
                remaining_quantity: report.order_quantity,
                status: OrderStatus::Submitted,
                updated_at: Utc::now(),
            });

        if record.status.is_terminal() {
            warn!(
                order_number = %report.order_number,
                status = ?record.status,
                kind = ?report.kind,
                "Execution report for a completed order ignored"
            );
            return None;
        }

        match report.kind {
            ExecutionKind::Accepted => {
                if report.order_quantity > 0 {
                    record.requested_quantity = report.order_quantity;
                    record.remaining_quantity = report.remaining_quantity;
                }
            }
            ExecutionKind::Filled => {
                if report.order_quantity > 0 {
                    record.requested_quantity = report.order_quantity;
                }
                record.remaining_quantity = report.remaining_quantity;
                record.filled_quantity = record
                    .requested_quantity
                    .saturating_sub(report.remaining_quantity);
                if report.fill_price.is_some() {
                    record.fill_price = report.fill_price;
                }
                record.status = if report.remaining_quantity == 0 {
                    OrderStatus::Filled
                } else {
                    OrderStatus::PartiallyFilled
                };
            }
            ExecutionKind::CancelAccepted => {
                record.status = OrderStatus::CancelAccepted;
            }
            ExecutionKind::CancelConfirmed => {
                record.remaining_quantity = report.remaining_quantity;
                record.status = OrderStatus::CancelConfirmed;
            }
        }
        record.updated_at = Utc::now();
        debug!(
            order_number = %record.order_number,
            status = ?record.status,
            filled = record.filled_quantity,
            remaining = record.remaining_quantity,
            "Order record updated"
        );

        if !record.status.is_terminal() {
            return None;
        }
        let done = record.clone();
        info!(
            order_number = %done.order_number,
            code = %done.code,
            status = ?done.status,
            filled = done.filled_quantity,
            "Order completed"
        );
        if let Some(waiters) = inner.waiters.remove(&done.order_number) {
            for tx in waiters {
                let _ = tx.send(done.clone());
            }
        }
        inner.completed.push_back(done.order_number.clone());
        inner.evict_beyond(self.retention);
        Some(done)
    }

    /// The record for `order_number`, following cancel aliases.
    pub fn get(&self, order_number: &OrderNumber) -> Option<OrderRecord> {
        let inner = self.lock();
        inner.records.get(&inner.target(order_number)).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until the order reaches `Filled` or `CancelConfirmed`.
    ///
    /// The order number does not need to be known yet; partial fills do not
    /// wake the caller. A cancel's own order number waits on the order it
    /// cancels.
    pub async fn wait_terminal(
        &self,
        order_number: &OrderNumber,
        deadline: Option<Duration>,
    ) -> Result<OrderRecord, MarketError> {
        let (target, rx) = {
            let mut inner = self.lock();
            let target = inner.target(order_number);
            if let Some(record) = inner.records.get(&target) {
                if record.status.is_terminal() {
                    return Ok(record.clone());
                }
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.entry(target.clone()).or_default().push(tx);
            (target, rx)
        };

        let received = match deadline {
            Some(limit) => {
                let outcome = tokio::time::timeout(limit, rx).await;
                match outcome {
                    Ok(received) => received,
                    Err(_) => {
                        self.prune_waiters(&target);
                        warn!(order_number = %order_number, ?limit, "Timed out waiting for order completion");
                        return Err(MarketError::Timeout(order_number.to_string()));
                    }
                }
            }
            None => rx.await,
        };
        received.map_err(|_| MarketError::ConnectionLost)
    }

    fn prune_waiters(&self, order_number: &OrderNumber) {
        let mut inner = self.lock();
        if let Some(waiters) = inner.waiters.get_mut(order_number) {
            waiters.retain(|tx| !tx.is_closed());
            if waiters.is_empty() {
                inner.waiters.remove(order_number);
            }
        }
    }

    pub(crate) fn waiter_count(&self, order_number: &OrderNumber) -> usize {
        let inner = self.lock();
        inner
            .waiters
            .get(&inner.target(order_number))
            .map_or(0, |waiters| waiters.len())
    }
}

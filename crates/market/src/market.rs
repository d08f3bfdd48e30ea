use kbridge_core::*;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{Cached, RealTimeCache, Timestamped};
use crate::config::MarketConfig;
use crate::correlation::CorrelationStore;
use crate::ids::{feed_screen, RequestIdGenerator, ScreenAllocator};
use crate::orders::OrderTable;
use crate::throttle::{Throttle, ThrottleKind};

// ---------------------------------------------------------------------------
// Correlation keys
// ---------------------------------------------------------------------------

/// What a pending slot is waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Connect,
    ConditionList,
    /// Condition searches are keyed by name, not by a generated id.
    Condition(String),
    Request(RequestId),
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationKey::Connect => f.write_str("connect"),
            CorrelationKey::ConditionList => f.write_str("condition_list"),
            CorrelationKey::Condition(name) => write!(f, "condition:{}", name),
            CorrelationKey::Request(id) => write!(f, "{}", id),
        }
    }
}

#[derive(Debug)]
enum Reply {
    Connected(i32),
    Tr(TrReply),
    Conditions(Result<Vec<Condition>, i32>),
    Matches(Vec<String>),
}

impl Reply {
    fn unexpected(self, wanted: &str) -> MarketError {
        MarketError::Protocol(format!("expected {} reply, got {:?}", wanted, self))
    }
}

// ---------------------------------------------------------------------------
// Dispatch context
// ---------------------------------------------------------------------------

/// State written by the dispatcher and read by facade calls.
struct Shared {
    pending: CorrelationStore<CorrelationKey, Reply>,
    orders: OrderTable,
    quotes: RealTimeCache<QuoteSnapshot>,
    depth: RealTimeCache<DepthSnapshot>,
    holdings: Mutex<Holdings>,
    events: broadcast::Sender<PushEvent>,
}

impl Shared {
    fn publish(&self, event: PushEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn resolve(&self, key: CorrelationKey, reply: Reply) {
        if let Err(err) = self.pending.resolve(&key, reply) {
            warn!(key = %key, error = %err, "Dropping callback with no pending request");
        }
    }

    fn dispatch(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Connected { code } => {
                self.resolve(CorrelationKey::Connect, Reply::Connected(code));
            }
            GatewayEvent::TrData { request_id, reply } => {
                if let TrPayload::Balance(holdings) = &reply.payload {
                    *self.holdings.lock().unwrap_or_else(PoisonError::into_inner) = holdings.clone();
                }
                self.resolve(CorrelationKey::Request(request_id), Reply::Tr(reply));
            }
            GatewayEvent::ConditionsLoaded(result) => {
                self.resolve(CorrelationKey::ConditionList, Reply::Conditions(result));
            }
            GatewayEvent::ConditionMatched { name, codes } => {
                self.resolve(CorrelationKey::Condition(name), Reply::Matches(codes));
            }
            GatewayEvent::Execution(report) => {
                if let Some(record) = self.orders.apply(&report) {
                    self.publish(PushEvent::OrderCompleted(record));
                }
            }
            GatewayEvent::BalanceChanged(entry) => {
                {
                    let mut holdings = self.holdings.lock().unwrap_or_else(PoisonError::into_inner);
                    if entry.held_quantity == 0 {
                        holdings.remove(&entry.code);
                    } else {
                        holdings.insert(entry.code.clone(), entry.clone());
                    }
                }
                self.publish(PushEvent::Balance(entry));
            }
            GatewayEvent::Quote { code, snapshot } => {
                self.quotes.update(&code, snapshot.clone());
                self.publish(PushEvent::Quote { code, snapshot });
            }
            GatewayEvent::Depth { code, snapshot } => {
                self.depth.update(&code, snapshot.clone());
                self.publish(PushEvent::Depth { code, snapshot });
            }
            GatewayEvent::Message {
                request_id,
                tr_code,
                text,
            } => {
                info!(request_id = %request_id, tr_code = %tr_code, "Broker message: {}", text);
            }
        }
    }
}

async fn run_dispatcher(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<GatewayEvent>) {
    while let Some(event) = events.recv().await {
        shared.dispatch(event);
    }
    warn!("Gateway event stream closed");
    shared.pending.fail_all(&MarketError::ConnectionLost);
}

// ---------------------------------------------------------------------------
// Facade
// ---------------------------------------------------------------------------

/// Awaitable API over a callback-driven [`Gateway`].
///
/// One instance is shared per process, typically behind an `Arc`. Every
/// correlated call submits to the gateway and then waits on its own slot,
/// so any number of tasks may call concurrently.
pub struct Market {
    gateway: Arc<dyn Gateway>,
    shared: Arc<Shared>,
    config: MarketConfig,
    ids: RequestIdGenerator,
    screens: ScreenAllocator,
    throttle: Throttle,
    account: RwLock<Option<String>>,
    subscriptions: Mutex<HashMap<FeedChannel, BTreeSet<String>>>,
    dispatcher: JoinHandle<()>,
}

impl Market {
    /// Build the facade and start its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(
        gateway: Arc<dyn Gateway>,
        events: mpsc::UnboundedReceiver<GatewayEvent>,
        config: MarketConfig,
    ) -> Self {
        Self::with_generators(
            gateway,
            events,
            config,
            RequestIdGenerator::new(""),
            ScreenAllocator::new(),
        )
    }

    pub fn with_generators(
        gateway: Arc<dyn Gateway>,
        events: mpsc::UnboundedReceiver<GatewayEvent>,
        config: MarketConfig,
        ids: RequestIdGenerator,
        screens: ScreenAllocator,
    ) -> Self {
        let (tx, _) = broadcast::channel(config.event_buffer.max(1));
        let shared = Arc::new(Shared {
            pending: CorrelationStore::new(),
            orders: OrderTable::with_retention(config.completed_order_retention),
            quotes: RealTimeCache::new("price", config.stale_after()),
            depth: RealTimeCache::new("ask_bid", config.stale_after()),
            holdings: Mutex::new(Holdings::new()),
            events: tx,
        });
        let dispatcher = tokio::spawn(run_dispatcher(shared.clone(), events));
        let throttle = Throttle::new(config.rate_limit_capacity, config.rate_limit_window());

        Self {
            gateway,
            shared,
            config,
            ids,
            screens,
            throttle,
            account: RwLock::new(None),
            subscriptions: Mutex::new(HashMap::new()),
            dispatcher,
        }
    }

    pub fn config(&self) -> &MarketConfig {
        &self.config
    }

    async fn round_trip<F>(
        &self,
        key: CorrelationKey,
        submit: F,
        deadline: Option<Duration>,
    ) -> Result<Reply, MarketError>
    where
        F: Future<Output = Result<(), MarketError>>,
    {
        let pending = self.shared.pending.register(key)?;
        debug!(key = %pending.key(), "Submitting to gateway");
        submit.await?;
        pending.wait(deadline).await
    }

    // -- Session --------------------------------------------------------------

    /// Log in once. A nonzero result code fails with `AuthError`.
    pub async fn login(&self) -> Result<String, MarketError> {
        let reply = self
            .round_trip(
                CorrelationKey::Connect,
                self.gateway.connect(),
                self.config.request_timeout(),
            )
            .await?;
        match reply {
            Reply::Connected(0) => {}
            Reply::Connected(code) => {
                warn!(code, "Login rejected");
                return Err(MarketError::AuthError(code));
            }
            other => return Err(other.unexpected("connect")),
        }
        let account = self.load_account().await?;
        info!(account = %account, "Logged in");
        Ok(account)
    }

    /// Log in, retrying a bounded number of times with a fixed backoff.
    pub async fn login_with_retry(&self) -> Result<String, MarketError> {
        let attempts = self.config.login_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.login().await {
                Ok(account) => return Ok(account),
                Err(err) if attempt < attempts => {
                    warn!(attempt, attempts, error = %err, "Login attempt failed, retrying");
                    tokio::time::sleep(self.config.login_backoff()).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Load the account list and select the first account.
    pub async fn load_account(&self) -> Result<String, MarketError> {
        let accounts = self.gateway.accounts().await?;
        let account = accounts
            .first()
            .cloned()
            .ok_or_else(|| MarketError::Gateway("no accounts available".to_string()))?;
        if accounts.len() > 1 {
            warn!(count = accounts.len(), account = %account, "Several accounts available, using the first");
        }
        *self.account.write().unwrap_or_else(PoisonError::into_inner) = Some(account.clone());
        Ok(account)
    }

    /// The selected account, once logged in.
    pub fn account(&self) -> Result<String, MarketError> {
        self.account
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(MarketError::NotLoggedIn)
    }

    // -- Conditions -----------------------------------------------------------

    pub async fn get_condition_list(&self) -> Result<Vec<Condition>, MarketError> {
        self.account()?;
        let reply = self
            .round_trip(
                CorrelationKey::ConditionList,
                self.gateway.load_conditions(),
                self.config.request_timeout(),
            )
            .await?;
        match reply {
            Reply::Conditions(Ok(conditions)) => Ok(conditions),
            Reply::Conditions(Err(code)) => Err(MarketError::Gateway(format!(
                "condition list load failed with code {}",
                code
            ))),
            other => Err(other.unexpected("condition list")),
        }
    }

    /// Instruments currently matching a saved condition. Only one search per
    /// condition name may be in flight.
    pub async fn get_matching_stocks(
        &self,
        name: &str,
        index: u32,
    ) -> Result<Vec<String>, MarketError> {
        self.account()?;
        self.throttle.acquire(ThrottleKind::Query).await;
        let screen = self.screens.next();
        let reply = self
            .round_trip(
                CorrelationKey::Condition(name.to_string()),
                self.gateway.search_condition(screen, name, index),
                self.config.request_timeout(),
            )
            .await?;
        match reply {
            Reply::Matches(codes) => Ok(codes),
            other => Err(other.unexpected("condition result")),
        }
    }

    // -- TR queries -----------------------------------------------------------

    /// Issue one TR query under a caller-chosen request id.
    pub async fn request_tr(
        &self,
        request_id: RequestId,
        query: TrQuery,
    ) -> Result<TrReply, MarketError> {
        let account = self.account()?;
        self.throttle.acquire(ThrottleKind::Query).await;
        let screen = self.screens.next();
        let reply = self
            .round_trip(
                CorrelationKey::Request(request_id.clone()),
                self.gateway.query(&request_id, screen, &account, query),
                self.config.request_timeout(),
            )
            .await?;
        match reply {
            Reply::Tr(reply) => {
                if reply.has_more() {
                    debug!(request_id = %request_id, "Broker reports further pages");
                }
                Ok(reply)
            }
            other => Err(other.unexpected("TR")),
        }
    }

    /// Orderable cash in KRW.
    pub async fn get_deposit(&self) -> Result<i64, MarketError> {
        let reply = self.request_tr(self.ids.next("GetDeposit"), TrQuery::Deposit).await?;
        match reply.payload {
            TrPayload::Deposit(amount) => Ok(amount),
            other => Err(MarketError::Protocol(format!(
                "expected deposit payload, got {:?}",
                other
            ))),
        }
    }

    pub async fn get_balance(&self) -> Result<Holdings, MarketError> {
        let reply = self.request_tr(self.ids.next("GetBalance"), TrQuery::Balance).await?;
        match reply.payload {
            TrPayload::Balance(holdings) => Ok(holdings),
            other => Err(MarketError::Protocol(format!(
                "expected balance payload, got {:?}",
                other
            ))),
        }
    }

    /// Live balance map, kept current by balance-change events.
    pub fn holdings(&self) -> Holdings {
        self.shared
            .holdings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    // -- Orders ---------------------------------------------------------------

    pub async fn request_order(&self, spec: &OrderSpec) -> Result<OrderAck, MarketError> {
        self.request_order_as(self.ids.next("SendOrder"), spec).await
    }

    /// Submit a new order under a caller-chosen request id.
    pub async fn request_order_as(
        &self,
        request_id: RequestId,
        spec: &OrderSpec,
    ) -> Result<OrderAck, MarketError> {
        spec.validate()?;
        self.submit_ticket(request_id, OrderTicket::New(spec.clone())).await
    }

    pub async fn cancel_order(&self, spec: &CancelSpec) -> Result<OrderAck, MarketError> {
        self.cancel_order_as(self.ids.next("CancelOrder"), spec).await
    }

    pub async fn cancel_order_as(
        &self,
        request_id: RequestId,
        spec: &CancelSpec,
    ) -> Result<OrderAck, MarketError> {
        spec.validate()?;
        let ack = self
            .submit_ticket(request_id, OrderTicket::Cancel(spec.clone()))
            .await?;
        self.shared
            .orders
            .alias(&ack.order_number, &spec.original_order_number);
        Ok(ack)
    }

    async fn submit_ticket(
        &self,
        request_id: RequestId,
        ticket: OrderTicket,
    ) -> Result<OrderAck, MarketError> {
        let account = self.account()?;
        self.throttle.acquire(ThrottleKind::Order).await;
        let screen = self.screens.next();
        let reply = self
            .round_trip(
                CorrelationKey::Request(request_id.clone()),
                self.gateway.submit_order(&request_id, screen, &account, &ticket),
                self.config.request_timeout(),
            )
            .await?;
        let order_number = match reply {
            Reply::Tr(TrReply {
                payload: TrPayload::OrderNumber(number),
                ..
            }) => number,
            other => return Err(other.unexpected("order number")),
        };
        if order_number.as_str().trim().is_empty() {
            return Err(MarketError::Gateway(format!(
                "order {} for {} was rejected",
                request_id,
                ticket.code()
            )));
        }
        info!(request_id = %request_id, order_number = %order_number, code = %ticket.code(), "Order accepted");
        Ok(OrderAck {
            request_id,
            order_number,
        })
    }

    /// Wait until the order is filled or its cancellation is confirmed.
    pub async fn get_order_info(&self, order_number: &OrderNumber) -> Result<OrderRecord, MarketError> {
        self.shared
            .orders
            .wait_terminal(order_number, self.config.order_timeout())
            .await
    }

    // -- Real-time feeds ------------------------------------------------------

    pub async fn register_price_feed(&self, codes: &[String], replace: bool) -> Result<(), MarketError> {
        self.register_feed(FeedChannel::Price, codes, replace).await
    }

    pub async fn register_depth_feed(&self, codes: &[String], replace: bool) -> Result<(), MarketError> {
        self.register_feed(FeedChannel::Depth, codes, replace).await
    }

    async fn register_feed(
        &self,
        channel: FeedChannel,
        codes: &[String],
        replace: bool,
    ) -> Result<(), MarketError> {
        self.account()?;
        self.gateway
            .subscribe(feed_screen(channel), codes, channel, replace)
            .await?;
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let registered = subscriptions.entry(channel).or_default();
        if replace {
            registered.clear();
        }
        registered.extend(codes.iter().cloned());
        info!(channel = %channel, count = registered.len(), replace, "Real-time registration updated");
        Ok(())
    }

    /// Codes currently registered on `channel`.
    pub fn subscriptions(&self, channel: FeedChannel) -> Vec<String> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&channel)
            .map(|codes| codes.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Latest quote for `code`, polling until the first push arrives.
    pub async fn get_price(&self, code: &str) -> Result<Cached<QuoteSnapshot>, MarketError> {
        self.poll_cache(&self.shared.quotes, code).await
    }

    /// Latest order book for `code`, polling until the first push arrives.
    pub async fn get_depth(&self, code: &str) -> Result<Cached<DepthSnapshot>, MarketError> {
        self.poll_cache(&self.shared.depth, code).await
    }

    async fn poll_cache<T: Clone + Timestamped>(
        &self,
        cache: &RealTimeCache<T>,
        code: &str,
    ) -> Result<Cached<T>, MarketError> {
        let started = tokio::time::Instant::now();
        loop {
            match cache.get(code) {
                Err(MarketError::NotYetAvailable(what)) => {
                    if let Some(limit) = self.config.feed_timeout() {
                        if started.elapsed() >= limit {
                            warn!(code, "No real-time data arrived before the deadline");
                            return Err(MarketError::Timeout(what));
                        }
                    }
                }
                result => return result,
            }
            tokio::time::sleep(self.config.feed_poll_interval()).await;
        }
    }

    // -- Introspection --------------------------------------------------------

    /// Receiver of quote, depth, balance and order-completion pushes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PushEvent> {
        self.shared.events.subscribe()
    }

    /// Number of correlated requests still waiting for a callback.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    /// The order record as currently known, terminal or not.
    pub fn order_record(&self, order_number: &OrderNumber) -> Option<OrderRecord> {
        self.shared.orders.get(order_number)
    }
}

impl Drop for Market {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

use async_trait::async_trait;
use chrono::Utc;
use kbridge_core::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for the simulated gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedGatewayConfig {
    /// Starting orderable cash in KRW.
    pub initial_deposit: i64,
    /// Result code reported for every login attempt. Zero means success.
    pub login_result: i32,
    pub accounts: Vec<String>,
    /// Saved conditions offered by the condition list.
    pub conditions: Vec<Condition>,
    /// Codes returned by every condition search.
    pub condition_matches: Vec<String>,
    /// Instrument names used in balance entries.
    pub names: BTreeMap<String, String>,
    /// Number of execution reports a marketable order is filled in.
    pub fill_chunks: u64,
    /// First price of every instrument.
    pub base_price: i64,
    pub tick_size: i64,
    /// Interval of the price walk driven by [`SimulatedGateway::spawn_feed`].
    pub feed_interval_ms: u64,
}

impl Default for SimulatedGatewayConfig {
    fn default() -> Self {
        let names = [("005930", "삼성전자"), ("000660", "SK하이닉스"), ("035720", "카카오")]
            .into_iter()
            .map(|(code, name)| (code.to_string(), name.to_string()))
            .collect();
        Self {
            initial_deposit: 10_000_000,
            login_result: 0,
            accounts: vec!["8012345611".to_string()],
            conditions: vec![
                Condition {
                    index: 0,
                    name: "golden_cross".to_string(),
                },
                Condition {
                    index: 1,
                    name: "volume_surge".to_string(),
                },
            ],
            condition_matches: vec!["005930".to_string(), "000660".to_string()],
            names,
            fill_chunks: 2,
            base_price: 70_000,
            tick_size: 100,
            feed_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone)]
struct Ticker {
    open: i64,
    high: i64,
    low: i64,
    last: i64,
}

impl Ticker {
    fn new(price: i64) -> Self {
        Self {
            open: price,
            high: price,
            low: price,
            last: price,
        }
    }

    fn move_to(&mut self, price: i64) {
        self.last = price;
        self.high = self.high.max(price);
        self.low = self.low.min(price);
    }
}

/// A resting limit order waiting for the price to cross it.
#[derive(Debug, Clone)]
struct WorkingOrder {
    number: OrderNumber,
    spec: OrderSpec,
    filled: u64,
}

impl WorkingOrder {
    fn remaining(&self) -> u64 {
        self.spec.quantity - self.filled
    }

    fn marketable(&self, price: i64) -> bool {
        match self.spec.side {
            Side::Buy => self.spec.price >= price,
            Side::Sell => self.spec.price <= price,
        }
    }
}

#[derive(Debug, Default)]
struct Book {
    connected: bool,
    deposit: i64,
    holdings: Holdings,
    tickers: HashMap<String, Ticker>,
    working: Vec<WorkingOrder>,
    subscriptions: HashMap<FeedChannel, BTreeSet<String>>,
    next_order: u64,
    step: u64,
}

/// An in-process stand-in for the broker terminal.
///
/// Honours the gateway contract: every submission returns at once and its
/// result arrives later on the event sink. Market orders fill immediately in
/// several chunks, limit orders rest until the simulated price crosses them,
/// and prices follow a deterministic walk advanced by [`tick`](Self::tick).
pub struct SimulatedGateway {
    config: SimulatedGatewayConfig,
    sink: EventSink,
    book: Mutex<Book>,
}

impl SimulatedGateway {
    pub fn new(config: SimulatedGatewayConfig, sink: EventSink) -> Self {
        let book = Book {
            deposit: config.initial_deposit,
            next_order: 1,
            ..Book::default()
        };
        Self {
            config,
            sink,
            book: Mutex::new(book),
        }
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn name_of(&self, code: &str) -> String {
        self.config
            .names
            .get(code)
            .cloned()
            .unwrap_or_else(|| code.to_string())
    }

    fn ticker<'a>(&self, book: &'a mut Book, code: &str) -> &'a mut Ticker {
        book.tickers
            .entry(code.to_string())
            .or_insert_with(|| Ticker::new(self.config.base_price))
    }

    /// Current simulated price of `code`.
    pub fn price_of(&self, code: &str) -> i64 {
        let mut book = self.book();
        self.ticker(&mut book, code).last
    }

    /// Move `code` to `price`, publish it, and fill any limit order it crosses.
    pub fn set_price(&self, code: &str, price: i64) {
        let mut book = self.book();
        self.ticker(&mut book, code).move_to(price);
        self.publish(&mut book, code);
        self.match_working(&mut book, code);
    }

    /// Advance the price walk one step for every subscribed instrument.
    pub fn tick(&self) {
        let mut book = self.book();
        book.step += 1;
        let step = book.step;
        let codes: BTreeSet<String> = book.subscriptions.values().flatten().cloned().collect();
        for code in codes {
            let seed: u64 = code.bytes().map(u64::from).sum();
            let ticks = ((step * 7 + seed) % 5) as i64 - 2;
            let ticker = self.ticker(&mut book, &code);
            let next = (ticker.last + ticks * self.config.tick_size).max(self.config.tick_size);
            ticker.move_to(next);
            self.publish(&mut book, &code);
            self.match_working(&mut book, &code);
        }
    }

    /// Drive [`tick`](Self::tick) on the configured interval until the
    /// dispatcher goes away.
    pub fn spawn_feed(self: Arc<Self>) -> JoinHandle<()> {
        let period = Duration::from_millis(self.config.feed_interval_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if self.sink.is_closed() {
                    debug!("Simulated feed stopping");
                    break;
                }
                self.tick();
            }
        })
    }

    fn quote(&self, book: &mut Book, code: &str) -> QuoteSnapshot {
        let ticker = self.ticker(book, code);
        QuoteSnapshot {
            timestamp: Utc::now(),
            last: ticker.last,
            open: ticker.open,
            high: ticker.high,
            low: ticker.low,
        }
    }

    fn depth(&self, book: &mut Book, code: &str) -> DepthSnapshot {
        let last = self.ticker(book, code).last;
        let tick = self.config.tick_size;
        let level = |i: usize| (i as i64, (i as u64 + 1) * 100);
        DepthSnapshot {
            timestamp: Utc::now(),
            bids: (0..DEPTH_LEVELS)
                .map(level)
                .map(|(i, qty)| DepthLevel(last - i * tick, qty))
                .collect(),
            asks: (0..DEPTH_LEVELS)
                .map(level)
                .map(|(i, qty)| DepthLevel(last + (i + 1) * tick, qty))
                .collect(),
        }
    }

    fn publish(&self, book: &mut Book, code: &str) {
        let on = |channel: FeedChannel, book: &Book| {
            book.subscriptions
                .get(&channel)
                .is_some_and(|codes| codes.contains(code))
        };
        if on(FeedChannel::Price, book) {
            let snapshot = self.quote(book, code);
            self.sink.emit(GatewayEvent::Quote {
                code: code.to_string(),
                snapshot,
            });
        }
        if on(FeedChannel::Depth, book) {
            let snapshot = self.depth(book, code);
            self.sink.emit(GatewayEvent::Depth {
                code: code.to_string(),
                snapshot,
            });
        }
    }

    fn next_order_number(book: &mut Book) -> OrderNumber {
        let number = OrderNumber::new(format!("{:07}", book.next_order));
        book.next_order += 1;
        number
    }

    fn acknowledge(&self, request_id: &RequestId, number: OrderNumber) {
        self.sink.emit(GatewayEvent::TrData {
            request_id: request_id.clone(),
            reply: TrReply::complete(TrPayload::OrderNumber(number)),
        });
    }

    fn reject(&self, request_id: &RequestId, reason: &str) {
        warn!(request_id = %request_id, reason, "Simulated order rejected");
        self.sink.emit(GatewayEvent::Message {
            request_id: request_id.clone(),
            tr_code: "KOA_NORMAL_SEND_ORDER".to_string(),
            text: reason.to_string(),
        });
        self.acknowledge(request_id, OrderNumber::new(""));
    }

    fn report(&self, order: &WorkingOrder, kind: ExecutionKind, fill_price: Option<i64>, remaining: u64) {
        self.sink.emit(GatewayEvent::Execution(ExecutionReport {
            order_number: order.number.clone(),
            code: order.spec.code.clone(),
            side: order.spec.side,
            kind,
            order_quantity: order.spec.quantity,
            filled_quantity: order.filled,
            fill_price,
            remaining_quantity: remaining,
        }));
    }

    /// Fill the rest of `order` at `price` in the configured number of chunks.
    fn fill(&self, book: &mut Book, order: &mut WorkingOrder, price: i64) {
        let remaining = order.remaining();
        let chunks = self.config.fill_chunks.clamp(1, remaining.max(1));
        let base = remaining / chunks;
        for chunk in 0..chunks {
            let quantity = if chunk + 1 == chunks {
                order.remaining()
            } else {
                base
            };
            order.filled += quantity;
            self.report(order, ExecutionKind::Filled, Some(price), order.remaining());
            self.apply_fill(book, &order.spec, quantity, price);
        }
        debug!(order_number = %order.number, price, "Simulated order filled");
    }

    fn apply_fill(&self, book: &mut Book, spec: &OrderSpec, quantity: u64, price: i64) {
        let amount = price.saturating_mul(i64::try_from(quantity).unwrap_or(i64::MAX));
        let entry = book
            .holdings
            .entry(spec.code.clone())
            .or_insert_with(|| BalanceEntry {
                code: spec.code.clone(),
                name: self.name_of(&spec.code),
                held_quantity: 0,
                available_quantity: 0,
                average_cost: 0,
            });
        match spec.side {
            Side::Buy => {
                let held = i64::try_from(entry.held_quantity).unwrap_or(i64::MAX);
                let cost = entry.average_cost.saturating_mul(held).saturating_add(amount);
                entry.held_quantity = entry.held_quantity.saturating_add(quantity);
                entry.available_quantity = entry.available_quantity.saturating_add(quantity);
                entry.average_cost = cost / i64::try_from(entry.held_quantity).unwrap_or(i64::MAX);
                book.deposit = book.deposit.saturating_sub(amount);
            }
            Side::Sell => {
                entry.held_quantity = entry.held_quantity.saturating_sub(quantity);
                entry.available_quantity = entry.available_quantity.min(entry.held_quantity);
                book.deposit = book.deposit.saturating_add(amount);
            }
        }
        let snapshot = entry.clone();
        if snapshot.held_quantity == 0 {
            book.holdings.remove(&spec.code);
        }
        self.sink.emit(GatewayEvent::BalanceChanged(snapshot));
    }

    fn match_working(&self, book: &mut Book, code: &str) {
        let price = self.ticker(book, code).last;
        let (mut ready, resting): (Vec<_>, Vec<_>) = std::mem::take(&mut book.working)
            .into_iter()
            .partition(|order| order.spec.code == code && order.marketable(price));
        book.working = resting;
        for order in &mut ready {
            let limit = order.spec.price;
            self.fill(book, order, limit);
        }
    }

    fn submit_new(&self, request_id: &RequestId, spec: &OrderSpec) {
        let mut book = self.book();
        let price = self.ticker(&mut book, &spec.code).last;
        let exec_price = if spec.market { price } else { spec.price };

        let Some(notional) = spec.notional(exec_price) else {
            return self.reject(request_id, "order value out of range");
        };
        match spec.side {
            Side::Buy if notional > book.deposit => {
                return self.reject(request_id, "insufficient deposit");
            }
            Side::Sell => {
                let available = book
                    .holdings
                    .get(&spec.code)
                    .map_or(0, |entry| entry.available_quantity);
                if available < spec.quantity {
                    return self.reject(request_id, "insufficient holdings");
                }
                if let Some(entry) = book.holdings.get_mut(&spec.code) {
                    entry.available_quantity -= spec.quantity;
                }
            }
            Side::Buy => {}
        }

        let number = Self::next_order_number(&mut book);
        self.acknowledge(request_id, number.clone());

        let mut order = WorkingOrder {
            number,
            spec: spec.clone(),
            filled: 0,
        };
        self.report(&order, ExecutionKind::Accepted, None, spec.quantity);
        info!(order_number = %order.number, code = %spec.code, side = ?spec.side, quantity = spec.quantity, "Simulated order accepted");

        if spec.market || order.marketable(price) {
            self.fill(&mut book, &mut order, exec_price);
        } else {
            book.working.push(order);
        }
    }

    fn submit_cancel(&self, request_id: &RequestId, spec: &CancelSpec) {
        let mut book = self.book();
        let position = book
            .working
            .iter()
            .position(|order| order.number == spec.original_order_number);
        let Some(position) = position else {
            return self.reject(request_id, "no cancellable quantity");
        };

        let number = Self::next_order_number(&mut book);
        self.acknowledge(request_id, number);

        let order = book.working.remove(position);
        let remaining = order.remaining();
        if order.spec.side == Side::Sell {
            if let Some(entry) = book.holdings.get_mut(&order.spec.code) {
                entry.available_quantity += remaining;
            }
        }
        self.report(&order, ExecutionKind::CancelAccepted, None, remaining);
        self.report(&order, ExecutionKind::CancelConfirmed, None, 0);
        info!(order_number = %order.number, cancelled = remaining, "Simulated order cancelled");
    }

    fn ensure_account(&self, account: &str) -> Result<(), MarketError> {
        if !self.book().connected {
            return Err(MarketError::NotLoggedIn);
        }
        if !self.config.accounts.iter().any(|a| a == account) {
            return Err(MarketError::Gateway(format!("unknown account {}", account)));
        }
        Ok(())
    }
}

#[async_trait]
impl Gateway for SimulatedGateway {
    async fn connect(&self) -> Result<(), MarketError> {
        let code = self.config.login_result;
        self.book().connected = code == 0;
        self.sink.emit(GatewayEvent::Connected { code });
        Ok(())
    }

    async fn accounts(&self) -> Result<Vec<String>, MarketError> {
        if !self.book().connected {
            return Err(MarketError::NotLoggedIn);
        }
        Ok(self.config.accounts.clone())
    }

    async fn load_conditions(&self) -> Result<(), MarketError> {
        self.sink
            .emit(GatewayEvent::ConditionsLoaded(Ok(self.config.conditions.clone())));
        Ok(())
    }

    async fn search_condition(
        &self,
        screen: ScreenNo,
        name: &str,
        index: u32,
    ) -> Result<(), MarketError> {
        let known = self
            .config
            .conditions
            .iter()
            .any(|c| c.name == name && c.index == index);
        if !known {
            return Err(MarketError::Gateway(format!(
                "no saved condition {} ({})",
                name, index
            )));
        }
        debug!(screen = %screen, name, "Simulated condition search");
        self.sink.emit(GatewayEvent::ConditionMatched {
            name: name.to_string(),
            codes: self.config.condition_matches.clone(),
        });
        Ok(())
    }

    async fn query(
        &self,
        request_id: &RequestId,
        screen: ScreenNo,
        account: &str,
        query: TrQuery,
    ) -> Result<(), MarketError> {
        self.ensure_account(account)?;
        debug!(request_id = %request_id, screen = %screen, ?query, "Simulated TR query");
        let payload = {
            let book = self.book();
            match query {
                TrQuery::Deposit => TrPayload::Deposit(book.deposit),
                TrQuery::Balance => TrPayload::Balance(book.holdings.clone()),
            }
        };
        self.sink.emit(GatewayEvent::TrData {
            request_id: request_id.clone(),
            reply: TrReply::complete(payload),
        });
        Ok(())
    }

    async fn submit_order(
        &self,
        request_id: &RequestId,
        _screen: ScreenNo,
        account: &str,
        ticket: &OrderTicket,
    ) -> Result<(), MarketError> {
        self.ensure_account(account)?;
        match ticket {
            OrderTicket::New(spec) => self.submit_new(request_id, spec),
            OrderTicket::Cancel(spec) => self.submit_cancel(request_id, spec),
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        screen: ScreenNo,
        codes: &[String],
        channel: FeedChannel,
        replace: bool,
    ) -> Result<(), MarketError> {
        let mut book = self.book();
        let registered = book.subscriptions.entry(channel).or_default();
        if replace {
            registered.clear();
        }
        registered.extend(codes.iter().cloned());
        debug!(screen = %screen, channel = %channel, count = codes.len(), "Simulated registration");
        for code in codes {
            self.publish(&mut book, code);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn setup(config: SimulatedGatewayConfig) -> (SimulatedGateway, UnboundedReceiver<GatewayEvent>) {
        let (sink, rx) = event_channel();
        (SimulatedGateway::new(config, sink), rx)
    }

    fn drain(rx: &mut UnboundedReceiver<GatewayEvent>) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn executions(events: &[GatewayEvent]) -> Vec<ExecutionReport> {
        events
            .iter()
            .filter_map(|e| match e {
                GatewayEvent::Execution(report) => Some(report.clone()),
                _ => None,
            })
            .collect()
    }

    const ACCOUNT: &str = "8012345611";

    #[tokio::test]
    async fn test_login_result_is_reported() {
        let (gateway, mut rx) = setup(SimulatedGatewayConfig {
            login_result: -100,
            ..Default::default()
        });
        gateway.connect().await.unwrap();
        assert!(matches!(rx.try_recv(), Ok(GatewayEvent::Connected { code: -100 })));
        assert_eq!(gateway.accounts().await, Err(MarketError::NotLoggedIn));
    }

    #[tokio::test]
    async fn test_market_order_fills_in_chunks() {
        let (gateway, mut rx) = setup(SimulatedGatewayConfig {
            fill_chunks: 3,
            ..Default::default()
        });
        gateway.connect().await.unwrap();
        let order = OrderTicket::New(OrderSpec::market("005930", Side::Buy, 10));
        gateway
            .submit_order(&RequestId::from("R1"), ScreenNo::new(1), ACCOUNT, &order)
            .await
            .unwrap();

        let events = drain(&mut rx);
        let reports = executions(&events);
        assert_eq!(reports[0].kind, ExecutionKind::Accepted);
        let remaining: Vec<u64> = reports[1..].iter().map(|r| r.remaining_quantity).collect();
        assert_eq!(remaining, vec![7, 4, 0]);
        assert_eq!(reports.last().unwrap().filled_quantity, 10);

        let deposit = 10_000_000 - 70_000 * 10;
        assert_eq!(gateway.book().deposit, deposit);
        assert_eq!(gateway.book().holdings["005930"].held_quantity, 10);
    }

    #[tokio::test]
    async fn test_limit_order_rests_until_crossed() {
        let (gateway, mut rx) = setup(SimulatedGatewayConfig::default());
        gateway.connect().await.unwrap();
        let order = OrderTicket::New(OrderSpec::limit("005930", Side::Buy, 4, 69_000));
        gateway
            .submit_order(&RequestId::from("R1"), ScreenNo::new(1), ACCOUNT, &order)
            .await
            .unwrap();
        assert_eq!(executions(&drain(&mut rx)).len(), 1);

        gateway.set_price("005930", 68_900);
        let reports = executions(&drain(&mut rx));
        assert_eq!(reports.last().unwrap().remaining_quantity, 0);
        assert_eq!(reports.last().unwrap().fill_price, Some(69_000));
    }

    #[tokio::test]
    async fn test_cancel_resting_order() {
        let (gateway, mut rx) = setup(SimulatedGatewayConfig::default());
        gateway.connect().await.unwrap();
        let order = OrderTicket::New(OrderSpec::limit("005930", Side::Buy, 4, 60_000));
        gateway
            .submit_order(&RequestId::from("R1"), ScreenNo::new(1), ACCOUNT, &order)
            .await
            .unwrap();
        drain(&mut rx);

        let cancel = OrderTicket::Cancel(CancelSpec {
            side: CancelSide::Buy,
            code: "005930".to_string(),
            quantity: 4,
            original_order_number: OrderNumber::from("0000001"),
        });
        gateway
            .submit_order(&RequestId::from("R2"), ScreenNo::new(2), ACCOUNT, &cancel)
            .await
            .unwrap();
        let kinds: Vec<_> = executions(&drain(&mut rx)).iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![ExecutionKind::CancelAccepted, ExecutionKind::CancelConfirmed]
        );
    }

    #[tokio::test]
    async fn test_sell_without_holdings_is_rejected() {
        let (gateway, mut rx) = setup(SimulatedGatewayConfig::default());
        gateway.connect().await.unwrap();
        let order = OrderTicket::New(OrderSpec::market("005930", Side::Sell, 1));
        gateway
            .submit_order(&RequestId::from("R1"), ScreenNo::new(1), ACCOUNT, &order)
            .await
            .unwrap();
        let acked = drain(&mut rx).into_iter().find_map(|e| match e {
            GatewayEvent::TrData { reply, .. } => Some(reply.payload),
            _ => None,
        });
        assert_eq!(acked, Some(TrPayload::OrderNumber(OrderNumber::new(""))));
    }

    #[tokio::test]
    async fn test_order_value_overflow_is_rejected() {
        let (gateway, mut rx) = setup(SimulatedGatewayConfig::default());
        gateway.connect().await.unwrap();
        drain(&mut rx);
        let order = OrderTicket::New(OrderSpec::market("005930", Side::Buy, 200_000_000_000_000));
        gateway
            .submit_order(&RequestId::from("R1"), ScreenNo::new(1), ACCOUNT, &order)
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert!(executions(&events).is_empty());
        assert!(events.iter().any(|e| matches!(
            e,
            GatewayEvent::TrData { reply, .. }
                if reply.payload == TrPayload::OrderNumber(OrderNumber::new(""))
        )));
        assert_eq!(gateway.book().deposit, 10_000_000);
    }

    #[tokio::test]
    async fn test_subscribe_publishes_snapshot() {
        let (gateway, mut rx) = setup(SimulatedGatewayConfig::default());
        let codes = vec!["005930".to_string()];
        gateway
            .subscribe(ScreenNo::new(102), &codes, FeedChannel::Depth, true)
            .await
            .unwrap();
        match rx.try_recv() {
            Ok(GatewayEvent::Depth { code, snapshot }) => {
                assert_eq!(code, "005930");
                assert_eq!(snapshot.bids.len(), DEPTH_LEVELS);
                assert!(snapshot.best_ask().unwrap().price() > snapshot.best_bid().unwrap().price());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_tick_moves_subscribed_prices_only() {
        let (gateway, _rx) = setup(SimulatedGatewayConfig::default());
        gateway
            .book()
            .subscriptions
            .entry(FeedChannel::Price)
            .or_default()
            .insert("005930".to_string());
        for _ in 0..10 {
            gateway.tick();
        }
        assert_eq!(gateway.price_of("000660"), 70_000);
        let price = gateway.price_of("005930");
        assert_eq!(price % 100, 0);
    }
}

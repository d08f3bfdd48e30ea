use async_trait::async_trait;
use chrono::{Duration as TimeDelta, Utc};
use kbridge_core::*;
use kbridge_market::{Market, MarketConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ACCOUNT: &str = "8012345611";

/// Gateway that answers from a fixed script, or stays silent so the test can
/// inject callbacks itself.
struct ScriptedGateway {
    sink: EventSink,
    login_code: i32,
    deposit: i64,
    answer_queries: bool,
    answer_conditions: bool,
    next_order: AtomicU64,
    calls: Mutex<Vec<String>>,
}

impl ScriptedGateway {
    fn new(sink: EventSink) -> Self {
        Self {
            sink,
            login_code: 0,
            deposit: 1_000_000,
            answer_queries: true,
            answer_conditions: true,
            next_order: AtomicU64::new(1),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn connect(&self) -> Result<(), MarketError> {
        self.record("connect".to_string());
        self.sink.emit(GatewayEvent::Connected {
            code: self.login_code,
        });
        Ok(())
    }

    async fn accounts(&self) -> Result<Vec<String>, MarketError> {
        Ok(vec![ACCOUNT.to_string()])
    }

    async fn load_conditions(&self) -> Result<(), MarketError> {
        self.record("load_conditions".to_string());
        self.sink.emit(GatewayEvent::ConditionsLoaded(Ok(vec![
            Condition {
                index: 0,
                name: "golden".to_string(),
            },
            Condition {
                index: 1,
                name: "breakout".to_string(),
            },
        ])));
        Ok(())
    }

    async fn search_condition(
        &self,
        screen: ScreenNo,
        name: &str,
        index: u32,
    ) -> Result<(), MarketError> {
        self.record(format!("search_condition {} {} {}", screen, name, index));
        if self.answer_conditions {
            self.sink.emit(GatewayEvent::ConditionMatched {
                name: name.to_string(),
                codes: vec!["005930".to_string(), "000660".to_string()],
            });
        }
        Ok(())
    }

    async fn query(
        &self,
        request_id: &RequestId,
        _screen: ScreenNo,
        account: &str,
        query: TrQuery,
    ) -> Result<(), MarketError> {
        self.record(format!("query {} {} {:?}", request_id, account, query));
        if !self.answer_queries {
            return Ok(());
        }
        let payload = match query {
            TrQuery::Deposit => TrPayload::Deposit(self.deposit),
            TrQuery::Balance => {
                let mut holdings = Holdings::new();
                holdings.insert("005930".to_string(), entry("005930", 10));
                TrPayload::Balance(holdings)
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
        _account: &str,
        ticket: &OrderTicket,
    ) -> Result<(), MarketError> {
        self.record(format!("submit_order {} {}", request_id, ticket.code()));
        let number = self.next_order.fetch_add(1, Ordering::Relaxed);
        self.sink.emit(GatewayEvent::TrData {
            request_id: request_id.clone(),
            reply: TrReply::complete(TrPayload::OrderNumber(OrderNumber::new(format!(
                "{:07}",
                number
            )))),
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        screen: ScreenNo,
        codes: &[String],
        channel: FeedChannel,
        replace: bool,
    ) -> Result<(), MarketError> {
        self.record(format!(
            "subscribe {} {} {} {}",
            screen,
            channel,
            codes.join(";"),
            replace
        ));
        Ok(())
    }
}

fn entry(code: &str, held: u64) -> BalanceEntry {
    BalanceEntry {
        code: code.to_string(),
        name: "삼성전자".to_string(),
        held_quantity: held,
        available_quantity: held,
        average_cost: 70_000,
    }
}

fn quote(last: i64, age: TimeDelta) -> QuoteSnapshot {
    QuoteSnapshot {
        timestamp: Utc::now() - age,
        last,
        open: 69_000,
        high: 71_000,
        low: 68_500,
    }
}

fn execution(kind: ExecutionKind, filled: u64, remaining: u64) -> ExecutionReport {
    ExecutionReport {
        order_number: OrderNumber::from("0000001"),
        code: "005930".to_string(),
        side: Side::Buy,
        kind,
        order_quantity: 10,
        filled_quantity: filled,
        fill_price: (filled > 0).then_some(70_000),
        remaining_quantity: remaining,
    }
}

struct Harness {
    market: Arc<Market>,
    gateway: Arc<ScriptedGateway>,
    sink: EventSink,
}

fn harness_with(config: MarketConfig, tweak: impl FnOnce(&mut ScriptedGateway)) -> Harness {
    let (sink, events) = event_channel();
    let mut gateway = ScriptedGateway::new(sink.clone());
    tweak(&mut gateway);
    let gateway = Arc::new(gateway);
    let market = Arc::new(Market::new(gateway.clone(), events, config));
    Harness {
        market,
        gateway,
        sink,
    }
}

fn harness(tweak: impl FnOnce(&mut ScriptedGateway)) -> Harness {
    harness_with(MarketConfig::default(), tweak)
}

async fn wait_for_pending(market: &Market, count: usize) {
    while market.pending_requests() < count {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_login_selects_account() {
    let h = harness(|_| {});
    assert_eq!(h.market.account(), Err(MarketError::NotLoggedIn));
    assert_eq!(h.market.login().await.unwrap(), ACCOUNT);
    assert_eq!(h.market.account().unwrap(), ACCOUNT);
}

#[tokio::test]
async fn test_login_failure_is_auth_error() {
    let h = harness(|g| g.login_code = -100);
    assert_eq!(h.market.login().await, Err(MarketError::AuthError(-100)));
    assert_eq!(h.market.account(), Err(MarketError::NotLoggedIn));
}

#[tokio::test(start_paused = true)]
async fn test_login_retry_is_bounded() {
    let config = MarketConfig {
        login_attempts: 3,
        ..MarketConfig::default()
    };
    let h = harness_with(config, |g| g.login_code = -101);
    assert_eq!(
        h.market.login_with_retry().await,
        Err(MarketError::AuthError(-101))
    );
    let connects = h.gateway.calls().iter().filter(|c| *c == "connect").count();
    assert_eq!(connects, 3);
}

#[tokio::test]
async fn test_queries_require_login() {
    let h = harness(|_| {});
    assert_eq!(h.market.get_deposit().await, Err(MarketError::NotLoggedIn));
    assert!(h.gateway.calls().is_empty());
}

#[tokio::test]
async fn test_deposit_and_balance() {
    let h = harness(|_| {});
    h.market.login().await.unwrap();

    assert_eq!(h.market.get_deposit().await.unwrap(), 1_000_000);
    let balance = h.market.get_balance().await.unwrap();
    assert_eq!(balance["005930"].held_quantity, 10);
    assert_eq!(h.market.holdings()["005930"].held_quantity, 10);
    assert_eq!(h.market.pending_requests(), 0);
}

#[tokio::test]
async fn test_concurrent_queries_do_not_cross_talk() {
    let h = harness(|g| g.answer_queries = false);
    h.market.login().await.unwrap();

    let mut handles = Vec::new();
    for name in ["A", "B", "C"] {
        let market = h.market.clone();
        handles.push(tokio::spawn(async move {
            market.request_tr(RequestId::from(name), TrQuery::Deposit).await
        }));
    }
    wait_for_pending(&h.market, 3).await;

    for (name, amount) in [("C", 3), ("A", 1), ("B", 2)] {
        h.sink.emit(GatewayEvent::TrData {
            request_id: RequestId::from(name),
            reply: TrReply::complete(TrPayload::Deposit(amount)),
        });
    }
    for (handle, expected) in handles.into_iter().zip([1, 2, 3]) {
        let reply = handle.await.unwrap().unwrap();
        assert_eq!(reply.payload, TrPayload::Deposit(expected));
    }
}

#[tokio::test]
async fn test_unknown_callback_does_not_stall_others() {
    let h = harness(|g| g.answer_queries = false);
    h.market.login().await.unwrap();

    let market = h.market.clone();
    let call = tokio::spawn(async move {
        market.request_tr(RequestId::from("R1"), TrQuery::Deposit).await
    });
    wait_for_pending(&h.market, 1).await;

    h.sink.emit(GatewayEvent::TrData {
        request_id: RequestId::from("ghost"),
        reply: TrReply::complete(TrPayload::Deposit(-1)),
    });
    h.sink.emit(GatewayEvent::Message {
        request_id: RequestId::from("R1"),
        tr_code: "OPW00001".to_string(),
        text: "조회가 완료되었습니다".to_string(),
    });
    h.sink.emit(GatewayEvent::TrData {
        request_id: RequestId::from("R1"),
        reply: TrReply {
            payload: TrPayload::Deposit(500),
            continuation: CONTINUATION_MORE,
        },
    });

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.payload, TrPayload::Deposit(500));
    assert!(reply.has_more());
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_frees_slot() {
    let config = MarketConfig {
        request_timeout_ms: Some(500),
        ..MarketConfig::default()
    };
    let h = harness_with(config, |g| g.answer_queries = false);
    h.market.login().await.unwrap();

    let result = h.market.request_tr(RequestId::from("R1"), TrQuery::Deposit).await;
    assert_eq!(result, Err(MarketError::Timeout("R1".to_string())));
    assert_eq!(h.market.pending_requests(), 0);
}

#[tokio::test]
async fn test_condition_search_is_unique_per_name() {
    let h = harness(|g| g.answer_conditions = false);
    h.market.login().await.unwrap();

    let conditions = h.market.get_condition_list().await.unwrap();
    assert_eq!(conditions.len(), 2);

    let market = h.market.clone();
    let first = tokio::spawn(async move { market.get_matching_stocks("golden", 0).await });
    wait_for_pending(&h.market, 1).await;

    assert!(matches!(
        h.market.get_matching_stocks("golden", 0).await,
        Err(MarketError::DuplicateKey(_))
    ));

    h.sink.emit(GatewayEvent::ConditionMatched {
        name: "golden".to_string(),
        codes: vec!["035720".to_string()],
    });
    assert_eq!(first.await.unwrap().unwrap(), vec!["035720".to_string()]);
}

#[tokio::test]
async fn test_order_lifecycle() {
    let h = harness(|_| {});
    h.market.login().await.unwrap();
    let mut events = h.market.subscribe_events();

    let ack = h
        .market
        .request_order(&OrderSpec::market("005930", Side::Buy, 10))
        .await
        .unwrap();
    assert_eq!(ack.order_number, OrderNumber::from("0000001"));
    assert!(ack.request_id.as_str().starts_with("SendOrder-"));

    let market = h.market.clone();
    let number = ack.order_number.clone();
    let info = tokio::spawn(async move { market.get_order_info(&number).await });

    h.sink.emit(GatewayEvent::Execution(execution(ExecutionKind::Accepted, 0, 10)));
    h.sink.emit(GatewayEvent::Execution(execution(ExecutionKind::Filled, 4, 6)));
    h.sink.emit(GatewayEvent::Execution(execution(ExecutionKind::Filled, 10, 0)));

    let record = info.await.unwrap().unwrap();
    assert_eq!(record.status, OrderStatus::Filled);
    assert_eq!(record.filled_quantity, 10);

    match events.recv().await.unwrap() {
        PushEvent::OrderCompleted(done) => assert_eq!(done.order_number, ack.order_number),
        other => panic!("unexpected push {:?}", other),
    }
}

#[tokio::test]
async fn test_invalid_order_never_reaches_gateway() {
    let h = harness(|_| {});
    h.market.login().await.unwrap();

    let mut spec = OrderSpec::market("005930", Side::Buy, 10);
    spec.price = 70_000;
    assert!(matches!(
        h.market.request_order(&spec).await,
        Err(MarketError::InvalidOrder(_))
    ));
    assert!(!h.gateway.calls().iter().any(|c| c.starts_with("submit_order")));
}

#[tokio::test]
async fn test_cancel_goes_through_order_path() {
    let h = harness(|_| {});
    h.market.login().await.unwrap();

    let cancel = CancelSpec {
        side: CancelSide::Buy,
        code: "005930".to_string(),
        quantity: 10,
        original_order_number: OrderNumber::from("0000042"),
    };
    let ack = h.market.cancel_order(&cancel).await.unwrap();
    assert!(ack.request_id.as_str().starts_with("CancelOrder-"));
    assert!(h.gateway.calls().iter().any(|c| c.starts_with("submit_order")));
}

#[tokio::test]
async fn test_order_info_by_cancel_number_reports_original_order() {
    let h = harness(|_| {});
    h.market.login().await.unwrap();

    let order = h
        .market
        .request_order(&OrderSpec::limit("005930", Side::Buy, 10, 69_000))
        .await
        .unwrap();
    h.sink.emit(GatewayEvent::Execution(execution(ExecutionKind::Accepted, 0, 10)));

    let cancel = h
        .market
        .cancel_order(&CancelSpec {
            side: CancelSide::Buy,
            code: "005930".to_string(),
            quantity: 10,
            original_order_number: order.order_number.clone(),
        })
        .await
        .unwrap();
    assert_eq!(cancel.order_number, OrderNumber::from("0000002"));

    let market = h.market.clone();
    let number = cancel.order_number.clone();
    let info = tokio::spawn(async move { market.get_order_info(&number).await });
    h.sink.emit(GatewayEvent::Execution(execution(ExecutionKind::CancelAccepted, 0, 10)));
    h.sink.emit(GatewayEvent::Execution(execution(ExecutionKind::CancelConfirmed, 0, 0)));

    let record = tokio::time::timeout(Duration::from_secs(5), info)
        .await
        .expect("order info by cancel number never completed")
        .unwrap()
        .unwrap();
    assert_eq!(record.order_number, order.order_number);
    assert_eq!(record.status, OrderStatus::CancelConfirmed);
    assert_eq!(record.filled_quantity, 0);
}

#[tokio::test]
async fn test_price_feed_polls_until_first_push() {
    let h = harness(|_| {});
    h.market.login().await.unwrap();
    h.market
        .register_price_feed(&["005930".to_string()], true)
        .await
        .unwrap();
    assert_eq!(h.market.subscriptions(FeedChannel::Price), vec!["005930".to_string()]);

    let market = h.market.clone();
    let price = tokio::spawn(async move { market.get_price("005930").await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.sink.emit(GatewayEvent::Quote {
        code: "005930".to_string(),
        snapshot: quote(70_000, TimeDelta::zero()),
    });

    let cached = price.await.unwrap().unwrap();
    assert_eq!(cached.value.last, 70_000);
    assert!(!cached.is_stale());
}

#[tokio::test]
async fn test_replace_clears_previous_registrations() {
    let h = harness(|_| {});
    h.market.login().await.unwrap();
    let codes = |list: &[&str]| list.iter().map(|c| c.to_string()).collect::<Vec<_>>();

    h.market.register_depth_feed(&codes(&["005930"]), true).await.unwrap();
    h.market.register_depth_feed(&codes(&["000660"]), false).await.unwrap();
    assert_eq!(h.market.subscriptions(FeedChannel::Depth).len(), 2);

    h.market.register_depth_feed(&codes(&["035720"]), true).await.unwrap();
    assert_eq!(h.market.subscriptions(FeedChannel::Depth), codes(&["035720"]));
    assert!(h.market.subscriptions(FeedChannel::Price).is_empty());
}

#[tokio::test]
async fn test_stale_quote_still_returned() {
    let h = harness(|_| {});
    h.sink.emit(GatewayEvent::Quote {
        code: "005930".to_string(),
        snapshot: quote(69_500, TimeDelta::seconds(30)),
    });

    let cached = h.market.get_price("005930").await.unwrap();
    assert_eq!(cached.value.last, 69_500);
    assert!(cached.stale_by.unwrap() >= TimeDelta::seconds(30));
}

#[tokio::test(start_paused = true)]
async fn test_feed_poll_deadline() {
    let config = MarketConfig {
        feed_timeout_ms: Some(1_000),
        ..MarketConfig::default()
    };
    let h = harness_with(config, |_| {});
    assert!(matches!(
        h.market.get_depth("005930").await,
        Err(MarketError::Timeout(_))
    ));
}

#[tokio::test]
async fn test_balance_change_updates_holdings() {
    let h = harness(|_| {});
    let mut events = h.market.subscribe_events();

    h.sink.emit(GatewayEvent::BalanceChanged(entry("005930", 5)));
    assert!(matches!(events.recv().await.unwrap(), PushEvent::Balance(_)));
    assert_eq!(h.market.holdings()["005930"].held_quantity, 5);

    h.sink.emit(GatewayEvent::BalanceChanged(entry("005930", 0)));
    events.recv().await.unwrap();
    assert!(h.market.holdings().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_queries_are_rate_limited() {
    let h = harness(|_| {});
    h.market.login().await.unwrap();

    let started = tokio::time::Instant::now();
    for _ in 0..5 {
        h.market.get_deposit().await.unwrap();
    }
    assert!(started.elapsed() < Duration::from_secs(1));

    h.market.get_deposit().await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_closed_event_stream_fails_pending_calls() {
    let (sink, events) = event_channel();
    // Callbacks go nowhere, so the login stays pending.
    let (silent, _unused) = event_channel();
    let market = Arc::new(Market::new(
        Arc::new(ScriptedGateway::new(silent)),
        events,
        MarketConfig::default(),
    ));

    let caller = market.clone();
    let login = tokio::spawn(async move { caller.login().await });
    wait_for_pending(&market, 1).await;

    drop(sink);
    assert_eq!(login.await.unwrap(), Err(MarketError::ConnectionLost));
    assert_eq!(market.pending_requests(), 0);
}

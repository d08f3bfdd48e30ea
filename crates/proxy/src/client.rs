use kbridge_core::*;
use kbridge_market::{Cached, CorrelationStore, RealTimeCache};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::*;

/// Results are correlated by frame type and key, never by arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireKey {
    pub kind: FrameType,
    pub key: String,
}

impl fmt::Display for WireKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

struct RemoteShared {
    pending: CorrelationStore<WireKey, Value>,
    closed: AtomicBool,
    quotes: RealTimeCache<QuoteSnapshot>,
    depth: RealTimeCache<DepthSnapshot>,
    holdings: Mutex<Holdings>,
    events: broadcast::Sender<PushEvent>,
}

impl RemoteShared {
    fn handle(&self, frame: ServerMessage) {
        if let Some(err) = frame.as_error() {
            let failed = match frame.error_target() {
                Some(kind) => {
                    let key = WireKey {
                        kind,
                        key: frame.key.clone(),
                    };
                    usize::from(self.pending.fail(&key, err.clone()).is_ok())
                }
                None => self
                    .pending
                    .fail_matching(|pending| pending.key == frame.key, &err),
            };
            if failed == 0 {
                warn!(key = %frame.key, error = %err, "Server reported an error");
            }
            return;
        }
        if frame.kind.is_push() {
            match frame.to_push() {
                Ok(Some(event)) => self.apply_push(event),
                Ok(None) => {}
                Err(e) => warn!(kind = %frame.kind, key = %frame.key, error = %e, "Undecodable push frame"),
            }
            return;
        }
        let key = WireKey {
            kind: frame.kind,
            key: frame.key,
        };
        if let Err(err) = self.pending.resolve(&key, frame.value) {
            warn!(error = %err, "Dropping result with no pending call");
        }
    }

    fn apply_push(&self, event: PushEvent) {
        match &event {
            PushEvent::Quote { code, snapshot } => self.quotes.update(code, snapshot.clone()),
            PushEvent::Depth { code, snapshot } => self.depth.update(code, snapshot.clone()),
            PushEvent::Balance(entry) => {
                let mut holdings = self.holdings.lock().unwrap_or_else(PoisonError::into_inner);
                if entry.held_quantity == 0 {
                    holdings.remove(&entry.code);
                } else {
                    holdings.insert(entry.code.clone(), entry.clone());
                }
            }
            PushEvent::OrderCompleted(record) => {
                debug!(order_number = %record.order_number, "Order completion pushed");
            }
        }
        let _ = self.events.send(event);
    }
}

async fn read_loop(reader: OwnedReadHalf, shared: Arc<RemoteShared>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match decode_message(&line) {
                Ok(frame) => shared.handle(frame),
                Err(e) => warn!(error = %e, "Ignoring malformed frame from server"),
            },
            Ok(None) => {
                info!("Proxy closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "Read from proxy failed");
                break;
            }
        }
    }
    shared.closed.store(true, Ordering::SeqCst);
    shared.pending.fail_all(&MarketError::ConnectionLost);
}

/// The market facade over a proxy connection.
///
/// Mirrors [`kbridge_market::Market`]: each call sends one request line and
/// waits for the frame with the matching `(type, key)`. Push frames feed a
/// local real-time cache and a broadcast of [`PushEvent`]s. When the socket
/// closes every pending call fails with `ConnectionLost`.
pub struct RemoteMarket {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    shared: Arc<RemoteShared>,
    reader: JoinHandle<()>,
    request_timeout: Option<Duration>,
}

impl RemoteMarket {
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        request_timeout: Option<Duration>,
    ) -> Result<Self, MarketError> {
        let stream = TcpStream::connect(addr).await?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (events, _) = broadcast::channel(1024);
        let shared = Arc::new(RemoteShared {
            pending: CorrelationStore::new(),
            closed: AtomicBool::new(false),
            quotes: RealTimeCache::new("price", chrono::Duration::seconds(10)),
            depth: RealTimeCache::new("ask_bid", chrono::Duration::seconds(10)),
            holdings: Mutex::new(Holdings::new()),
            events,
        });
        let reader = tokio::spawn(read_loop(read_half, shared.clone()));
        info!(%peer, "Connected to proxy");
        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            shared,
            reader,
            request_timeout,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Send one call and wait for its result value.
    pub async fn call(&self, method: Method) -> Result<Value, MarketError> {
        let key = WireKey {
            kind: method.result_frame(),
            key: method.key(),
        };
        let pending = self.shared.pending.register(key)?;
        if self.is_closed() {
            return Err(MarketError::ConnectionLost);
        }
        let request = method
            .to_request()
            .map_err(|e| MarketError::Protocol(e.to_string()))?;
        let line = encode(&request).map_err(|e| MarketError::Protocol(e.to_string()))?;
        debug!(method = method.name(), key = %pending.key(), "Sending request");
        self.writer
            .lock()
            .await
            .write_all(line.as_bytes())
            .await
            .map_err(|_| MarketError::ConnectionLost)?;
        pending.wait(self.request_timeout).await
    }

    async fn call_as<T: DeserializeOwned>(&self, method: Method) -> Result<T, MarketError> {
        let value = self.call(method).await?;
        serde_json::from_value(value).map_err(|e| MarketError::Protocol(e.to_string()))
    }

    fn request_name() -> RequestId {
        RequestId::new(format!("R-{}", Uuid::new_v4().simple()))
    }

    pub async fn login(&self) -> Result<(), MarketError> {
        match self.call_as::<i32>(Method::Login).await? {
            0 => Ok(()),
            code => Err(MarketError::AuthError(code)),
        }
    }

    pub async fn load_account_number(&self) -> Result<String, MarketError> {
        self.call_as(Method::LoadAccountNumber).await
    }

    pub async fn get_condition_list(&self) -> Result<Vec<Condition>, MarketError> {
        self.call_as(Method::GetConditionNames).await
    }

    pub async fn get_matching_stocks(
        &self,
        name: &str,
        index: u32,
    ) -> Result<Vec<String>, MarketError> {
        self.call_as(Method::GetMatchingStocks {
            condition_name: name.to_string(),
            condition_index: index,
        })
        .await
    }

    async fn request_tr(&self, method: Method) -> Result<TrReply, MarketError> {
        let (payload, continuation): (TrPayload, u8) = self.call_as(method).await?;
        Ok(TrReply {
            payload,
            continuation,
        })
    }

    pub async fn get_deposit(&self) -> Result<i64, MarketError> {
        let reply = self
            .request_tr(Method::GetDeposit {
                request_name: Self::request_name(),
            })
            .await?;
        match reply.payload {
            TrPayload::Deposit(amount) => Ok(amount),
            other => Err(MarketError::Protocol(format!(
                "expected deposit payload, got {:?}",
                other
            ))),
        }
    }

    pub async fn get_balance(&self) -> Result<Holdings, MarketError> {
        let reply = self
            .request_tr(Method::GetBalance {
                request_name: Self::request_name(),
            })
            .await?;
        match reply.payload {
            TrPayload::Balance(holdings) => {
                *self.shared.holdings.lock().unwrap_or_else(PoisonError::into_inner) = holdings.clone();
                Ok(holdings)
            }
            other => Err(MarketError::Protocol(format!(
                "expected balance payload, got {:?}",
                other
            ))),
        }
    }

    fn order_ack(request_id: RequestId, reply: TrReply) -> Result<OrderAck, MarketError> {
        match reply.payload {
            TrPayload::OrderNumber(order_number) => Ok(OrderAck {
                request_id,
                order_number,
            }),
            other => Err(MarketError::Protocol(format!(
                "expected order number, got {:?}",
                other
            ))),
        }
    }

    pub async fn request_order(&self, spec: &OrderSpec) -> Result<OrderAck, MarketError> {
        spec.validate()?;
        let request_name = Self::request_name();
        let reply = self
            .request_tr(Method::SendOrder {
                order_dict: spec.clone(),
                request_name: request_name.clone(),
            })
            .await?;
        Self::order_ack(request_name, reply)
    }

    pub async fn cancel_order(&self, spec: &CancelSpec) -> Result<OrderAck, MarketError> {
        spec.validate()?;
        let request_name = Self::request_name();
        let reply = self
            .request_tr(Method::CancelOrder {
                order_dict: spec.clone(),
                request_name: request_name.clone(),
            })
            .await?;
        Self::order_ack(request_name, reply)
    }

    pub async fn get_order_info(&self, order_number: &OrderNumber) -> Result<OrderRecord, MarketError> {
        self.call_as(Method::GetOrderInfo {
            order_number: order_number.clone(),
        })
        .await
    }

    /// Returns the codes registered on the price channel afterwards.
    pub async fn register_price_feed(
        &self,
        codes: &[String],
        replace: bool,
    ) -> Result<Vec<String>, MarketError> {
        self.call_as(Method::RegisterPriceInfo {
            stock_code_list: codes.to_vec(),
            is_add: !replace,
        })
        .await
    }

    /// Returns the codes registered on the depth channel afterwards.
    pub async fn register_depth_feed(
        &self,
        codes: &[String],
        replace: bool,
    ) -> Result<Vec<String>, MarketError> {
        self.call_as(Method::RegisterAskBidInfo {
            stock_code_list: codes.to_vec(),
            is_add: !replace,
        })
        .await
    }

    /// Latest quote as held by the server.
    pub async fn get_price(&self, code: &str) -> Result<QuoteSnapshot, MarketError> {
        self.call_as(Method::GetPriceInfo {
            stock_code: code.to_string(),
        })
        .await
    }

    /// Latest order book as held by the server.
    pub async fn get_depth(&self, code: &str) -> Result<DepthSnapshot, MarketError> {
        self.call_as(Method::GetAskBidInfo {
            stock_code: code.to_string(),
        })
        .await
    }

    /// Latest pushed quote, without a round trip.
    pub fn cached_price(&self, code: &str) -> Result<Cached<QuoteSnapshot>, MarketError> {
        self.shared.quotes.get(code)
    }

    /// Latest pushed order book, without a round trip.
    pub fn cached_depth(&self, code: &str) -> Result<Cached<DepthSnapshot>, MarketError> {
        self.shared.depth.get(code)
    }

    pub fn holdings(&self) -> Holdings {
        self.shared
            .holdings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PushEvent> {
        self.shared.events.subscribe()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }
}

impl Drop for RemoteMarket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

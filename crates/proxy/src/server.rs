use kbridge_core::*;
use kbridge_market::Market;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::outbound::{OutboundQueue, OverflowPolicy};
use crate::protocol::*;

/// Configuration for the proxy listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on.
    pub bind: String,
    /// Lines buffered per connection before the overflow policy applies.
    pub outbound_capacity: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:53939".to_string(),
            outbound_capacity: 1024,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

/// Serves one control-plane client at a time over newline-delimited JSON.
///
/// Holds no trading state of its own: requests are translated into
/// [`Market`] calls, results and push events are translated back.
pub struct ProxyServer {
    market: Arc<Market>,
    config: ServerConfig,
    client_slot: Arc<Semaphore>,
}

impl ProxyServer {
    pub fn new(market: Arc<Market>, config: ServerConfig) -> Self {
        Self {
            market,
            config,
            client_slot: Arc::new(Semaphore::new(1)),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn serve(self) -> Result<(), MarketError> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        self.run(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn run(self, listener: TcpListener) -> Result<(), MarketError> {
        info!(addr = %listener.local_addr()?, "Proxy listening");
        let server = Arc::new(self);
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept connection");
                    continue;
                }
            };
            match server.client_slot.clone().try_acquire_owned() {
                Ok(permit) => {
                    let server = server.clone();
                    tokio::spawn(async move {
                        info!(%peer, "Client connected");
                        server.handle_connection(stream).await;
                        info!(%peer, "Client disconnected");
                        drop(permit);
                    });
                }
                Err(_) => {
                    warn!(%peer, "Rejecting connection, a client is already attached");
                    tokio::spawn(reject(stream, peer));
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let queue = Arc::new(OutboundQueue::new(
            self.config.outbound_capacity,
            self.config.overflow_policy,
        ));
        let mut writer = tokio::spawn(write_loop(write_half, queue.clone()));
        let mut writer_done = false;
        let mut lines = BufReader::new(read_half).lines();
        let mut pushes = self.market.subscribe_events();
        let mut calls = JoinSet::new();

        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match decode_request(&line).and_then(Method::parse) {
                            Ok(method) => {
                                debug!(method = method.name(), key = %method.key(), "Request received");
                                let market = self.market.clone();
                                let queue = queue.clone();
                                calls.spawn(async move {
                                    let reply = execute(&market, method).await;
                                    enqueue(&queue, &reply);
                                });
                            }
                            Err(err) => {
                                warn!(error = %err, "Protocol error, closing connection");
                                enqueue(&queue, &ServerMessage::error(CONNECTION_KEY, &err.into()));
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Read failed");
                        break;
                    }
                },
                push = pushes.recv() => match push {
                    Ok(event) => match ServerMessage::from_push(&event) {
                        Ok(frame) => enqueue(&queue, &frame),
                        Err(e) => warn!(error = %e, "Failed to encode push event"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Client fell behind the push stream");
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(joined) = calls.join_next() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Request handler panicked");
                        }
                    }
                }
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
            }
        }

        // Dropping in-flight calls releases their pending slots.
        calls.abort_all();
        queue.close();
        if !writer_done {
            let _ = writer.await;
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, queue: Arc<OutboundQueue>) {
    while let Some(line) = queue.pop().await {
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            debug!(error = %e, "Write failed, stopping writer");
            queue.close();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

fn enqueue(queue: &OutboundQueue, frame: &ServerMessage) {
    match encode(frame) {
        Ok(line) => {
            if let Err(e) = queue.push(line) {
                debug!(error = %e, key = %frame.key, "Frame not queued");
            }
        }
        Err(e) => warn!(error = %e, "Failed to encode frame"),
    }
}

async fn reject(mut stream: TcpStream, peer: SocketAddr) {
    let err = MarketError::UnsupportedOperation("another client is already connected".to_string());
    if let Ok(line) = encode(&ServerMessage::error(CONNECTION_KEY, &err)) {
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            debug!(%peer, error = %e, "Failed to notify rejected client");
        }
    }
    let _ = stream.shutdown().await;
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, MarketError> {
    serde_json::to_value(value).map_err(|e| MarketError::Protocol(e.to_string()))
}

fn tr_value(reply: &TrReply) -> Result<Value, MarketError> {
    to_value(&(&reply.payload, reply.continuation))
}

/// Run one decoded call against the facade and build its reply frame.
pub async fn execute(market: &Market, method: Method) -> ServerMessage {
    let kind = method.result_frame();
    let key = method.key();
    let result = match method {
        Method::Login => match market.login().await {
            Ok(_) => Ok(json!(0)),
            Err(MarketError::AuthError(code)) => Ok(json!(code)),
            Err(e) => Err(e),
        },
        Method::LoadAccountNumber => market.load_account().await.map(Value::String),
        Method::GetConditionNames => market
            .get_condition_list()
            .await
            .and_then(|conditions| to_value(&conditions)),
        Method::GetMatchingStocks {
            condition_name,
            condition_index,
        } => market
            .get_matching_stocks(&condition_name, condition_index)
            .await
            .and_then(|codes| to_value(&codes)),
        Method::GetDeposit { request_name } => market
            .request_tr(request_name, TrQuery::Deposit)
            .await
            .and_then(|reply| tr_value(&reply)),
        Method::GetBalance { request_name } => market
            .request_tr(request_name, TrQuery::Balance)
            .await
            .and_then(|reply| tr_value(&reply)),
        Method::SendOrder {
            order_dict,
            request_name,
        } => market
            .request_order_as(request_name, &order_dict)
            .await
            .and_then(|ack| to_value(&(ack.order_number, CONTINUATION_NONE))),
        Method::CancelOrder {
            order_dict,
            request_name,
        } => market
            .cancel_order_as(request_name, &order_dict)
            .await
            .and_then(|ack| to_value(&(ack.order_number, CONTINUATION_NONE))),
        Method::GetOrderInfo { order_number } => market
            .get_order_info(&order_number)
            .await
            .and_then(|record| to_value(&record)),
        Method::RegisterPriceInfo {
            stock_code_list,
            is_add,
        } => market
            .register_price_feed(&stock_code_list, !is_add)
            .await
            .and_then(|_| to_value(&market.subscriptions(FeedChannel::Price))),
        Method::RegisterAskBidInfo {
            stock_code_list,
            is_add,
        } => market
            .register_depth_feed(&stock_code_list, !is_add)
            .await
            .and_then(|_| to_value(&market.subscriptions(FeedChannel::Depth))),
        Method::GetPriceInfo { stock_code } => market
            .get_price(&stock_code)
            .await
            .and_then(|cached| to_value(&cached.value)),
        Method::GetAskBidInfo { stock_code } => market
            .get_depth(&stock_code)
            .await
            .and_then(|cached| to_value(&cached.value)),
    };
    match result {
        Ok(value) => ServerMessage::new(kind, key, value),
        Err(err) => {
            debug!(key = %key, error = %err, "Call failed");
            ServerMessage::call_error(kind, key, &err)
        }
    }
}

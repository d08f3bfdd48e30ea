//! Newline-delimited JSON frames exchanged between the proxy and its client.
//!
//! Client to server: `{"method": "...", "kwargs": {...}}`.
//! Server to client: `{"type": "...", "key": "...", "value": ...}`, where
//! `(type, key)` identifies the call a result answers or the instrument /
//! order a push concerns.

use kbridge_core::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Key used for frames that do not belong to a particular call.
pub const CONNECTION_KEY: &str = "";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A frame that could not be understood. Fatal for the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(String),
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },
}

impl From<ProtocolError> for MarketError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::UnknownMethod(name) => MarketError::UnsupportedOperation(name),
            other => MarketError::Protocol(other.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Frames
// ---------------------------------------------------------------------------

/// One request line as sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub method: String,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Discriminates results from pushes on the server-to-client stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    LoginResult,
    Account,
    TrResult,
    ConditionList,
    ConditionResult,
    OrderInfo,
    PriceInfo,
    AskBidInfo,
    Registered,
    PriceChange,
    AskBidChange,
    BalanceChange,
    OrderCompleted,
    Error,
}

impl FrameType {
    /// Whether frames of this type are unsolicited.
    pub fn is_push(&self) -> bool {
        matches!(
            self,
            FrameType::PriceChange
                | FrameType::AskBidChange
                | FrameType::BalanceChange
                | FrameType::OrderCompleted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameType::LoginResult => "login_result",
            FrameType::Account => "account",
            FrameType::TrResult => "tr_result",
            FrameType::ConditionList => "condition_list",
            FrameType::ConditionResult => "condition_result",
            FrameType::OrderInfo => "order_info",
            FrameType::PriceInfo => "price_info",
            FrameType::AskBidInfo => "ask_bid_info",
            FrameType::Registered => "registered",
            FrameType::PriceChange => "price_change",
            FrameType::AskBidChange => "ask_bid_change",
            FrameType::BalanceChange => "balance_change",
            FrameType::OrderCompleted => "order_completed",
            FrameType::Error => "error",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type")]
    pub kind: FrameType,
    pub key: String,
    pub value: Value,
}

impl ServerMessage {
    pub fn new(kind: FrameType, key: impl Into<String>, value: Value) -> Self {
        Self {
            kind,
            key: key.into(),
            value,
        }
    }

    /// Connection-level error frame, not tied to a pending call.
    pub fn error(key: impl Into<String>, err: &MarketError) -> Self {
        Self::new(FrameType::Error, key, error_value(err, None))
    }

    /// Error frame answering the call whose result would have been a
    /// `target` frame with the same key.
    pub fn call_error(target: FrameType, key: impl Into<String>, err: &MarketError) -> Self {
        Self::new(FrameType::Error, key, error_value(err, Some(target)))
    }

    /// The error carried by an `error` frame.
    pub fn as_error(&self) -> Option<MarketError> {
        if self.kind != FrameType::Error {
            return None;
        }
        Some(
            serde_json::from_value(self.value.clone()).unwrap_or_else(|_| {
                let message = self.value.get("message").and_then(Value::as_str).unwrap_or("");
                MarketError::Protocol(message.to_string())
            }),
        )
    }

    /// Result frame type of the call an `error` frame answers, when the
    /// server named it.
    pub fn error_target(&self) -> Option<FrameType> {
        if self.kind != FrameType::Error {
            return None;
        }
        self.value
            .get("for")
            .and_then(|target| serde_json::from_value(target.clone()).ok())
    }

    pub fn from_push(event: &PushEvent) -> Result<Self, serde_json::Error> {
        Ok(match event {
            PushEvent::Quote { code, snapshot } => {
                Self::new(FrameType::PriceChange, code.clone(), serde_json::to_value(snapshot)?)
            }
            PushEvent::Depth { code, snapshot } => {
                Self::new(FrameType::AskBidChange, code.clone(), serde_json::to_value(snapshot)?)
            }
            PushEvent::Balance(entry) => {
                Self::new(FrameType::BalanceChange, entry.code.clone(), serde_json::to_value(entry)?)
            }
            PushEvent::OrderCompleted(record) => Self::new(
                FrameType::OrderCompleted,
                record.order_number.to_string(),
                serde_json::to_value(record)?,
            ),
        })
    }

    /// Decode a push frame back into the event it carries. `None` for
    /// result frames.
    pub fn to_push(&self) -> Result<Option<PushEvent>, serde_json::Error> {
        let value = self.value.clone();
        Ok(Some(match self.kind {
            FrameType::PriceChange => PushEvent::Quote {
                code: self.key.clone(),
                snapshot: serde_json::from_value(value)?,
            },
            FrameType::AskBidChange => PushEvent::Depth {
                code: self.key.clone(),
                snapshot: serde_json::from_value(value)?,
            },
            FrameType::BalanceChange => PushEvent::Balance(serde_json::from_value(value)?),
            FrameType::OrderCompleted => PushEvent::OrderCompleted(serde_json::from_value(value)?),
            _ => return Ok(None),
        }))
    }
}

fn error_value(err: &MarketError, target: Option<FrameType>) -> Value {
    let mut value = serde_json::to_value(err).unwrap_or_else(|_| json!({ "kind": err.kind() }));
    if let Value::Object(map) = &mut value {
        map.insert("message".to_string(), Value::String(err.to_string()));
        if let Some(target) = target {
            map.insert("for".to_string(), Value::String(target.as_str().to_string()));
        }
    }
    value
}

/// Serialize a frame as one line, newline included.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_request(line: &str) -> Result<ClientRequest, ProtocolError> {
    serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

pub fn decode_message(line: &str) -> Result<ServerMessage, ProtocolError> {
    serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

// ---------------------------------------------------------------------------
// Method table
// ---------------------------------------------------------------------------

/// A decoded, typed call.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    Login,
    LoadAccountNumber,
    GetConditionNames,
    GetMatchingStocks {
        condition_name: String,
        condition_index: u32,
    },
    GetDeposit {
        request_name: RequestId,
    },
    GetBalance {
        request_name: RequestId,
    },
    SendOrder {
        order_dict: OrderSpec,
        request_name: RequestId,
    },
    CancelOrder {
        order_dict: CancelSpec,
        request_name: RequestId,
    },
    GetOrderInfo {
        order_number: OrderNumber,
    },
    RegisterPriceInfo {
        stock_code_list: Vec<String>,
        is_add: bool,
    },
    RegisterAskBidInfo {
        stock_code_list: Vec<String>,
        is_add: bool,
    },
    GetPriceInfo {
        stock_code: String,
    },
    GetAskBidInfo {
        stock_code: String,
    },
}

#[derive(Deserialize)]
struct ConditionArgs {
    condition_name: String,
    condition_index: u32,
}

#[derive(Deserialize)]
struct RequestArgs {
    request_name: RequestId,
}

#[derive(Deserialize)]
struct OrderArgs<T> {
    order_dict: T,
    request_name: RequestId,
}

#[derive(Deserialize)]
struct OrderNumberArgs {
    order_number: OrderNumber,
}

#[derive(Deserialize)]
struct RegisterArgs {
    stock_code_list: Vec<String>,
    #[serde(default)]
    is_add: bool,
}

#[derive(Deserialize)]
struct CodeArgs {
    stock_code: String,
}

fn args<T: DeserializeOwned>(method: &str, kwargs: Map<String, Value>) -> Result<T, ProtocolError> {
    serde_json::from_value(Value::Object(kwargs)).map_err(|e| ProtocolError::InvalidArguments {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

impl Method {
    /// Resolve a request against the method table.
    pub fn parse(request: ClientRequest) -> Result<Self, ProtocolError> {
        let ClientRequest { method, kwargs } = request;
        let name = method.as_str();
        Ok(match name {
            "login" => Method::Login,
            "load_account_number" => Method::LoadAccountNumber,
            "get_condition_names" => Method::GetConditionNames,
            "get_matching_stocks" => {
                let a: ConditionArgs = args(name, kwargs)?;
                Method::GetMatchingStocks {
                    condition_name: a.condition_name,
                    condition_index: a.condition_index,
                }
            }
            "get_deposit" => Method::GetDeposit {
                request_name: args::<RequestArgs>(name, kwargs)?.request_name,
            },
            "get_balance" => Method::GetBalance {
                request_name: args::<RequestArgs>(name, kwargs)?.request_name,
            },
            "send_order" => {
                let a: OrderArgs<OrderSpec> = args(name, kwargs)?;
                Method::SendOrder {
                    order_dict: a.order_dict,
                    request_name: a.request_name,
                }
            }
            "cancel_order" => {
                let a: OrderArgs<CancelSpec> = args(name, kwargs)?;
                Method::CancelOrder {
                    order_dict: a.order_dict,
                    request_name: a.request_name,
                }
            }
            "get_order_info" => Method::GetOrderInfo {
                order_number: args::<OrderNumberArgs>(name, kwargs)?.order_number,
            },
            "register_price_info" => {
                let a: RegisterArgs = args(name, kwargs)?;
                Method::RegisterPriceInfo {
                    stock_code_list: a.stock_code_list,
                    is_add: a.is_add,
                }
            }
            "register_ask_bid_info" => {
                let a: RegisterArgs = args(name, kwargs)?;
                Method::RegisterAskBidInfo {
                    stock_code_list: a.stock_code_list,
                    is_add: a.is_add,
                }
            }
            "get_price_info" => Method::GetPriceInfo {
                stock_code: args::<CodeArgs>(name, kwargs)?.stock_code,
            },
            "get_ask_bid_info" => Method::GetAskBidInfo {
                stock_code: args::<CodeArgs>(name, kwargs)?.stock_code,
            },
            other => return Err(ProtocolError::UnknownMethod(other.to_string())),
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Login => "login",
            Method::LoadAccountNumber => "load_account_number",
            Method::GetConditionNames => "get_condition_names",
            Method::GetMatchingStocks { .. } => "get_matching_stocks",
            Method::GetDeposit { .. } => "get_deposit",
            Method::GetBalance { .. } => "get_balance",
            Method::SendOrder { .. } => "send_order",
            Method::CancelOrder { .. } => "cancel_order",
            Method::GetOrderInfo { .. } => "get_order_info",
            Method::RegisterPriceInfo { .. } => "register_price_info",
            Method::RegisterAskBidInfo { .. } => "register_ask_bid_info",
            Method::GetPriceInfo { .. } => "get_price_info",
            Method::GetAskBidInfo { .. } => "get_ask_bid_info",
        }
    }

    /// Frame type of the successful result.
    pub fn result_frame(&self) -> FrameType {
        match self {
            Method::Login => FrameType::LoginResult,
            Method::LoadAccountNumber => FrameType::Account,
            Method::GetConditionNames => FrameType::ConditionList,
            Method::GetMatchingStocks { .. } => FrameType::ConditionResult,
            Method::GetDeposit { .. }
            | Method::GetBalance { .. }
            | Method::SendOrder { .. }
            | Method::CancelOrder { .. } => FrameType::TrResult,
            Method::GetOrderInfo { .. } => FrameType::OrderInfo,
            Method::RegisterPriceInfo { .. } | Method::RegisterAskBidInfo { .. } => {
                FrameType::Registered
            }
            Method::GetPriceInfo { .. } => FrameType::PriceInfo,
            Method::GetAskBidInfo { .. } => FrameType::AskBidInfo,
        }
    }

    /// Key the result is sent under.
    pub fn key(&self) -> String {
        match self {
            Method::Login => "login".to_string(),
            Method::LoadAccountNumber => "account".to_string(),
            Method::GetConditionNames => "conditions".to_string(),
            Method::GetMatchingStocks { condition_name, .. } => condition_name.clone(),
            Method::GetDeposit { request_name }
            | Method::GetBalance { request_name }
            | Method::SendOrder { request_name, .. }
            | Method::CancelOrder { request_name, .. } => request_name.to_string(),
            Method::GetOrderInfo { order_number } => order_number.to_string(),
            Method::RegisterPriceInfo { .. } => FeedChannel::Price.to_string(),
            Method::RegisterAskBidInfo { .. } => FeedChannel::Depth.to_string(),
            Method::GetPriceInfo { stock_code } | Method::GetAskBidInfo { stock_code } => {
                stock_code.clone()
            }
        }
    }

    /// The request line that invokes this method.
    pub fn to_request(&self) -> Result<ClientRequest, serde_json::Error> {
        let kwargs = match self {
            Method::Login | Method::LoadAccountNumber | Method::GetConditionNames => json!({}),
            Method::GetMatchingStocks {
                condition_name,
                condition_index,
            } => json!({ "condition_name": condition_name, "condition_index": condition_index }),
            Method::GetDeposit { request_name } | Method::GetBalance { request_name } => {
                json!({ "request_name": request_name })
            }
            Method::SendOrder {
                order_dict,
                request_name,
            } => json!({ "order_dict": serde_json::to_value(order_dict)?, "request_name": request_name }),
            Method::CancelOrder {
                order_dict,
                request_name,
            } => json!({ "order_dict": serde_json::to_value(order_dict)?, "request_name": request_name }),
            Method::GetOrderInfo { order_number } => json!({ "order_number": order_number }),
            Method::RegisterPriceInfo {
                stock_code_list,
                is_add,
            }
            | Method::RegisterAskBidInfo {
                stock_code_list,
                is_add,
            } => json!({ "stock_code_list": stock_code_list, "is_add": is_add }),
            Method::GetPriceInfo { stock_code } | Method::GetAskBidInfo { stock_code } => {
                json!({ "stock_code": stock_code })
            }
        };
        let kwargs = match kwargs {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Ok(ClientRequest {
            method: self.name().to_string(),
            kwargs,
        })
    }
}

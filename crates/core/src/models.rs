use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::traits::MarketError;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Caller-generated correlation key for a single query or order submission.
///
/// Must not be reused while a request carrying it is still unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Broker-assigned order number, known only once the submission is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn new(number: impl Into<String>) -> Self {
        Self(number.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderNumber {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Broker channel identifier used to multiplex queries and subscriptions.
/// Rendered as four zero-padded digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScreenNo(u16);

impl ScreenNo {
    pub const fn new(number: u16) -> Self {
        Self(number)
    }

    pub fn value(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ScreenNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "매수")]
    Buy,
    #[serde(rename = "매도")]
    Sell,
}

/// Side tag used on cancel requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelSide {
    #[serde(rename = "매수취소")]
    Buy,
    #[serde(rename = "매도취소")]
    Sell,
}

impl CancelSide {
    pub fn side(&self) -> Side {
        match self {
            CancelSide::Buy => Side::Buy,
            CancelSide::Sell => Side::Sell,
        }
    }
}

/// A new order as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    #[serde(rename = "구분")]
    pub side: Side,
    #[serde(rename = "주식코드")]
    pub code: String,
    #[serde(rename = "수량")]
    pub quantity: u64,
    /// Limit price; must be zero for market orders.
    #[serde(rename = "가격")]
    pub price: i64,
    #[serde(rename = "시장가")]
    pub market: bool,
}

impl OrderSpec {
    /// Create a market order.
    pub fn market(code: &str, side: Side, quantity: u64) -> Self {
        Self {
            side,
            code: code.to_string(),
            quantity,
            price: 0,
            market: true,
        }
    }

    /// Create a limit order.
    pub fn limit(code: &str, side: Side, quantity: u64, price: i64) -> Self {
        Self {
            side,
            code: code.to_string(),
            quantity,
            price,
            market: false,
        }
    }

    pub fn validate(&self) -> Result<(), MarketError> {
        if self.code.trim().is_empty() {
            return Err(MarketError::InvalidOrder("instrument code is empty".to_string()));
        }
        if self.quantity == 0 {
            return Err(MarketError::InvalidOrder("quantity must be positive".to_string()));
        }
        if self.market && self.price != 0 {
            return Err(MarketError::InvalidOrder(format!(
                "market order must carry price 0, got {}",
                self.price
            )));
        }
        if !self.market && self.price <= 0 {
            return Err(MarketError::InvalidOrder(format!(
                "limit order needs a positive price, got {}",
                self.price
            )));
        }
        let in_range = if self.market {
            i64::try_from(self.quantity).is_ok()
        } else {
            self.notional(self.price).is_some()
        };
        if !in_range {
            return Err(MarketError::InvalidOrder(format!(
                "order value out of range: {} x {}",
                self.quantity, self.price
            )));
        }
        Ok(())
    }

    /// `quantity * price` in KRW, `None` when it does not fit in an `i64`.
    pub fn notional(&self, price: i64) -> Option<i64> {
        i64::try_from(self.quantity)
            .ok()
            .and_then(|quantity| price.checked_mul(quantity))
    }
}

/// Cancellation of a previously accepted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSpec {
    #[serde(rename = "구분")]
    pub side: CancelSide,
    #[serde(rename = "주식코드")]
    pub code: String,
    #[serde(rename = "수량")]
    pub quantity: u64,
    #[serde(rename = "원주문번호")]
    pub original_order_number: OrderNumber,
}

impl CancelSpec {
    pub fn validate(&self) -> Result<(), MarketError> {
        if self.original_order_number.as_str().trim().is_empty() {
            return Err(MarketError::InvalidOrder(
                "cancel needs the original order number".to_string(),
            ));
        }
        if self.quantity == 0 {
            return Err(MarketError::InvalidOrder("quantity must be positive".to_string()));
        }
        Ok(())
    }
}

/// What the gateway is asked to submit on the order path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderTicket {
    New(OrderSpec),
    Cancel(CancelSpec),
}

impl OrderTicket {
    pub fn code(&self) -> &str {
        match self {
            OrderTicket::New(spec) => &spec.code,
            OrderTicket::Cancel(spec) => &spec.code,
        }
    }
}

/// Result of a successful order submission: the two halves of the
/// request-name to order-number correlation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderAck {
    pub request_id: RequestId,
    pub order_number: OrderNumber,
}

/// The lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Submitted,
    PartiallyFilled,
    Filled,
    CancelAccepted,
    CancelConfirmed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::CancelConfirmed)
    }
}

/// Fill/cancel record built up from execution reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_number: OrderNumber,
    pub code: String,
    pub side: Side,
    pub requested_quantity: u64,
    pub filled_quantity: u64,
    /// Price of the most recent fill.
    pub fill_price: Option<i64>,
    pub remaining_quantity: u64,
    pub status: OrderStatus,
    pub updated_at: DateTime<Utc>,
}

/// Kind of execution notification received from the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Accepted,
    Filled,
    CancelAccepted,
    CancelConfirmed,
}

/// Fill or acknowledgement notification for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub order_number: OrderNumber,
    pub code: String,
    pub side: Side,
    pub kind: ExecutionKind,
    pub order_quantity: u64,
    /// Cumulative filled quantity.
    pub filled_quantity: u64,
    pub fill_price: Option<i64>,
    pub remaining_quantity: u64,
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// One held instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceEntry {
    #[serde(rename = "종목코드")]
    pub code: String,
    #[serde(rename = "종목명")]
    pub name: String,
    #[serde(rename = "보유수량")]
    pub held_quantity: u64,
    #[serde(rename = "주문가능수량")]
    pub available_quantity: u64,
    #[serde(rename = "매입단가")]
    pub average_cost: i64,
}

/// Holdings keyed by instrument code.
pub type Holdings = BTreeMap<String, BalanceEntry>;

/// A saved broker-side screening expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub index: u32,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Named query types issued on the TR path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrQuery {
    /// Orderable cash.
    Deposit,
    /// Held instruments.
    Balance,
}

/// Data carried by a TR-data callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrPayload {
    Deposit(i64),
    Balance(Holdings),
    OrderNumber(OrderNumber),
}

/// Continuation flag value meaning no further pages exist.
pub const CONTINUATION_NONE: u8 = 0;
/// Continuation flag value meaning another page can be requested.
pub const CONTINUATION_MORE: u8 = 2;

/// A TR response together with the broker's continuation flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrReply {
    pub payload: TrPayload,
    pub continuation: u8,
}

impl TrReply {
    pub fn complete(payload: TrPayload) -> Self {
        Self {
            payload,
            continuation: CONTINUATION_NONE,
        }
    }

    pub fn has_more(&self) -> bool {
        self.continuation == CONTINUATION_MORE
    }
}

// ---------------------------------------------------------------------------
// Market Data
// ---------------------------------------------------------------------------

/// Number of price levels per side in a depth snapshot.
pub const DEPTH_LEVELS: usize = 10;

/// Real-time feed channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedChannel {
    Price,
    Depth,
}

impl fmt::Display for FeedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeedChannel::Price => f.write_str("price"),
            FeedChannel::Depth => f.write_str("ask_bid"),
        }
    }
}

/// Latest trade-derived quote for one instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    #[serde(rename = "체결시간")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "현재가")]
    pub last: i64,
    #[serde(rename = "시가")]
    pub open: i64,
    #[serde(rename = "고가")]
    pub high: i64,
    #[serde(rename = "저가")]
    pub low: i64,
}

/// One (price, quantity) level of the book. Serialized as a two-element array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthLevel(pub i64, pub u64);

impl DepthLevel {
    pub fn price(&self) -> i64 {
        self.0
    }

    pub fn quantity(&self) -> u64 {
        self.1
    }
}

/// Latest order book for one instrument, levels ordered best to worst.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    #[serde(rename = "호가시간")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "매수호가정보")]
    pub bids: Vec<DepthLevel>,
    #[serde(rename = "매도호가정보")]
    pub asks: Vec<DepthLevel>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<DepthLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<DepthLevel> {
        self.asks.first().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_market_order_requires_zero_price() {
        let mut spec = OrderSpec::market("005930", Side::Buy, 10);
        assert!(spec.validate().is_ok());

        spec.price = 70_000;
        assert!(matches!(spec.validate(), Err(MarketError::InvalidOrder(_))));
    }

    #[test]
    fn test_limit_order_validation() {
        assert!(OrderSpec::limit("005930", Side::Sell, 1, 70_000).validate().is_ok());
        assert!(OrderSpec::limit("005930", Side::Sell, 0, 70_000).validate().is_err());
        assert!(OrderSpec::limit("", Side::Sell, 1, 70_000).validate().is_err());
        assert!(OrderSpec::limit("005930", Side::Sell, 1, 0).validate().is_err());
    }

    #[test]
    fn test_order_value_must_fit() {
        let huge = OrderSpec::limit("005930", Side::Buy, 200_000_000_000_000, 70_000);
        assert!(matches!(huge.validate(), Err(MarketError::InvalidOrder(_))));
        assert_eq!(huge.notional(70_000), None);

        let beyond_i64 = OrderSpec::market("005930", Side::Buy, u64::MAX);
        assert!(matches!(beyond_i64.validate(), Err(MarketError::InvalidOrder(_))));

        // Market orders are priced by the broker, so only the quantity is checked here.
        assert!(OrderSpec::market("005930", Side::Buy, 200_000_000_000_000).validate().is_ok());
        assert_eq!(OrderSpec::limit("005930", Side::Buy, 3, 70_000).notional(70_000), Some(210_000));
    }

    #[test]
    fn test_order_spec_wire_shape() {
        let json = serde_json::json!({
            "구분": "매수",
            "주식코드": "005930",
            "수량": 3,
            "가격": 0,
            "시장가": true
        });
        let spec: OrderSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec, OrderSpec::market("005930", Side::Buy, 3));
    }

    #[test]
    fn test_screen_no_is_zero_padded() {
        assert_eq!(ScreenNo::new(7).to_string(), "0007");
        assert_eq!(ScreenNo::new(100).to_string(), "0100");
    }

    #[test]
    fn test_depth_level_serializes_as_pair() {
        let level = DepthLevel(70_000, 120);
        assert_eq!(serde_json::to_value(level).unwrap(), serde_json::json!([70000, 120]));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::CancelConfirmed.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
        assert!(!OrderStatus::CancelAccepted.is_terminal());
    }
}

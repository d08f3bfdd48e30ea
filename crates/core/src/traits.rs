use crate::models::*;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors surfaced by the market facade, the gateway and the proxy.
///
/// Serializes as `{"kind": <variant>, "detail": <payload>}` so an error
/// crosses the wire with its payload intact.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum MarketError {
    #[error("Login failed with result code {0}")]
    AuthError(i32),
    #[error("Not logged in")]
    NotLoggedIn,
    #[error("Correlation key already pending: {0}")]
    DuplicateKey(String),
    #[error("No pending request for key: {0}")]
    UnknownKey(String),
    #[error("Invalid order: {0}")]
    InvalidOrder(String),
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("Connection lost")]
    ConnectionLost,
    #[error("Timed out waiting for {0}")]
    Timeout(String),
    #[error("No data yet for {0}")]
    NotYetAvailable(String),
    #[error("Gateway error: {0}")]
    Gateway(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for MarketError {
    fn from(err: std::io::Error) -> Self {
        MarketError::Io(err.to_string())
    }
}

impl MarketError {
    /// Stable name of the error variant, used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            MarketError::AuthError(_) => "AuthError",
            MarketError::NotLoggedIn => "NotLoggedIn",
            MarketError::DuplicateKey(_) => "DuplicateKey",
            MarketError::UnknownKey(_) => "UnknownKey",
            MarketError::InvalidOrder(_) => "InvalidOrder",
            MarketError::UnsupportedOperation(_) => "UnsupportedOperation",
            MarketError::ConnectionLost => "ConnectionLost",
            MarketError::Timeout(_) => "Timeout",
            MarketError::NotYetAvailable(_) => "NotYetAvailable",
            MarketError::Gateway(_) => "Gateway",
            MarketError::Protocol(_) => "Protocol",
            MarketError::Io(_) => "Io",
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway Trait
// ---------------------------------------------------------------------------

/// The broker control.
///
/// Every method only *submits* work and returns as soon as the submission is
/// accepted. Results arrive later as [`GatewayEvent`](crate::GatewayEvent)s
/// on the [`EventSink`](crate::EventSink) the gateway was built with, carrying
/// the caller-supplied key. Subscriptions emit repeatedly, keyed by
/// instrument code.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Start a login. Resolves via `Connected`.
    async fn connect(&self) -> Result<(), MarketError>;

    /// Accounts available to the logged-in user.
    async fn accounts(&self) -> Result<Vec<String>, MarketError>;

    /// Load the saved condition list. Resolves via `ConditionsLoaded`.
    async fn load_conditions(&self) -> Result<(), MarketError>;

    /// Run one condition search. Resolves via `ConditionMatched` keyed by name.
    async fn search_condition(
        &self,
        screen: ScreenNo,
        name: &str,
        index: u32,
    ) -> Result<(), MarketError>;

    /// Issue a TR query. Resolves via `TrData` carrying `request_id`.
    async fn query(
        &self,
        request_id: &RequestId,
        screen: ScreenNo,
        account: &str,
        query: TrQuery,
    ) -> Result<(), MarketError>;

    /// Submit a new order or a cancel. Resolves via `TrData` carrying
    /// `request_id` with the order number as payload.
    async fn submit_order(
        &self,
        request_id: &RequestId,
        screen: ScreenNo,
        account: &str,
        ticket: &OrderTicket,
    ) -> Result<(), MarketError>;

    /// Change real-time registrations on a channel. `replace` drops the
    /// channel's previous registrations first.
    async fn subscribe(
        &self,
        screen: ScreenNo,
        codes: &[String],
        channel: FeedChannel,
        replace: bool,
    ) -> Result<(), MarketError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_wire_form_keeps_payload() {
        let value = serde_json::to_value(MarketError::AuthError(-100)).unwrap();
        assert_eq!(value, serde_json::json!({"kind": "AuthError", "detail": -100}));

        let errors = [
            MarketError::AuthError(-106),
            MarketError::NotLoggedIn,
            MarketError::InvalidOrder("bad".to_string()),
            MarketError::ConnectionLost,
            MarketError::Timeout("price 005930".to_string()),
        ];
        for err in errors {
            let rebuilt: MarketError =
                serde_json::from_value(serde_json::to_value(&err).unwrap()).unwrap();
            assert_eq!(rebuilt, err);
            assert_eq!(rebuilt.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_error_decoding_ignores_extra_fields() {
        let err: MarketError = serde_json::from_value(serde_json::json!({
            "kind": "Timeout",
            "detail": "ask_bid 005930",
            "message": "Timed out waiting for ask_bid 005930",
            "for": "ask_bid_info",
        }))
        .unwrap();
        assert_eq!(err, MarketError::Timeout("ask_bid 005930".to_string()));
    }
}

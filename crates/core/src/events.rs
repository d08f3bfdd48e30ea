use crate::models::*;
use tokio::sync::mpsc;

/// Callback delivered by the broker gateway.
///
/// Every variant except the push feeds answers exactly one earlier request,
/// identified by the key it carries.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// Result of a login attempt; zero means success.
    Connected { code: i32 },
    /// TR data is ready for a query or order submission.
    TrData { request_id: RequestId, reply: TrReply },
    /// The saved condition list was loaded, or failed with a result code.
    ConditionsLoaded(Result<Vec<Condition>, i32>),
    /// Instruments matching a condition search.
    ConditionMatched { name: String, codes: Vec<String> },
    /// Fill or acknowledgement for an order.
    Execution(ExecutionReport),
    /// Holding changed after a fill.
    BalanceChanged(BalanceEntry),
    /// Real-time trade quote.
    Quote { code: String, snapshot: QuoteSnapshot },
    /// Real-time order book.
    Depth { code: String, snapshot: DepthSnapshot },
    /// Informational message from the broker server.
    Message {
        request_id: RequestId,
        tr_code: String,
        text: String,
    },
}

/// Unsolicited events fanned out to facade subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    Quote { code: String, snapshot: QuoteSnapshot },
    Depth { code: String, snapshot: DepthSnapshot },
    Balance(BalanceEntry),
    OrderCompleted(OrderRecord),
}

/// Handle a gateway uses to post callbacks to the dispatch context.
///
/// Posting never blocks, so it is safe to call from inside a gateway callback.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<GatewayEvent>,
}

impl EventSink {
    pub fn emit(&self, event: GatewayEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Dispatcher has shut down, dropping gateway event");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Create the channel connecting a gateway to the market dispatcher.
pub fn event_channel() -> (EventSink, mpsc::UnboundedReceiver<GatewayEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, rx)
}

//! Wire protocol layer: exposes a [`kbridge_market::Market`] to one remote
//! control-plane client over newline-delimited JSON.

pub mod client;
pub mod outbound;
pub mod protocol;
pub mod server;

pub use client::{RemoteMarket, WireKey};
pub use outbound::{OutboundQueue, OverflowPolicy};
pub use protocol::{ClientRequest, FrameType, Method, ProtocolError, ServerMessage};
pub use server::{ProxyServer, ServerConfig};

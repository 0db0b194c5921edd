use async_trait::async_trait;
use thiserror::Error;

pub mod mock;
pub mod websocket;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("dial failed: {0}")]
    Dial(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport closed")]
    Closed,
}

/// Events surfaced by a transport beyond ordinary inbound frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A complete inbound text frame.
    Message(String),
    /// The channel ended. `clean` is true for an intentional, normal close.
    Closed { clean: bool },
}

/// An ordered, message-oriented duplex channel.
///
/// `recv` yields frames in arrival order followed by at most one `Closed`
/// event; after that it returns `None`. `send` is fire-and-forget: delivery
/// is at-most-once and failures surface through a later `Closed`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, frame: String) -> Result<(), TransportError>;

    async fn recv(&self) -> Option<TransportEvent>;

    fn is_connected(&self) -> bool;
}

/// Opens a fresh transport for each connection attempt, so the lifecycle
/// manager can redial during reconnects.
#[async_trait]
pub trait TransportDialer: Send + Sync {
    async fn dial(&self) -> Result<Box<dyn Transport>, TransportError>;
}

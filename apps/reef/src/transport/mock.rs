use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use reef_proto::{ClientMessage, ServerMessage};

use super::{Transport, TransportDialer, TransportError, TransportEvent};

/// In-memory transport for tests: a connected pair where [`MockRemote`]
/// plays the session server.
pub struct MockTransport {
    to_remote: mpsc::UnboundedSender<String>,
    from_remote: AsyncMutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

pub struct MockRemote {
    to_client: mpsc::UnboundedSender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<String>,
}

/// Create a connected client/server transport pair.
pub fn pair() -> (MockTransport, MockRemote) {
    let (tx_out, rx_out) = mpsc::unbounded_channel();
    let (tx_in, rx_in) = mpsc::unbounded_channel();
    (
        MockTransport {
            to_remote: tx_out,
            from_remote: AsyncMutex::new(rx_in),
        },
        MockRemote {
            to_client: tx_in,
            from_client: rx_out,
        },
    )
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.to_remote
            .send(frame)
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&self) -> Option<TransportEvent> {
        let mut rx = self.from_remote.lock().await;
        rx.recv().await
    }

    fn is_connected(&self) -> bool {
        !self.to_remote.is_closed()
    }
}

impl MockRemote {
    /// Push a protocol message to the client.
    pub fn send(&self, message: &ServerMessage) {
        let frame = serde_json::to_string(message).expect("serialize server message");
        let _ = self.to_client.send(TransportEvent::Message(frame));
    }

    /// Push a raw (possibly malformed) frame to the client.
    pub fn send_raw(&self, frame: &str) {
        let _ = self.to_client.send(TransportEvent::Message(frame.to_string()));
    }

    /// Close the channel from the server side.
    pub fn close(&self, clean: bool) {
        let _ = self.to_client.send(TransportEvent::Closed { clean });
    }

    /// Await the next outbound protocol message from the client.
    pub async fn recv(&mut self) -> Option<ClientMessage> {
        let frame = self.from_client.recv().await?;
        Some(serde_json::from_str(&frame).expect("parse client message"))
    }

    /// Pop an already-delivered outbound message without waiting.
    pub fn try_recv(&mut self) -> Option<ClientMessage> {
        let frame = self.from_client.try_recv().ok()?;
        Some(serde_json::from_str(&frame).expect("parse client message"))
    }
}

/// Dialer handing out pre-scripted transports; once the script is exhausted
/// every further dial fails, which lets tests drive reconnect storms.
pub struct MockDialer {
    script: AsyncMutex<VecDeque<MockTransport>>,
}

impl MockDialer {
    pub fn new(transports: Vec<MockTransport>) -> Self {
        Self {
            script: AsyncMutex::new(transports.into_iter().collect()),
        }
    }

    /// A dialer whose every attempt fails.
    pub fn unreachable() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl TransportDialer for MockDialer {
    async fn dial(&self) -> Result<Box<dyn Transport>, TransportError> {
        let mut script = self.script.lock().await;
        match script.pop_front() {
            Some(transport) => Ok(Box::new(transport)),
            None => Err(TransportError::Dial("no transport scripted".into())),
        }
    }
}

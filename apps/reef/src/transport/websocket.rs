use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{Transport, TransportDialer, TransportError, TransportEvent};

/// WebSocket implementation of the [`Transport`] trait.
pub struct WebSocketTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<TransportEvent>>,
    connected: Arc<AtomicBool>,
    ws_task: tokio::task::JoinHandle<()>,
}

impl WebSocketTransport {
    /// Connect to a session server WebSocket endpoint.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Dial(e.to_string()))?;

        let (tx_out, rx_out) = mpsc::unbounded_channel::<String>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<TransportEvent>();

        let connected = Arc::new(AtomicBool::new(true));
        let connected_clone = connected.clone();

        let ws_task = tokio::spawn(async move {
            pump_websocket(ws_stream, rx_out, tx_in, connected_clone).await;
        });

        Ok(Self {
            tx: tx_out,
            rx: AsyncMutex::new(rx_in),
            connected,
            ws_task,
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        self.tx
            .send(frame)
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn recv(&self) -> Option<TransportEvent> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.ws_task.abort();
    }
}

/// Bridge the socket to mpsc channels: one pump task owns the stream, so all
/// socket I/O happens in one place and callers only see channel ends.
async fn pump_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut rx_out: mpsc::UnboundedReceiver<String>,
    tx_in: mpsc::UnboundedSender<TransportEvent>,
    connected: Arc<AtomicBool>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = rx_out.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    loop {
        match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                if tx_in.send(TransportEvent::Message(text)).is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let clean = frame
                    .as_ref()
                    .map(|f| f.code == CloseCode::Normal)
                    .unwrap_or(false);
                debug!(clean, "websocket closed by server");
                let _ = tx_in.send(TransportEvent::Closed { clean });
                break;
            }
            Some(Ok(_)) => {} // binary/ping/pong frames are not part of the protocol
            Some(Err(e)) => {
                warn!(error = %e, "websocket error");
                let _ = tx_in.send(TransportEvent::Closed { clean: false });
                break;
            }
            None => {
                let _ = tx_in.send(TransportEvent::Closed { clean: false });
                break;
            }
        }
    }

    connected.store(false, Ordering::Relaxed);
    send_task.abort();
}

/// Dials the session server WebSocket for a given session id.
pub struct WebSocketDialer {
    url: String,
}

impl WebSocketDialer {
    pub fn new(session_server: &str, session_id: &str) -> Self {
        let url = if session_server.starts_with("ws://") || session_server.starts_with("wss://") {
            format!("{}/ws/{}", session_server, session_id)
        } else if session_server.contains("localhost") || session_server.contains("127.0.0.1") {
            format!("ws://{}/ws/{}", session_server, session_id)
        } else {
            format!("wss://{}/ws/{}", session_server, session_id)
        };
        Self { url }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl TransportDialer for WebSocketDialer {
    async fn dial(&self) -> Result<Box<dyn Transport>, TransportError> {
        let transport = WebSocketTransport::connect(&self.url).await?;
        Ok(Box::new(transport))
    }
}

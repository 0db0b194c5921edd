//! Connection lifecycle: reconnection with exponential backoff, keepalive,
//! and a request/reply correlation layer over the fire-and-forget transport.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use reef_proto::{ClientMessage, ConversationEntry, ServerMessage};

use super::{SessionError, SessionFlags};
use crate::config::Config;
use crate::transport::{TransportDialer, TransportEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Receives inbound protocol messages once correlation has been applied.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn handle_message(&self, message: ServerMessage);

    /// Degraded-mode recovery: reconnects are exhausted and no session state
    /// was ever received on this logical session.
    async fn offline_fallback(&self);
}

/// Clonable handle for queueing outbound protocol messages. Messages queue
/// while the connection is down and flush on the next open transport.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::UnboundedSender<ClientMessage>,
}

impl OutboundSender {
    pub fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        self.tx
            .send(message)
            .map_err(|_| SessionError::Disconnected)
    }

    /// Detached sender/receiver pair so router tests can observe sends
    /// without a full connection manager.
    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

struct PendingRequest {
    tx: oneshot::Sender<Result<ServerMessage, SessionError>>,
}

struct Inner {
    pending: HashMap<String, PendingRequest>,
    /// Request id of the most recent switch-context call, so a newer one can
    /// supersede it. This is the only switch bookkeeping; the pending map is
    /// the single correlation mechanism.
    in_flight_switch: Option<String>,
    reconnect_enabled: bool,
    run_task: Option<JoinHandle<()>>,
}

struct Shared {
    config: Config,
    dialer: Box<dyn TransportDialer>,
    status_tx: watch::Sender<ConnectionStatus>,
    inner: Mutex<Inner>,
    outbound_tx: mpsc::UnboundedSender<ClientMessage>,
    outbound_rx: AsyncMutex<mpsc::UnboundedReceiver<ClientMessage>>,
    flags: Arc<SessionFlags>,
}

/// Owns a single logical connection to the session server.
///
/// A clonable handle over shared state: construct one per process and pass
/// it by reference. `connect` is idempotent while an attempt is already
/// underway.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: Config, dialer: Box<dyn TransportDialer>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                config,
                dialer,
                status_tx,
                inner: Mutex::new(Inner {
                    pending: HashMap::new(),
                    in_flight_switch: None,
                    reconnect_enabled: true,
                    run_task: None,
                }),
                outbound_tx,
                outbound_rx: AsyncMutex::new(outbound_rx),
                flags: Arc::new(SessionFlags::default()),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Session-scoped flags shared with the message router.
    pub fn session_flags(&self) -> Arc<SessionFlags> {
        self.shared.flags.clone()
    }

    /// Handle the router uses for echo-back sends.
    pub fn outbound(&self) -> OutboundSender {
        OutboundSender {
            tx: self.shared.outbound_tx.clone(),
        }
    }

    /// Open the logical connection. Idempotent while a connection attempt is
    /// already `Connecting` or `Connected`; while `Reconnecting` it cancels
    /// the pending backoff timer and redials immediately.
    pub fn connect(&self, handler: Arc<dyn SessionHandler>) {
        let stale = {
            let mut inner = self.shared.inner.lock();
            let status = self.status();
            let task_alive = inner
                .run_task
                .as_ref()
                .map(|t| !t.is_finished())
                .unwrap_or(false);
            if task_alive
                && matches!(
                    status,
                    ConnectionStatus::Connecting | ConnectionStatus::Connected
                )
            {
                debug!(?status, "connect ignored; connection already underway");
                return;
            }
            inner.reconnect_enabled = true;
            inner.run_task.take()
        };
        if let Some(task) = stale {
            task.abort();
        }
        self.shared.flags.set_session_state_received(false);

        let shared = self.shared.clone();
        let task = tokio::spawn(async move {
            shared.run(handler).await;
        });
        self.shared.inner.lock().run_task = Some(task);
    }

    /// Tear down the connection and make the next `connect` behave like a
    /// fresh session start rather than a reconnect.
    pub fn disconnect(&self) {
        let task = {
            let mut inner = self.shared.inner.lock();
            inner.reconnect_enabled = false;
            inner.in_flight_switch = None;
            inner.run_task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.shared.reject_all_pending();
        self.shared.flags.set_initial_load_complete(false);
        self.shared.flags.set_session_state_received(false);
        self.shared.set_status(ConnectionStatus::Disconnected);
        info!("disconnected");
    }

    /// Resolves once the connection is open; immediately if it already is.
    pub async fn once_connected(&self) {
        let mut rx = self.shared.status_tx.subscribe();
        // The sender lives on the shared state, so wait_for can only fail if
        // the manager is dropped mid-await, in which case the caller is gone.
        let _ = rx
            .wait_for(|status| *status == ConnectionStatus::Connected)
            .await;
    }

    /// Queue a fire-and-forget protocol message.
    pub fn send(&self, message: ClientMessage) -> Result<(), SessionError> {
        self.outbound().send(message)
    }

    /// Turn a fire-and-forget send into an awaitable call keyed by a fresh
    /// request id. Resolves on the matching reply, rejects on a correlated
    /// error payload, the reply timeout, or disconnect. Plain correlated
    /// calls never displace an in-flight switch.
    pub async fn send_with_reply<F>(&self, build: F) -> Result<ServerMessage, SessionError>
    where
        F: FnOnce(String) -> ClientMessage,
    {
        self.send_correlated(build, false).await
    }

    /// Ask the server to switch what this session is editing. Issuing a new
    /// switch while one is in flight rejects the previous one with
    /// [`SessionError::Superseded`] before the new one is registered, so a
    /// stale reply can never be misapplied.
    pub async fn send_switch_context(
        &self,
        strudel_id: Option<String>,
        code: Option<String>,
        conversation_history: Option<Vec<ConversationEntry>>,
    ) -> Result<ServerMessage, SessionError> {
        self.send_correlated(
            move |request_id| ClientMessage::SwitchContext {
                strudel_id,
                code,
                conversation_history,
                request_id,
            },
            true,
        )
        .await
    }

    async fn send_correlated<F>(
        &self,
        build: F,
        is_switch: bool,
    ) -> Result<ServerMessage, SessionError>
    where
        F: FnOnce(String) -> ClientMessage,
    {
        let request_id = Uuid::new_v4().to_string();
        let rx = self.shared.register_pending(&request_id, is_switch);
        self.outbound().send(build(request_id.clone()))?;
        self.shared.await_reply(request_id, rx).await
    }
}

impl Shared {
    fn register_pending(
        &self,
        request_id: &str,
        is_switch: bool,
    ) -> oneshot::Receiver<Result<ServerMessage, SessionError>> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        if is_switch {
            if let Some(previous) = inner.in_flight_switch.take() {
                if let Some(entry) = inner.pending.remove(&previous) {
                    debug!(request_id = %previous, "superseding in-flight switch");
                    let _ = entry.tx.send(Err(SessionError::Superseded));
                }
            }
            inner.in_flight_switch = Some(request_id.to_string());
        }
        inner
            .pending
            .insert(request_id.to_string(), PendingRequest { tx });
        rx
    }

    async fn await_reply(
        &self,
        request_id: String,
        rx: oneshot::Receiver<Result<ServerMessage, SessionError>>,
    ) -> Result<ServerMessage, SessionError> {
        match timeout(self.config.reply_timeout, rx).await {
            Ok(Ok(result)) => result,
            // The entry was dropped without a verdict; only teardown does that.
            Ok(Err(_)) => Err(SessionError::Disconnected),
            Err(_) => {
                let mut inner = self.inner.lock();
                inner.pending.remove(&request_id);
                if inner.in_flight_switch.as_deref() == Some(request_id.as_str()) {
                    inner.in_flight_switch = None;
                }
                Err(SessionError::RequestTimeout)
            }
        }
    }

    fn reject_all_pending(&self) {
        let entries: Vec<PendingRequest> = {
            let mut inner = self.inner.lock();
            inner.pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in entries {
            let _ = entry.tx.send(Err(SessionError::Disconnected));
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.status_tx.send_replace(status);
        if previous != status {
            info!(from = ?previous, to = ?status, "connection status");
        }
    }

    /// The connection loop: dial, drain, and reconnect with backoff until
    /// told to stop or attempts run out.
    async fn run(self: Arc<Self>, handler: Arc<dyn SessionHandler>) {
        let mut outbound_rx = self.outbound_rx.lock().await;
        let mut attempt: u32 = 0;

        loop {
            self.set_status(ConnectionStatus::Connecting);
            // A connection stuck in Connecting is forcibly abandoned and
            // routed into the same reconnect path as a server-initiated close.
            let dialed = timeout(self.config.connect_timeout, self.dialer.dial()).await;

            let mut clean_close = false;
            match dialed {
                Ok(Ok(transport)) => {
                    attempt = 0;
                    self.set_status(ConnectionStatus::Connected);

                    let keepalive_tx = self.outbound_tx.clone();
                    let keepalive_interval = self.config.keepalive_interval;
                    let keepalive = tokio::spawn(async move {
                        let mut ticker = interval(keepalive_interval);
                        loop {
                            ticker.tick().await;
                            if keepalive_tx.send(ClientMessage::Ping).is_err() {
                                break;
                            }
                        }
                    });

                    loop {
                        tokio::select! {
                            event = transport.recv() => match event {
                                Some(TransportEvent::Message(frame)) => {
                                    self.handle_frame(&frame, &handler).await;
                                }
                                Some(TransportEvent::Closed { clean }) => {
                                    clean_close = clean;
                                    break;
                                }
                                None => break,
                            },
                            Some(message) = outbound_rx.recv() => {
                                match serde_json::to_string(&message) {
                                    Ok(frame) => {
                                        if transport.send(frame).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => warn!(error = %e, "failed to encode outbound message"),
                                }
                            }
                        }
                    }
                    keepalive.abort();
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "dial failed");
                }
                Err(_) => {
                    warn!("connection attempt timed out");
                }
            }

            if clean_close || !self.inner.lock().reconnect_enabled {
                self.set_status(ConnectionStatus::Disconnected);
                self.reject_all_pending();
                return;
            }

            attempt += 1;
            if attempt > self.config.max_reconnect_attempts {
                warn!(
                    attempts = self.config.max_reconnect_attempts,
                    "giving up on reconnection"
                );
                self.set_status(ConnectionStatus::Disconnected);
                self.reject_all_pending();
                if !self.flags.session_state_received() {
                    handler.offline_fallback().await;
                }
                return;
            }

            let delay = self.config.reconnect_delay(attempt);
            self.set_status(ConnectionStatus::Reconnecting);
            warn!(attempt, ?delay, "scheduling reconnect");
            tokio::time::sleep(delay).await;
        }
    }

    /// Apply correlation and hand the message to the router. A correlated
    /// caller resumes only after routing has completed, so the reply never
    /// exposes pre-reconciliation state. Correlated error payloads are
    /// consumed; everything else still routes.
    async fn handle_frame(&self, frame: &str, handler: &Arc<dyn SessionHandler>) {
        let message: ServerMessage = match serde_json::from_str(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "ignoring unparseable inbound frame");
                return;
            }
        };

        let request_id = message.request_id().map(str::to_string);
        let entry = request_id.as_deref().and_then(|id| {
            let entry = self.inner.lock().pending.remove(id);
            if entry.is_none() {
                // A superseded or timed-out request's late reply lands here.
                debug!(request_id = %id, "reply for unknown request id");
            }
            entry
        });

        if let ServerMessage::Error { message: detail, .. } = &message {
            if let Some(entry) = entry {
                self.clear_in_flight_switch(request_id.as_deref());
                let _ = entry.tx.send(Err(SessionError::Protocol(detail.clone())));
                return;
            }
            handler.handle_message(message).await;
            return;
        }

        if matches!(message, ServerMessage::SessionState { .. }) {
            self.flags.set_session_state_received(true);
        }

        // Route first: the verdict is delivered only once reconciliation has
        // run, so the awaiting caller observes the post-reconciliation state.
        handler.handle_message(message.clone()).await;

        if let Some(entry) = entry {
            self.clear_in_flight_switch(request_id.as_deref());
            let _ = entry.tx.send(Ok(message));
        }
    }

    /// Clear the in-flight switch id, but only if it still names this
    /// request; a newer switch registered meanwhile must keep its slot.
    fn clear_in_flight_switch(&self, request_id: Option<&str>) {
        let mut inner = self.inner.lock();
        if inner.in_flight_switch.as_deref() == request_id {
            inner.in_flight_switch = None;
        }
    }
}

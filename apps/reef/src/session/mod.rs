pub mod connection;
pub mod decision;
pub mod router;

pub use connection::{ConnectionManager, ConnectionStatus, OutboundSender, SessionHandler};
pub use decision::{
    decide_code_action, decide_draft_save, process_session_state, CodeAction, Decision,
    DecisionDebug, DraftSaveDecision, DraftSource, SaveTarget, SessionContext, SkipReason,
};
pub use router::{AuthState, EditorSink, SessionRouter, StaticAuth};

use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Socket-level failure; recovered automatically via reconnect and
    /// surfaced as a status flag, never thrown to callers.
    #[error("connection error: {0}")]
    Connection(String),
    /// A correlated call received no reply within budget.
    #[error("request timed out")]
    RequestTimeout,
    /// An in-flight switch-context call was displaced by a newer one. Not a
    /// failure; the newer call carries the session forward.
    #[error("request superseded by a newer switch")]
    Superseded,
    /// The server sent an explicit error payload.
    #[error("server error: {0}")]
    Protocol(String),
    #[error("disconnected")]
    Disconnected,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Session-scoped flags shared between the lifecycle manager and the
/// message router. Updated synchronously inside message handling, so a later
/// message always observes the writes of an earlier one.
#[derive(Debug, Default)]
pub struct SessionFlags {
    initial_load_complete: AtomicBool,
    skip_code_restoration: AtomicBool,
    session_state_received: AtomicBool,
}

impl SessionFlags {
    /// True once this logical session has established its working state.
    pub fn initial_load_complete(&self) -> bool {
        self.initial_load_complete.load(Ordering::SeqCst)
    }

    pub fn set_initial_load_complete(&self, value: bool) {
        self.initial_load_complete.store(value, Ordering::SeqCst);
    }

    /// Embedder-driven: suppress any code restoration on the next
    /// reconciliation (e.g. the user just started a fresh pattern).
    pub fn skip_code_restoration(&self) -> bool {
        self.skip_code_restoration.load(Ordering::SeqCst)
    }

    pub fn set_skip_code_restoration(&self, value: bool) {
        self.skip_code_restoration.store(value, Ordering::SeqCst);
    }

    /// Whether any session-state message arrived on this logical session;
    /// gates the local-storage fallback when reconnects run out.
    pub fn session_state_received(&self) -> bool {
        self.session_state_received.load(Ordering::SeqCst)
    }

    pub fn set_session_state_received(&self, value: bool) {
        self.session_state_received.store(value, Ordering::SeqCst);
    }
}

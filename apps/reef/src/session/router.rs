//! Translates inbound protocol messages into store mutations and editor
//! updates, and runs the decision engine on the one message type that
//! triggers reconciliation.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use reef_proto::{
    ChatEntry, ClientMessage, CodeUpdateSource, ConversationEntry, Participant, ServerMessage,
};

use super::connection::{ConnectionManager, OutboundSender, SessionHandler};
use super::decision::{
    process_session_state, CodeAction, DraftSaveDecision, SaveTarget, SessionContext,
};
use super::SessionFlags;
use crate::config::Config;
use crate::storage::{mint_draft_id, LayeredStorage};

/// The editor store consumed by the router. Remote-originated updates
/// (`is_remote = true`) must not mark the editor dirty.
pub trait EditorSink: Send + Sync {
    fn set_code(&self, code: &str, is_remote: bool);
    fn set_conversation_history(&self, entries: &[ConversationEntry]);
    fn set_chat_history(&self, entries: &[ChatEntry]);
    fn chat_received(&self, entry: &ChatEntry);
    fn participant_joined(&self, participant: &Participant);
    fn participant_left(&self, participant_id: &str);
    fn set_playing(&self, playing: bool);
    fn session_ended(&self, reason: Option<&str>);
    fn session_error(&self, message: &str);
}

/// The auth store consumed when snapshotting a reconciliation context.
pub trait AuthState: Send + Sync {
    fn token(&self) -> Option<String>;
    /// Whether auth state has finished loading; before that, `token` may
    /// transiently read as absent.
    fn is_hydrated(&self) -> bool;
}

/// Fixed auth state for the CLI and tests.
pub struct StaticAuth {
    token: Option<String>,
}

impl StaticAuth {
    pub fn new(token: Option<String>) -> Self {
        Self { token }
    }

    pub fn anonymous() -> Self {
        Self { token: None }
    }
}

impl AuthState for StaticAuth {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }

    fn is_hydrated(&self) -> bool {
        true
    }
}

/// Dispatches inbound protocol messages; owns reconciliation execution.
pub struct SessionRouter {
    storage: LayeredStorage,
    sink: Arc<dyn EditorSink>,
    auth: Arc<dyn AuthState>,
    outbound: OutboundSender,
    flags: Arc<SessionFlags>,
    default_code: String,
}

impl SessionRouter {
    pub fn new(
        config: &Config,
        storage: LayeredStorage,
        sink: Arc<dyn EditorSink>,
        auth: Arc<dyn AuthState>,
        manager: &ConnectionManager,
    ) -> Self {
        Self {
            storage,
            sink,
            auth,
            outbound: manager.outbound(),
            flags: manager.session_flags(),
            default_code: config.default_code.clone(),
        }
    }

    #[cfg(test)]
    fn with_parts(
        storage: LayeredStorage,
        sink: Arc<dyn EditorSink>,
        auth: Arc<dyn AuthState>,
        outbound: OutboundSender,
        flags: Arc<SessionFlags>,
        default_code: String,
    ) -> Self {
        Self {
            storage,
            sink,
            auth,
            outbound,
            flags,
            default_code,
        }
    }

    /// Record a debounced local edit into the tab's draft, minting a draft
    /// id on the first edit. Returns the draft id the edit landed in.
    pub fn record_local_edit(&self, code: &str) -> String {
        let draft_id = match self.storage.current_draft_id() {
            Some(id) => id,
            None => {
                let id = mint_draft_id();
                self.storage.set_current_draft_id(&id);
                id
            }
        };
        self.storage.upsert_draft_code(&draft_id, code);
        draft_id
    }

    /// An explicit user save promoted the tab's draft into a saved strudel:
    /// checkpoint a good version, drop the draft, and repoint the tab.
    pub fn mark_saved(&self, strudel_id: &str, code: &str) {
        self.storage.record_good_version(strudel_id, code);
        if let Some(draft_id) = self.storage.current_draft_id() {
            self.storage.delete_draft(&draft_id);
            self.storage.clear_current_draft_id();
        }
        self.storage.set_current_strudel_id(strudel_id);
    }

    fn build_context(
        &self,
        role: reef_proto::SessionRole,
        participants: Vec<Participant>,
        server_code: Option<String>,
        request_id: Option<String>,
    ) -> SessionContext {
        if !self.auth.is_hydrated() {
            debug!("auth store not yet hydrated; token may read as absent");
        }
        SessionContext {
            has_token: self.auth.token().is_some(),
            current_strudel_id: self.storage.current_strudel_id(),
            current_draft_id: self.storage.current_draft_id(),
            current_draft: self.storage.current_draft(),
            latest_draft: self.storage.latest_draft(),
            initial_load_complete: self.flags.initial_load_complete(),
            skip_code_restoration: self.flags.skip_code_restoration(),
            request_id,
            role,
            participants,
            server_code,
            default_code: self.default_code.clone(),
        }
    }

    fn reconcile(
        &self,
        session_id: String,
        role: reef_proto::SessionRole,
        participants: Vec<Participant>,
        server_code: Option<String>,
        chat_history: Vec<ChatEntry>,
        conversation_history: Vec<ConversationEntry>,
        request_id: Option<String>,
    ) {
        self.storage.set_session_id(&session_id);

        let ctx = self.build_context(role, participants, server_code, request_id);
        let decision = process_session_state(&ctx);
        debug!(decision = ?decision.debug, "reconciled session state");

        match &decision.code_action {
            CodeAction::RestoreDraft { draft, source } => {
                info!(draft_id = %draft.id, ?source, "restoring draft");
                self.sink.set_code(&draft.code, true);
                self.storage.set_current_draft_id(&draft.id);
                self.sink.set_conversation_history(&draft.conversation_history);
                // Send the restored code back so the authoritative side
                // converges on what this tab is now showing.
                let _ = self.outbound.send(ClientMessage::CodeUpdate {
                    code: draft.code.clone(),
                    cursor: None,
                    source: CodeUpdateSource::LoadedStrudel,
                });
            }
            CodeAction::UseServerCode { code } => {
                self.sink.set_code(code, true);
                if !conversation_history.is_empty() {
                    self.sink.set_conversation_history(&conversation_history);
                }
            }
            CodeAction::UseDefaultCode { code } => {
                self.sink.set_code(code, true);
                // Echo so a brand-new session has consistent state on both ends.
                let _ = self.outbound.send(ClientMessage::CodeUpdate {
                    code: code.clone(),
                    cursor: None,
                    source: CodeUpdateSource::LoadedStrudel,
                });
            }
            CodeAction::SkipCodeUpdate { reason } => {
                debug!(?reason, "skipping code update");
            }
        }

        if !chat_history.is_empty() {
            self.sink.set_chat_history(&chat_history);
        }

        match decision.draft_save {
            DraftSaveDecision::Skip => {}
            DraftSaveDecision::Save { target, code } => match target {
                SaveTarget::Strudel(strudel_id) => {
                    self.storage.save_offline_strudel(&strudel_id, &code);
                }
                SaveTarget::ExistingDraft(draft_id) => {
                    self.storage.upsert_draft_code(&draft_id, &code);
                }
                SaveTarget::FreshDraft => {
                    let draft_id = mint_draft_id();
                    self.storage.upsert_draft_code(&draft_id, &code);
                    self.storage.set_current_draft_id(&draft_id);
                }
            },
        }

        // Must flip synchronously, before any later message is processed.
        self.flags.set_initial_load_complete(true);
    }
}

#[async_trait]
impl SessionHandler for SessionRouter {
    async fn handle_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::SessionState {
                session_id,
                timestamp: _,
                role,
                participants,
                code,
                chat_history,
                conversation_history,
                request_id,
            } => {
                self.reconcile(
                    session_id,
                    role,
                    participants,
                    code,
                    chat_history,
                    conversation_history,
                    request_id,
                );
            }
            ServerMessage::CodeUpdate { code, .. } => {
                self.sink.set_code(&code, true);
            }
            ServerMessage::ChatMessage {
                from,
                content,
                timestamp,
            } => {
                self.sink.chat_received(&ChatEntry {
                    from,
                    content,
                    timestamp,
                });
            }
            ServerMessage::UserJoined { participant } => {
                self.sink.participant_joined(&participant);
            }
            ServerMessage::UserLeft { participant_id } => {
                self.sink.participant_left(&participant_id);
            }
            ServerMessage::Play => self.sink.set_playing(true),
            ServerMessage::Stop => self.sink.set_playing(false),
            ServerMessage::SessionEnded { reason } => {
                self.sink.session_ended(reason.as_deref());
            }
            ServerMessage::Error {
                message,
                request_id,
            } => {
                // Correlated errors were already consumed by the manager.
                warn!(?request_id, "session error: {message}");
                self.sink.session_error(&message);
            }
            ServerMessage::Pong => {
                debug!("keepalive pong");
            }
        }
    }

    /// Best-effort degraded-mode recovery: load the latest durable draft
    /// directly, bypassing the decision engine.
    async fn offline_fallback(&self) {
        match self.storage.latest_draft() {
            Some(draft) => {
                warn!(draft_id = %draft.id, "reconnects exhausted; restoring latest draft from local storage");
                self.sink.set_code(&draft.code, true);
                self.sink.set_conversation_history(&draft.conversation_history);
                self.storage.set_current_draft_id(&draft.id);
            }
            None => {
                warn!("reconnects exhausted and no local draft to fall back to");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reef_proto::{Draft, SessionRole};
    use tokio::sync::mpsc;

    use crate::tests::{RecordingSink, SinkEvent};

    struct Harness {
        router: SessionRouter,
        sink: Arc<RecordingSink>,
        storage: LayeredStorage,
        flags: Arc<SessionFlags>,
        outbound_rx: mpsc::UnboundedReceiver<ClientMessage>,
    }

    fn harness(token: Option<&str>) -> Harness {
        let storage = LayeredStorage::in_memory();
        let sink = Arc::new(RecordingSink::default());
        let flags = Arc::new(SessionFlags::default());
        let (outbound, outbound_rx) = OutboundSender::for_tests();
        let router = SessionRouter::with_parts(
            storage.clone(),
            sink.clone(),
            Arc::new(StaticAuth::new(token.map(str::to_string))),
            outbound,
            flags.clone(),
            "s(\"bd sd\")".to_string(),
        );
        Harness {
            router,
            sink,
            storage,
            flags,
            outbound_rx,
        }
    }

    fn draft(id: &str, code: &str, updated_at: i64) -> Draft {
        Draft {
            id: id.to_string(),
            code: code.to_string(),
            conversation_history: vec![ConversationEntry {
                role: "user".into(),
                content: "make it faster".into(),
            }],
            updated_at,
            title: None,
            forked_from_id: None,
            parent_signal: None,
        }
    }

    fn session_state(
        role: SessionRole,
        participants: Vec<Participant>,
        code: Option<&str>,
    ) -> ServerMessage {
        ServerMessage::SessionState {
            session_id: "s1".into(),
            timestamp: 0,
            role,
            participants,
            code: code.map(str::to_string),
            chat_history: Vec::new(),
            conversation_history: Vec::new(),
            request_id: None,
        }
    }

    #[tokio::test]
    async fn test_restore_draft_execution_order_and_echo() {
        let mut h = harness(None);
        h.storage.save_draft(&draft("d1", "s(\"bd\")", 100));

        h.router
            .handle_message(session_state(SessionRole::Owner, Vec::new(), None))
            .await;

        // Code applied as remote, pointer set, history rehydrated.
        let events = h.sink.events();
        assert_eq!(
            events[0],
            SinkEvent::SetCode {
                code: "s(\"bd\")".into(),
                is_remote: true
            }
        );
        assert_eq!(events[1], SinkEvent::SetConversation(1));
        assert_eq!(h.storage.current_draft_id().as_deref(), Some("d1"));

        // Restored code echoed back for convergence.
        match h.outbound_rx.try_recv().unwrap() {
            ClientMessage::CodeUpdate { code, source, .. } => {
                assert_eq!(code, "s(\"bd\")");
                assert_eq!(source, CodeUpdateSource::LoadedStrudel);
            }
            other => panic!("unexpected outbound message: {:?}", other),
        }

        // Restore never writes back.
        assert_eq!(h.storage.latest_draft().unwrap().code, "s(\"bd\")");
        assert!(h.flags.initial_load_complete());
    }

    #[tokio::test]
    async fn test_default_code_echoed_and_saved_when_no_draft() {
        let mut h = harness(None);
        h.router
            .handle_message(session_state(SessionRole::Owner, Vec::new(), None))
            .await;

        assert_eq!(
            h.sink.events()[0],
            SinkEvent::SetCode {
                code: "s(\"bd sd\")".into(),
                is_remote: true
            }
        );
        assert!(matches!(
            h.outbound_rx.try_recv().unwrap(),
            ClientMessage::CodeUpdate { .. }
        ));

        // A fresh draft was minted and became the tab's pointer.
        let minted = h.storage.current_draft_id().expect("fresh draft pointer");
        assert_eq!(h.storage.get_draft(&minted).unwrap().code, "s(\"bd sd\")");
    }

    #[tokio::test]
    async fn test_server_code_saved_under_open_strudel_key() {
        let mut h = harness(Some("token"));
        h.storage.set_current_strudel_id("x");
        h.storage.save_draft(&draft("d1", "draft code", 100));

        h.router
            .handle_message(session_state(
                SessionRole::Owner,
                Vec::new(),
                Some("s(\"bd\")"),
            ))
            .await;

        assert_eq!(
            h.sink.events()[0],
            SinkEvent::SetCode {
                code: "s(\"bd\")".into(),
                is_remote: true
            }
        );
        // Backup landed under the strudel key; the draft is untouched.
        assert_eq!(h.storage.offline_strudel("x").unwrap().code, "s(\"bd\")");
        assert_eq!(h.storage.get_draft("d1").unwrap().code, "draft code");
        // Server-code path does not echo.
        assert!(h.outbound_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_session_state_skips_all_mutation() {
        let mut h = harness(None);
        h.storage.save_draft(&draft("d1", "local edits", 100));
        h.flags.set_initial_load_complete(true);

        h.router
            .handle_message(session_state(
                SessionRole::Owner,
                Vec::new(),
                Some("server clobber"),
            ))
            .await;

        assert!(h.sink.events().is_empty());
        assert!(h.outbound_rx.try_recv().is_err());
        assert_eq!(h.storage.latest_draft().unwrap().code, "local edits");
    }

    #[tokio::test]
    async fn test_non_reconciliation_messages_route_to_sink() {
        let h = harness(None);
        h.router
            .handle_message(ServerMessage::CodeUpdate {
                code: "live".into(),
                cursor: None,
                from: Some("p2".into()),
            })
            .await;
        h.router
            .handle_message(ServerMessage::ChatMessage {
                from: "p2".into(),
                content: "hi".into(),
                timestamp: 1,
            })
            .await;
        h.router.handle_message(ServerMessage::Play).await;
        h.router
            .handle_message(ServerMessage::SessionEnded { reason: None })
            .await;

        let events = h.sink.events();
        assert_eq!(
            events,
            vec![
                SinkEvent::SetCode {
                    code: "live".into(),
                    is_remote: true
                },
                SinkEvent::Chat("hi".into()),
                SinkEvent::Playing(true),
                SinkEvent::Ended(None),
            ]
        );
        // Inbound live code updates never flip the initial-load flag.
        assert!(!h.flags.initial_load_complete());
    }

    #[tokio::test]
    async fn test_offline_fallback_restores_latest_draft() {
        let h = harness(None);
        h.storage.save_draft(&draft("d1", "offline work", 100));

        h.router.offline_fallback().await;

        assert_eq!(
            h.sink.events()[0],
            SinkEvent::SetCode {
                code: "offline work".into(),
                is_remote: true
            }
        );
        assert_eq!(h.storage.current_draft_id().as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn test_record_local_edit_mints_once() {
        let h = harness(None);
        let first = h.router.record_local_edit("a");
        let second = h.router.record_local_edit("ab");
        assert_eq!(first, second);
        assert_eq!(h.storage.get_draft(&first).unwrap().code, "ab");
    }

    #[tokio::test]
    async fn test_mark_saved_promotes_draft() {
        let h = harness(Some("token"));
        let draft_id = h.router.record_local_edit("s(\"bd\")");

        h.router.mark_saved("x1", "s(\"bd\")");

        assert_eq!(h.storage.good_version("x1").unwrap().code, "s(\"bd\")");
        assert!(h.storage.get_draft(&draft_id).is_none());
        assert!(h.storage.current_draft_id().is_none());
        assert_eq!(h.storage.current_strudel_id().as_deref(), Some("x1"));
    }
}

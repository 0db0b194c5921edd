
use parking_lot::Mutex;
use std::sync::Arc;

use reef_proto::{ChatEntry, ConversationEntry, Participant};

use crate::session::EditorSink;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SinkEvent {
    SetCode { code: String, is_remote: bool },
    SetConversation(usize),
    SetChat(usize),
    Chat(String),
    Joined(String),
    Left(String),
    Playing(bool),
    Ended(Option<String>),
    Error(String),
}

/// Editor store double that records every call.
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub(crate) fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn code_updates(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::SetCode { code, .. } => Some(code.clone()),
                _ => None,
            })
            .collect()
    }
}

impl EditorSink for RecordingSink {
    fn set_code(&self, code: &str, is_remote: bool) {
        self.events.lock().push(SinkEvent::SetCode {
            code: code.to_string(),
            is_remote,
        });
    }
    fn set_conversation_history(&self, entries: &[ConversationEntry]) {
        self.events
            .lock()
            .push(SinkEvent::SetConversation(entries.len()));
    }
    fn set_chat_history(&self, entries: &[ChatEntry]) {
        self.events.lock().push(SinkEvent::SetChat(entries.len()));
    }
    fn chat_received(&self, entry: &ChatEntry) {
        self.events.lock().push(SinkEvent::Chat(entry.content.clone()));
    }
    fn participant_joined(&self, participant: &Participant) {
        self.events
            .lock()
            .push(SinkEvent::Joined(participant.id.clone()));
    }
    fn participant_left(&self, participant_id: &str) {
        self.events
            .lock()
            .push(SinkEvent::Left(participant_id.to_string()));
    }
    fn set_playing(&self, playing: bool) {
        self.events.lock().push(SinkEvent::Playing(playing));
    }
    fn session_ended(&self, reason: Option<&str>) {
        self.events
            .lock()
            .push(SinkEvent::Ended(reason.map(str::to_string)));
    }
    fn session_error(&self, message: &str) {
        self.events.lock().push(SinkEvent::Error(message.to_string()));
    }
}

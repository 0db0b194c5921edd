//! Shared wire-protocol definitions for client ↔ session-server communication.
//! Keeping this in a dedicated crate allows regeneration of bindings
//! for other frontends without pulling in the client runtime.

use serde::{Deserialize, Serialize};

/// Role a participant holds inside a collaborative session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    Owner,
    Collaborator,
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub role: SessionRole,
    pub joined_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// One turn of an agent conversation attached to a draft or session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub from: String,
    pub content: String,
    pub timestamp: i64,
}

/// An unsaved unit of editing work. Exactly one durable record exists per
/// `id`; the "latest" draft is the one with the maximum `updated_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub id: String,
    pub code: String,
    #[serde(default)]
    pub conversation_history: Vec<ConversationEntry>,
    /// Epoch millis of the last mutation.
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forked_from_id: Option<String>,
    /// Restriction tag inherited from the pattern this draft was forked from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_signal: Option<String>,
}

/// Where a client-side code update came from. Non-`typed` sources bypass
/// debouncing so the server sees them immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodeUpdateSource {
    Typed,
    LoadedStrudel,
    Forked,
    Pasted,
}

impl CodeUpdateSource {
    pub fn bypasses_debounce(&self) -> bool {
        !matches!(self, CodeUpdateSource::Typed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// Messages received from the session server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// The one reconciliation trigger: emitted once per (re)connect.
    SessionState {
        session_id: String,
        timestamp: i64,
        role: SessionRole,
        participants: Vec<Participant>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default)]
        chat_history: Vec<ChatEntry>,
        #[serde(default)]
        conversation_history: Vec<ConversationEntry>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    CodeUpdate {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<CursorPosition>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
    },
    ChatMessage {
        from: String,
        content: String,
        timestamp: i64,
    },
    UserJoined {
        participant: Participant,
    },
    UserLeft {
        participant_id: String,
    },
    Play,
    Stop,
    SessionEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Pong,
}

impl ServerMessage {
    /// Correlation id carried by this message, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionState { request_id, .. }
            | ServerMessage::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }
}

/// Messages sent to the session server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CodeUpdate {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cursor: Option<CursorPosition>,
        source: CodeUpdateSource,
    },
    ChatMessage {
        content: String,
    },
    Play,
    Stop,
    Ping,
    /// Switch the session to another saved pattern (or back to scratch when
    /// `strudel_id` is null). Always correlated via `request_id`.
    SwitchContext {
        strudel_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_history: Option<Vec<ConversationEntry>>,
        request_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_tagging() {
        let json = serde_json::json!({
            "type": "session_state",
            "session_id": "s1",
            "timestamp": 1_700_000_000_000i64,
            "role": "viewer",
            "participants": [
                {"id": "p1", "role": "owner", "joined_at": 1}
            ],
            "code": "s(\"bd sd\")",
        });
        let msg: ServerMessage = serde_json::from_value(json).unwrap();
        match msg {
            ServerMessage::SessionState {
                role,
                participants,
                code,
                request_id,
                chat_history,
                ..
            } => {
                assert_eq!(role, SessionRole::Viewer);
                assert_eq!(participants.len(), 1);
                assert_eq!(code.as_deref(), Some("s(\"bd sd\")"));
                assert!(request_id.is_none());
                assert!(chat_history.is_empty());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_client_message_snake_case_tags() {
        let msg = ClientMessage::SwitchContext {
            strudel_id: Some("x1".into()),
            code: None,
            conversation_history: None,
            request_id: "r1".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "switch_context");
        assert_eq!(value["strudel_id"], "x1");
        assert_eq!(value["request_id"], "r1");
        assert!(value.get("code").is_none());
    }

    #[test]
    fn test_code_update_source_debounce() {
        assert!(!CodeUpdateSource::Typed.bypasses_debounce());
        assert!(CodeUpdateSource::LoadedStrudel.bypasses_debounce());
        assert!(CodeUpdateSource::Forked.bypasses_debounce());
        assert!(CodeUpdateSource::Pasted.bypasses_debounce());
        assert_eq!(
            serde_json::to_value(CodeUpdateSource::LoadedStrudel).unwrap(),
            "loaded_strudel"
        );
    }

    #[test]
    fn test_request_id_accessor() {
        let err = ServerMessage::Error {
            message: "boom".into(),
            request_id: Some("r9".into()),
        };
        assert_eq!(err.request_id(), Some("r9"));
        assert_eq!(ServerMessage::Pong.request_id(), None);
    }

    #[test]
    fn test_draft_roundtrip_defaults() {
        let json = serde_json::json!({
            "id": "draft-1",
            "code": "s(\"bd\")",
            "updated_at": 42,
        });
        let draft: Draft = serde_json::from_value(json).unwrap();
        assert!(draft.conversation_history.is_empty());
        assert!(draft.title.is_none());
        assert!(draft.forked_from_id.is_none());
    }
}

//! Per-session transcript state
//!
//! A [`SessionSlice`] is everything the engine knows about one logical
//! session: its committed transcript, the tool calls of finished turns, the
//! current checklist and the transient state of the turn in progress.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::tool_call::{ToolCall, ToolCallSet};
use super::todo::Todo;

/// Logical session identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Wrap a session id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow as str
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Author of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Human input
    User,
    /// Agent output
    Assistant,
    /// Engine or service notice (errors)
    System,
}

impl Role {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// How a turn ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnEnd {
    /// `done` received
    Completed,
    /// The service reported an error
    Failed,
    /// The user cancelled
    Cancelled,
    /// The stream died before a terminal event
    Interrupted,
}

/// Token counters of a turn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCounts {
    /// Prompt tokens
    pub input: u64,
    /// Completion tokens
    pub output: u64,
    /// Prompt tokens served from cache
    pub cache_read: u64,
}

/// Statistics reported by the `result` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnStats {
    /// Cost in USD
    pub cost_usd: f64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Agent turns taken
    pub turns: u32,
    /// Token counters
    pub tokens: TokenCounts,
}

/// One committed transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Stable message id
    pub id: String,
    /// Author
    pub role: Role,
    /// Display text
    pub content: String,
    /// Tool calls made while producing this message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Turn statistics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<TurnStats>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// How the turn that produced this message ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<TurnEnd>,
}

/// Transient state of the turn in progress. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnState {
    /// A turn is live on this slice
    pub live: bool,
    /// Accumulated text deltas, replaced by the `result` text
    pub text: String,
    /// Tool calls of this turn
    pub tool_calls: ToolCallSet,
    /// Final text from the `result` event
    pub final_text: Option<String>,
    /// Statistics from the `result` event
    pub stats: Option<TurnStats>,
}

impl TurnState {
    /// Whether anything worth keeping has accumulated
    pub fn has_content(&self) -> bool {
        !self.text.is_empty()
            || self.final_text.as_deref().is_some_and(|text| !text.is_empty())
            || !self.tool_calls.is_empty()
    }
}

/// State of one logical session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSlice {
    /// Owning session
    pub session_id: SessionId,
    /// Committed transcript, in order
    #[serde(default)]
    pub messages: Vec<Message>,
    /// Tool calls of finished turns, in order
    #[serde(default)]
    pub tool_call_history: Vec<ToolCall>,
    /// Current checklist
    #[serde(default)]
    pub todos: Vec<Todo>,
    /// Id reserved for the assistant message being streamed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_message_id: Option<String>,
    /// A stream is bound and live
    #[serde(default)]
    pub is_streaming: bool,
    /// How the most recent turn ended
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_turn: Option<TurnEnd>,
    /// Agent-side session id used to resume the conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    /// Turn in progress
    #[serde(skip)]
    pub turn: TurnState,
}

impl SessionSlice {
    /// Empty slice for `session_id`
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            messages: Vec::new(),
            tool_call_history: Vec::new(),
            todos: Vec::new(),
            streaming_message_id: None,
            is_streaming: false,
            last_turn: None,
            agent_session_id: None,
            turn: TurnState::default(),
        }
    }

    /// Slice as it should look after a restart: nothing is live.
    pub fn into_restored(mut self) -> Self {
        self.is_streaming = false;
        self.streaming_message_id = None;
        self.turn = TurnState::default();
        self
    }

    /// Tool calls of the live turn
    pub fn live_tool_calls(&self) -> &[ToolCall] {
        self.turn.tool_calls.calls()
    }

    /// Text the live turn would commit right now
    pub fn live_text(&self) -> &str {
        match self.turn.final_text.as_deref() {
            Some(text) if !text.is_empty() => text,
            _ => &self.turn.text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_turn_is_not_persisted() {
        let mut slice = SessionSlice::new(SessionId::new("s1"));
        slice.is_streaming = true;
        slice.turn.live = true;
        slice.turn.text.push_str("partial");

        let json = serde_json::to_string(&slice).unwrap();
        assert!(!json.contains("partial"));

        let restored: SessionSlice = serde_json::from_str(&json).unwrap();
        let restored = restored.into_restored();
        assert!(!restored.is_streaming);
        assert!(!restored.turn.live);
        assert_eq!(restored.session_id.as_str(), "s1");
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 36);
    }

    #[test]
    fn live_text_prefers_final_text() {
        let mut slice = SessionSlice::new("s1".into());
        slice.turn.text.push_str("draft");
        assert_eq!(slice.live_text(), "draft");
        slice.turn.final_text = Some("final".into());
        assert_eq!(slice.live_text(), "final");
        slice.turn.final_text = Some(String::new());
        assert_eq!(slice.live_text(), "draft");
    }
}

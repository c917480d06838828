//! Inbound wire events
//!
//! One JSON object per frame, discriminated by its `type` field. Envelope
//! fields the engine does not use (`session_id`, `conversation_id` on most
//! frames) are ignored by the decoder.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single decoded stream event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The service accepted the request and the stream is live.
    Connected {
        /// Session the service bound the stream to
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Agent system message (init, hooks, ...).
    System {
        /// System message subtype (e.g. `init`)
        subtype: String,
        /// Opaque payload
        #[serde(default)]
        data: Value,
    },

    /// Incremental assistant text.
    TextDelta {
        /// Text fragment
        #[serde(alias = "text")]
        content: String,
    },

    /// A content block opened; names the tool when it is a tool block.
    #[serde(rename = "content_block_start")]
    BlockStart {
        /// Kind of block
        block_type: BlockType,
        /// Upstream block index
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<u64>,
        /// Tool identity for `tool_use` blocks
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<ToolRef>,
    },

    /// Partial JSON text of the tool input currently being built.
    ToolInputDelta {
        /// Raw fragment, not parseable on its own
        partial_json: String,
    },

    /// The complete tool invocation.
    ToolUse {
        /// Tool identity and full input
        tool: ToolInvocation,
    },

    /// Result of a tool invocation.
    ToolResult {
        /// Id of the invocation this result belongs to
        tool_use_id: String,
        /// Result payload (string or list of content blocks)
        #[serde(default)]
        content: Value,
        /// Whether the tool reported a failure
        #[serde(default)]
        is_error: bool,
    },

    /// Turn summary carrying the authoritative final text and statistics.
    Result {
        /// Summary payload
        data: ResultPayload,
    },

    /// The turn completed.
    Done {
        /// Conversation record id assigned by the service
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        /// Agent-side session id usable for `resume`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        claude_session_id: Option<String>,
    },

    /// The service reported a failure for this turn.
    Error {
        /// Error text
        #[serde(alias = "error")]
        message: String,
        /// Error class or extra detail
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
        /// Suggested user action
        #[serde(default, skip_serializing_if = "Option::is_none")]
        suggestion: Option<String>,
    },

    /// Raw upstream envelope forwarded verbatim (message_start, block stop, ...).
    #[serde(rename = "stream_event")]
    Upstream {
        /// Upstream event name
        event_type: String,
        /// Upstream payload
        #[serde(default)]
        data: Value,
    },
}

impl StreamEvent {
    /// Whether this event ends the turn on its stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    /// Wire name of the event, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Connected { .. } => "connected",
            StreamEvent::System { .. } => "system",
            StreamEvent::TextDelta { .. } => "text_delta",
            StreamEvent::BlockStart { .. } => "content_block_start",
            StreamEvent::ToolInputDelta { .. } => "tool_input_delta",
            StreamEvent::ToolUse { .. } => "tool_use",
            StreamEvent::ToolResult { .. } => "tool_result",
            StreamEvent::Result { .. } => "result",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Upstream { .. } => "stream_event",
        }
    }
}

/// Content block kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    /// Assistant text
    Text,
    /// Tool invocation
    ToolUse,
    /// Anything else (thinking, server tools, ...)
    #[serde(other)]
    Other,
}

/// Tool identity announced when a tool block opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolRef {
    /// Invocation id assigned by the agent
    pub id: String,
    /// Tool name
    pub name: String,
}

/// Fully formed tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Invocation id assigned by the agent
    pub id: String,
    /// Tool name
    pub name: String,
    /// Complete input object
    #[serde(default)]
    pub input: Value,
}

/// Payload of the `result` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    /// Result subtype (`success`, `error_max_turns`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Whether the agent considers the turn failed
    #[serde(default)]
    pub is_error: bool,
    /// Wall-clock duration of the turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Cost reported by the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    /// Number of agent turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    /// Token usage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Authoritative final text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Token usage block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion tokens
    #[serde(default)]
    pub output_tokens: u64,
    /// Prompt tokens served from cache
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

/// Render a tool result payload as display text.
///
/// Strings pass through, content-block lists are flattened to their text,
/// anything else is rendered as compact JSON.
pub fn tool_result_text(content: &Value) -> String {
    match content {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Array(blocks) => {
            let texts: Vec<String> = blocks
                .iter()
                .map(|block| match block {
                    Value::String(text) => text.clone(),
                    Value::Object(map) => match map.get("text") {
                        Some(Value::String(text)) => text.clone(),
                        _ => block.to_string(),
                    },
                    other => other.to_string(),
                })
                .collect();
            texts.join("\n")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_wire_frames() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"text_delta","content":"Hi","session_id":"s1","conversation_id":"c1"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::TextDelta {
                content: "Hi".into()
            }
        );

        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"content_block_start","block_type":"tool_use","index":1,"tool":{"id":"t1","name":"Read"}}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::BlockStart {
                block_type: BlockType::ToolUse,
                index: Some(1),
                tool: Some(ToolRef {
                    id: "t1".into(),
                    name: "Read".into()
                }),
            }
        );
    }

    #[test]
    fn decodes_error_alias_and_unknown_block_type() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"error","error":"boom","detail":"RuntimeError","suggestion":"retry"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            StreamEvent::Error {
                message: "boom".into(),
                detail: Some("RuntimeError".into()),
                suggestion: Some("retry".into()),
            }
        );

        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"content_block_start","block_type":"thinking"}"#)
                .unwrap();
        assert!(matches!(
            event,
            StreamEvent::BlockStart {
                block_type: BlockType::Other,
                ..
            }
        ));
    }

    #[test]
    fn result_tolerates_null_fields() {
        let event: StreamEvent = serde_json::from_str(
            r#"{"type":"result","data":{"subtype":"success","is_error":false,"duration_ms":1200,"total_cost_usd":null,"num_turns":2,"usage":null,"result":"Done."}}"#,
        )
        .unwrap();
        match event {
            StreamEvent::Result { data } => {
                assert_eq!(data.duration_ms, Some(1200));
                assert_eq!(data.total_cost_usd, None);
                assert_eq!(data.result.as_deref(), Some("Done."));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn flattens_content_blocks() {
        let content = json!([{"type": "text", "text": "line one"}, {"type": "text", "text": "line two"}]);
        assert_eq!(tool_result_text(&content), "line one\nline two");
        assert_eq!(tool_result_text(&json!("plain")), "plain");
        assert_eq!(tool_result_text(&json!({"ok": true})), r#"{"ok":true}"#);
    }
}

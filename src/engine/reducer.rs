//! Transcript reducer
//!
//! A left fold of stream events over a [`SessionSlice`]. The reducer holds no
//! per-session state of its own: everything it needs between events lives in
//! the slice's [`TurnState`](super::slice::TurnState), so folding the same
//! events over the same slice always yields the same transcript.

use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::sync::Arc;

use super::event::{BlockType, ResultPayload, StreamEvent, tool_result_text};
use super::slice::{Message, Role, SessionSlice, TokenCounts, TurnEnd, TurnStats};
use super::todo::TodoProjector;
use super::tool_call::{Anomaly, Transition};

/// Content of a finished assistant message that produced nothing
pub const EMPTY_CONTENT_MARKER: &str = "(No content)";

/// Source of message timestamps
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant, for replay and tests
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    /// Clock frozen at the Unix epoch
    pub fn epoch() -> Self {
        Self(Utc.timestamp_opt(0, 0).single().unwrap_or_default())
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// What one step of the fold did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reduction {
    /// The slice changed
    pub changed: bool,
    /// The step ended the turn
    pub ended: Option<TurnEnd>,
    /// A tool-call transition was refused
    pub anomaly: Option<Anomaly>,
}

impl Reduction {
    fn unchanged() -> Self {
        Self::default()
    }

    fn changed() -> Self {
        Self {
            changed: true,
            ..Self::default()
        }
    }

    fn ended(end: TurnEnd) -> Self {
        Self {
            changed: true,
            ended: Some(end),
            anomaly: None,
        }
    }
}

/// Folds stream events into session slices
#[derive(Debug, Clone)]
pub struct TranscriptReducer {
    projector: TodoProjector,
    clock: Arc<dyn Clock>,
}

impl TranscriptReducer {
    /// Reducer with the wall clock
    pub fn new(projector: TodoProjector) -> Self {
        Self::with_clock(projector, Arc::new(SystemClock))
    }

    /// Reducer with an explicit clock
    pub fn with_clock(projector: TodoProjector, clock: Arc<dyn Clock>) -> Self {
        Self { projector, clock }
    }

    /// Projector used to refresh the checklist
    pub fn projector(&self) -> &TodoProjector {
        &self.projector
    }

    /// Start a turn, recording the user's message when there is one.
    ///
    /// A turn still live on the slice is closed as interrupted first.
    pub fn begin_turn(&self, slice: &mut SessionSlice, user_text: Option<&str>) -> Reduction {
        if slice.turn.live {
            self.finish(slice, TurnEnd::Interrupted, None);
        }
        if let Some(text) = user_text {
            let message = self.message(slice, Role::User, text.to_string(), TurnEnd::Completed);
            slice.messages.push(Message {
                end: None,
                ..message
            });
        }
        self.start(slice);
        Reduction::changed()
    }

    /// Fold one event into the slice.
    pub fn apply(&self, slice: &mut SessionSlice, event: &StreamEvent) -> Reduction {
        tracing::trace!(session = %slice.session_id, event = event.kind(), "Applying event");

        if !slice.turn.live && !event.is_terminal() && !matches!(event, StreamEvent::Upstream { .. }) {
            self.start(slice);
        }

        match event {
            StreamEvent::Connected { .. } => Reduction::changed(),

            StreamEvent::System { subtype, data } => {
                let agent_session = data.get("session_id").and_then(|value| value.as_str());
                match agent_session {
                    Some(id) if subtype == "init" => {
                        slice.agent_session_id = Some(id.to_string());
                        Reduction::changed()
                    }
                    _ => Reduction::unchanged(),
                }
            }

            StreamEvent::TextDelta { content } => {
                slice.turn.text.push_str(content);
                Reduction::changed()
            }

            StreamEvent::BlockStart {
                block_type: BlockType::ToolUse,
                tool: Some(tool),
                ..
            } => {
                let outcome = slice.turn.tool_calls.open(&tool.id, &tool.name);
                self.tool_step(slice, outcome)
            }
            StreamEvent::BlockStart { .. } => Reduction::unchanged(),

            StreamEvent::ToolInputDelta { partial_json } => {
                let outcome = slice.turn.tool_calls.append_input(partial_json);
                self.tool_step(slice, outcome)
            }

            StreamEvent::ToolUse { tool } => {
                let outcome = slice
                    .turn
                    .tool_calls
                    .execute(&tool.id, &tool.name, tool.input.clone());
                self.tool_step(slice, outcome)
            }

            StreamEvent::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let outcome =
                    slice
                        .turn
                        .tool_calls
                        .complete(tool_use_id, tool_result_text(content), *is_error);
                self.tool_step(slice, outcome)
            }

            StreamEvent::Result { data } => {
                slice.turn.stats = Some(stats_of(data));
                if let Some(text) = data.result.as_deref().filter(|text| !text.is_empty()) {
                    slice.turn.text = text.to_string();
                    slice.turn.final_text = Some(text.to_string());
                }
                Reduction::changed()
            }

            StreamEvent::Done {
                conversation_id,
                claude_session_id,
            } => {
                if let Some(id) = claude_session_id {
                    slice.agent_session_id = Some(id.clone());
                }
                if !slice.turn.live {
                    tracing::warn!(session = %slice.session_id, "Dropping done with no live turn");
                    return Reduction::unchanged();
                }
                self.finish(slice, TurnEnd::Completed, conversation_id.clone());
                Reduction::ended(TurnEnd::Completed)
            }

            StreamEvent::Error {
                message,
                detail,
                suggestion,
            } => {
                tracing::warn!(
                    session = %slice.session_id,
                    detail = detail.as_deref().unwrap_or(""),
                    "Turn failed: {}", message
                );
                self.finish(slice, TurnEnd::Failed, None);
                let content = match suggestion {
                    Some(hint) if !hint.is_empty() => format!("{message}\n\n{hint}"),
                    _ => message.clone(),
                };
                let notice = self.message(slice, Role::System, content, TurnEnd::Failed);
                slice.messages.push(notice);
                Reduction::ended(TurnEnd::Failed)
            }

            StreamEvent::Upstream { .. } => Reduction::unchanged(),
        }
    }

    /// The user abandoned the turn.
    pub fn cancel(&self, slice: &mut SessionSlice) -> Reduction {
        if !slice.turn.live {
            return Reduction::unchanged();
        }
        self.finish(slice, TurnEnd::Cancelled, None);
        Reduction::ended(TurnEnd::Cancelled)
    }

    /// The stream died before a terminal event.
    pub fn interrupt(&self, slice: &mut SessionSlice, reason: &str) -> Reduction {
        if !slice.turn.live {
            return Reduction::unchanged();
        }
        tracing::warn!(session = %slice.session_id, "Turn interrupted: {}", reason);
        self.finish(slice, TurnEnd::Interrupted, None);
        Reduction::ended(TurnEnd::Interrupted)
    }

    /// Recompute the checklist from the slice's tool calls.
    pub fn refresh_todos(&self, slice: &mut SessionSlice) {
        slice.todos = self
            .projector
            .project(&slice.tool_call_history, slice.turn.tool_calls.calls())
            .todos;
    }

    fn start(&self, slice: &mut SessionSlice) {
        slice.turn = Default::default();
        slice.turn.live = true;
        slice.is_streaming = true;
        slice.streaming_message_id = Some(message_id(
            &slice.session_id.0,
            slice.messages.len(),
            Role::Assistant,
        ));
    }

    fn tool_step(&self, slice: &mut SessionSlice, outcome: Transition) -> Reduction {
        match outcome {
            Ok(()) => {
                self.refresh_todos(slice);
                Reduction::changed()
            }
            Err(anomaly) => {
                tracing::warn!(session = %slice.session_id, ?anomaly, "Ignoring tool call event");
                Reduction {
                    anomaly: Some(anomaly),
                    ..Reduction::unchanged()
                }
            }
        }
    }

    /// Close the live turn and commit what it produced.
    fn finish(&self, slice: &mut SessionSlice, end: TurnEnd, record_id: Option<String>) {
        let mut turn = std::mem::take(&mut slice.turn);
        let reserved_id = slice.streaming_message_id.take();
        slice.is_streaming = false;
        slice.last_turn = Some(end);

        let keep = match end {
            TurnEnd::Completed | TurnEnd::Interrupted => true,
            TurnEnd::Failed | TurnEnd::Cancelled => turn.has_content(),
        };

        if keep {
            let content = match turn.final_text.take() {
                Some(text) if !text.is_empty() => text,
                _ if !turn.text.is_empty() => std::mem::take(&mut turn.text),
                _ => EMPTY_CONTENT_MARKER.to_string(),
            };
            let tool_calls = turn.tool_calls.take();

            let mut message = self.message(slice, Role::Assistant, content, end);
            let preferred = record_id.or(reserved_id);
            if let Some(id) = preferred {
                if !slice.messages.iter().any(|existing| existing.id == id) {
                    message.id = id;
                }
            }
            message.tool_calls = tool_calls.clone();
            message.stats = turn.stats.take();

            slice.tool_call_history.extend(tool_calls);
            slice.messages.push(message);
        } else {
            slice.tool_call_history.extend(turn.tool_calls.take());
        }

        self.refresh_todos(slice);
        tracing::debug!(session = %slice.session_id, ?end, messages = slice.messages.len(), "Turn finished");
    }

    fn message(&self, slice: &SessionSlice, role: Role, content: String, end: TurnEnd) -> Message {
        Message {
            id: message_id(&slice.session_id.0, slice.messages.len(), role),
            role,
            content,
            tool_calls: Vec::new(),
            stats: None,
            timestamp: self.clock.now(),
            end: Some(end),
        }
    }
}

impl Default for TranscriptReducer {
    fn default() -> Self {
        Self::new(TodoProjector::default())
    }
}

/// Deterministic id for the message at `index` of a session.
pub fn message_id(session_id: &str, index: usize, role: Role) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(session_id.as_bytes());
    hasher.update(&[0]);
    hasher.update(&(index as u64).to_le_bytes());
    hasher.update(role.as_str().as_bytes());
    let hex = hasher.finalize().to_hex();
    format!("msg-{}", &hex.as_str()[..24])
}

fn stats_of(data: &ResultPayload) -> TurnStats {
    let usage = data.usage.clone().unwrap_or_default();
    TurnStats {
        cost_usd: data.total_cost_usd.unwrap_or(0.0),
        duration_ms: data.duration_ms.unwrap_or(0),
        turns: data.num_turns.unwrap_or(0),
        tokens: TokenCounts {
            input: usage.input_tokens,
            output: usage.output_tokens,
            cache_read: usage.cache_read_input_tokens,
        },
    }
}

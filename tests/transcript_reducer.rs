//! Transcript folding over captured event streams

use proptest::prelude::*;
use relay_transcript::engine::framer::{Frame, frame_all};
use relay_transcript::engine::reducer::{FixedClock, TranscriptReducer};
use relay_transcript::engine::slice::{Role, SessionId, SessionSlice, TurnEnd};
use relay_transcript::engine::todo::{TodoProjector, TodoStatus};
use relay_transcript::engine::tool_call::ToolCallStatus;
use relay_transcript::StreamEvent;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

fn reducer() -> TranscriptReducer {
    TranscriptReducer::with_clock(TodoProjector::default(), Arc::new(FixedClock::epoch()))
}

fn sse(events: &[Value]) -> String {
    events
        .iter()
        .map(|event| format!("data: {}\n\n", event))
        .collect()
}

fn fold(capture: &str) -> SessionSlice {
    let reducer = reducer();
    let (frames, _) = frame_all([capture.as_bytes()]);
    let mut slice = SessionSlice::new(SessionId::new("s1"));
    for frame in frames {
        if let Frame::Event(event) = frame {
            reducer.apply(&mut slice, &event);
        }
    }
    slice
}

fn two_turn_capture() -> Vec<Value> {
    vec![
        json!({"type": "connected", "session_id": "s1"}),
        json!({"type": "system", "subtype": "init", "data": {"session_id": "agent-1"}}),
        json!({"type": "text_delta", "content": "Let me plan. "}),
        json!({"type": "content_block_start", "block_type": "tool_use", "index": 1, "tool": {"id": "t1", "name": "TodoWrite"}}),
        json!({"type": "tool_input_delta", "partial_json": "{\"todos\":"}),
        json!({"type": "tool_input_delta", "partial_json": "[]}"}),
        json!({"type": "tool_use", "tool": {"id": "t1", "name": "TodoWrite", "input": {"todos": [
            {"content": "Read code", "activeForm": "Reading code", "status": "in_progress"},
            {"content": "Write fix", "activeForm": "Writing fix", "status": "pending"}
        ]}}}),
        json!({"type": "tool_result", "tool_use_id": "t1", "content": [{"type": "text", "text": "Todos updated"}], "is_error": false}),
        json!({"type": "result", "data": {"subtype": "success", "is_error": false, "duration_ms": 900, "total_cost_usd": 0.01, "num_turns": 1, "result": "Planned."}}),
        json!({"type": "done", "conversation_id": "c1", "claude_session_id": "agent-1"}),
        json!({"type": "connected", "session_id": "s1"}),
        json!({"type": "content_block_start", "block_type": "tool_use", "tool": {"id": "t2", "name": "TodoWrite"}}),
        json!({"type": "tool_use", "tool": {"id": "t2", "name": "TodoWrite", "input": {"todos": [
            {"content": "Write fix", "activeForm": "Writing fix", "status": "completed"}
        ]}}}),
        json!({"type": "text_delta", "content": "Fixed."}),
        json!({"type": "done", "conversation_id": "c2"}),
    ]
}

#[test]
fn replay_is_deterministic() {
    let capture = sse(&two_turn_capture());
    let first = fold(&capture);
    let second = fold(&capture);
    assert_eq!(first, second);

    assert_eq!(first.messages.len(), 2);
    assert_eq!(first.messages[0].id, "c1");
    assert_eq!(first.messages[0].content, "Planned.");
    assert_eq!(first.messages[1].content, "Fixed.");
    assert_eq!(first.tool_call_history.len(), 2);
    assert_eq!(first.agent_session_id.as_deref(), Some("agent-1"));
}

#[test]
fn checklist_replaces_instead_of_merging() {
    let slice = fold(&sse(&two_turn_capture()));
    assert_eq!(slice.todos.len(), 1);
    assert_eq!(slice.todos[0].content, "Write fix");
    assert_eq!(slice.todos[0].status, TodoStatus::Completed);
}

#[test]
fn result_text_overrides_streamed_deltas() {
    let slice = fold(&sse(&[
        json!({"type": "text_delta", "content": "Thinking out loud"}),
        json!({"type": "result", "data": {"is_error": false, "result": "Concise answer"}}),
        json!({"type": "done"}),
    ]));
    assert_eq!(slice.messages.len(), 1);
    assert_eq!(slice.messages[0].content, "Concise answer");
    assert_eq!(slice.messages[0].end, Some(TurnEnd::Completed));
}

#[test]
fn malformed_frames_do_not_disturb_the_transcript() {
    let events = two_turn_capture();
    let clean = sse(&events);

    let mut noisy = String::new();
    for (i, event) in events.iter().enumerate() {
        noisy.push_str(&format!("data: {}\n\n", event));
        if i % 3 == 0 {
            noisy.push_str("data: {\"type\":\"text_delta\",\"content\":\n\n");
            noisy.push_str("data: {\"type\":\"hologram\"}\n\n");
            noisy.push_str(": keep-alive\n\nevent: ping\n\n");
        }
    }

    let (frames, stats) = frame_all([noisy.as_bytes()]);
    assert!(stats.parse_errors > 0);
    assert!(frames.iter().any(|frame| matches!(frame, Frame::ParseError { .. })));
    assert_eq!(fold(&noisy), fold(&clean));
}

#[test]
fn duplicate_done_in_capture_is_ignored() {
    let events = two_turn_capture();
    let mut doubled = Vec::new();
    for event in &events {
        doubled.push(event.clone());
        if event["type"] == "done" {
            doubled.push(event.clone());
        }
    }
    assert_eq!(fold(&sse(&doubled)), fold(&sse(&events)));
}

#[test]
fn empty_result_falls_back_to_deltas() {
    let slice = fold(&sse(&[
        json!({"type": "text_delta", "content": "Hello"}),
        json!({"type": "result", "data": {"is_error": false, "result": ""}}),
        json!({"type": "done"}),
    ]));
    assert_eq!(slice.messages.len(), 1);
    assert_eq!(slice.messages[0].content, "Hello");
}

#[test]
fn error_event_becomes_system_message() {
    let slice = fold(&sse(&[
        json!({"type": "text_delta", "content": "Working"}),
        json!({"type": "error", "error": "Agent crashed", "detail": "RuntimeError", "suggestion": "Restart the session"}),
    ]));
    assert_eq!(slice.messages.len(), 2);
    assert_eq!(slice.messages[0].role, Role::Assistant);
    assert_eq!(slice.messages[0].end, Some(TurnEnd::Failed));
    assert_eq!(slice.messages[1].role, Role::System);
    assert_eq!(slice.messages[1].content, "Agent crashed\n\nRestart the session");
    assert_eq!(slice.last_turn, Some(TurnEnd::Failed));
}

#[derive(Debug, Clone)]
enum ToolStep {
    Open(usize),
    Delta,
    Use(usize),
    Result(usize, bool),
}

fn tool_step() -> impl Strategy<Value = ToolStep> {
    prop_oneof![
        (0..3usize).prop_map(ToolStep::Open),
        Just(ToolStep::Delta),
        (0..3usize).prop_map(ToolStep::Use),
        (0..3usize, any::<bool>()).prop_map(|(id, failed)| ToolStep::Result(id, failed)),
    ]
}

fn to_event(step: &ToolStep) -> StreamEvent {
    let value = match step {
        ToolStep::Open(id) => json!({
            "type": "content_block_start",
            "block_type": "tool_use",
            "tool": {"id": format!("t{id}"), "name": "Bash"}
        }),
        ToolStep::Delta => json!({"type": "tool_input_delta", "partial_json": "{\"x\":1}"}),
        ToolStep::Use(id) => json!({
            "type": "tool_use",
            "tool": {"id": format!("t{id}"), "name": "Bash", "input": {"command": "ls"}}
        }),
        ToolStep::Result(id, failed) => json!({
            "type": "tool_result",
            "tool_use_id": format!("t{id}"),
            "content": "out",
            "is_error": failed
        }),
    };
    serde_json::from_value(value).unwrap()
}

proptest! {
    #[test]
    fn tool_call_status_never_regresses(steps in prop::collection::vec(tool_step(), 0..40)) {
        let reducer = reducer();
        let mut slice = SessionSlice::new(SessionId::new("s1"));
        let mut seen: HashMap<String, ToolCallStatus> = HashMap::new();

        for step in &steps {
            reducer.apply(&mut slice, &to_event(step));
            for call in slice.live_tool_calls() {
                if let Some(previous) = seen.insert(call.id.clone(), call.status) {
                    prop_assert!(call.status >= previous);
                }
                prop_assert_eq!(call.input_partial.is_some(), call.status == ToolCallStatus::Building);
            }
        }
    }
}

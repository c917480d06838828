//! Session isolation, stream binding and persistence

use parking_lot::Mutex;
use relay_transcript::engine::reducer::{FixedClock, TranscriptReducer};
use relay_transcript::engine::session::{PersistPolicy, SessionManager, SliceChange};
use relay_transcript::engine::slice::{SessionId, TurnEnd};
use relay_transcript::engine::storage::{FileSliceStore, MemorySliceStore, SliceStore};
use relay_transcript::engine::todo::TodoProjector;
use relay_transcript::engine::transport::HistoryMessage;
use relay_transcript::StreamEvent;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn manager_with(store: Arc<dyn SliceStore>, persist: PersistPolicy) -> SessionManager {
    let reducer = TranscriptReducer::with_clock(TodoProjector::default(), Arc::new(FixedClock::epoch()));
    SessionManager::new(store, reducer, persist)
}

fn event(value: serde_json::Value) -> StreamEvent {
    serde_json::from_value(value).unwrap()
}

fn delta(text: &str) -> StreamEvent {
    event(json!({"type": "text_delta", "content": text}))
}

fn done() -> StreamEvent {
    event(json!({"type": "done"}))
}

fn todo_write(id: &str, content: &str) -> StreamEvent {
    event(json!({"type": "tool_use", "tool": {"id": id, "name": "TodoWrite", "input": {"todos": [
        {"content": content, "activeForm": content, "status": "pending"}
    ]}}}))
}

#[test]
fn switching_sessions_round_trips_state() {
    let store = Arc::new(MemorySliceStore::new());
    let manager = manager_with(store, PersistPolicy::EveryMutation);
    let a = SessionId::new("a");
    let b = SessionId::new("b");

    let binding = manager.activate(&a).bind();
    binding.begin(Some("first"));
    binding.apply(&todo_write("t1", "Task for A"));
    binding.apply(&delta("answer A"));
    binding.apply(&done());
    drop(binding);
    let a_before = manager.slice(&a).unwrap().snapshot();

    let binding = manager.activate(&b).bind();
    binding.begin(Some("second"));
    binding.apply(&delta("answer B"));
    binding.apply(&done());
    drop(binding);

    let a_after = manager.activate(&a).snapshot();
    assert_eq!(a_after, a_before);
    assert_eq!(a_after.todos[0].content, "Task for A");

    let b_slice = manager.slice(&b).unwrap().snapshot();
    assert!(b_slice.todos.is_empty());
    assert_eq!(b_slice.messages[1].content, "answer B");
}

#[test]
fn events_follow_the_binding_not_the_active_session() {
    let manager = manager_with(Arc::new(MemorySliceStore::new()), PersistPolicy::EveryMutation);
    let a = SessionId::new("a");
    let b = SessionId::new("b");

    let stream_a = manager.activate(&a).bind();
    stream_a.begin(Some("question"));
    stream_a.apply(&delta("partial "));

    manager.activate(&b);
    stream_a.apply(&delta("rest"));
    stream_a.apply(&done());

    let a_slice = manager.slice(&a).unwrap().snapshot();
    assert_eq!(a_slice.messages.last().unwrap().content, "partial rest");
    assert!(!a_slice.is_streaming);

    let b_slice = manager.current_slice().unwrap().snapshot();
    assert_eq!(b_slice.session_id, b);
    assert!(b_slice.messages.is_empty());
    assert!(!b_slice.is_streaming);
}

#[test]
fn new_stream_supersedes_old_one() {
    let manager = manager_with(Arc::new(MemorySliceStore::new()), PersistPolicy::EveryMutation);
    let a = SessionId::new("a");

    let old = manager.bind(&a);
    old.begin(Some("one"));
    old.apply(&delta("stale"));

    let new = manager.bind(&a);
    assert!(old.token().is_cancelled());
    new.begin(Some("two"));
    assert!(old.apply(&delta(" more")).is_none());
    assert!(old.cancel().is_none());
    new.apply(&delta("fresh"));
    new.apply(&done());

    let slice = new.snapshot();
    let ends: Vec<Option<TurnEnd>> = slice.messages.iter().map(|message| message.end).collect();
    assert_eq!(ends, vec![None, Some(TurnEnd::Interrupted), None, Some(TurnEnd::Completed)]);
    assert_eq!(slice.messages[1].content, "stale");
    assert_eq!(slice.messages[3].content, "fresh");
}

#[test]
fn slices_survive_restart() {
    let temp = TempDir::new().unwrap();
    let a = SessionId::new("a");
    {
        let store = Arc::new(FileSliceStore::open(temp.path()).unwrap());
        let manager = manager_with(store, PersistPolicy::EveryMutation);
        let binding = manager.activate(&a).bind();
        binding.begin(Some("remember me"));
        binding.apply(&todo_write("t1", "Persisted task"));
        binding.apply(&delta("half-done"));
    }

    let store = Arc::new(FileSliceStore::open(temp.path()).unwrap());
    let manager = manager_with(store, PersistPolicy::EveryMutation);
    let handle = manager.restore_active().unwrap();
    let slice = handle.snapshot();

    assert_eq!(handle.id(), &a);
    assert_eq!(slice.messages[0].content, "remember me");
    assert_eq!(slice.todos[0].content, "Persisted task");
    assert!(!slice.is_streaming);
    assert!(!slice.turn.live);
}

#[test]
fn turn_boundary_policy_defers_writes() {
    let store = Arc::new(MemorySliceStore::new());
    let manager = manager_with(store.clone(), PersistPolicy::TurnBoundaries);
    let a = SessionId::new("a");

    let binding = manager.bind(&a);
    binding.begin(Some("go"));
    binding.apply(&todo_write("t1", "Later"));
    assert!(store.load(&a).unwrap().unwrap().todos.is_empty());

    binding.apply(&done());
    assert_eq!(store.load(&a).unwrap().unwrap().todos[0].content, "Later");
}

#[test]
fn eviction_orphans_a_draining_stream() {
    let store = Arc::new(MemorySliceStore::new());
    let manager = manager_with(store.clone(), PersistPolicy::EveryMutation);
    let a = SessionId::new("a");

    let binding = manager.activate(&a).bind();
    binding.begin(Some("doomed"));
    assert!(store.contains(&a));

    assert!(manager.evict(&a));
    assert!(binding.token().is_cancelled());
    assert!(!store.contains(&a));
    assert_eq!(manager.active_id(), None);

    assert!(binding.apply(&delta("late")).is_some());
    binding.apply(&done());
    assert!(!store.contains(&a));
    assert_eq!(binding.snapshot().messages.last().unwrap().content, "late");

    let fresh = manager.activate(&a).snapshot();
    assert!(fresh.messages.is_empty());
}

#[test]
fn observers_see_every_change() {
    let manager = manager_with(Arc::new(MemorySliceStore::new()), PersistPolicy::EveryMutation);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    manager.subscribe(Arc::new(move |change: &SliceChange| {
        sink.lock().push(change.clone());
    }));

    let a = SessionId::new("a");
    let b = SessionId::new("b");
    manager.activate(&a);
    let stream_b = manager.bind(&b);
    stream_b.apply(&delta("x"));
    manager.evict(&b);

    let seen = seen.lock();
    assert_eq!(
        seen[0],
        SliceChange::Activated {
            session_id: a.clone(),
            previous: None
        }
    );
    assert_eq!(
        seen[1],
        SliceChange::Mutated {
            session_id: b.clone(),
            active: false
        }
    );
    assert_eq!(seen[2], SliceChange::Evicted { session_id: b });
    assert_eq!(seen.len(), 3);
}

#[test]
fn hydration_rebuilds_tool_history_and_todos() {
    let manager = manager_with(Arc::new(MemorySliceStore::new()), PersistPolicy::EveryMutation);
    let a = SessionId::new("a");
    let history: Vec<HistoryMessage> = serde_json::from_value(json!([
        {"id": "c1-user", "role": "user", "content": "plan it", "timestamp": "2025-01-01T00:00:00"},
        {"id": "c1-assistant", "role": "assistant", "content": "planned", "timestamp": "2025-01-01T00:00:05",
         "tool_calls": [{"id": "t1", "name": "TodoWrite", "input": {"todos": [
            {"content": "Ship", "activeForm": "Shipping", "status": "in_progress"}
         ]}, "result": "ok", "is_error": false}]}
    ]))
    .unwrap();

    assert!(manager.hydrate(&a, history.clone()));
    let slice = manager.slice(&a).unwrap().snapshot();
    assert_eq!(slice.messages.len(), 2);
    assert_eq!(slice.tool_call_history.len(), 1);
    assert_eq!(slice.todos[0].content, "Ship");

    let binding = manager.bind(&a);
    binding.begin(Some("more"));
    assert!(!manager.hydrate(&a, history));
}

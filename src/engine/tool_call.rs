//! Tool invocation lifecycle
//!
//! A tool call moves strictly forward through
//! `building -> executing -> success | failed`. Identity is always the id
//! supplied by the agent; the only positional rule is that an input delta,
//! which carries no id on the wire, belongs to the most recently opened call
//! that is still building.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lifecycle state of a tool call. Ordering follows the lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Input is still streaming in
    Building,
    /// Input is complete, the tool is running
    Executing,
    /// The tool returned a result
    Success,
    /// The tool reported an error
    Failed,
}

impl ToolCallStatus {
    /// Whether the call has reached a final state
    pub fn is_terminal(self) -> bool {
        matches!(self, ToolCallStatus::Success | ToolCallStatus::Failed)
    }
}

/// One tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Invocation id assigned by the agent
    pub id: String,
    /// Tool name
    pub name: String,
    /// Lifecycle state
    pub status: ToolCallStatus,
    /// Complete input; meaningful once the call is executing
    #[serde(default = "empty_object")]
    pub input: Value,
    /// Raw accumulating input text; present only while building
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_partial: Option<String>,
    /// Result text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Whether the result is an error
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ToolCall {
    /// A call that has just been announced
    pub fn building(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: ToolCallStatus::Building,
            input: empty_object(),
            input_partial: Some(String::new()),
            result: None,
            is_error: None,
        }
    }

    fn promote(&mut self, input: Value) {
        self.input = input;
        self.input_partial = None;
        self.status = ToolCallStatus::Executing;
    }
}

/// Transition that was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Anomaly {
    /// A block start repeated an id that is already tracked
    DuplicateBlock {
        /// Tool call id
        id: String,
    },
    /// An input delta arrived with no call in `building`
    NoBuildingCall,
    /// A result referenced an id this turn never saw
    UnknownToolId {
        /// Tool call id
        id: String,
    },
    /// The event would move a call backwards or repeat a transition
    StaleTransition {
        /// Tool call id
        id: String,
        /// State the call is in
        status: ToolCallStatus,
    },
}

/// Outcome of feeding one event to the set.
pub type Transition = Result<(), Anomaly>;

/// Ordered set of the tool calls of one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallSet {
    calls: Vec<ToolCall>,
}

impl ToolCallSet {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a call in `building`.
    pub fn open(&mut self, id: &str, name: &str) -> Transition {
        if self.get(id).is_some() {
            return Err(Anomaly::DuplicateBlock { id: id.to_string() });
        }
        self.calls.push(ToolCall::building(id, name));
        Ok(())
    }

    /// Append a raw input fragment to the most recent building call.
    pub fn append_input(&mut self, fragment: &str) -> Transition {
        let call = self
            .calls
            .iter_mut()
            .rev()
            .find(|call| call.status == ToolCallStatus::Building)
            .ok_or(Anomaly::NoBuildingCall)?;
        call.input_partial
            .get_or_insert_with(String::new)
            .push_str(fragment);
        Ok(())
    }

    /// Record the complete input: `building -> executing`.
    ///
    /// An id never announced by a block start enters directly in `executing`.
    pub fn execute(&mut self, id: &str, name: &str, input: Value) -> Transition {
        match self.get_mut(id) {
            Some(call) if call.status == ToolCallStatus::Building => {
                if call.name.is_empty() {
                    call.name = name.to_string();
                }
                call.promote(input);
                Ok(())
            }
            Some(call) => Err(Anomaly::StaleTransition {
                id: id.to_string(),
                status: call.status,
            }),
            None => {
                let mut call = ToolCall::building(id, name);
                call.promote(input);
                self.calls.push(call);
                Ok(())
            }
        }
    }

    /// Record the result: `executing -> success | failed`.
    ///
    /// A call still building is promoted first, using its partial text as
    /// input when that text is valid JSON.
    pub fn complete(&mut self, id: &str, result: String, is_error: bool) -> Transition {
        let call = self.get_mut(id).ok_or_else(|| Anomaly::UnknownToolId {
            id: id.to_string(),
        })?;

        if call.status.is_terminal() {
            return Err(Anomaly::StaleTransition {
                id: id.to_string(),
                status: call.status,
            });
        }
        if call.status == ToolCallStatus::Building {
            let input = call
                .input_partial
                .as_deref()
                .and_then(|text| serde_json::from_str::<Value>(text).ok())
                .unwrap_or_else(empty_object);
            call.promote(input);
        }

        call.result = Some(result);
        call.is_error = Some(is_error);
        call.status = if is_error {
            ToolCallStatus::Failed
        } else {
            ToolCallStatus::Success
        };
        Ok(())
    }

    /// Look up a call by id
    pub fn get(&self, id: &str) -> Option<&ToolCall> {
        self.calls.iter().find(|call| call.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ToolCall> {
        self.calls.iter_mut().find(|call| call.id == id)
    }

    /// Calls in the order they were opened
    pub fn calls(&self) -> &[ToolCall] {
        &self.calls
    }

    /// Number of tracked calls
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no call is tracked
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drain every call, leaving the set empty
    pub fn take(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn full_lifecycle() {
        let mut set = ToolCallSet::new();
        set.open("t1", "Read").unwrap();
        set.append_input("{\"path\":").unwrap();
        set.append_input("\"a.rs\"}").unwrap();
        assert_eq!(
            set.get("t1").unwrap().input_partial.as_deref(),
            Some("{\"path\":\"a.rs\"}")
        );

        set.execute("t1", "Read", json!({"path": "a.rs"})).unwrap();
        let call = set.get("t1").unwrap();
        assert_eq!(call.status, ToolCallStatus::Executing);
        assert_eq!(call.input_partial, None);

        set.complete("t1", "fn main() {}".into(), false).unwrap();
        let call = set.get("t1").unwrap();
        assert_eq!(call.status, ToolCallStatus::Success);
        assert_eq!(call.result.as_deref(), Some("fn main() {}"));
    }

    #[test]
    fn deltas_go_to_most_recent_building_call() {
        let mut set = ToolCallSet::new();
        set.open("t1", "Read").unwrap();
        set.open("t2", "Grep").unwrap();
        set.execute("t2", "Grep", json!({})).unwrap();
        set.append_input("{}").unwrap();
        assert_eq!(set.get("t1").unwrap().input_partial.as_deref(), Some("{}"));
    }

    #[test]
    fn never_moves_backwards() {
        let mut set = ToolCallSet::new();
        set.open("t1", "Bash").unwrap();
        set.execute("t1", "Bash", json!({"command": "ls"})).unwrap();
        set.complete("t1", "denied".into(), true).unwrap();

        assert_eq!(
            set.execute("t1", "Bash", json!({})),
            Err(Anomaly::StaleTransition {
                id: "t1".into(),
                status: ToolCallStatus::Failed
            })
        );
        assert!(set.complete("t1", "ok".into(), false).is_err());
        assert_eq!(set.open("t1", "Bash"), Err(Anomaly::DuplicateBlock { id: "t1".into() }));
        assert_eq!(set.append_input("x"), Err(Anomaly::NoBuildingCall));
        assert_eq!(set.get("t1").unwrap().status, ToolCallStatus::Failed);
    }

    #[test]
    fn unknown_result_is_reported() {
        let mut set = ToolCallSet::new();
        assert_eq!(
            set.complete("ghost", "x".into(), false),
            Err(Anomaly::UnknownToolId { id: "ghost".into() })
        );
        assert!(set.is_empty());
    }

    #[test]
    fn result_for_building_call_passes_through_executing() {
        let mut set = ToolCallSet::new();
        set.open("t1", "Write").unwrap();
        set.append_input("{\"path\":\"x\"}").unwrap();
        set.complete("t1", "written".into(), false).unwrap();
        let call = set.get("t1").unwrap();
        assert_eq!(call.status, ToolCallStatus::Success);
        assert_eq!(call.input, json!({"path": "x"}));
        assert_eq!(call.input_partial, None);
    }
}

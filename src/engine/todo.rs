//! Checklist projection
//!
//! The checklist is never edited directly. It is derived from tool calls: the
//! most recent qualifying call to the checklist-writing tool replaces the list
//! wholesale, and calls of the live turn win over finished history.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use super::registry::ToolRegistry;
use super::tool_call::{ToolCall, ToolCallStatus};

/// Checklist item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    /// Not started
    Pending,
    /// Being worked on
    InProgress,
    /// Done
    Completed,
}

/// One checklist item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    /// Imperative description
    pub content: String,
    /// Progressive description shown while in progress
    #[serde(rename = "activeForm", alias = "active_form")]
    pub active_form: String,
    /// Item status
    pub status: TodoStatus,
}

/// Derived checklist with counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TodoSnapshot {
    /// Items in the order the tool wrote them
    pub todos: Vec<Todo>,
    /// Items completed
    pub completed: usize,
    /// Items in progress
    pub in_progress: usize,
    /// Items pending
    pub pending: usize,
    /// Total items
    pub total: usize,
}

impl TodoSnapshot {
    /// Snapshot of `todos` with derived counters
    pub fn from_todos(todos: Vec<Todo>) -> Self {
        let count = |status| todos.iter().filter(|todo| todo.status == status).count();
        Self {
            completed: count(TodoStatus::Completed),
            in_progress: count(TodoStatus::InProgress),
            pending: count(TodoStatus::Pending),
            total: todos.len(),
            todos,
        }
    }

    /// Collapse the checklist into a single workflow stage.
    pub fn workflow_stage(&self) -> WorkflowStage {
        let status = if self.todos.is_empty() {
            TodoStatus::Pending
        } else if self.completed == self.total {
            TodoStatus::Completed
        } else {
            TodoStatus::InProgress
        };

        let tasks = self
            .todos
            .iter()
            .map(|todo| WorkflowTask {
                name: todo.content.clone(),
                description: (todo.active_form != todo.content).then(|| todo.active_form.clone()),
                status: todo.status,
            })
            .collect();

        WorkflowStage { status, tasks }
    }
}

/// Single-stage view of the checklist
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowStage {
    /// Stage status
    pub status: TodoStatus,
    /// One task per checklist item
    pub tasks: Vec<WorkflowTask>,
}

/// Task derived from a checklist item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkflowTask {
    /// Item content
    pub name: String,
    /// Progressive form, when it differs from the content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Item status
    pub status: TodoStatus,
}

/// Derives the checklist from tool calls
#[derive(Debug, Clone)]
pub struct TodoProjector {
    registry: Arc<ToolRegistry>,
}

impl TodoProjector {
    /// Projector using `registry` to recognise the checklist tool
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Registry in use
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Project the checklist from finished `history` and the `live` turn.
    pub fn project(&self, history: &[ToolCall], live: &[ToolCall]) -> TodoSnapshot {
        let todos = self
            .latest(live)
            .or_else(|| self.latest(history))
            .unwrap_or_default();
        TodoSnapshot::from_todos(todos)
    }

    fn latest(&self, calls: &[ToolCall]) -> Option<Vec<Todo>> {
        calls.iter().rev().find_map(|call| self.todos_of(call))
    }

    fn todos_of(&self, call: &ToolCall) -> Option<Vec<Todo>> {
        if call.status < ToolCallStatus::Executing || !self.registry.is_checklist(&call.name) {
            return None;
        }
        match call.input.get("todos") {
            Some(list @ Value::Array(_)) => match serde_json::from_value(list.clone()) {
                Ok(todos) => Some(todos),
                Err(err) => {
                    tracing::debug!(tool_call = %call.id, error = %err, "Ignoring malformed checklist");
                    None
                }
            },
            _ => None,
        }
    }
}

impl Default for TodoProjector {
    fn default() -> Self {
        Self::new(Arc::new(ToolRegistry::default()))
    }
}

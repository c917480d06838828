//! Tool registry
//!
//! Maps tool names to the role they play in the transcript. Built once by the
//! engine and shared by reference; there is no process-wide catalog.

use std::collections::HashMap;

/// Default checklist-writing tool
pub const DEFAULT_CHECKLIST_TOOL: &str = "TodoWrite";

/// Role of a tool in the transcript
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    /// Writes the session checklist; its input replaces the todo list
    Checklist,
    /// Any other tool
    Generic,
}

/// Registry of known tools
#[derive(Debug, Clone)]
pub struct ToolRegistry {
    kinds: HashMap<String, ToolKind>,
}

impl ToolRegistry {
    /// Empty registry; every tool is generic
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Registry with `name` as the checklist tool
    pub fn with_checklist_tool(name: impl Into<String>) -> Self {
        let mut registry = Self::empty();
        registry.register(name, ToolKind::Checklist);
        registry
    }

    /// Register or reclassify a tool
    pub fn register(&mut self, name: impl Into<String>, kind: ToolKind) {
        self.kinds.insert(name.into(), kind);
    }

    /// Kind of `name`
    pub fn kind(&self, name: &str) -> ToolKind {
        self.kinds.get(name).copied().unwrap_or(ToolKind::Generic)
    }

    /// Whether `name` writes the checklist
    pub fn is_checklist(&self, name: &str) -> bool {
        self.kind(name) == ToolKind::Checklist
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_checklist_tool(DEFAULT_CHECKLIST_TOOL)
    }
}

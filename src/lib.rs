//! Relay Transcript – a streaming transcript engine for agent sessions
//!
//! This crate consumes the live event stream of an AI agent's turn and
//! reconstructs a consistent, replayable transcript:
//! - Line framing of the event stream with partial-chunk buffering
//! - A forward-only state machine per tool invocation
//! - A pure reducer folding events into per-session transcripts
//! - Checklist projection from the agent's checklist-writing tool
//! - Session isolation with stream binding at subscription time

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Engine modules implementing the transcript pipeline
pub mod engine;

// Re-export key types for convenience
pub use engine::event::StreamEvent;
pub use engine::framer::{EventFramer, Frame, FramedStream, StreamOutcome};
pub use engine::reducer::TranscriptReducer;
pub use engine::runner::{TurnReport, TurnRunner};
pub use engine::session::{SessionManager, SliceChange, StreamBinding};
pub use engine::slice::{Message, Role, SessionId, SessionSlice, TurnEnd};
pub use engine::transport::{TurnOptions, TurnRequest};
pub use engine::{Engine, EngineConfig};

/// Current version of the engine
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Engine orchestrator and public API
//!
//! This module provides the main `Engine` struct that wires the tool
//! registry, reducer, session manager and turn runner together and exposes
//! the interface used by embedders and the CLI.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

// Submodules
pub mod error;
pub mod event;
pub mod framer;
pub mod reducer;
pub mod registry;
pub mod runner;
pub mod session;
pub mod slice;
pub mod storage;
pub mod todo;
pub mod tool_call;
pub mod transport;

use error::{EngineError, Result};
use registry::{DEFAULT_CHECKLIST_TOOL, ToolRegistry};
use reducer::{Clock, SystemClock, TranscriptReducer};
use runner::TurnRunner;
use session::{PersistPolicy, SessionManager};
use slice::SessionId;
use storage::{FileSliceStore, SliceStore};
use todo::TodoProjector;
use transport::{HttpTransport, RetryPolicy, Transport, TurnOptions};

/// Configuration for the transcript engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for engine storage (default: .relay/)
    pub root: PathBuf,

    /// Base URL of the agent service
    pub api_base_url: String,

    /// Name of the checklist-writing tool
    pub checklist_tool: String,

    /// Permission mode sent with every turn
    pub permission_mode: String,

    /// Backoff for opening streams
    pub retry: RetryPolicy,

    /// When slices are persisted
    pub persist: PersistPolicy,

    /// Enable debug tracing
    pub debug: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".relay"),
            api_base_url: "http://localhost:8000".to_string(),
            checklist_tool: DEFAULT_CHECKLIST_TOOL.to_string(),
            permission_mode: "acceptEdits".to_string(),
            retry: RetryPolicy::default(),
            persist: PersistPolicy::default(),
            debug: false,
        }
    }
}

impl EngineConfig {
    /// Check the settings the engine cannot run without.
    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://")) {
            return Err(EngineError::Config(format!(
                "api_base_url must be an http(s) URL, got {:?}",
                self.api_base_url
            )));
        }
        if self.checklist_tool.trim().is_empty() {
            return Err(EngineError::Config("checklist_tool must not be empty".into()));
        }
        Ok(())
    }
}

/// The main engine orchestrator
pub struct Engine {
    config: EngineConfig,
    registry: Arc<ToolRegistry>,
    sessions: SessionManager,
    runner: TurnRunner,
    http: Option<HttpTransport>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl Engine {
    /// Create an engine talking HTTP to `config.api_base_url`, persisting
    /// under `config.root`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let store = FileSliceStore::open(&config.root)?;
        let http = HttpTransport::new(config.api_base_url.clone());
        let mut engine = Self::with_parts(
            config,
            Arc::new(store),
            Arc::new(http.clone()),
            Arc::new(SystemClock),
        );
        engine.http = Some(http);
        Ok(engine)
    }

    /// Create an engine from explicit collaborators
    pub fn with_parts(
        config: EngineConfig,
        store: Arc<dyn SliceStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(ToolRegistry::with_checklist_tool(config.checklist_tool.clone()));
        let reducer = TranscriptReducer::with_clock(TodoProjector::new(registry.clone()), clock);
        let sessions = SessionManager::new(store, reducer, config.persist);
        let runner = TurnRunner::new(sessions.clone(), transport, config.retry).with_defaults(TurnOptions {
            permission_mode: Some(config.permission_mode.clone()),
            ..TurnOptions::default()
        });

        Self {
            config,
            registry,
            sessions,
            runner,
            http: None,
        }
    }

    /// Initialize engine storage directories and configuration
    pub fn init(config: EngineConfig) -> anyhow::Result<()> {
        config.validate()?;
        storage::init_storage(&config.root)?;
        storage::write_config(&config)?;
        Ok(())
    }

    /// Load an existing engine from storage
    pub fn load(root: PathBuf) -> anyhow::Result<Self> {
        let mut config = storage::load_config(&root)?;
        config.root = root;
        Ok(Self::new(config)?)
    }

    /// Get the current configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Get the tool registry
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Get the session manager
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Get the turn runner
    pub fn runner(&self) -> &TurnRunner {
        &self.runner
    }

    /// HTTP transport, when the engine talks to a live service
    pub fn http(&self) -> Option<&HttpTransport> {
        self.http.as_ref()
    }

    /// Replace a session's transcript with the service's stored history.
    ///
    /// Returns the number of messages loaded.
    pub async fn load_history(&self, id: &SessionId) -> Result<usize> {
        let http = self
            .http
            .as_ref()
            .ok_or_else(|| EngineError::Config("engine has no HTTP transport".into()))?;
        let history = http.fetch_history(id).await?;
        let count = history.len();
        if !self.sessions.hydrate(id, history) {
            return Err(EngineError::Streaming(id.clone()));
        }
        Ok(count)
    }
}

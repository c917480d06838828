//! Relay CLI - Command-line interface for the transcript engine
//!
//! Provides subcommands for initializing storage, streaming turns,
//! replaying captures and inspecting session transcripts.

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_transcript::engine::framer::frame_all;
use relay_transcript::engine::slice::SessionSlice;
use relay_transcript::engine::todo::TodoSnapshot;
use relay_transcript::{Engine, EngineConfig, SessionId, TurnRequest};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Streaming transcript engine for agent sessions", long_about = None)]
struct Cli {
    /// Root directory for engine storage
    #[arg(short, long, default_value = ".relay")]
    root: PathBuf,

    /// Enable debug tracing
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize engine storage
    Init {
        /// Base URL of the agent service
        #[arg(long, default_value = "http://localhost:8000")]
        api_base_url: String,

        /// Name of the checklist-writing tool
        #[arg(long, default_value = "TodoWrite")]
        checklist_tool: String,
    },

    /// Stream one turn into a session
    Send {
        /// Session ID (a new session is created when omitted)
        #[arg(long)]
        session: Option<String>,

        /// Upper bound on agent turns
        #[arg(long)]
        max_turns: Option<u32>,

        /// User message
        message: String,
    },

    /// Fold a captured event stream into a session
    Replay {
        /// Session ID
        #[arg(long)]
        session: String,

        /// Capture file
        file: PathBuf,
    },

    /// Show a session transcript
    Show {
        /// Session ID
        session: String,
    },

    /// List stored sessions
    Sessions,

    /// Make a session active
    Activate {
        /// Session ID
        id: String,
    },

    /// Delete a session
    Delete {
        /// Session ID
        id: String,
    },

    /// Load a session's history from the service
    History {
        /// Session ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let debug = cli.debug
        || relay_transcript::engine::storage::load_config(&cli.root)
            .map(|config| config.debug)
            .unwrap_or(false);
    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match cli.command {
        Commands::Init {
            api_base_url,
            checklist_tool,
        } => {
            let root = cli.root.clone();
            let config = EngineConfig {
                root: cli.root,
                api_base_url,
                checklist_tool,
                debug: cli.debug,
                ..EngineConfig::default()
            };

            Engine::init(config)?;
            println!("Initialized relay storage at {:?}", root);
        }

        Commands::Send {
            session,
            max_turns,
            message,
        } => {
            let engine = Engine::load(cli.root)?;
            let id = session.map(SessionId::new).unwrap_or_else(SessionId::generate);
            engine.sessions().activate(&id);
            println!("Session {}", id);

            let sessions = engine.sessions().clone();
            let cancel_id = id.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    sessions.cancel_stream(&cancel_id);
                }
            });

            let mut request = TurnRequest::new(id.clone(), message);
            request.options.max_turns = max_turns;
            let report = engine.runner().run(request).await;

            if let Some(slice) = engine.sessions().slice(&id) {
                if let Some(last) = slice.snapshot().messages.last() {
                    println!("{}", last.content);
                }
            }
            println!(
                "\n[{:?}] frames: {}, parse errors: {}, stream: {:?}",
                report.end, report.stats.frames, report.stats.parse_errors, report.outcome
            );
        }

        Commands::Replay { session, file } => {
            let engine = Engine::load(cli.root)?;
            let data = std::fs::read(&file).with_context(|| format!("Failed to read capture: {:?}", file))?;
            let (frames, _) = frame_all([data]);
            let report = engine.runner().replay(&SessionId::new(session), frames);
            println!(
                "Replayed {} events into {} ({} malformed), last turn: {:?}",
                report.stats.frames, report.session_id, report.stats.parse_errors, report.end
            );
        }

        Commands::Show { session } => {
            let engine = Engine::load(cli.root)?;
            let handle = engine.sessions().open(&SessionId::new(session));
            print_slice(&handle.snapshot());
        }

        Commands::Sessions => {
            let engine = Engine::load(cli.root)?;
            let active = engine.sessions().stored_active()?;
            for id in engine.sessions().stored_sessions()? {
                let marker = if Some(&id) == active.as_ref() { "*" } else { " " };
                println!("{} {}", marker, id);
            }
        }

        Commands::Activate { id } => {
            let engine = Engine::load(cli.root)?;
            let handle = engine.sessions().activate(&SessionId::new(id));
            println!("Active session: {}", handle.id());
        }

        Commands::Delete { id } => {
            let engine = Engine::load(cli.root)?;
            let id = SessionId::new(id);
            engine.sessions().evict(&id);
            println!("Deleted session {}", id);
        }

        Commands::History { id } => {
            let engine = Engine::load(cli.root)?;
            let id = SessionId::new(id);
            let count = engine.load_history(&id).await?;
            println!("Loaded {} messages into {}", count, id);
        }
    }

    Ok(())
}

fn print_slice(slice: &SessionSlice) {
    println!("Session {}", slice.session_id);
    if let Some(agent) = &slice.agent_session_id {
        println!("  agent session: {}", agent);
    }
    if let Some(end) = slice.last_turn {
        println!("  last turn: {:?}", end);
    }

    for message in &slice.messages {
        println!("\n[{}] {}", message.role.as_str(), message.timestamp.to_rfc3339());
        println!("{}", message.content);
        for call in &message.tool_calls {
            println!("  - {} {} ({:?})", call.name, call.id, call.status);
        }
    }

    let snapshot = TodoSnapshot::from_todos(slice.todos.clone());
    if snapshot.total > 0 {
        println!(
            "\nTodos: {}/{} completed, {} in progress",
            snapshot.completed, snapshot.total, snapshot.in_progress
        );
        let stage = snapshot.workflow_stage();
        println!("Stage: {:?}", stage.status);
        for task in stage.tasks {
            println!("  [{:?}] {}", task.status, task.name);
        }
    }
}

//! Turn driver
//!
//! Wires one turn end to end: bind the session, record the user message, open
//! the transport, frame the bytes and fold every event into the bound slice
//! until a terminal event, cancellation or the end of the stream.

use futures::StreamExt;
use std::sync::Arc;

use super::error::TransportError;
use super::framer::{Frame, FramedStream, FramerStats, StreamOutcome};
use super::session::{SessionManager, StreamBinding};
use super::slice::{SessionId, TurnEnd};
use super::transport::{RetryPolicy, Transport, TurnOptions, TurnRequest, open_with_retry};

/// Summary of one driven turn
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    /// Session the turn was bound to
    pub session_id: SessionId,
    /// How the turn ended; `None` when the stream was superseded
    pub end: Option<TurnEnd>,
    /// How the byte stream ended
    pub outcome: StreamOutcome,
    /// Framing counters
    pub stats: FramerStats,
}

/// Drives turns through a transport into the session manager
#[derive(Clone)]
pub struct TurnRunner {
    manager: SessionManager,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    defaults: TurnOptions,
}

impl std::fmt::Debug for TurnRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnRunner")
            .field("retry", &self.retry)
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl TurnRunner {
    /// Runner opening streams through `transport`
    pub fn new(manager: SessionManager, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            manager,
            transport,
            retry,
            defaults: TurnOptions::default(),
        }
    }

    /// Options applied when a request leaves them unset
    pub fn with_defaults(mut self, defaults: TurnOptions) -> Self {
        self.defaults = defaults;
        self
    }

    /// Session manager turns are folded into
    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    /// Drive one turn to its end.
    pub async fn run(&self, mut request: TurnRequest) -> TurnReport {
        let binding = self.manager.bind(&request.session_id);
        self.fill_options(&mut request, &binding);
        binding.begin(Some(&request.message));

        let token = binding.token();
        let bytes = match open_with_retry(self.transport.as_ref(), &request, &self.retry, &token).await {
            Ok(bytes) => bytes,
            Err(TransportError::Cancelled) => {
                let end = binding.cancel().and_then(|step| step.ended);
                return report(&binding, end, StreamOutcome::Aborted, FramerStats::default());
            }
            Err(err) => {
                let reason = err.to_string();
                let end = binding.interrupt(&reason).and_then(|step| step.ended);
                return report(&binding, end, StreamOutcome::Failed(reason), FramerStats::default());
            }
        };

        let mut framed = FramedStream::new(bytes);
        let mut end = None;
        loop {
            let frame = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    framed.abort();
                    end = binding.cancel().and_then(|step| step.ended);
                    break;
                }
                frame = framed.next() => frame,
            };

            match frame {
                Some(Frame::Event(event)) => {
                    let Some(step) = binding.apply(&event) else {
                        framed.abort();
                        break;
                    };
                    if event.is_terminal() {
                        end = step.ended;
                        break;
                    }
                }
                Some(Frame::ParseError { .. }) => continue,
                None => {
                    let reason = match framed.outcome() {
                        Some(StreamOutcome::Failed(reason)) => reason.clone(),
                        _ => "stream closed before the turn completed".to_string(),
                    };
                    end = binding.interrupt(&reason).and_then(|step| step.ended);
                    break;
                }
            }
        }

        let outcome = framed.outcome().cloned().unwrap_or(StreamOutcome::Clean);
        let stats = framed.stats();
        tracing::debug!(session = %request.session_id, ?end, ?outcome, frames = stats.frames, "Turn stream ended");
        report(&binding, end, outcome, stats)
    }

    /// Fold a captured frame sequence into a session.
    ///
    /// Captures may hold several turns; a turn left open at the end of the
    /// capture is closed as interrupted.
    pub fn replay(&self, session_id: &SessionId, frames: impl IntoIterator<Item = Frame>) -> TurnReport {
        let binding = self.manager.bind(session_id);
        let mut end = None;
        let mut stats = FramerStats::default();

        for frame in frames {
            match frame {
                Frame::Event(event) => {
                    stats.frames += 1;
                    if let Some(ended) = binding.apply(&event).and_then(|step| step.ended) {
                        end = Some(ended);
                    }
                }
                Frame::ParseError { .. } => stats.parse_errors += 1,
            }
        }
        if let Some(ended) = binding
            .interrupt("capture ended before the turn completed")
            .and_then(|step| step.ended)
        {
            end = Some(ended);
        }

        report(&binding, end, StreamOutcome::Clean, stats)
    }

    fn fill_options(&self, request: &mut TurnRequest, binding: &StreamBinding) {
        let options = &mut request.options;
        if options.permission_mode.is_none() {
            options.permission_mode = self.defaults.permission_mode.clone();
        }
        if options.max_turns.is_none() {
            options.max_turns = self.defaults.max_turns;
        }
        if options.resume.is_none() {
            options.resume = binding
                .snapshot()
                .agent_session_id
                .or_else(|| self.defaults.resume.clone());
        }
    }
}

fn report(binding: &StreamBinding, end: Option<TurnEnd>, outcome: StreamOutcome, stats: FramerStats) -> TurnReport {
    TurnReport {
        session_id: binding.session_id().clone(),
        end,
        outcome,
        stats,
    }
}

//! Byte transports for turn streams
//!
//! A [`Transport`] turns a [`TurnRequest`] into a stream of raw byte chunks;
//! framing happens elsewhere. [`HttpTransport`] talks to the agent service,
//! [`FixtureTransport`] replays a captured stream.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::{Stream, TryStreamExt, stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use super::error::{TransportError, TransportResult};
use super::event::tool_result_text;
use super::slice::{Message, Role, SessionId};
use super::tool_call::{ToolCall, ToolCallStatus};

/// Raw chunks of one turn stream
pub type ByteStream = Pin<Box<dyn Stream<Item = TransportResult<Bytes>> + Send>>;

const ERROR_BODY_LIMIT: usize = 600;

/// Per-turn options forwarded to the agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnOptions {
    /// Tool permission mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    /// Agent session to resume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<String>,
    /// Upper bound on agent turns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

/// One user turn to stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnRequest {
    /// Target session
    pub session_id: SessionId,
    /// User message
    pub message: String,
    /// Agent options
    pub options: TurnOptions,
}

impl TurnRequest {
    /// Request with default options
    pub fn new(session_id: SessionId, message: impl Into<String>) -> Self {
        Self {
            session_id,
            message: message.into(),
            options: TurnOptions::default(),
        }
    }
}

#[derive(Serialize)]
struct StreamBody<'a> {
    session_id: &'a str,
    message: &'a str,
    #[serde(flatten)]
    options: &'a TurnOptions,
}

/// Source of turn streams
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the stream of one turn
    async fn open(&self, request: &TurnRequest) -> TransportResult<ByteStream>;
}

/// Backoff applied when opening a stream fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Delay cap
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let millis = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// Open a stream, retrying retryable failures with exponential backoff.
///
/// Only the opening is retried. Cancelling `token` aborts both the attempt
/// and the wait between attempts.
pub async fn open_with_retry(
    transport: &dyn Transport,
    request: &TurnRequest,
    policy: &RetryPolicy,
    token: &CancellationToken,
) -> TransportResult<ByteStream> {
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => return Err(TransportError::Cancelled),
            result = transport.open(request) => result,
        };

        match result {
            Ok(stream) => return Ok(stream),
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                attempt += 1;
                tracing::warn!(
                    session = %request.session_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Opening stream failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => return Err(TransportError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(err) => return Err(err),
        }
    }
}

/// HTTP transport against the agent service
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Transport for the service at `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Transport using an existing client
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// Service base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the stored conversation of a session.
    pub async fn fetch_history(&self, id: &SessionId) -> TransportResult<Vec<HistoryMessage>> {
        let url = format!("{}/api/sessions/{}/messages", self.base_url, id);
        let response = self.client.get(&url).send().await?;
        let response = check_status(response).await?;
        let page: HistoryPage = response.json().await?;
        tracing::debug!(session = %id, messages = page.messages.len(), total = page.total, "Fetched history");
        Ok(page.messages)
    }
}

async fn check_status(response: reqwest::Response) -> TransportResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &TurnRequest) -> TransportResult<ByteStream> {
        let url = format!("{}/api/chat/stream", self.base_url);
        let body = StreamBody {
            session_id: request.session_id.as_str(),
            message: &request.message,
            options: &request.options,
        };

        tracing::debug!(session = %request.session_id, %url, "Opening stream");
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await?;
        let response = check_status(response).await?;

        Ok(Box::pin(response.bytes_stream().map_err(TransportError::Http)))
    }
}

enum FixtureSource {
    File(PathBuf),
    Bytes(Bytes),
}

/// Replays a captured stream in fixed-size chunks
pub struct FixtureTransport {
    source: FixtureSource,
    chunk_size: usize,
    requests: Mutex<Vec<TurnRequest>>,
}

impl std::fmt::Debug for FixtureTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixtureTransport")
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

impl FixtureTransport {
    /// Replay the file at `path`
    pub fn from_path(path: impl Into<PathBuf>, chunk_size: usize) -> Self {
        Self::with_source(FixtureSource::File(path.into()), chunk_size)
    }

    /// Replay `data`
    pub fn from_bytes(data: impl Into<Bytes>, chunk_size: usize) -> Self {
        Self::with_source(FixtureSource::Bytes(data.into()), chunk_size)
    }

    fn with_source(source: FixtureSource, chunk_size: usize) -> Self {
        Self {
            source,
            chunk_size: chunk_size.max(1),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far
    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for FixtureTransport {
    async fn open(&self, request: &TurnRequest) -> TransportResult<ByteStream> {
        self.requests.lock().push(request.clone());
        match &self.source {
            FixtureSource::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                let chunks = ReaderStream::with_capacity(file, self.chunk_size);
                Ok(Box::pin(chunks.map_err(TransportError::Io)))
            }
            FixtureSource::Bytes(data) => {
                let chunks: Vec<TransportResult<Bytes>> = (0..data.len())
                    .step_by(self.chunk_size)
                    .map(|start| {
                        let end = (start + self.chunk_size).min(data.len());
                        Ok(data.slice(start..end))
                    })
                    .collect();
                Ok(Box::pin(stream::iter(chunks)))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryPage {
    messages: Vec<HistoryMessage>,
    #[serde(default)]
    total: u64,
}

/// A stored message as returned by the service
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryMessage {
    /// Record id
    pub id: String,
    /// Author
    pub role: Role,
    /// Text
    pub content: String,
    /// Tool calls made for this message
    #[serde(default)]
    pub tool_calls: Option<Vec<HistoryToolCall>>,
    /// ISO-8601 creation time
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// A stored tool call as returned by the service
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryToolCall {
    /// Invocation id
    pub id: String,
    /// Tool name
    pub name: String,
    /// Complete input
    #[serde(default)]
    pub input: Value,
    /// Result payload
    #[serde(default)]
    pub result: Value,
    /// Whether the tool failed
    #[serde(default)]
    pub is_error: Option<bool>,
}

impl HistoryToolCall {
    /// Finished tool call. A call without a result counts as successful.
    pub fn into_tool_call(self) -> ToolCall {
        let failed = self.is_error.unwrap_or(false);
        let result = (!self.result.is_null()).then(|| tool_result_text(&self.result));
        let status = if result.is_some() && failed {
            ToolCallStatus::Failed
        } else {
            ToolCallStatus::Success
        };
        ToolCall {
            id: self.id,
            name: self.name,
            status,
            input: self.input,
            input_partial: None,
            is_error: result.as_ref().map(|_| failed),
            result,
        }
    }
}

impl HistoryMessage {
    /// Transcript message; `fallback` is used when the timestamp is missing
    /// or unparseable.
    pub fn into_message(self, fallback: DateTime<Utc>) -> Message {
        let timestamp = self
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(fallback);
        Message {
            id: self.id,
            role: self.role,
            content: self.content,
            tool_calls: self
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(HistoryToolCall::into_tool_call)
                .collect(),
            stats: None,
            timestamp,
            end: None,
        }
    }
}

/// Parse RFC 3339, or a naive ISO timestamp taken as UTC
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

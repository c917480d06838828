//! Line framing for the inbound event stream
//!
//! Transport chunks are arbitrary slices of a `data: <json>\n` line protocol.
//! The framer buffers the undelimited tail between chunks, decodes each
//! complete `data:` line into a [`StreamEvent`], and reports undecodable
//! payloads as [`Frame::ParseError`] without ending the sequence.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use tracing::{debug, trace, warn};

use super::error::TransportError;
use super::event::StreamEvent;

const DATA_PREFIX: &str = "data:";

/// Longest payload excerpt kept in a parse error.
const MAX_EXCERPT: usize = 600;

/// One unit produced by the framer.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A decoded event
    Event(StreamEvent),
    /// A `data:` line whose payload could not be decoded
    ParseError {
        /// Payload excerpt
        payload: String,
        /// Decoder message
        reason: String,
    },
}

/// How the underlying transport ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// The transport closed normally
    Clean,
    /// The consumer aborted the stream
    Aborted,
    /// The transport failed mid-stream
    Failed(String),
}

/// Counters describing a framed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FramerStats {
    /// Events decoded
    pub frames: u64,
    /// `data:` lines that failed to decode
    pub parse_errors: u64,
    /// Bytes of an undelimited tail dropped at end of stream
    pub discarded_tail_bytes: u64,
}

/// Incremental line framer.
#[derive(Debug, Default)]
pub struct EventFramer {
    buffer: Vec<u8>,
    stats: FramerStats,
}

impl EventFramer {
    /// Create an empty framer
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some(newline) = self.buffer[consumed..].iter().position(|b| *b == b'\n') {
            let line_end = consumed + newline;
            let mut line = &self.buffer[consumed..line_end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if let Some(frame) = decode_line(&mut self.stats, line) {
                frames.push(frame);
            }
            consumed = line_end + 1;
        }
        self.buffer.drain(..consumed);
        frames
    }

    /// End of input: drop any undelimited tail and return the byte count dropped.
    pub fn finish(&mut self) -> usize {
        let dropped = self.buffer.len();
        if dropped > 0 {
            debug!(bytes = dropped, "discarding undelimited tail at end of stream");
            self.stats.discarded_tail_bytes += dropped as u64;
            self.buffer.clear();
        }
        dropped
    }

    /// Counters accumulated so far
    pub fn stats(&self) -> FramerStats {
        self.stats
    }
}

fn decode_line(stats: &mut FramerStats, line: &[u8]) -> Option<Frame> {
    if line.is_empty() {
        return None;
    }

    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(err) => {
            stats.parse_errors += 1;
            warn!("dropping non-UTF-8 line: {err}");
            return Some(Frame::ParseError {
                payload: excerpt(&String::from_utf8_lossy(line)),
                reason: err.to_string(),
            });
        }
    };

    let Some(payload) = text.strip_prefix(DATA_PREFIX) else {
        // event:, id:, retry:, comments and heartbeats carry nothing we fold.
        if text.starts_with("event: ping") || text.starts_with(':') {
            trace!("heartbeat");
        } else {
            trace!(line = text, "skipping non-data line");
        }
        return None;
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);

    match serde_json::from_str::<StreamEvent>(payload) {
        Ok(event) => {
            stats.frames += 1;
            trace!(kind = event.kind(), "frame");
            Some(Frame::Event(event))
        }
        Err(err) => {
            stats.parse_errors += 1;
            let payload = excerpt(payload);
            warn!("failed to parse frame: {err}, data: {payload}");
            Some(Frame::ParseError {
                payload,
                reason: err.to_string(),
            })
        }
    }
}

fn excerpt(payload: &str) -> String {
    if payload.len() <= MAX_EXCERPT {
        return payload.to_string();
    }
    let mut end = MAX_EXCERPT;
    while !payload.is_char_boundary(end) {
        end -= 1;
    }
    payload[..end].to_string()
}

/// Frame every chunk of an in-memory capture, in order.
pub fn frame_all<I, C>(chunks: I) -> (Vec<Frame>, FramerStats)
where
    I: IntoIterator<Item = C>,
    C: AsRef<[u8]>,
{
    let mut framer = EventFramer::new();
    let mut frames = Vec::new();
    for chunk in chunks {
        frames.extend(framer.push(chunk.as_ref()));
    }
    framer.finish();
    (frames, framer.stats())
}

/// Finite, non-restartable stream of frames over a transport byte stream.
///
/// Once it yields `None` it stays ended and [`FramedStream::outcome`] reports
/// whether the transport closed, failed, or was aborted.
pub struct FramedStream<S> {
    inner: S,
    framer: EventFramer,
    pending: VecDeque<Frame>,
    outcome: Option<StreamOutcome>,
}

impl<S> FramedStream<S>
where
    S: Stream<Item = Result<Bytes, TransportError>> + Unpin,
{
    /// Wrap a transport byte stream
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            framer: EventFramer::new(),
            pending: VecDeque::new(),
            outcome: None,
        }
    }

    /// Terminate the stream on behalf of the consumer.
    ///
    /// Frames already decoded but not yet yielded are discarded.
    pub fn abort(&mut self) {
        if self.outcome.is_none() {
            self.pending.clear();
            self.framer.finish();
            self.outcome = Some(StreamOutcome::Aborted);
        }
    }

    /// How the stream ended, once it has
    pub fn outcome(&self) -> Option<&StreamOutcome> {
        self.outcome.as_ref()
    }

    /// Counters accumulated so far
    pub fn stats(&self) -> FramerStats {
        self.framer.stats()
    }
}

impl<S> Stream for FramedStream<S>
where
    S: Stream<Item = Result<Bytes, TransportError>> + Unpin,
{
    type Item = Frame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        let this = self.get_mut();
        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(frame));
            }
            if this.outcome.is_some() {
                return Poll::Ready(None);
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Ok(chunk))) => {
                    let frames = this.framer.push(&chunk);
                    this.pending.extend(frames);
                }
                Poll::Ready(Some(Err(err))) => {
                    debug!("transport failed mid-stream: {err}");
                    this.framer.finish();
                    this.outcome = Some(StreamOutcome::Failed(err.to_string()));
                }
                Poll::Ready(None) => {
                    this.framer.finish();
                    this.outcome = Some(StreamOutcome::Clean);
                }
            }
        }
    }
}

//! Raw HTTP tracing for scoring calls.
//!
//! This module provides the [`HttpTraceLogger`] trait that lets a caller observe every raw line
//! of the HTTP exchanges made by a [`ScoringClient`](crate::ScoringClient): the request line,
//! headers (with the bearer key masked), the JSON body, the response status, response headers
//! and each line of the response body as it arrives.  The Level 3 front-end mirrors these lines
//! into a live side panel through a [`TraceBuffer`].

use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Placeholder shown instead of the real bearer key.
pub const MASKED_KEY: &str = "< MASKED_APIKey >";

/// Which side of the exchange a trace line belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceDirection {
    /// Sent to the endpoint.
    Request,

    /// Received from the endpoint.
    Response,

    /// Commentary from the client, such as a transport failure.
    Note,
}

/// One raw line of an HTTP exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpTraceLine {
    /// 1-based number of the call this line belongs to.
    pub call: u64,

    /// Which side produced the line.
    pub direction: TraceDirection,

    /// The line itself, without its terminator.
    pub text: String,

    /// When the line was observed.
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// A trait for observing the raw HTTP traffic of scoring calls.
///
/// Implementations must be cheap; they are called inline while the response body is read.
pub trait HttpTraceLogger: Send + Sync {
    /// Called once before the first line of every call.
    fn start_call(&self) {}

    /// Record one line.
    fn log_line(&self, direction: TraceDirection, text: &str);

    /// Record a multi-line block one line at a time.
    fn log_block(&self, direction: TraceDirection, block: &str) {
        for line in block.lines() {
            self.log_line(direction, line);
        }
    }
}

/// An [`HttpTraceLogger`] that numbers calls and buffers their lines.
///
/// Lines are handed out twice: incrementally through [`TraceBuffer::drain_new`] for live display,
/// and in full through [`TraceBuffer::lines`] when a panel is reloaded.
#[derive(Debug, Default)]
pub struct TraceBuffer {
    state: Mutex<TraceState>,
}

#[derive(Debug, Default)]
struct TraceState {
    calls: u64,
    lines: Vec<HttpTraceLine>,
    drained: usize,
}

impl TraceBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls started so far.
    pub fn call_count(&self) -> u64 {
        self.state().calls
    }

    /// Every line recorded so far.
    pub fn lines(&self) -> Vec<HttpTraceLine> {
        self.state().lines.clone()
    }

    /// Lines recorded since the previous drain.
    pub fn drain_new(&self) -> Vec<HttpTraceLine> {
        let mut state = self.state();
        let fresh = state.lines[state.drained..].to_vec();
        state.drained = state.lines.len();
        fresh
    }

    /// Forget every call and line.
    pub fn clear(&self) {
        *self.state() = TraceState::default();
    }

    fn state(&self) -> MutexGuard<'_, TraceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HttpTraceLogger for TraceBuffer {
    fn start_call(&self) {
        let mut state = self.state();
        state.calls += 1;
        let call = state.calls;
        state.lines.push(HttpTraceLine {
            call,
            direction: TraceDirection::Note,
            text: format!("#{call} API Request"),
            at: OffsetDateTime::now_utc(),
        });
    }

    fn log_line(&self, direction: TraceDirection, text: &str) {
        let mut state = self.state();
        let call = state.calls;
        tracing::trace!(call, ?direction, "{text}");
        state.lines.push(HttpTraceLine {
            call,
            direction,
            text: text.to_string(),
            at: OffsetDateTime::now_utc(),
        });
    }
}

/// Render the head of a scoring request the way it goes over the wire, key masked.
pub(crate) fn request_head(url: &url::Url, deployment: &str, accept: &str) -> Vec<String> {
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }
    let host = match url.port() {
        Some(port) => format!("{}:{port}", url.host_str().unwrap_or_default()),
        None => url.host_str().unwrap_or_default().to_string(),
    };
    vec![
        format!("POST {target} HTTP/1.1"),
        format!("Host: {host}"),
        format!("Accept: {accept}"),
        format!("Authorization: Bearer {MASKED_KEY}"),
        format!("azureml-model-deployment: {deployment}"),
        "Content-Type: application/json".to_string(),
        String::new(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_are_numbered() {
        let buffer = TraceBuffer::new();
        buffer.start_call();
        buffer.log_line(TraceDirection::Request, "POST /score HTTP/1.1");
        buffer.start_call();
        buffer.log_line(TraceDirection::Response, "HTTP/1.1 200 OK");

        let lines = buffer.lines();
        assert_eq!(buffer.call_count(), 2);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0].text, "#1 API Request");
        assert_eq!(lines[1].call, 1);
        assert_eq!(lines[2].text, "#2 API Request");
        assert_eq!(lines[3].call, 2);
        assert_eq!(lines[3].direction, TraceDirection::Response);
    }

    #[test]
    fn drain_only_returns_fresh_lines() {
        let buffer = TraceBuffer::new();
        buffer.start_call();
        buffer.log_block(TraceDirection::Request, "a\nb");
        assert_eq!(buffer.drain_new().len(), 3);
        assert!(buffer.drain_new().is_empty());
        buffer.log_line(TraceDirection::Response, "c");
        let fresh = buffer.drain_new();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].text, "c");
        assert_eq!(buffer.lines().len(), 4);
    }

    #[test]
    fn clear_resets_numbering() {
        let buffer = TraceBuffer::new();
        buffer.start_call();
        buffer.clear();
        assert_eq!(buffer.call_count(), 0);
        assert!(buffer.lines().is_empty());
        buffer.start_call();
        assert_eq!(buffer.lines()[0].text, "#1 API Request");
    }

    #[test]
    fn request_head_masks_key() {
        let url = url::Url::parse("https://chat-ep.eastus.inference.ml.azure.com/score").unwrap();
        let head = request_head(&url, "blue", "text/event-stream");
        assert_eq!(head[0], "POST /score HTTP/1.1");
        assert_eq!(head[1], "Host: chat-ep.eastus.inference.ml.azure.com");
        assert_eq!(head[3], format!("Authorization: Bearer {MASKED_KEY}"));
        assert!(head.iter().any(|l| l == "azureml-model-deployment: blue"));
        assert_eq!(head.last().map(String::as_str), Some(""));
    }

    #[test]
    fn line_serialization() {
        let line = HttpTraceLine {
            call: 3,
            direction: TraceDirection::Request,
            text: "POST /score HTTP/1.1".to_string(),
            at: time::macros::datetime!(2024-05-01 12:00:00 UTC),
        };
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["direction"], "request");
        assert_eq!(json["at"], "2024-05-01T12:00:00Z");
    }
}

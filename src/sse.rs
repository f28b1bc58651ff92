//! Server-Sent Events (SSE) processing for streaming responses.
//!
//! This module turns the raw byte stream of a streaming scoring call into a stream of validated
//! [`StreamedChunk`]s.  Lines may end in LF, CRLF or a bare CR.  Events are delimited by a blank
//! line; `data:` lines are joined,
//! `event:`/`id:`/`retry:` fields and `:` comments are tolerated, and `data: [DONE]` ends the
//! stream.  The first event that fails validation is reported as an error and nothing after it
//! is yielded.

use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::error::{Error, Result};
use crate::observability::{STREAM_BYTES, STREAM_CHUNKS, STREAM_ERRORS};
use crate::trace::{HttpTraceLogger, TraceDirection};
use crate::types::StreamedChunk;

/// What one decoded event means for the chunk stream.
enum Frame {
    /// A validated chunk, or the reason the event was rejected.
    Item(Result<StreamedChunk>),
    /// The server signalled the end of the answer.
    Done,
    /// Nothing to yield: a comment, keep-alive or data-less event.
    Skip,
}

struct SseState<S> {
    stream: S,
    buffer: Vec<u8>,
    trace: Option<Arc<dyn HttpTraceLogger>>,
    pending_cr: bool,
    finished: bool,
}

/// Process a stream of bytes into a stream of streamed chunks.
///
/// When `trace` is given, every raw line of every event is reported to it as a response line
/// before the event is validated.
pub fn process_sse<S>(
    byte_stream: S,
    trace: Option<Arc<dyn HttpTraceLogger>>,
) -> impl Stream<Item = Result<StreamedChunk>>
where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let state = SseState {
        stream: byte_stream,
        buffer: Vec::new(),
        trace,
        pending_cr: false,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            // First check if we have a complete event in the buffer
            if let Some(event) = take_event(&mut state.buffer) {
                match decode_event(&event, state.trace.as_deref()) {
                    Frame::Item(Ok(chunk)) => {
                        STREAM_CHUNKS.click();
                        return Some((Ok(chunk), state));
                    }
                    Frame::Item(Err(err)) => {
                        STREAM_ERRORS.click();
                        state.finished = true;
                        return Some((Err(err), state));
                    }
                    Frame::Done => return None,
                    Frame::Skip => continue,
                }
            }

            // Read more data
            match state.stream.next().await {
                Some(Ok(bytes)) => {
                    STREAM_BYTES.count(bytes.len() as u64);
                    push_normalized(&mut state.buffer, &mut state.pending_cr, &bytes);
                }
                Some(Err(err)) => {
                    STREAM_ERRORS.click();
                    state.finished = true;
                    return Some((Err(err), state));
                }
                None => {
                    // End of stream; a final event may lack its blank line
                    state.finished = true;
                    if std::mem::take(&mut state.pending_cr) {
                        state.buffer.push(b'\n');
                    }
                    if state.buffer.iter().all(u8::is_ascii_whitespace) {
                        return None;
                    }
                    let event = std::mem::take(&mut state.buffer);
                    return match decode_event(&event, state.trace.as_deref()) {
                        Frame::Item(item) => {
                            if item.is_ok() {
                                STREAM_CHUNKS.click();
                            } else {
                                STREAM_ERRORS.click();
                            }
                            Some((item, state))
                        }
                        Frame::Done | Frame::Skip => None,
                    };
                }
            }
        }
    })
}

/// Append `bytes` to `buffer` with CRLF and bare CR line endings turned into LF.
///
/// A CR at the end of a read is held back in `pending_cr` until the next byte shows whether it
/// starts a CRLF pair.
fn push_normalized(buffer: &mut Vec<u8>, pending_cr: &mut bool, bytes: &[u8]) {
    for &b in bytes {
        if std::mem::take(pending_cr) {
            buffer.push(b'\n');
            if b == b'\n' {
                continue;
            }
        }
        if b == b'\r' {
            *pending_cr = true;
        } else {
            buffer.push(b);
        }
    }
}

/// Remove the first complete event (up to and excluding its blank line) from `buffer`.
fn take_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let end = buffer.windows(2).position(|w| w == b"\n\n")?;
    let mut event: Vec<u8> = buffer.drain(..end + 2).collect();
    event.truncate(end);
    Some(event)
}

fn decode_event(event: &[u8], trace: Option<&dyn HttpTraceLogger>) -> Frame {
    let text = match std::str::from_utf8(event) {
        Ok(text) => text,
        Err(e) => {
            return Frame::Item(Err(Error::encoding(
                format!("Invalid UTF-8 in stream: {e}"),
                Some(Box::new(e)),
            )));
        }
    };

    if let Some(trace) = trace {
        trace.log_block(TraceDirection::Response, text);
        trace.log_line(TraceDirection::Response, "");
    }

    let mut event_type = None;
    let mut data: Option<String> = None;
    for line in text.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => match data.as_mut() {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => data = Some(value.to_string()),
            },
            "event" => event_type = Some(value),
            _ => {}
        }
    }

    match (event_type, data) {
        (Some("error"), data) => Frame::Item(Err(Error::api(
            500,
            data.unwrap_or_else(|| "stream error".to_string()),
            None,
        ))),
        (_, None) => Frame::Skip,
        (_, Some(data)) if data.trim() == "[DONE]" => Frame::Done,
        (_, Some(data)) => Frame::Item(StreamedChunk::from_json(&data)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::TraceBuffer;

    fn byte_stream(parts: Vec<&'static [u8]>) -> impl Stream<Item = Result<Bytes>> + Unpin {
        stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p))))
    }

    async fn collect(parts: Vec<&'static [u8]>) -> Vec<Result<StreamedChunk>> {
        process_sse(byte_stream(parts), None).collect().await
    }

    #[tokio::test]
    async fn yields_every_chunk_in_order() {
        let events = collect(vec![
            b"data: {\"answer\": \"The\"}\n\n",
            b"data: {\"answer\": \" capital\"}\n\ndata: {\"answer\": \" is\"}\n\n",
            b"data: {\"answer\": \" Paris.\"}\n\n",
        ])
        .await;
        let answers: Vec<String> = events.into_iter().map(|e| e.unwrap().answer).collect();
        assert_eq!(answers, vec!["The", " capital", " is", " Paris."]);
    }

    #[tokio::test]
    async fn corrupted_chunk_aborts_the_sequence() {
        let events = collect(vec![
            b"data: {\"answer\": \"a\"}\n\n",
            b"data: {\"answer\": \"b\"}\n\n",
            b"data: {\"answer\": \n\n",
            b"data: {\"answer\": \"d\"}\n\n",
        ])
        .await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].as_ref().unwrap().answer, "a");
        assert_eq!(events[1].as_ref().unwrap().answer, "b");
        assert!(events[2].as_ref().unwrap_err().is_validation());
    }

    #[tokio::test]
    async fn wrong_shape_aborts_the_sequence() {
        let events = collect(vec![
            b"data: {\"answer\": \"a\"}\n\n",
            b"data: {\"text\": \"b\"}\n\n",
            b"data: {\"answer\": \"c\"}\n\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert!(events[1].is_err());
    }

    #[tokio::test]
    async fn handle_split_event() {
        let events = collect(vec![b"data: {\"ans", b"wer\": \"Par", b"is\"}\n", b"\n"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().answer, "Paris");
    }

    #[tokio::test]
    async fn multibyte_character_split_across_reads() {
        // "é" is 0xC3 0xA9
        let events = collect(vec![b"data: {\"answer\": \"caf\xC3", b"\xA9\"}\n\n"]).await;
        assert_eq!(events[0].as_ref().unwrap().answer, "café");
    }

    #[tokio::test]
    async fn crlf_delimiters() {
        let events = collect(vec![
            b"data: {\"answer\": \"a\"}\r\n\r\ndata: {\"answer\": \"b\"}\r\n\r\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(Result::is_ok));
    }

    #[tokio::test]
    async fn bare_cr_delimiters() {
        let events = collect(vec![
            b"data: {\"answer\": \"a\"}\r\rdata: {\"answer\": \"b\"}\r\r",
            b": keep-alive\n\n",
        ])
        .await;
        let answers: Vec<String> = events.into_iter().map(|e| e.unwrap().answer).collect();
        assert_eq!(answers, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn crlf_split_across_reads() {
        let events = collect(vec![
            b"data: {\"answer\": \"a\"}\r",
            b"\n\r",
            b"\ndata: {\"answer\": \"b\"}\r\n\r\n",
        ])
        .await;
        let answers: Vec<String> = events.into_iter().map(|e| e.unwrap().answer).collect();
        assert_eq!(answers, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn trailing_bare_cr_at_end_of_stream() {
        let events = collect(vec![b"data: {\"answer\": \"a\"}\r\r"]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().answer, "a");
    }

    #[tokio::test]
    async fn comments_and_fields_are_tolerated() {
        let events = collect(vec![
            b": keep-alive\n\n",
            b"id: 1\nretry: 100\n\n",
            b"event: message\nid: 2\ndata: {\"answer\": \"ok\"}\n\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap().answer, "ok");
    }

    #[tokio::test]
    async fn multi_line_data_is_joined() {
        let events = collect(vec![b"data: {\"answer\":\ndata: \"joined\"}\n\n"]).await;
        assert_eq!(events[0].as_ref().unwrap().answer, "joined");
    }

    #[tokio::test]
    async fn done_marker_ends_stream() {
        let events = collect(vec![
            b"data: {\"answer\": \"a\"}\n\ndata: [DONE]\n\n",
            b"data: {\"answer\": \"never\"}\n\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn error_event() {
        let events = collect(vec![
            b"data: {\"answer\": \"a\"}\n\n",
            b"event: error\ndata: model overloaded\n\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        let err = events[1].as_ref().unwrap_err();
        assert_eq!(err.status_code(), Some(500));
        assert!(err.to_string().contains("model overloaded"));
    }

    #[tokio::test]
    async fn trailing_event_without_blank_line() {
        let events = collect(vec![b"data: {\"answer\": \"a\"}\n\ndata: {\"answer\": \"b\"}"]).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].as_ref().unwrap().answer, "b");
    }

    #[tokio::test]
    async fn transport_error_aborts() {
        let parts: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"data: {\"answer\": \"a\"}\n\n")),
            Err(Error::streaming("connection reset", None)),
            Ok(Bytes::from_static(b"data: {\"answer\": \"b\"}\n\n")),
        ];
        let events: Vec<_> = process_sse(stream::iter(parts), None).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], Err(Error::Streaming { .. })));
    }

    #[tokio::test]
    async fn raw_lines_are_traced() {
        let buffer = Arc::new(TraceBuffer::new());
        buffer.start_call();
        let trace: Arc<dyn HttpTraceLogger> = buffer.clone();
        let events: Vec<_> = process_sse(
            byte_stream(vec![b"event: message\ndata: {\"answer\": \"a\"}\n\n"]),
            Some(trace),
        )
        .collect()
        .await;
        assert_eq!(events.len(), 1);

        let texts: Vec<String> = buffer.lines().into_iter().map(|l| l.text).collect();
        assert_eq!(
            texts,
            vec![
                "#1 API Request",
                "event: message",
                "data: {\"answer\": \"a\"}",
                ""
            ]
        );
    }
}

//! Reassembly of `data: <json>` server-sent events into ordered text deltas.
//!
//! [`StreamReassembler`] is a synchronous state machine fed with raw byte
//! chunks of arbitrary size; [`reassemble`] drives it over an async byte
//! stream and hands every delta to the caller before reading the next chunk.

use std::fmt::Display;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};

use futures_util::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::InferenceError;
use crate::types::StreamEvent;

pub const DATA_PREFIX: &str = "data:";
pub const DONE_SENTINEL: &str = "[DONE]";

const MALFORMED_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblerState {
    Reading,
    DrainingBuffer,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReassemblerConfig {
    /// Number of unparseable `data:` events tolerated before the stream is
    /// failed. `None` tolerates any number.
    pub max_malformed_events: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamSummary {
    pub deltas: usize,
    pub malformed_events: usize,
    pub terminated_by_sentinel: bool,
}

/// Incremental UTF-8 decoder. Bytes of a code point split across chunks are
/// held back until the rest arrives; invalid sequences decode to U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut output = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    output.push_str(valid);
                    break;
                }
                Err(error) => {
                    let (valid, after) = rest.split_at(error.valid_up_to());
                    if let Ok(valid) = std::str::from_utf8(valid) {
                        output.push_str(valid);
                    }
                    match error.error_len() {
                        Some(invalid_len) => {
                            output.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[invalid_len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        output
    }

    /// Flushes bytes held back at end of stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            return String::new();
        }
        self.pending.clear();
        char::REPLACEMENT_CHARACTER.to_string()
    }
}

enum LineOutcome {
    Continue,
    Terminate,
}

#[derive(Debug)]
pub struct StreamReassembler {
    config: ReassemblerConfig,
    decoder: Utf8Decoder,
    buffer: String,
    state: ReassemblerState,
    summary: StreamSummary,
    failure: Option<InferenceError>,
}

impl StreamReassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        Self {
            config,
            decoder: Utf8Decoder::new(),
            buffer: String::new(),
            state: ReassemblerState::Reading,
            summary: StreamSummary::default(),
            failure: None,
        }
    }

    pub fn state(&self) -> ReassemblerState {
        self.state
    }

    pub fn summary(&self) -> StreamSummary {
        self.summary
    }

    /// The error that stopped the stream, if the malformed-event cap was
    /// exceeded. Events decoded before the offending line are still returned
    /// by the call that hit the cap; every later call returns this error.
    pub fn failure(&self) -> Option<&InferenceError> {
        self.failure.as_ref()
    }

    /// Feeds one chunk and returns the events completed by it. The trailing,
    /// possibly incomplete line stays buffered for the next chunk. Once the
    /// sentinel has been seen every further byte is ignored.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<Vec<StreamEvent>, InferenceError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        if self.state == ReassemblerState::Done {
            return Ok(Vec::new());
        }
        let text = self.decoder.decode(chunk);
        self.buffer.push_str(&text);
        Ok(self.drain_buffer(false))
    }

    /// Ends the stream: flushes the decoder and processes the final line even
    /// if it lacks a terminating newline.
    pub fn finish(&mut self) -> Result<Vec<StreamEvent>, InferenceError> {
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        if self.state == ReassemblerState::Done {
            return Ok(Vec::new());
        }
        let tail = self.decoder.finish();
        self.buffer.push_str(&tail);
        let events = self.drain_buffer(true);
        self.state = ReassemblerState::Done;
        Ok(events)
    }

    fn drain_buffer(&mut self, include_remainder: bool) -> Vec<StreamEvent> {
        self.state = ReassemblerState::DrainingBuffer;
        let buffer = std::mem::take(&mut self.buffer);
        let mut events = Vec::new();
        let mut consumed = 0;

        while let Some(offset) = buffer[consumed..].find('\n') {
            let line = &buffer[consumed..consumed + offset];
            consumed += offset + 1;
            match self.process_line(line, &mut events) {
                Ok(LineOutcome::Continue) => {}
                Ok(LineOutcome::Terminate) => return self.terminate(events),
                Err(error) => return self.fail(error, events),
            }
        }

        if include_remainder && consumed < buffer.len() {
            let line = &buffer[consumed..];
            consumed = buffer.len();
            match self.process_line(line, &mut events) {
                Ok(LineOutcome::Continue) => {}
                Ok(LineOutcome::Terminate) => return self.terminate(events),
                Err(error) => return self.fail(error, events),
            }
        }

        self.buffer = buffer[consumed..].to_string();
        self.state = ReassemblerState::Reading;
        events
    }

    fn fail(&mut self, error: InferenceError, events: Vec<StreamEvent>) -> Vec<StreamEvent> {
        self.buffer.clear();
        self.state = ReassemblerState::Done;
        self.failure = Some(error);
        events
    }

    fn terminate(&mut self, mut events: Vec<StreamEvent>) -> Vec<StreamEvent> {
        self.buffer.clear();
        self.state = ReassemblerState::Done;
        self.summary.terminated_by_sentinel = true;
        events.push(StreamEvent::Done);
        events
    }

    fn process_line(
        &mut self,
        line: &str,
        events: &mut Vec<StreamEvent>,
    ) -> Result<LineOutcome, InferenceError> {
        let line = line.trim_end_matches('\r');
        let Some(payload) = line.trim_start().strip_prefix(DATA_PREFIX) else {
            return Ok(LineOutcome::Continue);
        };
        let payload = payload.trim();
        if payload == DONE_SENTINEL {
            return Ok(LineOutcome::Terminate);
        }
        if payload.is_empty() {
            return Ok(LineOutcome::Continue);
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(chunk) => {
                let contents = delta_contents(&chunk);
                if contents.is_empty() && chunk.get("error").is_some() {
                    warn!(event = %chunk, "stream event carries an error payload");
                }
                for content in contents {
                    self.summary.deltas += 1;
                    events.push(StreamEvent::Delta { content });
                }
            }
            Err(error) => {
                self.summary.malformed_events += 1;
                warn!(
                    %error,
                    preview = %preview(payload),
                    "skipping malformed stream event"
                );
                if let Some(limit) = self.config.max_malformed_events {
                    if self.summary.malformed_events > limit {
                        return Err(InferenceError::protocol(format!(
                            "stream exceeded {limit} malformed events"
                        ))
                        .with_details(json!({ "lastEvent": preview(payload) })));
                    }
                }
            }
        }
        Ok(LineOutcome::Continue)
    }
}

impl Default for StreamReassembler {
    fn default() -> Self {
        Self::new(ReassemblerConfig::default())
    }
}

/// Text fragments carried by one decoded chunk, in choice order. Empty
/// fragments are dropped.
pub fn delta_contents(chunk: &Value) -> Vec<String> {
    let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
        return Vec::new();
    };
    choices
        .iter()
        .filter_map(|choice| {
            choice
                .get("delta")
                .and_then(|delta| delta.get("content"))
                .and_then(Value::as_str)
                .or_else(|| choice.get("text").and_then(Value::as_str))
        })
        .filter(|content| !content.is_empty())
        .map(str::to_string)
        .collect()
}

fn preview(payload: &str) -> String {
    payload.chars().take(MALFORMED_PREVIEW_CHARS).collect()
}

/// Owns the byte stream for the duration of a read loop and releases it when
/// dropped, whichever way the loop exits (including the enclosing future being
/// dropped mid-read).
pub(crate) struct StreamReader<S> {
    stream: Option<S>,
}

impl<S> StreamReader<S>
where
    S: Stream + Unpin,
{
    pub(crate) fn new(stream: S) -> Self {
        Self {
            stream: Some(stream),
        }
    }

    pub(crate) async fn next_chunk(&mut self) -> Option<S::Item> {
        match self.stream.as_mut() {
            Some(stream) => stream.next().await,
            None => None,
        }
    }
}

impl<S> Drop for StreamReader<S> {
    fn drop(&mut self) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        if std::thread::panicking() {
            drop(stream);
            return;
        }
        match catch_unwind(AssertUnwindSafe(move || drop(stream))) {
            Ok(()) => debug!("released stream reader"),
            Err(_) => warn!("releasing stream reader panicked; ignoring"),
        }
    }
}

/// Reads `stream` to completion (or to the `[DONE]` sentinel), awaiting
/// `on_delta` for each text delta in arrival order.
pub async fn reassemble<S, B, E, F, Fut>(
    stream: S,
    config: ReassemblerConfig,
    mut on_delta: F,
) -> Result<StreamSummary, InferenceError>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut reader = StreamReader::new(stream);
    let mut reassembler = StreamReassembler::new(config);

    while let Some(chunk) = reader.next_chunk().await {
        let chunk = chunk
            .map_err(|error| InferenceError::transport(format!("stream read failed: {error}")))?;
        let events = reassembler.push_chunk(chunk.as_ref())?;
        let terminated = deliver(events, &mut on_delta).await;
        if let Some(error) = reassembler.failure() {
            return Err(error.clone());
        }
        if terminated {
            debug!(summary = ?reassembler.summary(), "stream terminated by sentinel");
            return Ok(reassembler.summary());
        }
    }

    let events = reassembler.finish()?;
    deliver(events, &mut on_delta).await;
    if let Some(error) = reassembler.failure() {
        return Err(error.clone());
    }
    let summary = reassembler.summary();
    debug!(?summary, "stream ended");
    Ok(summary)
}

async fn deliver<F, Fut>(events: Vec<StreamEvent>, on_delta: &mut F) -> bool
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = ()>,
{
    for event in events {
        match event {
            StreamEvent::Delta { content } => on_delta(content).await,
            StreamEvent::Done => return true,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_carries_split_code_point_to_next_chunk() {
        let bytes = "é".as_bytes();
        let mut decoder = Utf8Decoder::new();

        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..]), "é");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn decoder_replaces_invalid_bytes_and_keeps_going() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
    }

    #[test]
    fn decoder_flushes_truncated_sequence_as_replacement() {
        let mut decoder = Utf8Decoder::new();
        assert_eq!(decoder.decode(&"世".as_bytes()[..2]), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }

    #[test]
    fn delta_contents_reads_every_choice_in_order() {
        let chunk = json!({
            "choices": [
                { "delta": { "content": "a" } },
                { "delta": { "content": "" } },
                { "delta": { "role": "assistant" } },
                { "text": "b" },
                { "delta": { "content": "c" } }
            ]
        });
        assert_eq!(delta_contents(&chunk), vec!["a", "b", "c"]);
    }

    #[test]
    fn incomplete_line_stays_buffered_between_chunks() {
        let mut reassembler = StreamReassembler::default();

        let events = reassembler
            .push_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel")
            .expect("partial chunk");
        assert!(events.is_empty());
        assert_eq!(reassembler.state(), ReassemblerState::Reading);

        let events = reassembler.push_chunk(b"lo\"}}]}\n").expect("completing chunk");
        assert_eq!(
            events,
            vec![StreamEvent::Delta {
                content: "Hello".to_string()
            }]
        );
    }

    #[test]
    fn state_reaches_done_on_sentinel_and_ignores_later_bytes() {
        let mut reassembler = StreamReassembler::default();
        let events = reassembler
            .push_chunk(b"data: [DONE]\ndata: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n")
            .expect("sentinel chunk");

        assert_eq!(events, vec![StreamEvent::Done]);
        assert_eq!(reassembler.state(), ReassemblerState::Done);
        assert!(reassembler.summary().terminated_by_sentinel);
        assert!(reassembler
            .push_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"later\"}}]}\n")
            .expect("ignored chunk")
            .is_empty());
    }

    #[test]
    fn crlf_line_endings_are_accepted() {
        let mut reassembler = StreamReassembler::default();
        let events = reassembler
            .push_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\r\n\r\ndata: [DONE]\r\n")
            .expect("crlf chunk");
        assert_eq!(
            events,
            vec![
                StreamEvent::Delta {
                    content: "x".to_string()
                },
                StreamEvent::Done
            ]
        );
    }

    #[test]
    fn malformed_event_cap_fails_the_stream() {
        let mut reassembler = StreamReassembler::new(ReassemblerConfig {
            max_malformed_events: Some(1),
        });

        assert!(reassembler.push_chunk(b"data: nope\n").is_ok());
        let events = reassembler
            .push_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"A\"}}]}\ndata: still nope\n")
            .expect("events before the breach are returned");
        assert_eq!(
            events,
            vec![StreamEvent::Delta {
                content: "A".to_string()
            }]
        );
        let failure = reassembler.failure().expect("cap exceeded");
        assert_eq!(failure.code, crate::InferenceErrorCode::ProviderProtocol);
        assert_eq!(reassembler.summary().malformed_events, 2);
        assert_eq!(reassembler.state(), ReassemblerState::Done);

        let error = reassembler
            .push_chunk(b"data: {\"choices\":[{\"delta\":{\"content\":\"B\"}}]}\n")
            .expect_err("stream stays failed");
        assert_eq!(error.code, crate::InferenceErrorCode::ProviderProtocol);
        assert!(reassembler.finish().is_err());
    }
}

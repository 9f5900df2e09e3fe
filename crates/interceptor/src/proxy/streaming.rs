//! Incremental reassembly of streamed responses
//!
//! Upstream bodies arrive in arbitrary chunks: an SSE line may be split
//! across reads and a multi-byte character may straddle two chunks. The
//! [`StreamAccumulator`] keeps a carry buffer of unterminated bytes, decodes
//! every complete `data:` line exactly once and appends the extracted text to
//! the running content.
//!
//! SSE format:
//! ```text
//! data: {"choices":[{"index":0,"delta":{"content":"Hel"}}]}
//!
//! data: {"choices":[{"index":0,"delta":{"content":"lo"}}]}
//!
//! data: [DONE]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::capture::TokenUsage;

const DONE_SENTINEL: &str = "[DONE]";

/// How the upstream body is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFormat {
    /// `text/event-stream` with `data:` lines
    Sse,
    /// Raw text appended as-is
    Plain,
}

/// How a stream ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// `[DONE]` observed, or a plain body ran to completion
    Clean,
    /// The connection ended before the sentinel
    Truncated,
}

/// Result of feeding one chunk
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncrementalUpdate {
    /// Text extracted from this chunk
    pub delta: String,
    /// Usage reported by this chunk, if any
    pub usage: Option<TokenUsage>,
    /// Events decoded from this chunk
    pub events: usize,
    /// Whether `[DONE]` has been seen (now or earlier)
    pub done: bool,
    /// Chunks fed so far
    pub chunk_count: usize,
    /// Unparseable payloads so far
    pub parse_skips: usize,
    /// Length of the reassembled content so far
    pub content_len: usize,
}

impl IncrementalUpdate {
    /// Whether this update carries anything an observer cares about
    pub fn is_meaningful(&self) -> bool {
        !self.delta.is_empty() || self.usage.is_some() || self.done
    }
}

/// Summary produced once the stream ends
#[derive(Debug, Clone, PartialEq)]
pub struct FinalRecord {
    pub content: String,
    /// Text produced while flushing the carry buffer at the end
    pub flushed: String,
    pub chunk_count: usize,
    pub event_count: usize,
    pub parse_skips: usize,
    pub usage: Option<TokenUsage>,
    pub termination: Termination,
}

/// Reassembles streamed chunks into content and metadata
#[derive(Debug)]
pub struct StreamAccumulator {
    format: StreamFormat,
    carry: Vec<u8>,
    event_count: usize,
    content: String,
    chunk_count: usize,
    parse_skips: usize,
    usage: Option<TokenUsage>,
    done: bool,
    interrupted: bool,
}

impl StreamAccumulator {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            format,
            carry: Vec::new(),
            event_count: 0,
            content: String::new(),
            chunk_count: 0,
            parse_skips: 0,
            usage: None,
            done: false,
            interrupted: false,
        }
    }

    /// Cumulative reassembled text
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The stream was cut short by the transport; `finish` reports truncation
    pub fn mark_interrupted(&mut self) {
        self.interrupted = true;
    }

    /// Consume one raw chunk
    pub fn feed(&mut self, chunk: &[u8]) -> IncrementalUpdate {
        self.chunk_count += 1;
        let mut update = IncrementalUpdate::default();
        self.carry.extend_from_slice(chunk);

        match self.format {
            StreamFormat::Sse => {
                while let Some(pos) = self.carry.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = self.carry.drain(..=pos).collect();
                    self.process_line(&line[..line.len() - 1], &mut update);
                }
            }
            StreamFormat::Plain => {
                let text = decode_utf8_prefix(&mut self.carry, false);
                self.append(&text, &mut update);
            }
        }

        self.fill_totals(&mut update);
        update
    }

    /// Flush the carry buffer and produce the final record
    pub fn finish(mut self) -> FinalRecord {
        let mut update = IncrementalUpdate::default();
        if !self.carry.is_empty() {
            match self.format {
                StreamFormat::Sse => {
                    let line = std::mem::take(&mut self.carry);
                    self.process_line(&line, &mut update);
                }
                StreamFormat::Plain => {
                    let text = decode_utf8_prefix(&mut self.carry, true);
                    self.append(&text, &mut update);
                }
            }
        }

        let termination = match self.format {
            _ if self.interrupted && !self.done => Termination::Truncated,
            StreamFormat::Sse if !self.done => Termination::Truncated,
            _ => Termination::Clean,
        };

        FinalRecord {
            content: self.content,
            flushed: update.delta,
            chunk_count: self.chunk_count,
            event_count: self.event_count,
            parse_skips: self.parse_skips,
            usage: self.usage,
            termination,
        }
    }

    fn process_line(&mut self, line: &[u8], update: &mut IncrementalUpdate) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() || line.starts_with(b":") || self.done {
            return;
        }
        let Some(payload) = line.strip_prefix(b"data:") else {
            // event:, id: and retry: fields carry nothing we reassemble
            return;
        };
        let payload = payload.strip_prefix(b" ").unwrap_or(payload);
        let payload = String::from_utf8_lossy(payload);
        let payload = payload.trim_end();

        update.events += 1;
        self.event_count += 1;
        if payload == DONE_SENTINEL {
            self.done = true;
            return;
        }

        let json = match serde_json::from_str::<Value>(payload) {
            Ok(json) => json,
            Err(e) => {
                self.parse_skips += 1;
                debug!(error = %e, "Skipping unparseable stream payload");
                return;
            }
        };

        if let Some(text) = extract_payload_text(&json) {
            self.append(&text, update);
        }
        if let Some(usage) = TokenUsage::from_payload(&json) {
            self.usage = Some(usage);
            update.usage = Some(usage);
        }
    }

    fn append(&mut self, text: &str, update: &mut IncrementalUpdate) {
        self.content.push_str(text);
        update.delta.push_str(text);
    }

    fn fill_totals(&self, update: &mut IncrementalUpdate) {
        update.done = self.done;
        update.chunk_count = self.chunk_count;
        update.parse_skips = self.parse_skips;
        update.content_len = self.content.len();
    }
}

/// Text carried by one streamed payload
///
/// Recognizes a top-level string `delta`, `choices[*].delta.content` and
/// the legacy completions shape `choices[*].text`. Text from several
/// choices is concatenated in array order.
pub fn extract_payload_text(payload: &Value) -> Option<String> {
    if let Some(delta) = payload.get("delta").and_then(Value::as_str) {
        return Some(delta.to_string());
    }

    let mut text: Option<String> = None;
    for choice in payload.get("choices")?.as_array()? {
        let piece = choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
            .or_else(|| choice.get("text").and_then(Value::as_str));
        if let Some(piece) = piece {
            text.get_or_insert_with(String::new).push_str(piece);
        }
    }
    text
}

/// Drain the longest valid UTF-8 prefix from `buf`.
///
/// An incomplete trailing sequence stays in the buffer unless `flush` is set;
/// invalid bytes are replaced.
pub(crate) fn decode_utf8_prefix(buf: &mut Vec<u8>, flush: bool) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(buf) {
            Ok(text) => {
                out.push_str(text);
                buf.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&buf[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        buf.drain(..valid + bad);
                    }
                    None if flush => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        buf.clear();
                        return out;
                    }
                    None => {
                        buf.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

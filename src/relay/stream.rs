//! Incremental SSE reformatting of an upstream byte stream

use std::convert::Infallible;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use super::format::{error_event, format_streaming_line, DONE_EVENT};

/// Fragments that may be the start of an SSE or JSON line are held back
/// until their line completes instead of being wrapped as text.
fn looks_structured(chunk: &str) -> bool {
    let head = chunk.trim_start();
    head.starts_with("data:") || head.starts_with('{') || head.starts_with('[')
}

/// Turns arbitrary upstream chunks into well-formed SSE events.
///
/// Bytes of a multi-byte character split across chunks are carried over,
/// as is the trailing partial line.
#[derive(Debug, Default)]
pub struct SseReformatter {
    pending: Vec<u8>,
    buffer: String,
}

impl SseReformatter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk, returning the events it completes
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let text = match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let s = s.to_string();
                self.pending.clear();
                s
            }
            // incomplete sequence at the end: keep it for the next chunk
            Err(e) if e.error_len().is_none() => {
                let valid = e.valid_up_to();
                let s = String::from_utf8_lossy(&self.pending[..valid]).into_owned();
                self.pending.drain(..valid);
                s
            }
            Err(_) => {
                let s = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                s
            }
        };

        self.push_text(&text)
    }

    fn push_text(&mut self, chunk: &str) -> Vec<String> {
        if chunk.is_empty() {
            return Vec::new();
        }

        if self.buffer.is_empty() && !chunk.contains('\n') && !looks_structured(chunk) {
            return format_streaming_line(chunk).into_iter().collect();
        }

        self.buffer.push_str(chunk);
        let Some(last_newline) = self.buffer.rfind('\n') else {
            return Vec::new();
        };

        let rest = self.buffer.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.buffer, rest);

        complete
            .split('\n')
            .filter_map(|line| format_streaming_line(line.trim_end_matches('\r')))
            .collect()
    }

    /// Flush whatever is left once the upstream ends
    pub fn finish(&mut self) -> Option<String> {
        if !self.pending.is_empty() {
            let tail = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            self.buffer.push_str(&tail);
        }
        let rest = std::mem::take(&mut self.buffer);
        format_streaming_line(rest.trim_end_matches('\r'))
    }
}

/// Reformat an upstream body into SSE events.
///
/// The output always ends with `data: [DONE]`. An upstream failure is
/// reported as an inline error event before it.
pub fn reformat_stream<S, E>(upstream: S) -> impl Stream<Item = Result<Bytes, Infallible>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    async_stream::stream! {
        let mut upstream = Box::pin(upstream);
        let mut reformatter = SseReformatter::new();
        let mut failure = None;
        let mut chunks = 0usize;

        while let Some(chunk) = upstream.next().await {
            match chunk {
                Ok(bytes) => {
                    chunks += 1;
                    for event in reformatter.push(&bytes) {
                        yield Ok(Bytes::from(event));
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Upstream stream failed");
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        if let Some(event) = reformatter.finish() {
            yield Ok(Bytes::from(event));
        }
        if let Some(message) = failure {
            yield Ok(Bytes::from(error_event(&message)));
        }

        debug!(chunks, "Upstream stream finished");
        yield Ok(Bytes::from_static(DONE_EVENT.as_bytes()));
    }
}

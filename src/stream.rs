use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use thiserror::Error;

/// Event-line prefix used by the backend's streaming framing.
pub const DATA_PREFIX: &str = "data: ";

// ============================================================================
// Frame Errors
// ============================================================================

/// Problems with a single event line. Never fatal to the stream: the
/// offending line is skipped and later lines keep processing.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("event line is not valid UTF-8")]
    NotUtf8,
    #[error("event payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Line Assembly
// ============================================================================

/// Reassembles newline-delimited lines from a chunked byte stream.
///
/// Chunk boundaries are arbitrary: a chunk may end mid-line or even inside
/// a multi-byte UTF-8 sequence, and a single chunk may carry several
/// complete lines. Bytes after the last newline stay buffered until the
/// next chunk (or [`LineAssembler::finish`] at end of stream).
#[derive(Debug, Default)]
pub struct LineAssembler {
    buf: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the newline itself
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// Flush the trailing unterminated line, if any. Streams are not
    /// guaranteed to end with a newline.
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        if self.buf.is_empty() {
            return None;
        }
        let mut line = std::mem::take(&mut self.buf);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

// ============================================================================
// Event Decoding
// ============================================================================

/// Decode one assembled line into an event payload.
///
/// Returns `Ok(None)` for non-event lines (blank lines, comments,
/// keep-alive pings): those are part of the framing and carry no payload.
/// A `data: ` line that fails to parse is an error the caller reports and
/// skips.
pub fn decode_line<T: DeserializeOwned>(line: &[u8]) -> Result<Option<T>, FrameError> {
    let text = std::str::from_utf8(line).map_err(|_| FrameError::NotUtf8)?;
    let Some(payload) = text.strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    serde_json::from_str(payload).map(Some).map_err(FrameError::from)
}

/// Turns an incrementally-delivered byte stream into typed events.
///
/// The decoder owns the line assembly and the `data: ` filtering, so the
/// same event boundaries come out no matter how the transport fragmented
/// the bytes. Malformed event lines are logged and skipped without
/// disturbing the rest of the stream.
#[derive(Debug)]
pub struct SseDecoder<T> {
    lines: LineAssembler,
    skipped: u64,
    _payload: PhantomData<T>,
}

impl<T: DeserializeOwned> SseDecoder<T> {
    pub fn new() -> Self {
        Self {
            lines: LineAssembler::new(),
            skipped: 0,
            _payload: PhantomData,
        }
    }

    /// Feed one transport chunk; returns every event it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<T> {
        let mut events = Vec::new();
        for line in self.lines.push(chunk) {
            if let Some(event) = self.decode(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Signal end of stream, decoding a final line that arrived without a
    /// terminating newline.
    pub fn finish(&mut self) -> Option<T> {
        let line = self.lines.finish()?;
        self.decode(&line)
    }

    /// Count of event lines dropped as malformed so far.
    pub fn skipped_lines(&self) -> u64 {
        self.skipped
    }

    fn decode(&mut self, line: &[u8]) -> Option<T> {
        match decode_line(line) {
            Ok(event) => event,
            Err(err) => {
                self.skipped += 1;
                log::warn!(
                    "skipping malformed event line ({}): {:?}",
                    err,
                    String::from_utf8_lossy(line)
                );
                None
            }
        }
    }
}

impl<T: DeserializeOwned> Default for SseDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

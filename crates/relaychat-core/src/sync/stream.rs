//! Server-sent-event framing
//!
//! Events are delimited by a blank line; `data:` lines accumulate (joined
//! with `\n` for multi-line payloads); comment lines (leading `:`) are the
//! server's heartbeat: no payload, but they keep the watchdog fed. Other
//! SSE fields are ignored.

/// One recognized frame from the line stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A complete event payload (joined `data:` lines)
    Event(String),
    /// A comment/heartbeat line
    Heartbeat,
}

/// Incremental SSE parser fed one line at a time.
#[derive(Debug, Default)]
pub struct SseParser {
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its terminator); returns a frame when one
    /// completes.
    pub fn push_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() {
                return None;
            }
            let payload = self.data.join("\n");
            self.data.clear();
            return Some(SseFrame::Event(payload));
        }

        if line.starts_with(':') {
            return Some(SseFrame::Heartbeat);
        }

        if let Some(value) = line.strip_prefix("data:") {
            // A single leading space after the colon is part of the framing
            self.data.push(value.strip_prefix(' ').unwrap_or(value).to_string());
        }
        // event:/id:/retry: and unknown fields carry nothing for us
        None
    }
}

/// Splits a byte stream into lines, tolerating chunk boundaries anywhere.
///
/// Handles `\n` and `\r\n` terminators; bytes after the last terminator
/// stay buffered until the next chunk.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every complete line from the buffer.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

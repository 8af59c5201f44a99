//! Incremental decoder for the line-oriented chat stream.
//!
//! The backend writes one `data: <payload>` line per frame, separated by blank
//! lines. Transport chunks do not respect line (or UTF-8) boundaries, so the
//! decoder keeps the raw bytes of the unfinished line between calls.

use serde::Deserialize;

pub const GENERIC_STREAM_ERROR: &str = "stream response error";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Start,
    Content(String),
    End,
    Error(String),
    /// A payload that was not valid JSON. Never fatal.
    Malformed(String),
}

#[derive(Deserialize)]
struct ContentPayload {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    error: Option<String>,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    // Set after a bare `ERROR` frame; the details may follow on the next line.
    awaiting_error_details: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one transport chunk and returns every frame it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(idx) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=idx).collect();
            let line = String::from_utf8_lossy(&line[..idx]);
            self.decode_line(&line, &mut frames);
        }
        frames
    }

    /// Decodes whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            self.decode_line(&line, &mut frames);
        }
        if std::mem::take(&mut self.awaiting_error_details) {
            frames.push(Frame::Error(GENERIC_STREAM_ERROR.to_string()));
        }
        frames
    }

    fn decode_line(&mut self, line: &str, frames: &mut Vec<Frame>) {
        let line = line.trim_end_matches('\r');

        let payload = match line.strip_prefix("data:") {
            Some(data) => data.strip_prefix(' ').unwrap_or(data),
            None if line.is_empty() => {
                self.flush_pending_error(frames);
                return;
            }
            None if self.awaiting_error_details => {
                self.awaiting_error_details = false;
                frames.push(Frame::Error(error_message(line)));
                return;
            }
            None if is_sse_field(line) => return,
            None => line,
        };

        self.flush_pending_error(frames);
        if let Some(frame) = self.decode_payload(payload) {
            frames.push(frame);
        }
    }

    fn decode_payload(&mut self, payload: &str) -> Option<Frame> {
        match payload {
            "START" => return Some(Frame::Start),
            "END" => return Some(Frame::End),
            _ => {}
        }

        if let Some(rest) = payload.strip_prefix("ERROR") {
            let details = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
            if details.is_empty() {
                self.awaiting_error_details = true;
                return None;
            }
            return Some(Frame::Error(error_message(details)));
        }

        match serde_json::from_str::<ContentPayload>(payload) {
            Ok(ContentPayload {
                content: Some(content),
            }) if !content.is_empty() => Some(Frame::Content(content)),
            Ok(_) => None,
            Err(_) => Some(Frame::Malformed(payload.to_string())),
        }
    }

    fn flush_pending_error(&mut self, frames: &mut Vec<Frame>) {
        if std::mem::take(&mut self.awaiting_error_details) {
            frames.push(Frame::Error(GENERIC_STREAM_ERROR.to_string()));
        }
    }
}

fn is_sse_field(line: &str) -> bool {
    line.starts_with(':')
        || line.starts_with("event:")
        || line.starts_with("id:")
        || line.starts_with("retry:")
}

fn error_message(details: &str) -> String {
    serde_json::from_str::<ErrorPayload>(details)
        .ok()
        .and_then(|payload| payload.error)
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| GENERIC_STREAM_ERROR.to_string())
}

//! Incremental `text/event-stream` parser.
//!
//! Feed raw body chunks with [`SseParser::push_bytes`] and collect complete
//! frames. The parser keeps partial lines across chunks, so chunk
//! boundaries (including ones splitting a UTF-8 sequence or a CRLF pair)
//! never corrupt a frame.
//!
//! # Wire Format
//!
//! ```text
//! id: 42
//! data: {"from":"..","message":".."}
//! <blank line dispatches the frame>
//! ```
//!
//! `:` lines are comments (keep-alives), `event:` tags the frame type, and
//! the `id` value persists across frames until the server replaces it.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Last event id in effect when the frame was dispatched.
    pub id: Option<String>,
    /// Optional event type (`event:` field).
    pub event: Option<String>,
    /// Frame payload; multiple `data:` lines are joined with `\n`.
    pub data: String,
}

/// Streaming SSE parser.
#[derive(Debug, Default)]
pub struct SseParser {
    line: Vec<u8>,
    data: String,
    event: Option<String>,
    last_id: Option<String>,
    pending_cr: bool,
}

impl SseParser {
    /// Create an empty parser.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a body chunk and return every frame it completes.
    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        for &byte in chunk {
            match byte {
                b'\n' if self.pending_cr => {
                    // LF completing a CRLF pair; line already processed.
                    self.pending_cr = false;
                }
                b'\r' => {
                    self.pending_cr = true;
                    self.end_line(&mut frames);
                }
                b'\n' => {
                    self.end_line(&mut frames);
                }
                _ => {
                    self.pending_cr = false;
                    self.line.push(byte);
                }
            }
        }
        frames
    }

    /// Flush a trailing unterminated line at end of stream.
    ///
    /// Returns a frame only if the stream ended right at a dispatch point.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.line.is_empty() {
            return None;
        }
        let mut frames = Vec::new();
        self.end_line(&mut frames);
        frames.pop()
    }

    fn end_line(&mut self, frames: &mut Vec<SseFrame>) {
        let line = std::mem::take(&mut self.line);
        if line.is_empty() {
            if let Some(frame) = self.dispatch() {
                frames.push(frame);
            }
            return;
        }
        if line[0] == b':' {
            return; // comment / keep-alive
        }

        let text = String::from_utf8_lossy(&line);
        let (field, value) = match text.find(':') {
            Some(pos) => {
                let value = &text[pos + 1..];
                (&text[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (text.as_ref(), ""),
        };

        match field {
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" => {
                if !value.contains('\0') {
                    self.last_id = Some(value.to_string());
                }
            }
            "event" => {
                self.event = Some(value.to_string());
            }
            // "retry" and unknown fields are ignored; reconnect pacing is
            // the owner's concern, not the stream's.
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        data.pop(); // trailing '\n' from the last data line
        Some(SseFrame {
            id: self.last_id.clone(),
            event,
            data,
        })
    }
}

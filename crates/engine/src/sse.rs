//! Incremental `text/event-stream` decoder.
//!
//! Feed raw body chunks into [`SseDecoder::feed`] as they arrive; it
//! buffers partial lines across chunk boundaries and returns every
//! complete [`SseFrame`]. Field handling follows the server-sent events
//! format: `data` lines are joined with `\n`, one leading space after the
//! colon is stripped, comment lines are reported separately so callers
//! can treat them as keep-alives.

use std::time::Duration;

/// Longest partial line buffered while waiting for its newline.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// One item produced by the decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// A dispatched event.
    Event(SseEvent),
    /// A `:` comment line, typically a server heartbeat.
    Comment(String),
}

/// A dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; `None` for the default (`message`) type.
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    /// Reconnection time requested by the server.
    pub retry: Option<Duration>,
}

/// Stateful line parser for an event stream body.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    max_line: usize,
    /// Skipping the rest of an oversized line.
    discarding: bool,
    event: Option<String>,
    data: Vec<String>,
    /// Last event id; persists across events until the server changes it.
    id: Option<String>,
    retry: Option<Duration>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder that drops lines longer than `max_line` bytes.
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line,
            discarding: false,
            event: None,
            data: Vec::new(),
            id: None,
            retry: None,
        }
    }

    /// Consume a chunk of the body and return the frames it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();

        let mut chunk = chunk;
        if self.discarding {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    self.discarding = false;
                    chunk = &chunk[pos + 1..];
                }
                None => return frames,
            }
        }
        self.buffer.extend_from_slice(chunk);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > self.max_line {
            tracing::warn!(
                bytes = self.buffer.len(),
                "Discarding oversized event-stream line",
            );
            // The event the line belonged to is incomplete.
            self.buffer.clear();
            self.event = None;
            self.data.clear();
            self.discarding = true;
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch().map(SseFrame::Event);
        }

        if let Some(comment) = line.strip_prefix(':') {
            return Some(SseFrame::Comment(comment.trim_start().to_string()));
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // Ids containing NUL are ignored per the event-stream format.
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(ms));
                }
            }
            other => {
                tracing::trace!(field = other, "Ignoring unknown event-stream field");
            }
        }
        None
    }

    /// Emit the buffered event, if it carried any data.
    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let retry = self.retry.take();

        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.filter(|e| !e.is_empty()),
            data,
            id: self.id.clone(),
            retry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(frames: Vec<SseFrame>) -> Vec<SseEvent> {
        frames
            .into_iter()
            .filter_map(|f| match f {
                SseFrame::Event(e) => Some(e),
                SseFrame::Comment(_) => None,
            })
            .collect()
    }

    #[test]
    fn single_unnamed_event() {
        let mut d = SseDecoder::new();
        let out = events(d.feed(b"data: {\"a\":1}\n\n"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event, None);
        assert_eq!(out[0].data, r#"{"a":1}"#);
    }

    #[test]
    fn named_event_with_id_and_retry() {
        let mut d = SseDecoder::new();
        let out = events(d.feed(b"event: connected\nid: 42\nretry: 3000\ndata: ok\n\n"));
        assert_eq!(
            out,
            vec![SseEvent {
                event: Some("connected".into()),
                data: "ok".into(),
                id: Some("42".into()),
                retry: Some(Duration::from_millis(3000)),
            }]
        );
    }

    #[test]
    fn multi_line_data_is_joined() {
        let mut d = SseDecoder::new();
        let out = events(d.feed(b"data: first\ndata:second\n\n"));
        assert_eq!(out[0].data, "first\nsecond");
    }

    #[test]
    fn lines_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"da").is_empty());
        assert!(d.feed(b"ta: hel").is_empty());
        assert!(d.feed(b"lo\r").is_empty());
        let out = events(d.feed(b"\n\r\n"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, "hello");
    }

    #[test]
    fn crlf_line_endings() {
        let mut d = SseDecoder::new();
        let out = events(d.feed(b"event: message\r\ndata: x\r\n\r\n"));
        assert_eq!(out[0].event.as_deref(), Some("message"));
        assert_eq!(out[0].data, "x");
    }

    #[test]
    fn comments_are_reported() {
        let mut d = SseDecoder::new();
        let out = d.feed(b": heartbeat\n\n");
        assert_eq!(out, vec![SseFrame::Comment("heartbeat".into())]);
    }

    #[test]
    fn blank_line_without_data_dispatches_nothing() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"event: ping\n\n").is_empty());
        // The dangling event name must not leak into the next event.
        let out = events(d.feed(b"data: y\n\n"));
        assert_eq!(out[0].event, None);
    }

    #[test]
    fn several_events_in_one_chunk() {
        let mut d = SseDecoder::new();
        let out = events(d.feed(b"data: 1\n\ndata: 2\n\n: hb\n\ndata: 3\n\n"));
        let data: Vec<_> = out.iter().map(|e| e.data.as_str()).collect();
        assert_eq!(data, vec!["1", "2", "3"]);
    }

    #[test]
    fn field_without_colon_and_invalid_retry() {
        let mut d = SseDecoder::new();
        let out = events(d.feed(b"data\nretry: soon\n\n"));
        assert_eq!(out[0].data, "");
        assert_eq!(out[0].retry, None);
    }

    #[test]
    fn last_event_id_persists_until_changed() {
        let mut d = SseDecoder::new();
        let out = events(d.feed(b"id: 7\ndata: a\n\ndata: b\n\nid: 8\ndata: c\n\n"));
        let ids: Vec<_> = out.iter().map(|e| e.id.as_deref()).collect();
        assert_eq!(ids, vec![Some("7"), Some("7"), Some("8")]);
    }

    #[test]
    fn oversized_line_is_dropped_and_decoding_recovers() {
        let mut d = SseDecoder::with_max_line(16);
        assert!(d.feed(b"data: 0123456789").is_empty());
        assert!(d.feed(b"abcdefghij").is_empty());
        assert!(d.feed(b"more junk without end").is_empty());

        let out = events(d.feed(b"tail\n\ndata: ok\n\n"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].data, "ok");
    }
}

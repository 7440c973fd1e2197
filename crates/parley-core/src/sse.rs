//! Incremental server-sent-events parsing
//!
//! Bytes arrive in arbitrary chunks; lines are reassembled across chunk
//! boundaries and grouped into events on blank lines.

/// One dispatched SSE event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, if any (defaults to "message" on the wire)
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`
    pub data: String,
}

impl SseEvent {
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Push-based SSE parser
#[derive(Debug, Default)]
pub struct SseParser {
    partial: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every event completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.feed_line(line) {
                events.push(event);
            }
        }

        events
    }

    /// Flush whatever is buffered once the byte stream ends
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.partial.is_empty() {
            let raw = std::mem::take(&mut self.partial);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(event) = self.feed_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        Some(SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_event() {
        let mut parser = SseParser::new();
        let events = parser.push(b"data: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"a\":1}");
        assert_eq!(events[0].name(), "message");
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"event: endpo").is_empty());
        assert!(parser.push(b"int\ndata: /messages?s").is_empty());
        let events = parser.push(b"ession=1\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "endpoint");
        assert_eq!(events[0].data, "/messages?session=1");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut parser = SseParser::new();
        let events = parser.push(b": keep-alive\ndata: one\ndata: two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"data: [DONE]").is_empty());
        let event = parser.finish().unwrap();
        assert_eq!(event.data, "[DONE]");
        assert!(parser.finish().is_none());
    }

    #[test]
    fn test_blank_lines_without_data_are_ignored() {
        let mut parser = SseParser::new();
        assert!(parser.push(b"\n\nevent: ping\n\n").is_empty());
    }
}

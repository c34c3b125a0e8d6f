//! Incremental decoder for `text/event-stream` bodies.
//!
//! Chunks from the network can split lines (and UTF-8 sequences) anywhere, so bytes are buffered
//! until a full line is available.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, `"message"` when absent.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

/// Turns body chunks into [`SseEvent`]s, keeping partial lines and fields between chunks.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: String,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> SseDecoder {
        SseDecoder::default()
    }

    /// Feed the next chunk of the body. Returns the events completed by it, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        events
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            // comment, used by servers as a keep-alive
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_owned()),
            "data" => {
                self.data.push_str(value);
                self.data.push('\n');
            }
            "id" => self.id = Some(value.to_owned()),
            // `retry` is ignored: the reconnect delay is fixed by configuration.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let id = self.id.take();
        if self.data.is_empty() {
            return None;
        }

        let mut data = std::mem::take(&mut self.data);
        data.pop();
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_owned()),
            data,
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{SseDecoder, SseEvent};

    #[test]
    fn decodes_named_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b"event: unleash-connected\ndata: {\"features\":[]}\n\n");

        assert_eq!(
            events,
            vec![SseEvent {
                event: "unleash-connected".to_owned(),
                data: "{\"features\":[]}".to_owned(),
                id: None,
            }]
        );
    }

    #[test]
    fn reassembles_events_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let body = "event: unleash-updated\r\nid: 7\r\ndata: {\"events\":\r\ndata: []}\r\n\r\n";
        let (head, tail) = body.as_bytes().split_at(17);

        assert!(decoder.feed(head).is_empty());
        let events = decoder.feed(tail);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "unleash-updated");
        assert_eq!(events[0].data, "{\"events\":\n[]}");
        assert_eq!(events[0].id.as_deref(), Some("7"));
    }

    #[test]
    fn keeps_multibyte_characters_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let body = "data: caf\u{e9}\n\n".as_bytes();
        // split inside the two-byte encoding of 'é'
        let (head, tail) = body.split_at(10);

        assert!(decoder.feed(head).is_empty());
        assert_eq!(decoder.feed(tail)[0].data, "caf\u{e9}");
    }

    #[test]
    fn ignores_comments_and_empty_events() {
        let mut decoder = SseDecoder::new();
        let events = decoder.feed(b": keep-alive\n\nevent: ping\n\nretry: 1000\ndata: x\n\n");

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert_eq!(events[0].data, "x");
    }
}

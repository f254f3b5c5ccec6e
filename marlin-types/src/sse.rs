//! Server-Sent Events records and their wire encoding.
//!
//! One [`ServerEvent`] becomes one `text/event-stream` frame. The encoding
//! is exact: a `retry:` hint on the very first event of a stream, the
//! `event:` name unless it is the default `message`, the `id:` when
//! present, and the body split over `data:` lines with newlines
//! normalized to LF.

use serde::{Deserialize, Serialize};

/// The default event name; never written on the wire.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// One server push event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEvent {
    /// Monotonic id within a stream; zero lets the stream assign one.
    pub id: u64,
    /// Event name; `message` is the wire default.
    pub event: String,
    /// Event payload; may span multiple lines.
    pub data: String,
}

impl ServerEvent {
    /// An event with the default `message` name.
    pub fn new(data: impl Into<String>) -> Self {
        ServerEvent {
            id: 0,
            event: DEFAULT_EVENT_NAME.to_owned(),
            data: data.into(),
        }
    }

    /// An event with an explicit name (`close`, `error`, ...).
    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        ServerEvent {
            id: 0,
            event: event.into(),
            data: data.into(),
        }
    }

    /// Encodes the event as one wire frame, blank-line terminated.
    pub fn to_wire(&self) -> String {
        let mut frame = String::new();
        // The retry hint rides along on the first event only
        if self.id == 1 {
            frame.push_str(&format!("retry: {}\n", self.id));
        }
        if !self.event.is_empty() && !self.event.eq_ignore_ascii_case(DEFAULT_EVENT_NAME) {
            frame.push_str(&format!("event: {}\n", self.event));
        }
        if self.id > 0 {
            frame.push_str(&format!("id: {}\n", self.id));
        }
        if !self.data.is_empty() {
            let normalized = self.data.replace("\r\n", "\n").replace('\r', "\n");
            for line in normalized.split('\n') {
                frame.push_str("data: ");
                frame.push_str(line);
                frame.push('\n');
            }
        }
        frame.push('\n');
        frame
    }

    /// Decodes one wire frame back into an event.
    ///
    /// Unknown fields and comment lines (leading `:`) are skipped, as a
    /// client would. Returns `None` for a frame with no fields at all.
    pub fn parse_wire(frame: &str) -> Option<ServerEvent> {
        let mut id = 0u64;
        let mut event = DEFAULT_EVENT_NAME.to_owned();
        let mut data: Option<String> = None;
        let mut seen_field = false;

        for line in frame.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() || line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "id" => {
                    id = value.parse().ok()?;
                    seen_field = true;
                }
                "event" => {
                    event = value.to_owned();
                    seen_field = true;
                }
                "data" => {
                    match &mut data {
                        Some(existing) => {
                            existing.push('\n');
                            existing.push_str(value);
                        }
                        None => data = Some(value.to_owned()),
                    }
                    seen_field = true;
                }
                // retry and unknown fields carry no event state
                _ => {}
            }
        }

        if !seen_field {
            return None;
        }
        Some(ServerEvent {
            id,
            event,
            data: data.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_message_omits_the_event_field() {
        let mut event = ServerEvent::new("hello");
        event.id = 2;
        assert_eq!(event.to_wire(), "id: 2\ndata: hello\n\n");
    }

    #[test]
    fn first_event_carries_the_retry_hint() {
        let mut event = ServerEvent::named("open", "ready");
        event.id = 1;
        assert_eq!(event.to_wire(), "retry: 1\nevent: open\nid: 1\ndata: ready\n\n");
    }

    #[test]
    fn crlf_bodies_are_normalized_and_split() {
        let mut event = ServerEvent::new("line1\r\nline2\rline3");
        event.id = 3;
        assert_eq!(
            event.to_wire(),
            "id: 3\ndata: line1\ndata: line2\ndata: line3\n\n"
        );
    }

    #[test]
    fn wire_round_trip_preserves_the_record() {
        for event in [
            ServerEvent { id: 2, event: "message".into(), data: "plain".into() },
            ServerEvent { id: 5, event: "close".into(), data: "".into() },
            ServerEvent { id: 9, event: "tick".into(), data: "a\nb\nc".into() },
        ] {
            let parsed = ServerEvent::parse_wire(&event.to_wire()).unwrap();
            assert_eq!(parsed, event);
        }
    }

    #[test]
    fn retry_line_is_ignored_when_parsing() {
        let mut event = ServerEvent::new("first");
        event.id = 1;
        let parsed = ServerEvent::parse_wire(&event.to_wire()).unwrap();
        assert_eq!(parsed.id, 1);
        assert_eq!(parsed.data, "first");
    }

    #[test]
    fn comments_and_blank_frames_yield_nothing() {
        assert_eq!(ServerEvent::parse_wire(":keepalive\r\n\r\n"), None);
        assert_eq!(ServerEvent::parse_wire("\n\n"), None);
    }

    #[test]
    fn events_serialize_for_config_and_logs() {
        let event = ServerEvent { id: 4, event: "tick".into(), data: "12:00".into() };
        let json = serde_json::to_string(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}

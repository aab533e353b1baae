//! Request/response log hook
//!
//! The filter strategies report every request head and every relayed
//! response object here. `TracingLogger` is the default sink; `LogRecorder`
//! keeps the lines in memory for embedding and tests.

use crate::mitm::http_parser::{ObjectKind, RequestHead};
use crate::whitelist::FilterDecision;
use std::sync::Mutex;
use tracing::info;

/// Prefix marking a request answered with the canned response
pub const BLOCKED_PREFIX: &str = "[BLOCKED] ";

/// Sink for per-request log events
pub trait LoggerHook: Send + Sync {
    /// Called exactly once per request head, after the filter decision
    fn client_request(&self, head: &RequestHead, target: &str, decision: FilterDecision);

    /// Called for request body objects (kind only)
    fn client_content(&self, _kind: ObjectKind, _decision: FilterDecision) {}

    /// Called for every upstream response object relayed to the client
    fn server_response(&self, kind: ObjectKind);
}

/// Render `METHOD->URI HEADERS->name: value; ...`, prefixed when blocked
///
/// Every header, the last one included, is followed by `; `.
pub fn format_request_line(head: &RequestHead, target: &str, decision: FilterDecision) -> String {
    let headers = head
        .headers
        .iter()
        .map(|(name, value)| format!("{}: {}; ", name, value))
        .collect::<String>();

    let prefix = match decision {
        FilterDecision::Allow => "",
        FilterDecision::Block => BLOCKED_PREFIX,
    };

    format!("{}{}->{} HEADERS->{}", prefix, head.method, target, headers)
}

/// Render `REQUEST <kind>` for a request body object
pub fn format_content_line(kind: ObjectKind) -> String {
    format!("REQUEST {}", kind)
}

/// Render `RESPONSE -> <kind>`
pub fn format_response_line(kind: ObjectKind) -> String {
    format!("RESPONSE -> {}", kind)
}

/// Default sink writing through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl LoggerHook for TracingLogger {
    fn client_request(&self, head: &RequestHead, target: &str, decision: FilterDecision) {
        info!(
            decision = %decision,
            method = %head.method,
            "{}",
            format_request_line(head, target, decision)
        );
    }

    fn client_content(&self, kind: ObjectKind, decision: FilterDecision) {
        info!(decision = %decision, "{}", format_content_line(kind));
    }

    fn server_response(&self, kind: ObjectKind) {
        info!("{}", format_response_line(kind));
    }
}

/// One recorded log event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Request {
        line: String,
        decision: FilterDecision,
    },
    Content(ObjectKind),
    Response(ObjectKind),
}

/// In-memory sink
#[derive(Debug, Default)]
pub struct LogRecorder {
    events: Mutex<Vec<LogEvent>>,
}

impl LogRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: LogEvent) {
        // A poisoned lock only means another session panicked mid-push
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.push(event);
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Request lines in arrival order
    pub fn request_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LogEvent::Request { line, .. } => Some(line),
                _ => None,
            })
            .collect()
    }

    /// Response object kinds in relay order
    pub fn response_kinds(&self) -> Vec<ObjectKind> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                LogEvent::Response(kind) => Some(kind),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl LoggerHook for LogRecorder {
    fn client_request(&self, head: &RequestHead, target: &str, decision: FilterDecision) {
        self.push(LogEvent::Request {
            line: format_request_line(head, target, decision),
            decision,
        });
    }

    fn client_content(&self, kind: ObjectKind, _decision: FilterDecision) {
        self.push(LogEvent::Content(kind));
    }

    fn server_response(&self, kind: ObjectKind) {
        self.push(LogEvent::Response(kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::http_parser::parse_request_head;

    fn head(raw: &[u8]) -> RequestHead {
        parse_request_head(raw).unwrap().unwrap()
    }

    #[test]
    fn test_request_line_format() {
        let head = head(b"GET /a HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n");
        let line = format_request_line(&head, "http://example.com/a", FilterDecision::Allow);
        assert_eq!(
            line,
            "GET->http://example.com/a HEADERS->Host: example.com; Accept: */*; "
        );
    }

    #[test]
    fn test_blocked_line_is_prefixed() {
        let head = head(b"POST /x HTTP/1.1\r\nHost: evil.test\r\n\r\n");
        let line = format_request_line(&head, "http://evil.test/x", FilterDecision::Block);
        assert!(line.starts_with("[BLOCKED] POST->http://evil.test/x"));
    }

    #[test]
    fn test_request_line_without_headers() {
        let head = head(b"GET / HTTP/1.0\r\n\r\n");
        let line = format_request_line(&head, "http://bare.test/", FilterDecision::Allow);
        assert_eq!(line, "GET->http://bare.test/ HEADERS->");
    }

    #[test]
    fn test_content_line_names_kind() {
        assert_eq!(format_content_line(ObjectKind::BodyChunk), "REQUEST BodyChunk");
        assert_eq!(format_content_line(ObjectKind::Trailer), "REQUEST Trailer");
    }

    #[test]
    fn test_response_line_has_kind_only() {
        assert_eq!(
            format_response_line(ObjectKind::ResponseHead),
            "RESPONSE -> ResponseHead"
        );
    }

    #[test]
    fn test_recorder_keeps_order() {
        let recorder = LogRecorder::new();
        let head = head(b"GET / HTTP/1.1\r\nHost: a.test\r\n\r\n");

        recorder.client_request(&head, "http://a.test/", FilterDecision::Allow);
        recorder.server_response(ObjectKind::ResponseHead);
        recorder.server_response(ObjectKind::BodyChunk);

        assert_eq!(recorder.request_lines().len(), 1);
        assert_eq!(
            recorder.response_kinds(),
            vec![ObjectKind::ResponseHead, ObjectKind::BodyChunk]
        );

        recorder.clear();
        assert!(recorder.events().is_empty());
    }
}

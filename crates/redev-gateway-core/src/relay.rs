use serde_json::json;

use crate::{error_envelope, BackendReply};

pub const JSON_CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RelayKind {
    /// Backend JSON, byte-for-byte.
    Json,
    /// Backend sent no body.
    Empty,
    /// Backend sent something that is not JSON; wrapped, never dropped.
    Diagnostic,
}

/// What the caller receives for a backend reply.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RelayedResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: Vec<u8>,
    pub kind: RelayKind,
}

/// Normalizes a backend reply for the caller.
///
/// The status code is always the backend's. Valid JSON is passed through
/// without being re-serialized. Anything else is wrapped in a
/// `malformed_backend_response` envelope carrying the raw text.
#[must_use]
pub fn relay(reply: BackendReply) -> RelayedResponse {
    if reply.body.iter().all(u8::is_ascii_whitespace) {
        return RelayedResponse {
            status: reply.status,
            content_type: JSON_CONTENT_TYPE,
            body: Vec::new(),
            kind: RelayKind::Empty,
        };
    }

    if serde_json::from_slice::<serde_json::Value>(&reply.body).is_ok() {
        return RelayedResponse {
            status: reply.status,
            content_type: JSON_CONTENT_TYPE,
            body: reply.body,
            kind: RelayKind::Json,
        };
    }

    let (raw_body, utf8) = match String::from_utf8(reply.body) {
        Ok(text) => (text, true),
        Err(err) => (String::from_utf8_lossy(err.as_bytes()).into_owned(), false),
    };
    let envelope = error_envelope(
        "malformed_backend_response",
        "backend returned a body that is not JSON",
        Some(json!({
            "backend_status": reply.status,
            "content_type": reply.content_type,
            "raw_body": raw_body,
            "utf8": utf8,
        })),
    );
    RelayedResponse {
        status: reply.status,
        content_type: JSON_CONTENT_TYPE,
        body: envelope.to_string().into_bytes(),
        kind: RelayKind::Diagnostic,
    }
}

use serde_json::Value;

use crate::{ForwardPlan, GatewayError};

/// Raw reply from the backend of record, exactly as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl BackendReply {
    #[must_use]
    pub fn new(status: u16, content_type: Option<String>, body: Vec<u8>) -> Self {
        Self {
            status,
            content_type,
            body,
        }
    }

    /// Convenience constructor for JSON replies.
    #[must_use]
    pub fn json(status: u16, value: &Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: value.to_string().into_bytes(),
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        self.status == 409
    }

    /// Parses the body as JSON, if it is JSON.
    #[must_use]
    pub fn json_body(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Performs exactly one outbound call for a plan.
///
/// Implementations return `Ok` for every HTTP reply, including non-2xx ones;
/// `Err` is reserved for failing to reach the backend at all.
pub trait BackendTransport: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn dispatch(&self, plan: &ForwardPlan) -> Result<BackendReply, GatewayError>;
}

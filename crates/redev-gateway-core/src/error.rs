use serde_json::{json, Value};

use crate::{BackendReply, Operation, Workflow};

pub const GATEWAY_CONTRACT_VERSION: &str = "gateway.v1";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GatewayError {
    #[error("unauthenticated: {operation} requires a session")]
    Unauthenticated { operation: Operation },
    #[error("bad request: {field} {message}")]
    BadRequest { field: String, message: String },
    #[error("unknown operation: {operation} is not exposed for workflow {}", .workflow.map_or("<none>", Workflow::as_str))]
    UnknownOperation {
        workflow: Option<Workflow>,
        operation: String,
    },
    #[error("policy violation: {0}")]
    PolicyViolation(String),
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("backend error: status {}", .0.status)]
    BackendError(BackendReply),
    #[error("malformed backend response: {reason}")]
    MalformedBackendResponse { reason: String, reply: BackendReply },
}

impl GatewayError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::BadRequest {
            field: field.to_string(),
            message: "is required".to_string(),
        }
    }

    pub(crate) fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::BadRequest {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// Stable machine-readable failure kind.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated { .. } => "unauthenticated",
            Self::BadRequest { .. } => "bad_request",
            Self::UnknownOperation { .. } => "unknown_operation",
            Self::PolicyViolation(_) => "policy_violation",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::BackendError(_) => "backend_error",
            Self::MalformedBackendResponse { .. } => "malformed_backend_response",
        }
    }

    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Unauthenticated { .. } => 401,
            Self::BadRequest { .. } => 400,
            Self::UnknownOperation { .. } => 404,
            Self::PolicyViolation(_) => 500,
            Self::BackendUnavailable(_) => 502,
            Self::BackendError(reply) | Self::MalformedBackendResponse { reply, .. } => {
                reply.status
            }
        }
    }

    /// The backend reply this error carries, when the backend answered.
    #[must_use]
    pub fn backend_reply(&self) -> Option<&BackendReply> {
        match self {
            Self::BackendError(reply) | Self::MalformedBackendResponse { reply, .. } => {
                Some(reply)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::BadRequest { field, .. } => Some(json!({ "field": field })),
            Self::UnknownOperation {
                workflow,
                operation,
            } => Some(json!({
                "workflow": workflow.map(Workflow::as_str),
                "operation": operation,
            })),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_envelope(&self) -> Value {
        error_envelope(self.code(), &self.to_string(), self.details())
    }
}

/// Builds the structured error payload returned for every rejection.
#[must_use]
pub fn error_envelope(code: &str, message: &str, details: Option<Value>) -> Value {
    let mut error = json!({
        "code": code,
        "message": message,
    });
    if let (Some(details), Some(object)) = (details, error.as_object_mut()) {
        object.insert("details".to_string(), details);
    }
    json!({
        "service_contract_version": GATEWAY_CONTRACT_VERSION,
        "error": error,
    })
}

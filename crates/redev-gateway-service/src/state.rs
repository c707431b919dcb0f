use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::header::COOKIE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use redev_gateway_core::{
    error_envelope, AccessGateway, AdmissionPolicy, BackendReply, BackendTransport, GatewayError,
    Session, SessionResolver,
};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

#[derive(Clone)]
pub struct GatewayState {
    pub gateway: AccessGateway,
    pub transport: Arc<dyn BackendTransport>,
    pub backend_label: &'static str,
    pub resolver: SessionResolver,
    pub admission: AdmissionPolicy,
    pub operation_timeout: Duration,
    pub telemetry: Arc<GatewayTelemetry>,
}

#[derive(Debug, Clone)]
pub struct ServiceFailure {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = error_envelope(self.code, &self.message, self.details);
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceFailure {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    /// Maps a gateway rejection to its HTTP form.
    pub fn from_gateway(err: &GatewayError) -> Self {
        Self::new(
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::BAD_GATEWAY),
            err.code(),
            err.to_string(),
            err.details(),
        )
    }
}

impl GatewayState {
    pub fn session(&self, headers: &HeaderMap) -> Session {
        self.resolver.resolve(
            headers
                .get_all(COOKIE)
                .iter()
                .filter_map(|value| value.to_str().ok()),
        )
    }

    /// Counts a request rejected before any backend exchange was attempted.
    pub fn reject(&self, failure: ServiceFailure) -> ServiceFailure {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        self.telemetry.record_failure(failure.code, false);
        failure
    }

    /// Runs one admission + backend exchange on the blocking pool.
    ///
    /// The exchange may outlive the timeout; nothing local depends on its
    /// result once the caller has been answered.
    pub async fn run_blocking<F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<BackendReply, ServiceFailure>
    where
        F: FnOnce(&AccessGateway, &dyn BackendTransport) -> Result<BackendReply, GatewayError>
            + Send
            + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let gateway = self.gateway;
        let transport = Arc::clone(&self.transport);
        let handle = tokio::task::spawn_blocking(move || op(&gateway, transport.as_ref()));
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure("backend_unavailable", true);
                warn!(operation = operation_label, "backend call timed out");
                ServiceFailure::new(
                    StatusCode::GATEWAY_TIMEOUT,
                    "backend_unavailable",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            ServiceFailure::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
            )
        })?;

        match op_result {
            Ok(reply) | Err(GatewayError::BackendError(reply)) => {
                self.telemetry.record_reply(reply.status);
                Ok(reply)
            }
            // The backend's status and body go back untouched; relay() wraps
            // anything that is not JSON.
            Err(GatewayError::MalformedBackendResponse { reason, reply }) => {
                warn!(
                    operation = operation_label,
                    backend_status = reply.status,
                    %reason,
                    "relaying malformed backend reply"
                );
                self.telemetry.record_failure("malformed_backend_response", false);
                Ok(reply)
            }
            Err(err) => {
                let failure = ServiceFailure::from_gateway(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
pub struct GatewayTelemetry {
    requests_total: AtomicU64,
    relayed_success_total: AtomicU64,
    relayed_error_total: AtomicU64,
    conflict_total: AtomicU64,
    failure_total: AtomicU64,
    timeout_total: AtomicU64,
    unauthenticated_total: AtomicU64,
    bad_request_total: AtomicU64,
    unknown_operation_total: AtomicU64,
    policy_violation_total: AtomicU64,
    backend_unavailable_total: AtomicU64,
    malformed_backend_response_total: AtomicU64,
    redirect_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
pub struct GatewayTelemetrySnapshot {
    requests_total: u64,
    relayed_success_total: u64,
    relayed_error_total: u64,
    conflict_total: u64,
    failure_total: u64,
    timeout_total: u64,
    unauthenticated_total: u64,
    bad_request_total: u64,
    unknown_operation_total: u64,
    policy_violation_total: u64,
    backend_unavailable_total: u64,
    malformed_backend_response_total: u64,
    redirect_total: u64,
    other_error_total: u64,
}

impl GatewayTelemetry {
    pub fn record_reply(&self, status: u16) {
        if (200..300).contains(&status) {
            self.relayed_success_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.relayed_error_total.fetch_add(1, Ordering::Relaxed);
        }
        if status == 409 {
            self.conflict_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_redirect(&self) {
        self.redirect_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self, code: &str, timeout: bool) {
        self.failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        let counter = match code {
            "unauthenticated" => &self.unauthenticated_total,
            "bad_request" => &self.bad_request_total,
            "unknown_operation" => &self.unknown_operation_total,
            "policy_violation" => &self.policy_violation_total,
            "backend_unavailable" => &self.backend_unavailable_total,
            "malformed_backend_response" => &self.malformed_backend_response_total,
            _ => &self.other_error_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GatewayTelemetrySnapshot {
        GatewayTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            relayed_success_total: self.relayed_success_total.load(Ordering::Relaxed),
            relayed_error_total: self.relayed_error_total.load(Ordering::Relaxed),
            conflict_total: self.conflict_total.load(Ordering::Relaxed),
            failure_total: self.failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            unauthenticated_total: self.unauthenticated_total.load(Ordering::Relaxed),
            bad_request_total: self.bad_request_total.load(Ordering::Relaxed),
            unknown_operation_total: self.unknown_operation_total.load(Ordering::Relaxed),
            policy_violation_total: self.policy_violation_total.load(Ordering::Relaxed),
            backend_unavailable_total: self.backend_unavailable_total.load(Ordering::Relaxed),
            malformed_backend_response_total: self
                .malformed_backend_response_total
                .load(Ordering::Relaxed),
            redirect_total: self.redirect_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

use axum::extract::{Request, State};
use axum::http::header::ACCEPT;
use axum::http::{HeaderMap, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use redev_gateway_core::AdmissionDecision;
use tracing::info;

use crate::api::API_PREFIX;
use crate::state::GatewayState;

fn is_navigation(headers: &HeaderMap) -> bool {
    let navigate = headers
        .get("sec-fetch-mode")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|mode| mode.eq_ignore_ascii_case("navigate"));
    let wants_html = headers
        .get(ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/html"));
    navigate || wants_html
}

/// Sends anonymous page navigations to the login page. API calls are left to
/// per-operation policy.
pub async fn admit_navigation(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    let is_api = path == API_PREFIX || path.starts_with("/api/");
    if request.method() == Method::GET && !is_api && is_navigation(request.headers()) {
        let session = state.session(request.headers());
        let decision = state
            .admission
            .decide(path, request.uri().query(), true, &session);
        if let AdmissionDecision::RedirectToLogin { location } = decision {
            info!(path, "redirecting anonymous navigation to login");
            state.telemetry.record_redirect();
            return Redirect::temporary(&location).into_response();
        }
    }
    next.run(request).await
}

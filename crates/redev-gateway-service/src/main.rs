#![forbid(unsafe_code)]

mod api;
mod navigation;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{DefaultBodyLimit, OriginalUri, State};
use axum::http::Method;
use axum::routing::{any, get};
use axum::{middleware, Json, Router};
use clap::Parser;
use redev_gateway_core::{
    validate_policy_table, AccessGateway, AdmissionPolicy, BackendTransport, GatewayError,
    ScopingPolicy, SessionResolver, DEFAULT_LOGIN_PATH, DEFAULT_PUBLIC_PREFIXES,
    DEFAULT_SESSION_COOKIE, GATEWAY_CONTRACT_VERSION,
};
use redev_gateway_forward::{BackendConfig, SimulatedBackend, UreqTransport, DEFAULT_TIMEOUT_MS};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::{GatewayState, GatewayTelemetry, GatewayTelemetrySnapshot, ServiceFailure};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
    timeout_ms: u64,
    policy_entries: usize,
    telemetry: GatewayTelemetrySnapshot,
}

#[derive(Debug, Parser)]
#[command(name = "redev-gateway-service")]
#[command(about = "Workflow-scoped access gateway for the redevelopment backend")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    /// Base url of the backend of record.
    #[arg(long, required_unless_present = "simulate_backend")]
    backend_url: Option<String>,
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS)]
    operation_timeout_ms: u64,
    #[arg(long, default_value = DEFAULT_SESSION_COOKIE)]
    session_cookie: String,
    #[arg(long, default_value = DEFAULT_LOGIN_PATH)]
    login_path: String,
    /// Path prefix reachable without a session; repeatable. Replaces the defaults.
    #[arg(long = "public-path")]
    public_paths: Vec<String>,
    /// Answer from an in-memory backend instead of forwarding.
    #[arg(long)]
    simulate_backend: bool,
    #[arg(long, default_value = "info")]
    log: String,
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: GATEWAY_CONTRACT_VERSION,
        data,
    }
}

fn app(state: GatewayState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/policy", get(policy_list))
        .route("/api/*operation", any(api::dispatch))
        .fallback(unknown_route)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            navigation::admit_navigation,
        ))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_state(args: &Args) -> Result<GatewayState> {
    let gateway = AccessGateway::new();
    validate_policy_table(gateway.table()).context("scoping policy table is defective")?;

    let transport: Arc<dyn BackendTransport> = if args.simulate_backend {
        Arc::new(SimulatedBackend::new())
    } else {
        let base_url = args
            .backend_url
            .as_deref()
            .context("--backend-url is required unless --simulate-backend is set")?;
        Arc::new(UreqTransport::new(BackendConfig::new(
            base_url,
            args.operation_timeout_ms,
        )?))
    };
    let backend_label = if args.simulate_backend {
        "simulated"
    } else {
        "http"
    };

    let public_paths = if args.public_paths.is_empty() {
        DEFAULT_PUBLIC_PREFIXES
            .iter()
            .map(|prefix| (*prefix).to_string())
            .collect()
    } else {
        args.public_paths.clone()
    };

    Ok(GatewayState {
        gateway,
        transport,
        backend_label,
        resolver: SessionResolver::new(args.session_cookie.clone()),
        admission: AdmissionPolicy::new(args.login_path.clone(), public_paths),
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(GatewayTelemetry::default()),
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    let state = build_state(&args)?;
    info!(
        bind = %args.bind,
        backend = state.backend_label,
        policy_entries = state.gateway.table().len(),
        "starting redev gateway"
    );
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn health(State(state): State<GatewayState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        backend: state.backend_label,
        timeout_ms,
        policy_entries: state.gateway.table().len(),
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn policy_list(
    State(state): State<GatewayState>,
) -> Json<ServiceEnvelope<&'static [ScopingPolicy]>> {
    Json(envelope(state.gateway.table()))
}

async fn unknown_route(
    State(state): State<GatewayState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
) -> ServiceFailure {
    let err = GatewayError::UnknownOperation {
        workflow: None,
        operation: format!("{method} {}", uri.path()),
    };
    state.reject(ServiceFailure::from_gateway(&err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    use axum::body::{to_bytes, Body};
    use axum::http::StatusCode;
    use axum::response::Response;
    use http::Request;
    use jsonschema::JSONSchema;
    use redev_gateway_core::{BackendReply, ForwardPlan};
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tower::ServiceExt;

    const SESSION_COOKIE: &str = "token=tok-admin";

    fn test_state(transport: Arc<dyn BackendTransport>, timeout_ms: u64) -> GatewayState {
        GatewayState {
            gateway: AccessGateway::new(),
            transport,
            backend_label: "test",
            resolver: SessionResolver::default(),
            admission: AdmissionPolicy::default(),
            operation_timeout: Duration::from_millis(timeout_ms),
            telemetry: Arc::new(GatewayTelemetry::default()),
        }
    }

    fn simulated() -> (Arc<SimulatedBackend>, GatewayState) {
        let backend = Arc::new(SimulatedBackend::new());
        let transport: Arc<dyn BackendTransport> = backend.clone();
        (backend, test_state(transport, 2500))
    }

    fn repo_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
    }

    fn assert_schema(schema_name: &str, value: &Value) {
        let path = repo_root().join("contracts/v1/schemas").join(schema_name);
        let body = std::fs::read_to_string(&path)
            .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
        let schema: Value = serde_json::from_str(&body)
            .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()));
        let compiled = JSONSchema::compile(&schema)
            .unwrap_or_else(|err| panic!("failed to compile {}: {err}", path.display()));
        if let Some(errors) = compiled
            .validate(value)
            .err()
            .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
        {
            panic!("schema validation failed for {schema_name}:\n{}", errors.join("\n"));
        }
    }

    async fn send(router: Router, request: Request<Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn request(
        method: &str,
        uri: &str,
        cookie: Option<&str>,
        body: Option<Value>,
    ) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(cookie) = cookie {
            builder = builder.header("cookie", cookie);
        }
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        builder
            .body(body)
            .unwrap_or_else(|err| panic!("failed to build request: {err}"))
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!(
                "response body is not JSON: {err}; body={}",
                String::from_utf8_lossy(&bytes)
            ),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok() {
        let (_, state) = simulated();
        let response = send(app(state), request("GET", "/v1/health", None, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["service_contract_version"], json!(GATEWAY_CONTRACT_VERSION));
        assert_eq!(value["data"]["status"], json!("ok"));
        assert_eq!(value["data"]["policy_entries"], json!(15));
    }

    #[tokio::test]
    async fn policy_endpoint_lists_every_operation() {
        let (_, state) = simulated();
        let response = send(app(state), request("GET", "/v1/policy", None, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_schema("policy-table.schema.json", &value);
        let transition = value["data"]
            .as_array()
            .and_then(|entries| {
                entries
                    .iter()
                    .find(|entry| entry["operation"] == json!("phase_transition"))
            })
            .cloned()
            .unwrap_or_default();
        assert_eq!(transition["forbidden_headers"], json!(["x-workflow"]));
    }

    #[tokio::test]
    async fn unauthenticated_call_is_rejected_without_backend_traffic() {
        let (backend, state) = simulated();
        let response = send(
            app(state),
            request("GET", "/api/clearland/phase/current?projectId=P1", None, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], json!("unauthenticated"));
        assert_schema("error-envelope.schema.json", &value);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn bids_ask_without_project_is_bad_request() {
        let (backend, state) = simulated();
        let response = send(
            app(state),
            request(
                "POST",
                "/api/bids/ask",
                Some(SESSION_COOKIE),
                Some(json!({"workflow": "saleable", "price": 1200})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], json!("bad_request"));
        assert_eq!(value["error"]["details"]["field"], json!("projectId"));
        assert_schema("error-envelope.schema.json", &value);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn conflicting_query_and_body_scope_is_refused() {
        let (backend, state) = simulated();
        let response = send(
            app(state),
            request(
                "POST",
                "/api/bids/ask?workflow=slum&projectId=P1",
                Some(SESSION_COOKIE),
                Some(json!({"projectId": "P2", "price": 10})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn phase_transition_is_relayed_with_project_header_only() {
        let (backend, state) = simulated();
        let router = app(state);
        let response = send(
            router.clone(),
            request(
                "POST",
                "/api/clearland/phase/transition",
                Some(SESSION_COOKIE),
                Some(json!({"projectId": "P1", "targetPhase": "CONSENT", "workflow": "slum"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["phase"], json!("CONSENT"));

        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].headers.get("x-project-id"), Some("P1"));
        assert!(!calls[0].headers.contains("x-workflow"));

        let rejected = send(
            router,
            request(
                "POST",
                "/api/clearland/phase/transition",
                Some(SESSION_COOKIE),
                Some(json!({"projectId": "P1", "targetPhase": "SETTLEMENT"})),
            ),
        )
        .await;
        assert_eq!(rejected.status(), StatusCode::CONFLICT);
        let value = response_json(rejected).await;
        assert_eq!(value["error"], json!("illegal phase transition"));
    }

    #[tokio::test]
    async fn round_conflict_reaches_caller_verbatim() {
        let (_, state) = simulated();
        let router = app(state);
        for (uri, body, expected) in [
            ("/api/slum/rounds/open", json!({"projectId": "S1"}), StatusCode::OK),
            ("/api/slum/rounds/close", json!({"projectId": "S1", "t": 0}), StatusCode::OK),
            ("/api/slum/rounds/close", json!({"projectId": "S1", "t": 0}), StatusCode::CONFLICT),
        ] {
            let response = send(
                router.clone(),
                request("POST", uri, Some(SESSION_COOKIE), Some(body)),
            )
            .await;
            assert_eq!(response.status(), expected, "{uri}");
        }
        let response = send(
            router,
            request(
                "GET",
                "/api/rounds/current?workflow=slum&projectId=S1",
                Some(SESSION_COOKIE),
                None,
            ),
        )
        .await;
        let value = response_json(response).await;
        assert_eq!(value["round"], json!({"t": 0, "state": "CLOSED"}));
    }

    #[tokio::test]
    async fn anonymous_navigation_is_redirected_to_login() {
        let (backend, state) = simulated();
        let response = send(
            app(state),
            Request::builder()
                .method("GET")
                .uri("/slum/projects?tab=rounds")
                .header("sec-fetch-mode", "navigate")
                .body(Body::empty())
                .unwrap_or_else(|err| panic!("failed to build request: {err}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        let location = response
            .headers()
            .get("location")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert_eq!(location, "/login?next=/slum/projects%3Ftab%3Drounds");
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn unknown_route_is_unknown_operation() {
        let (_, state) = simulated();
        let response = send(
            app(state),
            request("GET", "/api/saleable/rounds/open", Some(SESSION_COOKIE), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], json!("unknown_operation"));
        assert_schema("error-envelope.schema.json", &value);
    }

    #[tokio::test]
    async fn document_upload_forwards_multipart_form() {
        let (backend, state) = simulated();
        let boundary = "X-TEST-BOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"projectId\"\r\n\r\nS2\r\n\
--{boundary}\r\nContent-Disposition: form-data; name=\"portalType\"\r\n\r\nresident\r\n\
--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"id.png\"\r\n\
Content-Type: image/png\r\n\r\nPNGDATA\r\n--{boundary}--\r\n"
        );
        let response = send(
            app(state),
            Request::builder()
                .method("POST")
                .uri("/api/slum/documents/upload")
                .header("cookie", SESSION_COOKIE)
                .header("content-type", format!("multipart/form-data; boundary={boundary}"))
                .body(Body::from(body))
                .unwrap_or_else(|err| panic!("failed to build request: {err}")),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        let value = response_json(response).await;
        assert_eq!(value["document"]["fileName"], json!("id.png"));
        assert_eq!(value["document"]["bytes"], json!(7));
        assert_eq!(backend.calls()[0].headers.names().collect::<Vec<_>>(), vec!["authorization"]);
    }

    struct NonJsonBackend;

    impl BackendTransport for NonJsonBackend {
        fn dispatch(&self, _plan: &ForwardPlan) -> Result<BackendReply, GatewayError> {
            Ok(BackendReply::new(
                503,
                Some("text/html".to_string()),
                b"<h1>maintenance</h1>".to_vec(),
            ))
        }
    }

    #[tokio::test]
    async fn non_json_backend_reply_is_wrapped_with_status_preserved() {
        let state = test_state(Arc::new(NonJsonBackend), 2500);
        let response = send(
            app(state),
            request("GET", "/api/auth/me", Some(SESSION_COOKIE), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], json!("malformed_backend_response"));
        assert_eq!(value["error"]["details"]["raw_body"], json!("<h1>maintenance</h1>"));
    }

    struct PlainTextBackend;

    impl BackendTransport for PlainTextBackend {
        fn dispatch(&self, _plan: &ForwardPlan) -> Result<BackendReply, GatewayError> {
            Ok(BackendReply::new(
                200,
                Some("text/plain".to_string()),
                b"round opened".to_vec(),
            ))
        }
    }

    #[tokio::test]
    async fn malformed_transition_reply_keeps_backend_status_and_text() {
        let state = test_state(Arc::new(PlainTextBackend), 2500);
        let router = app(state.clone());
        let response = send(
            router,
            request(
                "POST",
                "/api/slum/rounds/open",
                Some(SESSION_COOKIE),
                Some(json!({"projectId": "S1"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], json!("malformed_backend_response"));
        assert_eq!(value["error"]["details"]["backend_status"], json!(200));
        assert_eq!(value["error"]["details"]["raw_body"], json!("round opened"));
        assert_schema("error-envelope.schema.json", &value);
        let snapshot = serde_json::to_value(state.telemetry.snapshot()).unwrap_or_default();
        assert_eq!(snapshot["malformed_backend_response_total"], json!(1));
    }

    struct StalledBackend {
        delay: Duration,
        calls: Mutex<usize>,
    }

    impl BackendTransport for StalledBackend {
        fn dispatch(&self, _plan: &ForwardPlan) -> Result<BackendReply, GatewayError> {
            if let Ok(mut calls) = self.calls.lock() {
                *calls += 1;
            }
            std::thread::sleep(self.delay);
            Ok(BackendReply::json(200, &json!({"user": {"id": "late"}})))
        }
    }

    #[tokio::test]
    async fn slow_backend_times_out_as_unavailable() {
        let backend = Arc::new(StalledBackend {
            delay: Duration::from_millis(300),
            calls: Mutex::new(0),
        });
        let state = test_state(backend, 20);
        let router = app(state.clone());
        let response = send(
            router,
            request("GET", "/api/auth/me", Some(SESSION_COOKIE), None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], json!("backend_unavailable"));
        assert_schema("error-envelope.schema.json", &value);
        let snapshot = serde_json::to_value(state.telemetry.snapshot()).unwrap_or_default();
        assert_eq!(snapshot["timeout_total"], json!(1));
    }
}

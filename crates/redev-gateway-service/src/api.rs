use axum::body::{to_bytes, Body};
use axum::extract::{FromRequest, Multipart, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use redev_gateway_core::{
    relay, AccessGateway, AuthRequirement, BackendReply, BackendTransport, BodyKind, FilePart,
    GatewayError, HttpMethod, InputField, MultipartForm, Operation, OperationInputs,
    PhaseController, PhaseTransitionOutcome, RelayKind, RoundController, ScopingPolicy, Session,
    TransitionOutcome, Workflow, WorkflowBinding,
};
use tracing::debug;

use crate::state::{GatewayState, ServiceFailure};

pub const API_PREFIX: &str = "/api";
const MAX_JSON_BODY_BYTES: usize = 1024 * 1024;

/// Entry point for every `/api/...` route.
///
/// The inbound path is the backend route under [`API_PREFIX`]; the policy
/// entry for it fixes the operation and, for workflow-specific routes, the
/// workflow.
pub async fn dispatch(State(state): State<GatewayState>, request: Request) -> Response {
    match handle(&state, request).await {
        Ok(reply) => relayed(reply),
        Err(failure) => failure.into_response(),
    }
}

async fn handle(state: &GatewayState, request: Request) -> Result<BackendReply, ServiceFailure> {
    let path = request.uri().path().to_string();
    let method = request.method().clone();
    let session = state.session(request.headers());

    let policy = lookup(state.gateway.table(), &method, &path).ok_or_else(|| {
        state.reject(ServiceFailure::from_gateway(&GatewayError::UnknownOperation {
            workflow: None,
            operation: format!("{method} {path}"),
        }))
    })?;
    let route_workflow = match policy.binding {
        WorkflowBinding::Only(bound) => Some(bound),
        WorkflowBinding::Any | WorkflowBinding::Unscoped => None,
    };
    let operation = policy.operation;
    if policy.auth == AuthRequirement::Required && !session.is_authenticated() {
        return Err(state.reject(ServiceFailure::from_gateway(
            &GatewayError::Unauthenticated { operation },
        )));
    }

    let inputs = read_inputs(state, policy.body, request)
        .await
        .map_err(|err| state.reject(ServiceFailure::from_gateway(&err)))?;
    if let Some(field) = inputs.conflicts().first() {
        return Err(state.reject(ServiceFailure::from_gateway(&GatewayError::BadRequest {
            field: field.key().to_string(),
            message: "has different values in the query and the body".to_string(),
        })));
    }
    debug!(
        %operation,
        path = %path,
        authenticated = session.is_authenticated(),
        "inbound operation"
    );

    state
        .run_blocking(operation.as_str(), move |gateway, transport| {
            execute(gateway, transport, route_workflow, operation, &inputs, &session)
        })
        .await
}

fn lookup(
    table: &'static [ScopingPolicy],
    method: &Method,
    path: &str,
) -> Option<&'static ScopingPolicy> {
    let route = path.strip_prefix(API_PREFIX)?;
    table.iter().find(|policy| {
        policy.route == route
            && match policy.method {
                HttpMethod::Get => *method == Method::GET,
                HttpMethod::Post => *method == Method::POST,
            }
    })
}

/// Lifecycle transitions go through their controllers; everything else is a
/// plain admit-and-forward.
fn execute(
    gateway: &AccessGateway,
    transport: &dyn BackendTransport,
    route_workflow: Option<Workflow>,
    operation: Operation,
    inputs: &OperationInputs,
    session: &Session,
) -> Result<BackendReply, GatewayError> {
    let project_id = inputs.get(InputField::ProjectId).unwrap_or_default();
    match (operation, route_workflow) {
        (Operation::RoundOpen, Some(workflow)) => {
            RoundController::new(gateway, transport, workflow)
                .open(session, project_id)
                .map(TransitionOutcome::into_reply)
        }
        (Operation::RoundClose | Operation::RoundLock, Some(workflow)) => {
            let t = inputs.round_index()?;
            let rounds = RoundController::new(gateway, transport, workflow);
            let outcome = if operation == Operation::RoundClose {
                rounds.close(session, project_id, t)
            } else {
                rounds.lock(session, project_id, t)
            };
            outcome.map(TransitionOutcome::into_reply)
        }
        (Operation::PhaseTransition, Some(workflow)) => {
            let target = inputs.get(InputField::TargetPhase).unwrap_or_default();
            PhaseController::new(gateway, transport, workflow)
                .transition(session, project_id, target)
                .map(PhaseTransitionOutcome::into_reply)
        }
        _ => {
            let plan = gateway.handle(route_workflow, operation, inputs, session)?;
            transport.dispatch(&plan)
        }
    }
}

async fn read_inputs(
    state: &GatewayState,
    body_kind: BodyKind,
    request: Request,
) -> Result<OperationInputs, GatewayError> {
    let query_pairs = match Query::<Vec<(String, String)>>::try_from_uri(request.uri()) {
        Ok(Query(pairs)) => pairs,
        Err(rejection) => return Err(bad_request("query", rejection.body_text())),
    };
    let inputs = OperationInputs::new()
        .with_query(query_pairs.iter().map(|(key, value)| (key.as_str(), value.as_str())));

    match body_kind {
        BodyKind::Empty => Ok(inputs),
        BodyKind::Json => {
            let bytes = to_bytes(request.into_body(), MAX_JSON_BODY_BYTES)
                .await
                .map_err(|err| bad_request("body", format!("could not be read: {err}")))?;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                return Ok(inputs);
            }
            let body = serde_json::from_slice(&bytes)
                .map_err(|err| bad_request("body", format!("is not valid JSON: {err}")))?;
            Ok(inputs.with_json_body(body))
        }
        BodyKind::Multipart => {
            let multipart = Multipart::from_request(request, state)
                .await
                .map_err(|rejection| bad_request("file", rejection.body_text()))?;
            Ok(inputs.with_multipart(read_form(multipart).await?))
        }
    }
}

async fn read_form(mut multipart: Multipart) -> Result<MultipartForm, GatewayError> {
    let mut form = MultipartForm::default();
    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|err| bad_request("file", err.body_text()))?;
        let Some(field) = field else {
            break;
        };
        let name = field.name().unwrap_or_default().to_string();
        if let Some(file_name) = field.file_name().map(str::to_string) {
            let content_type = field.content_type().map(str::to_string);
            let bytes = field
                .bytes()
                .await
                .map_err(|err| bad_request("file", err.body_text()))?;
            if form.file.is_some() {
                return Err(bad_request("file", "only one file part is accepted"));
            }
            form.file = Some(FilePart {
                field_name: name,
                file_name: Some(file_name),
                content_type,
                bytes: bytes.to_vec(),
            });
        } else {
            let value = field
                .text()
                .await
                .map_err(|err| bad_request(&name, err.body_text()))?;
            form.fields.push((name, value));
        }
    }
    Ok(form)
}

fn bad_request(field: &str, message: impl Into<String>) -> GatewayError {
    GatewayError::BadRequest {
        field: field.to_string(),
        message: message.into(),
    }
}

fn relayed(reply: BackendReply) -> Response {
    let relayed = relay(reply);
    let status = StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::BAD_GATEWAY);
    if relayed.kind == RelayKind::Empty {
        return status.into_response();
    }
    let mut response = (status, Body::from(relayed.body)).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(relayed.content_type));
    response
}

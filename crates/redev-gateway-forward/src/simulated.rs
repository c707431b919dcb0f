use std::collections::BTreeMap;
use std::sync::Mutex;

use redev_gateway_core::{
    BackendReply, BackendTransport, ForwardPlan, GatewayError, HttpMethod, Phase, PhaseEntry,
    PlanBody, RoundState,
};
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::debug;
use ulid::Ulid;

const ANONYMOUS_USER: &str = "sim-user";

#[derive(Debug)]
struct ProjectState {
    phase_history: Vec<PhaseEntry>,
    /// Index is the round number `t`.
    rounds: Vec<RoundState>,
    members: BTreeMap<String, String>,
    bids: Vec<Value>,
    documents: Vec<Value>,
}

impl ProjectState {
    fn new() -> Self {
        Self {
            phase_history: vec![PhaseEntry {
                phase: Phase::Enrollment,
                at: OffsetDateTime::now_utc(),
            }],
            rounds: Vec::new(),
            members: BTreeMap::new(),
            bids: Vec::new(),
            documents: Vec::new(),
        }
    }

    fn phase(&self) -> Phase {
        self.phase_history
            .last()
            .map_or(Phase::Enrollment, |entry| entry.phase)
    }
}

#[derive(Debug, Default)]
struct SimState {
    users: BTreeMap<String, String>,
    projects: BTreeMap<String, ProjectState>,
    calls: Vec<ForwardPlan>,
}

impl SimState {
    fn project(&mut self, project_id: &str) -> &mut ProjectState {
        self.projects
            .entry(project_id.to_string())
            .or_insert_with(ProjectState::new)
    }
}

/// In-memory backend of record.
///
/// Answers every route in the policy table the way the real backend does:
/// it authenticates bearer tokens, reads scope from the context headers, and
/// enforces the round and phase orderings itself. Rounds are keyed by
/// project id alone.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    state: Mutex<SimState>,
}

impl SimulatedBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Names the user `auth/me` reports for `token`. Unregistered tokens are
    /// accepted as an anonymous member.
    #[must_use]
    pub fn with_user(self, token: &str, user_id: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.users.insert(token.to_string(), user_id.to_string());
        }
        self
    }

    /// Every plan received so far, in arrival order.
    #[must_use]
    pub fn calls(&self) -> Vec<ForwardPlan> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.state.lock().map_or(0, |state| state.calls.len())
    }
}

impl BackendTransport for SimulatedBackend {
    fn dispatch(&self, plan: &ForwardPlan) -> Result<BackendReply, GatewayError> {
        let mut state = self.state.lock().map_err(|_| {
            GatewayError::BackendUnavailable("simulated backend state is poisoned".to_string())
        })?;
        state.calls.push(plan.clone());
        let request = Incoming { plan };
        let reply = route(&mut state, &request);
        debug!(
            request_id = %plan.request_id,
            route = plan.route,
            status = reply.status,
            "simulated backend replied"
        );
        Ok(reply)
    }
}

struct Incoming<'a> {
    plan: &'a ForwardPlan,
}

impl Incoming<'_> {
    fn bearer(&self) -> Option<&str> {
        self.plan
            .headers
            .get("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .filter(|token| !token.is_empty())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.plan.headers.get(name)
    }

    fn query(&self, key: &str) -> Option<&str> {
        self.plan
            .query
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, value)| value.as_str())
    }

    fn field(&self, key: &str) -> Option<String> {
        let value = match &self.plan.body {
            PlanBody::Json(body) => match body.get(key) {
                Some(Value::String(value)) => Some(value.clone()),
                Some(Value::Number(value)) => Some(value.to_string()),
                _ => None,
            },
            PlanBody::Multipart(form) => form
                .fields
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone()),
            PlanBody::Empty => None,
        };
        value.filter(|value| !value.trim().is_empty())
    }
}

fn reply(status: u16, value: &Value) -> BackendReply {
    BackendReply::json(status, value)
}

fn error_reply(status: u16, message: &str) -> BackendReply {
    reply(status, &json!({ "error": message }))
}

fn round_json(t: usize, state: RoundState) -> Value {
    json!({ "t": t, "state": state.as_str() })
}

fn route(state: &mut SimState, request: &Incoming<'_>) -> BackendReply {
    let plan = request.plan;
    let anonymous_allowed = matches!(plan.route, "/bids/ask" | "/bids/preferences");
    let user = match request.bearer() {
        Some(token) => Some(
            state
                .users
                .get(token)
                .cloned()
                .unwrap_or_else(|| ANONYMOUS_USER.to_string()),
        ),
        None if anonymous_allowed => None,
        None => return error_reply(401, "unauthorized"),
    };

    match (plan.method, plan.route) {
        (HttpMethod::Get, "/auth/me") => reply(200, &json!({ "user": { "id": user } })),
        (HttpMethod::Get, "/settlement/diagnostics") => settlement_diagnostics(state, request),
        (HttpMethod::Post, "/bids/ask") => record_bid(state, request, "ask", user),
        (HttpMethod::Post, "/bids/preferences") => record_bid(state, request, "preferences", user),
        (HttpMethod::Post, "/clearland/membership/enroll") => enroll(state, request),
        (HttpMethod::Get, "/clearland/phase/current") => {
            with_clearland_scope(state, request, |project| {
                reply(200, &json!({ "phase": project.phase().as_str() }))
            })
        }
        (HttpMethod::Get, "/clearland/phase/history") => {
            with_clearland_scope(state, request, |project| {
                match serde_json::to_value(&project.phase_history) {
                    Ok(history) => reply(200, &json!({ "history": history })),
                    Err(err) => error_reply(500, &format!("history encoding failed: {err}")),
                }
            })
        }
        (HttpMethod::Post, "/clearland/phase/transition") => transition_phase(state, request),
        (HttpMethod::Get, "/contracts/by-project") => contracts(state, request),
        (HttpMethod::Get, "/rounds/current") => current_round(state, request),
        (HttpMethod::Post, "/slum/rounds/open") => open_round(state, request),
        (HttpMethod::Post, "/slum/rounds/close") => {
            advance_round(state, request, RoundState::Closed)
        }
        (HttpMethod::Post, "/slum/rounds/lock" | "/rounds/lock") => {
            advance_round(state, request, RoundState::Locked)
        }
        (HttpMethod::Post, "/slum/documents/upload") => upload_document(state, request),
        _ => error_reply(404, "not found"),
    }
}

fn scope<'r>(request: &'r Incoming<'_>) -> Result<(&'r str, &'r str), BackendReply> {
    match (request.header("x-workflow"), request.header("x-project-id")) {
        (Some(workflow), Some(project_id)) => Ok((workflow, project_id)),
        _ => Err(error_reply(400, "x-workflow and x-project-id are required")),
    }
}

fn with_clearland_scope(
    state: &mut SimState,
    request: &Incoming<'_>,
    answer: impl FnOnce(&ProjectState) -> BackendReply,
) -> BackendReply {
    match scope(request) {
        Ok(("clearland", project_id)) => answer(state.project(project_id)),
        Ok((other, _)) => error_reply(400, &format!("workflow {other} has no phases")),
        Err(reply) => reply,
    }
}

fn settlement_diagnostics(state: &mut SimState, request: &Incoming<'_>) -> BackendReply {
    let (workflow, project_id) = match scope(request) {
        Ok(scope) => scope,
        Err(reply) => return reply,
    };
    let Some(t) = request.query("t").and_then(|raw| raw.parse::<usize>().ok()) else {
        return error_reply(400, "t is required");
    };
    let project = state.project(project_id);
    let Some(round) = project.rounds.get(t).copied() else {
        return error_reply(404, "round not found");
    };
    reply(
        200,
        &json!({
            "workflow": workflow,
            "projectId": project_id,
            "round": round_json(t, round),
            "bids": project.bids.len(),
            "ready": round == RoundState::Locked,
        }),
    )
}

fn record_bid(
    state: &mut SimState,
    request: &Incoming<'_>,
    kind: &str,
    user: Option<String>,
) -> BackendReply {
    let (workflow, project_id) = match scope(request) {
        Ok(scope) => scope,
        Err(reply) => return reply,
    };
    let PlanBody::Json(body) = &request.plan.body else {
        return error_reply(400, "bid body must be JSON");
    };
    let bid_id = Ulid::new().to_string();
    state.project(project_id).bids.push(json!({
        "bidId": bid_id,
        "kind": kind,
        "workflow": workflow,
        "bidder": user,
        "body": body,
    }));
    reply(
        201,
        &json!({ "bidId": bid_id, "kind": kind, "projectId": project_id }),
    )
}

fn enroll(state: &mut SimState, request: &Incoming<'_>) -> BackendReply {
    if request.header("x-workflow").is_some() {
        return error_reply(400, "x-workflow must not be sent; the workflow is inferred");
    }
    let Some(project_id) = request.header("x-project-id") else {
        return error_reply(400, "x-project-id is required");
    };
    let (Some(participant_id), Some(role)) =
        (request.field("participantId"), request.field("role"))
    else {
        return error_reply(400, "participantId and role are required");
    };
    let project = state.project(project_id);
    if project.members.contains_key(&participant_id) {
        return error_reply(409, "participant already enrolled");
    }
    project.members.insert(participant_id.clone(), role.clone());
    reply(
        201,
        &json!({ "membership": {
            "projectId": project_id,
            "participantId": participant_id,
            "role": role,
        }}),
    )
}

/// The backend's own phase ordering.
fn next_phase(phase: Phase) -> Option<Phase> {
    match phase {
        Phase::Enrollment => Some(Phase::Consent),
        Phase::Consent => Some(Phase::Bidding),
        Phase::Bidding => Some(Phase::Settlement),
        Phase::Settlement => None,
    }
}

fn transition_phase(state: &mut SimState, request: &Incoming<'_>) -> BackendReply {
    if request.header("x-workflow").is_some() {
        return error_reply(400, "x-workflow must not be sent; the workflow is inferred");
    }
    let Some(project_id) = request.header("x-project-id") else {
        return error_reply(400, "x-project-id is required");
    };
    let Some(target) = request.field("targetPhase").as_deref().and_then(Phase::parse) else {
        return error_reply(422, "targetPhase names no known phase");
    };
    let project = state.project(project_id);
    let current = project.phase();
    if next_phase(current) != Some(target) {
        return reply(
            409,
            &json!({ "error": "illegal phase transition", "phase": current.as_str() }),
        );
    }
    project.phase_history.push(PhaseEntry {
        phase: target,
        at: OffsetDateTime::now_utc(),
    });
    reply(
        200,
        &json!({ "phase": target.as_str(), "previous": current.as_str() }),
    )
}

fn contracts(state: &mut SimState, request: &Incoming<'_>) -> BackendReply {
    let (workflow, project_id) = match scope(request) {
        Ok(scope) => scope,
        Err(reply) => return reply,
    };
    let project = state.project(project_id);
    let contracts: Vec<Value> = project
        .rounds
        .iter()
        .enumerate()
        .filter(|(_, state)| **state == RoundState::Locked)
        .map(|(t, _)| json!({ "t": t, "status": "awarded" }))
        .collect();
    reply(
        200,
        &json!({ "workflow": workflow, "projectId": project_id, "contracts": contracts }),
    )
}

fn current_round(state: &mut SimState, request: &Incoming<'_>) -> BackendReply {
    let workflow = request.query("workflow");
    let (Some(_), Some(project_id)) = (workflow, request.query("projectId")) else {
        return error_reply(400, "workflow and projectId are required");
    };
    let project = state.project(project_id);
    match project.rounds.last() {
        Some(round) => reply(
            200,
            &json!({ "round": round_json(project.rounds.len() - 1, *round) }),
        ),
        None => reply(200, &json!({ "round": null })),
    }
}

fn open_round(state: &mut SimState, request: &Incoming<'_>) -> BackendReply {
    let Some(project_id) = request.field("projectId") else {
        return error_reply(400, "projectId is required");
    };
    let project = state.project(&project_id);
    if let Some(last) = project.rounds.last().copied() {
        if !last.is_terminal() {
            return reply(
                409,
                &json!({
                    "error": "previous round is still active",
                    "t": project.rounds.len() - 1,
                    "state": last.as_str(),
                }),
            );
        }
    }
    project.rounds.push(RoundState::Open);
    let t = project.rounds.len() - 1;
    reply(200, &json!({ "round": round_json(t, RoundState::Open) }))
}

fn advance_round(
    state: &mut SimState,
    request: &Incoming<'_>,
    to: RoundState,
) -> BackendReply {
    let Some(project_id) = request.field("projectId") else {
        return error_reply(400, "projectId is required");
    };
    let Some(t) = request.field("t").and_then(|raw| raw.parse::<usize>().ok()) else {
        return error_reply(400, "t is required");
    };
    let project = state.project(&project_id);
    let Some(current) = project.rounds.get_mut(t) else {
        return error_reply(404, "round not found");
    };
    if current.successor() != Some(to) {
        return reply(
            409,
            &json!({
                "error": format!("round cannot move from {current} to {to}"),
                "t": t,
                "state": current.as_str(),
            }),
        );
    }
    *current = to;
    reply(200, &json!({ "round": round_json(t, to) }))
}

fn upload_document(state: &mut SimState, request: &Incoming<'_>) -> BackendReply {
    let PlanBody::Multipart(form) = &request.plan.body else {
        return error_reply(400, "expected multipart/form-data");
    };
    let (Some(project_id), Some(portal_type)) =
        (request.field("projectId"), request.field("portalType"))
    else {
        return error_reply(400, "projectId and portalType are required");
    };
    let Some(file) = &form.file else {
        return error_reply(400, "file is required");
    };
    let document = json!({
        "id": Ulid::new().to_string(),
        "projectId": project_id,
        "portalType": portal_type,
        "fileName": file.file_name,
        "contentType": file.content_type,
        "bytes": file.bytes.len(),
    });
    state.project(&project_id).documents.push(document.clone());
    reply(201, &json!({ "document": document }))
}

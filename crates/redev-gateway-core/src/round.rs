use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    AccessGateway, BackendReply, BackendTransport, GatewayError, InputField, Operation,
    OperationInputs, Session, Workflow,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundState {
    Open,
    Closed,
    Locked,
}

impl RoundState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Locked => "LOCKED",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "CLOSED" => Some(Self::Closed),
            "LOCKED" => Some(Self::Locked),
            _ => None,
        }
    }

    /// The only state this one may move to. `Locked` is terminal.
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Open => Some(Self::Closed),
            Self::Closed => Some(Self::Locked),
            Self::Locked => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.successor().is_none()
    }
}

impl Display for RoundState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A round as last reported by the backend of record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct Round {
    pub t: u64,
    pub state: RoundState,
}

impl Round {
    /// Reads a round from `{"t", "state"}`, bare or nested under `"round"`.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let object = match value.get("round") {
            Some(inner) if inner.is_object() => inner,
            _ => value,
        };
        let t = object.get("t").and_then(Value::as_u64)?;
        let state = object
            .get("state")
            .and_then(Value::as_str)
            .and_then(RoundState::parse)?;
        Some(Self { t, state })
    }
}

/// Result of a transition the backend answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied {
        round: Round,
        reply: BackendReply,
    },
    /// The backend refused the move (e.g. already closed, or lock before
    /// close). Nothing changed.
    Conflict {
        reported: Option<RoundState>,
        reply: BackendReply,
    },
}

impl TransitionOutcome {
    #[must_use]
    pub fn reply(&self) -> &BackendReply {
        match self {
            Self::Applied { reply, .. } | Self::Conflict { reply, .. } => reply,
        }
    }

    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    #[must_use]
    pub fn into_reply(self) -> BackendReply {
        match self {
            Self::Applied { reply, .. } | Self::Conflict { reply, .. } => reply,
        }
    }
}

/// Open/close/lock protocol for rounds of one workflow.
///
/// The controller trusts the gateway for admission and the backend for
/// current state. It issues one call per transition and checks that what the
/// backend reports is the forward move that was asked for.
pub struct RoundController<'a, T: BackendTransport + ?Sized> {
    gateway: &'a AccessGateway,
    transport: &'a T,
    workflow: Workflow,
}

impl<'a, T: BackendTransport + ?Sized> RoundController<'a, T> {
    #[must_use]
    pub fn new(gateway: &'a AccessGateway, transport: &'a T, workflow: Workflow) -> Self {
        Self {
            gateway,
            transport,
            workflow,
        }
    }

    /// Opens a new round; the backend assigns `t`.
    ///
    /// # Errors
    /// Admission errors from the gateway, transport failures, non-conflict
    /// backend errors and replies that do not describe an open round.
    pub fn open(
        &self,
        session: &Session,
        project_id: &str,
    ) -> Result<TransitionOutcome, GatewayError> {
        self.transition(session, Operation::RoundOpen, project_id, None, RoundState::Open)
    }

    /// Closes round `t`. Valid only from `Open`.
    ///
    /// # Errors
    /// As for [`Self::open`].
    pub fn close(
        &self,
        session: &Session,
        project_id: &str,
        t: u64,
    ) -> Result<TransitionOutcome, GatewayError> {
        self.transition(
            session,
            Operation::RoundClose,
            project_id,
            Some(t),
            RoundState::Closed,
        )
    }

    /// Locks round `t`. Valid only from `Closed`; `Locked` is terminal.
    ///
    /// # Errors
    /// As for [`Self::open`].
    pub fn lock(
        &self,
        session: &Session,
        project_id: &str,
        t: u64,
    ) -> Result<TransitionOutcome, GatewayError> {
        let operation = match self.workflow {
            Workflow::Slum => Operation::RoundLock,
            Workflow::Clearland | Workflow::Saleable => Operation::RoundsLock,
        };
        self.transition(session, operation, project_id, Some(t), RoundState::Locked)
    }

    /// Reads the current round straight from the backend.
    ///
    /// # Errors
    /// Admission errors, transport failures, non-2xx replies and replies that
    /// are neither a round nor an explicit `{"round": null}`.
    pub fn current(
        &self,
        session: &Session,
        project_id: &str,
    ) -> Result<Option<Round>, GatewayError> {
        let inputs = OperationInputs::new()
            .with(InputField::Workflow, self.workflow.as_str())
            .with(InputField::ProjectId, project_id);
        let plan = self
            .gateway
            .handle(None, Operation::RoundsCurrent, &inputs, session)?;
        let reply = self.transport.dispatch(&plan)?;
        if !reply.is_success() {
            return Err(GatewayError::BackendError(reply));
        }
        let Some(body) = reply.json_body() else {
            return Err(GatewayError::MalformedBackendResponse {
                reason: "rounds/current reply is not JSON".to_string(),
                reply,
            });
        };
        if body.get("round").is_some_and(Value::is_null) {
            return Ok(None);
        }
        match Round::from_json(&body) {
            Some(round) => Ok(Some(round)),
            None => Err(GatewayError::MalformedBackendResponse {
                reason: "rounds/current reply carries no round".to_string(),
                reply,
            }),
        }
    }

    fn transition(
        &self,
        session: &Session,
        operation: Operation,
        project_id: &str,
        t: Option<u64>,
        expected: RoundState,
    ) -> Result<TransitionOutcome, GatewayError> {
        let mut inputs = OperationInputs::new().with(InputField::ProjectId, project_id);
        if let Some(t) = t {
            inputs.set(InputField::RoundIndex, t.to_string());
        }
        let plan = self
            .gateway
            .handle(Some(self.workflow), operation, &inputs, session)?;
        let reply = self.transport.dispatch(&plan)?;
        let outcome = interpret_reply(reply, t, expected)?;
        match &outcome {
            TransitionOutcome::Applied { round, .. } => info!(
                request_id = %plan.request_id,
                %operation,
                project_id,
                t = round.t,
                state = %round.state,
                "round transition applied"
            ),
            TransitionOutcome::Conflict { reported, .. } => warn!(
                request_id = %plan.request_id,
                %operation,
                project_id,
                t = ?t,
                reported = ?reported,
                "round transition conflict reported by backend"
            ),
        }
        Ok(outcome)
    }
}

fn interpret_reply(
    reply: BackendReply,
    t: Option<u64>,
    expected: RoundState,
) -> Result<TransitionOutcome, GatewayError> {
    if reply.is_conflict() {
        let reported = reply.json_body().and_then(|body| {
            body.get("state")
                .and_then(Value::as_str)
                .and_then(RoundState::parse)
        });
        return Ok(TransitionOutcome::Conflict { reported, reply });
    }
    if !reply.is_success() {
        return Err(GatewayError::BackendError(reply));
    }

    let Some(round) = reply.json_body().as_ref().and_then(Round::from_json) else {
        return Err(GatewayError::MalformedBackendResponse {
            reason: "transition reply carries no round".to_string(),
            reply,
        });
    };
    if round.state != expected {
        return Err(GatewayError::MalformedBackendResponse {
            reason: format!(
                "backend reported round state {} after a transition to {expected}",
                round.state
            ),
            reply,
        });
    }
    if let Some(requested) = t {
        if round.t != requested {
            return Err(GatewayError::MalformedBackendResponse {
                reason: format!(
                    "backend reported round {} for a request on round {requested}",
                    round.t
                ),
                reply,
            });
        }
    }
    Ok(TransitionOutcome::Applied { round, reply })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ForwardPlan, PlanBody};
    use serde_json::json;
    use std::sync::Mutex;

    /// Replays canned replies and records every plan it receives.
    struct ScriptedTransport {
        replies: Mutex<Vec<BackendReply>>,
        seen: Mutex<Vec<ForwardPlan>>,
    }

    impl ScriptedTransport {
        fn new(mut replies: Vec<BackendReply>) -> Self {
            replies.reverse();
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<ForwardPlan> {
            self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
        }
    }

    impl BackendTransport for ScriptedTransport {
        fn dispatch(&self, plan: &ForwardPlan) -> Result<BackendReply, GatewayError> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(plan.clone());
            }
            self.replies
                .lock()
                .ok()
                .and_then(|mut replies| replies.pop())
                .ok_or_else(|| GatewayError::BackendUnavailable("script exhausted".to_string()))
        }
    }

    fn session() -> Session {
        Session::from_token("admin-token")
    }

    #[test]
    fn open_reports_backend_assigned_index() {
        let gateway = AccessGateway::new();
        let opened = BackendReply::json(200, &json!({"t": 0, "state": "OPEN"}));
        let transport = ScriptedTransport::new(vec![opened]);
        let controller = RoundController::new(&gateway, &transport, Workflow::Slum);

        let outcome = match controller.open(&session(), "P1") {
            Ok(outcome) => outcome,
            Err(err) => panic!("open failed: {err}"),
        };
        assert!(matches!(
            outcome,
            TransitionOutcome::Applied { round: Round { t: 0, state: RoundState::Open }, .. }
        ));
        let seen = transport.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].route, "/slum/rounds/open");
        assert_eq!(seen[0].body, PlanBody::Json(json!({"projectId": "P1"})));
    }

    #[test]
    fn conflict_is_surfaced_not_swallowed() {
        let gateway = AccessGateway::new();
        let transport = ScriptedTransport::new(vec![BackendReply::json(
            409,
            &json!({"error": "round not open", "t": 0, "state": "CLOSED"}),
        )]);
        let controller = RoundController::new(&gateway, &transport, Workflow::Slum);
        let outcome = match controller.close(&session(), "P1", 0) {
            Ok(outcome) => outcome,
            Err(err) => panic!("close failed: {err}"),
        };
        assert!(outcome.is_conflict());
        assert_eq!(outcome.reply().status, 409);
        assert!(matches!(
            outcome,
            TransitionOutcome::Conflict { reported: Some(RoundState::Closed), .. }
        ));
    }

    #[test]
    fn success_reply_claiming_wrong_state_is_malformed() {
        let gateway = AccessGateway::new();
        let opened = BackendReply::json(200, &json!({"t": 0, "state": "OPEN"}));
        let transport = ScriptedTransport::new(vec![opened]);
        let controller = RoundController::new(&gateway, &transport, Workflow::Slum);
        let result = controller.lock(&session(), "P1", 0);
        assert!(matches!(
            result,
            Err(GatewayError::MalformedBackendResponse { .. })
        ));
    }

    #[test]
    fn unauthenticated_transition_never_reaches_transport() {
        let gateway = AccessGateway::new();
        let transport = ScriptedTransport::new(Vec::new());
        let controller = RoundController::new(&gateway, &transport, Workflow::Slum);
        let result = controller.close(&Session::Unauthenticated, "P1", 0);
        assert!(matches!(result, Err(GatewayError::Unauthenticated { .. })));
        assert!(transport.seen().is_empty());
    }

    #[test]
    fn non_slum_lock_uses_generic_rounds_lock_and_open_is_unknown() {
        let gateway = AccessGateway::new();
        let transport = ScriptedTransport::new(vec![BackendReply::json(
            200,
            &json!({"t": 2, "state": "LOCKED"}),
        )]);
        let controller = RoundController::new(&gateway, &transport, Workflow::Saleable);
        assert!(matches!(
            controller.open(&session(), "P1"),
            Err(GatewayError::UnknownOperation { .. })
        ));
        let outcome = controller.lock(&session(), "P1", 2);
        assert!(matches!(outcome, Ok(TransitionOutcome::Applied { .. })));
        assert_eq!(transport.seen()[0].route, "/rounds/lock");
    }

    #[test]
    fn current_distinguishes_no_round_from_malformed_reply() {
        let gateway = AccessGateway::new();
        let transport = ScriptedTransport::new(vec![
            BackendReply::json(200, &json!({"round": null})),
            BackendReply::json(200, &json!({"round": {"t": 4, "state": "closed"}})),
            BackendReply::new(200, Some("text/html".to_string()), b"<html>".to_vec()),
        ]);
        let controller = RoundController::new(&gateway, &transport, Workflow::Slum);
        assert_eq!(controller.current(&session(), "P1"), Ok(None));
        assert_eq!(
            controller.current(&session(), "P1"),
            Ok(Some(Round { t: 4, state: RoundState::Closed }))
        );
        assert!(matches!(
            controller.current(&session(), "P1"),
            Err(GatewayError::MalformedBackendResponse { .. })
        ));
    }

    #[test]
    fn successor_chain_is_strictly_forward() {
        assert_eq!(RoundState::Open.successor(), Some(RoundState::Closed));
        assert_eq!(RoundState::Closed.successor(), Some(RoundState::Locked));
        assert!(RoundState::Locked.is_terminal());
    }
}

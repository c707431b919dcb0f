use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::{
    AccessGateway, BackendReply, BackendTransport, GatewayError, InputField, Operation,
    OperationInputs, Session, Workflow,
};

/// Project lifecycle stage. Which phase may follow which is the backend's
/// decision; nothing here encodes an ordering.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Enrollment,
    Consent,
    Bidding,
    Settlement,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enrollment => "ENROLLMENT",
            Self::Consent => "CONSENT",
            Self::Bidding => "BIDDING",
            Self::Settlement => "SETTLEMENT",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "ENROLLMENT" => Some(Self::Enrollment),
            "CONSENT" => Some(Self::Consent),
            "BIDDING" => Some(Self::Bidding),
            "SETTLEMENT" => Some(Self::Settlement),
            _ => None,
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct PhaseEntry {
    pub phase: Phase,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Append-ordered phase history as reported by the backend. Each call to
/// [`PhaseController::history`] re-fetches it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct PhaseHistory {
    history: Vec<PhaseEntry>,
}

impl PhaseHistory {
    pub fn iter(&self) -> impl Iterator<Item = &PhaseEntry> + '_ {
        self.history.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.history.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    #[must_use]
    pub fn latest(&self) -> Option<&PhaseEntry> {
        self.history.last()
    }
}

impl<'a> IntoIterator for &'a PhaseHistory {
    type Item = &'a PhaseEntry;
    type IntoIter = std::slice::Iter<'a, PhaseEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.history.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseTransitionOutcome {
    Applied { phase: Phase, reply: BackendReply },
    /// The backend refused the target (not the declared successor).
    Rejected { reply: BackendReply },
}

impl PhaseTransitionOutcome {
    #[must_use]
    pub fn reply(&self) -> &BackendReply {
        match self {
            Self::Applied { reply, .. } | Self::Rejected { reply } => reply,
        }
    }

    #[must_use]
    pub fn into_reply(self) -> BackendReply {
        match self {
            Self::Applied { reply, .. } | Self::Rejected { reply } => reply,
        }
    }
}

pub struct PhaseController<'a, T: BackendTransport + ?Sized> {
    gateway: &'a AccessGateway,
    transport: &'a T,
    workflow: Workflow,
}

impl<'a, T: BackendTransport + ?Sized> PhaseController<'a, T> {
    #[must_use]
    pub fn new(gateway: &'a AccessGateway, transport: &'a T, workflow: Workflow) -> Self {
        Self {
            gateway,
            transport,
            workflow,
        }
    }

    /// # Errors
    /// Admission errors, transport failures, non-2xx replies, or a reply
    /// without a recognizable `phase`.
    pub fn current(&self, session: &Session, project_id: &str) -> Result<Phase, GatewayError> {
        let reply = self.read(session, Operation::PhaseCurrent, project_id)?;
        let phase = reply
            .json_body()
            .and_then(|body| body.get("phase").and_then(Value::as_str).and_then(Phase::parse));
        phase.ok_or_else(|| GatewayError::MalformedBackendResponse {
            reason: "phase/current reply carries no known phase".to_string(),
            reply,
        })
    }

    /// # Errors
    /// Admission errors, transport failures, non-2xx replies, or a reply that
    /// is not a `{"history": [...]}` document.
    pub fn history(
        &self,
        session: &Session,
        project_id: &str,
    ) -> Result<PhaseHistory, GatewayError> {
        let reply = self.read(session, Operation::PhaseHistory, project_id)?;
        match serde_json::from_slice::<PhaseHistory>(&reply.body) {
            Ok(history) => Ok(history),
            Err(err) => Err(GatewayError::MalformedBackendResponse {
                reason: format!("phase/history reply is not a history document: {err}"),
                reply,
            }),
        }
    }

    /// Asks the backend to move the project to `target_phase`.
    ///
    /// Only well-formedness is checked here; whether the target is a legal
    /// successor is decided by the backend.
    ///
    /// # Errors
    /// [`GatewayError::BadRequest`] for a blank or unknown target, plus the
    /// errors of [`Self::current`].
    pub fn transition(
        &self,
        session: &Session,
        project_id: &str,
        target_phase: &str,
    ) -> Result<PhaseTransitionOutcome, GatewayError> {
        let field = InputField::TargetPhase.key();
        if target_phase.trim().is_empty() {
            return Err(GatewayError::missing(field));
        }
        let Some(target) = Phase::parse(target_phase) else {
            return Err(GatewayError::invalid(
                field,
                format!("names no known phase: '{}'", target_phase.trim()),
            ));
        };

        let inputs = OperationInputs::new()
            .with(InputField::ProjectId, project_id)
            .with(InputField::TargetPhase, target.as_str());
        let plan = self.gateway.handle(
            Some(self.workflow),
            Operation::PhaseTransition,
            &inputs,
            session,
        )?;
        let reply = self.transport.dispatch(&plan)?;

        if matches!(reply.status, 409 | 422) {
            warn!(
                request_id = %plan.request_id,
                project_id,
                target = %target,
                status = reply.status,
                "phase transition rejected by backend"
            );
            return Ok(PhaseTransitionOutcome::Rejected { reply });
        }
        if !reply.is_success() {
            return Err(GatewayError::BackendError(reply));
        }
        let reported = reply
            .json_body()
            .and_then(|body| body.get("phase").and_then(Value::as_str).and_then(Phase::parse));
        match reported {
            Some(phase) if phase == target => {
                info!(
                    request_id = %plan.request_id,
                    project_id,
                    phase = %phase,
                    "phase transition applied"
                );
                Ok(PhaseTransitionOutcome::Applied { phase, reply })
            }
            Some(phase) => Err(GatewayError::MalformedBackendResponse {
                reason: format!("backend reported phase {phase} after a transition to {target}"),
                reply,
            }),
            None => Err(GatewayError::MalformedBackendResponse {
                reason: "phase/transition reply carries no known phase".to_string(),
                reply,
            }),
        }
    }

    fn read(
        &self,
        session: &Session,
        operation: Operation,
        project_id: &str,
    ) -> Result<BackendReply, GatewayError> {
        let inputs = OperationInputs::new().with(InputField::ProjectId, project_id);
        let plan = self
            .gateway
            .handle(Some(self.workflow), operation, &inputs, session)?;
        let reply = self.transport.dispatch(&plan)?;
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(GatewayError::BackendError(reply))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ForwardPlan;
    use serde_json::json;
    use std::sync::Mutex;

    struct OneReply {
        reply: BackendReply,
        calls: Mutex<Vec<ForwardPlan>>,
    }

    impl OneReply {
        fn new(reply: BackendReply) -> Self {
            Self {
                reply,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<ForwardPlan> {
            self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
        }
    }

    impl BackendTransport for OneReply {
        fn dispatch(&self, plan: &ForwardPlan) -> Result<BackendReply, GatewayError> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(plan.clone());
            }
            Ok(self.reply.clone())
        }
    }

    fn session() -> Session {
        Session::from_token("tok")
    }

    #[test]
    fn transition_sends_project_header_without_workflow_header() {
        let gateway = AccessGateway::new();
        let transport = OneReply::new(BackendReply::json(200, &json!({"phase": "CONSENT"})));
        let controller = PhaseController::new(&gateway, &transport, Workflow::Clearland);

        let outcome = controller.transition(&session(), "P1", "consent");
        assert!(matches!(
            outcome,
            Ok(PhaseTransitionOutcome::Applied { phase: Phase::Consent, .. })
        ));
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].headers.get("x-project-id"), Some("P1"));
        assert!(!calls[0].headers.contains("x-workflow"));
    }

    #[test]
    fn unknown_or_blank_target_is_rejected_locally() {
        let gateway = AccessGateway::new();
        let transport = OneReply::new(BackendReply::json(200, &json!({})));
        let controller = PhaseController::new(&gateway, &transport, Workflow::Clearland);

        for target in ["", "  ", "DEMOLITION"] {
            let result = controller.transition(&session(), "P1", target);
            assert!(matches!(
                result,
                Err(GatewayError::BadRequest { ref field, .. }) if field == "targetPhase"
            ));
        }
        assert!(controller.transition(&session(), "", "CONSENT").is_err());
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn backend_refusal_is_reported_as_rejected() {
        let gateway = AccessGateway::new();
        let transport = OneReply::new(BackendReply::json(
            409,
            &json!({"error": "illegal phase transition"}),
        ));
        let controller = PhaseController::new(&gateway, &transport, Workflow::Clearland);
        let outcome = controller.transition(&session(), "P1", "SETTLEMENT");
        assert!(matches!(outcome, Ok(PhaseTransitionOutcome::Rejected { .. })));
    }

    #[test]
    fn history_is_parsed_in_append_order_and_rereads_each_time() {
        let gateway = AccessGateway::new();
        let transport = OneReply::new(BackendReply::json(
            200,
            &json!({"history": [
                {"phase": "ENROLLMENT", "at": "2026-03-01T09:00:00Z"},
                {"phase": "CONSENT", "at": "2026-03-08T09:00:00Z"}
            ]}),
        ));
        let controller = PhaseController::new(&gateway, &transport, Workflow::Clearland);

        for _ in 0..2 {
            let history = match controller.history(&session(), "P1") {
                Ok(history) => history,
                Err(err) => panic!("history failed: {err}"),
            };
            let phases: Vec<Phase> = history.iter().map(|entry| entry.phase).collect();
            assert_eq!(phases, vec![Phase::Enrollment, Phase::Consent]);
        }
        assert_eq!(transport.calls().len(), 2);
        assert!(transport
            .calls()
            .iter()
            .all(|plan| plan.headers.get("x-workflow") == Some("clearland")));
    }

    #[test]
    fn phase_reads_are_unknown_outside_clearland() {
        let gateway = AccessGateway::new();
        let transport = OneReply::new(BackendReply::json(200, &json!({"phase": "BIDDING"})));
        let controller = PhaseController::new(&gateway, &transport, Workflow::Saleable);
        assert!(matches!(
            controller.current(&session(), "P1"),
            Err(GatewayError::UnknownOperation { .. })
        ));
    }
}

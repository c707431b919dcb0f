use std::collections::BTreeSet;

use serde::Serialize;

use crate::{GatewayError, InputField, Operation, Workflow};

/// Context header the backend uses to scope a request.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ContextHeader {
    #[serde(rename = "x-workflow")]
    Workflow,
    #[serde(rename = "x-project-id")]
    ProjectId,
}

impl ContextHeader {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Workflow => "x-workflow",
            Self::ProjectId => "x-project-id",
        }
    }
}

/// A required header and the input it is populated from.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct HeaderRule {
    pub header: ContextHeader,
    pub source: InputField,
}

impl HeaderRule {
    const fn new(header: ContextHeader, source: InputField) -> Self {
        Self { header, source }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AuthRequirement {
    /// No session, no call.
    Required,
    /// Bearer attached when a session exists; anonymous calls still forwarded.
    IfPresent,
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind", content = "workflow")]
pub enum WorkflowBinding {
    /// The operation is not workflow-scoped.
    Unscoped,
    /// Any workflow; the caller names it through the `workflow` input.
    Any,
    /// Only exposed under one workflow's route; the route fixes the workflow.
    Only(Workflow),
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum BodyKind {
    Empty,
    Json,
    Multipart,
}

/// Scoping contract for one exposed operation.
#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct ScopingPolicy {
    pub operation: Operation,
    pub binding: WorkflowBinding,
    pub method: HttpMethod,
    /// Backend route the plan targets.
    pub route: &'static str,
    pub auth: AuthRequirement,
    pub required_headers: &'static [HeaderRule],
    /// Never attached, even when derivable. The backend infers scope from
    /// their absence.
    pub forbidden_headers: &'static [ContextHeader],
    pub required_params: &'static [InputField],
    /// Inputs appended to the backend route as query parameters.
    pub query: &'static [InputField],
    pub body: BodyKind,
}

impl ScopingPolicy {
    #[must_use]
    pub fn requires_header(&self, header: ContextHeader) -> bool {
        self.required_headers.iter().any(|rule| rule.header == header)
    }

    #[must_use]
    pub fn forbids_header(&self, header: ContextHeader) -> bool {
        self.forbidden_headers.contains(&header)
    }

    #[must_use]
    pub fn applies_to(&self, workflow: Option<Workflow>) -> bool {
        match (self.binding, workflow) {
            (WorkflowBinding::Only(bound), Some(requested)) => bound == requested,
            _ => true,
        }
    }
}

const WORKFLOW_AND_PROJECT: &[HeaderRule] = &[
    HeaderRule::new(ContextHeader::Workflow, InputField::Workflow),
    HeaderRule::new(ContextHeader::ProjectId, InputField::ProjectId),
];
const PROJECT_ONLY: &[HeaderRule] = &[HeaderRule::new(
    ContextHeader::ProjectId,
    InputField::ProjectId,
)];
const NO_HEADERS: &[HeaderRule] = &[];
const WORKFLOW_INFERRED: &[ContextHeader] = &[ContextHeader::Workflow];
const NOTHING_FORBIDDEN: &[ContextHeader] = &[];

/// The complete scoping table. One entry per [`Operation`].
pub static POLICY_TABLE: &[ScopingPolicy] = &[
    ScopingPolicy {
        operation: Operation::AuthMe,
        binding: WorkflowBinding::Unscoped,
        method: HttpMethod::Get,
        route: "/auth/me",
        auth: AuthRequirement::Required,
        required_headers: NO_HEADERS,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[],
        query: &[],
        body: BodyKind::Empty,
    },
    ScopingPolicy {
        operation: Operation::SettlementDiagnostics,
        binding: WorkflowBinding::Any,
        method: HttpMethod::Get,
        route: "/settlement/diagnostics",
        auth: AuthRequirement::Required,
        required_headers: WORKFLOW_AND_PROJECT,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[
            InputField::Workflow,
            InputField::ProjectId,
            InputField::RoundIndex,
        ],
        query: &[InputField::RoundIndex],
        body: BodyKind::Empty,
    },
    ScopingPolicy {
        operation: Operation::BidsAsk,
        binding: WorkflowBinding::Any,
        method: HttpMethod::Post,
        route: "/bids/ask",
        auth: AuthRequirement::IfPresent,
        required_headers: WORKFLOW_AND_PROJECT,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[InputField::Workflow, InputField::ProjectId, InputField::Body],
        query: &[],
        body: BodyKind::Json,
    },
    ScopingPolicy {
        operation: Operation::BidsPreferences,
        binding: WorkflowBinding::Any,
        method: HttpMethod::Post,
        route: "/bids/preferences",
        auth: AuthRequirement::IfPresent,
        required_headers: WORKFLOW_AND_PROJECT,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[InputField::Workflow, InputField::ProjectId, InputField::Body],
        query: &[],
        body: BodyKind::Json,
    },
    ScopingPolicy {
        operation: Operation::MembershipEnroll,
        binding: WorkflowBinding::Only(Workflow::Clearland),
        method: HttpMethod::Post,
        route: "/clearland/membership/enroll",
        auth: AuthRequirement::Required,
        required_headers: PROJECT_ONLY,
        forbidden_headers: WORKFLOW_INFERRED,
        required_params: &[
            InputField::ParticipantId,
            InputField::Role,
            InputField::ProjectId,
        ],
        query: &[],
        body: BodyKind::Json,
    },
    ScopingPolicy {
        operation: Operation::PhaseCurrent,
        binding: WorkflowBinding::Only(Workflow::Clearland),
        method: HttpMethod::Get,
        route: "/clearland/phase/current",
        auth: AuthRequirement::Required,
        required_headers: WORKFLOW_AND_PROJECT,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[InputField::ProjectId],
        query: &[],
        body: BodyKind::Empty,
    },
    ScopingPolicy {
        operation: Operation::PhaseHistory,
        binding: WorkflowBinding::Only(Workflow::Clearland),
        method: HttpMethod::Get,
        route: "/clearland/phase/history",
        auth: AuthRequirement::Required,
        required_headers: WORKFLOW_AND_PROJECT,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[InputField::ProjectId],
        query: &[],
        body: BodyKind::Empty,
    },
    ScopingPolicy {
        operation: Operation::PhaseTransition,
        binding: WorkflowBinding::Only(Workflow::Clearland),
        method: HttpMethod::Post,
        route: "/clearland/phase/transition",
        auth: AuthRequirement::Required,
        required_headers: PROJECT_ONLY,
        forbidden_headers: WORKFLOW_INFERRED,
        required_params: &[InputField::ProjectId, InputField::TargetPhase],
        query: &[],
        body: BodyKind::Json,
    },
    ScopingPolicy {
        operation: Operation::ContractsByProject,
        binding: WorkflowBinding::Any,
        method: HttpMethod::Get,
        route: "/contracts/by-project",
        auth: AuthRequirement::Required,
        required_headers: WORKFLOW_AND_PROJECT,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[InputField::Workflow, InputField::ProjectId],
        query: &[],
        body: BodyKind::Empty,
    },
    ScopingPolicy {
        operation: Operation::RoundsCurrent,
        binding: WorkflowBinding::Any,
        method: HttpMethod::Get,
        route: "/rounds/current",
        auth: AuthRequirement::Required,
        required_headers: NO_HEADERS,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[InputField::Workflow, InputField::ProjectId],
        query: &[InputField::Workflow, InputField::ProjectId],
        body: BodyKind::Empty,
    },
    ScopingPolicy {
        operation: Operation::RoundsLock,
        binding: WorkflowBinding::Unscoped,
        method: HttpMethod::Post,
        route: "/rounds/lock",
        auth: AuthRequirement::Required,
        required_headers: NO_HEADERS,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[InputField::ProjectId, InputField::RoundIndex],
        query: &[],
        body: BodyKind::Json,
    },
    ScopingPolicy {
        operation: Operation::RoundOpen,
        binding: WorkflowBinding::Only(Workflow::Slum),
        method: HttpMethod::Post,
        route: "/slum/rounds/open",
        auth: AuthRequirement::Required,
        required_headers: NO_HEADERS,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[InputField::ProjectId],
        query: &[],
        body: BodyKind::Json,
    },
    ScopingPolicy {
        operation: Operation::RoundClose,
        binding: WorkflowBinding::Only(Workflow::Slum),
        method: HttpMethod::Post,
        route: "/slum/rounds/close",
        auth: AuthRequirement::Required,
        required_headers: NO_HEADERS,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[InputField::ProjectId, InputField::RoundIndex],
        query: &[],
        body: BodyKind::Json,
    },
    ScopingPolicy {
        operation: Operation::RoundLock,
        binding: WorkflowBinding::Only(Workflow::Slum),
        method: HttpMethod::Post,
        route: "/slum/rounds/lock",
        auth: AuthRequirement::Required,
        required_headers: NO_HEADERS,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[InputField::ProjectId, InputField::RoundIndex],
        query: &[],
        body: BodyKind::Json,
    },
    ScopingPolicy {
        operation: Operation::DocumentUpload,
        binding: WorkflowBinding::Only(Workflow::Slum),
        method: HttpMethod::Post,
        route: "/slum/documents/upload",
        auth: AuthRequirement::Required,
        required_headers: NO_HEADERS,
        forbidden_headers: NOTHING_FORBIDDEN,
        required_params: &[
            InputField::ProjectId,
            InputField::PortalType,
            InputField::File,
        ],
        query: &[],
        body: BodyKind::Multipart,
    },
];

/// Looks up the policy for a (workflow, operation) pair in `table`.
///
/// `workflow` is the route-level workflow; `None` means the caller did not
/// pin one.
///
/// # Errors
/// Returns [`GatewayError::UnknownOperation`] when the operation has no entry
/// or its entry is bound to a different workflow.
pub fn policy_for(
    table: &'static [ScopingPolicy],
    workflow: Option<Workflow>,
    operation: Operation,
) -> Result<&'static ScopingPolicy, GatewayError> {
    table
        .iter()
        .find(|policy| policy.operation == operation && policy.applies_to(workflow))
        .ok_or_else(|| GatewayError::UnknownOperation {
            workflow,
            operation: operation.as_str().to_string(),
        })
}

/// Checks a policy table for defects that would make admission ambiguous.
///
/// # Errors
/// Returns [`GatewayError::PolicyViolation`] listing every defect found.
pub fn validate_policy_table(table: &[ScopingPolicy]) -> Result<(), GatewayError> {
    let mut defects = Vec::new();
    let mut seen = BTreeSet::new();

    for policy in table {
        let name = policy.operation.as_str();
        if !seen.insert(policy.operation) {
            defects.push(format!("{name}: duplicate entry"));
        }

        for rule in policy.required_headers {
            if policy.forbids_header(rule.header) {
                defects.push(format!(
                    "{name}: {} is both required and forbidden",
                    rule.header.name()
                ));
            }
            let derivable = policy.required_params.contains(&rule.source)
                || (rule.source == InputField::Workflow
                    && matches!(policy.binding, WorkflowBinding::Only(_)));
            if !derivable {
                defects.push(format!(
                    "{name}: {} is sourced from {} which is not a required param",
                    rule.header.name(),
                    rule.source.key()
                ));
            }
        }

        for field in policy.query {
            let derivable = policy.required_params.contains(field)
                || (*field == InputField::Workflow
                    && matches!(policy.binding, WorkflowBinding::Only(_)));
            if !derivable {
                defects.push(format!(
                    "{name}: query parameter {} is not a required param",
                    field.key()
                ));
            }
        }

        if policy.required_params.contains(&InputField::Workflow)
            && !matches!(policy.binding, WorkflowBinding::Any)
        {
            defects.push(format!(
                "{name}: workflow param is only meaningful for workflow-generic operations"
            ));
        }

        match (policy.method, policy.body) {
            (HttpMethod::Get, BodyKind::Json | BodyKind::Multipart) => {
                defects.push(format!("{name}: GET operations cannot carry a body"));
            }
            (HttpMethod::Post, BodyKind::Empty) => {
                defects.push(format!("{name}: POST operations must declare a body kind"));
            }
            _ => {}
        }

        if policy.required_params.contains(&InputField::File)
            != matches!(policy.body, BodyKind::Multipart)
        {
            defects.push(format!(
                "{name}: file params and multipart bodies must go together"
            ));
        }
    }

    for operation in Operation::ALL {
        if !seen.contains(&operation) {
            defects.push(format!("{}: no policy entry", operation.as_str()));
        }
    }

    if defects.is_empty() {
        Ok(())
    } else {
        Err(GatewayError::PolicyViolation(defects.join("; ")))
    }
}

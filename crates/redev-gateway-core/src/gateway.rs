use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};

use serde_json::{Map, Value};
use tracing::{debug, error, warn};
use ulid::Ulid;

use crate::{
    policy_for, AuthRequirement, BodyKind, ContextHeader, GatewayError, HttpMethod, InputField,
    MultipartForm, Operation, OperationInputs, ScopingPolicy, Session, Workflow,
    WorkflowBinding, POLICY_TABLE,
};

pub(crate) const AUTHORIZATION: &str = "authorization";

/// Outbound header set. `Debug` never prints the authorization value.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct OutboundHeaders(BTreeMap<&'static str, String>);

impl OutboundHeaders {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.0.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.0.iter().map(|(name, value)| (*name, value.as_str()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn insert(&mut self, name: &'static str, value: String) {
        self.0.insert(name, value);
    }
}

impl Debug for OutboundHeaders {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in &self.0 {
            if *name == AUTHORIZATION {
                map.entry(name, &"<redacted>");
            } else {
                map.entry(name, value);
            }
        }
        map.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanBody {
    Empty,
    Json(Value),
    Multipart(MultipartForm),
}

/// Fully resolved outbound call. Building one performs no I/O.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardPlan {
    pub request_id: Ulid,
    pub operation: Operation,
    pub workflow: Option<Workflow>,
    pub method: HttpMethod,
    pub route: &'static str,
    pub query: Vec<(&'static str, String)>,
    pub headers: OutboundHeaders,
    pub body: PlanBody,
}

/// Admission decision point: session check, policy lookup, parameter
/// validation and header construction.
#[derive(Debug, Clone, Copy)]
pub struct AccessGateway {
    table: &'static [ScopingPolicy],
}

impl Default for AccessGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: POLICY_TABLE,
        }
    }

    #[must_use]
    pub fn with_table(table: &'static [ScopingPolicy]) -> Self {
        Self { table }
    }

    #[must_use]
    pub fn table(&self) -> &'static [ScopingPolicy] {
        self.table
    }

    /// Admits one operation and produces the plan to forward.
    ///
    /// `workflow` is the workflow fixed by the inbound route, if any. For
    /// workflow-generic operations without one, the `workflow` input is used.
    ///
    /// # Errors
    /// - [`GatewayError::UnknownOperation`] when no policy covers the pair.
    /// - [`GatewayError::Unauthenticated`] when a session is required and absent.
    /// - [`GatewayError::BadRequest`] naming the first missing or malformed input.
    /// - [`GatewayError::PolicyViolation`] when the policy cannot be satisfied
    ///   without attaching a forbidden header or omitting a required one.
    pub fn handle(
        &self,
        workflow: Option<Workflow>,
        operation: Operation,
        inputs: &OperationInputs,
        session: &Session,
    ) -> Result<ForwardPlan, GatewayError> {
        let policy = policy_for(self.table, workflow, operation).inspect_err(|_| {
            warn!(%operation, workflow = ?workflow, "no scoping policy for operation");
        })?;

        if policy.auth == AuthRequirement::Required && !session.is_authenticated() {
            warn!(%operation, "rejected unauthenticated request");
            return Err(GatewayError::Unauthenticated { operation });
        }

        if let Some(field) = inputs.conflicts().first() {
            return Err(GatewayError::invalid(
                field.key(),
                "has different values in the query and the body",
            ));
        }

        let effective_workflow = resolve_workflow(policy, workflow, inputs)?;
        validate_params(policy, effective_workflow, inputs)?;

        let headers = build_headers(policy, effective_workflow, inputs, session)?;
        let query = build_query(policy, effective_workflow, inputs)?;
        let body = build_body(policy, inputs);

        let plan = ForwardPlan {
            request_id: Ulid::new(),
            operation,
            workflow: effective_workflow,
            method: policy.method,
            route: policy.route,
            query,
            headers,
            body,
        };
        debug!(
            request_id = %plan.request_id,
            %operation,
            route = plan.route,
            headers = ?plan.headers,
            "admitted operation"
        );
        Ok(plan)
    }
}

fn resolve_workflow(
    policy: &ScopingPolicy,
    route_workflow: Option<Workflow>,
    inputs: &OperationInputs,
) -> Result<Option<Workflow>, GatewayError> {
    match policy.binding {
        WorkflowBinding::Unscoped => Ok(None),
        // The route decides; any workflow the caller supplied is ignored.
        WorkflowBinding::Only(bound) => Ok(Some(bound)),
        WorkflowBinding::Any => match route_workflow {
            Some(workflow) => Ok(Some(workflow)),
            None => inputs.workflow(),
        },
    }
}

fn validate_params(
    policy: &ScopingPolicy,
    workflow: Option<Workflow>,
    inputs: &OperationInputs,
) -> Result<(), GatewayError> {
    for field in policy.required_params {
        let present = match field {
            InputField::Workflow => workflow.is_some(),
            other => inputs.is_present(*other),
        };
        if !present {
            return Err(GatewayError::missing(field.key()));
        }
        if *field == InputField::RoundIndex {
            inputs.round_index()?;
        }
    }
    Ok(())
}

fn source_value(
    field: InputField,
    workflow: Option<Workflow>,
    inputs: &OperationInputs,
) -> Option<String> {
    match field {
        InputField::Workflow => workflow.map(|value| value.as_str().to_string()),
        other => inputs.get(other).map(str::to_string),
    }
}

fn build_headers(
    policy: &ScopingPolicy,
    workflow: Option<Workflow>,
    inputs: &OperationInputs,
    session: &Session,
) -> Result<OutboundHeaders, GatewayError> {
    let mut headers = OutboundHeaders::default();
    if let Some(token) = session.token() {
        headers.insert(AUTHORIZATION, token.bearer_value());
    }

    for rule in policy.required_headers {
        let Some(value) = source_value(rule.source, workflow, inputs) else {
            error!(
                operation = %policy.operation,
                header = rule.header.name(),
                "required header has no source value"
            );
            return Err(GatewayError::PolicyViolation(format!(
                "{}: required header {} has no value from {}",
                policy.operation,
                rule.header.name(),
                rule.source.key()
            )));
        };
        headers.insert(rule.header.name(), value);
    }

    for header in policy.forbidden_headers {
        if headers.contains(header.name()) {
            error!(
                operation = %policy.operation,
                header = header.name(),
                "forbidden header would be attached"
            );
            return Err(GatewayError::PolicyViolation(format!(
                "{}: forbidden header {} would be attached",
                policy.operation,
                header.name()
            )));
        }
    }

    for header in [ContextHeader::Workflow, ContextHeader::ProjectId] {
        if headers.contains(header.name()) && !policy.requires_header(header) {
            return Err(GatewayError::PolicyViolation(format!(
                "{}: undeclared header {} would be attached",
                policy.operation,
                header.name()
            )));
        }
    }

    Ok(headers)
}

fn build_query(
    policy: &ScopingPolicy,
    workflow: Option<Workflow>,
    inputs: &OperationInputs,
) -> Result<Vec<(&'static str, String)>, GatewayError> {
    policy
        .query
        .iter()
        .map(|field| {
            source_value(*field, workflow, inputs)
                .map(|value| (field.key(), value))
                .ok_or_else(|| {
                    GatewayError::PolicyViolation(format!(
                        "{}: query parameter {} has no value",
                        policy.operation,
                        field.key()
                    ))
                })
        })
        .collect()
}

fn build_body(policy: &ScopingPolicy, inputs: &OperationInputs) -> PlanBody {
    match policy.body {
        BodyKind::Empty => PlanBody::Empty,
        BodyKind::Multipart => inputs
            .multipart()
            .cloned()
            .map_or(PlanBody::Empty, PlanBody::Multipart),
        BodyKind::Json => match inputs.json_body() {
            // Required params the caller put only in the query still have to
            // reach the backend, which reads them from the body.
            Some(Value::Object(object)) => {
                let mut forwarded = object.clone();
                for (key, value) in scalar_params(policy, inputs) {
                    forwarded.entry(key).or_insert(value);
                }
                PlanBody::Json(Value::Object(forwarded))
            }
            Some(body) => PlanBody::Json(body.clone()),
            None => PlanBody::Json(Value::Object(scalar_params(policy, inputs))),
        },
    }
}

/// Required scalar params rendered as body fields.
fn scalar_params(policy: &ScopingPolicy, inputs: &OperationInputs) -> Map<String, Value> {
    let mut object = Map::new();
    for field in policy.required_params {
        if matches!(field, InputField::Workflow | InputField::Body | InputField::File) {
            continue;
        }
        let Some(value) = inputs.get(*field) else {
            continue;
        };
        let rendered = match (field, value.parse::<u64>()) {
            (InputField::RoundIndex, Ok(number)) => Value::from(number),
            _ => Value::String(value.to_string()),
        };
        object.insert(field.key().to_string(), rendered);
    }
    object
}

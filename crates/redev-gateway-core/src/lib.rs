//! Request admission and round/phase lifecycle layer for the redevelopment
//! allocation backend.
//!
//! Every inbound operation flows through:
//! - [`SessionResolver`] to turn the session cookie into a [`Session`].
//! - [`AccessGateway::handle`] to look up the [`ScopingPolicy`] for the
//!   (workflow, operation) pair and build a [`ForwardPlan`].
//! - a [`BackendTransport`] that performs the single outbound call.
//! - [`relay`] to normalize the [`BackendReply`] for the caller.
//!
//! Transitions go through [`RoundController`] and [`PhaseController`], which
//! hold no state of their own; the backend of record is authoritative.

#![forbid(unsafe_code)]

mod admission;
mod error;
mod gateway;
mod inputs;
mod phase;
mod policy;
mod relay;
mod round;
mod session;
mod transport;
mod workflow;

pub use admission::{
    AdmissionDecision, AdmissionPolicy, DEFAULT_LOGIN_PATH, DEFAULT_PUBLIC_PREFIXES,
};
pub use error::{error_envelope, GatewayError, GATEWAY_CONTRACT_VERSION};
pub use gateway::{AccessGateway, ForwardPlan, OutboundHeaders, PlanBody};
pub use inputs::{FilePart, InputField, MultipartForm, OperationInputs};
pub use phase::{Phase, PhaseController, PhaseEntry, PhaseHistory, PhaseTransitionOutcome};
pub use policy::{
    policy_for, validate_policy_table, AuthRequirement, BodyKind, ContextHeader, HeaderRule,
    HttpMethod, ScopingPolicy, WorkflowBinding, POLICY_TABLE,
};
pub use relay::{relay, RelayKind, RelayedResponse, JSON_CONTENT_TYPE};
pub use round::{Round, RoundController, RoundState, TransitionOutcome};
pub use session::{Session, SessionResolver, SessionToken, DEFAULT_SESSION_COOKIE};
pub use transport::{BackendReply, BackendTransport};
pub use workflow::{Operation, Workflow};

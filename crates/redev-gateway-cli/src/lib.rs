//! Operator command surface for the workflow gateway.
//!
//! `rgw` goes through the same admission path as the HTTP service: every
//! backend call is planned by [`AccessGateway`] and sent by a
//! [`BackendTransport`], so the outbound header set is the declared one.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use redev_gateway_core::{
    policy_for, validate_policy_table, AccessGateway, BackendTransport, GatewayError, Operation,
    Phase, PhaseController, PhaseEntry, PhaseTransitionOutcome, Round, RoundController,
    RoundState, ScopingPolicy, Session, TransitionOutcome, Workflow, GATEWAY_CONTRACT_VERSION,
};
use redev_gateway_forward::{BackendConfig, SimulatedBackend, UreqTransport, DEFAULT_TIMEOUT_MS};
use serde::Serialize;

const SIMULATED_OPERATOR_TOKEN: &str = "rgw-operator";

#[derive(Debug, Parser)]
#[command(name = "rgw")]
#[command(about = "Workflow gateway operator CLI")]
pub struct Cli {
    /// Backend of record, e.g. `https://backend.internal:8443`.
    #[arg(long, global = true)]
    backend_url: Option<String>,

    /// Environment variable holding the bearer token.
    #[arg(long, global = true, default_value = "RGW_TOKEN")]
    token_env: String,

    /// Use a fresh in-memory backend instead of `--backend-url`. Its state is
    /// not kept between invocations.
    #[arg(long, global = true)]
    simulate: bool,

    #[arg(long, global = true, default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    Round {
        #[command(subcommand)]
        command: RoundCommand,
    },
    Phase {
        #[command(subcommand)]
        command: PhaseCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    /// Print the full scoping table.
    List,
    /// Validate the scoping table and report the entry count.
    Check,
    /// Print the entry that governs one operation.
    Show(PolicyShowArgs),
}

#[derive(Debug, Args)]
pub struct PolicyShowArgs {
    operation: String,
    #[arg(long)]
    workflow: Option<WorkflowArg>,
}

#[derive(Debug, Subcommand)]
pub enum RoundCommand {
    Open(RoundTargetArgs),
    Close(RoundIndexArgs),
    Lock(RoundIndexArgs),
    Current(RoundTargetArgs),
}

#[derive(Debug, Args)]
pub struct RoundTargetArgs {
    #[arg(long, default_value = "slum")]
    workflow: WorkflowArg,
    #[arg(long)]
    project_id: String,
}

#[derive(Debug, Args)]
pub struct RoundIndexArgs {
    #[arg(long, default_value = "slum")]
    workflow: WorkflowArg,
    #[arg(long)]
    project_id: String,
    #[arg(long)]
    t: u64,
}

#[derive(Debug, Subcommand)]
pub enum PhaseCommand {
    Current(PhaseTargetArgs),
    History(PhaseTargetArgs),
    Transition(PhaseTransitionArgs),
}

#[derive(Debug, Args)]
pub struct PhaseTargetArgs {
    #[arg(long, default_value = "clearland")]
    workflow: WorkflowArg,
    #[arg(long)]
    project_id: String,
}

#[derive(Debug, Args)]
pub struct PhaseTransitionArgs {
    #[arg(long, default_value = "clearland")]
    workflow: WorkflowArg,
    #[arg(long)]
    project_id: String,
    /// Target phase, e.g. `CONSENT`.
    #[arg(long)]
    to: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum WorkflowArg {
    Clearland,
    Slum,
    Saleable,
}

#[derive(Debug, Serialize)]
struct PolicyListing {
    service_contract_version: &'static str,
    data: &'static [ScopingPolicy],
}

#[derive(Debug, Serialize)]
struct PolicyCheckReport {
    status: &'static str,
    entries: usize,
}

#[derive(Debug, Serialize)]
struct RoundReport {
    workflow: Workflow,
    project_id: String,
    outcome: &'static str,
    round: Option<Round>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reported_state: Option<RoundState>,
    backend_status: u16,
}

#[derive(Debug, Serialize)]
struct CurrentRoundReport {
    workflow: Workflow,
    project_id: String,
    round: Option<Round>,
}

#[derive(Debug, Serialize)]
struct PhaseReport {
    workflow: Workflow,
    project_id: String,
    outcome: &'static str,
    phase: Option<Phase>,
    backend_status: u16,
}

#[derive(Debug, Serialize)]
struct CurrentPhaseReport {
    workflow: Workflow,
    project_id: String,
    phase: Phase,
}

#[derive(Debug, Serialize)]
struct PhaseHistoryReport {
    workflow: Workflow,
    project_id: String,
    history: Vec<PhaseEntry>,
}

/// Executes a parsed command. The policy table is validated before anything
/// else runs.
///
/// # Errors
/// Returns an error when the policy table is defective, the backend cannot be
/// configured, admission fails, or the backend refuses a transition.
pub fn run_cli(cli: Cli) -> Result<()> {
    let gateway = AccessGateway::new();
    validate_policy_table(gateway.table()).context("scoping policy table is defective")?;

    match cli.command {
        Command::Policy { command } => run_policy(&gateway, command),
        Command::Round { command } => {
            let transport = connect(cli.backend_url.as_deref(), cli.simulate, cli.timeout_ms)?;
            let session = operator_session(&cli.token_env, cli.simulate);
            run_round(&gateway, transport.as_ref(), &session, command)
        }
        Command::Phase { command } => {
            let transport = connect(cli.backend_url.as_deref(), cli.simulate, cli.timeout_ms)?;
            let session = operator_session(&cli.token_env, cli.simulate);
            run_phase(&gateway, transport.as_ref(), &session, command)
        }
    }
}

fn run_policy(gateway: &AccessGateway, command: PolicyCommand) -> Result<()> {
    match command {
        PolicyCommand::List => print_json(&PolicyListing {
            service_contract_version: GATEWAY_CONTRACT_VERSION,
            data: gateway.table(),
        }),
        PolicyCommand::Check => print_json(&PolicyCheckReport {
            status: "ok",
            entries: gateway.table().len(),
        }),
        PolicyCommand::Show(args) => {
            let operation = Operation::parse(&args.operation)
                .ok_or_else(|| anyhow!("unknown operation '{}'", args.operation))?;
            let policy = policy_for(gateway.table(), args.workflow.map(map_workflow), operation)
                .map_err(gateway_failure)?;
            print_json(policy)
        }
    }
}

fn run_round(
    gateway: &AccessGateway,
    transport: &dyn BackendTransport,
    session: &Session,
    command: RoundCommand,
) -> Result<()> {
    match command {
        RoundCommand::Open(args) => {
            let workflow = map_workflow(args.workflow);
            let outcome = RoundController::new(gateway, transport, workflow)
                .open(session, &args.project_id)
                .map_err(gateway_failure)?;
            report_round(workflow, args.project_id, outcome)
        }
        RoundCommand::Close(args) => {
            let workflow = map_workflow(args.workflow);
            let outcome = RoundController::new(gateway, transport, workflow)
                .close(session, &args.project_id, args.t)
                .map_err(gateway_failure)?;
            report_round(workflow, args.project_id, outcome)
        }
        RoundCommand::Lock(args) => {
            let workflow = map_workflow(args.workflow);
            let outcome = RoundController::new(gateway, transport, workflow)
                .lock(session, &args.project_id, args.t)
                .map_err(gateway_failure)?;
            report_round(workflow, args.project_id, outcome)
        }
        RoundCommand::Current(args) => {
            let workflow = map_workflow(args.workflow);
            let round = RoundController::new(gateway, transport, workflow)
                .current(session, &args.project_id)
                .map_err(gateway_failure)?;
            print_json(&CurrentRoundReport {
                workflow,
                project_id: args.project_id,
                round,
            })
        }
    }
}

fn run_phase(
    gateway: &AccessGateway,
    transport: &dyn BackendTransport,
    session: &Session,
    command: PhaseCommand,
) -> Result<()> {
    match command {
        PhaseCommand::Current(args) => {
            let workflow = map_workflow(args.workflow);
            let phase = PhaseController::new(gateway, transport, workflow)
                .current(session, &args.project_id)
                .map_err(gateway_failure)?;
            print_json(&CurrentPhaseReport {
                workflow,
                project_id: args.project_id,
                phase,
            })
        }
        PhaseCommand::History(args) => {
            let workflow = map_workflow(args.workflow);
            let history = PhaseController::new(gateway, transport, workflow)
                .history(session, &args.project_id)
                .map_err(gateway_failure)?;
            print_json(&PhaseHistoryReport {
                workflow,
                project_id: args.project_id,
                history: history.iter().copied().collect(),
            })
        }
        PhaseCommand::Transition(args) => {
            let workflow = map_workflow(args.workflow);
            let outcome = PhaseController::new(gateway, transport, workflow)
                .transition(session, &args.project_id, &args.to)
                .map_err(gateway_failure)?;
            let (report, rejected) = match outcome {
                PhaseTransitionOutcome::Applied { phase, reply } => (
                    PhaseReport {
                        workflow,
                        project_id: args.project_id,
                        outcome: "applied",
                        phase: Some(phase),
                        backend_status: reply.status,
                    },
                    false,
                ),
                PhaseTransitionOutcome::Rejected { reply } => (
                    PhaseReport {
                        workflow,
                        project_id: args.project_id,
                        outcome: "rejected",
                        phase: None,
                        backend_status: reply.status,
                    },
                    true,
                ),
            };
            print_json(&report)?;
            if rejected {
                bail!(
                    "backend rejected phase transition to '{}' (status {})",
                    args.to,
                    report.backend_status
                );
            }
            Ok(())
        }
    }
}

fn report_round(
    workflow: Workflow,
    project_id: String,
    outcome: TransitionOutcome,
) -> Result<()> {
    let report = match outcome {
        TransitionOutcome::Applied { round, reply } => RoundReport {
            workflow,
            project_id,
            outcome: "applied",
            round: Some(round),
            reported_state: None,
            backend_status: reply.status,
        },
        TransitionOutcome::Conflict { reported, reply } => RoundReport {
            workflow,
            project_id,
            outcome: "conflict",
            round: None,
            reported_state: reported,
            backend_status: reply.status,
        },
    };
    print_json(&report)?;
    if report.outcome == "conflict" {
        bail!(
            "backend refused the round transition (status {})",
            report.backend_status
        );
    }
    Ok(())
}

fn connect(
    backend_url: Option<&str>,
    simulate: bool,
    timeout_ms: u64,
) -> Result<Box<dyn BackendTransport>> {
    if simulate {
        return Ok(Box::new(SimulatedBackend::new()));
    }
    let Some(base_url) = backend_url else {
        bail!("--backend-url is required unless --simulate is set");
    };
    let config = BackendConfig::new(base_url, timeout_ms)?;
    Ok(Box::new(UreqTransport::new(config)))
}

/// The simulated backend accepts any bearer, so a missing token there falls
/// back to a fixed operator token.
fn operator_session(token_env: &str, simulate: bool) -> Session {
    match std::env::var(token_env) {
        Ok(value) => Session::from_token(&value),
        Err(_) if simulate => Session::from_token(SIMULATED_OPERATOR_TOKEN),
        Err(_) => Session::Unauthenticated,
    }
}

fn gateway_failure(err: GatewayError) -> anyhow::Error {
    anyhow!("{}: {err}", err.code())
}

fn map_workflow(value: WorkflowArg) -> Workflow {
    match value {
        WorkflowArg::Clearland => Workflow::Clearland,
        WorkflowArg::Slum => Workflow::Slum,
        WorkflowArg::Saleable => Workflow::Saleable,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

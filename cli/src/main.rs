use std::path::PathBuf;
use std::sync::Arc;

use agentrun_cli::load_config;
use agentrun_cli::spawn_event_writer;
use agentrun_core::ActiveParentPolicy;
use agentrun_core::Config;
use agentrun_core::HttpRunGateway;
use agentrun_core::RemoteRunGateway;
use agentrun_core::RunPoller;
use agentrun_orchestrator::ChildRunSpawner;
use agentrun_orchestrator::CompletionNotifier;
use agentrun_orchestrator::EventEmitter;
use agentrun_orchestrator::MultiRunCoordinator;
use agentrun_orchestrator::NotifyOutcome;
use agentrun_orchestrator::OrchestrationLinkRegistry;
use agentrun_protocol::CreateRunRequest;
use agentrun_protocol::MultiRunRequest;
use agentrun_protocol::RunId;
use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Fan prompts out to remote agent runs and route child results to parents.
#[derive(Debug, Parser)]
#[command(name = "agentrun", version, about)]
struct Cli {
    /// Config file (default: $AGENTRUN_HOME/config.toml or ~/.agentrun/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a prompt N times concurrently and synthesize one answer.
    Multi(MultiArgs),
    /// Create a run, optionally linked to a parent that should hear back.
    Spawn(SpawnArgs),
    /// Wait for child runs to finish and notify their parents.
    Watch(WatchArgs),
}

#[derive(Debug, clap::Args)]
struct MultiArgs {
    prompt: String,

    #[arg(short = 'n', long, default_value_t = 3)]
    concurrency: usize,

    #[arg(long)]
    model: Option<String>,

    #[arg(long, default_value_t = agentrun_protocol::multi_run::DEFAULT_TEMPERATURE)]
    temperature: f64,

    #[arg(long, default_value_t = agentrun_protocol::multi_run::DEFAULT_SYNTHESIS_TEMPERATURE)]
    synthesis_temperature: f64,

    /// Replaces the synthesis instructions; candidates are still appended.
    #[arg(long)]
    synthesis_prompt: Option<String>,

    #[arg(long)]
    repo_id: Option<i64>,

    /// Wall-clock budget for the whole batch (default: config value).
    #[arg(long)]
    timeout_seconds: Option<f64>,

    /// Stream orchestration events to stderr as JSON lines.
    #[arg(long)]
    events: bool,
}

#[derive(Debug, clap::Args)]
struct SpawnArgs {
    prompt: String,

    /// Run to resume or notify when this one finishes.
    #[arg(long)]
    parent: Option<String>,

    #[arg(long)]
    model: Option<String>,

    #[arg(long)]
    repo_id: Option<i64>,
}

#[derive(Debug, clap::Args)]
struct WatchArgs {
    /// Child runs to wait for.
    #[arg(required = true)]
    children: Vec<String>,

    /// Give up on children still running after this many seconds
    /// (default: config value).
    #[arg(long)]
    timeout_seconds: Option<f64>,

    /// Overrides `active_parent_policy` from the config.
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    Notify,
    AlwaysResume,
}

impl From<PolicyArg> for ActiveParentPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::Notify => Self::Notify,
            PolicyArg::AlwaysResume => Self::AlwaysResume,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = load_config(cli.config.as_deref())?;
    let gateway: Arc<dyn RemoteRunGateway> =
        Arc::new(HttpRunGateway::new(&config).context("failed to build HTTP client")?);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling outstanding work");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Command::Multi(args) => run_multi(args, &config, gateway, cancel, cli.json).await,
        Command::Spawn(args) => run_spawn(args, &config, gateway, &cancel, cli.json).await,
        Command::Watch(args) => run_watch(args, &config, gateway, cancel, cli.json).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_registry(config: &Config) -> anyhow::Result<Arc<OrchestrationLinkRegistry>> {
    let registry = match &config.link_store {
        Some(path) => OrchestrationLinkRegistry::with_store(path)?,
        None => OrchestrationLinkRegistry::new(),
    };
    Ok(Arc::new(registry))
}

async fn run_multi(
    args: MultiArgs,
    config: &Config,
    gateway: Arc<dyn RemoteRunGateway>,
    cancel: CancellationToken,
    json: bool,
) -> anyhow::Result<()> {
    let timeout = args
        .timeout_seconds
        .unwrap_or(config.default_timeout.as_secs_f64());
    let mut request = MultiRunRequest::new(args.prompt, args.concurrency, timeout)
        .with_temperature(args.temperature)
        .with_synthesis_temperature(args.synthesis_temperature);
    request.model = args.model;
    request.synthesis_prompt = args.synthesis_prompt;
    request.repo_id = args.repo_id;

    let mut coordinator = MultiRunCoordinator::new(gateway, config).with_cancellation(cancel);
    let mut event_writer = None;
    if args.events {
        let (events, rx) = EventEmitter::channel();
        coordinator = coordinator.with_events(events);
        event_writer = Some(spawn_event_writer(rx, std::io::stderr()));
    }

    let outcome = coordinator.run(&request).await;
    // Closes the channel so the writer can finish the batch's last events.
    drop(coordinator);
    if let Some(writer) = event_writer {
        writer.await.context("event writer task failed")?;
    }
    let result = outcome?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.final_output);
        eprintln!(
            "synthesized from {} of {} candidates across {} runs",
            result.candidates.len(),
            request.concurrency,
            result.agent_runs.len()
        );
    }
    Ok(())
}

async fn run_spawn(
    args: SpawnArgs,
    config: &Config,
    gateway: Arc<dyn RemoteRunGateway>,
    cancel: &CancellationToken,
    json: bool,
) -> anyhow::Result<()> {
    let spawner = ChildRunSpawner::new(gateway, open_registry(config)?);
    let mut request = CreateRunRequest::new(args.prompt);
    request.model = args.model;
    request.repo_id = args.repo_id;
    let parent = args.parent.map(RunId::new);

    let handle = spawner
        .spawn_child(&request, parent.as_ref(), cancel)
        .await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&handle)?);
    } else {
        println!("{}", handle.run_id);
    }
    Ok(())
}

async fn run_watch(
    args: WatchArgs,
    config: &Config,
    gateway: Arc<dyn RemoteRunGateway>,
    cancel: CancellationToken,
    json: bool,
) -> anyhow::Result<()> {
    let policy = args
        .policy
        .map(ActiveParentPolicy::from)
        .unwrap_or(config.active_parent_policy);
    let timeout = match args.timeout_seconds {
        Some(seconds) => std::time::Duration::try_from_secs_f64(seconds)
            .with_context(|| format!("invalid --timeout-seconds {seconds}"))?,
        None => config.default_timeout,
    };
    let deadline = Instant::now() + timeout;

    let poller = RunPoller::new(gateway.clone()).with_interval(config.poll_interval);
    let notifier = CompletionNotifier::new(gateway, open_registry(config)?)
        .with_policy(policy)
        .with_poller(poller)
        .with_cancellation(cancel);

    let children: Vec<RunId> = args.children.into_iter().map(RunId::new).collect();
    let outcomes =
        futures::future::join_all(children.iter().map(|child| notifier.watch(child, deadline)))
            .await;

    let mut failures = 0;
    for (child, outcome) in children.iter().zip(outcomes) {
        match outcome {
            Ok(outcome) => print_outcome(child, &outcome, json),
            Err(err) => {
                failures += 1;
                eprintln!("{child}: {err}");
            }
        }
    }
    anyhow::ensure!(failures == 0, "{failures} child run(s) could not be routed");
    Ok(())
}

fn print_outcome(child: &RunId, outcome: &NotifyOutcome, json: bool) {
    if json {
        let value = match outcome {
            NotifyOutcome::Untracked => serde_json::json!({"child_run_id": child, "outcome": "untracked"}),
            NotifyOutcome::Forwarded {
                parent_run_id,
                delivery,
            } => serde_json::json!({
                "child_run_id": child,
                "outcome": "forwarded",
                "parent_run_id": parent_run_id,
                "delivered": *delivery == agentrun_core::ActiveDelivery::Delivered,
            }),
            NotifyOutcome::Resumed { parent_run_id, .. } => serde_json::json!({
                "child_run_id": child,
                "outcome": "resumed",
                "parent_run_id": parent_run_id,
            }),
        };
        println!("{value}");
        return;
    }
    match outcome {
        NotifyOutcome::Untracked => println!("{child}: no parent registered"),
        NotifyOutcome::Forwarded { parent_run_id, .. } => {
            println!("{child}: parent {parent_run_id} is still active, result forwarded");
        }
        NotifyOutcome::Resumed { parent_run_id, .. } => {
            println!("{child}: resumed parent {parent_run_id}");
        }
    }
}

//! Remediation pipeline CLI.
//!
//! ```bash
//! # Poll a tracker and remediate tickets until Ctrl-C
//! REMEDIATION_TRACKER_URL=https://tracker/api REMEDIATION_HANDLER_URL=http://agents:9000 \
//!     remediation-agents run
//!
//! # Process a JSON file of tickets with scripted handlers
//! remediation-agents run --tickets tickets.json --simulate
//!
//! # End-to-end demo with simulated handlers
//! remediation-agents demo
//!
//! # Inspect scoring
//! remediation-agents score tickets.json
//!
//! # Event stream JSON schema
//! remediation-agents schema
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orchestration::{
    ComplexityEstimator, Dispatcher, PipelineEvent, PriorityScorer, SharedDispatcher,
    SharedResources, StageHandlers, TicketSource,
};
use remediation_agents::config::{check_endpoint, AppConfig};
use remediation_agents::intake::IntakeLoop;
use remediation_agents::remote::http_handlers;
use remediation_agents::simulated::{demo_scenario, ScriptedExecutor};
use remediation_agents::sinks::{spawn_event_log, spawn_tracker_sync};
use remediation_agents::tracker::{read_tickets, FileTicketSource, HttpTracker};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file (engine sections plus an `[app]` table)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the ticket source and process tickets until Ctrl-C
    Run {
        /// Read tickets from a JSON file instead of the HTTP tracker
        #[arg(long)]
        tickets: Option<PathBuf>,

        /// Use scripted handlers instead of the agent service
        #[arg(long, default_value_t = false)]
        simulate: bool,

        /// Maximum tickets submitted per intake pass
        #[arg(long)]
        batch_limit: Option<usize>,
    },
    /// Run the built-in scenario with simulated handlers
    Demo,
    /// Print priority score and complexity for tickets in a JSON file
    Score { file: PathBuf },
    /// Print the JSON schema of the event stream
    Schema,
}

fn init_tracing(filter: &str, json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Schema => {
            let schema = schemars::schema_for!(PipelineEvent);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
        Command::Score { file } => score(&config, &file),
        Command::Demo => {
            init_tracing(&config.log_filter, cli.json);
            demo(config).await
        }
        Command::Run {
            tickets,
            simulate,
            batch_limit,
        } => {
            init_tracing(&config.log_filter, cli.json);
            run(config, tickets, simulate, batch_limit).await
        }
    }
}

fn score(config: &AppConfig, file: &std::path::Path) -> Result<()> {
    let scorer = PriorityScorer::new(config.engine.priority.clone())?;
    let estimator = ComplexityEstimator::new(config.engine.complexity.clone());
    let mut tickets = read_tickets(file)?;
    tickets.sort_by(|a, b| scorer.score(b).total_cmp(&scorer.score(a)));

    for ticket in &tickets {
        let breakdown = scorer.explain(ticket);
        println!(
            "{:<12} {:.2}  {:<6}  {:<8}  {}{}",
            ticket.tracker_id,
            breakdown.score,
            estimator.estimate(ticket).to_string(),
            ticket.priority.to_string(),
            ticket.title,
            breakdown
                .matched_keyword
                .map(|k| format!("  [keyword: {k}]"))
                .unwrap_or_default(),
        );
    }
    Ok(())
}

fn build_dispatcher(config: &AppConfig, handlers: StageHandlers) -> Result<SharedDispatcher> {
    let resources = SharedResources::from_config(&config.engine);
    let dispatcher = Dispatcher::new(config.engine.clone(), handlers, resources)
        .context("Failed to build dispatcher")?;
    Ok(dispatcher.shared())
}

fn simulated_handlers() -> StageHandlers {
    use orchestration::HandlerKind;
    StageHandlers::new(
        ScriptedExecutor::new(HandlerKind::Planner).shared(),
        ScriptedExecutor::new(HandlerKind::Developer).shared(),
        ScriptedExecutor::new(HandlerKind::Qa).shared(),
        ScriptedExecutor::new(HandlerKind::Communicator).shared(),
    )
}

async fn run(
    config: AppConfig,
    tickets: Option<PathBuf>,
    simulate: bool,
    batch_limit: Option<usize>,
) -> Result<()> {
    let source: Arc<dyn TicketSource> = match (&tickets, &config.tracker) {
        (Some(path), _) => Arc::new(FileTicketSource::new(path.clone())),
        (None, Some(endpoint)) => Arc::new(HttpTracker::new(endpoint.clone())?),
        (None, None) => anyhow::bail!(
            "No ticket source: pass --tickets or set REMEDIATION_TRACKER_URL / [app].tracker_url"
        ),
    };

    let handlers = if simulate {
        simulated_handlers()
    } else {
        let url = config.handler_url.as_deref().context(
            "No agent service: pass --simulate or set REMEDIATION_HANDLER_URL / [app].handler_url",
        )?;
        if !check_endpoint(url).await {
            warn!(url, "Agent service not reachable yet; stages will retry");
        }
        http_handlers(url, Duration::from_secs(600))?
    };

    let dispatcher = build_dispatcher(&config, handlers)?;
    let shutdown = CancellationToken::new();
    let events = dispatcher.resources().events.clone();
    let log_sink = spawn_event_log(&events, shutdown.clone());
    let tracker_sync = spawn_tracker_sync(&events, source.clone(), shutdown.clone());

    let mut intake = IntakeLoop::new(source, dispatcher.clone(), config.intake_interval);
    if let Some(limit) = batch_limit {
        intake = intake.with_batch_limit(limit);
    }
    let intake = tokio::spawn(intake.run(shutdown.clone()));
    let scheduler = tokio::spawn(dispatcher.clone().run(shutdown.clone()));

    info!(
        global = config.engine.dispatch.global_concurrency,
        intake_secs = config.intake_interval.as_secs(),
        "Remediation pipeline running; Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    shutdown.cancel();

    for (name, handle) in [
        ("intake", intake),
        ("dispatcher", scheduler),
        ("event log", log_sink),
        ("tracker sync", tracker_sync),
    ] {
        if let Err(e) = handle.await {
            warn!(task = name, error = %e, "Task ended abnormally");
        }
    }
    print_summaries(&dispatcher).await;
    Ok(())
}

async fn demo(config: AppConfig) -> Result<()> {
    let scenario = demo_scenario();
    let dispatcher = build_dispatcher(&config, scenario.handlers)?;
    let shutdown = CancellationToken::new();
    let log_sink = spawn_event_log(&dispatcher.resources().events, shutdown.clone());

    for ticket in scenario.tickets {
        dispatcher.submit(ticket).await;
    }
    let scheduler = tokio::spawn(dispatcher.clone().run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(120);
    while !dispatcher.is_settled().await {
        if tokio::time::Instant::now() >= deadline {
            warn!("Demo did not settle within 120s");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    shutdown.cancel();
    scheduler.await.context("Dispatcher task failed")?;
    log_sink.await.context("Event log task failed")?;

    print_summaries(&dispatcher).await;
    for breaker in dispatcher.breaker_states() {
        println!(
            "breaker {:<15} {:<9} failures={}",
            breaker.dependency.to_string(),
            breaker.state.to_string(),
            breaker.consecutive_failures
        );
    }
    Ok(())
}

async fn print_summaries(dispatcher: &SharedDispatcher) {
    for summary in dispatcher.summaries().await {
        println!(
            "{:<10} {:<13} stages={} ok={} transient={} circuit_open={} validation={} fatal={} {}ms{}",
            summary.tracker_id,
            summary.current_stage.to_string(),
            summary.completed_stages,
            summary.outcomes.success,
            summary.outcomes.transient,
            summary.outcomes.circuit_open,
            summary.outcomes.validation,
            summary.outcomes.fatal,
            summary.total_duration_ms,
            summary
                .annotation
                .map(|a| format!("  ({a})"))
                .unwrap_or_default(),
        );
    }
}

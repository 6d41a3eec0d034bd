mod fixtures;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use atlas_core::config::{AppConfig, StoreConfig};
use atlas_core::event::EventBus;
use atlas_core::traits::ToolBackend;
use atlas_core::types::{FailureReport, QueryInput, RequestId, RunState};

use atlas_agent::{
    GraphExecutor, MetricsCollector, RetryingTool, RunContext, RunLogger, SqliteStateStore,
    TelemetryFanout,
};

use fixtures::{FixtureReasoner, FixtureTool};

#[derive(Parser)]
#[command(name = "atlas", version, about = "Self-healing reasoning graph for commute planning")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "atlas.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Plan a trip with the fixture backends
    Run {
        /// User the request belongs to
        #[arg(long)]
        user: Option<String>,
        /// Request ID (auto-generated if not provided)
        #[arg(long)]
        request_id: Option<String>,
        #[arg(long)]
        origin: Option<String>,
        #[arg(long)]
        destination: Option<String>,
        #[arg(long)]
        flight: Option<String>,
        /// Target arrival time (RFC 3339)
        #[arg(long)]
        arrive_by: Option<DateTime<Utc>>,
        /// The user's question
        #[arg(trailing_var_arg = true)]
        query: Vec<String>,
    },
    /// Continue an interrupted traversal from its last checkpoint
    Resume {
        request_id: String,
    },
    /// Print a stored checkpoint
    Show {
        request_id: String,
    },
    /// List recent checkpoints
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Evict finished checkpoints past the retention window
    Purge,
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("atlas=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "atlas", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let store_config = config.store.clone().unwrap_or_default();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Show { request_id } => {
            let store = open_store(&store_config)?;
            match store.get(&RequestId(request_id.clone()))? {
                Some(state) => println!("{}", serde_json::to_string_pretty(&state)?),
                None => anyhow::bail!("No checkpoint for request {}", request_id),
            }
        }
        Commands::List { limit } => {
            let store = open_store(&store_config)?;
            let rows = store.list(limit)?;
            if rows.is_empty() {
                println!("No checkpoints stored.");
            }
            for row in rows {
                let status = match (row.finished, row.has_plan) {
                    (true, true) => "done",
                    (true, false) => "failed",
                    (false, _) => "open",
                };
                println!(
                    "{:<38} {:<7} {:<12} {}",
                    row.request_id.0,
                    status,
                    row.user_id.as_deref().unwrap_or("-"),
                    row.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Commands::Purge => {
            let store = open_store(&store_config)?;
            let evicted = store.evict_expired(store_config.retention())?;
            println!("Evicted {} checkpoint(s).", evicted);
        }
        Commands::Resume { request_id } => {
            let store = Arc::new(open_store(&store_config)?);
            let request_id = RequestId(request_id);
            let Some(checkpoint) = store.get(&request_id)? else {
                anyhow::bail!("No checkpoint for request {}", request_id);
            };
            if checkpoint.decision.finished {
                println!("Request {} already finished.", request_id);
                return Ok(());
            }
            traverse(&config, store, checkpoint, true).await?;
        }
        Commands::Run {
            user,
            request_id,
            origin,
            destination,
            flight,
            arrive_by,
            query,
        } => {
            let query = query.join(" ");
            if query.trim().is_empty() {
                anyhow::bail!("Nothing to plan: pass a query");
            }
            let store = Arc::new(open_store(&store_config)?);
            if let Err(e) = store.evict_expired(store_config.retention()) {
                warn!(error = %e, "Checkpoint eviction failed");
            }

            let request_id = request_id.map(RequestId).unwrap_or_default();
            let mut state = RunState::new(request_id, query.clone()).with_input(QueryInput {
                query,
                origin,
                destination,
                flight_number: flight,
                target_arrival_time: arrive_by,
            });
            if let Some(user) = user {
                state = state.with_user(user);
            }
            traverse(&config, store, state, false).await?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Run (or resume) one traversal against the fixture backends and print
/// the plan or the failure report.
async fn traverse(
    config: &AppConfig,
    store: Arc<SqliteStateStore>,
    state: RunState,
    resume: bool,
) -> anyhow::Result<()> {
    let Some(ref fixtures) = config.fixtures else {
        anyhow::bail!("No [fixtures] section in config; set fixtures.dir to a replay directory");
    };
    let fixture_dir = fixtures.resolved_dir();
    let request_id = state.request_id.clone();

    let event_bus = Arc::new(EventBus::default());
    let metrics = Arc::new(MetricsCollector::new());
    let telemetry = TelemetryFanout::new()
        .with(event_bus.clone())
        .with(metrics.clone());

    let cancel = CancellationToken::new();
    let logger = config.log.as_ref().filter(|l| l.enabled).map(|l| {
        RunLogger::new(l.resolved_dir(), l.level).attach(
            &event_bus,
            request_id.clone(),
            cancel.child_token(),
        )
    });

    let mut ctx = RunContext::new(request_id.clone(), config.graph.traversal_timeout())
        .with_reasoning(Arc::new(FixtureReasoner::load(&fixture_dir, config)?))
        .with_store(store)
        .with_telemetry(Arc::new(telemetry))
        .with_cancel(cancel.clone());
    for tool in &config.tools {
        let backend: Arc<dyn ToolBackend> = Arc::new(FixtureTool::new(&fixture_dir, tool));
        let backend: Arc<dyn ToolBackend> = match tool.retry {
            Some(ref retry) => Arc::new(RetryingTool::new(backend, retry.clone())),
            None => backend,
        };
        ctx = ctx.with_tool(backend);
    }

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, cancelling traversal");
            ctrl_c.cancel();
        }
    });

    let executor = GraphExecutor::from_config(config);
    let result = if resume {
        executor.resume(state, &ctx).await
    } else {
        executor.run(state, &ctx).await
    };

    if let Some(handle) = logger {
        handle.await.ok();
    }
    debug!(metrics = ?metrics.snapshot(), "Traversal metrics");

    match result {
        Ok(state) => {
            match state.plan() {
                Some(plan) => println!("{}", serde_json::to_string_pretty(plan)?),
                None => println!("Traversal finished without a plan."),
            }
            Ok(())
        }
        Err(report) => {
            print_failure(&report);
            std::process::exit(1);
        }
    }
}

fn print_failure(report: &FailureReport) {
    eprintln!("Plan unavailable, try again: {}", report);
    for note in report.state.recent_notes(5) {
        eprintln!("  - {}", note);
    }
    eprintln!("Request ID: {}", report.state.request_id);
}

fn open_store(config: &StoreConfig) -> anyhow::Result<SqliteStateStore> {
    Ok(SqliteStateStore::open(&config.resolved_path())?)
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }
    // Check for config in the home directory
    if let Some(home) = std::env::var_os("HOME") {
        let home_config = PathBuf::from(home).join(".atlas").join("config.toml");
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }
    eprintln!("Warning: No config file found, using defaults. Create atlas.toml to configure.");
    Ok(AppConfig::default())
}

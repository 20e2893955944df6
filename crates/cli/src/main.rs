//! `dagwright` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`: start the API server and run engine.
//! - `migrate`: run pending database migrations.
//! - `validate`: validate a pipeline JSON file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::{MemoryStore, PgStore, Store};
use engine::{EngineConfig, NodeRegistry, PipelineDefinition, RunController};
use jobboard::{mock::MockJobBoard, HttpJobBoard, JobBoard};
use nodes::JobDefaults;
use queue::LocalTaskRegistry;

const DEFAULT_LOG_FILTER: &str = "dagwright=info,engine=info,api=info,tower_http=info";

#[derive(Parser)]
#[command(
    name = "dagwright",
    about = "DAG pipeline engine that delegates work to a job board",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server.
    Serve(ServeArgs),
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate a pipeline definition JSON file.
    Validate {
        /// Path to the pipeline JSON file (`{nodes, edges}`).
        path: PathBuf,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Keep everything in memory instead of Postgres.
    #[arg(long)]
    memory: bool,

    #[arg(long, env = "DATABASE_URL", required_unless_present = "memory")]
    database_url: Option<String>,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,

    /// Job board base URL.  Without one, jobs go to an in-process mock board.
    #[arg(long, env = "JOB_BOARD_URL")]
    job_board_url: Option<String>,

    #[arg(long, env = "JOB_BOARD_API_KEY", default_value = "", hide_env_values = true)]
    job_board_api_key: String,

    /// URL the board should call back when a job changes state.
    #[arg(long, env = "JOB_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Comma-separated tags for jobs whose node config sets none.
    #[arg(long, env = "JOB_DEFAULT_TAGS", value_delimiter = ',')]
    default_tags: Vec<String>,

    #[arg(long, env = "DAGWRIGHT_POLL_INTERVAL_SECS", default_value_t = 5)]
    poll_interval_secs: u64,

    #[arg(long, env = "DAGWRIGHT_MAX_POLL_MINUTES", default_value_t = 30)]
    max_poll_minutes: u64,

    #[arg(long, env = "DAGWRIGHT_MAX_POLL_RETRIES", default_value_t = 3)]
    max_poll_retries: u32,

    #[arg(long, env = "DAGWRIGHT_EVENT_BUFFER", default_value_t = 256)]
    event_buffer: usize,

    /// Upper bound on nodes dispatched at once; unbounded when unset.
    #[arg(long, env = "DAGWRIGHT_MAX_PARALLEL_DISPATCH")]
    max_parallel_dispatch: Option<usize>,
}

impl ServeArgs {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_poll_duration: Duration::from_secs(self.max_poll_minutes * 60),
            max_poll_retries: self.max_poll_retries,
            event_buffer: self.event_buffer,
            max_parallel_dispatch: self.max_parallel_dispatch,
            ..EngineConfig::with_poll_interval(Duration::from_secs(self.poll_interval_secs))
        }
    }

    fn job_defaults(&self) -> JobDefaults {
        let mut defaults = JobDefaults {
            webhook_url: self.webhook_url.clone(),
            ..JobDefaults::default()
        };
        if !self.default_tags.is_empty() {
            defaults.tags = self.default_tags.clone();
        }
        defaults
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Migrate { database_url } => {
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool)
                .await
                .context("migration failed")?;
            info!("migrations applied");
            Ok(())
        }
        Command::Validate { path } => validate(&path),
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let store: Arc<dyn Store> = match (&args.database_url, args.memory) {
        (Some(url), false) => {
            let pool = db::pool::create_pool(url, args.max_connections)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool)
                .await
                .context("migration failed")?;
            Arc::new(PgStore::new(pool))
        }
        _ => {
            warn!("using in-memory store; nothing survives a restart");
            Arc::new(MemoryStore::new())
        }
    };

    let board: Arc<dyn JobBoard> = match &args.job_board_url {
        Some(url) => {
            info!(url = %url, "using job board");
            Arc::new(HttpJobBoard::new(url.as_str(), args.job_board_api_key.as_str()))
        }
        None => {
            warn!("JOB_BOARD_URL not set; jobs go to an in-process mock board");
            Arc::new(MockJobBoard::new())
        }
    };

    let config = args.engine_config();
    info!(
        poll_interval = ?config.poll_interval,
        max_poll_duration = ?config.max_poll_duration,
        "engine configured"
    );

    let controller = RunController::new(
        store,
        Arc::clone(&board),
        NodeRegistry::standard(board, args.job_defaults()),
        Arc::new(LocalTaskRegistry::new()),
        config,
    );

    let resumed = controller
        .resume_polling()
        .await
        .context("failed to resume polling")?;
    if resumed > 0 {
        info!(resumed, "resumed in-flight jobs");
    }

    api::serve(&args.bind, api::AppState::new(controller), shutdown_signal())
        .await
        .context("API server failed")?;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn validate(path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&content).context("invalid JSON")?;
    let definition = PipelineDefinition::from_value(value)?;

    match engine::topological_order(&definition) {
        Ok(order) => {
            println!("Pipeline is valid. Execution order: {}", order.join(" -> "));
            Ok(())
        }
        Err(e) => bail!("validation failed: {e}"),
    }
}

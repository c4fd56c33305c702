// Worker binary entry point
//
// `worker run` is the master; it re-executes this binary as `worker executor`
// and `worker watchdog` for every job cycle.

mod handlers;

use anyhow::Result;
use clap::{Parser, Subcommand};
use common::backend::{Backend, RedisBackend};
use common::client::Client;
use common::config::{IsolationMode, Settings};
use common::reserver;
use common::telemetry;
use common::worker::{
    executor_main, watchdog_main, HandlerRegistry, ProcessLauncher, SubprocessLauncher,
    Supervisor, TaskLauncher,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "worker", version, about = "Reserve and run jobs from Redis-backed queues")]
struct Cli {
    /// Directory holding default.toml and local.toml
    #[arg(long, global = true, default_value = "config")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor loop (default)
    Run,
    /// Perform one job read as JSON from stdin
    Executor,
    /// Follow lifecycle events for one leased job
    Watchdog {
        #[arg(long)]
        jid: String,
        #[arg(long)]
        worker: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = Settings::load_from_path(&cli.config_dir).map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    telemetry::init_logging(
        &settings.observability.log_level,
        settings.observability.tracing_endpoint.as_deref(),
    )?;

    settings.validate().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        anyhow::anyhow!("Configuration error: {}", e)
    })?;

    let registry = handlers::registry()?;

    let code = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let result = run(&cli.config_dir, settings, registry).await;
            if let Err(e) = &result {
                error!(error = %e, "Worker stopped with an error");
            }
            telemetry::shutdown_tracer();
            return result;
        }
        Commands::Executor => executor_main(&settings, &registry).await,
        Commands::Watchdog { jid, worker } => watchdog_main(&settings, &jid, &worker).await,
    };

    telemetry::shutdown_tracer();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn run(config_dir: &Path, settings: Settings, registry: HandlerRegistry) -> Result<()> {
    if let Some(port) = settings.observability.metrics_port {
        telemetry::init_metrics(port)?;
    }

    if settings.worker.has_generated_name() {
        warn!(
            worker = %settings.worker.name,
            "worker.name is not configured, using a host-derived identity"
        );
    }

    info!(
        worker = %settings.worker.name,
        queues = ?settings.worker.queues,
        isolation = ?settings.worker.isolation,
        "Starting queue worker"
    );

    let backend: Arc<dyn Backend> = Arc::new(RedisBackend::connect(&settings.redis).await.map_err(
        |e| {
            error!(error = %e, "Failed to connect to Redis");
            anyhow::anyhow!("Redis initialization error: {}", e)
        },
    )?);

    let client = Client::new(Arc::clone(&backend), settings.worker.name.clone())
        .with_lifecycle(registry.lifecycle().clone());
    let reserver = reserver::from_config(&client, &settings.worker).await?;
    info!(reserver = %reserver.description(), "Reserver ready");

    let launcher: Arc<dyn ProcessLauncher> = match settings.worker.isolation {
        IsolationMode::Process => Arc::new(
            SubprocessLauncher::current_exe()?
                .with_leading_args([PathBuf::from("--config-dir"), config_dir.to_path_buf()]),
        ),
        IsolationMode::Task => Arc::new(TaskLauncher::new(
            backend,
            Arc::new(registry),
            settings.redis.events_channel.clone(),
        )),
    };

    let mut supervisor = Supervisor::new(
        client,
        reserver,
        launcher,
        settings.worker.interval(),
        &settings.worker.limits,
    );

    #[cfg(unix)]
    let signals = common::worker::control::bind_signals(supervisor.handle())?;

    let summary = supervisor.run().await?;

    #[cfg(unix)]
    signals.abort();

    info!(
        jobs_processed = summary.jobs_processed,
        reason = %summary.reason,
        "Worker shutdown complete"
    );
    Ok(())
}

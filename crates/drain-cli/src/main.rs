//! outbox-drain: runs the incident outbox drain against PostgreSQL.
//!
//! Usage: outbox-drain [OPTIONS] [run | status | dead | init-schema]
//!
//! Every option also reads from the environment (`DATABASE_URL`,
//! `DRAIN_*`, `POOL_*`, `NOTIFIER_*`, `LOG_LEVEL`). `RUST_LOG` wins over
//! `--log-level`.

mod notifier;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use drain_core::app::{DrainConfig, OutboxDrain, ReapConfig, Router};
use drain_core::impls::PgOutboxStore;
use drain_core::ports::OutboxStore;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::notifier::{INCIDENT_CREATED, NotifierClient};

#[derive(Parser, Debug)]
#[command(name = "outbox-drain")]
#[command(about = "Delivers incident outbox events to their handlers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// PostgreSQL connection URL.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[arg(long, env = "POOL_MIN_SIZE", default_value_t = 1)]
    pool_min_size: u32,

    #[arg(long, env = "POOL_MAX_SIZE", default_value_t = 5)]
    pool_max_size: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Base URL of the notifier service receiving `incident.created`.
    #[arg(long, env = "NOTIFIER_BASE_URL", default_value = "http://localhost:8090")]
    notifier_base_url: String,

    #[arg(long, env = "NOTIFIER_TIMEOUT_S", default_value_t = 10.0)]
    notifier_timeout_s: f64,

    #[command(flatten)]
    drain: DrainArgs,
}

impl Cli {
    fn notifier(&self) -> anyhow::Result<NotifierClient> {
        let timeout = secs("notifier-timeout-s", self.notifier_timeout_s)?;
        NotifierClient::new(&self.notifier_base_url, timeout)
    }
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Run the drain until SIGINT/SIGTERM (default).
    Run,
    /// Print row counts per status as JSON.
    Status,
    /// Print dead-lettered rows as JSON.
    Dead {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Create the outbox table if it does not exist.
    InitSchema,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum LogFormat {
    Text,
    Json,
}

/// Drain knobs, in seconds where a duration is expected.
#[derive(Args, Debug)]
struct DrainArgs {
    #[arg(long, env = "DRAIN_POLL_SLEEP_S", default_value_t = 1.0)]
    poll_sleep_s: f64,

    #[arg(long, env = "DRAIN_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,

    #[arg(long, env = "DRAIN_BASE_BACKOFF_S", default_value_t = 3.0)]
    base_backoff_s: f64,

    #[arg(long, env = "DRAIN_BACKOFF_FACTOR", default_value_t = 2.0)]
    backoff_factor: f64,

    #[arg(long, env = "DRAIN_JITTER_S", default_value_t = 0.5)]
    jitter_s: f64,

    #[arg(long, env = "DRAIN_MAX_CONCURRENCY", default_value_t = 5)]
    max_concurrency: usize,

    #[arg(long, env = "DRAIN_BATCH_SIZE", default_value_t = 5)]
    batch_size: usize,

    /// Requeue rows stuck in processing for longer than this. Off if unset.
    #[arg(long, env = "DRAIN_REAP_AFTER_S")]
    reap_after_s: Option<f64>,

    #[arg(long, env = "DRAIN_REAP_INTERVAL_S", default_value_t = 30.0)]
    reap_interval_s: f64,
}

impl DrainArgs {
    fn to_config(&self) -> anyhow::Result<DrainConfig> {
        let reap = match self.reap_after_s {
            Some(after) => Some(ReapConfig {
                stale_after: secs("reap-after-s", after)?,
                interval: secs("reap-interval-s", self.reap_interval_s)?,
            }),
            None => None,
        };

        let config = DrainConfig {
            poll_sleep: secs("poll-sleep-s", self.poll_sleep_s)?,
            max_retries: self.max_retries,
            base_backoff: secs("base-backoff-s", self.base_backoff_s)?,
            backoff_factor: self.backoff_factor,
            jitter: secs("jitter-s", self.jitter_s)?,
            max_concurrency: self.max_concurrency,
            batch_size: self.batch_size,
            reap,
        };
        config.validate()?;
        Ok(config)
    }
}

fn secs(name: &str, value: f64) -> anyhow::Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("--{name} must be a non-negative number of seconds, got {value}"))
}

fn init_tracing(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn router(notifier: NotifierClient) -> anyhow::Result<Router> {
    let router = Router::builder()
        .route(INCIDENT_CREATED, Arc::new(notifier))
        .expect_event_types(&[INCIDENT_CREATED])
        .build()?;
    Ok(router)
}

async fn run(
    store: Arc<PgOutboxStore>,
    config: DrainConfig,
    notifier: NotifierClient,
) -> anyhow::Result<()> {
    info!(url = notifier.new_incident_url(), "notifier configured");
    let router = router(notifier)?;
    info!(event_types = ?router.event_types(), "routes registered");

    let mut handle = OutboxDrain::new(store, Arc::new(router), config)?.start();

    tokio::select! {
        result = handle.finished() => {
            if let Err(e) = result {
                error!(error = %e, "outbox drain exited with error");
                return Err(e.into());
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal, stopping drain");
        }
    }

    handle.stop().await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                error!(error = %e, "failed to register SIGTERM, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);

    if cli.pool_min_size > cli.pool_max_size {
        bail!(
            "--pool-min-size ({}) exceeds --pool-max-size ({})",
            cli.pool_min_size,
            cli.pool_max_size
        );
    }
    let config = cli.drain.to_config()?;
    let notifier = cli.notifier()?;

    let pool = PgPoolOptions::new()
        .min_connections(cli.pool_min_size)
        .max_connections(cli.pool_max_size)
        .connect(&cli.database_url)
        .await
        .context("connect to database")?;
    let store = Arc::new(PgOutboxStore::new(pool));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(store, config, notifier).await?,
        Command::Status => {
            let counts = store.counts().await?;
            println!("{}", serde_json::to_string_pretty(&counts)?);
        }
        Command::Dead { limit } => {
            let rows = store.list_dead(limit).await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Command::InitSchema => {
            store.ensure_schema().await?;
            info!("incident_outbox schema ensured");
        }
    }

    Ok(())
}

//! Command-line and environment surface for embedding binaries.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::auth::TokenIssuer;
use crate::config::{
    ReaperConfig, WorkerConfig, DEFAULT_APP_URL, DEFAULT_CONCURRENCY,
    DEFAULT_DEQUEUE_BACKOFF_MAX_MS, DEFAULT_HEARTBEAT_INTERVAL_MS,
};
use crate::environment::default_container_host;
use crate::exec::Executor;
use crate::reaper::Reaper;
use crate::store::RecordStore;
use crate::tracker::FileLogStore;
use crate::worker::Worker;

/// Initialize logging from `RUST_LOG`, defaulting to `info`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug, Clone)]
#[command(name = "build-worker")]
#[command(version)]
#[command(about = "Runs queued CI builds")]
pub struct WorkerArgs {
    /// Worker identity (defaults to a random id)
    #[arg(long, env = "WORKER_ID")]
    pub worker_id: Option<String>,

    /// Maximum number of concurrent builds
    #[arg(long, env = "WORKER_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Upper bound of the random wait after an empty queue (ms)
    #[arg(
        long,
        env = "WORKER_DEQUEUE_BACKOFF_MAX_MS",
        default_value_t = DEFAULT_DEQUEUE_BACKOFF_MAX_MS
    )]
    pub dequeue_backoff_max_ms: u64,

    /// Build heartbeat interval (ms)
    #[arg(
        long,
        env = "WORKER_HEARTBEAT_INTERVAL_MS",
        default_value_t = DEFAULT_HEARTBEAT_INTERVAL_MS
    )]
    pub heartbeat_interval_ms: u64,

    /// Do not add test steps to auto-generated plans
    #[arg(long, env = "SKIP_INFERRED_TESTS")]
    pub skip_inferred_tests: bool,

    /// Run outside the server process
    #[arg(long, env = "WORKER_REMOTE", requires = "identity_key")]
    pub remote: bool,

    /// Pre-shared key used to mint worker tokens in remote mode
    #[arg(long, env = "WORKER_IDENTITY_KEY", hide_env_values = true)]
    pub identity_key: Option<String>,

    /// Host that build containers use to reach the server's loopback address
    #[arg(long, env = "CONTAINER_HOST")]
    pub container_host: Option<String>,

    /// Externally visible server URL
    #[arg(long, env = "APP_URL", default_value = DEFAULT_APP_URL)]
    pub app_url: String,

    /// Directory for task logs
    #[arg(long, env = "WORKER_LOG_DIR", default_value = "build-logs")]
    pub log_dir: PathBuf,

    /// Also run the heartbeat reaper in this process
    #[arg(long, env = "WORKER_RUN_REAPER")]
    pub reaper: bool,
}

impl From<WorkerArgs> for WorkerConfig {
    fn from(args: WorkerArgs) -> Self {
        let defaults = WorkerConfig::default();
        Self {
            worker_id: args.worker_id.unwrap_or(defaults.worker_id),
            concurrency: args.concurrency,
            dequeue_backoff_max_ms: args.dequeue_backoff_max_ms,
            heartbeat_interval_ms: args.heartbeat_interval_ms,
            skip_inferred_tests: args.skip_inferred_tests,
            remote: args.remote,
            identity_key: args.identity_key,
            container_host: args
                .container_host
                .unwrap_or_else(|| default_container_host().to_string()),
            app_url: args.app_url,
            log_dir: args.log_dir,
        }
    }
}

/// Builds a worker from `args` with task logs written under `--log-dir`.
/// With `--reaper` the heartbeat reaper runs in the same process, using the
/// worker's heartbeat interval.
pub fn worker_from_args(
    args: WorkerArgs,
    store: Arc<dyn RecordStore>,
    executor: Arc<dyn Executor>,
    tokens: Arc<dyn TokenIssuer>,
) -> crate::Result<Worker> {
    let run_reaper = args.reaper;
    let reaper = ReaperConfig {
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        ..ReaperConfig::default()
    };
    let config = WorkerConfig::from(args);
    let logs = Arc::new(FileLogStore::new(config.log_dir.clone()));

    let worker = Worker::new(config, store, executor, tokens, logs)?;
    if run_reaper {
        worker.with_reaper(reaper)
    } else {
        Ok(worker)
    }
}

/// Entry point for embedding binaries: initializes logging, then runs the
/// worker until SIGTERM or SIGINT.
pub async fn run_worker(
    args: WorkerArgs,
    store: Arc<dyn RecordStore>,
    executor: Arc<dyn Executor>,
    tokens: Arc<dyn TokenIssuer>,
) -> crate::Result<()> {
    init_logging();
    worker_from_args(args, store, executor, tokens)?
        .run_until_signal()
        .await
}

#[derive(Parser, Debug, Clone)]
#[command(name = "build-reaper")]
#[command(about = "Kills builds whose worker stopped heartbeating")]
pub struct ReaperArgs {
    /// Worker heartbeat interval (ms)
    #[arg(
        long,
        env = "WORKER_HEARTBEAT_INTERVAL_MS",
        default_value_t = DEFAULT_HEARTBEAT_INTERVAL_MS
    )]
    pub heartbeat_interval_ms: u64,

    /// Allowed clock difference between workers and the reaper (ms)
    #[arg(long, env = "REAPER_CLOCK_SKEW_MARGIN_MS", default_value_t = 60_000)]
    pub clock_skew_margin_ms: u64,

    /// Active builds fetched per page
    #[arg(long, default_value_t = 100)]
    pub page_size: u32,
}

impl From<ReaperArgs> for ReaperConfig {
    fn from(args: ReaperArgs) -> Self {
        Self {
            heartbeat_interval_ms: args.heartbeat_interval_ms,
            clock_skew_margin_ms: args.clock_skew_margin_ms,
            page_size: args.page_size,
            ..ReaperConfig::default()
        }
    }
}

/// Builds a standalone reaper from `args`.
pub fn reaper_from_args(args: ReaperArgs, store: Arc<dyn RecordStore>) -> crate::Result<Reaper> {
    let config = ReaperConfig::from(args);
    config.validate()?;
    Ok(Reaper::new(store, config))
}

/// Entry point for a standalone reaper process: initializes logging, then
/// scans until SIGTERM or SIGINT.
pub async fn run_reaper(args: ReaperArgs, store: Arc<dyn RecordStore>) -> crate::Result<()> {
    init_logging();
    reaper_from_args(args, store)?
        .run(crate::shutdown::install_shutdown_handler())
        .await;
    Ok(())
}

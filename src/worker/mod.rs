//! The build worker: dispatch loop, per-build pipeline and heartbeats.
//!
//! - [`WorkerPool`]: dequeues builds and runs up to `concurrency` at once
//! - [`BuildPipeline`]: start, compile, resolve, execute and end one build
//! - [`heartbeat`]: keeps a running build's liveness timestamp fresh
//!
//! [`Worker`] wires these together from a [`WorkerConfig`] and runs them,
//! optionally alongside an in-process [`Reaper`], under one shutdown token.

pub mod heartbeat;
pub mod pipeline;
pub mod pool;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::{IdentityKey, SharedToken, TokenIssuer, TokenScope};
use crate::config::{ConfigError, ReaperConfig, WorkerConfig};
use crate::environment::Resolver;
use crate::error::Result;
use crate::exec::{Executor, Orchestrator};
use crate::plan::{CompileOptions, PlanCompiler};
use crate::reaper::Reaper;
use crate::store::RecordStore;
use crate::tracker::LogStore;

pub use heartbeat::HeartbeatSender;
pub use pipeline::BuildPipeline;
pub use pool::WorkerPool;

pub struct Worker {
    pool: WorkerPool,
    reaper: Option<Reaper>,
    store: Arc<dyn RecordStore>,
    worker_token: Option<SharedToken>,
}

impl Worker {
    /// Builds a worker that obtains build and repository tokens from
    /// `tokens`. In remote mode `tokens` is ignored and tokens are minted
    /// from the configured identity key instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the identity key
    /// is unusable.
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn RecordStore>,
        executor: Arc<dyn Executor>,
        tokens: Arc<dyn TokenIssuer>,
        logs: Arc<dyn LogStore>,
    ) -> Result<Self> {
        config.validate()?;

        let (tokens, worker_token) = if config.remote {
            let key = config
                .identity_key
                .as_deref()
                .ok_or(ConfigError::MissingIdentityKey)?;
            let issuer: Arc<dyn TokenIssuer> =
                Arc::new(IdentityKey::new(key, config.worker_id.clone())?);
            let worker_token = SharedToken::new(issuer.clone(), TokenScope::Worker);
            (issuer, Some(worker_token))
        } else {
            (tokens, None)
        };

        let compiler = PlanCompiler::new(
            store.clone(),
            CompileOptions {
                skip_inferred_tests: config.skip_inferred_tests,
            },
        );
        let resolver = Resolver::new(
            store.clone(),
            tokens.clone(),
            config.parsed_app_url()?,
            config.container_host.clone(),
        );
        let pipeline = Arc::new(BuildPipeline::new(
            store.clone(),
            logs,
            tokens,
            compiler,
            resolver,
            Orchestrator::new(executor),
            config.heartbeat_interval(),
        ));

        let mut pool = WorkerPool::new(store.clone(), pipeline, &config)?;
        if let Some(token) = &worker_token {
            pool = pool.with_worker_token(token.clone());
        }

        tracing::info!(
            worker_id = %config.worker_id,
            concurrency = config.concurrency,
            remote = config.remote,
            "Worker configured"
        );
        Ok(Self {
            pool,
            reaper: None,
            store,
            worker_token,
        })
    }

    /// Also runs a heartbeat reaper in this process.
    pub fn with_reaper(mut self, config: ReaperConfig) -> Result<Self> {
        config.validate()?;
        self.reaper = Some(Reaper::new(self.store.clone(), config));
        Ok(self)
    }

    /// The worker-scoped token in remote mode. Its interceptor authenticates
    /// the record store transport.
    pub fn worker_token(&self) -> Option<&SharedToken> {
        self.worker_token.as_ref()
    }

    /// Runs until SIGTERM or SIGINT, then drains.
    pub async fn run_until_signal(self) -> Result<()> {
        self.run(crate::shutdown::install_shutdown_handler()).await
    }

    /// Runs until `shutdown` fires and in-flight builds have finished.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let reaper = self.reaper.map(|reaper| {
            let token = shutdown.clone();
            tokio::spawn(async move { reaper.run(token).await })
        });

        let result = self.pool.run(shutdown.clone()).await;
        if result.is_err() {
            shutdown.cancel();
        }

        if let Some(handle) = reaper {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Reaper task failed");
            }
        }
        result.map_err(Into::into)
    }
}

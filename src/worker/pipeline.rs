use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::auth::{TokenIssuer, TokenScope};
use crate::environment::{join_path, EnvError, Resolver};
use crate::error::Result;
use crate::exec::{ExecutionPayload, Orchestrator};
use crate::plan::{ImportTarget, PlanCompiler};
use crate::store::{Build, RecordStore};
use crate::tracker::{BuildTracker, LogStore};
use crate::worker::heartbeat::HeartbeatSender;

/// Server path receiving code-intelligence uploads.
pub const IMPORT_PATH: &str = ".api/codeintel/import";

/// Runs one dequeued build from start to end.
pub struct BuildPipeline {
    store: Arc<dyn RecordStore>,
    logs: Arc<dyn LogStore>,
    tokens: Arc<dyn TokenIssuer>,
    compiler: PlanCompiler,
    resolver: Resolver,
    orchestrator: Orchestrator,
    heartbeat_interval: Duration,
}

impl BuildPipeline {
    pub fn new(
        store: Arc<dyn RecordStore>,
        logs: Arc<dyn LogStore>,
        tokens: Arc<dyn TokenIssuer>,
        compiler: PlanCompiler,
        resolver: Resolver,
        orchestrator: Orchestrator,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            logs,
            tokens,
            compiler,
            resolver,
            orchestrator,
            heartbeat_interval,
        }
    }

    /// Starts the build, heartbeats while it runs and records its outcome.
    ///
    /// # Errors
    ///
    /// Returns the build's failure after it has been recorded, or a store
    /// error if the outcome itself could not be recorded.
    pub async fn run(&self, build: Build) -> Result<()> {
        let tracker = BuildTracker::new(self.store.clone(), self.logs.clone(), build.spec.clone());
        tracing::info!(build = %build.spec, branch = ?build.branch, "Starting build");

        let result = match tracker.start().await {
            Ok(_) => {
                let stop = CancellationToken::new();
                let heartbeat = HeartbeatSender::new(self.heartbeat_interval);
                let beat = tokio::spawn({
                    let tracker = tracker.clone();
                    let stop = stop.clone();
                    async move { heartbeat.run(tracker, stop).await }
                });

                let result = self.execute(&build, &tracker).await;
                stop.cancel();
                if let Err(e) = beat.await {
                    tracing::warn!(build = %build.spec, error = %e, "Heartbeat task failed");
                }
                result
            }
            Err(e) => Err(e.into()),
        };

        tracker.end(&result).await?;
        result
    }

    async fn execute(&self, build: &Build, tracker: &BuildTracker) -> Result<()> {
        let repo = self.store.get_repo(&build.spec.repo).await?;

        let token = self
            .tokens
            .issue(&TokenScope::Build(build.spec.clone()))
            .await
            .map_err(EnvError::from)?;
        let import = ImportTarget {
            url: self.import_url()?.to_string(),
            token: token.token,
        };
        let compiled = self.compiler.compile(&build.spec.rev(), &import).await?;

        let env = self.resolver.resolve(&repo).await?;
        let payload = ExecutionPayload::new(build, env, compiled.plan);
        self.orchestrator
            .run(tracker, &payload, &compiled.axes)
            .await?;
        Ok(())
    }

    fn import_url(&self) -> std::result::Result<Url, EnvError> {
        let callback = self.resolver.translate(self.resolver.app_url())?;
        join_path(&callback, IMPORT_PATH)
    }
}

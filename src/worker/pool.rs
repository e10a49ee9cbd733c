use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthError, SharedToken};
use crate::config::{ConfigError, WorkerConfig};
use crate::store::RecordStore;
use crate::worker::pipeline::BuildPipeline;

/// Fixed wait after a store error other than an empty queue.
pub const DEQUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Dispatch loop running at most `concurrency` builds at once.
pub struct WorkerPool {
    store: Arc<dyn RecordStore>,
    pipeline: Arc<BuildPipeline>,
    concurrency: usize,
    backoff_max: Duration,
    worker_token: Option<SharedToken>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn RecordStore>,
        pipeline: Arc<BuildPipeline>,
        config: &WorkerConfig,
    ) -> Result<Self, ConfigError> {
        if config.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        Ok(Self {
            store,
            pipeline,
            concurrency: config.concurrency,
            backoff_max: config.dequeue_backoff_max(),
            worker_token: None,
        })
    }

    /// Authenticates dequeues with `token`, refreshed for as long as the
    /// pool runs.
    pub fn with_worker_token(mut self, token: SharedToken) -> Self {
        self.worker_token = Some(token);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Dequeues and runs builds until `shutdown` fires, then waits for the
    /// builds already running.
    ///
    /// # Errors
    ///
    /// Fails only if the initial worker token cannot be minted.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AuthError> {
        if let Some(token) = &self.worker_token {
            token.refresh().await?;
            tokio::spawn(token.clone().refresh_loop(shutdown.child_token()));
        }

        tracing::info!(concurrency = self.concurrency, "Worker pool started");
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut running = JoinSet::new();

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let dequeued = tokio::select! {
                _ = shutdown.cancelled() => break,
                dequeued = self.store.dequeue_next_build() => dequeued,
            };

            let wait = match dequeued {
                Ok(build) => {
                    tracing::debug!(build = %build.spec, "Dequeued build");
                    let pipeline = self.pipeline.clone();
                    running.spawn(async move {
                        let _permit = permit;
                        let spec = build.spec.clone();
                        (spec, pipeline.run(build).await)
                    });
                    None
                }
                Err(e) if e.is_not_found() => Some(jitter(self.backoff_max)),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to dequeue build");
                    Some(DEQUEUE_ERROR_BACKOFF)
                }
            };

            while let Some(finished) = running.try_join_next() {
                log_finished(finished);
            }

            if let Some(wait) = wait {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        tracing::info!(in_flight = running.len(), "Worker pool draining");
        while let Some(finished) = running.join_next().await {
            log_finished(finished);
        }
        tracing::info!("Worker pool stopped");
        Ok(())
    }
}

fn log_finished(
    finished: Result<(crate::store::BuildSpec, crate::Result<()>), tokio::task::JoinError>,
) {
    match finished {
        Ok((spec, Ok(()))) => tracing::debug!(build = %spec, "Build finished"),
        Ok((spec, Err(e))) => {
            tracing::debug!(build = %spec, error = %e, "Build finished with error")
        }
        Err(e) => tracing::error!(error = %e, "Build task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_stays_in_range() {
        let max = Duration::from_millis(50);
        for _ in 0..100 {
            assert!(jitter(max) <= max);
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }
}

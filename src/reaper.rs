//! Marks builds whose worker stopped heartbeating as killed.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::ReaperConfig;
use crate::store::{Build, BuildUpdate, Page, RecordStore, StoreError};

/// Random scan interval in `[min_ms, max_ms]`.
pub fn scan_interval(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(min_ms..=max_ms.max(min_ms)))
}

pub struct Reaper {
    store: Arc<dyn RecordStore>,
    config: ReaperConfig,
}

impl Reaper {
    pub fn new(store: Arc<dyn RecordStore>, config: ReaperConfig) -> Self {
        Self { store, config }
    }

    /// Whether `build` has been silent for longer than the threshold.
    /// `None` when the build has no liveness timestamp at all.
    pub fn is_stale(&self, build: &Build, now: DateTime<Utc>) -> Option<bool> {
        build
            .last_liveness()
            .map(|last| now - last > self.config.staleness_threshold())
    }

    /// One pass over all active builds. Returns how many were killed.
    ///
    /// All pages are read before any build is updated so that kills do not
    /// shift later pages.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut active = Vec::new();
        let mut page = Page::first(self.config.page_size);
        loop {
            let builds = self.store.list_active_builds(page).await?;
            let done = builds.is_empty() || builds.len() < page.per_page as usize;
            active.extend(builds);
            if done {
                break;
            }
            page = page.next();
        }

        let mut killed = 0;
        for build in active {
            match self.is_stale(&build, now) {
                None => {
                    tracing::error!(
                        build = %build.spec,
                        "Active build has neither start nor heartbeat time"
                    );
                }
                Some(false) => {}
                Some(true) => {
                    match self
                        .store
                        .update_build(&build.spec, BuildUpdate::killed(now))
                        .await
                    {
                        Ok(_) => {
                            killed += 1;
                            tracing::warn!(
                                build = %build.spec,
                                last_liveness = ?build.last_liveness(),
                                "Killed build with expired heartbeat"
                            );
                        }
                        Err(e) => {
                            tracing::error!(
                                build = %build.spec,
                                error = %e,
                                "Failed to kill stale build"
                            );
                        }
                    }
                }
            }
        }
        Ok(killed)
    }

    /// Scans until `shutdown` fires, sleeping a jittered interval between scans.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            threshold_ms = self.config.staleness_threshold().num_milliseconds(),
            "Starting heartbeat reaper"
        );
        loop {
            match self.scan_once(Utc::now()).await {
                Ok(0) => tracing::debug!("No stale builds"),
                Ok(killed) => tracing::info!(killed, "Reaped stale builds"),
                Err(e) => tracing::warn!(error = %e, "Failed to list active builds"),
            }

            let wait = scan_interval(
                self.config.scan_interval_min_ms,
                self.config.scan_interval_max_ms,
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }
        tracing::info!("Heartbeat reaper stopped");
    }
}

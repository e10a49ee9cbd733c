use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::tracker::BuildTracker;

/// Periodically records a build heartbeat while the build runs.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Sends heartbeats for `tracker`'s build until `stop` fires. The first
    /// heartbeat goes out one interval after the call; the build's start time
    /// covers liveness until then. Failures are logged and retried on the
    /// next tick.
    pub async fn run(&self, tracker: BuildTracker, stop: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = tracker.heartbeat().await {
                        tracing::debug!(
                            build = %tracker.spec(),
                            error = %e,
                            "Heartbeat failed, retrying next tick"
                        );
                    }
                }
            }
        }
    }
}

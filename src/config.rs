use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::environment::default_container_host;

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_DEQUEUE_BACKOFF_MAX_MS: u64 = 5_000;
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_APP_URL: &str = "http://localhost:3080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeat,

    #[error("invalid app URL {url:?}: {reason}")]
    InvalidAppUrl { url: String, reason: String },

    #[error("remote mode requires an identity key")]
    MissingIdentityKey,

    #[error("scan interval range {min_ms}..={max_ms} ms is empty")]
    InvalidScanInterval { min_ms: u64, max_ms: u64 },

    #[error("page size must be at least 1")]
    ZeroPageSize,
}

/// Configuration for a build worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Stable identity, used as the token subject in remote mode.
    pub worker_id: String,
    /// Maximum number of builds running at once.
    pub concurrency: usize,
    /// Upper bound of the random sleep after an empty dequeue.
    pub dequeue_backoff_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Leave test steps out of auto-generated plans.
    pub skip_inferred_tests: bool,
    /// Run outside the server process, authenticating with `identity_key`.
    pub remote: bool,
    pub identity_key: Option<String>,
    /// Host substituted for loopback addresses inside build containers.
    pub container_host: String,
    /// Externally visible server URL.
    pub app_url: String,
    /// Root directory for task logs.
    pub log_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            concurrency: DEFAULT_CONCURRENCY,
            dequeue_backoff_max_ms: DEFAULT_DEQUEUE_BACKOFF_MAX_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            skip_inferred_tests: false,
            remote: false,
            identity_key: None,
            container_host: default_container_host().to_string(),
            app_url: DEFAULT_APP_URL.to_string(),
            log_dir: PathBuf::from("build-logs"),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_app_url(mut self, app_url: impl Into<String>) -> Self {
        self.app_url = app_url.into();
        self
    }

    pub fn with_identity_key(mut self, key: impl Into<String>) -> Self {
        self.remote = true;
        self.identity_key = Some(key.into());
        self
    }

    pub fn dequeue_backoff_max(&self) -> Duration {
        Duration::from_millis(self.dequeue_backoff_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn parsed_app_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.app_url).map_err(|e| ConfigError::InvalidAppUrl {
            url: self.app_url.clone(),
            reason: e.to_string(),
        })?;
        if url.host_str().map_or(true, str::is_empty) {
            return Err(ConfigError::InvalidAppUrl {
                url: self.app_url.clone(),
                reason: "missing host".to_string(),
            });
        }
        Ok(url)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.remote
            && self
                .identity_key
                .as_deref()
                .map_or(true, |k| k.trim().is_empty())
        {
            return Err(ConfigError::MissingIdentityKey);
        }
        self.parsed_app_url()?;
        Ok(())
    }
}

/// Configuration for the heartbeat reaper.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Must match the workers' heartbeat interval.
    pub heartbeat_interval_ms: u64,
    /// Tolerated clock difference between workers and the reaper.
    pub clock_skew_margin_ms: u64,
    pub page_size: u32,
    pub scan_interval_min_ms: u64,
    pub scan_interval_max_ms: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            clock_skew_margin_ms: 60_000,
            page_size: 100,
            scan_interval_min_ms: 3 * 60_000,
            scan_interval_max_ms: 5 * 60_000,
        }
    }
}

impl ReaperConfig {
    /// A build silent for longer than this is considered dead.
    pub fn staleness_threshold(&self) -> chrono::Duration {
        let ms = self.heartbeat_interval_ms + self.clock_skew_margin_ms;
        chrono::Duration::milliseconds(ms as i64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }
        if self.scan_interval_min_ms > self.scan_interval_max_ms {
            return Err(ConfigError::InvalidScanInterval {
                min_ms: self.scan_interval_min_ms,
                max_ms: self.scan_interval_max_ms,
            });
        }
        Ok(())
    }
}

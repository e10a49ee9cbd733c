//! Record store seam: build/task records and the operations this crate needs
//! from the server that owns them.
//!
//! The transport is not part of this crate. Real deployments implement
//! [`RecordStore`] on top of an RPC client and convert its `tonic::Status`
//! failures into [`StoreError`]; tests and embedders use [`MemoryStore`].

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tonic::Code;

pub use memory::MemoryStore;

/// Errors surfaced by a [`RecordStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    FailedPrecondition(String),

    #[error("rpc error: {0}")]
    Rpc(tonic::Status),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<tonic::Status> for StoreError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            Code::NotFound => StoreError::NotFound(status.message().to_string()),
            Code::FailedPrecondition => {
                StoreError::FailedPrecondition(status.message().to_string())
            }
            _ => StoreError::Rpc(status),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A repository at a specific commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepoRevSpec {
    pub repo: String,
    pub commit_id: String,
}

impl RepoRevSpec {
    pub fn new(repo: impl Into<String>, commit_id: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            commit_id: commit_id.into(),
        }
    }
}

impl fmt::Display for RepoRevSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.commit_id)
    }
}

/// Identifies one build attempt of a repository commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildSpec {
    pub repo: String,
    pub commit_id: String,
    pub attempt: u32,
}

impl BuildSpec {
    pub fn new(repo: impl Into<String>, commit_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            repo: repo.into(),
            commit_id: commit_id.into(),
            attempt,
        }
    }

    pub fn rev(&self) -> RepoRevSpec {
        RepoRevSpec::new(self.repo.clone(), self.commit_id.clone())
    }
}

impl fmt::Display for BuildSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.repo, self.commit_id, self.attempt)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub spec: BuildSpec,
    pub branch: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub failure: bool,
    pub killed: bool,
    /// YAML of the compiled plan, written before execution starts.
    pub builder_config: Option<String>,
}

impl Build {
    pub fn new(spec: BuildSpec) -> Self {
        Self {
            spec,
            branch: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            heartbeat_at: None,
            success: false,
            failure: false,
            killed: false,
            builder_config: None,
        }
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Most recent sign of life from the owning worker.
    pub fn last_liveness(&self) -> Option<DateTime<Utc>> {
        match (self.started_at, self.heartbeat_at) {
            (Some(s), Some(h)) => Some(s.max(h)),
            (s, h) => s.or(h),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }

    pub fn apply(&mut self, update: &BuildUpdate) {
        if let Some(at) = update.started_at {
            self.started_at = Some(at);
        }
        if let Some(at) = update.heartbeat_at {
            self.heartbeat_at = Some(at);
        }
        // A killed build stays failed even if its worker reports later.
        if update.success && !self.killed {
            self.success = true;
            self.failure = false;
        }
        if update.failure {
            self.failure = true;
            self.success = false;
        }
        if update.killed {
            self.killed = true;
            self.failure = true;
            self.success = false;
        }
        if let Some(at) = update.ended_at {
            self.ended_at = Some(at);
        }
        if let Some(ref config) = update.builder_config {
            self.builder_config = Some(config.clone());
        }
    }
}

/// Partial update of a [`Build`]. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub success: bool,
    pub failure: bool,
    pub killed: bool,
    pub ended_at: Option<DateTime<Utc>>,
    pub builder_config: Option<String>,
}

impl BuildUpdate {
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn heartbeat(at: DateTime<Utc>) -> Self {
        Self {
            heartbeat_at: Some(at),
            ..Default::default()
        }
    }

    /// Terminal update: exactly one of success/failure is set.
    pub fn ended(ok: bool, at: DateTime<Utc>) -> Self {
        Self {
            success: ok,
            failure: !ok,
            ended_at: Some(at),
            ..Default::default()
        }
    }

    /// Forced termination by the reaper.
    pub fn killed(at: DateTime<Utc>) -> Self {
        Self {
            failure: true,
            killed: true,
            ended_at: Some(at),
            ..Default::default()
        }
    }

    pub fn builder_config(config: String) -> Self {
        Self {
            builder_config: Some(config),
            ..Default::default()
        }
    }
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Skipped,
    Warnings,
    Success,
    Failure,
}

impl TaskStatus {
    /// Terminal statuses never change again.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Skipped | Self::Success | Self::Failure)
    }

    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Queued => !matches!(target, Self::Queued),
            Self::Started => !matches!(target, Self::Queued | Self::Started),
            Self::Warnings => matches!(
                target,
                Self::Warnings | Self::Skipped | Self::Success | Self::Failure
            ),
            Self::Skipped | Self::Success | Self::Failure => false,
        }
    }

    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Skipped => "skipped",
            Self::Warnings => "warnings",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskSpec {
    pub build: BuildSpec,
    pub id: u64,
}

impl fmt::Display for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/task-{}", self.build, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub spec: TaskSpec,
    pub parent_id: Option<u64>,
    pub label: String,
    pub status: TaskStatus,
    /// Sticky: once flagged the task keeps displaying warnings whatever its outcome.
    pub warnings: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(spec: TaskSpec, new: NewTask) -> Self {
        Self {
            spec,
            parent_id: new.parent_id,
            label: new.label,
            status: TaskStatus::Queued,
            warnings: false,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }
}

/// A task creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTask {
    pub label: String,
    pub parent_id: Option<u64>,
}

impl NewTask {
    pub fn root(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            parent_id: None,
        }
    }

    pub fn child(label: impl Into<String>, parent_id: u64) -> Self {
        Self {
            label: label.into(),
            parent_id: Some(parent_id),
        }
    }
}

/// Partial update of a [`Task`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub skipped: bool,
    pub warnings: bool,
    pub success: bool,
    pub failure: bool,
    pub ended_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    /// The status this update moves the task into, if any.
    pub fn target_status(&self) -> Option<TaskStatus> {
        if self.failure {
            Some(TaskStatus::Failure)
        } else if self.success {
            Some(TaskStatus::Success)
        } else if self.skipped {
            Some(TaskStatus::Skipped)
        } else if self.warnings {
            Some(TaskStatus::Warnings)
        } else if self.started_at.is_some() {
            Some(TaskStatus::Started)
        } else {
            None
        }
    }
}

/// Repository metadata held by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repo {
    /// Server-side repository path, e.g. `github.com/foo/bar`.
    pub uri: String,
    /// True when the server holds a mirror of an external repository.
    pub mirror: bool,
    /// Clone URL of the external origin, if known.
    pub origin: Option<String>,
}

impl Repo {
    pub fn hosted(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mirror: false,
            origin: None,
        }
    }

    pub fn mirror_of(uri: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            mirror: true,
            origin: Some(origin.into()),
        }
    }
}

/// Languages detected in a repository revision, in detection order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    pub languages: Vec<String>,
}

impl Inventory {
    pub fn new<I, S>(languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            languages: languages.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}

/// Login material for an external code host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamCredential {
    pub login: String,
    pub token: String,
}

impl fmt::Debug for UpstreamCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCredential")
            .field("login", &self.login)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Zero-based page of a paginated listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub number: u32,
    pub per_page: u32,
}

impl Page {
    pub fn first(per_page: u32) -> Self {
        Self {
            number: 0,
            per_page,
        }
    }

    pub fn next(self) -> Self {
        Self {
            number: self.number + 1,
            ..self
        }
    }

    pub fn offset(&self) -> usize {
        self.number as usize * self.per_page as usize
    }
}

/// Operations required from the server's build/task store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Claims the next queued build. An empty queue is `StoreError::NotFound`.
    async fn dequeue_next_build(&self) -> StoreResult<Build>;

    async fn update_build(&self, build: &BuildSpec, update: BuildUpdate) -> StoreResult<Build>;

    /// Creates tasks in one call. The response order matches the request order.
    async fn create_tasks(&self, build: &BuildSpec, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>>;

    async fn update_task(&self, task: &TaskSpec, update: TaskUpdate) -> StoreResult<Task>;

    async fn list_active_builds(&self, page: Page) -> StoreResult<Vec<Build>>;

    async fn get_repo(&self, uri: &str) -> StoreResult<Repo>;

    /// Reads a file at a revision. A missing file is `StoreError::NotFound`.
    async fn get_repo_file(&self, rev: &RepoRevSpec, path: &str) -> StoreResult<Vec<u8>>;

    async fn get_inventory(&self, rev: &RepoRevSpec) -> StoreResult<Inventory>;

    async fn fetch_upstream_credential(&self, host: &str) -> StoreResult<UpstreamCredential>;
}

//! Build and task state tracking against the record store.

pub mod log;
pub mod task;

use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::store::{Build, BuildSpec, BuildUpdate, NewTask, RecordStore, StoreError, Task};

pub use log::{FileLogStore, LogSink, LogStore, MemoryLogStore};
pub use task::{TaskHandle, TaskResult};

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("task {0} already finished")]
    TaskFinished(String),

    #[error("task {0} is already a subtask")]
    TooDeep(String),

    #[error("store created {got} tasks, expected {expected}")]
    TaskCountMismatch { expected: usize, got: usize },

    #[error("task {index} came back as {got:?}, expected {expected:?}")]
    TaskOrderMismatch {
        index: usize,
        expected: String,
        got: String,
    },

    #[error("task log: {0}")]
    Log(#[from] std::io::Error),
}

/// Batch task creation must answer in request order. Checked by count and by
/// label at each position.
pub(crate) fn verify_created(requested: &[NewTask], created: &[Task]) -> Result<(), TrackerError> {
    if requested.len() != created.len() {
        return Err(TrackerError::TaskCountMismatch {
            expected: requested.len(),
            got: created.len(),
        });
    }
    for (index, (want, got)) in requested.iter().zip(created).enumerate() {
        if want.label != got.label || want.parent_id != got.parent_id {
            return Err(TrackerError::TaskOrderMismatch {
                index,
                expected: want.label.clone(),
                got: got.label.clone(),
            });
        }
    }
    Ok(())
}

/// Records the lifecycle of one build.
#[derive(Clone)]
pub struct BuildTracker {
    store: Arc<dyn RecordStore>,
    logs: Arc<dyn LogStore>,
    spec: BuildSpec,
}

impl fmt::Debug for BuildTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildTracker")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

impl BuildTracker {
    pub fn new(store: Arc<dyn RecordStore>, logs: Arc<dyn LogStore>, spec: BuildSpec) -> Self {
        Self { store, logs, spec }
    }

    pub fn spec(&self) -> &BuildSpec {
        &self.spec
    }

    pub async fn start(&self) -> Result<Build, TrackerError> {
        self.update("start", BuildUpdate::started(Utc::now())).await
    }

    pub async fn heartbeat(&self) -> Result<Build, TrackerError> {
        self.update("heartbeat", BuildUpdate::heartbeat(Utc::now()))
            .await
    }

    /// Stores the compiled plan on the build record.
    pub async fn set_builder_config(&self, config: String) -> Result<Build, TrackerError> {
        self.update("builder_config", BuildUpdate::builder_config(config))
            .await
    }

    /// Marks the build ended: success iff `result` is `Ok`.
    pub async fn end<E: fmt::Display>(
        &self,
        result: &Result<(), E>,
    ) -> Result<Build, TrackerError> {
        match result {
            Ok(()) => tracing::info!(build = %self.spec, "Build succeeded"),
            Err(e) => tracing::warn!(build = %self.spec, error = %e, "Build failed"),
        }
        self.update("end", BuildUpdate::ended(result.is_ok(), Utc::now()))
            .await
    }

    /// Creates one root task per label in a single store call and opens a
    /// handle for each, in label order.
    pub async fn create_tasks(&self, labels: &[String]) -> Result<Vec<TaskHandle>, TrackerError> {
        let requested: Vec<NewTask> = labels.iter().map(NewTask::root).collect();
        let created = self
            .store
            .create_tasks(&self.spec, requested.clone())
            .await
            .inspect_err(|e| {
                tracing::error!(build = %self.spec, error = %e, "Failed to create tasks");
            })?;
        verify_created(&requested, &created).inspect_err(|e| {
            tracing::error!(build = %self.spec, error = %e, "Task creation out of order");
        })?;

        let mut handles = Vec::with_capacity(created.len());
        for task in created {
            handles.push(TaskHandle::open(self.store.clone(), self.logs.clone(), task).await?);
        }
        Ok(handles)
    }

    async fn update(&self, op: &'static str, update: BuildUpdate) -> Result<Build, TrackerError> {
        self.store
            .update_build(&self.spec, update)
            .await
            .map_err(|e| {
                tracing::error!(build = %self.spec, op, error = %e, "Failed to update build");
                e.into()
            })
    }
}

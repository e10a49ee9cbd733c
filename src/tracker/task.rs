use std::fmt;
use std::sync::Arc;

use chrono::Utc;

use crate::store::{NewTask, RecordStore, Task, TaskSpec, TaskStatus, TaskUpdate};
use crate::tracker::log::{LogSink, LogStore};
use crate::tracker::{verify_created, TrackerError};

/// How a task finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Success,
    /// Failed, but the failure is tolerated.
    Warnings,
    Failure,
}

impl TaskResult {
    pub fn from_step(ok: bool, allow_failure: bool) -> Self {
        match (ok, allow_failure) {
            (true, _) => Self::Success,
            (false, true) => Self::Warnings,
            (false, false) => Self::Failure,
        }
    }

    fn update(self) -> TaskUpdate {
        let now = Utc::now();
        TaskUpdate {
            success: self == Self::Success,
            warnings: self == Self::Warnings,
            failure: self == Self::Failure,
            ended_at: Some(now),
            ..Default::default()
        }
    }
}

/// A live task owned by the worker. Every mutating call is a single store
/// update; nothing is retried.
pub struct TaskHandle {
    store: Arc<dyn RecordStore>,
    logs: Arc<dyn LogStore>,
    spec: TaskSpec,
    parent_id: Option<u64>,
    label: String,
    status: TaskStatus,
    finished: bool,
    log: Box<dyn LogSink>,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("spec", &self.spec)
            .field("label", &self.label)
            .field("status", &self.status)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl TaskHandle {
    pub(crate) async fn open(
        store: Arc<dyn RecordStore>,
        logs: Arc<dyn LogStore>,
        task: Task,
    ) -> Result<Self, TrackerError> {
        let log = logs.open(&task.spec).await?;
        Ok(Self {
            store,
            logs,
            spec: task.spec,
            parent_id: task.parent_id,
            label: task.label,
            status: task.status,
            finished: task.status.is_terminal(),
            log,
        })
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub async fn start(&mut self) -> Result<(), TrackerError> {
        self.update(TaskUpdate {
            started_at: Some(Utc::now()),
            ..Default::default()
        })
        .await
    }

    pub async fn skip(&mut self) -> Result<(), TrackerError> {
        let result = self
            .update(TaskUpdate {
                skipped: true,
                ended_at: Some(Utc::now()),
                ..Default::default()
            })
            .await;
        self.finish().await;
        result
    }

    /// Flags the task as having warnings without ending it.
    pub async fn warnings(&mut self) -> Result<(), TrackerError> {
        self.update(TaskUpdate {
            warnings: true,
            ..Default::default()
        })
        .await
    }

    pub async fn end(&mut self, result: TaskResult) -> Result<(), TrackerError> {
        let outcome = self.update(result.update()).await;
        self.finish().await;
        outcome
    }

    /// Creates a child task. Tasks are at most two levels deep.
    pub async fn create_subtask(&self, label: &str) -> Result<TaskHandle, TrackerError> {
        if self.parent_id.is_some() {
            return Err(TrackerError::TooDeep(self.label.clone()));
        }
        let requested = vec![NewTask::child(label, self.spec.id)];
        let created = self
            .store
            .create_tasks(&self.spec.build, requested.clone())
            .await
            .inspect_err(|e| {
                tracing::error!(task = %self.spec, label, error = %e, "Failed to create subtask");
            })?;
        verify_created(&requested, &created)?;
        let task = created
            .into_iter()
            .next()
            .ok_or(TrackerError::TaskCountMismatch {
                expected: 1,
                got: 0,
            })?;
        TaskHandle::open(self.store.clone(), self.logs.clone(), task).await
    }

    pub async fn log(&mut self, line: &str) -> Result<(), TrackerError> {
        if self.finished {
            return Err(TrackerError::TaskFinished(self.spec.to_string()));
        }
        self.log.write_line(line).await?;
        Ok(())
    }

    async fn update(&mut self, update: TaskUpdate) -> Result<(), TrackerError> {
        if self.finished {
            return Err(TrackerError::TaskFinished(self.spec.to_string()));
        }
        match self.store.update_task(&self.spec, update).await {
            Ok(task) => {
                self.status = task.status;
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    task = %self.spec,
                    label = %self.label,
                    error = %e,
                    "Failed to update task"
                );
                Err(e.into())
            }
        }
    }

    async fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if let Err(e) = self.log.close().await {
            tracing::warn!(task = %self.spec, error = %e, "Failed to close task log");
        }
    }
}

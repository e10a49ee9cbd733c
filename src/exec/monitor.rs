//! Step monitors: the callbacks an executor uses to report step lifecycle.
//! Each step gets its own subtask under the axis root task.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::tracker::{TaskHandle, TaskResult, TrackerError};

#[async_trait]
pub trait StepMonitor: Send {
    async fn start(&mut self) -> Result<(), TrackerError>;
    async fn skip(&mut self) -> Result<(), TrackerError>;
    async fn end(&mut self, ok: bool, allow_failure: bool) -> Result<(), TrackerError>;
    async fn log(&mut self, line: &str) -> Result<(), TrackerError>;
}

#[async_trait]
pub trait StepMonitorFactory: Send + Sync {
    async fn monitor(&self, section: &str, key: &str) -> Result<Box<dyn StepMonitor>, TrackerError>;
}

/// Label for a step's subtask.
///
/// The root build step is `Build`; a bare section is capitalized;
/// otherwise `Section: Key`.
pub fn step_label(section: &str, key: &str) -> String {
    if section == "build" && (key.is_empty() || key == "build") {
        return "Build".to_string();
    }
    let section = capitalize(section);
    if key.is_empty() {
        section
    } else {
        format!("{section}: {key}")
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Creates subtasks under an axis root task.
pub struct TaskMonitorFactory {
    root: Arc<Mutex<TaskHandle>>,
}

impl TaskMonitorFactory {
    pub fn new(root: Arc<Mutex<TaskHandle>>) -> Self {
        Self { root }
    }
}

#[async_trait]
impl StepMonitorFactory for TaskMonitorFactory {
    async fn monitor(
        &self,
        section: &str,
        key: &str,
    ) -> Result<Box<dyn StepMonitor>, TrackerError> {
        let label = step_label(section, key);
        let mut task = self.root.lock().await.create_subtask(&label).await?;
        if label.to_lowercase().contains("warning") {
            task.warnings().await?;
        }
        Ok(Box::new(TaskMonitor { task }))
    }
}

struct TaskMonitor {
    task: TaskHandle,
}

#[async_trait]
impl StepMonitor for TaskMonitor {
    async fn start(&mut self) -> Result<(), TrackerError> {
        self.task.start().await
    }

    async fn skip(&mut self) -> Result<(), TrackerError> {
        self.task.skip().await
    }

    async fn end(&mut self, ok: bool, allow_failure: bool) -> Result<(), TrackerError> {
        self.task
            .end(TaskResult::from_step(ok, allow_failure))
            .await
    }

    async fn log(&mut self, line: &str) -> Result<(), TrackerError> {
        self.task.log(line).await
    }
}

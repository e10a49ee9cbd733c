//! Per-task log sinks.
//!
//! Each task owns exactly one sink. The sink is closed when the task ends or
//! is skipped; writes after that fail.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::store::TaskSpec;

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Flushes and releases the sink. Closing twice is a no-op.
    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait]
pub trait LogStore: Send + Sync {
    async fn open(&self, task: &TaskSpec) -> io::Result<Box<dyn LogSink>>;
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "log sink is closed")
}

/// Writes one file per task under `root/<repo>/<commit>/<attempt>/<id>.log`.
#[derive(Debug, Clone)]
pub struct FileLogStore {
    root: PathBuf,
}

impl FileLogStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, task: &TaskSpec) -> PathBuf {
        let repo: PathBuf = task
            .build
            .repo
            .split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .collect();
        self.root
            .join(repo)
            .join(&task.build.commit_id)
            .join(task.build.attempt.to_string())
            .join(format!("{}.log", task.id))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn open(&self, task: &TaskSpec) -> io::Result<Box<dyn LogSink>> {
        let path = self.path_for(task);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Box::new(FileLogSink { file: Some(file) }))
    }
}

struct FileLogSink {
    file: Option<File>,
}

#[async_trait]
impl LogSink for FileLogSink {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        let file = self.file.as_mut().ok_or_else(closed)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    lines: Vec<String>,
    closed: bool,
}

/// Keeps task logs in memory. Clones share the same logs.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    logs: Arc<RwLock<HashMap<TaskSpec, MemoryLog>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lines(&self, task: &TaskSpec) -> Vec<String> {
        self.logs
            .read()
            .await
            .get(task)
            .map(|log| log.lines.clone())
            .unwrap_or_default()
    }

    pub async fn is_closed(&self, task: &TaskSpec) -> bool {
        self.logs
            .read()
            .await
            .get(task)
            .is_some_and(|log| log.closed)
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn open(&self, task: &TaskSpec) -> io::Result<Box<dyn LogSink>> {
        self.logs.write().await.entry(task.clone()).or_default();
        Ok(Box::new(MemoryLogSink {
            logs: self.logs.clone(),
            task: task.clone(),
            closed: false,
        }))
    }
}

struct MemoryLogSink {
    logs: Arc<RwLock<HashMap<TaskSpec, MemoryLog>>>,
    task: TaskSpec,
    closed: bool,
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn write_line(&mut self, line: &str) -> io::Result<()> {
        if self.closed {
            return Err(closed());
        }
        let mut logs = self.logs.write().await;
        logs.entry(self.task.clone())
            .or_default()
            .lines
            .push(line.to_string());
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        if !self.closed {
            self.closed = true;
            if let Some(log) = self.logs.write().await.get_mut(&self.task) {
                log.closed = true;
            }
        }
        Ok(())
    }
}

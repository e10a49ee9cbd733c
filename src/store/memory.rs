use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::store::{
    Build, BuildSpec, BuildUpdate, Inventory, NewTask, Page, RecordStore, Repo, RepoRevSpec,
    StoreError, StoreResult, Task, TaskSpec, TaskStatus, TaskUpdate, UpstreamCredential,
};

/// In-memory [`RecordStore`] holding builds, tasks and repository data.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    builds: HashMap<BuildSpec, Build>,
    queue: VecDeque<BuildSpec>,
    tasks: HashMap<BuildSpec, Vec<Task>>,
    repos: HashMap<String, Repo>,
    files: HashMap<(RepoRevSpec, String), Vec<u8>>,
    inventories: HashMap<RepoRevSpec, Inventory>,
    credentials: HashMap<String, UpstreamCredential>,
    dequeue_errors: VecDeque<StoreError>,
    dequeue_calls: usize,
    task_update_errors: HashMap<String, StoreError>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a build and puts it at the back of the dequeue queue.
    pub async fn enqueue_build(&self, build: Build) {
        let mut inner = self.inner.write().await;
        inner.queue.push_back(build.spec.clone());
        inner.builds.insert(build.spec.clone(), build);
    }

    /// Stores a build record without queueing it.
    pub async fn insert_build(&self, build: Build) {
        self.inner
            .write()
            .await
            .builds
            .insert(build.spec.clone(), build);
    }

    pub async fn add_repo(&self, repo: Repo) {
        self.inner
            .write()
            .await
            .repos
            .insert(repo.uri.clone(), repo);
    }

    pub async fn add_repo_file(&self, rev: RepoRevSpec, path: &str, contents: impl Into<Vec<u8>>) {
        self.inner
            .write()
            .await
            .files
            .insert((rev, path.to_string()), contents.into());
    }

    pub async fn set_inventory(&self, rev: RepoRevSpec, inventory: Inventory) {
        self.inner.write().await.inventories.insert(rev, inventory);
    }

    pub async fn add_upstream_credential(&self, host: &str, credential: UpstreamCredential) {
        self.inner
            .write()
            .await
            .credentials
            .insert(host.to_string(), credential);
    }

    /// Makes the next dequeue call fail with `error` instead of reading the queue.
    pub async fn fail_next_dequeue(&self, error: StoreError) {
        self.inner.write().await.dequeue_errors.push_back(error);
    }

    /// Makes the next update of the task labelled `label` fail with `error`.
    pub async fn fail_next_task_update(&self, label: &str, error: StoreError) {
        self.inner
            .write()
            .await
            .task_update_errors
            .insert(label.to_string(), error);
    }

    pub async fn dequeue_calls(&self) -> usize {
        self.inner.read().await.dequeue_calls
    }

    pub async fn queued_builds(&self) -> usize {
        self.inner.read().await.queue.len()
    }

    pub async fn build(&self, spec: &BuildSpec) -> Option<Build> {
        self.inner.read().await.builds.get(spec).cloned()
    }

    /// All tasks of a build in creation order.
    pub async fn tasks(&self, spec: &BuildSpec) -> Vec<Task> {
        self.inner
            .read()
            .await
            .tasks
            .get(spec)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn dequeue_next_build(&self) -> StoreResult<Build> {
        let mut inner = self.inner.write().await;
        inner.dequeue_calls += 1;
        if let Some(err) = inner.dequeue_errors.pop_front() {
            return Err(err);
        }
        let spec = inner
            .queue
            .pop_front()
            .ok_or_else(|| StoreError::NotFound("no queued builds".to_string()))?;
        inner
            .builds
            .get(&spec)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("build {spec}")))
    }

    async fn update_build(&self, build: &BuildSpec, update: BuildUpdate) -> StoreResult<Build> {
        let mut inner = self.inner.write().await;
        let record = inner
            .builds
            .get_mut(build)
            .ok_or_else(|| StoreError::NotFound(format!("build {build}")))?;
        record.apply(&update);
        Ok(record.clone())
    }

    async fn create_tasks(&self, build: &BuildSpec, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>> {
        let mut inner = self.inner.write().await;
        if !inner.builds.contains_key(build) {
            return Err(StoreError::NotFound(format!("build {build}")));
        }
        let existing = inner.tasks.entry(build.clone()).or_default();
        let mut created = Vec::with_capacity(tasks.len());
        for new in tasks {
            if let Some(parent) = new.parent_id {
                if !existing.iter().any(|t| t.spec.id == parent) {
                    return Err(StoreError::NotFound(format!("parent task {parent}")));
                }
            }
            let spec = TaskSpec {
                build: build.clone(),
                id: existing.len() as u64 + 1,
            };
            let task = Task::new(spec, new);
            existing.push(task.clone());
            created.push(task);
        }
        Ok(created)
    }

    async fn update_task(&self, task: &TaskSpec, update: TaskUpdate) -> StoreResult<Task> {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        let record = inner
            .tasks
            .get_mut(&task.build)
            .and_then(|tasks| tasks.iter_mut().find(|t| t.spec.id == task.id))
            .ok_or_else(|| StoreError::NotFound(format!("task {task}")))?;
        if let Some(err) = inner.task_update_errors.remove(&record.label) {
            return Err(err);
        }

        if let Some(mut target) = update.target_status() {
            // Starting a task flagged with warnings keeps it in warnings.
            if target == TaskStatus::Started && record.status == TaskStatus::Warnings {
                target = TaskStatus::Warnings;
            }
            if target != record.status && !record.status.can_transition_to(target) {
                return Err(StoreError::FailedPrecondition(format!(
                    "task {task} cannot move from {} to {target}",
                    record.status
                )));
            }
            record.status = target;
        }
        if update.warnings {
            record.warnings = true;
        }
        if let Some(at) = update.started_at {
            record.started_at = Some(at);
        }
        if let Some(at) = update.ended_at {
            record.ended_at = Some(at);
        }
        Ok(record.clone())
    }

    async fn list_active_builds(&self, page: Page) -> StoreResult<Vec<Build>> {
        let inner = self.inner.read().await;
        let mut active: Vec<&Build> = inner
            .builds
            .values()
            .filter(|b| !b.is_ended() && !inner.queue.contains(&b.spec))
            .collect();
        active.sort_by(|a, b| a.spec.cmp(&b.spec));
        Ok(active
            .into_iter()
            .skip(page.offset())
            .take(page.per_page as usize)
            .cloned()
            .collect())
    }

    async fn get_repo(&self, uri: &str) -> StoreResult<Repo> {
        self.inner
            .read()
            .await
            .repos
            .get(uri)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("repo {uri}")))
    }

    async fn get_repo_file(&self, rev: &RepoRevSpec, path: &str) -> StoreResult<Vec<u8>> {
        self.inner
            .read()
            .await
            .files
            .get(&(rev.clone(), path.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{rev}:{path}")))
    }

    async fn get_inventory(&self, rev: &RepoRevSpec) -> StoreResult<Inventory> {
        Ok(self
            .inner
            .read()
            .await
            .inventories
            .get(rev)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_upstream_credential(&self, host: &str) -> StoreResult<UpstreamCredential> {
        self.inner
            .read()
            .await
            .credentials
            .get(host)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("credential for {host}")))
    }
}

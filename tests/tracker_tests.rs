
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use build_worker::exec::{StepMonitorFactory, TaskMonitorFactory};
use build_worker::store::{
    Build, BuildSpec, BuildUpdate, Inventory, MemoryStore, NewTask, Page, RecordStore, Repo,
    RepoRevSpec, StoreResult, Task, TaskSpec, TaskStatus, TaskUpdate, UpstreamCredential,
};
use build_worker::tracker::{BuildTracker, LogStore, MemoryLogStore, TaskResult, TrackerError};
use build_worker::worker::HeartbeatSender;
use test_harness::{assert_eventually, build_spec};
use tokio_util::sync::CancellationToken;

async fn setup() -> (Arc<MemoryStore>, MemoryLogStore, BuildTracker) {
    let store = Arc::new(MemoryStore::new());
    let spec = build_spec("c1");
    store.insert_build(Build::new(spec.clone())).await;
    let logs = MemoryLogStore::new();
    let tracker = BuildTracker::new(store.clone(), Arc::new(logs.clone()), spec);
    (store, logs, tracker)
}

#[tokio::test]
async fn test_build_end_flags() {
    let (store, _, tracker) = setup().await;
    tracker.start().await.unwrap();
    tracker.heartbeat().await.unwrap();

    let ok: Result<(), String> = Ok(());
    let build = tracker.end(&ok).await.unwrap();
    assert!(build.success && !build.failure && !build.killed);
    assert!(build.ended_at.is_some());
    assert!(build.started_at.is_some());
    assert!(build.heartbeat_at.is_some());

    let spec = build_spec("c2");
    store.insert_build(Build::new(spec.clone())).await;
    let tracker = BuildTracker::new(store.clone(), Arc::new(MemoryLogStore::new()), spec);
    let failed: Result<(), String> = Err("boom".to_string());
    let build = tracker.end(&failed).await.unwrap();
    assert!(!build.success && build.failure);
    assert!(build.ended_at.is_some());
}

#[tokio::test]
async fn test_unknown_build_update_fails() {
    let store = Arc::new(MemoryStore::new());
    let tracker = BuildTracker::new(store, Arc::new(MemoryLogStore::new()), build_spec("missing"));
    let err = tracker.start().await.unwrap_err();
    assert!(matches!(err, TrackerError::Store(ref e) if e.is_not_found()));
}

#[tokio::test]
async fn test_create_tasks_in_order() {
    let (store, _, tracker) = setup().await;
    let labels = vec!["GO=1.21".to_string(), "GO=1.22".to_string()];
    let handles = tracker.create_tasks(&labels).await.unwrap();

    assert_eq!(handles.len(), 2);
    assert_eq!(handles[0].label(), "GO=1.21");
    assert_eq!(handles[1].label(), "GO=1.22");
    assert_eq!(handles[0].spec().id, 1);
    assert_eq!(handles[1].spec().id, 2);
    assert_eq!(store.tasks(tracker.spec()).await.len(), 2);
}

#[tokio::test]
async fn test_task_lifecycle_closes_log() {
    let (store, logs, tracker) = setup().await;
    let mut task = tracker
        .create_tasks(&["Build".to_string()])
        .await
        .unwrap()
        .remove(0);

    task.start().await.unwrap();
    task.log("compiling").await.unwrap();
    task.end(TaskResult::Success).await.unwrap();

    assert!(task.is_finished());
    assert_eq!(task.status(), TaskStatus::Success);
    assert!(logs.is_closed(task.spec()).await);
    assert_eq!(logs.lines(task.spec()).await, ["compiling"]);

    let record = &store.tasks(tracker.spec()).await[0];
    assert_eq!(record.status, TaskStatus::Success);
    assert!(record.started_at.is_some() && record.ended_at.is_some());
}

#[tokio::test]
async fn test_finished_task_rejects_transitions_without_store_call() {
    let (store, _, tracker) = setup().await;
    let mut task = tracker
        .create_tasks(&["Build".to_string()])
        .await
        .unwrap()
        .remove(0);
    task.skip().await.unwrap();
    let before = store.tasks(tracker.spec()).await[0].clone();

    assert!(matches!(task.start().await, Err(TrackerError::TaskFinished(_))));
    assert!(matches!(
        task.end(TaskResult::Failure).await,
        Err(TrackerError::TaskFinished(_))
    ));
    assert!(matches!(task.log("late").await, Err(TrackerError::TaskFinished(_))));

    let after = &store.tasks(tracker.spec()).await[0];
    assert_eq!(after.status, TaskStatus::Skipped);
    assert_eq!(after.ended_at, before.ended_at);
}

#[tokio::test]
async fn test_warnings_are_sticky() {
    let (store, _, tracker) = setup().await;
    let root = tracker
        .create_tasks(&["Build".to_string()])
        .await
        .unwrap()
        .remove(0);
    let mut sub = root.create_subtask("Build: lint").await.unwrap();
    sub.start().await.unwrap();
    sub.warnings().await.unwrap();
    sub.end(TaskResult::Success).await.unwrap();

    let tasks = store.tasks(tracker.spec()).await;
    let record = tasks.iter().find(|t| t.label == "Build: lint").unwrap();
    assert_eq!(record.parent_id, Some(root.spec().id));
    assert_eq!(record.status, TaskStatus::Success);
    assert!(record.warnings);
}

#[tokio::test]
async fn test_tolerated_failure_ends_with_warnings() {
    let (store, _, tracker) = setup().await;
    let root = tracker
        .create_tasks(&["Build".to_string()])
        .await
        .unwrap()
        .remove(0);
    let mut sub = root.create_subtask("Build: flaky").await.unwrap();
    sub.start().await.unwrap();
    sub.end(TaskResult::Warnings).await.unwrap();

    let record = store.tasks(tracker.spec()).await[1].clone();
    assert_eq!(record.status, TaskStatus::Warnings);
    assert!(record.ended_at.is_some());
    assert!(sub.is_finished());
}

#[tokio::test]
async fn test_subtasks_are_two_levels_deep() {
    let (_, _, tracker) = setup().await;
    let root = tracker
        .create_tasks(&["Build".to_string()])
        .await
        .unwrap()
        .remove(0);
    let sub = root.create_subtask("Build: step").await.unwrap();
    assert!(matches!(
        sub.create_subtask("nested").await,
        Err(TrackerError::TooDeep(_))
    ));
}

#[tokio::test]
async fn test_step_monitors_are_created_from_spawned_tasks() {
    let (store, logs, tracker) = setup().await;
    let root = tracker
        .create_tasks(&["Build".to_string()])
        .await
        .unwrap()
        .remove(0);
    let root_id = root.spec().id;
    let factory: Arc<dyn StepMonitorFactory> =
        Arc::new(TaskMonitorFactory::new(Arc::new(tokio::sync::Mutex::new(root))));

    let mut spawned = Vec::new();
    for key in ["Go build", "Go test"] {
        let factory = factory.clone();
        spawned.push(tokio::spawn(async move {
            let mut monitor = factory.monitor("build", key).await?;
            monitor.start().await?;
            monitor.log("ok").await?;
            monitor.end(true, false).await
        }));
    }
    for handle in spawned {
        handle.await.unwrap().unwrap();
    }

    let tasks = store.tasks(tracker.spec()).await;
    let steps: Vec<_> = tasks.iter().filter(|t| t.parent_id == Some(root_id)).collect();
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|t| t.status == TaskStatus::Success));
    for step in steps {
        assert!(logs.is_closed(&step.spec).await);
    }
}

/// Store that answers batch task creation in reverse order.
struct ReorderingStore {
    inner: MemoryStore,
}

#[async_trait]
impl RecordStore for ReorderingStore {
    async fn dequeue_next_build(&self) -> StoreResult<Build> {
        self.inner.dequeue_next_build().await
    }

    async fn update_build(&self, build: &BuildSpec, update: BuildUpdate) -> StoreResult<Build> {
        self.inner.update_build(build, update).await
    }

    async fn create_tasks(&self, build: &BuildSpec, tasks: Vec<NewTask>) -> StoreResult<Vec<Task>> {
        let mut created = self.inner.create_tasks(build, tasks).await?;
        created.reverse();
        Ok(created)
    }

    async fn update_task(&self, task: &TaskSpec, update: TaskUpdate) -> StoreResult<Task> {
        self.inner.update_task(task, update).await
    }

    async fn list_active_builds(&self, page: Page) -> StoreResult<Vec<Build>> {
        self.inner.list_active_builds(page).await
    }

    async fn get_repo(&self, uri: &str) -> StoreResult<Repo> {
        self.inner.get_repo(uri).await
    }

    async fn get_repo_file(&self, rev: &RepoRevSpec, path: &str) -> StoreResult<Vec<u8>> {
        self.inner.get_repo_file(rev, path).await
    }

    async fn get_inventory(&self, rev: &RepoRevSpec) -> StoreResult<Inventory> {
        self.inner.get_inventory(rev).await
    }

    async fn fetch_upstream_credential(&self, host: &str) -> StoreResult<UpstreamCredential> {
        self.inner.fetch_upstream_credential(host).await
    }
}

#[tokio::test]
async fn test_out_of_order_task_creation_is_detected() {
    let inner = MemoryStore::new();
    let spec = build_spec("c1");
    inner.insert_build(Build::new(spec.clone())).await;
    let store = Arc::new(ReorderingStore { inner });
    let logs: Arc<dyn LogStore> = Arc::new(MemoryLogStore::new());
    let tracker = BuildTracker::new(store, logs, spec);

    let labels = vec!["A=1".to_string(), "A=2".to_string()];
    let err = tracker.create_tasks(&labels).await.unwrap_err();
    match err {
        TrackerError::TaskOrderMismatch {
            index,
            expected,
            got,
        } => {
            assert_eq!(index, 0);
            assert_eq!(expected, "A=1");
            assert_eq!(got, "A=2");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_heartbeats_continue_after_failed_ticks() {
    let store = Arc::new(MemoryStore::new());
    let spec = build_spec("c1");
    let tracker = BuildTracker::new(store.clone(), Arc::new(MemoryLogStore::new()), spec.clone());
    let stop = CancellationToken::new();
    let sender = HeartbeatSender::new(Duration::from_millis(100));
    let handle = tokio::spawn({
        let stop = stop.clone();
        async move { sender.run(tracker, stop).await }
    });

    // The build is unknown to the store for the first ticks.
    tokio::time::sleep(Duration::from_millis(250)).await;
    store.insert_build(Build::new(spec.clone())).await;

    assert_eventually(
        || async { store.build(&spec).await.is_some_and(|b| b.heartbeat_at.is_some()) },
        Duration::from_secs(1),
        "heartbeat never recorded after the store recovered",
    )
    .await;
    stop.cancel();
    handle.await.unwrap();
}

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::exec::{
    ExecError, ExecutionError, ExecutionPayload, Executor, StepMonitorFactory, TaskMonitorFactory,
};
use crate::plan::Axis;
use crate::tracker::{BuildTracker, TaskHandle, TaskResult, TrackerError};

/// Runs every axis of a plan concurrently and aggregates the outcome.
pub struct Orchestrator {
    executor: Arc<dyn Executor>,
}

impl Orchestrator {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }

    /// Persists the plan, creates one root task per axis and executes each
    /// axis on its own tokio task.
    ///
    /// # Errors
    ///
    /// With one axis its execution error is returned as is. With several, an
    /// [`ExecError::Axes`] lists every failing axis. Tracker failures before
    /// execution abort the run.
    pub async fn run(
        &self,
        tracker: &BuildTracker,
        payload: &ExecutionPayload,
        axes: &[Axis],
    ) -> Result<(), ExecError> {
        tracker.set_builder_config(payload.plan.to_yaml()?).await?;

        let axes: Vec<Axis> = if axes.is_empty() {
            vec![Axis::empty()]
        } else {
            axes.to_vec()
        };
        let labels: Vec<String> = axes.iter().map(Axis::label).collect();
        let mut roots = tracker.create_tasks(&labels).await?;
        if let Err(e) = start_all(&mut roots).await {
            abandon(&mut roots).await;
            return Err(e.into());
        }

        let mut running = JoinSet::new();
        for (index, (axis, root)) in axes.iter().zip(roots).enumerate() {
            let executor = self.executor.clone();
            let payload = payload.for_axis(axis);
            let root = Arc::new(Mutex::new(root));
            let monitors: Arc<dyn StepMonitorFactory> =
                Arc::new(TaskMonitorFactory::new(root.clone()));

            running.spawn(async move {
                let result = executor.execute(payload, monitors).await;
                let outcome = match &result {
                    Ok(()) => TaskResult::Success,
                    Err(_) => TaskResult::Failure,
                };
                let mut root = root.lock().await;
                if let Err(e) = root.end(outcome).await {
                    tracing::warn!(task = %root.spec(), error = %e, "Failed to end axis task");
                }
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<(), ExecutionError>>> = vec![None; axes.len()];
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => tracing::error!(build = %tracker.spec(), error = %e, "Axis task aborted"),
            }
        }

        let outcomes = labels.into_iter().zip(results).map(|(label, result)| {
            let result = result
                .unwrap_or_else(|| Err(ExecutionError::new("axis task aborted")));
            (label, result)
        });
        aggregate(outcomes.collect())
    }
}

async fn start_all(roots: &mut [TaskHandle]) -> Result<(), TrackerError> {
    for root in roots {
        root.start().await?;
    }
    Ok(())
}

/// Ends every axis task that never got to run as failed.
async fn abandon(roots: &mut [TaskHandle]) {
    for root in roots.iter_mut().filter(|root| !root.is_finished()) {
        if let Err(e) = root.end(TaskResult::Failure).await {
            tracing::warn!(task = %root.spec(), error = %e, "Failed to end abandoned axis task");
        }
    }
}

fn aggregate(outcomes: Vec<(String, Result<(), ExecutionError>)>) -> Result<(), ExecError> {
    let total = outcomes.len();
    let mut failures: Vec<(String, ExecutionError)> = outcomes
        .into_iter()
        .filter_map(|(label, result)| result.err().map(|e| (label, e)))
        .collect();

    if failures.is_empty() {
        return Ok(());
    }
    if total == 1 {
        if let Some((_, err)) = failures.pop() {
            return Err(err.into());
        }
    }
    let summary = failures
        .iter()
        .map(|(label, err)| format!("{label}: {err}"))
        .collect::<Vec<_>>()
        .join("; ");
    Err(ExecError::Axes {
        failed: failures.len(),
        total,
        summary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(label: &str) -> (String, Result<(), ExecutionError>) {
        (label.to_string(), Ok(()))
    }

    fn failed(label: &str, msg: &str) -> (String, Result<(), ExecutionError>) {
        (label.to_string(), Err(ExecutionError::new(msg)))
    }

    #[test]
    fn single_axis_error_is_verbatim() {
        let err = aggregate(vec![failed("Build", "step go test failed")]).unwrap_err();
        assert!(matches!(err, ExecError::Execution(_)));
        assert_eq!(err.to_string(), "step go test failed");
    }

    #[test]
    fn multiple_axes_are_summarized() {
        let err = aggregate(vec![ok("V=1"), failed("V=2", "boom")]).unwrap_err();
        assert_eq!(err.to_string(), "1/2 failed: V=2: boom");

        let err = aggregate(vec![failed("V=1", "a"), failed("V=2", "b")]).unwrap_err();
        assert_eq!(err.to_string(), "2/2 failed: V=1: a; V=2: b");
    }

    #[test]
    fn all_ok() {
        assert!(aggregate(vec![ok("V=1"), ok("V=2")]).is_ok());
        assert!(aggregate(vec![]).is_ok());
    }
}

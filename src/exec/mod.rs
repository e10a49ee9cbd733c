//! Plan execution: the executor seam, per-step monitors and the
//! per-axis orchestrator.

pub mod monitor;
pub mod orchestrator;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Serialize, Serializer};
use url::Url;

use crate::environment::{Environment, NetrcEntry};
use crate::plan::{Axis, Plan, PlanError};
use crate::store::{Build, BuildSpec};
use crate::tracker::TrackerError;

pub use monitor::{step_label, StepMonitor, StepMonitorFactory, TaskMonitorFactory};
pub use orchestrator::Orchestrator;

/// Failure reported by an [`Executor`] for one axis.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The single axis failed; its error is passed through untouched.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("{failed}/{total} failed: {summary}")]
    Axes {
        failed: usize,
        total: usize,
        summary: String,
    },

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

/// Everything an executor needs to run the plan for one axis.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPayload {
    pub build: BuildSpec,
    pub branch: Option<String>,
    pub commit: String,
    pub clone_url: Url,
    pub link: String,
    pub credential: Option<NetrcEntry>,
    pub callback_url: Url,
    #[serde(serialize_with = "plan_as_yaml")]
    pub plan: Plan,
    pub axis: Axis,
    /// `K=V` entries exported to every step.
    pub env: Vec<String>,
}

impl ExecutionPayload {
    pub fn new(build: &Build, env: Environment, plan: Plan) -> Self {
        Self {
            build: build.spec.clone(),
            branch: build.branch.clone(),
            commit: build.spec.commit_id.clone(),
            clone_url: env.clone_url,
            link: env.link,
            credential: env.credential,
            callback_url: env.callback_url,
            plan,
            axis: Axis::empty(),
            env: Vec::new(),
        }
    }

    /// A copy bound to `axis`, exporting its assignments as environment.
    pub fn for_axis(&self, axis: &Axis) -> Self {
        let mut payload = self.clone();
        payload.axis = axis.clone();
        payload.env.extend(axis.env());
        payload
    }

    /// JSON form handed to out-of-process executors. The plan is embedded
    /// as its YAML descriptor text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

fn plan_as_yaml<S: Serializer>(plan: &Plan, serializer: S) -> Result<S::Ok, S::Error> {
    let yaml = plan.to_yaml().map_err(serde::ser::Error::custom)?;
    serializer.serialize_str(&yaml)
}

/// Runs a compiled plan for one axis, reporting step lifecycle through
/// monitors obtained from `monitors`.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        payload: ExecutionPayload,
        monitors: Arc<dyn StepMonitorFactory>,
    ) -> Result<(), ExecutionError>;
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::flow::{FlowDefinition, FlowModule};
use super::status::FlowStatus;

/// Distinguishes failures of the step's own code from failures of the worker
/// running it. Both are retryable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The step's code failed (raised, returned an error, bad output).
    Script(String),
    /// The worker failed (crash, lost heartbeat, out of memory).
    Worker(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Script(msg) => write!(f, "Script failure: {msg}"),
            FailureKind::Worker(msg) => write!(f, "Worker failure: {msg}"),
        }
    }
}

/// How a step job finished, as reported by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Success,
    /// The module was skipped; the flow moves on.
    Skipped,
    /// A stop condition matched; the flow ends successfully after this module.
    Stopped,
    Failure(FailureKind),
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Success,
    Failure(String),
    Canceled,
}

impl From<&StepOutcome> for JobOutcome {
    fn from(outcome: &StepOutcome) -> Self {
        match outcome {
            StepOutcome::Success | StepOutcome::Skipped | StepOutcome::Stopped => {
                JobOutcome::Success
            }
            StepOutcome::Failure(kind) => JobOutcome::Failure(kind.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Script,
    Preview,
    Flow,
    FlowPreview,
    FlowStep,
}

impl JobKind {
    pub fn is_flow(&self) -> bool {
        matches!(self, JobKind::Flow | JobKind::FlowPreview)
    }
}

/// One execution unit in the queue: a script run, a flow run or a flow step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub workspace_id: String,
    pub kind: JobKind,
    pub parent_job: Option<Uuid>,
    pub root_job: Option<Uuid>,
    /// Static id of the module a step job executes.
    pub module_id: Option<String>,
    /// Identity that triggered the run.
    pub email: String,
    /// Approvals still required before the suspended module may proceed.
    pub suspend: u32,
    pub suspend_until: Option<DateTime<Utc>>,
    pub running: bool,
    pub canceled: bool,
    pub canceled_by: Option<String>,
    pub canceled_reason: Option<String>,
    pub scheduled_for: DateTime<Utc>,
    pub flow_status: Option<FlowStatus>,
    pub raw_flow: Option<FlowDefinition>,
    pub concurrent_limit: Option<u32>,
    pub concurrency_time_window_s: Option<u32>,
    pub same_worker: bool,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// A flow job, not yet started.
    pub fn new_flow(workspace_id: impl Into<String>, email: impl Into<String>, flow: FlowDefinition) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: workspace_id.into(),
            kind: JobKind::Flow,
            parent_job: None,
            root_job: None,
            module_id: None,
            email: email.into(),
            suspend: 0,
            suspend_until: None,
            running: false,
            canceled: false,
            canceled_by: None,
            canceled_reason: None,
            scheduled_for: now,
            flow_status: Some(FlowStatus::new(&flow)),
            same_worker: flow.same_worker,
            raw_flow: Some(flow),
            concurrent_limit: None,
            concurrency_time_window_s: None,
            created_at: now,
        }
    }

    /// A step job executing `module` on behalf of `flow`.
    pub fn new_step(flow: &Job, module: &FlowModule, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workspace_id: flow.workspace_id.clone(),
            kind: JobKind::FlowStep,
            parent_job: Some(flow.id),
            root_job: Some(flow.root_job.unwrap_or(flow.id)),
            module_id: Some(module.id.clone()),
            email: flow.email.clone(),
            suspend: 0,
            suspend_until: None,
            running: false,
            canceled: false,
            canceled_by: None,
            canceled_reason: None,
            scheduled_for,
            flow_status: None,
            raw_flow: None,
            concurrent_limit: module.concurrent_limit,
            concurrency_time_window_s: module.concurrency_time_window_s,
            same_worker: flow.same_worker,
            created_at: Utc::now(),
        }
    }

    pub fn is_flow(&self) -> bool {
        self.kind.is_flow()
    }

    pub fn is_flow_step(&self) -> bool {
        self.kind == JobKind::FlowStep
    }
}

/// Terminal record of a job, retained for history once it leaves the live queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedJob {
    pub id: Uuid,
    pub workspace_id: String,
    pub kind: JobKind,
    pub parent_job: Option<Uuid>,
    pub outcome: JobOutcome,
    pub flow_status: Option<FlowStatus>,
    pub canceled_by: Option<String>,
    pub canceled_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl CompletedJob {
    pub fn from_job(job: &Job, outcome: JobOutcome) -> Self {
        let now = Utc::now();
        let duration = now - job.created_at;
        Self {
            id: job.id,
            workspace_id: job.workspace_id.clone(),
            kind: job.kind,
            parent_job: job.parent_job,
            outcome,
            flow_status: job.flow_status.clone(),
            canceled_by: job.canceled_by.clone(),
            canceled_reason: job.canceled_reason.clone(),
            started_at: job.created_at,
            completed_at: now,
            duration_ms: duration.num_milliseconds(),
        }
    }
}

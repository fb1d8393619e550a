use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::flow::{FlowDefinition, SuspendConfig, TimeoutPolicy};
use super::job::{Job, JobOutcome, StepOutcome};
use super::retry::{self, RetryDecision};
use super::status::{
    Approval, ApprovalConditions, BranchAllStatus, BranchChosen, FlowStatus, LoopIterator,
    ModuleStatus, RetryStatus,
};
use crate::error::{FlowgateError, Result};
use crate::ledger::ResumeRecord;

pub const DEFAULT_SUSPEND_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const MAX_SUSPEND_TIMEOUT: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Loop and branch bookkeeping reported while a module runs. `None` fields
/// leave the recorded value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleProgress {
    pub iterator: Option<LoopIterator>,
    pub flow_jobs: Option<Vec<Uuid>>,
    pub branch_chosen: Option<BranchChosen>,
    pub branchall: Option<BranchAllStatus>,
}

/// Something that happened to a flow or one of its step jobs.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    Start,
    /// A worker picked up the step job.
    JobAccepted { job: Uuid },
    /// The step's code asked to wait for approvals.
    JobSuspended { job: Uuid },
    JobCompleted { job: Uuid, outcome: StepOutcome },
    /// The ledger may hold new resume records for this flow.
    ApprovalsChanged,
    SuspendTimedOut,
    Cancel { by: String, reason: Option<String> },
    Progress { job: Uuid, progress: ModuleProgress },
}

/// One observable state change produced while applying an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Dispatched { module: String, job: Uuid },
    Started { module: String, job: Uuid },
    Suspended { module: String, job: Uuid, remaining: u32 },
    Resumed { module: String, job: Uuid, approvers: usize },
    Retry { module: String, job: Uuid, delay: Duration },
    ModuleFailed { module: String, reason: String },
    Canceled,
    Updated,
    Completed(JobOutcome),
}

/// Side effect to carry out once the new flow state has been committed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Store a new step job and hand it to the queue.
    Insert(Job),
    /// Hand an existing step job back to the queue.
    Dispatch(Uuid),
    /// Move a live step job to the terminal history as canceled.
    Cancel(Uuid),
    /// The step pointer moved.
    Advance,
    /// The flow is finished.
    Terminal(JobOutcome),
}

/// Result of applying one event.
#[derive(Debug, Default, PartialEq)]
pub struct Applied {
    pub transitions: Vec<Transition>,
    pub effects: Vec<Effect>,
}

impl Applied {
    pub fn is_unchanged(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.effects.iter().find_map(|e| match e {
            Effect::Terminal(outcome) => Some(outcome),
            _ => None,
        })
    }
}

/// Drives a flow job's status through module lifecycles.
///
/// `apply` is a pure function of the flow job, the event, the resume records
/// visible for the flow and the clock. It never performs I/O: the caller
/// commits the mutated job and only then carries out `Applied::effects`.
#[derive(Debug, Clone)]
pub struct FlowStateMachine {
    default_suspend_timeout: Duration,
    max_suspend_timeout: Duration,
}

impl Default for FlowStateMachine {
    fn default() -> Self {
        Self {
            default_suspend_timeout: DEFAULT_SUSPEND_TIMEOUT,
            max_suspend_timeout: MAX_SUSPEND_TIMEOUT,
        }
    }
}

impl FlowStateMachine {
    pub fn new(default_suspend_timeout: Duration, max_suspend_timeout: Duration) -> Self {
        Self {
            default_suspend_timeout,
            max_suspend_timeout,
        }
    }

    pub fn apply<R: Rng>(
        &self,
        flow: &mut Job,
        event: FlowEvent,
        approvals: &[ResumeRecord],
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Result<Applied> {
        let (Some(status), Some(def)) = (flow.flow_status.clone(), flow.raw_flow.clone()) else {
            return Err(FlowgateError::NotAFlow(flow.id));
        };

        if flow.canceled {
            tracing::debug!(flow_id = %flow.id, ?event, "Ignoring event on canceled flow");
            return Ok(Applied::default());
        }

        let mut pass = Pass {
            machine: self,
            flow,
            status,
            def,
            now,
            rng,
            applied: Applied::default(),
        };
        pass.handle(event, approvals)?;

        let Pass {
            flow,
            status,
            applied,
            ..
        } = pass;
        flow.flow_status = Some(status);
        Ok(applied)
    }
}

/// Working state of a single `apply` call.
struct Pass<'a, R> {
    machine: &'a FlowStateMachine,
    flow: &'a mut Job,
    status: FlowStatus,
    def: FlowDefinition,
    now: DateTime<Utc>,
    rng: &'a mut R,
    applied: Applied,
}

impl<R: Rng> Pass<'_, R> {
    fn handle(&mut self, event: FlowEvent, approvals: &[ResumeRecord]) -> Result<()> {
        match event {
            FlowEvent::Start => self.start(),
            FlowEvent::JobAccepted { job } => self.accept(job),
            FlowEvent::JobSuspended { job } => self.suspend(job, approvals),
            FlowEvent::JobCompleted { job, outcome } => self.complete(job, outcome),
            FlowEvent::ApprovalsChanged => self.evaluate_approvals(approvals, false),
            FlowEvent::SuspendTimedOut => self.timeout(approvals),
            FlowEvent::Cancel { by, reason } => {
                self.cancel(by, reason);
                Ok(())
            }
            FlowEvent::Progress { job, progress } => self.progress(job, progress),
        }
    }

    fn module_id(&self) -> String {
        self.status.current().id().to_string()
    }

    fn suspend_config(&self) -> Option<SuspendConfig> {
        self.def
            .module_at(self.status.step)
            .and_then(|m| m.suspend.clone())
    }

    /// Whether `job` belongs to a module instance this flow already moved past.
    fn is_stale(&self, job: Uuid) -> bool {
        self.status.retry.failed_jobs.contains(&job)
            || self
                .status
                .modules
                .iter()
                .chain(std::iter::once(&self.status.failure_module.module_status))
                .any(|m| m.is_terminal() && m.job() == Some(job))
    }

    fn unexpected(&self, job: Uuid, what: &str) -> Result<()> {
        if self.is_stale(job) {
            tracing::debug!(flow_id = %self.flow.id, job_id = %job, "Ignoring stale {what}");
            return Ok(());
        }
        Err(FlowgateError::invalid_transition(
            self.status.current().id(),
            format!(
                "{what} for job {job} while module is {}",
                self.status.current().type_name()
            ),
        ))
    }

    fn start(&mut self) -> Result<()> {
        if self.status.step != 0
            || !matches!(self.status.current(), ModuleStatus::WaitingForPriorSteps { .. })
        {
            return Ok(());
        }
        if self.status.modules.is_empty() {
            self.finish(JobOutcome::Success);
            return Ok(());
        }
        tracing::info!(flow_id = %self.flow.id, modules = self.status.modules.len(), "Flow started");
        self.dispatch_current(self.now, Vec::new()).map(|_| ())
    }

    fn dispatch_current(
        &mut self,
        scheduled_for: DateTime<Utc>,
        approvers: Vec<Approval>,
    ) -> Result<Uuid> {
        let Some(module) = self.def.module_at(self.status.step).cloned() else {
            return Err(FlowgateError::invalid_transition(
                self.status.current().id(),
                format!("no module at step {}", self.status.step),
            ));
        };
        let job = Job::new_step(&*self.flow, &module, scheduled_for);
        let job_id = job.id;
        *self.status.current_mut() = ModuleStatus::WaitingForExecutor {
            id: module.id.clone(),
            job: job_id,
            approvers,
        };
        tracing::info!(
            flow_id = %self.flow.id,
            module = %module.id,
            job_id = %job_id,
            "Module dispatched"
        );
        self.applied.transitions.push(Transition::Dispatched {
            module: module.id,
            job: job_id,
        });
        self.applied.effects.push(Effect::Insert(job));
        Ok(job_id)
    }

    fn accept(&mut self, job: Uuid) -> Result<()> {
        match self.status.current().clone() {
            ModuleStatus::WaitingForExecutor {
                id,
                job: current,
                approvers,
            } if current == job => {
                *self.status.current_mut() = ModuleStatus::InProgress {
                    id: id.clone(),
                    job,
                    iterator: None,
                    flow_jobs: None,
                    branch_chosen: None,
                    branchall: None,
                    approvers,
                };
                self.flow.running = true;
                self.applied
                    .transitions
                    .push(Transition::Started { module: id, job });
                Ok(())
            }
            ModuleStatus::InProgress { job: current, .. } if current == job => Ok(()),
            _ => self.unexpected(job, "job acceptance"),
        }
    }

    fn suspend(&mut self, job: Uuid, approvals: &[ResumeRecord]) -> Result<()> {
        match self.status.current() {
            ModuleStatus::InProgress { job: current, .. } if *current == job => {}
            // Redelivered suspend signal.
            ModuleStatus::WaitingForEvents { job: current, .. } if *current == job => {
                return self.evaluate_approvals(approvals, false);
            }
            _ => return self.unexpected(job, "suspend signal"),
        }
        let Some(cfg) = self.suspend_config() else {
            return Err(FlowgateError::invalid_transition(
                self.status.current().id(),
                "module has no suspend configuration",
            ));
        };

        let timeout = cfg
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(self.machine.default_suspend_timeout)
            .min(self.machine.max_suspend_timeout);
        let id = self.module_id();
        *self.status.current_mut() = ModuleStatus::WaitingForEvents {
            id: id.clone(),
            count: cfg.required_events,
            job,
        };
        self.status.approval_conditions = Some(ApprovalConditions::from(&cfg));
        self.flow.running = false;
        self.flow.suspend = cfg.required_events;
        self.flow.suspend_until = Some(after(self.now, timeout));

        tracing::info!(
            flow_id = %self.flow.id,
            module = %id,
            job_id = %job,
            required_events = cfg.required_events,
            timeout_secs = timeout.as_secs(),
            "Module suspended"
        );
        self.applied.transitions.push(Transition::Suspended {
            module: id,
            job,
            remaining: cfg.required_events,
        });
        self.evaluate_approvals(approvals, false)
    }

    /// Count usable resume records toward the suspended module. With `force`
    /// the module resumes with whatever it has.
    fn evaluate_approvals(&mut self, approvals: &[ResumeRecord], force: bool) -> Result<()> {
        let ModuleStatus::WaitingForEvents { id, count, job } = self.status.current().clone() else {
            return Ok(());
        };
        let cfg = self
            .suspend_config()
            .unwrap_or_else(|| SuspendConfig::new(count));

        let flow_id = self.flow.id;
        let consumed = self.status.consumed_flow_level_ids();
        let usable: Vec<&ResumeRecord> = approvals
            .iter()
            .filter(|r| r.flow == flow_id && (r.job == flow_id || r.job == job))
            .filter(|r| !(r.is_flow_level() && consumed.contains(&r.resume_id)))
            .collect();

        if !cfg.continue_on_disapprove
            && let Some(record) = usable.iter().find(|r| !r.approved)
        {
            let reason = format!("disapproved by {}", record.approver_name());
            return self.reject(job, reason);
        }

        let granted: Vec<Approval> = usable
            .iter()
            .take(count as usize)
            .map(|r| Approval {
                resume_id: r.resume_id,
                approver: r.approver_name().to_string(),
                flow_level: r.is_flow_level(),
            })
            .collect();

        let received = granted.len() as u32;
        if received >= count || force {
            self.resume(id, job, granted);
            return Ok(());
        }

        let remaining = count - received;
        if self.flow.suspend != remaining {
            self.flow.suspend = remaining;
            tracing::info!(flow_id = %flow_id, module = %id, remaining, "Approval counted");
            self.applied.transitions.push(Transition::Suspended {
                module: id,
                job,
                remaining,
            });
        }
        Ok(())
    }

    fn resume(&mut self, id: String, job: Uuid, approvers: Vec<Approval>) {
        let count = approvers.len();
        *self.status.current_mut() = ModuleStatus::WaitingForExecutor {
            id: id.clone(),
            job,
            approvers,
        };
        self.status.approval_conditions = None;
        self.flow.suspend = 0;
        self.flow.suspend_until = None;
        tracing::info!(flow_id = %self.flow.id, module = %id, approvers = count, "Module resumed");
        self.applied.transitions.push(Transition::Resumed {
            module: id,
            job,
            approvers: count,
        });
        self.applied.effects.push(Effect::Dispatch(job));
    }

    fn timeout(&mut self, approvals: &[ResumeRecord]) -> Result<()> {
        let ModuleStatus::WaitingForEvents { job, .. } = *self.status.current() else {
            return Ok(());
        };
        if self.flow.suspend_until.is_none_or(|deadline| deadline > self.now) {
            return Ok(());
        }
        let policy = self
            .suspend_config()
            .map(|cfg| cfg.on_timeout)
            .unwrap_or_default();
        tracing::warn!(
            flow_id = %self.flow.id,
            module = %self.module_id(),
            missing = self.flow.suspend,
            ?policy,
            "Suspend timed out"
        );
        match policy {
            TimeoutPolicy::Continue => self.evaluate_approvals(approvals, true),
            TimeoutPolicy::Fail => self.reject(job, "suspend timed out".to_string()),
        }
    }

    /// Fail the suspended module without consulting its retry policy.
    fn reject(&mut self, job: Uuid, reason: String) -> Result<()> {
        self.status.approval_conditions = None;
        self.flow.suspend = 0;
        self.flow.suspend_until = None;
        self.applied.effects.push(Effect::Cancel(job));
        self.fail_current(job, reason, false)
    }

    fn complete(&mut self, job: Uuid, outcome: StepOutcome) -> Result<()> {
        let current = self.status.current().clone();
        match &current {
            ModuleStatus::InProgress { job: j, .. } | ModuleStatus::WaitingForExecutor { job: j, .. }
                if *j == job => {}
            _ => return self.unexpected(job, "completion"),
        }
        self.flow.running = false;

        let (skipped, stop) = match outcome {
            StepOutcome::Success => (false, false),
            StepOutcome::Skipped => (true, false),
            StepOutcome::Stopped => (false, true),
            StepOutcome::Failure(kind) => return self.fail_current(job, kind.to_string(), true),
        };

        let id = current.id().to_string();
        *self.status.current_mut() = ModuleStatus::Success {
            id: id.clone(),
            job,
            flow_jobs: current.flow_jobs().map(<[Uuid]>::to_vec),
            branch_chosen: current.branch_chosen().cloned(),
            approvers: current.approvers().to_vec(),
            skipped,
        };
        self.status.retry = RetryStatus::default();
        tracing::info!(flow_id = %self.flow.id, module = %id, skipped, "Module succeeded");

        if self.status.in_failure_module() {
            let reason = self.failure_reason();
            self.finish(JobOutcome::Failure(reason));
            return Ok(());
        }
        if stop {
            tracing::info!(flow_id = %self.flow.id, module = %id, "Flow stopped early");
            self.finish(JobOutcome::Success);
            return Ok(());
        }

        self.advance()
    }

    /// Move past the current regular module, finishing the flow after the last one.
    fn advance(&mut self) -> Result<()> {
        self.status.step += 1;
        self.applied.effects.push(Effect::Advance);
        if self.status.step < self.status.modules.len() {
            self.dispatch_current(self.now, Vec::new()).map(|_| ())
        } else {
            self.finish(JobOutcome::Success);
            Ok(())
        }
    }

    fn fail_current(&mut self, job: Uuid, reason: String, retryable: bool) -> Result<()> {
        let current = self.status.current().clone();
        let id = current.id().to_string();

        if retryable {
            let policy = self
                .def
                .module_at(self.status.step)
                .and_then(|m| m.retry.as_ref());
            let decision = retry::evaluate_with(policy, self.status.retry.fail_count, &mut *self.rng);
            self.status.retry.fail_count += 1;
            self.status.retry.failed_jobs.push(job);

            if let RetryDecision::RetryAfter(delay) = decision {
                let approvers = current.approvers().to_vec();
                let next = self.dispatch_current(after(self.now, delay), approvers)?;
                tracing::warn!(
                    flow_id = %self.flow.id,
                    module = %id,
                    fail_count = self.status.retry.fail_count,
                    reason = %reason,
                    "Module failed, retrying"
                );
                self.applied.transitions.push(Transition::Retry {
                    module: id,
                    job: next,
                    delay,
                });
                return Ok(());
            }
        }

        let failed_retries = self
            .status
            .retry
            .failed_jobs
            .iter()
            .copied()
            .filter(|j| *j != job)
            .collect();
        *self.status.current_mut() = ModuleStatus::Failure {
            id: id.clone(),
            job,
            flow_jobs: current.flow_jobs().map(<[Uuid]>::to_vec),
            branch_chosen: current.branch_chosen().cloned(),
            failed_retries,
            reason: Some(reason.clone()),
        };
        self.status.retry = RetryStatus::default();
        tracing::error!(flow_id = %self.flow.id, module = %id, reason = %reason, "Module failed");
        self.applied.transitions.push(Transition::ModuleFailed {
            module: id,
            reason: reason.clone(),
        });

        let continue_on_error = retryable
            && !self.status.in_failure_module()
            && self
                .def
                .module_at(self.status.step)
                .is_some_and(|m| m.continue_on_error);
        if continue_on_error {
            tracing::info!(flow_id = %self.flow.id, "Continuing past failed module");
            return self.advance();
        }
        if self.status.in_failure_module() || self.def.failure_module.is_none() {
            self.finish(JobOutcome::Failure(reason));
            return Ok(());
        }
        self.status.step = self.status.modules.len();
        self.applied.effects.push(Effect::Advance);
        self.dispatch_current(self.now, Vec::new()).map(|_| ())
    }

    /// Reason recorded by the last failed regular module.
    fn failure_reason(&self) -> String {
        self.status
            .modules
            .iter()
            .rev()
            .find_map(|m| match m {
                ModuleStatus::Failure { reason, .. } => reason.clone(),
                _ => None,
            })
            .unwrap_or_else(|| "flow failed".to_string())
    }

    fn cancel(&mut self, by: String, reason: Option<String>) {
        let mut canceled_jobs = Vec::new();
        for module in self.status.all_modules_mut() {
            if module.is_active() {
                let job = module.job();
                canceled_jobs.extend(job);
                *module = ModuleStatus::Canceled {
                    id: module.id().to_string(),
                    job,
                };
            }
        }
        tracing::warn!(
            flow_id = %self.flow.id,
            canceled_by = %by,
            active_jobs = canceled_jobs.len(),
            "Flow canceled"
        );
        self.flow.canceled = true;
        self.flow.canceled_by = Some(by);
        self.flow.canceled_reason = reason;
        self.applied
            .effects
            .extend(canceled_jobs.into_iter().map(Effect::Cancel));
        self.applied.transitions.push(Transition::Canceled);
        self.finish(JobOutcome::Canceled);
    }

    fn progress(&mut self, job: Uuid, progress: ModuleProgress) -> Result<()> {
        match self.status.current() {
            ModuleStatus::InProgress { job: current, .. } if *current == job => {}
            _ => return self.unexpected(job, "progress update"),
        }
        let ModuleStatus::InProgress {
            iterator,
            flow_jobs,
            branch_chosen,
            branchall,
            ..
        } = self.status.current_mut()
        else {
            return Ok(());
        };
        if progress.iterator.is_some() {
            *iterator = progress.iterator;
        }
        if progress.flow_jobs.is_some() {
            *flow_jobs = progress.flow_jobs;
        }
        if progress.branch_chosen.is_some() {
            *branch_chosen = progress.branch_chosen;
        }
        if progress.branchall.is_some() {
            *branchall = progress.branchall;
        }
        self.applied.transitions.push(Transition::Updated);
        Ok(())
    }

    fn finish(&mut self, outcome: JobOutcome) {
        self.flow.running = false;
        self.flow.suspend = 0;
        self.flow.suspend_until = None;
        self.status.approval_conditions = None;
        tracing::info!(flow_id = %self.flow.id, ?outcome, "Flow finished");
        self.applied
            .transitions
            .push(Transition::Completed(outcome.clone()));
        self.applied.effects.push(Effect::Terminal(outcome));
    }
}

/// `now + duration`, saturating at the last representable instant.
fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

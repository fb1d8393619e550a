use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{FlowgateError, Result};
use crate::ledger::ApprovalLedger;
use crate::queue::{JobQueue, JobStore};
use crate::state_machine::{
    Applied, CompletedJob, Effect, FlowEvent, FlowStateMachine, FlowStatus, Job, JobOutcome,
    ModuleProgress, StepOutcome,
};

pub const DEFAULT_CAS_MAX_ATTEMPTS: u32 = 16;

/// Feeds job events into the flow state machine under optimistic
/// concurrency and carries out the resulting effects.
///
/// Every mutation of a flow job goes through [`FlowOrchestrator::apply`]:
/// load the versioned row, read the ledger, run the machine, then commit with
/// a compare-and-swap. A conflict reloads and replays the event. Effects run
/// only after a successful commit, so a losing attempt never dispatches.
pub struct FlowOrchestrator {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    ledger: Arc<dyn ApprovalLedger>,
    machine: FlowStateMachine,
    cas_max_attempts: u32,
}

impl FlowOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        ledger: Arc<dyn ApprovalLedger>,
    ) -> Self {
        Self {
            store,
            queue,
            ledger,
            machine: FlowStateMachine::default(),
            cas_max_attempts: DEFAULT_CAS_MAX_ATTEMPTS,
        }
    }

    pub fn with_machine(mut self, machine: FlowStateMachine) -> Self {
        self.machine = machine;
        self
    }

    pub fn with_cas_max_attempts(mut self, attempts: u32) -> Self {
        self.cas_max_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<dyn ApprovalLedger> {
        &self.ledger
    }

    /// Store a new flow job and dispatch its first module.
    pub fn start_flow(&self, flow: Job) -> Result<Uuid> {
        let Some(def) = flow.raw_flow.as_ref() else {
            return Err(FlowgateError::NotAFlow(flow.id));
        };
        def.validate()?;
        let id = flow.id;
        self.store.insert(flow)?;
        self.apply(id, FlowEvent::Start, false)?;
        Ok(id)
    }

    pub fn on_job_accepted(&self, job_id: Uuid) -> Result<Applied> {
        let Some(flow_id) = self.parent_of(job_id)? else {
            return Ok(Applied::default());
        };
        self.apply(flow_id, FlowEvent::JobAccepted { job: job_id }, false)
    }

    pub fn on_job_suspended(&self, job_id: Uuid) -> Result<Applied> {
        let Some(flow_id) = self.parent_of(job_id)? else {
            return Ok(Applied::default());
        };
        self.apply(flow_id, FlowEvent::JobSuspended { job: job_id }, false)
    }

    pub fn on_job_completed(&self, job_id: Uuid, outcome: StepOutcome) -> Result<Applied> {
        let Some(flow_id) = self.parent_of(job_id)? else {
            return Ok(Applied::default());
        };
        let terminal = JobOutcome::from(&outcome);
        let applied = self.apply(
            flow_id,
            FlowEvent::JobCompleted {
                job: job_id,
                outcome,
            },
            false,
        )?;
        self.finish_job(job_id, terminal)?;
        Ok(applied)
    }

    /// Re-evaluate a flow after resume records were banked for it.
    ///
    /// Always commits a version bump on a live flow, even when nothing
    /// changes: a concurrent suspend that read the ledger before the record
    /// landed then fails its compare-and-swap and re-reads.
    pub fn try_resume(&self, flow_id: Uuid) -> Result<Applied> {
        self.apply(flow_id, FlowEvent::ApprovalsChanged, true)
    }

    pub fn handle_timeout(&self, flow_id: Uuid) -> Result<Applied> {
        self.apply(flow_id, FlowEvent::SuspendTimedOut, false)
    }

    /// Time out every flow whose suspend deadline passed. Returns how many
    /// flows changed state.
    pub fn sweep_timeouts(&self, now: DateTime<Utc>) -> usize {
        let mut handled = 0;
        for flow_id in self.store.suspended_before(now) {
            match self.handle_timeout(flow_id) {
                Ok(applied) if !applied.is_unchanged() => handled += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(flow_id = %flow_id, error = %e, "Suspend timeout failed");
                }
            }
        }
        handled
    }

    pub fn cancel_flow(
        &self,
        flow_id: Uuid,
        by: impl Into<String>,
        reason: Option<String>,
    ) -> Result<Applied> {
        self.apply(
            flow_id,
            FlowEvent::Cancel {
                by: by.into(),
                reason,
            },
            false,
        )
    }

    pub fn record_progress(&self, job_id: Uuid, progress: ModuleProgress) -> Result<Applied> {
        let Some(flow_id) = self.parent_of(job_id)? else {
            return Ok(Applied::default());
        };
        self.apply(flow_id, FlowEvent::Progress { job: job_id, progress }, false)
    }

    /// Status of a live or finished flow.
    pub fn flow_status(&self, flow_id: Uuid) -> Result<FlowStatus> {
        let status = match self.store.get(flow_id) {
            Ok(row) => row.value.flow_status,
            Err(FlowgateError::JobNotFound(_)) => self
                .store
                .completed(flow_id)
                .ok_or(FlowgateError::JobNotFound(flow_id))?
                .flow_status,
            Err(e) => return Err(e),
        };
        status.ok_or(FlowgateError::NotAFlow(flow_id))
    }

    /// Parent flow of a live step job. `None` when the step already left the
    /// live queue, which makes redelivered events harmless.
    fn parent_of(&self, job_id: Uuid) -> Result<Option<Uuid>> {
        match self.store.get(job_id) {
            Ok(row) => row
                .value
                .parent_job
                .map(Some)
                .ok_or(FlowgateError::NoParentFlow(job_id)),
            Err(FlowgateError::JobNotFound(_)) if self.store.completed(job_id).is_some() => {
                tracing::debug!(job_id = %job_id, "Event for finished job ignored");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn apply(&self, flow_id: Uuid, event: FlowEvent, touch: bool) -> Result<Applied> {
        for attempt in 1..=self.cas_max_attempts {
            let row = match self.store.get(flow_id) {
                Ok(row) => row,
                Err(FlowgateError::JobNotFound(_)) if self.store.completed(flow_id).is_some() => {
                    tracing::debug!(flow_id = %flow_id, ?event, "Flow already finished");
                    return Ok(Applied::default());
                }
                Err(e) => return Err(e),
            };
            let mut flow = row.value;
            let step_job = flow
                .flow_status
                .as_ref()
                .and_then(|s| s.current().job())
                .unwrap_or(flow_id);
            let approvals = self.ledger.approvals_for(flow_id, step_job);
            let applied = self.machine.apply(
                &mut flow,
                event.clone(),
                &approvals,
                Utc::now(),
                &mut rand::thread_rng(),
            )?;

            let committed = match applied.outcome().cloned() {
                Some(outcome) => {
                    let record = CompletedJob::from_job(&flow, outcome);
                    self.store.finish(flow_id, row.version, record)
                }
                None if applied.is_unchanged() && !touch => return Ok(applied),
                None => self.store.compare_and_swap(flow, row.version).map(|_| ()),
            };
            match committed {
                Ok(()) => {
                    self.run_effects(flow_id, &applied)?;
                    return Ok(applied);
                }
                // A concurrent finish removed the row; the reload reports it.
                Err(e) if e.is_conflict() || matches!(e, FlowgateError::JobNotFound(_)) => {
                    tracing::debug!(flow_id = %flow_id, attempt, "Flow changed concurrently, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        tracing::error!(flow_id = %flow_id, attempts = self.cas_max_attempts, "Flow update did not settle");
        Err(FlowgateError::Conflict {
            flow_id,
            attempts: self.cas_max_attempts,
        })
    }

    fn run_effects(&self, flow_id: Uuid, applied: &Applied) -> Result<()> {
        for effect in &applied.effects {
            match effect {
                Effect::Insert(job) => {
                    self.store.insert(job.clone())?;
                    if self.is_finished(flow_id) {
                        self.finish_job(job.id, JobOutcome::Canceled)?;
                        continue;
                    }
                    self.queue.dispatch(job)?;
                }
                Effect::Dispatch(job_id) => match self.store.get(*job_id) {
                    Ok(row) => self.queue.dispatch(&row.value)?,
                    Err(FlowgateError::JobNotFound(_)) => {
                        tracing::debug!(job_id = %job_id, "Resumed job already finished");
                    }
                    Err(e) => return Err(e),
                },
                Effect::Cancel(job_id) => self.finish_job(*job_id, JobOutcome::Canceled)?,
                Effect::Advance => self.queue.advance(flow_id)?,
                Effect::Terminal(outcome) => self.queue.mark_terminal(flow_id, outcome)?,
            }
        }
        Ok(())
    }

    fn is_finished(&self, flow_id: Uuid) -> bool {
        matches!(self.store.get(flow_id), Err(FlowgateError::JobNotFound(_)))
    }

    /// Move a step job to the terminal history. Already finished jobs are left alone.
    fn finish_job(&self, job_id: Uuid, outcome: JobOutcome) -> Result<()> {
        for _ in 0..self.cas_max_attempts {
            let row = match self.store.get(job_id) {
                Ok(row) => row,
                Err(FlowgateError::JobNotFound(_)) => return Ok(()),
                Err(e) => return Err(e),
            };
            let mut job = row.value;
            job.running = false;
            if outcome == JobOutcome::Canceled {
                job.canceled = true;
            }
            match self
                .store
                .finish(job_id, row.version, CompletedJob::from_job(&job, outcome.clone()))
            {
                Ok(()) => return self.queue.mark_terminal(job_id, &outcome),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FlowgateError::Conflict {
            flow_id: job_id,
            attempts: self.cas_max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{BankRequest, MemoryLedger};
    use crate::queue::{MemoryJobStore, QueueCall, RecordingQueue};
    use crate::state_machine::{
        FailureKind, FlowDefinition, FlowModule, ModuleStatus, RetryPolicy, SuspendConfig,
        TimeoutPolicy,
    };
    use serde_json::json;

    struct Fixture {
        orch: FlowOrchestrator,
        store: Arc<MemoryJobStore>,
        queue: Arc<RecordingQueue>,
        ledger: Arc<MemoryLedger>,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryJobStore::new());
            let queue = Arc::new(RecordingQueue::new());
            let ledger = Arc::new(MemoryLedger::new());
            let orch = FlowOrchestrator::new(store.clone(), queue.clone(), ledger.clone());
            Self {
                orch,
                store,
                queue,
                ledger,
            }
        }

        fn start(&self, def: FlowDefinition) -> Uuid {
            self.orch
                .start_flow(Job::new_flow("acme", "owner@acme.test", def))
                .unwrap()
        }

        fn module(&self, flow: Uuid, index: usize) -> ModuleStatus {
            self.orch.flow_status(flow).unwrap().modules[index].clone()
        }

        /// Take the next dispatched job, accept it and report `outcome`.
        fn work(&self, outcome: StepOutcome) -> Uuid {
            let job = self.queue.take_dispatched().unwrap();
            self.orch.on_job_accepted(job).unwrap();
            self.orch.on_job_completed(job, outcome).unwrap();
            job
        }

        /// Take the next dispatched job, accept it and suspend it.
        fn suspend_next(&self) -> Uuid {
            let job = self.queue.take_dispatched().unwrap();
            self.orch.on_job_accepted(job).unwrap();
            self.orch.on_job_suspended(job).unwrap();
            job
        }

        fn bank(&self, flow: Uuid, target: Uuid, approver: &str, approved: bool) -> u32 {
            let resume_id = self.ledger.next_resume_id(target);
            self.ledger.bank(BankRequest {
                flow,
                target,
                resume_id,
                approver: Some(approver.to_string()),
                value: json!({"approver": approver}),
                approved,
            });
            resume_id
        }
    }

    fn abc(required_events: u32) -> FlowDefinition {
        FlowDefinition::new(vec![
            FlowModule::new("a"),
            FlowModule::new("b").with_suspend(SuspendConfig::new(required_events)),
            FlowModule::new("c"),
        ])
    }

    #[test]
    fn pre_banked_approval_is_never_observed_waiting() {
        let fx = Fixture::new();
        let flow = fx.start(abc(1));

        // Approve the flow before `a` has even been picked up.
        fx.bank(flow, flow, "alice", true);
        fx.orch.try_resume(flow).unwrap();

        fx.work(StepOutcome::Success);
        let b = fx.suspend_next();
        assert!(matches!(
            fx.module(flow, 1),
            ModuleStatus::WaitingForExecutor { .. }
        ));
        assert_eq!(fx.queue.dispatch_count(b), 2);

        assert_eq!(fx.work(StepOutcome::Success), b);
        fx.work(StepOutcome::Success);

        assert_eq!(fx.queue.outcome_of(flow), Some(JobOutcome::Success));
        let status = fx.orch.flow_status(flow).unwrap();
        let approvers = status.modules[1].approvers();
        assert_eq!(approvers.len(), 1);
        assert!(approvers[0].flow_level);
    }

    #[test]
    fn resume_after_suspend() {
        let fx = Fixture::new();
        let flow = fx.start(abc(1));
        fx.work(StepOutcome::Success);
        let b = fx.suspend_next();
        assert!(matches!(fx.module(flow, 1), ModuleStatus::WaitingForEvents { .. }));
        assert_eq!(fx.store.get(flow).unwrap().value.suspend, 1);

        fx.bank(flow, b, "bob", true);
        let applied = fx.orch.try_resume(flow).unwrap();
        assert!(applied.effects.contains(&Effect::Dispatch(b)));

        fx.work(StepOutcome::Success);
        fx.work(StepOutcome::Success);
        assert_eq!(fx.queue.outcome_of(flow), Some(JobOutcome::Success));
    }

    #[test]
    fn threshold_and_replay() {
        let fx = Fixture::new();
        let flow = fx.start(abc(2));
        fx.work(StepOutcome::Success);
        let b = fx.suspend_next();

        let request = BankRequest {
            flow,
            target: b,
            resume_id: 0,
            approver: Some("alice".into()),
            value: json!(null),
            approved: true,
        };
        fx.ledger.bank(request.clone());
        fx.orch.try_resume(flow).unwrap();
        fx.ledger.bank(request);
        fx.orch.try_resume(flow).unwrap();

        assert_eq!(fx.ledger.len(), 1);
        assert_eq!(fx.store.get(flow).unwrap().value.suspend, 1);
        assert!(matches!(fx.module(flow, 1), ModuleStatus::WaitingForEvents { .. }));

        fx.bank(flow, b, "bob", true);
        fx.orch.try_resume(flow).unwrap();
        assert!(matches!(
            fx.module(flow, 1),
            ModuleStatus::WaitingForExecutor { .. }
        ));
    }

    #[test]
    fn sweep_times_out_suspended_flows() {
        let fx = Fixture::new();
        let def = FlowDefinition::new(vec![
            FlowModule::new("a")
                .with_suspend(SuspendConfig::new(1).with_timeout(0, TimeoutPolicy::Continue)),
            FlowModule::new("b")
                .with_suspend(SuspendConfig::new(1).with_timeout(0, TimeoutPolicy::Fail)),
        ]);
        let flow = fx.start(def);

        fx.suspend_next();
        assert_eq!(fx.orch.sweep_timeouts(Utc::now()), 1);
        assert!(matches!(
            fx.module(flow, 0),
            ModuleStatus::WaitingForExecutor { .. }
        ));

        fx.work(StepOutcome::Success);
        let b = fx.suspend_next();
        assert_eq!(fx.orch.sweep_timeouts(Utc::now()), 1);
        assert_eq!(
            fx.queue.outcome_of(flow),
            Some(JobOutcome::Failure("suspend timed out".into()))
        );
        assert_eq!(fx.queue.outcome_of(b), Some(JobOutcome::Canceled));
        assert_eq!(fx.orch.sweep_timeouts(Utc::now()), 0);
    }

    #[test]
    fn exhausted_retries_fail_through_failure_module() {
        let fx = Fixture::new();
        let def = FlowDefinition::new(vec![FlowModule::new("a").with_retry(
            RetryPolicy::Constant {
                attempts: 1,
                seconds: 0,
            },
        )])
        .with_failure_module(FlowModule::new("notify"));
        let flow = fx.start(def);

        let first = fx.work(StepOutcome::Failure(FailureKind::Script("boom".into())));
        fx.work(StepOutcome::Failure(FailureKind::Script("boom".into())));
        assert_eq!(
            fx.queue.outcome_of(first),
            Some(JobOutcome::Failure("Script failure: boom".into()))
        );
        assert!(fx.queue.outcome_of(flow).is_none());

        fx.work(StepOutcome::Success);
        assert_eq!(
            fx.queue.outcome_of(flow),
            Some(JobOutcome::Failure("Script failure: boom".into()))
        );
        let record = fx.store.completed(flow).unwrap();
        let status = record.flow_status.unwrap();
        assert!(matches!(
            status.failure_module.module_status,
            ModuleStatus::Success { .. }
        ));
    }

    #[test]
    fn resume_after_cancel_is_harmless() {
        let fx = Fixture::new();
        let flow = fx.start(abc(1));
        fx.work(StepOutcome::Success);
        let b = fx.suspend_next();

        fx.orch.cancel_flow(flow, "admin", None).unwrap();
        fx.orch.cancel_flow(flow, "admin", None).unwrap();

        fx.bank(flow, b, "alice", true);
        let applied = fx.orch.try_resume(flow).unwrap();
        assert!(applied.is_unchanged());
        assert_eq!(fx.ledger.len(), 1);

        // A late report from the canceled step changes nothing.
        fx.orch.on_job_completed(b, StepOutcome::Success).unwrap();

        let terminal: Vec<_> = fx
            .queue
            .calls()
            .into_iter()
            .filter(|c| matches!(c, QueueCall::Terminal(id, _) if *id == flow))
            .collect();
        assert_eq!(terminal, vec![QueueCall::Terminal(flow, JobOutcome::Canceled)]);
        assert!(fx.store.completed(b).unwrap().outcome == JobOutcome::Canceled);
    }

    #[test]
    fn cancel_racing_resume_finishes_once() {
        for _ in 0..20 {
            let fx = Fixture::new();
            let flow = fx.start(abc(1));
            fx.work(StepOutcome::Success);
            let b = fx.suspend_next();

            std::thread::scope(|s| {
                s.spawn(|| fx.orch.cancel_flow(flow, "admin", None).unwrap());
                s.spawn(|| {
                    fx.bank(flow, b, "alice", true);
                    fx.orch.try_resume(flow).unwrap();
                });
            });

            let terminal = fx
                .queue
                .calls()
                .into_iter()
                .filter(|c| matches!(c, QueueCall::Terminal(id, _) if *id == flow))
                .count();
            assert_eq!(terminal, 1);
            assert_eq!(fx.queue.outcome_of(flow), Some(JobOutcome::Canceled));
        }
    }

    #[test]
    fn concurrent_approvals_resume_exactly_once() {
        let fx = Fixture::new();
        let flow = fx.start(abc(4));
        fx.work(StepOutcome::Success);
        let b = fx.suspend_next();

        std::thread::scope(|s| {
            for resume_id in 0..4u32 {
                let fx = &fx;
                s.spawn(move || {
                    fx.ledger.bank(BankRequest {
                        flow,
                        target: b,
                        resume_id,
                        approver: Some(format!("user{resume_id}")),
                        value: json!(null),
                        approved: true,
                    });
                    fx.orch.try_resume(flow).unwrap();
                });
            }
        });

        assert_eq!(fx.queue.dispatch_count(b), 2);
        match fx.module(flow, 1) {
            ModuleStatus::WaitingForExecutor { approvers, .. } => assert_eq!(approvers.len(), 4),
            other => panic!("expected WaitingForExecutor, got {other:?}"),
        }
    }

    #[test]
    fn suspend_racing_flow_level_approval_is_not_lost() {
        for _ in 0..20 {
            let fx = Fixture::new();
            let flow = fx.start(abc(1));
            fx.work(StepOutcome::Success);
            let b = fx.queue.take_dispatched().unwrap();
            fx.orch.on_job_accepted(b).unwrap();

            std::thread::scope(|s| {
                s.spawn(|| fx.orch.on_job_suspended(b).unwrap());
                s.spawn(|| {
                    fx.bank(flow, flow, "alice", true);
                    fx.orch.try_resume(flow).unwrap();
                });
            });

            assert!(matches!(
                fx.module(flow, 1),
                ModuleStatus::WaitingForExecutor { .. }
            ));
        }
    }

    #[test]
    fn progress_is_recorded_on_running_module() {
        let fx = Fixture::new();
        let flow = fx.start(abc(1));
        let job = fx.queue.take_dispatched().unwrap();
        fx.orch.on_job_accepted(job).unwrap();
        let child = Uuid::new_v4();
        fx.orch
            .record_progress(
                job,
                ModuleProgress {
                    flow_jobs: Some(vec![child]),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(fx.module(flow, 0).flow_jobs(), Some(&[child][..]));
    }

    #[test]
    fn invalid_flow_is_rejected_on_start() {
        let fx = Fixture::new();
        let def = FlowDefinition::new(vec![FlowModule::new("a").with_retry(
            RetryPolicy::Exponential {
                attempts: 3,
                multiplier: 2.0,
                seconds: 0,
                random_factor: 0.0,
            },
        )]);
        let err = fx
            .orch
            .start_flow(Job::new_flow("acme", "owner@acme.test", def))
            .unwrap_err();
        assert!(matches!(err, FlowgateError::InvalidRetry { .. }));
        assert_eq!(fx.store.live_count(), 0);
    }
}

//! Collaborators around the flow state machine: the queue that runs jobs and
//! the store that persists them.
//!
//! Flow jobs are mutated only through [`JobStore::compare_and_swap`] and
//! [`JobStore::finish`], both of which reject stale versions. Two workers
//! therefore never both advance the same flow from the same snapshot.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{FlowgateError, Result};
use crate::state_machine::{CompletedJob, Job, JobOutcome};

/// The scheduling substrate. Called after state is committed, never before.
pub trait JobQueue: Send + Sync {
    /// The step pointer of `flow_job` moved.
    fn advance(&self, flow_job: Uuid) -> Result<()>;

    /// Make `job` runnable at its `scheduled_for` time.
    fn dispatch(&self, job: &Job) -> Result<()>;

    fn mark_terminal(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<()>;
}

/// A row together with its optimistic-concurrency token.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

pub trait JobStore: Send + Sync {
    fn insert(&self, job: Job) -> Result<()>;

    /// Current live row. `JobNotFound` once the job has finished.
    fn get(&self, id: Uuid) -> Result<Versioned<Job>>;

    /// Replace the row if its version is still `expected`; returns the new version.
    fn compare_and_swap(&self, job: Job, expected: u64) -> Result<u64>;

    /// Atomically check `expected` and move the job to the terminal history.
    fn finish(&self, id: Uuid, expected: u64, record: CompletedJob) -> Result<()>;

    fn completed(&self, id: Uuid) -> Option<CompletedJob>;

    /// Live flow jobs whose suspend deadline is at or before `now`.
    fn suspended_before(&self, now: DateTime<Utc>) -> Vec<Uuid>;
}

#[derive(Debug, Default)]
struct Rows {
    live: HashMap<Uuid, Versioned<Job>>,
    completed: HashMap<Uuid, CompletedJob>,
}

/// In-memory [`JobStore`].
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    rows: Mutex<Rows>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_count(&self) -> usize {
        self.rows.lock().live.len()
    }
}

fn check_version(job_id: Uuid, expected: u64, row: Option<&Versioned<Job>>) -> Result<()> {
    match row {
        None => Err(FlowgateError::JobNotFound(job_id)),
        Some(row) if row.version != expected => Err(FlowgateError::VersionMismatch {
            job_id,
            expected,
            found: row.version,
        }),
        Some(_) => Ok(()),
    }
}

impl JobStore for MemoryJobStore {
    fn insert(&self, job: Job) -> Result<()> {
        let mut rows = self.rows.lock();
        if let Some(existing) = rows.live.get(&job.id) {
            return Err(FlowgateError::VersionMismatch {
                job_id: job.id,
                expected: 0,
                found: existing.version,
            });
        }
        rows.live.insert(job.id, Versioned { version: 1, value: job });
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Versioned<Job>> {
        self.rows
            .lock()
            .live
            .get(&id)
            .cloned()
            .ok_or(FlowgateError::JobNotFound(id))
    }

    fn compare_and_swap(&self, job: Job, expected: u64) -> Result<u64> {
        let mut rows = self.rows.lock();
        check_version(job.id, expected, rows.live.get(&job.id))?;
        let version = expected + 1;
        rows.live.insert(job.id, Versioned { version, value: job });
        Ok(version)
    }

    fn finish(&self, id: Uuid, expected: u64, record: CompletedJob) -> Result<()> {
        let mut rows = self.rows.lock();
        check_version(id, expected, rows.live.get(&id))?;
        rows.live.remove(&id);
        rows.completed.insert(id, record);
        Ok(())
    }

    fn completed(&self, id: Uuid) -> Option<CompletedJob> {
        self.rows.lock().completed.get(&id).cloned()
    }

    fn suspended_before(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        self.rows
            .lock()
            .live
            .values()
            .filter(|row| {
                let job = &row.value;
                job.is_flow() && !job.canceled && job.suspend_until.is_some_and(|t| t <= now)
            })
            .map(|row| row.value.id)
            .collect()
    }
}

/// One call made to a [`RecordingQueue`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueueCall {
    Advance(Uuid),
    Dispatch(Uuid),
    Terminal(Uuid, JobOutcome),
}

/// [`JobQueue`] that records every call and keeps dispatched jobs in a FIFO
/// for a simulated worker to pick up.
#[derive(Debug, Default)]
pub struct RecordingQueue {
    calls: Mutex<Vec<QueueCall>>,
    pending: Mutex<VecDeque<Uuid>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<QueueCall> {
        self.calls.lock().clone()
    }

    /// Next dispatched job not yet taken by a worker.
    pub fn take_dispatched(&self) -> Option<Uuid> {
        self.pending.lock().pop_front()
    }

    pub fn outcome_of(&self, job_id: Uuid) -> Option<JobOutcome> {
        self.calls.lock().iter().find_map(|call| match call {
            QueueCall::Terminal(id, outcome) if *id == job_id => Some(outcome.clone()),
            _ => None,
        })
    }

    pub fn dispatch_count(&self, job_id: Uuid) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, QueueCall::Dispatch(id) if *id == job_id))
            .count()
    }
}

impl JobQueue for RecordingQueue {
    fn advance(&self, flow_job: Uuid) -> Result<()> {
        self.calls.lock().push(QueueCall::Advance(flow_job));
        Ok(())
    }

    fn dispatch(&self, job: &Job) -> Result<()> {
        self.calls.lock().push(QueueCall::Dispatch(job.id));
        self.pending.lock().push_back(job.id);
        Ok(())
    }

    fn mark_terminal(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<()> {
        self.calls
            .lock()
            .push(QueueCall::Terminal(job_id, outcome.clone()));
        Ok(())
    }
}

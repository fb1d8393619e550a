//! Append-only ledger of resume records.
//!
//! Every resume action lands here exactly once, whether or not the step it
//! is meant for has been reached. A record targets either a specific step job
//! or the owning flow job itself (a flow-level pre-approval that any later
//! suspend step of that flow may consume).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One banked or consumed approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub id: Uuid,
    /// The step job, or the flow job for flow-level approvals.
    pub job: Uuid,
    /// Always the owning flow job.
    pub flow: Uuid,
    pub resume_id: u32,
    pub value: serde_json::Value,
    pub approver: Option<String>,
    /// `false` for records created through the cancel link.
    pub approved: bool,
    pub created_at: DateTime<Utc>,
}

impl ResumeRecord {
    pub fn is_flow_level(&self) -> bool {
        self.job == self.flow
    }

    pub fn approver_name(&self) -> &str {
        self.approver.as_deref().unwrap_or("anonymous")
    }
}

/// What a bank call did. Both outcomes are successes for the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BankOutcome {
    Recorded,
    AlreadyPresent,
}

/// Parameters of a single bank call.
#[derive(Debug, Clone)]
pub struct BankRequest {
    pub flow: Uuid,
    pub target: Uuid,
    pub resume_id: u32,
    pub approver: Option<String>,
    pub value: serde_json::Value,
    pub approved: bool,
}

/// Storage for resume records.
///
/// Writes may race freely; uniqueness of `(target, resume_id)` makes
/// redelivery of the same resume request a no-op.
pub trait ApprovalLedger: Send + Sync {
    fn bank(&self, request: BankRequest) -> BankOutcome;

    /// Records of `flow` that target either the flow itself or `step_job`,
    /// ordered by resume id (flow-level records first on ties).
    fn approvals_for(&self, flow: Uuid, step_job: Uuid) -> Vec<ResumeRecord>;

    /// Records that target exactly `job`.
    fn records_for_job(&self, job: Uuid) -> Vec<ResumeRecord>;

    /// Next unused resume id for `target`, starting at 0.
    fn next_resume_id(&self, target: Uuid) -> u32;
}

/// In-memory ledger keyed by `(target job, resume id)`.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: RwLock<BTreeMap<(Uuid, u32), ResumeRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

impl ApprovalLedger for MemoryLedger {
    fn bank(&self, request: BankRequest) -> BankOutcome {
        let key = (request.target, request.resume_id);
        let mut records = self.records.write();
        if records.contains_key(&key) {
            tracing::debug!(
                flow_id = %request.flow,
                target = %request.target,
                resume_id = request.resume_id,
                "Resume record already present"
            );
            return BankOutcome::AlreadyPresent;
        }

        let record = ResumeRecord {
            id: Uuid::new_v4(),
            job: request.target,
            flow: request.flow,
            resume_id: request.resume_id,
            value: request.value,
            approver: request.approver,
            approved: request.approved,
            created_at: Utc::now(),
        };
        tracing::info!(
            flow_id = %record.flow,
            target = %record.job,
            resume_id = record.resume_id,
            approver = %record.approver_name(),
            approved = record.approved,
            flow_level = record.is_flow_level(),
            "Resume record banked"
        );
        records.insert(key, record);
        BankOutcome::Recorded
    }

    fn approvals_for(&self, flow: Uuid, step_job: Uuid) -> Vec<ResumeRecord> {
        let mut matched: Vec<ResumeRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.flow == flow && (r.job == flow || r.job == step_job))
            .cloned()
            .collect();
        matched.sort_by_key(|r| (r.resume_id, !r.is_flow_level(), r.created_at));
        matched
    }

    fn records_for_job(&self, job: Uuid) -> Vec<ResumeRecord> {
        self.records
            .read()
            .range((job, 0)..=(job, u32::MAX))
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn next_resume_id(&self, target: Uuid) -> u32 {
        self.records
            .read()
            .range((target, 0)..=(target, u32::MAX))
            .next_back()
            .map(|((_, id), _)| id.saturating_add(1))
            .unwrap_or(0)
    }
}

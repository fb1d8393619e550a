//! External resume surface: signed links, the resume/cancel action and the
//! approval page view.
//!
//! A resume action is accepted as soon as its signature verifies and its
//! record is banked; whether the targeted module has been reached yet is
//! invisible to the caller. Responses have the same shape for step-level and
//! flow-level targets.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{FlowgateError, Result};
use crate::ledger::{BankOutcome, BankRequest};
use crate::orchestrator::FlowOrchestrator;
use crate::signature::SignatureService;
use crate::state_machine::{ApprovalConditions, Job, ModuleStatus};

/// Links handed to approvers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeUrls {
    pub resume: String,
    pub cancel: String,
    #[serde(rename = "approvalPage")]
    pub approval_page: String,
}

/// Caller identity, when the resume request came with a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthedUser {
    pub username: String,
    pub email: String,
    pub is_admin: bool,
    pub groups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResumeRequest {
    pub workspace_id: String,
    pub job_id: Uuid,
    pub resume_id: u32,
    pub signature: String,
    pub payload: serde_json::Value,
    pub approver: Option<String>,
    /// `false` for the cancel link.
    pub approved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeOutcome {
    pub outcome: BankOutcome,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApproverEntry {
    pub resume_id: u32,
    pub approver: String,
    pub approved: bool,
}

/// What the approval page shows before the approver acts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedJobView {
    pub approvers: Vec<ApproverEntry>,
    pub resume_form: Option<serde_json::Value>,
    pub approval_conditions: Option<ApprovalConditions>,
    /// A record for this exact link already exists.
    pub already_submitted: bool,
}

/// The flow a resume target belongs to.
struct Target {
    flow_id: Uuid,
    is_step: bool,
    /// The flow job, while it is still live.
    live_flow: Option<Job>,
}

/// Builds `{resume, cancel, approvalPage}` links under a base URL.
#[derive(Debug, Clone)]
pub struct ResumeLinks {
    base_url: Url,
}

impl ResumeLinks {
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = Url::parse(base_url)
            .map_err(|e| FlowgateError::Config(format!("invalid base_url '{base_url}': {e}")))?;
        if parsed.cannot_be_a_base() {
            return Err(FlowgateError::Config(format!(
                "base_url '{base_url}' cannot carry a path"
            )));
        }
        Ok(Self { base_url: parsed })
    }

    /// Links for an already-signed `(job_id, resume_id)`.
    pub fn urls(
        &self,
        workspace_id: &str,
        job_id: Uuid,
        resume_id: u32,
        signature: &str,
        approver: Option<&str>,
    ) -> Result<ResumeUrls> {
        let job = job_id.to_string();
        let rid = resume_id.to_string();
        let link = |action: &str| {
            self.link(
                &[
                    "api",
                    "w",
                    workspace_id,
                    "jobs_u",
                    action,
                    job.as_str(),
                    rid.as_str(),
                    signature,
                ],
                approver,
            )
        };
        Ok(ResumeUrls {
            resume: link("resume")?,
            cancel: link("cancel")?,
            approval_page: self.link(
                &["approve", workspace_id, job.as_str(), rid.as_str(), signature],
                approver,
            )?,
        })
    }

    fn link(&self, segments: &[&str], approver: Option<&str>) -> Result<String> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FlowgateError::Config("base_url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        if let Some(approver) = approver.filter(|a| !a.is_empty()) {
            url.query_pairs_mut().append_pair("approver", approver);
        }
        Ok(url.into())
    }
}

pub struct ResumeService {
    signatures: Arc<SignatureService>,
    orchestrator: Arc<FlowOrchestrator>,
    links: ResumeLinks,
}

impl ResumeService {
    pub fn new(
        signatures: Arc<SignatureService>,
        orchestrator: Arc<FlowOrchestrator>,
        base_url: &str,
    ) -> Result<Self> {
        Ok(Self {
            signatures,
            orchestrator,
            links: ResumeLinks::new(base_url)?,
        })
    }

    /// Signature for a resume link, for trusted internal callers.
    pub fn job_signature(
        &self,
        workspace_id: &str,
        job_id: Uuid,
        resume_id: u32,
        approver: Option<&str>,
    ) -> String {
        self.signatures
            .sign(workspace_id, job_id, resume_id, approver)
    }

    /// Mint `{resume, cancel, approvalPage}` links for `job_id`.
    ///
    /// With `flow_level` the links target the owning flow job, so they can be
    /// used before the suspending step is reached. Without a `resume_id` the
    /// next unused id of the target is taken.
    pub fn resume_urls(
        &self,
        workspace_id: &str,
        job_id: Uuid,
        resume_id: Option<u32>,
        approver: Option<&str>,
        flow_level: bool,
    ) -> Result<ResumeUrls> {
        let target = self.locate(workspace_id, job_id)?;
        let job_id = if flow_level { target.flow_id } else { job_id };
        let resume_id =
            resume_id.unwrap_or_else(|| self.orchestrator.ledger().next_resume_id(job_id));
        let signature = self.job_signature(workspace_id, job_id, resume_id, approver);
        self.links
            .urls(workspace_id, job_id, resume_id, &signature, approver)
    }

    /// Verify, check approval conditions, bank the record and let the flow react.
    pub fn resume(&self, request: ResumeRequest, user: Option<&AuthedUser>) -> Result<ResumeOutcome> {
        self.verify(
            &request.workspace_id,
            request.job_id,
            request.resume_id,
            request.approver.as_deref(),
            &request.signature,
        )?;
        let target = self.locate(&request.workspace_id, request.job_id)?;

        // Pre-approvals skip the check: the step they unblock may not exist yet.
        // Conditions belong to the suspended step only.
        if target.is_step
            && let Some(flow) = &target.live_flow
            && is_waiting_on(flow, request.job_id)
        {
            check_conditions(flow, user)?;
        }

        let approver = request
            .approver
            .clone()
            .or_else(|| user.map(|u| u.username.clone()));
        let outcome = self.orchestrator.ledger().bank(BankRequest {
            flow: target.flow_id,
            target: request.job_id,
            resume_id: request.resume_id,
            approver,
            value: request.payload,
            approved: request.approved,
        });

        if let Err(e) = self.orchestrator.try_resume(target.flow_id) {
            // The record is durable; the next event on the flow reads it.
            tracing::error!(flow_id = %target.flow_id, error = %e, "Resume evaluation failed");
        }

        let message = match (outcome, request.approved) {
            (BankOutcome::Recorded, true) => "Approval recorded",
            (BankOutcome::Recorded, false) => "Disapproval recorded",
            (BankOutcome::AlreadyPresent, true) => "Approval was already recorded",
            (BankOutcome::AlreadyPresent, false) => "Disapproval was already recorded",
        };
        Ok(ResumeOutcome {
            outcome,
            message: message.to_string(),
        })
    }

    pub fn suspended_job_view(
        &self,
        workspace_id: &str,
        job_id: Uuid,
        resume_id: u32,
        signature: &str,
        approver: Option<&str>,
    ) -> Result<SuspendedJobView> {
        self.verify(workspace_id, job_id, resume_id, approver, signature)?;
        let target = self.locate(workspace_id, job_id)?;
        let ledger = self.orchestrator.ledger();

        let records = ledger.approvals_for(target.flow_id, job_id);
        let already_submitted = records
            .iter()
            .any(|r| r.job == job_id && r.resume_id == resume_id);
        let approvers = records
            .iter()
            .map(|r| ApproverEntry {
                resume_id: r.resume_id,
                approver: r.approver_name().to_string(),
                approved: r.approved,
            })
            .collect();

        let (resume_form, approval_conditions) = target
            .live_flow
            .as_ref()
            .map(suspended_module_details)
            .unwrap_or_default();

        Ok(SuspendedJobView {
            approvers,
            resume_form,
            approval_conditions,
            already_submitted,
        })
    }

    fn verify(
        &self,
        workspace_id: &str,
        job_id: Uuid,
        resume_id: u32,
        approver: Option<&str>,
        signature: &str,
    ) -> Result<()> {
        if self
            .signatures
            .verify(workspace_id, job_id, resume_id, approver, signature)
        {
            Ok(())
        } else {
            tracing::warn!(workspace = %workspace_id, job_id = %job_id, "Rejected resume signature");
            Err(FlowgateError::Unauthorized("invalid signature".into()))
        }
    }

    fn locate(&self, workspace_id: &str, job_id: Uuid) -> Result<Target> {
        let store = self.orchestrator.store();
        let (workspace, flow_id, is_step) = match store.get(job_id) {
            Ok(row) => {
                let job = row.value;
                let flow_id = if job.is_flow() {
                    job.id
                } else {
                    job.parent_job.ok_or(FlowgateError::NoParentFlow(job_id))?
                };
                let is_step = !job.is_flow();
                (job.workspace_id, flow_id, is_step)
            }
            Err(FlowgateError::JobNotFound(_)) => {
                let record = store
                    .completed(job_id)
                    .ok_or(FlowgateError::JobNotFound(job_id))?;
                let flow_id = record.parent_job.unwrap_or(record.id);
                (record.workspace_id, flow_id, record.parent_job.is_some())
            }
            Err(e) => return Err(e),
        };
        // Indistinguishable from a bad signature.
        if workspace != workspace_id {
            return Err(FlowgateError::Unauthorized("invalid signature".into()));
        }
        let live_flow = store.get(flow_id).ok().map(|row| row.value);
        Ok(Target {
            flow_id,
            is_step,
            live_flow,
        })
    }
}

fn is_waiting_on(flow: &Job, job_id: Uuid) -> bool {
    flow.flow_status.as_ref().is_some_and(|s| {
        matches!(s.current(), ModuleStatus::WaitingForEvents { job, .. } if *job == job_id)
    })
}

fn check_conditions(flow: &Job, user: Option<&AuthedUser>) -> Result<()> {
    let Some(conditions) = flow
        .flow_status
        .as_ref()
        .and_then(|s| s.approval_conditions.as_ref())
    else {
        return Ok(());
    };
    if !conditions.user_auth_required {
        return Ok(());
    }
    let Some(user) = user else {
        return Err(FlowgateError::Unauthorized(
            "this approval requires an authenticated user".into(),
        ));
    };
    if user.is_admin {
        return Ok(());
    }
    if conditions.self_approval_disabled && user.email == flow.email {
        return Err(FlowgateError::PermissionDenied(
            "self approval is disabled for this step".into(),
        ));
    }
    if !conditions.user_groups_required.is_empty()
        && !user
            .groups
            .iter()
            .any(|g| conditions.user_groups_required.contains(g))
    {
        return Err(FlowgateError::PermissionDenied(format!(
            "approver must belong to one of: {}",
            conditions.user_groups_required.join(", ")
        )));
    }
    Ok(())
}

/// Resume form and approval conditions of the module the flow is suspended on.
fn suspended_module_details(
    flow: &Job,
) -> (Option<serde_json::Value>, Option<ApprovalConditions>) {
    let (Some(status), Some(def)) = (&flow.flow_status, &flow.raw_flow) else {
        return (None, None);
    };
    if !matches!(status.current(), ModuleStatus::WaitingForEvents { .. }) {
        return (None, None);
    }
    let form = def
        .module_at(status.step)
        .and_then(|m| m.suspend.as_ref())
        .and_then(|cfg| cfg.resume_form.clone());
    (form, status.approval_conditions.clone())
}

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::flow::{FlowDefinition, SuspendConfig};

fn is_false(v: &bool) -> bool {
    !*v
}

/// An approval counted toward a module instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
    pub resume_id: u32,
    pub approver: String,
    /// Banked against the flow job rather than the step job.
    #[serde(default, skip_serializing_if = "is_false")]
    pub flow_level: bool,
}

/// Loop cursor of a for-loop module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopIterator {
    pub index: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchAllStatus {
    pub branch: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BranchChosen {
    Default,
    Branch { branch: usize },
}

/// Run-time state of one module of a flow run.
///
/// Each variant carries only the fields that mean something in that state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ModuleStatus {
    WaitingForPriorSteps {
        id: String,
    },
    WaitingForEvents {
        id: String,
        /// Approvals required to resume.
        count: u32,
        job: Uuid,
    },
    WaitingForExecutor {
        id: String,
        job: Uuid,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        approvers: Vec<Approval>,
    },
    InProgress {
        id: String,
        job: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iterator: Option<LoopIterator>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flow_jobs: Option<Vec<Uuid>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_chosen: Option<BranchChosen>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branchall: Option<BranchAllStatus>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        approvers: Vec<Approval>,
    },
    Success {
        id: String,
        job: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flow_jobs: Option<Vec<Uuid>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_chosen: Option<BranchChosen>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        approvers: Vec<Approval>,
        #[serde(default, skip_serializing_if = "is_false")]
        skipped: bool,
    },
    Failure {
        id: String,
        job: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        flow_jobs: Option<Vec<Uuid>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch_chosen: Option<BranchChosen>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        failed_retries: Vec<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Canceled {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job: Option<Uuid>,
    },
}

impl ModuleStatus {
    pub fn waiting(id: impl Into<String>) -> Self {
        ModuleStatus::WaitingForPriorSteps { id: id.into() }
    }

    pub fn id(&self) -> &str {
        match self {
            ModuleStatus::WaitingForPriorSteps { id }
            | ModuleStatus::WaitingForEvents { id, .. }
            | ModuleStatus::WaitingForExecutor { id, .. }
            | ModuleStatus::InProgress { id, .. }
            | ModuleStatus::Success { id, .. }
            | ModuleStatus::Failure { id, .. }
            | ModuleStatus::Canceled { id, .. } => id,
        }
    }

    pub fn job(&self) -> Option<Uuid> {
        match self {
            ModuleStatus::WaitingForPriorSteps { .. } => None,
            ModuleStatus::WaitingForEvents { job, .. }
            | ModuleStatus::WaitingForExecutor { job, .. }
            | ModuleStatus::InProgress { job, .. }
            | ModuleStatus::Success { job, .. }
            | ModuleStatus::Failure { job, .. } => Some(*job),
            ModuleStatus::Canceled { job, .. } => *job,
        }
    }

    pub fn approvers(&self) -> &[Approval] {
        match self {
            ModuleStatus::WaitingForExecutor { approvers, .. }
            | ModuleStatus::InProgress { approvers, .. }
            | ModuleStatus::Success { approvers, .. } => approvers,
            _ => &[],
        }
    }

    pub fn flow_jobs(&self) -> Option<&[Uuid]> {
        match self {
            ModuleStatus::InProgress { flow_jobs, .. }
            | ModuleStatus::Success { flow_jobs, .. }
            | ModuleStatus::Failure { flow_jobs, .. } => flow_jobs.as_deref(),
            _ => None,
        }
    }

    pub fn branch_chosen(&self) -> Option<&BranchChosen> {
        match self {
            ModuleStatus::InProgress { branch_chosen, .. }
            | ModuleStatus::Success { branch_chosen, .. }
            | ModuleStatus::Failure { branch_chosen, .. } => branch_chosen.as_ref(),
            _ => None,
        }
    }

    /// Reached by the flow but not finished.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ModuleStatus::WaitingForEvents { .. }
                | ModuleStatus::WaitingForExecutor { .. }
                | ModuleStatus::InProgress { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ModuleStatus::Success { .. } | ModuleStatus::Failure { .. } | ModuleStatus::Canceled { .. }
        )
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ModuleStatus::WaitingForPriorSteps { .. } => "WaitingForPriorSteps",
            ModuleStatus::WaitingForEvents { .. } => "WaitingForEvents",
            ModuleStatus::WaitingForExecutor { .. } => "WaitingForExecutor",
            ModuleStatus::InProgress { .. } => "InProgress",
            ModuleStatus::Success { .. } => "Success",
            ModuleStatus::Failure { .. } => "Failure",
            ModuleStatus::Canceled { .. } => "Canceled",
        }
    }
}

/// Status of the flow-level error handler, possibly inside a nested flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureModuleStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_module: Option<String>,
    #[serde(flatten)]
    pub module_status: ModuleStatus,
}

/// Audit trail of failures within the current module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryStatus {
    pub fail_count: u32,
    pub failed_jobs: Vec<Uuid>,
}

impl RetryStatus {
    pub fn is_default(&self) -> bool {
        self.fail_count == 0 && self.failed_jobs.is_empty()
    }
}

/// Who may approve the module that is currently suspended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConditions {
    pub user_auth_required: bool,
    pub user_groups_required: Vec<String>,
    pub self_approval_disabled: bool,
}

impl From<&SuspendConfig> for ApprovalConditions {
    fn from(cfg: &SuspendConfig) -> Self {
        Self {
            user_auth_required: cfg.user_auth_required,
            user_groups_required: cfg.user_groups_required.clone(),
            self_approval_disabled: cfg.self_approval_disabled,
        }
    }
}

/// Persisted run-time state of a flow job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStatus {
    /// Index of the module being advanced. Values past the last module
    /// address the failure module.
    pub step: usize,
    pub modules: Vec<ModuleStatus>,
    pub failure_module: FailureModuleStatus,
    #[serde(default, skip_serializing_if = "RetryStatus::is_default")]
    pub retry: RetryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_conditions: Option<ApprovalConditions>,
}

impl FlowStatus {
    pub fn new(flow: &FlowDefinition) -> Self {
        Self {
            step: 0,
            modules: flow
                .modules
                .iter()
                .map(|m| ModuleStatus::waiting(m.id.clone()))
                .collect(),
            failure_module: FailureModuleStatus {
                parent_module: None,
                module_status: ModuleStatus::waiting(
                    flow.failure_module
                        .as_ref()
                        .map(|m| m.id.clone())
                        .unwrap_or_else(|| "failure".to_string()),
                ),
            },
            retry: RetryStatus::default(),
            approval_conditions: None,
        }
    }

    pub fn in_failure_module(&self) -> bool {
        self.step >= self.modules.len()
    }

    pub fn current(&self) -> &ModuleStatus {
        self.modules
            .get(self.step)
            .unwrap_or(&self.failure_module.module_status)
    }

    pub fn current_mut(&mut self) -> &mut ModuleStatus {
        match self.modules.get_mut(self.step) {
            Some(module) => module,
            None => &mut self.failure_module.module_status,
        }
    }

    pub fn all_modules_mut(&mut self) -> impl Iterator<Item = &mut ModuleStatus> {
        self.modules
            .iter_mut()
            .chain(std::iter::once(&mut self.failure_module.module_status))
    }

    /// Flow-level resume ids already counted by some module of this run.
    pub fn consumed_flow_level_ids(&self) -> HashSet<u32> {
        self.modules
            .iter()
            .chain(std::iter::once(&self.failure_module.module_status))
            .flat_map(|m| m.approvers())
            .filter(|a| a.flow_level)
            .map(|a| a.resume_id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::flow::FlowModule;
    use serde_json::json;

    fn flow() -> FlowDefinition {
        FlowDefinition::new(vec![FlowModule::new("a"), FlowModule::new("b")])
    }

    #[test]
    fn new_status_waits_on_every_module() {
        let status = FlowStatus::new(&flow());
        assert_eq!(status.step, 0);
        assert!(status
            .modules
            .iter()
            .all(|m| matches!(m, ModuleStatus::WaitingForPriorSteps { .. })));
        assert_eq!(status.failure_module.module_status.id(), "failure");
    }

    #[test]
    fn serializes_with_type_tag() {
        let job = Uuid::nil();
        let module = ModuleStatus::WaitingForEvents {
            id: "b".into(),
            count: 2,
            job,
        };
        let value = serde_json::to_value(&module).unwrap();
        assert_eq!(
            value,
            json!({"type": "WaitingForEvents", "id": "b", "count": 2, "job": job})
        );
    }

    #[test]
    fn persisted_shape_round_trips() {
        let mut status = FlowStatus::new(&flow());
        status.modules[0] = ModuleStatus::Success {
            id: "a".into(),
            job: Uuid::new_v4(),
            flow_jobs: None,
            branch_chosen: Some(BranchChosen::Branch { branch: 1 }),
            approvers: vec![Approval {
                resume_id: 0,
                approver: "alice".into(),
                flow_level: true,
            }],
            skipped: false,
        };
        status.retry.fail_count = 1;

        let json = serde_json::to_string(&status).unwrap();
        let back: FlowStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);

        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["failure_module"]["type"], "WaitingForPriorSteps");
        assert_eq!(value["retry"]["fail_count"], 1);
    }

    #[test]
    fn current_addresses_failure_module_past_the_end() {
        let mut status = FlowStatus::new(&flow());
        status.step = 2;
        assert!(status.in_failure_module());
        assert_eq!(status.current().id(), "failure");
    }

    #[test]
    fn consumed_flow_level_ids_ignore_step_level() {
        let mut status = FlowStatus::new(&flow());
        status.modules[0] = ModuleStatus::Success {
            id: "a".into(),
            job: Uuid::new_v4(),
            flow_jobs: None,
            branch_chosen: None,
            approvers: vec![
                Approval {
                    resume_id: 0,
                    approver: "alice".into(),
                    flow_level: true,
                },
                Approval {
                    resume_id: 1,
                    approver: "bob".into(),
                    flow_level: false,
                },
            ],
            skipped: false,
        };
        assert_eq!(status.consumed_flow_level_ids(), HashSet::from([0]));
    }
}

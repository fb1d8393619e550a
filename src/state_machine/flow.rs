use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;
use crate::error::Result;

/// What a suspended module does when its timeout elapses without enough approvals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Resume anyway, recording whatever approvers arrived.
    #[default]
    Continue,
    /// Fail the module; the flow's failure handling takes over.
    Fail,
}

/// Static suspend settings of a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendConfig {
    #[serde(default = "default_required_events")]
    pub required_events: u32,
    /// Seconds until the suspend resolves on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_form: Option<serde_json::Value>,
    #[serde(default)]
    pub user_auth_required: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub user_groups_required: Vec<String>,
    #[serde(default)]
    pub self_approval_disabled: bool,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
    /// Treat a disapproval (cancel link) like an approval instead of failing.
    #[serde(default)]
    pub continue_on_disapprove: bool,
}

fn default_required_events() -> u32 {
    1
}

impl SuspendConfig {
    pub fn new(required_events: u32) -> Self {
        Self {
            required_events,
            timeout: None,
            resume_form: None,
            user_auth_required: false,
            user_groups_required: Vec::new(),
            self_approval_disabled: false,
            on_timeout: TimeoutPolicy::default(),
            continue_on_disapprove: false,
        }
    }

    pub fn with_timeout(mut self, secs: u64, policy: TimeoutPolicy) -> Self {
        self.timeout = Some(secs);
        self.on_timeout = policy;
        self
    }
}

/// One step of a flow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowModule {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspend: Option<SuspendConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Record an execution failure (after retries) and move on to the next module.
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_time_window_s: Option<u32>,
}

impl FlowModule {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            suspend: None,
            retry: None,
            continue_on_error: false,
            concurrent_limit: None,
            concurrency_time_window_s: None,
        }
    }

    pub fn with_suspend(mut self, suspend: SuspendConfig) -> Self {
        self.suspend = Some(suspend);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }
}

/// The static shape of a flow: ordered modules plus an optional error handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub modules: Vec<FlowModule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_module: Option<FlowModule>,
    #[serde(default)]
    pub same_worker: bool,
}

impl FlowDefinition {
    pub fn new(modules: Vec<FlowModule>) -> Self {
        Self {
            modules,
            failure_module: None,
            same_worker: false,
        }
    }

    pub fn with_failure_module(mut self, module: FlowModule) -> Self {
        self.failure_module = Some(module);
        self
    }

    pub fn validate(&self) -> Result<()> {
        for module in self.modules.iter().chain(self.failure_module.iter()) {
            if let Some(retry) = &module.retry {
                retry.validate(&module.id)?;
            }
        }
        Ok(())
    }

    /// Module addressed by a flow step index; indices past the end address
    /// the failure module.
    pub fn module_at(&self, step: usize) -> Option<&FlowModule> {
        match self.modules.get(step) {
            Some(module) => Some(module),
            None => self.failure_module.as_ref(),
        }
    }
}

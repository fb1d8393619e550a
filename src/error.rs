use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, FlowgateError>;

#[derive(Debug, Error)]
pub enum FlowgateError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job {0} is not a flow job")]
    NotAFlow(Uuid),

    #[error("Job {0} has no parent flow")]
    NoParentFlow(Uuid),

    /// Forged signatures and unmet approval conditions. Deliberately carries
    /// no detail about which check failed.
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Concurrent update of flow {flow_id} did not settle after {attempts} attempts")]
    Conflict { flow_id: Uuid, attempts: u32 },

    #[error("Version mismatch on job {job_id}: expected {expected}, found {found}")]
    VersionMismatch {
        job_id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("Invalid transition for module '{module}': {reason}")]
    InvalidTransition { module: String, reason: String },

    #[error("Invalid retry configuration for module '{module}': {reason}")]
    InvalidRetry { module: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl FlowgateError {
    pub(crate) fn invalid_transition(module: &str, reason: impl Into<String>) -> Self {
        FlowgateError::InvalidTransition {
            module: module.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether a caller should reload state and try again.
    pub fn is_conflict(&self) -> bool {
        matches!(self, FlowgateError::VersionMismatch { .. })
    }
}

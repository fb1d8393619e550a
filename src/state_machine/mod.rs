mod flow;
mod job;
pub mod retry;
mod state;
mod status;

pub use flow::{FlowDefinition, FlowModule, SuspendConfig, TimeoutPolicy};
pub use job::{CompletedJob, FailureKind, Job, JobKind, JobOutcome, StepOutcome};
pub use retry::{RetryDecision, RetryPolicy};
pub use state::{
    Applied, DEFAULT_SUSPEND_TIMEOUT, Effect, FlowEvent, FlowStateMachine, MAX_SUSPEND_TIMEOUT,
    ModuleProgress, Transition,
};
pub use status::{
    Approval, ApprovalConditions, BranchAllStatus, BranchChosen, FailureModuleStatus, FlowStatus,
    LoopIterator, ModuleStatus, RetryStatus,
};

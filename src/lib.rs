//! Flow status state machine with signed suspend/resume approvals.
//!
//! A flow is a sequence of modules, each run as a step job. Steps may fail
//! and be retried under a [`state_machine::RetryPolicy`], or suspend until
//! enough approvals arrive through signed resume links. All state lives in
//! the flow job's [`state_machine::FlowStatus`] and moves only through
//! [`orchestrator::FlowOrchestrator`].

pub mod config;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod queue;
pub mod resume;
pub mod signature;
pub mod state_machine;
pub mod sweeper;
pub mod telemetry;

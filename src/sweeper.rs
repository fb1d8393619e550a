//! Background sweep that times out suspended flows.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;

use crate::orchestrator::FlowOrchestrator;

/// Periodically asks the store for flows past their suspend deadline and
/// feeds each through [`FlowOrchestrator::handle_timeout`], the same
/// exclusive path every other event takes.
pub struct TimeoutSweeper {
    orchestrator: Arc<FlowOrchestrator>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl TimeoutSweeper {
    pub fn new(orchestrator: Arc<FlowOrchestrator>) -> Self {
        Self {
            orchestrator,
            interval: Duration::from_secs(5),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Runs until [`TimeoutSweeper::stop`] is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        tracing::info!(interval_secs = self.interval.as_secs(), "Timeout sweeper started");

        while self.running.load(Ordering::SeqCst) {
            self.sweep_once();
            tokio::time::sleep(self.interval).await;
        }

        tracing::info!("Timeout sweeper stopped");
    }

    /// One pass over expired suspends; returns how many flows moved.
    pub fn sweep_once(&self) -> usize {
        let handled = self.orchestrator.sweep_timeouts(Utc::now());
        if handled > 0 {
            tracing::info!(handled, "Expired suspends processed");
        }
        handled
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

mod cli;
mod ui;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use uuid::Uuid;

use cli::{Cli, Command};
use flowgate::config::FlowgateConfig;
use flowgate::ledger::MemoryLedger;
use flowgate::orchestrator::FlowOrchestrator;
use flowgate::queue::{JobStore, MemoryJobStore, RecordingQueue};
use flowgate::resume::{ResumeLinks, ResumeRequest, ResumeService};
use flowgate::signature::SignatureService;
use flowgate::state_machine::{
    FlowDefinition, FlowModule, Job, ModuleStatus, RetryPolicy, StepOutcome, SuspendConfig,
    TimeoutPolicy,
};
use flowgate::sweeper::TimeoutSweeper;
use flowgate::telemetry::init_tracing;
use ui::FlowProgress;

const DEMO_WORKSPACE: &str = "demo";
const DEMO_SECRET: &str = "flowgate-demo-secret";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = FlowgateConfig::load(&cli.config)?;

    let log = if cli.verbose {
        config.log.clone().verbose()
    } else {
        config.log.clone()
    };
    init_tracing(&log)?;

    match cli.command {
        Command::Sign {
            workspace,
            job,
            resume_id,
            approver,
        } => {
            let signatures = SignatureService::new(require_secret(&config)?);
            println!(
                "{}",
                signatures.sign(&workspace, job, resume_id, approver.as_deref())
            );
        }
        Command::Verify {
            workspace,
            job,
            resume_id,
            approver,
            signature,
        } => {
            let signatures = SignatureService::new(require_secret(&config)?);
            if !signatures.verify(&workspace, job, resume_id, approver.as_deref(), &signature) {
                bail!("invalid signature");
            }
            println!("valid");
        }
        Command::Urls {
            workspace,
            job,
            resume_id,
            approver,
        } => {
            let signatures = SignatureService::new(require_secret(&config)?);
            let signature = signatures.sign(&workspace, job, resume_id, approver.as_deref());
            let urls = ResumeLinks::new(&config.base_url)?.urls(
                &workspace,
                job,
                resume_id,
                &signature,
                approver.as_deref(),
            )?;
            println!("{}", serde_json::to_string_pretty(&urls)?);
        }
        Command::Backoff { policy } => print_backoff(&policy)?,
        Command::Demo {
            pre_approve,
            required,
        } => run_demo(&config, pre_approve, required).await?,
    }

    Ok(())
}

fn require_secret(config: &FlowgateConfig) -> Result<String> {
    if config.signing_secret.is_empty() {
        bail!("signing_secret is not set (flowgate.toml or FLOWGATE_SIGNING_SECRET)");
    }
    Ok(config.signing_secret.clone())
}

fn print_backoff(policy: &str) -> Result<()> {
    let policy: RetryPolicy =
        serde_json::from_str(policy).context("Failed to parse retry policy JSON")?;
    policy.validate("cli")?;

    if policy.attempts() == 0 {
        println!("no retries: the first failure is final");
        return Ok(());
    }
    for fail_count in 0..policy.attempts() {
        let Some(delay) = policy.base_delay(fail_count) else {
            break;
        };
        println!(
            "retry {:>4}: {:>10.1}s",
            fail_count + 1,
            delay.as_secs_f64()
        );
    }
    Ok(())
}

/// Runs `[a, b (suspend), c]` against in-memory collaborators with a
/// simulated worker, printing each transition.
async fn run_demo(config: &FlowgateConfig, pre_approve: bool, required: u32) -> Result<()> {
    let secret = if config.signing_secret.is_empty() {
        DEMO_SECRET.to_string()
    } else {
        config.signing_secret.clone()
    };

    let store = Arc::new(MemoryJobStore::new());
    let queue = Arc::new(RecordingQueue::new());
    let orchestrator = Arc::new(
        FlowOrchestrator::new(store.clone(), queue.clone(), Arc::new(MemoryLedger::new()))
            .with_machine(config.state_machine())
            .with_cas_max_attempts(config.cas_max_attempts),
    );
    let resume = ResumeService::new(
        Arc::new(SignatureService::new(secret)),
        orchestrator.clone(),
        &config.base_url,
    )?;

    let sweeper = Arc::new(
        TimeoutSweeper::new(orchestrator.clone()).with_interval(config.sweep_interval()),
    );
    let sweep_task = tokio::spawn({
        let sweeper = sweeper.clone();
        async move { sweeper.run().await }
    });

    let definition = FlowDefinition::new(vec![
        FlowModule::new("a"),
        FlowModule::new("b").with_suspend(
            SuspendConfig::new(required.max(1))
                .with_timeout(config.default_suspend_timeout_secs, TimeoutPolicy::Fail),
        ),
        FlowModule::new("c"),
    ]);
    let progress = FlowProgress::start("demo flow [a, b (suspend), c]");
    let flow_id = orchestrator.start_flow(Job::new_flow(
        DEMO_WORKSPACE,
        "owner@demo.test",
        definition,
    ))?;

    if pre_approve {
        let urls = resume.resume_urls(DEMO_WORKSPACE, flow_id, Some(0), Some("alice"), true)?;
        tracing::info!(url = %urls.resume, "Flow-level approval link minted");
        let outcome = resume.resume(
            ResumeRequest {
                workspace_id: DEMO_WORKSPACE.to_string(),
                job_id: flow_id,
                resume_id: 0,
                signature: resume.job_signature(DEMO_WORKSPACE, flow_id, 0, Some("alice")),
                payload: serde_json::json!({ "pre_approved": true }),
                approver: Some("alice".to_string()),
                approved: true,
            },
            None,
        )?;
        println!("  pre-approval: {}", outcome.message);
    }

    let mut suspended = HashSet::new();
    while let Some(job_id) = queue.take_dispatched() {
        let Ok(row) = store.get(job_id) else {
            continue;
        };
        let module = row.value.module_id.unwrap_or_default();
        progress.transitions(&orchestrator.on_job_accepted(job_id)?.transitions);

        if module == "b" && suspended.insert(job_id) {
            progress.transitions(&orchestrator.on_job_suspended(job_id)?.transitions);
            if matches!(
                orchestrator.flow_status(flow_id)?.current(),
                ModuleStatus::WaitingForEvents { .. }
            ) {
                approve_step(&resume, job_id, required)?;
            }
            continue;
        }

        let applied = orchestrator.on_job_completed(job_id, StepOutcome::Success)?;
        progress.transitions(&applied.transitions);
        if let Some(outcome) = applied.outcome() {
            progress.complete(outcome);
        }
    }

    sweeper.stop();
    sweep_task.abort();

    let status = orchestrator.flow_status(flow_id)?;
    progress.print_status(&status);
    Ok(())
}

fn approve_step(resume: &ResumeService, job_id: Uuid, required: u32) -> Result<()> {
    for resume_id in 0..required.max(1) {
        let approver = format!("approver-{resume_id}");
        let urls = resume.resume_urls(
            DEMO_WORKSPACE,
            job_id,
            Some(resume_id),
            Some(&approver),
            false,
        )?;
        tracing::debug!(url = %urls.approval_page, "Approval page link minted");

        let outcome = resume.resume(
            ResumeRequest {
                workspace_id: DEMO_WORKSPACE.to_string(),
                job_id,
                resume_id,
                signature: resume.job_signature(
                    DEMO_WORKSPACE,
                    job_id,
                    resume_id,
                    Some(&approver),
                ),
                payload: serde_json::json!({ "approved_by": approver }),
                approver: Some(approver.clone()),
                approved: true,
            },
            None,
        )?;
        println!("  {approver}: {}", outcome.message);
    }
    Ok(())
}

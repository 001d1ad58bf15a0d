//! A worker drives one claimed work item through a solve attempt.
//!
//! The worker owns the claim for its item from spawn to completion: it
//! acquires solver budget, runs the solver, records the contribution, and
//! releases (or abandons) the claim. The factory only learns the outcome
//! through a [`WorkerEvent`] on the shared channel.

use crate::audit::{AuditLog, actions};
use crate::coordination::{CATEGORY_AGENT_API, ClaimManager, RateDecision, RateLimiter};
use crate::error::Result;
use crate::factory::runner::{AgentRunner, AttemptOutcome};
use crate::store::{AgentStore, Contribution, ContributionStatus, WorkItem, now_ms};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info, warn};

/// Why a worker finished.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    /// The attempt ran and was recorded with the given status.
    Finished(ContributionStatus),
    /// No solver budget before the deadline; the claim was abandoned and
    /// the item should go back in the queue.
    Requeued,
    /// The attempt could not be recorded or the solver infrastructure broke.
    Failed(String),
}

/// Event a worker sends back to the factory when it finishes.
#[derive(Debug, Clone)]
pub struct WorkerEvent {
    pub agent_id: String,
    pub item: WorkItem,
    pub outcome: WorkerOutcome,
}

/// Shared handles a worker needs. Cheap to clone; everything inside is
/// reference-counted.
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<Mutex<AgentStore>>,
    pub claims: ClaimManager,
    pub rate: RateLimiter,
    pub audit: AuditLog,
    pub model: String,
    pub budget_timeout: Duration,
}

/// Run one solve attempt end to end. The caller has already claimed the
/// item for `agent_id`.
pub async fn run_worker(
    ctx: WorkerContext,
    runner: Arc<dyn AgentRunner>,
    item: WorkItem,
    agent_id: String,
    events: UnboundedSender<WorkerEvent>,
) {
    let outcome = attempt(&ctx, runner.as_ref(), &item, &agent_id).await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            error!("worker {} failed on {}: {}", agent_id, item.work_item, e);
            let _ = ctx.claims.abandon(&item.work_item, &agent_id);
            WorkerOutcome::Failed(e.to_string())
        }
    };
    // The factory may already be gone during shutdown
    let _ = events.send(WorkerEvent {
        agent_id,
        item,
        outcome,
    });
}

async fn attempt(
    ctx: &WorkerContext,
    runner: &dyn AgentRunner,
    item: &WorkItem,
    agent_id: &str,
) -> Result<WorkerOutcome> {
    let token = match ctx
        .rate
        .acquire(CATEGORY_AGENT_API, 1, ctx.budget_timeout)
        .await?
    {
        RateDecision::Acquired(token) => token,
        RateDecision::TimedOut => {
            warn!("no solver budget for {}, requeueing", item.work_item);
            ctx.claims.abandon(&item.work_item, agent_id)?;
            ctx.audit
                .record(agent_id, &item.repo, actions::CLAIM_ABANDONED, "no solver budget")?;
            return Ok(WorkerOutcome::Requeued);
        }
    };

    let solved = runner.solve(item, agent_id).await;
    let outcome = match solved {
        Ok(outcome) => outcome,
        Err(e) => {
            // Spawn failure: the solver never ran, so its budget goes back
            ctx.rate.refund(&token)?;
            return Err(e);
        }
    };

    let (status, pr_url, audit_action, details) = match &outcome {
        AttemptOutcome::PrSubmitted { pr_url } => {
            info!("{} submitted {}", agent_id, pr_url);
            (
                ContributionStatus::PrSubmitted,
                Some(pr_url.clone()),
                actions::PR_SUBMITTED,
                pr_url.clone(),
            )
        }
        AttemptOutcome::NoChanges => (
            ContributionStatus::NoChanges,
            None,
            actions::NO_CHANGES,
            String::new(),
        ),
        AttemptOutcome::Skipped { reason } => (
            ContributionStatus::Skipped,
            None,
            actions::SKIPPED,
            reason.clone(),
        ),
        AttemptOutcome::Failed { detail } => (
            ContributionStatus::Failed,
            None,
            actions::SOLVE_FAILED,
            detail.clone(),
        ),
    };

    let now = now_ms();
    {
        let store = ctx.store.lock().unwrap();
        let attempt = store.attempts_for(&item.work_item)? + 1;
        store.record_contribution(&Contribution {
            id: 0,
            work_item: item.work_item.clone(),
            repo: item.repo.clone(),
            agent_id: agent_id.to_string(),
            model: ctx.model.clone(),
            attempt,
            status,
            pr_url,
            submitted_at: now,
            closed_at: None,
        })?;
    }
    ctx.audit.record(agent_id, &item.repo, audit_action, &details)?;

    // Failed attempts free the item for another try; everything else is done
    if status == ContributionStatus::Failed {
        ctx.claims.abandon(&item.work_item, agent_id)?;
    } else {
        ctx.claims.release(&item.work_item, agent_id)?;
        ctx.audit
            .record(agent_id, &item.repo, actions::CLAIM_RELEASED, &item.work_item)?;
    }

    Ok(WorkerOutcome::Finished(status))
}

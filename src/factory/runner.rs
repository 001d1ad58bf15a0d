//! Solver runner: the seam between coordination and the actual LLM solver.
//!
//! The factory never talks to a model directly. It hands a work item to an
//! [`AgentRunner`], which is a subprocess in production and a mock in tests.

use crate::error::Result;
use crate::store::WorkItem;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit code a solver uses to signal it looked at the item and declined.
const EXIT_SKIPPED: i32 = 2;

/// What a single solve attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// A pull request was opened.
    PrSubmitted { pr_url: String },
    /// The solver finished cleanly but found nothing to change.
    NoChanges,
    /// The solver declined the item (wrong language, too large, already
    /// fixed upstream).
    Skipped { reason: String },
    /// The solver crashed or exited with an unexpected status.
    Failed { detail: String },
}

/// An AgentRunner turns one work item into an attempt outcome.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn solve(&self, item: &WorkItem, agent_id: &str) -> Result<AttemptOutcome>;
}

/// Runs a configured solver command as a subprocess.
///
/// The work item is passed through `DOGOOD_*` environment variables. Any
/// inherited variable whose name contains `CLAUDE` is stripped so the
/// solver's own session configuration cannot leak in from the parent.
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    model: String,
}

impl CommandRunner {
    pub fn new(command: &[String], model: &str) -> Option<Self> {
        let (program, args) = command.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl AgentRunner for CommandRunner {
    async fn solve(&self, item: &WorkItem, agent_id: &str) -> Result<AttemptOutcome> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("DOGOOD_WORK_ITEM", &item.work_item)
            .env("DOGOOD_REPO", &item.repo)
            .env("DOGOOD_ISSUE", item.number.to_string())
            .env("DOGOOD_AGENT_ID", agent_id)
            .env("DOGOOD_MODEL", &self.model)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, _) in std::env::vars() {
            if key.contains("CLAUDE") {
                cmd.env_remove(&key);
            }
        }

        debug!("solver start: {} for {}", self.program, item.work_item);
        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => match parse_pr_url(&stdout) {
                Some(pr_url) => Ok(AttemptOutcome::PrSubmitted { pr_url }),
                None => Ok(AttemptOutcome::NoChanges),
            },
            Some(EXIT_SKIPPED) => {
                let reason = stderr.trim();
                Ok(AttemptOutcome::Skipped {
                    reason: if reason.is_empty() {
                        "solver declined".to_string()
                    } else {
                        reason.to_string()
                    },
                })
            }
            code => {
                warn!("solver failed for {}: status {:?}", item.work_item, code);
                Ok(AttemptOutcome::Failed {
                    detail: format!("exit status {code:?}: {}", stderr.trim()),
                })
            }
        }
    }
}

/// Find the pull request URL a solver printed, if any. Takes the first
/// whitespace-separated token that looks like a GitHub PR link.
pub fn parse_pr_url(stdout: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .find(|token| token.contains("https://github.com/") && token.contains("/pull/"))
        .map(|token| token.trim_end_matches(['.', ',', ')', ']']).to_string())
}

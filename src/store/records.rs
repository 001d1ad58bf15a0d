//! Record types persisted in the AgentStore, plus the candidate types
//! consumed from the ranking layer.
//!
//! All timestamps are i64 milliseconds since the Unix epoch. Operations that
//! compare against "now" take it as an explicit parameter so eligibility and
//! expiry stay pure functions of stored state.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// A unit of work: one issue in one repository.
///
/// Produced by the external scanner/ranker, read-only to the coordination
/// core. The `work_item` key is `owner/name#number`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkItem {
    /// Identity key, e.g. "rust-lang/cargo#1234"
    pub work_item: String,

    /// Repository full name, e.g. "rust-lang/cargo"
    pub repo: String,

    /// Issue number within the repo
    pub number: u64,

    /// Score assigned by the ranking layer (higher is better)
    #[serde(default)]
    pub priority_score: f64,

    /// Selection bucket assigned by the ranking layer
    #[serde(default)]
    pub bucket: Bucket,

    /// Carries a label reserved for human first-time contributors
    #[serde(default)]
    pub beginner_labeled: bool,

    /// Another open PR already targets this issue
    #[serde(default)]
    pub duplicate: bool,

    /// Repo language is one we can work in
    #[serde(default = "default_true")]
    pub language_ok: bool,
}

fn default_true() -> bool {
    true
}

impl WorkItem {
    /// Check the eligibility flags set by the scanner.
    pub fn is_workable(&self) -> bool {
        !self.beginner_labeled && !self.duplicate && self.language_ok
    }
}

/// Selection priority bucket, highest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// Repos owned by sponsors
    Sponsor,
    /// Focus repos with recent merged PRs
    FocusMomentum,
    /// Focus repos without merges yet
    Focus,
    /// Everything else
    #[default]
    General,
}

impl Bucket {
    /// Ordering rank, lower runs first.
    pub fn rank(&self) -> u8 {
        match self {
            Bucket::Sponsor => 0,
            Bucket::FocusMomentum => 1,
            Bucket::Focus => 2,
            Bucket::General => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Sponsor => "sponsor",
            Bucket::FocusMomentum => "focus_momentum",
            Bucket::Focus => "focus",
            Bucket::General => "general",
        }
    }
}

/// Sort candidates by bucket rank, then descending score.
///
/// The sort is stable, so ties within a bucket keep their supplied order.
pub fn sort_candidates(items: &mut [WorkItem]) {
    items.sort_by(|a, b| {
        a.bucket
            .rank()
            .cmp(&b.bucket.rank())
            .then(b.priority_score.total_cmp(&a.priority_score))
    });
}

/// Exclusive, time-boxed ownership of one WorkItem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Claim {
    pub work_item: String,
    pub owner: String,
    pub claimed_at: i64,
    pub expires_at: i64,
}

impl Claim {
    /// A claim is live until its expiry passes.
    pub fn is_active(&self, now: i64) -> bool {
        now < self.expires_at
    }
}

/// Terminal status recorded when a claim is given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimStatus {
    Active,
    Completed,
    Abandoned,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Active => "active",
            ClaimStatus::Completed => "completed",
            ClaimStatus::Abandoned => "abandoned",
        }
    }
}

/// One row of shared rate budget state.
#[derive(Debug, Clone, PartialEq)]
pub struct RateState {
    pub category: String,
    pub window_start: i64,
    pub window_ms: i64,
    pub used: i64,
    pub max_per_window: i64,
}

impl RateState {
    /// Remaining budget in the window active at `now`.
    pub fn remaining(&self, now: i64) -> i64 {
        if now - self.window_start >= self.window_ms {
            self.max_per_window
        } else {
            self.max_per_window - self.used
        }
    }
}

/// Per-repository trust record: strikes, cooldown, merge momentum.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoTrust {
    pub repo: String,
    pub strikes: u32,
    pub cooldown_until: Option<i64>,
    pub merges: u32,
    pub last_merge_at: Option<i64>,
    pub updated_at: i64,
}

/// Outcome record of one attempt at a WorkItem.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contribution {
    #[serde(default)]
    pub id: i64,
    pub work_item: String,
    pub repo: String,
    pub agent_id: String,
    pub model: String,
    pub attempt: u32,
    pub status: ContributionStatus,
    pub pr_url: Option<String>,
    pub submitted_at: i64,
    pub closed_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContributionStatus {
    PrSubmitted,
    NoChanges,
    Skipped,
    Failed,
}

impl ContributionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionStatus::PrSubmitted => "pr_submitted",
            ContributionStatus::NoChanges => "no_changes",
            ContributionStatus::Skipped => "skipped",
            ContributionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pr_submitted" => Some(ContributionStatus::PrSubmitted),
            "no_changes" => Some(ContributionStatus::NoChanges),
            "skipped" => Some(ContributionStatus::Skipped),
            "failed" => Some(ContributionStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContributionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One operator-visible audit entry.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub id: i64,
    pub at: i64,
    pub agent_id: String,
    pub repo: String,
    pub action: String,
    pub details: String,
}

/// Generate a short unique agent ID (12 hex chars).
pub fn generate_agent_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("Time went backwards");
    let counter = COUNTER.fetch_add(1, Ordering::Relaxed);

    let seed = format!("{}-{}-{}", duration.as_secs(), duration.subsec_nanos(), counter);
    let digest = Sha256::digest(seed.as_bytes());
    hex::encode(&digest[..6])
}

/// Get current time in milliseconds since epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

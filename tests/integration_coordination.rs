//! Coordination layer integration tests
//!
//! Exercises claims, rate budget, and trust together over one shared store,
//! the way concurrent agents use them in production.

use dogood::audit::AuditLog;
use dogood::coordination::{
    CATEGORY_AGENT_API, CATEGORY_GITHUB_SEARCH, ClaimManager, ClaimOutcome, PairDecision,
    RateLimiter, StrikeTracker, TrustState, retry_delay, slot_for_agent,
};
use dogood::error::Result;
use dogood::store::{AgentStore, ClaimStatus, generate_agent_id};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

fn open_store(temp_dir: &TempDir) -> Arc<Mutex<AgentStore>> {
    Arc::new(Mutex::new(AgentStore::open_at(temp_dir.path()).unwrap()))
}

/// Integration test: two managers over the same database file agree on who
/// holds a claim, the way two agent processes would.
#[tokio::test]
async fn test_claims_shared_across_managers() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let first = ClaimManager::new(open_store(&temp_dir), 3_600_000, 3, Duration::from_millis(10))?;
    let second = ClaimManager::new(open_store(&temp_dir), 3_600_000, 3, Duration::from_millis(10))?;

    let outcome = first.try_claim_at("a/b#1", "agent1", 1000).await?;
    assert!(outcome.is_granted());

    let outcome = second.try_claim_at("a/b#1", "agent2", 2000).await?;
    assert_eq!(outcome, ClaimOutcome::Denied);

    // The second process sees the claim and cannot release it
    assert!(!second.release_at("a/b#1", "agent2", ClaimStatus::Completed, 3000)?);
    assert!(first.release_at("a/b#1", "agent1", ClaimStatus::Completed, 3000)?);

    Ok(())
}

/// Integration test: many concurrent claimants over one shared store,
/// exactly one winner per item.
#[tokio::test]
async fn test_concurrent_claim_mutual_exclusion() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let manager = ClaimManager::new(open_store(&temp_dir), 3_600_000, 5, Duration::from_millis(10))?;

    for item in ["a/b#1", "a/b#2", "c/d#3"] {
        let mut handles = Vec::new();
        for _ in 0..10 {
            let manager = manager.clone();
            let item = item.to_string();
            let owner = generate_agent_id();
            handles.push(tokio::spawn(async move {
                manager.try_claim_at(&item, &owner, 1000).await.unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_granted() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1, "exactly one winner for {item}");
    }

    Ok(())
}

/// Integration test: the GitHub search budget scenario - 30 queries per
/// minute shared across agents, refilling at the window boundary.
#[test]
fn test_search_budget_window() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let limiter = RateLimiter::new(open_store(&temp_dir), Duration::from_millis(5));
    limiter.register(CATEGORY_GITHUB_SEARCH, 60_000, 30)?;

    let start = 1_000_000;
    for i in 0..30 {
        assert!(
            limiter
                .try_acquire_at(CATEGORY_GITHUB_SEARCH, 1, start + i)?
                .is_some()
        );
    }
    assert!(
        limiter
            .try_acquire_at(CATEGORY_GITHUB_SEARCH, 1, start + 100)?
            .is_none()
    );

    // Budget never goes negative
    let state = limiter.state(CATEGORY_GITHUB_SEARCH)?.unwrap();
    assert_eq!(state.used, 30);
    assert_eq!(state.remaining(start + 100), 0);

    // Next window refills completely
    assert!(
        limiter
            .try_acquire_at(CATEGORY_GITHUB_SEARCH, 1, start + 60_000)?
            .is_some()
    );
    assert_eq!(limiter.state(CATEGORY_GITHUB_SEARCH)?.unwrap().used, 1);

    Ok(())
}

/// Integration test: paired acquisition across the solver and search
/// budgets leaves no budget held when the pair cannot complete.
#[tokio::test]
async fn test_pair_acquisition_refund() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let limiter = RateLimiter::new(open_store(&temp_dir), Duration::from_millis(5));
    limiter.register(CATEGORY_AGENT_API, 3_600_000, 10)?;
    limiter.register(CATEGORY_GITHUB_SEARCH, 3_600_000, 1)?;

    // Exhaust the search budget
    limiter.try_acquire(CATEGORY_GITHUB_SEARCH, 1)?;

    let decision = limiter
        .acquire_pair(
            CATEGORY_AGENT_API,
            CATEGORY_GITHUB_SEARCH,
            1,
            Duration::from_millis(30),
        )
        .await?;
    assert_eq!(decision, PairDecision::TimedOut);
    assert_eq!(limiter.state(CATEGORY_AGENT_API)?.unwrap().used, 0);

    Ok(())
}

/// Integration test: the full strike lifecycle over a week-long cooldown.
#[test]
fn test_strike_cooldown_lifecycle() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let tracker = StrikeTracker::new(open_store(&temp_dir), 10, 7 * DAY_MS)?;

    let day0 = 1_000_000;
    tracker.record_strike_at("a/b", day0)?;
    assert!(!tracker.is_eligible_at("a/b", day0 + 3 * DAY_MS)?);
    assert!(tracker.is_eligible_at("a/b", day0 + 7 * DAY_MS)?);

    // A merge during a later cooldown clears it immediately
    tracker.record_strike_at("a/b", day0 + 8 * DAY_MS)?;
    assert!(!tracker.is_eligible_at("a/b", day0 + 9 * DAY_MS)?);
    tracker.record_merge_at("a/b", day0 + 9 * DAY_MS)?;
    assert!(tracker.is_eligible_at("a/b", day0 + 9 * DAY_MS)?);

    // Positive feedback walks strikes back to clean
    tracker.record_positive_feedback_at("a/b", 1, day0 + 10 * DAY_MS)?;
    tracker.record_positive_feedback_at("a/b", 1, day0 + 10 * DAY_MS)?;
    assert_eq!(tracker.state_at("a/b", day0 + 10 * DAY_MS)?, TrustState::Clean);

    Ok(())
}

/// Integration test: reaching the strike cap excludes forever - neither
/// merges, redemption, nor positive feedback bring the repo back.
#[test]
fn test_strike_cap_is_terminal() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let tracker = StrikeTracker::new(open_store(&temp_dir), 3, 7 * DAY_MS)?;

    for _ in 0..5 {
        tracker.record_strike_at("a/b", 1000)?;
    }
    // Capped at 3, even after 5 strikes
    assert_eq!(tracker.trust("a/b")?.unwrap().strikes, 3);
    assert_eq!(
        tracker.state_at("a/b", 1000 + 365 * DAY_MS)?,
        TrustState::PermanentlyExcluded
    );

    // A merge does not lift the exclusion
    tracker.record_merge_at("a/b", 2000)?;
    assert_eq!(
        tracker.state_at("a/b", 3000)?,
        TrustState::PermanentlyExcluded
    );

    // Neither does redemption or positive feedback
    assert_eq!(tracker.redeem_at("a/b", 10, 4000)?, 3);
    assert_eq!(tracker.record_positive_feedback_at("a/b", 10, 5000)?, 3);
    assert!(!tracker.is_eligible_at("a/b", 1000 + 365 * DAY_MS)?);

    Ok(())
}

/// Integration test: audit entries from multiple components interleave in
/// one trail.
#[tokio::test]
async fn test_audit_trail_interleaves() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = open_store(&temp_dir);
    let claims = ClaimManager::new(Arc::clone(&store), 3_600_000, 3, Duration::from_millis(10))?;
    let tracker = StrikeTracker::new(Arc::clone(&store), 10, 7 * DAY_MS)?;
    let audit = AuditLog::new(store);

    claims.try_claim_at("a/b#1", "agent1", 1000).await?;
    audit.record_at(1000, "agent1", "a/b", "claim_granted", "a/b#1")?;
    tracker.record_strike_at("c/d", 2000)?;
    audit.record_at(2000, "operator", "c/d", "strike", "spam PR")?;
    audit.record_at(3000, "agent1", "a/b", "pr_submitted", "https://github.com/a/b/pull/1")?;

    let entries = audit.recent(10)?;
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0].action, "pr_submitted");
    assert_eq!(entries[2].action, "claim_granted");

    Ok(())
}

/// Integration test: the stagger schedule keeps agents apart and bounded.
#[test]
fn test_stagger_schedule_bounds() {
    for _ in 0..20 {
        let id = generate_agent_id();
        let slot = slot_for_agent(&id);
        let delay = retry_delay(Duration::from_secs(30), slot, 0);
        assert!(delay >= Duration::from_secs(10));
        assert!(delay <= Duration::from_secs(600));
    }
    // Escalation is monotonic per slot
    for attempt in 0..5 {
        assert!(
            retry_delay(Duration::ZERO, 2, attempt) <= retry_delay(Duration::ZERO, 2, attempt + 1)
        );
    }
}

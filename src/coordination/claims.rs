//! Claim manager: mutual exclusion over work items for concurrent agents.
//!
//! A claim asserts "this agent is working on this item" with a TTL lease.
//! At most one live claim exists per work item; a crashed agent simply lets
//! its lease lapse and the item becomes available again, with no janitor
//! process required.

use crate::error::{DogoodError, Result};
use crate::store::{AgentStore, Claim, ClaimStatus, is_busy, now_ms};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The claim was granted and is held until released or expired.
    Granted(Claim),
    /// Another agent holds a live claim on this item.
    Denied,
}

impl ClaimOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, ClaimOutcome::Granted(_))
    }
}

/// ClaimManager hands out TTL leases on work items.
///
/// Clones share the underlying store, so every worker in the process (and
/// every process sharing the database file) sees the same claim table.
#[derive(Clone)]
pub struct ClaimManager {
    store: Arc<Mutex<AgentStore>>,
    ttl_ms: i64,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl ClaimManager {
    pub fn new(
        store: Arc<Mutex<AgentStore>>,
        ttl_ms: i64,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Result<Self> {
        if ttl_ms <= 0 {
            return Err(DogoodError::InvalidState(format!(
                "claim ttl must be positive, got {ttl_ms}ms"
            )));
        }
        Ok(Self {
            store,
            ttl_ms,
            retry_attempts,
            retry_delay,
        })
    }

    /// Try to claim a work item for an owner, retrying briefly when the
    /// database file is locked by another process.
    pub async fn try_claim(&self, work_item: &str, owner: &str) -> Result<ClaimOutcome> {
        self.try_claim_at(work_item, owner, now_ms()).await
    }

    /// Claim attempt with an explicit clock, for deterministic tests.
    pub async fn try_claim_at(&self, work_item: &str, owner: &str, now: i64) -> Result<ClaimOutcome> {
        let mut attempt = 0;
        loop {
            let result = {
                let mut store = self.store.lock().unwrap();
                store.try_claim_row(work_item, owner, now, self.ttl_ms)
            };
            match result {
                Ok(Some(claim)) => {
                    debug!("claim granted: {} -> {}", work_item, owner);
                    return Ok(ClaimOutcome::Granted(claim));
                }
                Ok(None) => {
                    debug!("claim denied: {} already held", work_item);
                    return Ok(ClaimOutcome::Denied);
                }
                Err(e) if is_busy(&e) => {
                    attempt += 1;
                    if attempt > self.retry_attempts {
                        return Err(DogoodError::Storage(format!(
                            "claim store busy after {} retries: {e}",
                            self.retry_attempts
                        )));
                    }
                    warn!(
                        "claim store busy for {}, retry {}/{}",
                        work_item, attempt, self.retry_attempts
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Mark a claim completed. Returns false if the caller no longer owns a
    /// live claim on the item.
    pub fn release(&self, work_item: &str, owner: &str) -> Result<bool> {
        self.release_at(work_item, owner, ClaimStatus::Completed, now_ms())
    }

    /// Abandon a claim, freeing the item immediately for other agents.
    pub fn abandon(&self, work_item: &str, owner: &str) -> Result<bool> {
        self.release_at(work_item, owner, ClaimStatus::Abandoned, now_ms())
    }

    /// Terminal transition with an explicit clock.
    pub fn release_at(
        &self,
        work_item: &str,
        owner: &str,
        status: ClaimStatus,
        now: i64,
    ) -> Result<bool> {
        let store = self.store.lock().unwrap();
        let released = store.release_row(work_item, owner, status, now)?;
        if released {
            debug!("claim {}: {} -> {}", status.as_str(), work_item, owner);
        } else {
            debug!("release no-op: {} not live for {}", work_item, owner);
        }
        Ok(released)
    }

    /// Live claim for a work item, if any.
    pub fn active_claim(&self, work_item: &str) -> Result<Option<Claim>> {
        let store = self.store.lock().unwrap();
        store.active_claim(work_item, now_ms())
    }

    /// Number of live claims.
    pub fn count_active(&self) -> Result<usize> {
        let store = self.store.lock().unwrap();
        store.count_active_claims(now_ms())
    }

    /// Delete stale rows. Housekeeping only.
    pub fn sweep_expired(&self) -> Result<usize> {
        let store = self.store.lock().unwrap();
        store.sweep_expired_claims(now_ms())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_manager(ttl_ms: i64) -> (ClaimManager, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(Mutex::new(AgentStore::open_at(temp_dir.path()).unwrap()));
        let manager = ClaimManager::new(store, ttl_ms, 3, Duration::from_millis(10)).unwrap();
        (manager, temp_dir)
    }

    #[test]
    fn test_rejects_nonpositive_ttl() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(Mutex::new(AgentStore::open_at(temp_dir.path()).unwrap()));
        assert!(ClaimManager::new(store.clone(), 0, 3, Duration::from_millis(10)).is_err());
        assert!(ClaimManager::new(store, -5, 3, Duration::from_millis(10)).is_err());
    }

    #[tokio::test]
    async fn test_grant_then_deny() {
        let (manager, _temp) = create_manager(60_000);

        let outcome = manager.try_claim_at("a/b#1", "agent1", 1000).await.unwrap();
        assert!(outcome.is_granted());

        let outcome = manager.try_claim_at("a/b#1", "agent2", 2000).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Denied);
    }

    #[tokio::test]
    async fn test_concurrent_claims_one_winner() {
        let (manager, _temp) = create_manager(60_000);

        let mut handles = Vec::new();
        for i in 0..8 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move {
                m.try_claim_at("a/b#1", &format!("agent{i}"), 1000).await.unwrap()
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_granted() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_reclaim_after_expiry() {
        let (manager, _temp) = create_manager(60_000);

        manager.try_claim_at("a/b#1", "agent1", 1000).await.unwrap();

        // Still held just before expiry
        let outcome = manager.try_claim_at("a/b#1", "agent2", 60_999).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Denied);

        let outcome = manager.try_claim_at("a/b#1", "agent2", 61_000).await.unwrap();
        assert!(outcome.is_granted());
    }

    #[tokio::test]
    async fn test_abandon_frees_immediately() {
        let (manager, _temp) = create_manager(3_600_000);

        manager.try_claim_at("a/b#1", "agent1", 1000).await.unwrap();
        assert!(manager.release_at("a/b#1", "agent1", ClaimStatus::Abandoned, 2000).unwrap());

        let outcome = manager.try_claim_at("a/b#1", "agent2", 3000).await.unwrap();
        assert!(outcome.is_granted());
    }

    #[tokio::test]
    async fn test_release_by_non_owner_is_noop() {
        let (manager, _temp) = create_manager(60_000);

        manager.try_claim_at("a/b#1", "agent1", 1000).await.unwrap();
        assert!(!manager.release_at("a/b#1", "agent2", ClaimStatus::Completed, 2000).unwrap());

        // agent1 still holds the claim
        let outcome = manager.try_claim_at("a/b#1", "agent3", 3000).await.unwrap();
        assert_eq!(outcome, ClaimOutcome::Denied);
    }

    #[tokio::test]
    async fn test_release_after_expiry_is_noop() {
        let (manager, _temp) = create_manager(60_000);

        manager.try_claim_at("a/b#1", "agent1", 1000).await.unwrap();
        assert!(!manager.release_at("a/b#1", "agent1", ClaimStatus::Completed, 70_000).unwrap());
    }
}

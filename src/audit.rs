//! Audit trail for agent actions.
//!
//! Every externally visible agent action (claims, submissions, strikes,
//! releases) lands in the `audit_log` table through the same connection the
//! coordination state uses, so the trail survives crashes and interleaves
//! correctly across concurrent agents without a separate file lock.

use crate::error::Result;
use crate::store::{AgentStore, AuditEntry, now_ms};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Well-known audit actions. Free-form strings are allowed; these are the
/// ones the rest of the crate emits.
pub mod actions {
    pub const CLAIM_GRANTED: &str = "claim_granted";
    pub const CLAIM_RELEASED: &str = "claim_released";
    pub const CLAIM_ABANDONED: &str = "claim_abandoned";
    pub const PR_SUBMITTED: &str = "pr_submitted";
    pub const NO_CHANGES: &str = "no_changes";
    pub const SKIPPED: &str = "skipped";
    pub const SOLVE_FAILED: &str = "solve_failed";
    pub const STRIKE: &str = "strike";
    pub const MERGE: &str = "merge";
    pub const REDEEM: &str = "redeem";
}

/// AuditLog appends structured action records.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<Mutex<AgentStore>>,
}

impl AuditLog {
    pub fn new(store: Arc<Mutex<AgentStore>>) -> Self {
        Self { store }
    }

    /// Append an entry stamped with the current time.
    pub fn record(&self, agent_id: &str, repo: &str, action: &str, details: &str) -> Result<()> {
        self.record_at(now_ms(), agent_id, repo, action, details)
    }

    pub fn record_at(
        &self,
        at: i64,
        agent_id: &str,
        repo: &str,
        action: &str,
        details: &str,
    ) -> Result<()> {
        trace!("audit: {} {} {} {}", agent_id, repo, action, details);
        let store = self.store.lock().unwrap();
        store.append_audit(at, agent_id, repo, action, details)
    }

    /// Most recent entries, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let store = self.store.lock().unwrap();
        store.recent_audit(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_record_and_recent() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(Mutex::new(AgentStore::open_at(temp_dir.path()).unwrap()));
        let audit = AuditLog::new(store);

        audit.record_at(1000, "abc", "a/b", actions::CLAIM_GRANTED, "a/b#1").unwrap();
        audit.record_at(2000, "abc", "a/b", actions::PR_SUBMITTED, "https://github.com/a/b/pull/2").unwrap();
        audit.record_at(3000, "def", "c/d", actions::STRIKE, "").unwrap();

        let entries = audit.recent(2).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, actions::STRIKE);
        assert_eq!(entries[1].action, actions::PR_SUBMITTED);
    }
}

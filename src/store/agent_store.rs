//! AgentStore: the shared SQLite database behind all cross-agent coordination.
//!
//! Every mutation that multiple workers can race on (claims, rate budget,
//! trust state) is expressed as a single conditional statement or a single
//! IMMEDIATE transaction, so SQLite's own locking provides the atomicity.
//! No caller may read-then-blind-write any of these rows.
//!
//! The database is opened in WAL mode with a 30s busy timeout, which lets
//! separate worker processes share one file without a second lock primitive.

use crate::error::{DogoodError, Result};
use crate::store::records::{
    AuditEntry, Claim, ClaimStatus, Contribution, ContributionStatus, RateState, RepoTrust,
};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use std::fs;
use std::path::{Path, PathBuf};

/// AgentStore wraps the coordination database.
pub struct AgentStore {
    /// Base directory holding the database file
    base_dir: PathBuf,

    /// SQLite connection
    db: Connection,
}

impl AgentStore {
    /// Open or create the store in the default data directory
    /// (`~/.local/share/dogood/`).
    pub fn open() -> Result<Self> {
        let base_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dogood");
        Self::open_at(&base_dir)
    }

    /// Open or create the store at the specified directory.
    ///
    /// Useful for testing with custom paths.
    pub fn open_at(base_dir: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        let db_path = base_dir.join("dogood.db");

        let db = Connection::open(&db_path)?;
        db.pragma_update(None, "journal_mode", "WAL")?;
        db.pragma_update(None, "foreign_keys", "ON")?;
        db.pragma_update(None, "busy_timeout", 30000)?;
        db.pragma_update(None, "synchronous", "NORMAL")?;

        Self::init_schema(&db)?;

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            db,
        })
    }

    /// Initialize the SQLite schema.
    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS claims (
                work_item TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                claimed_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'active'
            );

            CREATE TABLE IF NOT EXISTS rate_state (
                category TEXT PRIMARY KEY,
                window_start INTEGER NOT NULL,
                window_ms INTEGER NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                max_per_window INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS repo_trust (
                repo TEXT PRIMARY KEY,
                strikes INTEGER NOT NULL DEFAULT 0,
                cooldown_until INTEGER,
                merges INTEGER NOT NULL DEFAULT 0,
                last_merge_at INTEGER,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS contributions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                work_item TEXT NOT NULL,
                repo TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                model TEXT NOT NULL,
                attempt INTEGER NOT NULL,
                status TEXT NOT NULL,
                pr_url TEXT,
                submitted_at INTEGER NOT NULL,
                closed_at INTEGER
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                at INTEGER NOT NULL,
                agent_id TEXT NOT NULL,
                repo TEXT NOT NULL,
                action TEXT NOT NULL,
                details TEXT NOT NULL DEFAULT ''
            );

            CREATE INDEX IF NOT EXISTS idx_claims_status ON claims(status);
            CREATE INDEX IF NOT EXISTS idx_contributions_work_item ON contributions(work_item);
            CREATE INDEX IF NOT EXISTS idx_contributions_status ON contributions(status);
            CREATE INDEX IF NOT EXISTS idx_audit_at ON audit_log(at DESC);
            "#,
        )?;
        Ok(())
    }

    /// Get the base directory for this store.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    // --- Claims ---

    /// Atomically claim a work item for an owner.
    ///
    /// Deletes any stale row for the key (non-active status or expired),
    /// then INSERT OR IGNOREs the new active claim. Both steps run inside
    /// one IMMEDIATE transaction: two callers that both observe an expired
    /// claim cannot both insert, because the delete-and-insert pair holds
    /// the write lock for its duration.
    ///
    /// Returns the new claim on success, None when the key is actively held.
    pub fn try_claim_row(
        &mut self,
        work_item: &str,
        owner: &str,
        now: i64,
        ttl_ms: i64,
    ) -> Result<Option<Claim>> {
        let expires_at = now + ttl_ms;
        let tx = self
            .db
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM claims WHERE work_item = ?1 AND (status != 'active' OR expires_at <= ?2)",
            params![work_item, now],
        )?;
        let inserted = tx.execute(
            r#"INSERT OR IGNORE INTO claims (work_item, owner, claimed_at, expires_at, status)
               VALUES (?1, ?2, ?3, ?4, 'active')"#,
            params![work_item, owner, now, expires_at],
        )?;
        tx.commit()?;

        if inserted > 0 {
            Ok(Some(Claim {
                work_item: work_item.to_string(),
                owner: owner.to_string(),
                claimed_at: now,
                expires_at,
            }))
        } else {
            Ok(None)
        }
    }

    /// Move a claim to a terminal status, only if it is still active, still
    /// owned by `owner`, and not yet expired. Returns true if a row changed.
    ///
    /// The ownership check is what keeps a straggler from releasing a claim
    /// that expired and was reassigned to someone else.
    pub fn release_row(
        &self,
        work_item: &str,
        owner: &str,
        status: ClaimStatus,
        now: i64,
    ) -> Result<bool> {
        let changed = self.db.execute(
            r#"UPDATE claims SET status = ?1
               WHERE work_item = ?2 AND owner = ?3 AND status = 'active' AND expires_at > ?4"#,
            params![status.as_str(), work_item, owner, now],
        )?;
        Ok(changed > 0)
    }

    /// Get the live claim for a work item, if any.
    pub fn active_claim(&self, work_item: &str, now: i64) -> Result<Option<Claim>> {
        let row = self
            .db
            .query_row(
                r#"SELECT work_item, owner, claimed_at, expires_at FROM claims
                   WHERE work_item = ?1 AND status = 'active' AND expires_at > ?2"#,
                params![work_item, now],
                |row| {
                    Ok(Claim {
                        work_item: row.get(0)?,
                        owner: row.get(1)?,
                        claimed_at: row.get(2)?,
                        expires_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Count live claims.
    pub fn count_active_claims(&self, now: i64) -> Result<usize> {
        let count: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM claims WHERE status = 'active' AND expires_at > ?1",
            params![now],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Delete stale claim rows. Correctness never depends on this running;
    /// expiry is recomputed from `expires_at` on every read.
    pub fn sweep_expired_claims(&self, now: i64) -> Result<usize> {
        let deleted = self.db.execute(
            "DELETE FROM claims WHERE status != 'active' OR expires_at <= ?1",
            params![now],
        )?;
        Ok(deleted)
    }

    // --- Rate budget ---

    /// Register a rate limit category, updating window/max if it exists.
    /// Consumed budget in the current window is preserved.
    pub fn ensure_category(
        &self,
        category: &str,
        window_ms: i64,
        max_per_window: i64,
        now: i64,
    ) -> Result<()> {
        self.db.execute(
            r#"INSERT INTO rate_state (category, window_start, window_ms, used, max_per_window)
               VALUES (?1, ?2, ?3, 0, ?4)
               ON CONFLICT(category) DO UPDATE SET
                   window_ms = excluded.window_ms,
                   max_per_window = excluded.max_per_window"#,
            params![category, now, window_ms, max_per_window],
        )?;
        Ok(())
    }

    /// Read the rate state for a category.
    pub fn rate_state(&self, category: &str) -> Result<Option<RateState>> {
        let row = self
            .db
            .query_row(
                r#"SELECT category, window_start, window_ms, used, max_per_window
                   FROM rate_state WHERE category = ?1"#,
                params![category],
                |row| {
                    Ok(RateState {
                        category: row.get(0)?,
                        window_start: row.get(1)?,
                        window_ms: row.get(2)?,
                        used: row.get(3)?,
                        max_per_window: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Consume `weight` units of budget if available, rolling the window
    /// first when it has elapsed.
    ///
    /// This is one UPDATE, so the rollover check and the decrement commit
    /// together: budget can never be granted twice across a boundary, nor
    /// denied because a rollover was observed half-applied. Returns true
    /// when budget was granted.
    pub fn try_consume(&self, category: &str, weight: i64, now: i64) -> Result<bool> {
        let changed = self.db.execute(
            r#"UPDATE rate_state SET
                   used = CASE WHEN ?3 - window_start >= window_ms THEN ?2
                               ELSE used + ?2 END,
                   window_start = CASE WHEN ?3 - window_start >= window_ms THEN ?3
                                       ELSE window_start END
               WHERE category = ?1
                 AND (?3 - window_start >= window_ms OR used + ?2 <= max_per_window)"#,
            params![category, weight, now],
        )?;
        Ok(changed > 0)
    }

    /// Return `weight` units of budget, floored at zero, but only if the
    /// window it was consumed in is still current.
    pub fn refund(&self, category: &str, weight: i64, now: i64) -> Result<()> {
        self.db.execute(
            r#"UPDATE rate_state SET used = MAX(0, used - ?2)
               WHERE category = ?1 AND ?3 - window_start < window_ms"#,
            params![category, weight, now],
        )?;
        Ok(())
    }

    // --- Repo trust ---

    /// Add a strike and start a cooldown. Strikes are capped at `cap`;
    /// reaching the cap is terminal. Returns the new strike count.
    pub fn strike_row(&self, repo: &str, now: i64, cooldown_ms: i64, cap: u32) -> Result<u32> {
        self.db.execute(
            r#"INSERT INTO repo_trust (repo, strikes, cooldown_until, merges, last_merge_at, updated_at)
               VALUES (?1, 1, ?2, 0, NULL, ?3)
               ON CONFLICT(repo) DO UPDATE SET
                   strikes = MIN(strikes + 1, ?4),
                   cooldown_until = ?2,
                   updated_at = ?3"#,
            params![repo, now + cooldown_ms, now, cap],
        )?;
        let strikes: u32 = self.db.query_row(
            "SELECT strikes FROM repo_trust WHERE repo = ?1",
            params![repo],
            |row| row.get(0),
        )?;
        Ok(strikes)
    }

    /// Record a merged PR: bump the merge count and clear any cooldown.
    /// Strikes are untouched.
    pub fn merge_row(&self, repo: &str, now: i64) -> Result<()> {
        self.db.execute(
            r#"INSERT INTO repo_trust (repo, strikes, cooldown_until, merges, last_merge_at, updated_at)
               VALUES (?1, 0, NULL, 1, ?2, ?2)
               ON CONFLICT(repo) DO UPDATE SET
                   merges = merges + 1,
                   last_merge_at = ?2,
                   cooldown_until = NULL,
                   updated_at = ?2"#,
            params![repo, now],
        )?;
        Ok(())
    }

    /// Reduce strikes by `amount`, floored at zero, optionally clearing the
    /// cooldown in the same statement. A row at or above `cap` is terminal
    /// and never changes here. Returns the current strike count (zero if
    /// the repo has no trust row).
    pub fn redeem_row(
        &self,
        repo: &str,
        amount: u32,
        clear_cooldown: bool,
        cap: u32,
        now: i64,
    ) -> Result<u32> {
        self.db.execute(
            r#"UPDATE repo_trust SET
                   strikes = MAX(0, strikes - ?2),
                   cooldown_until = CASE WHEN ?3 THEN NULL ELSE cooldown_until END,
                   updated_at = ?4
               WHERE repo = ?1 AND strikes < ?5"#,
            params![repo, amount, clear_cooldown, now, cap],
        )?;
        let strikes: Option<u32> = self
            .db
            .query_row(
                "SELECT strikes FROM repo_trust WHERE repo = ?1",
                params![repo],
                |row| row.get(0),
            )
            .optional()?;
        Ok(strikes.unwrap_or(0))
    }

    /// Read the trust record for a repo.
    pub fn trust_row(&self, repo: &str) -> Result<Option<RepoTrust>> {
        let row = self
            .db
            .query_row(
                r#"SELECT repo, strikes, cooldown_until, merges, last_merge_at, updated_at
                   FROM repo_trust WHERE repo = ?1"#,
                params![repo],
                |row| {
                    Ok(RepoTrust {
                        repo: row.get(0)?,
                        strikes: row.get(1)?,
                        cooldown_until: row.get(2)?,
                        merges: row.get(3)?,
                        last_merge_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // --- Contributions ---

    /// Record a finished attempt. Returns the row id.
    pub fn record_contribution(&self, contribution: &Contribution) -> Result<i64> {
        self.db.execute(
            r#"INSERT INTO contributions
               (work_item, repo, agent_id, model, attempt, status, pr_url, submitted_at, closed_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                contribution.work_item,
                contribution.repo,
                contribution.agent_id,
                contribution.model,
                contribution.attempt,
                contribution.status.as_str(),
                contribution.pr_url,
                contribution.submitted_at,
                contribution.closed_at,
            ],
        )?;
        Ok(self.db.last_insert_rowid())
    }

    /// Mark a contribution closed with a final status. Only the feedback
    /// layer calls this after the initial record.
    pub fn close_contribution(
        &self,
        id: i64,
        status: ContributionStatus,
        closed_at: i64,
    ) -> Result<()> {
        self.db.execute(
            "UPDATE contributions SET status = ?1, closed_at = ?2 WHERE id = ?3",
            params![status.as_str(), closed_at, id],
        )?;
        Ok(())
    }

    /// Count prior attempts for a work item.
    pub fn attempts_for(&self, work_item: &str) -> Result<u32> {
        let count: u32 = self.db.query_row(
            "SELECT COUNT(*) FROM contributions WHERE work_item = ?1",
            params![work_item],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// List the most recent contributions.
    pub fn list_contributions(&self, limit: usize) -> Result<Vec<Contribution>> {
        let mut stmt = self.db.prepare(
            r#"SELECT id, work_item, repo, agent_id, model, attempt, status, pr_url,
                      submitted_at, closed_at
               FROM contributions ORDER BY submitted_at DESC LIMIT ?1"#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let status: String = row.get(6)?;
            Ok(Contribution {
                id: row.get(0)?,
                work_item: row.get(1)?,
                repo: row.get(2)?,
                agent_id: row.get(3)?,
                model: row.get(4)?,
                attempt: row.get(5)?,
                status: ContributionStatus::parse(&status).unwrap_or(ContributionStatus::Failed),
                pr_url: row.get(7)?,
                submitted_at: row.get(8)?,
                closed_at: row.get(9)?,
            })
        })?;

        let mut contributions = Vec::new();
        for row in rows {
            contributions.push(row?);
        }
        Ok(contributions)
    }

    // --- Audit log ---

    /// Append an audit entry.
    pub fn append_audit(
        &self,
        at: i64,
        agent_id: &str,
        repo: &str,
        action: &str,
        details: &str,
    ) -> Result<()> {
        self.db.execute(
            "INSERT INTO audit_log (at, agent_id, repo, action, details) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![at, agent_id, repo, action, details],
        )?;
        Ok(())
    }

    /// Read the most recent audit entries, newest first.
    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut stmt = self.db.prepare(
            r#"SELECT id, at, agent_id, repo, action, details
               FROM audit_log ORDER BY at DESC, id DESC LIMIT ?1"#,
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(AuditEntry {
                id: row.get(0)?,
                at: row.get(1)?,
                agent_id: row.get(2)?,
                repo: row.get(3)?,
                action: row.get(4)?,
                details: row.get(5)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }
}

/// Check whether an error is a transient "database busy" condition worth a
/// bounded retry.
pub fn is_busy(err: &DogoodError) -> bool {
    match err {
        DogoodError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

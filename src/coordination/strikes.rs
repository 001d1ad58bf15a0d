//! Per-repo trust tracking: strikes, cooldowns, and redemption.
//!
//! A strike means a maintainer pushed back on an automated contribution
//! (closed PR, negative comment). Each strike starts a cooldown; hitting
//! the strike cap excludes the repo permanently. Merges and explicit
//! positive feedback move trust the other way.

use crate::error::{DogoodError, Result};
use crate::store::{AgentStore, RepoTrust, now_ms};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Eligibility of a repo for new contributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    /// No strikes, no cooldown.
    Clean,
    /// Below the cap but cooling down until the given time.
    Cooldown { until: i64 },
    /// Strikes on record, cooldown elapsed. Eligible, proceed with care.
    EligibleWithStrikes { strikes: u32 },
    /// At the strike cap. Never eligible again.
    PermanentlyExcluded,
}

impl TrustState {
    pub fn is_eligible(&self) -> bool {
        matches!(self, TrustState::Clean | TrustState::EligibleWithStrikes { .. })
    }
}

/// StrikeTracker guards which repos agents are allowed to touch.
#[derive(Clone)]
pub struct StrikeTracker {
    store: Arc<Mutex<AgentStore>>,
    cap: u32,
    cooldown_ms: i64,
}

impl StrikeTracker {
    pub fn new(store: Arc<Mutex<AgentStore>>, cap: u32, cooldown_ms: i64) -> Result<Self> {
        if cap == 0 {
            return Err(DogoodError::InvalidState(
                "strike cap must be at least 1".to_string(),
            ));
        }
        if cooldown_ms <= 0 {
            return Err(DogoodError::InvalidState(format!(
                "cooldown must be positive, got {cooldown_ms}ms"
            )));
        }
        Ok(Self {
            store,
            cap,
            cooldown_ms,
        })
    }

    /// Record maintainer pushback. Returns the new strike count.
    pub fn record_strike(&self, repo: &str) -> Result<u32> {
        self.record_strike_at(repo, now_ms())
    }

    pub fn record_strike_at(&self, repo: &str, now: i64) -> Result<u32> {
        let store = self.store.lock().unwrap();
        let strikes = store.strike_row(repo, now, self.cooldown_ms, self.cap)?;
        if strikes >= self.cap {
            info!("repo {} reached strike cap ({}), permanently excluded", repo, self.cap);
        } else {
            debug!("repo {} struck, {}/{} strikes", repo, strikes, self.cap);
        }
        Ok(strikes)
    }

    /// Record a merged PR. Clears any cooldown immediately; strikes stay.
    pub fn record_merge(&self, repo: &str) -> Result<()> {
        self.record_merge_at(repo, now_ms())
    }

    pub fn record_merge_at(&self, repo: &str, now: i64) -> Result<()> {
        let store = self.store.lock().unwrap();
        store.merge_row(repo, now)?;
        debug!("repo {} merge recorded", repo);
        Ok(())
    }

    /// Remove strikes, flooring at zero. The cooldown is left alone; only
    /// positive feedback or a merge clears it. A repo at the cap is beyond
    /// redemption and stays there.
    pub fn redeem(&self, repo: &str, amount: u32) -> Result<u32> {
        self.redeem_at(repo, amount, now_ms())
    }

    pub fn redeem_at(&self, repo: &str, amount: u32, now: i64) -> Result<u32> {
        if amount == 0 {
            return Err(DogoodError::InvalidState(
                "redeem amount must be at least 1".to_string(),
            ));
        }
        let store = self.store.lock().unwrap();
        let strikes = store.redeem_row(repo, amount, false, self.cap, now)?;
        debug!("repo {} redeemed to {} strikes", repo, strikes);
        Ok(strikes)
    }

    /// Explicit maintainer goodwill: remove strikes and end the cooldown in
    /// one atomic step.
    pub fn record_positive_feedback(&self, repo: &str, amount: u32) -> Result<u32> {
        self.record_positive_feedback_at(repo, amount, now_ms())
    }

    pub fn record_positive_feedback_at(&self, repo: &str, amount: u32, now: i64) -> Result<u32> {
        if amount == 0 {
            return Err(DogoodError::InvalidState(
                "feedback amount must be at least 1".to_string(),
            ));
        }
        let store = self.store.lock().unwrap();
        let strikes = store.redeem_row(repo, amount, true, self.cap, now)?;
        debug!("repo {} positive feedback, {} strikes, cooldown cleared", repo, strikes);
        Ok(strikes)
    }

    /// Current trust state. A repo with no history is Clean.
    ///
    /// The cap check comes first: once at the cap, a lapsed cooldown does
    /// not restore eligibility.
    pub fn state(&self, repo: &str) -> Result<TrustState> {
        self.state_at(repo, now_ms())
    }

    pub fn state_at(&self, repo: &str, now: i64) -> Result<TrustState> {
        let trust = {
            let store = self.store.lock().unwrap();
            store.trust_row(repo)?
        };
        let Some(trust) = trust else {
            return Ok(TrustState::Clean);
        };
        if trust.strikes >= self.cap {
            return Ok(TrustState::PermanentlyExcluded);
        }
        if let Some(until) = trust.cooldown_until
            && now < until
        {
            return Ok(TrustState::Cooldown { until });
        }
        if trust.strikes > 0 {
            Ok(TrustState::EligibleWithStrikes {
                strikes: trust.strikes,
            })
        } else {
            Ok(TrustState::Clean)
        }
    }

    pub fn is_eligible(&self, repo: &str) -> Result<bool> {
        Ok(self.state(repo)?.is_eligible())
    }

    pub fn is_eligible_at(&self, repo: &str, now: i64) -> Result<bool> {
        Ok(self.state_at(repo, now)?.is_eligible())
    }

    /// Raw trust record, if the repo has any history.
    pub fn trust(&self, repo: &str) -> Result<Option<RepoTrust>> {
        let store = self.store.lock().unwrap();
        store.trust_row(repo)
    }
}

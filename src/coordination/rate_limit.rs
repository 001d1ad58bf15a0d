//! Shared rate limiter over named budget categories.
//!
//! Budget is tracked in the database, so every agent in every process draws
//! from the same fixed-window counter. Acquisition is conditional-update
//! atomic in the store; this layer adds validation, blocking waits with a
//! deadline, paired acquisition with refund, and the stagger schedule agents
//! use to back off when budget is exhausted.

use crate::error::{DogoodError, Result};
use crate::store::{AgentStore, RateState, now_ms};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, trace};

/// Budget category for LLM solver calls.
pub const CATEGORY_AGENT_API: &str = "agent_api";

/// Budget category for GitHub search queries.
pub const CATEGORY_GITHUB_SEARCH: &str = "github_search";

/// Number of stagger slots agents are spread across.
pub const RETRY_SLOTS: u64 = 6;

const SLOT_STAGGER_SECS: u64 = 15;
const ATTEMPT_ESCALATION_SECS: u64 = 60;
const MIN_RETRY_SECS: u64 = 10;
const MAX_RETRY_SECS: u64 = 600;

/// Proof that budget was consumed, carrying what a refund needs.
#[derive(Debug, Clone, PartialEq)]
pub struct RateToken {
    pub category: String,
    pub weight: i64,
}

/// Result of a blocking acquisition.
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Acquired(RateToken),
    /// The deadline passed without budget becoming available.
    TimedOut,
}

impl RateDecision {
    pub fn is_acquired(&self) -> bool {
        matches!(self, RateDecision::Acquired(_))
    }
}

/// Result of a paired acquisition across two categories.
#[derive(Debug, Clone, PartialEq)]
pub enum PairDecision {
    Acquired(RateToken, RateToken),
    TimedOut,
}

/// RateLimiter arbitrates fixed-window budgets shared across agents.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<Mutex<AgentStore>>,
    poll_interval: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<Mutex<AgentStore>>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    /// Register a category, or update its window and limit if it already
    /// exists. Budget already consumed in the current window is preserved.
    pub fn register(&self, category: &str, window_ms: i64, max_per_window: i64) -> Result<()> {
        if window_ms <= 0 || max_per_window <= 0 {
            return Err(DogoodError::InvalidState(format!(
                "category {category}: window and limit must be positive ({window_ms}ms, {max_per_window})"
            )));
        }
        let store = self.store.lock().unwrap();
        store.ensure_category(category, window_ms, max_per_window, now_ms())?;
        debug!("rate category {}: {} per {}ms", category, max_per_window, window_ms);
        Ok(())
    }

    /// Consume `weight` units now if the window has room. Never blocks.
    pub fn try_acquire(&self, category: &str, weight: i64) -> Result<Option<RateToken>> {
        self.try_acquire_at(category, weight, now_ms())
    }

    /// Non-blocking acquisition with an explicit clock.
    pub fn try_acquire_at(&self, category: &str, weight: i64, now: i64) -> Result<Option<RateToken>> {
        let store = self.store.lock().unwrap();
        let state = store
            .rate_state(category)?
            .ok_or_else(|| DogoodError::UnknownCategory(category.to_string()))?;
        if weight < 1 || weight > state.max_per_window {
            return Err(DogoodError::InvalidState(format!(
                "weight {weight} out of range for {category} (max {})",
                state.max_per_window
            )));
        }
        if store.try_consume(category, weight, now)? {
            trace!("rate acquire: {} weight {}", category, weight);
            Ok(Some(RateToken {
                category: category.to_string(),
                weight,
            }))
        } else {
            trace!("rate deny: {} weight {}", category, weight);
            Ok(None)
        }
    }

    /// Block until budget is available or the timeout elapses. Waits are
    /// polling; the window rolls over inside the store, so a waiter is
    /// admitted on its first poll after the boundary.
    pub async fn acquire(
        &self,
        category: &str,
        weight: i64,
        timeout: Duration,
    ) -> Result<RateDecision> {
        let deadline = now_ms() + timeout.as_millis() as i64;
        loop {
            let now = now_ms();
            if let Some(token) = self.try_acquire_at(category, weight, now)? {
                return Ok(RateDecision::Acquired(token));
            }
            if now >= deadline {
                debug!("rate acquire timed out: {}", category);
                return Ok(RateDecision::TimedOut);
            }
            let remaining = Duration::from_millis((deadline - now) as u64);
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    /// Acquire budget from two categories under one shared deadline,
    /// holding neither on failure: the second acquisition only gets the
    /// time the first left over, and if it times out the first is refunded.
    pub async fn acquire_pair(
        &self,
        first: &str,
        second: &str,
        weight: i64,
        timeout: Duration,
    ) -> Result<PairDecision> {
        let started = now_ms();
        let first_token = match self.acquire(first, weight, timeout).await? {
            RateDecision::Acquired(token) => token,
            RateDecision::TimedOut => return Ok(PairDecision::TimedOut),
        };
        let elapsed = Duration::from_millis((now_ms() - started).max(0) as u64);
        let remaining = timeout.saturating_sub(elapsed);
        match self.acquire(second, weight, remaining).await? {
            RateDecision::Acquired(second_token) => {
                Ok(PairDecision::Acquired(first_token, second_token))
            }
            RateDecision::TimedOut => {
                self.refund(&first_token)?;
                Ok(PairDecision::TimedOut)
            }
        }
    }

    /// Return unused budget. A refund lands only if the window it came from
    /// is still current; after rollover it is silently dropped.
    pub fn refund(&self, token: &RateToken) -> Result<()> {
        let store = self.store.lock().unwrap();
        store.refund(&token.category, token.weight, now_ms())?;
        debug!("rate refund: {} weight {}", token.category, token.weight);
        Ok(())
    }

    /// Snapshot a category's state.
    pub fn state(&self, category: &str) -> Result<Option<RateState>> {
        let store = self.store.lock().unwrap();
        store.rate_state(category)
    }
}

/// Stable stagger slot for an agent id, in `[0, RETRY_SLOTS)`.
pub fn slot_for_agent(agent_id: &str) -> u64 {
    let digest = Sha256::digest(agent_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes) % RETRY_SLOTS
}

/// How long an agent in `slot` should wait before its next attempt after
/// exhausting budget. Starts from the time left in the current window, then
/// spreads agents 15s apart by slot so they do not stampede the boundary;
/// delay escalates linearly per attempt and is clamped to [10s, 600s].
pub fn retry_delay(cooldown_remaining: Duration, slot: u64, attempt: u32) -> Duration {
    let secs = cooldown_remaining.as_secs()
        + slot * SLOT_STAGGER_SECS
        + u64::from(attempt) * ATTEMPT_ESCALATION_SECS;
    Duration::from_secs(secs.clamp(MIN_RETRY_SECS, MAX_RETRY_SECS))
}

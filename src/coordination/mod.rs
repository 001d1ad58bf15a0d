pub mod claims;
pub mod rate_limit;
pub mod strikes;

pub use claims::{ClaimManager, ClaimOutcome};
pub use rate_limit::{
    CATEGORY_AGENT_API, CATEGORY_GITHUB_SEARCH, PairDecision, RETRY_SLOTS, RateDecision,
    RateLimiter, RateToken, retry_delay, slot_for_agent,
};
pub use strikes::{StrikeTracker, TrustState};

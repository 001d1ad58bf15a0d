pub mod agent_store;
pub mod records;

pub use agent_store::{AgentStore, is_busy};
pub use records::{
    AuditEntry, Bucket, Claim, ClaimStatus, Contribution, ContributionStatus, RateState, RepoTrust,
    WorkItem, generate_agent_id, now_ms, sort_candidates,
};

pub mod candidates;
pub mod coordinator;
pub mod runner;
pub mod worker;

pub use candidates::{CandidateSource, StaticCandidates};
pub use coordinator::{AgentFactory, FactoryConfig, FactoryStats};
pub use runner::{AgentRunner, AttemptOutcome, CommandRunner, parse_pr_url};
pub use worker::{WorkerEvent, WorkerOutcome};

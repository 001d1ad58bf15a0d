//! Dogood - coordination layer for concurrent OSS contribution agents.
//!
//! Multiple agents (across processes) share one SQLite database for work
//! item claims, rate budget, per-repo trust, contribution records, and an
//! audit trail. The factory module dispatches solver workers over a
//! prioritized candidate queue on top of those primitives.

pub mod audit;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod error;
pub mod factory;
pub mod store;

pub use error::{DogoodError, Result};

//! Candidate sources: where the factory gets work items from.

use crate::error::Result;
use crate::store::{WorkItem, sort_candidates};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use tracing::debug;

/// A CandidateSource produces a prioritized batch of work items.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<WorkItem>>;
}

/// A fixed candidate list, loaded up front. Used when discovery runs as a
/// separate step that writes its results to a file.
pub struct StaticCandidates {
    items: Vec<WorkItem>,
}

impl StaticCandidates {
    pub fn new(mut items: Vec<WorkItem>) -> Self {
        sort_candidates(&mut items);
        Self { items }
    }

    /// Load candidates from a JSON array on disk.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let items: Vec<WorkItem> = serde_json::from_str(&raw)?;
        debug!("loaded {} candidates from {}", items.len(), path.display());
        Ok(Self::new(items))
    }
}

#[async_trait]
impl CandidateSource for StaticCandidates {
    async fn fetch(&self) -> Result<Vec<WorkItem>> {
        Ok(self.items.clone())
    }
}

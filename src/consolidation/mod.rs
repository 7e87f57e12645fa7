//! Fragment consolidation.
//!
//! ```text
//!  directory (window) ──> planner ──> node 1 ─┐
//!                                     node 2 ─┼─ spawn_blocking ─> merged fragment
//!                                     ...    ─┘                    + vacuum list
//!                                                                  + commit marker
//! ```
//!
//! Each node is published on its own: tile files and metadata are synced,
//! then the vacuum list naming the inputs is written, then the commit
//! marker. Readers see either all inputs or the merged fragment, never a
//! mix. Inputs stay on disk until [`crate::vacuum::vacuum`] removes them.
//!
//! Consolidating fragments that a concurrent consolidation or vacuum is
//! also touching is not supported.

pub mod consolidator;
pub mod planner;

pub use consolidator::Consolidator;
pub use planner::{plan, ConsolidationPlan, PlanNode};

use crate::config::Config;
use crate::context::Context;
use crate::directory::{ArrayDirectory, DirectoryMode};
use crate::error::Result;
use crate::fragment::FragmentName;
use crate::Error;

use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsolidationParams {
    /// Upper bound on the summed input size of one node (default: 256 MiB).
    pub target_fragment_size: u64,
    /// Keep every cell version with its write time (default: true).
    pub with_timestamps: bool,
    /// Only fragments visible in `[timestamp_start, timestamp_end]` take part
    /// (default: all).
    pub timestamp_start: u64,
    pub timestamp_end: u64,
}

impl Default for ConsolidationParams {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl ConsolidationParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            target_fragment_size: config.consolidation.target_fragment_size,
            with_timestamps: config.consolidation.with_timestamps,
            timestamp_start: 0,
            timestamp_end: u64::MAX,
        }
    }

    pub fn target_fragment_size(mut self, size: u64) -> Self {
        self.target_fragment_size = size;
        self
    }

    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.with_timestamps = enabled;
        self
    }

    pub fn timestamp_window(mut self, start: u64, end: u64) -> Self {
        self.timestamp_start = start;
        self.timestamp_end = end;
        self
    }
}

/// Consolidate the fragments of the array at `location`, returning the
/// names of the fragments written.
///
/// Nodes run concurrently on the blocking pool. If any node fails the
/// first error is returned; nodes that succeeded stay published.
pub async fn consolidate(
    ctx: &Context,
    location: impl AsRef<Path>,
    params: &ConsolidationParams,
) -> Result<Vec<FragmentName>> {
    let location = location.as_ref().to_path_buf();
    let directory = ArrayDirectory::load(
        &location,
        params.timestamp_start,
        params.timestamp_end,
        DirectoryMode::Read,
        ctx.storage_stats(),
    )?;
    let schema = Arc::new(directory.load_schema()?);
    let plan = plan(directory.fragments(), params.target_fragment_size);

    let stats = ctx.storage_stats().child("Consolidator");
    let _timer = stats.start_timer("consolidate");
    let consolidator = Arc::new(Consolidator::new(
        location.clone(),
        schema,
        params.with_timestamps,
        ctx.config().tile_budget(),
        stats.clone(),
    ));

    tracing::info!(
        array = %location.display(),
        fragments = directory.fragments().len(),
        nodes = plan.mergeable().count(),
        "Planned consolidation"
    );

    let handles: Vec<_> = plan
        .mergeable()
        .cloned()
        .map(|node| {
            let consolidator = consolidator.clone();
            tokio::task::spawn_blocking(move || consolidator.consolidate_node(&node))
        })
        .collect();

    let mut written = Vec::with_capacity(handles.len());
    let mut first_error = None;
    for handle in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Consolidation(
                location.display().to_string(),
                format!("consolidation task failed: {}", e),
            )),
        };
        match result {
            Ok(name) => written.push(name),
            Err(e) => {
                let array = location.display();
                tracing::error!(array = %array, error = %e, "Consolidation node failed");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(written),
    }
}

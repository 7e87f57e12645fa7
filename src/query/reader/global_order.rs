use super::{fragment_readers, read_policy, MergeReader, ReadOutcome};
use crate::array::{Array, ArraySchema};
use crate::error::Result;
use crate::query::budget::MemoryBudget;
use crate::query::buffers::QueryBuffers;
use crate::query::merge::{LoadedTile, MergeStep, Merger};
use crate::stats::Stats;
use crate::Error;

use std::sync::Arc;

/// Budgeted k-way merge reader.
///
/// Tiles of results copied during a submission stay charged until the
/// submission ends, so a pass stops early when the budget is exhausted and
/// the next pass starts with that memory returned.
pub struct GlobalOrderReader {
    schema: Arc<ArraySchema>,
    merger: Merger,
    held: Vec<Arc<LoadedTile>>,
    stats: Arc<Stats>,
}

impl GlobalOrderReader {
    pub fn new(array: &Array, budget: Arc<MemoryBudget>, stats: Arc<Stats>) -> Self {
        let schema = array.schema().clone();
        let merger = Merger::new(
            fragment_readers(array),
            array.timestamp_window(),
            schema.allows_dups,
            read_policy(array),
            budget,
            stats.clone(),
        );
        Self {
            schema,
            merger,
            held: Vec::new(),
            stats,
        }
    }

    fn hold(&mut self, tile: Arc<LoadedTile>) {
        if !self.held.last().is_some_and(|last| Arc::ptr_eq(last, &tile)) {
            self.held.push(tile);
        }
    }
}

impl MergeReader for GlobalOrderReader {
    fn submit(&mut self, buffers: &mut QueryBuffers) -> Result<ReadOutcome> {
        buffers.clear();
        let stats = self.stats.clone();
        let _timer = stats.start_timer("merge");
        let schema = self.schema.clone();

        let outcome = loop {
            let step = self
                .merger
                .next_cell(|entry| buffers.fits(&schema, &entry.tile.tile, entry.cell))?;
            match step {
                MergeStep::Cell(entry) => {
                    buffers.push(&entry.tile.tile, entry.cell);
                    self.hold(entry.tile);
                }
                MergeStep::Rejected => {
                    if buffers.is_empty() {
                        return Err(Error::Query(
                            "result buffers cannot hold a single cell".to_string(),
                        ));
                    }
                    break ReadOutcome::Incomplete;
                }
                MergeStep::Blocked => {
                    if buffers.is_empty() {
                        return Err(Error::Merge(format!(
                            "memory budget of {} bytes cannot hold the tiles needed to progress",
                            self.merger.budget().limit()
                        )));
                    }
                    break ReadOutcome::Incomplete;
                }
                MergeStep::Done => break ReadOutcome::Complete,
            }
        };

        stats.add_counter("cells_emitted", buffers.cell_count() as u64);
        // Results are now owned by the buffers.
        self.held.clear();

        tracing::debug!(
            cells = buffers.cell_count(),
            ?outcome,
            budget_used = self.merger.budget().used(),
            "Global order pass finished"
        );
        Ok(outcome)
    }
}

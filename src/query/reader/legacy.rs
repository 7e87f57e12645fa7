use super::{fragment_readers, read_policy, MergeReader, ReadOutcome};
use crate::array::{Array, ArraySchema, Cell};
use crate::error::Result;
use crate::fragment::FragmentReader;
use crate::query::buffers::QueryBuffers;
use crate::query::merge::DuplicatePolicy;
use crate::stats::Stats;
use crate::Error;

use rayon::prelude::*;
use std::sync::Arc;

/// Materializing reader: loads every visible cell on the first submission,
/// sorts and deduplicates them, then pages through the result. It ignores
/// the memory budget.
pub struct LegacyReader {
    schema: Arc<ArraySchema>,
    fragments: Vec<FragmentReader>,
    window: (u64, u64),
    policy: DuplicatePolicy,
    cells: Option<Vec<Cell>>,
    offset: usize,
    stats: Arc<Stats>,
}

impl LegacyReader {
    pub fn new(array: &Array, stats: Arc<Stats>) -> Self {
        Self {
            schema: array.schema().clone(),
            fragments: fragment_readers(array),
            window: array.timestamp_window(),
            policy: read_policy(array),
            cells: None,
            offset: 0,
            stats,
        }
    }

    fn materialize(&self) -> Result<Vec<Cell>> {
        let _timer = self.stats.start_timer("materialize");
        let (start, end) = self.window;

        let per_fragment = self
            .fragments
            .par_iter()
            .enumerate()
            .map(|(source, reader)| {
                let cells = reader.read_all()?;
                Ok(cells
                    .into_iter()
                    .filter(|c| c.timestamp >= start && c.timestamp <= end)
                    .map(|c| (self.schema.order_key(&c.coords), source, c))
                    .collect::<Vec<_>>())
            })
            .collect::<Result<Vec<_>>>()?;

        let mut all: Vec<(Vec<u8>, usize, Cell)> = per_fragment.into_iter().flatten().collect();
        all.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| b.2.timestamp.cmp(&a.2.timestamp))
                .then_with(|| b.1.cmp(&a.1))
        });
        let total = all.len();
        if self.policy == DuplicatePolicy::LatestWins {
            all.dedup_by(|later, earlier| later.0 == earlier.0);
        }
        self.stats
            .add_counter("dups_discarded", (total - all.len()) as u64);

        Ok(all.into_iter().map(|(_, _, cell)| cell).collect())
    }
}

impl MergeReader for LegacyReader {
    fn submit(&mut self, buffers: &mut QueryBuffers) -> Result<ReadOutcome> {
        buffers.clear();
        if self.cells.is_none() {
            self.cells = Some(self.materialize()?);
        }
        let cells = self.cells.as_deref().unwrap_or_default();

        while let Some(cell) = cells.get(self.offset) {
            if !buffers.fits_values(&cell.values) {
                if buffers.is_empty() {
                    return Err(Error::Query(
                        "result buffers cannot hold a single cell".to_string(),
                    ));
                }
                break;
            }
            buffers.push_values(&cell.coords, &cell.values);
            self.offset += 1;
        }
        self.stats
            .add_counter("cells_emitted", buffers.cell_count() as u64);

        if self.offset < cells.len() {
            Ok(ReadOutcome::Incomplete)
        } else {
            Ok(ReadOutcome::Complete)
        }
    }
}

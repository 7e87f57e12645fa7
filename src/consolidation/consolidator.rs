use super::planner::PlanNode;
use crate::array::ArraySchema;
use crate::error::Result;
use crate::fragment::writer::{commit, write_vacuum_list};
use crate::fragment::{
    remove_best_effort, supports_timestamps, vacuum_list_uri, FragmentName, FragmentReader,
    FragmentWriter,
};
use crate::query::budget::MemoryBudget;
use crate::query::merge::{DuplicatePolicy, MergeStep, Merger};
use crate::stats::Stats;
use crate::Error;

use std::path::PathBuf;
use std::sync::Arc;

/// Merges the fragments of one plan node into a single fragment.
pub struct Consolidator {
    location: PathBuf,
    schema: Arc<ArraySchema>,
    with_timestamps: bool,
    tile_budget: u64,
    stats: Arc<Stats>,
}

impl Consolidator {
    pub fn new(
        location: PathBuf,
        schema: Arc<ArraySchema>,
        with_timestamps: bool,
        tile_budget: u64,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            location,
            schema,
            with_timestamps,
            tile_budget,
            stats,
        }
    }

    /// Write, then publish, the merged fragment. The inputs are never
    /// modified; on failure nothing of the output stays visible.
    pub fn consolidate_node(&self, node: &PlanNode) -> Result<FragmentName> {
        let inputs = node.names();
        let (lo, hi) = node.timestamp_range();
        let version = node.format_version();
        let name = FragmentName::new(lo, hi, version);
        let with_timestamps = self.with_timestamps && supports_timestamps(version);

        tracing::info!(
            array = %self.location.display(),
            fragments = inputs.len(),
            output = %name,
            with_timestamps,
            "Starting consolidation"
        );

        let mut writer =
            FragmentWriter::create(&self.location, &self.schema, name.clone(), with_timestamps)
                .map_err(|e| Error::consolidation(labels(&inputs).as_slice(), e))?;
        let uri = writer.uri().to_path_buf();

        let written = (|| -> Result<_> {
            self.merge_into(node, &mut writer, with_timestamps)?;
            let metadata = writer.finalize()?;
            write_vacuum_list(&self.location, &name, &inputs)?;
            commit(&self.location, &name)?;
            Ok(metadata)
        })();

        let metadata = match written {
            Ok(metadata) => metadata,
            Err(e) => {
                remove_best_effort(&uri);
                remove_best_effort(&vacuum_list_uri(&self.location, &name));
                return Err(Error::consolidation(labels(&inputs).as_slice(), e));
            }
        };

        self.stats.add_counter("nodes", 1);
        self.stats
            .add_counter("fragments_consolidated", inputs.len() as u64);
        self.stats.add_counter("cells_written", metadata.cell_count);
        tracing::info!(
            array = %self.location.display(),
            output = %name,
            cells = metadata.cell_count,
            "Completed consolidation"
        );
        Ok(name)
    }

    fn merge_into(
        &self,
        node: &PlanNode,
        writer: &mut FragmentWriter,
        with_timestamps: bool,
    ) -> Result<()> {
        // Per-cell timestamps keep every version so reads can still be cut
        // to any window inside the output range.
        let policy = if with_timestamps || self.schema.allows_dups {
            DuplicatePolicy::KeepAll
        } else {
            DuplicatePolicy::LatestWins
        };
        let readers = node
            .fragments
            .iter()
            .map(|f| FragmentReader::new(f.uri.clone(), self.schema.clone(), f.metadata.clone()))
            .collect();
        let mut merger = Merger::new(
            readers,
            (0, u64::MAX),
            self.schema.allows_dups,
            policy,
            MemoryBudget::new(self.tile_budget),
            self.stats.clone(),
        );

        loop {
            match merger.next_cell(|_| true)? {
                MergeStep::Cell(entry) => writer.append(entry.tile.tile.cell(entry.cell))?,
                MergeStep::Done => return Ok(()),
                MergeStep::Blocked | MergeStep::Rejected => {
                    return Err(Error::Merge(format!(
                        "memory budget of {} bytes cannot hold one tile of every input",
                        self.tile_budget
                    )))
                }
            }
        }
    }
}

fn labels(names: &[FragmentName]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

//! Read queries with incomplete-result resumption.
//!
//! ```text
//!                 submit            submit (all results delivered)
//!  Uninitialized ────────> InProgress ─────────────────────────> Complete
//!                            ^    │
//!             resubmit       │    │ buffers full / memory budget reached
//!             (loop_num+1)   │    v
//!                           Incomplete
//!
//!  any error ──> Failed (terminal)
//! ```
//!
//! Each submission clears the result buffers and refills them from where the
//! previous submission stopped.

pub mod budget;
pub mod buffers;
pub mod merge;
pub mod reader;

use crate::array::{decode_values, Array, FixedValue, OpenMode};
use crate::config::ReaderKind;
use crate::error::Result;
use crate::stats::Stats;
use crate::Error;

use budget::MemoryBudget;
use buffers::QueryBuffers;
use reader::{GlobalOrderReader, LegacyReader, MergeReader, ReadOutcome};

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    Uninitialized,
    InProgress,
    Complete,
    Incomplete,
    Failed,
}

pub struct Query<'a> {
    array: &'a Array,
    buffers: QueryBuffers,
    reader: Option<Box<dyn MergeReader + 'a>>,
    status: QueryStatus,
    loop_num: u64,
    stats: Arc<Stats>,
    reader_stats: Arc<Stats>,
}

impl<'a> Query<'a> {
    pub fn new(array: &'a Array) -> Result<Self> {
        if array.mode() != OpenMode::Read {
            return Err(Error::InvalidOperation(
                "queries need an array opened for reading".to_string(),
            ));
        }
        let stats = array.context().storage_stats().child("Query");
        let reader_stats = stats.child("Reader");
        Ok(Self {
            array,
            buffers: QueryBuffers::default(),
            reader: None,
            status: QueryStatus::Uninitialized,
            loop_num: 0,
            stats,
            reader_stats,
        })
    }

    /// Register a result buffer of `capacity` bytes for a dimension or attribute.
    pub fn set_data_buffer(&mut self, name: &str, capacity: usize) -> Result<()> {
        self.check_configurable()?;
        self.buffers
            .set_data_buffer(self.array.schema(), name, capacity)
    }

    /// Register an offsets buffer of `capacity` bytes for a var-sized attribute.
    pub fn set_offsets_buffer(&mut self, name: &str, capacity: usize) -> Result<()> {
        self.check_configurable()?;
        self.buffers
            .set_offsets_buffer(self.array.schema(), name, capacity)
    }

    fn check_configurable(&self) -> Result<()> {
        if self.status != QueryStatus::Uninitialized {
            return Err(Error::Query(
                "buffers cannot change after the first submission".to_string(),
            ));
        }
        Ok(())
    }

    pub fn submit(&mut self) -> Result<QueryStatus> {
        match self.status {
            QueryStatus::Complete => {
                return Err(Error::Query("query is already complete".to_string()))
            }
            QueryStatus::Failed => {
                return Err(Error::Query("query has failed".to_string()))
            }
            QueryStatus::Incomplete => {
                self.loop_num += 1;
                self.reader_stats.add_counter("loop_num", 1);
            }
            QueryStatus::Uninitialized | QueryStatus::InProgress => {}
        }
        self.status = QueryStatus::InProgress;

        match self.run() {
            Ok(outcome) => {
                self.status = match outcome {
                    ReadOutcome::Complete => QueryStatus::Complete,
                    ReadOutcome::Incomplete => QueryStatus::Incomplete,
                };
                tracing::debug!(
                    array = %self.array.location().display(),
                    status = ?self.status,
                    cells = self.buffers.cell_count(),
                    loop_num = self.loop_num,
                    "Query submitted"
                );
                Ok(self.status)
            }
            Err(e) => {
                self.status = QueryStatus::Failed;
                let array = self.array.location().display();
                tracing::warn!(array = %array, error = %e, "Query failed");
                Err(e)
            }
        }
    }

    fn run(&mut self) -> Result<ReadOutcome> {
        let _timer = self.stats.start_timer("submit");
        if self.reader.is_none() {
            self.buffers.validate(self.array.schema())?;
            self.reader = Some(self.make_reader());
        }
        match self.reader.as_mut() {
            Some(reader) => reader.submit(&mut self.buffers),
            None => Err(Error::Query("query has no reader".to_string())),
        }
    }

    fn make_reader(&self) -> Box<dyn MergeReader + 'a> {
        let config = self.array.context().config();
        match config.reader {
            ReaderKind::GlobalOrder => {
                let budget = MemoryBudget::new(config.tile_budget());
                Box::new(GlobalOrderReader::new(
                    self.array,
                    budget,
                    self.reader_stats.clone(),
                ))
            }
            ReaderKind::Legacy => {
                Box::new(LegacyReader::new(self.array, self.reader_stats.clone()))
            }
        }
    }

    pub fn status(&self) -> QueryStatus {
        self.status
    }

    /// Number of times an incomplete query was resubmitted.
    pub fn loop_num(&self) -> u64 {
        self.loop_num
    }

    pub fn array(&self) -> &Array {
        self.array
    }

    /// Results of the last submission.
    pub fn results(&self) -> QueryResults<'_> {
        QueryResults {
            buffers: &self.buffers,
        }
    }

    /// JSON dump of this query's counters and timers.
    pub fn stats(&self) -> String {
        self.stats.dump_string()
    }
}

/// Typed view over the buffers filled by the last submission.
pub struct QueryResults<'q> {
    buffers: &'q QueryBuffers,
}

impl<'q> QueryResults<'q> {
    pub fn cell_num(&self) -> usize {
        self.buffers.cell_count()
    }

    pub fn data(&self, name: &str) -> Result<&'q [u8]> {
        Ok(self.buffer(name)?.data())
    }

    /// Fixed-size values of `name`; dimensions decode as `u64`.
    pub fn values<V: FixedValue>(&self, name: &str) -> Result<Vec<V>> {
        Ok(decode_values(self.data(name)?))
    }

    pub fn offsets(&self, name: &str) -> Result<&'q [u64]> {
        self.buffer(name)?
            .offsets()
            .ok_or_else(|| Error::Query(format!("{} has no offsets buffer", name)))
    }

    /// Per-cell byte slices of a var-sized attribute.
    pub fn var_values(&self, name: &str) -> Result<Vec<&'q [u8]>> {
        let data = self.data(name)?;
        let offsets = self.offsets(name)?;
        let ends = offsets
            .iter()
            .skip(1)
            .map(|&o| o as usize)
            .chain(std::iter::once(data.len()));
        Ok(offsets
            .iter()
            .zip(ends)
            .map(|(&start, end)| &data[start as usize..end])
            .collect())
    }

    fn buffer(&self, name: &str) -> Result<&'q buffers::FieldBuffer> {
        self.buffers
            .field(name)
            .ok_or_else(|| Error::Query(format!("no buffer set for {}", name)))
    }
}

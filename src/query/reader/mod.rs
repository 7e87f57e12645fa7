//! Read strategies behind one interface.
//!
//! Both strategies fill [`QueryBuffers`] in global order, stop when the
//! buffers are full, and resume exactly where they stopped on the next
//! submission. Only [`GlobalOrderReader`] bounds memory.

pub mod global_order;
pub mod legacy;

pub use global_order::GlobalOrderReader;
pub use legacy::LegacyReader;

use super::buffers::QueryBuffers;
use super::merge::DuplicatePolicy;
use crate::array::Array;
use crate::error::Result;
use crate::fragment::FragmentReader;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Every result has been delivered.
    Complete,
    /// Buffers or memory ran out; submit again for more.
    Incomplete,
}

pub trait MergeReader: Send {
    /// Clear `buffers` and fill them with the next results.
    fn submit(&mut self, buffers: &mut QueryBuffers) -> Result<ReadOutcome>;
}

/// Readers for every visible fragment, in directory order.
pub fn fragment_readers(array: &Array) -> Vec<FragmentReader> {
    array
        .directory()
        .fragments()
        .iter()
        .map(|f| FragmentReader::new(f.uri.clone(), array.schema().clone(), f.metadata.clone()))
        .collect()
}

pub fn read_policy(array: &Array) -> DuplicatePolicy {
    if array.schema().allows_dups {
        DuplicatePolicy::KeepAll
    } else {
        DuplicatePolicy::LatestWins
    }
}

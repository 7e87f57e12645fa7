//! K-way merge of fragments in global order.
//!
//! Each fragment contributes a cursor that walks its tiles and yields cells
//! inside the read window. The current head of every cursor sits in a binary
//! heap ordered by
//!
//! 1. order key, ascending
//! 2. timestamp, descending
//! 3. fragment index, descending (a later fragment wins a tie)
//!
//! so the first cell popped for a coordinate is its newest version. With
//! [`DuplicatePolicy::LatestWins`] every later cell with the same key is
//! discarded. Fragments store equal coordinates newest first, which keeps this
//! true even when one fragment holds several versions of a coordinate.
//!
//! Tiles are charged to a [`MemoryBudget`] before they are decoded. When a
//! cursor cannot get the memory for its next tile it becomes *pending* and
//! the merge stops popping: any cell that cursor holds might sort before the
//! current heap top. The caller releases memory (by handing out accepted
//! results) and calls again.

use super::budget::{MemoryBudget, Reservation};
use crate::encoding::format::OrderKey;
use crate::error::Result;
use crate::fragment::{FragmentReader, Tile};
use crate::stats::Stats;
use crate::Error;

use rayon::prelude::*;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// Emit every cell, including several versions of one coordinate.
    KeepAll,
    /// Emit only the newest version of each coordinate.
    LatestWins,
}

/// A decoded tile and the memory charged for it.
#[derive(Debug)]
pub struct LoadedTile {
    pub tile: Tile,
    _reservation: Reservation,
}

pub struct HeapEntry {
    pub key: Vec<u8>,
    pub timestamp: u64,
    pub source: usize,
    pub tile: Arc<LoadedTile>,
    pub cell: usize,
}

impl std::fmt::Debug for HeapEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapEntry")
            .field("key", &self.key)
            .field("timestamp", &self.timestamp)
            .field("source", &self.source)
            .field("cell", &self.cell)
            .finish()
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap pops the greatest entry, so the key comparison is reversed.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .key
            .cmp(&self.key)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.source.cmp(&other.source))
    }
}

enum Advance {
    Ready(HeapEntry),
    Blocked,
    Exhausted,
}

struct FragmentCursor {
    source: usize,
    reader: FragmentReader,
    window: (u64, u64),
    allow_equal_keys: bool,
    next_tile: usize,
    tile: Option<Arc<LoadedTile>>,
    position: usize,
    last_key: Option<Vec<u8>>,
    pending: bool,
}

impl FragmentCursor {
    fn new(source: usize, reader: FragmentReader, window: (u64, u64), allows_dups: bool) -> Self {
        let allow_equal_keys = allows_dups || reader.metadata().has_timestamps;
        Self {
            source,
            reader,
            window,
            allow_equal_keys,
            next_tile: 0,
            tile: None,
            position: 0,
            last_key: None,
            pending: false,
        }
    }

    /// Charge the next tile if the cursor needs one and memory allows.
    fn reserve_next(&self, budget: &Arc<MemoryBudget>) -> Option<Reservation> {
        if self.tile.is_some() || self.next_tile >= self.reader.tile_count() {
            return None;
        }
        budget.try_reserve(self.reader.tile_meta(self.next_tile).memory_size)
    }

    fn load_reserved(&mut self, reservation: Reservation, stats: &Stats) -> Result<()> {
        let tile = self.reader.load_tile(self.next_tile)?;
        stats.add_counter("tiles_loaded", 1);
        self.tile = Some(Arc::new(LoadedTile {
            tile,
            _reservation: reservation,
        }));
        self.next_tile += 1;
        self.position = 0;
        Ok(())
    }

    /// Move to the next cell inside the window.
    fn advance(&mut self, budget: &Arc<MemoryBudget>, stats: &Stats) -> Result<Advance> {
        loop {
            let Some(loaded) = self.tile.clone() else {
                if self.next_tile >= self.reader.tile_count() {
                    self.pending = false;
                    return Ok(Advance::Exhausted);
                }
                match self.reserve_next(budget) {
                    Some(reservation) => self.load_reserved(reservation, stats)?,
                    None => {
                        self.pending = true;
                        return Ok(Advance::Blocked);
                    }
                }
                continue;
            };
            self.pending = false;

            let tile = &loaded.tile;
            while self.position < tile.cell_count() {
                let cell = self.position;
                self.position += 1;
                self.check_order(tile, cell)?;

                let timestamp = tile.timestamp(cell);
                if timestamp < self.window.0 || timestamp > self.window.1 {
                    stats.add_counter("cells_filtered", 1);
                    continue;
                }
                if self.position == tile.cell_count() {
                    self.tile = None;
                }
                return Ok(Advance::Ready(HeapEntry {
                    key: tile.key(cell).to_vec(),
                    timestamp,
                    source: self.source,
                    tile: loaded.clone(),
                    cell,
                }));
            }
            self.tile = None;
        }
    }

    fn check_order(&mut self, tile: &Tile, cell: usize) -> Result<()> {
        let key = tile.key(cell);
        if let Some(last) = &self.last_key {
            let in_order = if self.allow_equal_keys {
                key >= last.as_slice()
            } else {
                key > last.as_slice()
            };
            if !in_order {
                return Err(Error::out_of_order(self.reader.uri(), &tile.coords(cell)));
            }
        }
        match &mut self.last_key {
            Some(last) => {
                last.clear();
                last.extend_from_slice(key);
            }
            None => self.last_key = Some(key.to_vec()),
        }
        Ok(())
    }
}

pub enum MergeStep {
    /// The next cell in global order.
    Cell(HeapEntry),
    /// The next cell was refused by the caller and stays queued.
    Rejected,
    /// A cursor needs memory that is still held.
    Blocked,
    /// Every cursor is exhausted.
    Done,
}

pub struct Merger {
    cursors: Vec<FragmentCursor>,
    heap: BinaryHeap<HeapEntry>,
    budget: Arc<MemoryBudget>,
    policy: DuplicatePolicy,
    last_emitted: Option<Vec<u8>>,
    started: bool,
    key_format: OrderKey,
    stats: Arc<Stats>,
}

impl Merger {
    /// `fragments` must be in directory order: a later fragment is newer.
    pub fn new(
        fragments: Vec<FragmentReader>,
        window: (u64, u64),
        allows_dups: bool,
        policy: DuplicatePolicy,
        budget: Arc<MemoryBudget>,
        stats: Arc<Stats>,
    ) -> Self {
        let dims = fragments
            .first()
            .map_or(0, |f| f.metadata().non_empty_domain.len());
        let cursors = fragments
            .into_iter()
            .enumerate()
            .map(|(source, reader)| FragmentCursor::new(source, reader, window, allows_dups))
            .collect();
        Self {
            cursors,
            heap: BinaryHeap::new(),
            budget,
            policy,
            last_emitted: None,
            started: false,
            key_format: OrderKey::new(dims),
            stats,
        }
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Decode the first tile of every fragment in parallel, then seed the heap.
    fn start(&mut self) -> Result<()> {
        let budget = &self.budget;
        let stats = &self.stats;
        let mut jobs = Vec::new();
        for cursor in self.cursors.iter_mut() {
            if let Some(reservation) = cursor.reserve_next(budget) {
                jobs.push((cursor, reservation));
            }
        }
        jobs.into_par_iter()
            .map(|(cursor, reservation)| cursor.load_reserved(reservation, stats))
            .collect::<Result<Vec<()>>>()?;

        for i in 0..self.cursors.len() {
            self.refill(i)?;
        }
        self.started = true;
        Ok(())
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        if let Advance::Ready(entry) = self.cursors[source].advance(&self.budget, &self.stats)? {
            self.heap.push(entry);
        }
        Ok(())
    }

    fn retry_pending(&mut self) -> Result<bool> {
        for i in 0..self.cursors.len() {
            if self.cursors[i].pending {
                self.refill(i)?;
                if self.cursors[i].pending {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Produce the next cell, offering it to `accept` first. A refused cell
    /// stays at the head of the merge.
    pub fn next_cell(&mut self, mut accept: impl FnMut(&HeapEntry) -> bool) -> Result<MergeStep> {
        if !self.started {
            self.start()?;
        }

        loop {
            if !self.retry_pending()? {
                self.stats.add_counter("budget_stalls", 1);
                return Ok(MergeStep::Blocked);
            }
            let Some(entry) = self.heap.pop() else {
                return Ok(MergeStep::Done);
            };

            if self.policy == DuplicatePolicy::LatestWins
                && self.last_emitted.as_deref() == Some(entry.key.as_slice())
            {
                self.stats.add_counter("dups_discarded", 1);
                self.refill(entry.source)?;
                continue;
            }

            if !accept(&entry) {
                self.heap.push(entry);
                return Ok(MergeStep::Rejected);
            }

            self.refill(entry.source)?;
            match &mut self.last_emitted {
                Some(last) => {
                    last.clear();
                    last.extend_from_slice(&entry.key);
                }
                None => self.last_emitted = Some(entry.key.clone()),
            }
            tracing::trace!(
                key = %self.key_format.format(&entry.key),
                ts = entry.timestamp,
                source = entry.source,
                "Merged cell"
            );
            return Ok(MergeStep::Cell(entry));
        }
    }
}

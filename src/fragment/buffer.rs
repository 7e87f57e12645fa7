//! In-memory write buffer.
//!
//! Cells handed to a write arrive in any order; fragments must store them in
//! global order. The buffer keeps cells in a `crossbeam-skiplist::SkipMap`
//! keyed by `(order key, arrival sequence)` so draining it yields global
//! order, with duplicates of one coordinate kept in arrival order.

use crate::array::{ArraySchema, Cell, CellSize};
use crate::error::Result;
use crate::Error;

use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
pub struct WriteBuffer {
    schema: Arc<ArraySchema>,
    data: SkipMap<(Vec<u8>, u64), Cell>,
    next_seq: AtomicU64,
    size: AtomicUsize,
}

impl WriteBuffer {
    pub fn new(schema: Arc<ArraySchema>) -> Self {
        Self {
            schema,
            data: SkipMap::new(),
            next_seq: AtomicU64::new(0),
            size: AtomicUsize::new(0),
        }
    }

    /// Validate and buffer one cell.
    pub fn insert(&self, cell: Cell) -> Result<()> {
        self.schema.check_coords(&cell.coords)?;
        self.check_values(&cell)?;

        let key = self.schema.order_key(&cell.coords);
        if !self.schema.allows_dups && self.contains(&key) {
            return Err(Error::InvalidOperation(format!(
                "duplicate coordinates {:?} in a write to an array without duplicates",
                cell.coords
            )));
        }

        let entry_size = key.len() + cell.values.iter().map(Vec::len).sum::<usize>();
        self.size.fetch_add(entry_size, Ordering::SeqCst);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.data.insert((key, seq), cell);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Approximate bytes buffered.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Buffered cells with their order keys, in global order.
    pub fn drain_sorted(self) -> Vec<(Vec<u8>, Cell)> {
        self.data
            .into_iter()
            .map(|((key, _seq), cell)| (key, cell))
            .collect()
    }

    fn contains(&self, key: &[u8]) -> bool {
        let start = (key.to_vec(), 0);
        let end = (key.to_vec(), u64::MAX);
        self.data.range(start..=end).next().is_some()
    }

    fn check_values(&self, cell: &Cell) -> Result<()> {
        if cell.values.len() != self.schema.attribute_num() {
            return Err(Error::InvalidOperation(format!(
                "cell {:?} has {} values for {} attributes",
                cell.coords,
                cell.values.len(),
                self.schema.attribute_num()
            )));
        }
        for (attr, value) in self.schema.attributes.iter().zip(&cell.values) {
            if let CellSize::Fixed(size) = attr.cell_size {
                if value.len() != size as usize {
                    return Err(Error::InvalidOperation(format!(
                        "attribute {} expects {} bytes, got {}",
                        attr.name,
                        size,
                        value.len()
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::schema::tests::test_schema;

    #[test]
    fn test_drain_in_global_order() {
        let buffer = WriteBuffer::new(Arc::new(test_schema()));
        for (coords, v) in [([3u64, 1u64], 1i32), ([1, 4], 2), ([1, 1], 3), ([2, 2], 4)] {
            buffer.insert(Cell::new(coords.to_vec()).with_value(v)).unwrap();
        }
        assert_eq!(buffer.len(), 4);

        let coords: Vec<Vec<u64>> = buffer
            .drain_sorted()
            .into_iter()
            .map(|(_, cell)| cell.coords)
            .collect();
        assert_eq!(coords, vec![vec![1, 1], vec![2, 2], vec![1, 4], vec![3, 1]]);
    }

    #[test]
    fn test_duplicates_rejected_without_dups() {
        let buffer = WriteBuffer::new(Arc::new(test_schema()));
        buffer.insert(Cell::new(vec![1, 1]).with_value(1i32)).unwrap();
        let err = buffer
            .insert(Cell::new(vec![1, 1]).with_value(2i32))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_duplicates_keep_arrival_order_with_dups() {
        let buffer = WriteBuffer::new(Arc::new(test_schema().with_allows_dups(true)));
        buffer.insert(Cell::new(vec![2, 2]).with_value(1i32)).unwrap();
        buffer.insert(Cell::new(vec![1, 1]).with_value(2i32)).unwrap();
        buffer.insert(Cell::new(vec![2, 2]).with_value(3i32)).unwrap();

        let values: Vec<Vec<u8>> = buffer
            .drain_sorted()
            .into_iter()
            .map(|(_, cell)| cell.values[0].clone())
            .collect();
        let expected: Vec<Vec<u8>> =
            [2i32, 1, 3].iter().map(|v| v.to_le_bytes().to_vec()).collect();
        assert_eq!(values, expected);
    }

    #[test]
    fn test_value_validation() {
        let buffer = WriteBuffer::new(Arc::new(test_schema()));
        assert!(buffer.insert(Cell::new(vec![1, 1])).is_err());
        assert!(buffer
            .insert(Cell::new(vec![1, 1]).with_value(1u64))
            .is_err());
        assert!(buffer
            .insert(Cell::new(vec![9, 1]).with_value(1i32))
            .is_err());
        assert!(buffer.is_empty());
    }
}

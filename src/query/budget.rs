use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bytes of decoded tile data one query may hold.
///
/// Charges are taken before a tile is decoded and returned when the last
/// [`Reservation`] for it is dropped, so memory stays charged for as long as
/// any cursor, heap entry, or not-yet-copied result refers to the tile.
#[derive(Debug)]
pub struct MemoryBudget {
    limit: u64,
    used: AtomicU64,
}

impl MemoryBudget {
    pub fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            limit,
            used: AtomicU64::new(0),
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Self::new(u64::MAX)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    /// Charge `bytes`, or return `None` if that would exceed the limit.
    pub fn try_reserve(self: &Arc<Self>, bytes: u64) -> Option<Reservation> {
        self.used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|total| *total <= self.limit)
            })
            .ok()
            .map(|_| Reservation {
                budget: self.clone(),
                bytes,
            })
    }
}

/// A charge against a [`MemoryBudget`], returned on drop.
#[derive(Debug)]
pub struct Reservation {
    budget: Arc<MemoryBudget>,
    bytes: u64,
}

impl Reservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let budget = MemoryBudget::new(1000);
        let first = budget.try_reserve(400).unwrap();
        let second = budget.try_reserve(400).unwrap();
        assert_eq!(budget.used(), 800);
        assert!(budget.try_reserve(400).is_none());

        drop(first);
        assert_eq!(budget.used(), 400);
        let third = budget.try_reserve(600).unwrap();
        assert_eq!(budget.used(), 1000);

        drop(second);
        drop(third);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn test_unlimited_never_overflows() {
        let budget = MemoryBudget::unlimited();
        let _a = budget.try_reserve(u64::MAX - 1).unwrap();
        assert!(budget.try_reserve(2).is_none());
        assert!(budget.try_reserve(1).is_some());
    }
}

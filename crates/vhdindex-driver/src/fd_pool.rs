//! The backing fd pool: bookkeeping for which `file_id`s currently hold a
//! direct-I/O descriptor open, with reference counting and LRU eviction.
//! Actually opening and reading the file is the host's job (see
//! [`crate::DriverHost`]); this pool only tracks occupancy.

use vhdindex_core::{Error, Result};

/// Number of concurrently open backing-file descriptors.
pub const FILE_POOL_SIZE: usize = 12;

struct Slot {
    file_id: Option<u32>,
    refcount: u32,
    seq: u32,
}

impl Slot {
    fn empty() -> Self {
        Slot { file_id: None, refcount: 0, seq: 0 }
    }
}

/// Fixed-size LRU pool of backing-file slots. Slot 0 is reserved and never
/// evicted or handed out by eviction — preserved legacy behavior (see
/// `DESIGN.md`).
pub struct FdPool {
    slots: [Slot; FILE_POOL_SIZE],
    clock: u32,
}

impl Default for FdPool {
    fn default() -> Self {
        FdPool {
            slots: std::array::from_fn(|_| Slot::empty()),
            clock: 0,
        }
    }
}

impl FdPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn tick(&mut self) -> u32 {
        if self.clock == u32::MAX {
            for slot in &mut self.slots {
                slot.seq >>= 1;
            }
            self.clock >>= 1;
        }
        self.clock += 1;
        self.clock
    }

    /// Acquire a reference to `file_id`'s slot, opening (bookkeeping-wise)
    /// a new one if not already resident. Returns the slot index.
    pub fn acquire(&mut self, file_id: u32) -> Result<usize> {
        if let Some(idx) = self.slots.iter().position(|s| s.file_id == Some(file_id)) {
            let seq = self.tick();
            self.slots[idx].seq = seq;
            self.slots[idx].refcount += 1;
            return Ok(idx);
        }

        let free = self.slots.iter().position(|s| s.file_id.is_none());
        let idx = if let Some(idx) = free {
            idx
        } else {
            // Slot 0 is reserved: the LRU scan starts at index 1.
            self.slots[1..]
                .iter()
                .enumerate()
                .filter(|(_, s)| s.refcount == 0)
                .min_by_key(|(_, s)| s.seq)
                .map(|(i, _)| i + 1)
                .ok_or_else(|| Error::busy("fd pool fully pinned"))?
        };

        let seq = self.tick();
        self.slots[idx] = Slot { file_id: Some(file_id), refcount: 1, seq };
        Ok(idx)
    }

    /// Drop one reference on the slot at `idx`.
    pub fn release(&mut self, idx: usize) {
        if self.slots[idx].refcount > 0 {
            self.slots[idx].refcount -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_zero_survives_eviction_pressure() {
        let mut pool = FdPool::new();

        // First acquire lands in slot 0, the first free slot.
        let slot0 = pool.acquire(100).unwrap();
        assert_eq!(slot0, 0);
        pool.release(slot0);

        // Fill the remaining 11 slots and release them too, so every slot
        // is refcount == 0 and eligible for eviction except slot 0.
        for file_id in 1..FILE_POOL_SIZE as u32 {
            let idx = pool.acquire(file_id).unwrap();
            pool.release(idx);
        }

        // Pool is full; this acquire must evict something from slots[1..],
        // never slot 0.
        pool.acquire(999).unwrap();

        // file_id 100 is still resident at slot 0, proving it wasn't evicted.
        assert_eq!(pool.acquire(100).unwrap(), 0);
    }
}

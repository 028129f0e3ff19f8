//! The metadata cache: up to [`CACHE_SIZE`] decoded index blocks, each
//! either absent, awaiting its metadata read, or holding decoded entries
//! with a FIFO of waiters queued on the pending read.

use std::collections::VecDeque;

use vhdindex_core::{Error, Result};

/// Number of index blocks the driver keeps decoded at once.
pub const CACHE_SIZE: usize = 4;

/// One decoded `.index` entry: an owning file and its byte offset within
/// that file, or [`vhdindex_core::UNUSED`] for "not yet indexed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub file_id: u32,
    pub offset: u32,
}

impl Entry {
    pub fn is_unused(&self) -> bool {
        self.offset == vhdindex_core::UNUSED
    }
}

/// A request slice queued on a block still awaiting its metadata read.
#[derive(Debug, Clone, Copy)]
pub struct Waiter {
    pub buf: u64,
    pub sec: u64,
    pub secs: u32,
}

enum SlotState {
    Empty,
    Loading { waiters: VecDeque<Waiter> },
    Ready { entries: Vec<Entry> },
}

struct Slot {
    blk: Option<usize>,
    seq: u32,
    state: SlotState,
}

impl Slot {
    fn empty() -> Self {
        Slot { blk: None, seq: 0, state: SlotState::Empty }
    }
}

pub enum Lookup {
    Ready,
    Loading,
}

/// Fixed-size LRU cache of decoded index blocks.
pub struct MetadataCache {
    slots: [Slot; CACHE_SIZE],
    clock: u32,
}

impl Default for MetadataCache {
    fn default() -> Self {
        MetadataCache { slots: [Slot::empty(), Slot::empty(), Slot::empty(), Slot::empty()], clock: 0 }
    }
}

impl MetadataCache {
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

    /// Find `blk`'s slot, if present (in any state), touching its LRU seq.
    pub fn find(&mut self, blk: usize) -> Option<Lookup> {
        let idx = self.slots.iter().position(|s| s.blk == Some(blk))?;
        let seq = self.tick();
        self.slots[idx].seq = seq;
        match self.slots[idx].state {
            SlotState::Ready { .. } => Some(Lookup::Ready),
            SlotState::Loading { .. } => Some(Lookup::Loading),
            SlotState::Empty => None,
        }
    }

    fn slot_index(&self, blk: usize) -> Option<usize> {
        self.slots.iter().position(|s| s.blk == Some(blk))
    }

    /// Install a fresh `Loading` slot for `blk`, evicting the least-recent
    /// non-`Loading` slot if the cache is full. Returns `BusyExhaustion`
    /// when every slot is pinned by a pending read.
    pub fn install_loading(&mut self, blk: usize) -> Result<()> {
        let candidate = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !matches!(s.state, SlotState::Loading { .. }))
            .min_by_key(|(_, s)| s.seq)
            .map(|(i, _)| i);

        let idx = candidate.ok_or_else(|| Error::busy("metadata cache fully pinned"))?;
        let seq = self.tick();
        self.slots[idx] = Slot { blk: Some(blk), seq, state: SlotState::Loading { waiters: VecDeque::new() } };
        Ok(())
    }

    pub fn push_waiter(&mut self, blk: usize, waiter: Waiter) {
        let idx = self.slot_index(blk).expect("waiter pushed on absent block");
        match &mut self.slots[idx].state {
            SlotState::Loading { waiters } => waiters.push_back(waiter),
            _ => panic!("waiter pushed on non-loading block"),
        }
    }

    pub fn ready_entries(&self, blk: usize) -> &[Entry] {
        let idx = self.slot_index(blk).expect("ready_entries on absent block");
        match &self.slots[idx].state {
            SlotState::Ready { entries } => entries,
            _ => panic!("ready_entries on non-ready block"),
        }
    }

    /// Mark `blk` `Ready` with `entries`, returning its drained waiters in
    /// FIFO order.
    pub fn complete_ready(&mut self, blk: usize, entries: Vec<Entry>) -> Vec<Waiter> {
        let idx = self.slot_index(blk).expect("complete_ready on absent block");
        let waiters = match std::mem::replace(&mut self.slots[idx].state, SlotState::Empty) {
            SlotState::Loading { waiters } => waiters,
            other => {
                self.slots[idx].state = other;
                VecDeque::new()
            }
        };
        self.slots[idx].state = SlotState::Ready { entries };
        waiters.into_iter().collect()
    }

    /// Fail `blk`'s pending read, returning its drained waiters in FIFO
    /// order and leaving the slot `Empty`.
    pub fn fail_pending(&mut self, blk: usize) -> Vec<Waiter> {
        let idx = self.slot_index(blk).expect("fail_pending on absent block");
        let waiters = match std::mem::replace(&mut self.slots[idx].state, SlotState::Empty) {
            SlotState::Loading { waiters } => waiters,
            other => {
                self.slots[idx].state = other;
                VecDeque::new()
            }
        };
        self.slots[idx].blk = None;
        waiters.into_iter().collect()
    }
}

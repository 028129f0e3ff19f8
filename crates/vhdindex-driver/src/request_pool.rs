//! Fixed pool of in-flight request descriptors: one per data read the
//! driver has submitted downstream but not yet completed.

use vhdindex_core::{Error, Result};

/// Matches the tapdisk request budget this driver is sized against: the
/// usual in-flight data-request allowance plus one slot per cache block
/// that might be replaying queued waiters concurrently.
pub const TAPDISK_DATA_REQUESTS: usize = 60;

pub const REQUEST_POOL_SIZE: usize = TAPDISK_DATA_REQUESTS + crate::cache::CACHE_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct Descriptor {
    pub buf: u64,
    pub sec: u64,
    pub secs: u32,
    pub fd_slot: usize,
}

#[derive(Default)]
pub struct RequestPool {
    slots: Vec<Option<Descriptor>>,
    free: Vec<usize>,
}

impl RequestPool {
    pub fn new() -> Self {
        let slots = vec![None; REQUEST_POOL_SIZE];
        let free = (0..REQUEST_POOL_SIZE).rev().collect();
        RequestPool { slots, free }
    }

    pub fn alloc(&mut self, descriptor: Descriptor) -> Result<usize> {
        let idx = self.free.pop().ok_or_else(|| Error::busy("request descriptor pool exhausted"))?;
        self.slots[idx] = Some(descriptor);
        Ok(idx)
    }

    pub fn take(&mut self, idx: usize) -> Descriptor {
        let descriptor = self.slots[idx].take().expect("double-complete of request descriptor");
        self.free.push(idx);
        descriptor
    }
}

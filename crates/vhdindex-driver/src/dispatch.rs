//! The read-dispatch state machine (§4.E): given `(buf, sec, n)`, walk the
//! BAT, the metadata cache, and the fd/request pools to either forward a
//! sparse range upstream, issue a direct-I/O read, or queue behind a
//! pending metadata fetch.

use tracing::{debug, error, warn};
use vhdindex_core::{Error, Result};
use vhdindex_format::be::read_u32;

use crate::cache::{Entry, Lookup, MetadataCache, Waiter};
use crate::fd_pool::FdPool;
use crate::request_pool::{Descriptor, RequestPool};

/// Callbacks the driver uses to reach outside itself: forwarding sparse
/// ranges upstream, completing caller requests, and submitting the async
/// I/O that eventually calls back into [`Driver::complete_meta_read`] /
/// [`Driver::complete_data_read`]. The event loop that actually drives
/// those completions is out of scope here (§9); tests drive it directly.
pub trait DriverHost {
    /// Forward a clamped `(buf, sec, secs)` slice to whatever is layered
    /// behind this driver (the block isn't indexed, or its entry is empty).
    fn forward_upstream(&mut self, buf: u64, sec: u64, secs: u32);

    /// Complete the caller's original request (or its remaining slice) with
    /// `result`.
    fn complete(&mut self, buf: u64, sec: u64, secs: u32, result: Result<()>);

    /// Submit an async metadata read of `byte_len` bytes at `index_sector`
    /// within `.index`. The host calls [`Driver::complete_meta_read`] with
    /// `token` once it resolves.
    fn submit_meta_read(&mut self, token: u64, index_sector: u32, byte_len: usize);

    /// Submit an async direct-I/O data read from `file_id` at byte
    /// `offset`, `secs` sectors, landing at `buf`. The host calls
    /// [`Driver::complete_data_read`] with `token` once it resolves.
    fn submit_data_read(&mut self, token: u64, file_id: u32, offset: u32, buf: u64, sec: u64, secs: u32);
}

/// One child VHD's read path: its per-block BAT (sector offsets into
/// `.index`, 0 meaning "not indexed") and its block geometry.
pub struct Driver {
    bat: Vec<u32>,
    spb: u32,
    cache: MetadataCache,
    fds: FdPool,
    requests: RequestPool,
    next_token: u64,
    meta_tokens: std::collections::HashMap<u64, usize>,
    data_tokens: std::collections::HashMap<u64, usize>,
}

impl Driver {
    pub fn new(bat: Vec<u32>, spb: u32) -> Self {
        Driver {
            bat,
            spb,
            cache: MetadataCache::new(),
            fds: FdPool::new(),
            requests: RequestPool::new(),
            next_token: 0,
            meta_tokens: std::collections::HashMap::new(),
            data_tokens: std::collections::HashMap::new(),
        }
    }

    fn alloc_token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    fn block_byte_len(&self) -> usize {
        self.spb as usize * 8
    }

    /// Queue a read of `n` sectors starting at virtual sector `sec`, whose
    /// caller buffer is identified by the opaque `buf` handle.
    pub fn queue_read<H: DriverHost>(&mut self, host: &mut H, buf: u64, sec: u64, n: u32) {
        self.dispatch(host, buf, sec, n);
    }

    fn dispatch<H: DriverHost>(&mut self, host: &mut H, buf0: u64, sec0: u64, n0: u32) {
        let mut sec = sec0;
        let mut buf = buf0;
        let mut remaining = n0;

        while remaining > 0 {
            let blk = (sec / self.spb as u64) as usize;

            if blk >= self.bat.len() {
                host.complete(buf, sec, remaining, Err(Error::invalid_argument("virtual sector past end of device")));
                return;
            }

            let clamp = ((self.spb as u64 - sec % self.spb as u64).min(remaining as u64)) as u32;
            let bat_sector = self.bat[blk];

            let outcome = self.dispatch_block(host, blk, bat_sector, buf, sec, clamp);

            if let Err(e) = outcome {
                warn!(blk, error = %e, "dispatch failed, failing remainder of request");
                host.complete(buf, sec, remaining, Err(e));
                return;
            }

            sec += clamp as u64;
            buf += clamp as u64 * vhdindex_core::SECTOR_SIZE;
            remaining -= clamp;
        }
    }

    fn dispatch_block<H: DriverHost>(
        &mut self,
        host: &mut H,
        blk: usize,
        bat_sector: u32,
        buf: u64,
        sec: u64,
        clamp: u32,
    ) -> Result<()> {
        if bat_sector == 0 {
            debug!(blk, "block not indexed, forwarding upstream");
            host.forward_upstream(buf, sec, clamp);
            return Ok(());
        }

        match self.cache.find(blk) {
            Some(Lookup::Ready) => {
                debug!(blk, "metadata cache hit (valid)");
                self.dispatch_valid_range(host, blk, buf, sec, clamp)
            }
            Some(Lookup::Loading) => {
                debug!(blk, "metadata cache hit (read pending)");
                self.cache.push_waiter(blk, Waiter { buf, sec, secs: clamp });
                Ok(())
            }
            None => {
                debug!(blk, "metadata cache miss");
                self.cache.install_loading(blk)?;
                self.cache.push_waiter(blk, Waiter { buf, sec, secs: clamp });
                let token = self.alloc_token();
                self.meta_tokens.insert(token, blk);
                host.submit_meta_read(token, bat_sector, self.block_byte_len());
                Ok(())
            }
        }
    }

    fn dispatch_valid_range<H: DriverHost>(
        &mut self,
        host: &mut H,
        blk: usize,
        buf: u64,
        sec: u64,
        clamp: u32,
    ) -> Result<()> {
        let entries = self.cache.ready_entries(blk).to_vec();
        let start = (sec % self.spb as u64) as usize;
        let mut i = 0usize;

        while i < clamp as usize {
            let idx = start + i;
            let run_buf = buf + i as u64 * vhdindex_core::SECTOR_SIZE;
            let run_sec = sec + i as u64;

            if entries[idx].is_unused() {
                let mut run = 1usize;
                while i + run < clamp as usize && entries[start + i + run].is_unused() {
                    run += 1;
                }
                host.forward_upstream(run_buf, run_sec, run as u32);
                i += run;
            } else {
                let file_id = entries[idx].file_id;
                let base_offset = entries[idx].offset;
                let mut run = 1usize;
                while i + run < clamp as usize {
                    let next = entries[start + i + run];
                    if next.is_unused() || next.file_id != file_id || next.offset != base_offset + run as u32 {
                        break;
                    }
                    run += 1;
                }

                let fd_slot = self.fds.acquire(file_id)?;
                let descriptor = Descriptor { buf: run_buf, sec: run_sec, secs: run as u32, fd_slot };
                let req_idx = match self.requests.alloc(descriptor) {
                    Ok(idx) => idx,
                    Err(e) => {
                        self.fds.release(fd_slot);
                        return Err(e);
                    }
                };
                let token = self.alloc_token();
                self.data_tokens.insert(token, req_idx);
                host.submit_data_read(token, file_id, base_offset, run_buf, run_sec, run as u32);
                i += run;
            }
        }

        Ok(())
    }

    /// Resolve a previously-submitted metadata read. On success, `bytes`
    /// must hold exactly `spb` 8-byte `(file_id, offset)` entries.
    pub fn complete_meta_read<H: DriverHost>(&mut self, host: &mut H, token: u64, result: Result<Vec<u8>>) {
        let Some(blk) = self.meta_tokens.remove(&token) else {
            return;
        };

        match result.and_then(|bytes| decode_entries(&bytes, self.spb as usize)) {
            Ok(entries) => {
                let waiters = self.cache.complete_ready(blk, entries);
                for w in waiters {
                    self.dispatch(host, w.buf, w.sec, w.secs);
                }
            }
            Err(e) => {
                error!(blk, error = %e, "metadata read failed, failing waiters");
                let waiters = self.cache.fail_pending(blk);
                for w in waiters {
                    host.complete(w.buf, w.sec, w.secs, Err(Error::custom(e.to_string())));
                }
            }
        }
    }

    /// Resolve a previously-submitted data read.
    pub fn complete_data_read<H: DriverHost>(&mut self, host: &mut H, token: u64, result: Result<()>) {
        let Some(req_idx) = self.data_tokens.remove(&token) else {
            return;
        };
        let descriptor = self.requests.take(req_idx);
        self.fds.release(descriptor.fd_slot);
        host.complete(descriptor.buf, descriptor.sec, descriptor.secs, result);
    }

    /// Writes are never permitted against the read-only indexed view.
    pub fn queue_write<H: DriverHost>(&mut self, host: &mut H, buf: u64, sec: u64, n: u32) {
        host.complete(buf, sec, n, Err(Error::permission_denied("indexed view is read-only")));
    }
}

fn decode_entries(bytes: &[u8], spb: usize) -> Result<Vec<Entry>> {
    if bytes.len() < spb * 8 {
        return Err(Error::short_io(spb * 8, bytes.len()));
    }
    (0..spb)
        .map(|i| {
            let off = i * 8;
            Ok(Entry { file_id: read_u32(&bytes[off..])?, offset: read_u32(&bytes[off + 4..])? })
        })
        .collect()
}

//! Fixed-size, page-aligned block cache over multiple registered file
//! descriptors (spec §4.B). Synchronous from the caller's point of view
//! (`get` blocks until the block is available) while I/O is issued through
//! the [`IoEngine`] trait in the background.

pub mod block;
pub mod engine;

use std::collections::VecDeque;
use std::os::unix::io::RawFd;

use bitflags::bitflags;
use log::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::radix::{AdaptiveRadixTree, PrefixIndex, Value};

pub use block::{AlignedBuffer, BlockFlags, BlockId, Dir, ListId};
pub use engine::{Completion, IoEngine};

const PAGE_SIZE: usize = 4096;
const MAX_WRITEBACK_BATCH: usize = 16;
const DEFAULT_SECTOR_SIZE: u64 = 512;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GetFlags: u32 {
        const ZERO  = 1 << 0;
        const DIRTY = 1 << 1;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub read_hits: u64,
    pub read_misses: u64,
    pub write_hits: u64,
    pub write_misses: u64,
    pub write_zeroes: u64,
    pub prefetches: u64,
}

struct Slot {
    buffer: AlignedBuffer,
    meta: Option<block::BlockMeta>,
}

struct LastByte {
    offset: u64,
    sector_size: u64,
}

/// Maps DI -> (fd, advisory write clamp). Grows by doubling when full,
/// mirroring §4.B's "`set_fd` grows the registry in increments when full".
struct FdTable {
    entries: Vec<Option<RawFd>>,
    clamps: Vec<Option<LastByte>>,
}

impl FdTable {
    fn new() -> Self {
        FdTable {
            entries: Vec::new(),
            clamps: Vec::new(),
        }
    }

    fn set_fd(&mut self, fd: RawFd) -> u32 {
        if let Some(slot) = self.entries.iter().position(|e| e.is_none()) {
            self.entries[slot] = Some(fd);
            self.clamps[slot] = None;
            return slot as u32;
        }
        self.entries.push(Some(fd));
        self.clamps.push(None);
        (self.entries.len() - 1) as u32
    }

    fn clear_fd(&mut self, di: u32) {
        if let Some(e) = self.entries.get_mut(di as usize) {
            *e = None;
        }
        if let Some(c) = self.clamps.get_mut(di as usize) {
            *c = None;
        }
    }

    fn change_fd(&mut self, di: u32, fd: RawFd) -> CoreResult<()> {
        let entry = self
            .entries
            .get_mut(di as usize)
            .ok_or_else(|| CoreError::invalid_argument(format!("unknown device id {}", di)))?;
        *entry = Some(fd);
        Ok(())
    }

    fn fd(&self, di: u32) -> CoreResult<RawFd> {
        self.entries
            .get(di as usize)
            .and_then(|e| *e)
            .ok_or_else(|| CoreError::invalid_argument(format!("unknown device id {}", di)))
    }
}

/// The cache itself (spec §3 "Cache"). Owns the block-size, the preallocated
/// buffers, the five lists described in §4.B, the radix index (A), and the
/// I/O engine.
pub struct Cache {
    block_sectors: u64,
    sector_size: u64,
    nr_cache_blocks: usize,
    engine: Box<dyn IoEngine>,
    index: AdaptiveRadixTree,
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    clean: VecDeque<usize>,
    dirty: VecDeque<usize>,
    io_pending: VecDeque<usize>,
    errored: VecDeque<usize>,
    fds: FdTable,
    stats: Stats,
}

impl Cache {
    /// Fails if `block_sectors == 0`, `nr_blocks == 0`, or the resulting
    /// block size is not a multiple of the system page size (§4.B
    /// `create`). Preallocates all block buffers contiguously, page-aligned.
    pub fn create(block_sectors: u64, nr_blocks: usize, engine: Box<dyn IoEngine>) -> CoreResult<Self> {
        Self::create_with_sector_size(block_sectors, nr_blocks, DEFAULT_SECTOR_SIZE, engine)
    }

    pub fn create_with_sector_size(
        block_sectors: u64,
        nr_blocks: usize,
        sector_size: u64,
        engine: Box<dyn IoEngine>,
    ) -> CoreResult<Self> {
        if block_sectors == 0 {
            return Err(Box::new(CoreError::invalid_argument("block_sectors must be non-zero")));
        }
        if nr_blocks == 0 {
            return Err(Box::new(CoreError::invalid_argument("nr_blocks must be non-zero")));
        }
        let block_bytes = block_sectors * sector_size;
        if block_bytes % PAGE_SIZE as u64 != 0 {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "block size {} bytes is not a multiple of the page size ({})",
                block_bytes, PAGE_SIZE
            ))));
        }

        let mut slots = Vec::with_capacity(nr_blocks);
        let mut free = VecDeque::with_capacity(nr_blocks);
        for i in 0..nr_blocks {
            slots.push(Slot {
                buffer: AlignedBuffer::new(block_bytes as usize, PAGE_SIZE),
                meta: None,
            });
            free.push_back(i);
        }

        info!("cache: created with {} blocks of {} sectors each", nr_blocks, block_sectors);

        Ok(Cache {
            block_sectors,
            sector_size,
            nr_cache_blocks: nr_blocks,
            engine,
            index: AdaptiveRadixTree::new(),
            slots,
            free,
            clean: VecDeque::new(),
            dirty: VecDeque::new(),
            io_pending: VecDeque::new(),
            errored: VecDeque::new(),
            fds: FdTable::new(),
            stats: Stats::default(),
        })
    }

    pub fn nr_cache_blocks(&self) -> usize {
        self.nr_cache_blocks
    }

    pub fn block_sectors(&self) -> u64 {
        self.block_sectors
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn nr_dirty(&self) -> usize {
        self.dirty.len()
    }

    pub fn nr_io_pending(&self) -> usize {
        self.io_pending.len()
    }

    pub fn nr_locked(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.meta.as_ref().map(|m| m.is_held()).unwrap_or(false))
            .count()
    }

    /// Flushes dirty blocks and warns if anything is still held (§4.B
    /// `destroy`).
    pub fn destroy(mut self) -> CoreResult<()> {
        let _ = self.flush();
        if self.nr_locked() > 0 {
            warn!("cache: destroyed with {} block(s) still held", self.nr_locked());
        }
        Ok(())
    }

    // ---- device-id registry -------------------------------------------------

    pub fn set_fd(&mut self, fd: RawFd) -> u32 {
        self.fds.set_fd(fd)
    }

    pub fn clear_fd(&mut self, di: u32) {
        self.fds.clear_fd(di);
    }

    pub fn change_fd(&mut self, di: u32, fd: RawFd) -> CoreResult<()> {
        self.fds.change_fd(di, fd)
    }

    /// Advisory clamp: writes to `di` past `offset` are truncated to the
    /// nearest multiple of `sector_size` not exceeding the clamp (§4.B
    /// "Write clamping").
    pub fn set_last_byte(&mut self, di: u32, offset: u64, sector_size: u64) -> CoreResult<()> {
        let slot = self
            .fds
            .clamps
            .get_mut(di as usize)
            .ok_or_else(|| CoreError::invalid_argument(format!("unknown device id {}", di)))?;
        *slot = Some(LastByte { offset, sector_size });
        Ok(())
    }

    pub fn unset_last_byte(&mut self, di: u32) {
        if let Some(c) = self.fds.clamps.get_mut(di as usize) {
            *c = None;
        }
    }

    /// Applies the clamp rule from §4.B to a proposed write of `len` bytes
    /// starting at `offset` on `di`, returning the (possibly shortened)
    /// length, or an error if the start itself is past the clamp.
    fn clamp_write_len(&self, di: u32, offset: u64, len: usize, block_size: usize) -> CoreResult<usize> {
        let Some(Some(clamp)) = self.fds.clamps.get(di as usize) else {
            return Ok(len);
        };
        if offset > clamp.offset {
            return Err(Box::new(CoreError::invalid_argument(format!(
                "write at offset {} is past the last-byte clamp {} for device {}",
                offset, clamp.offset, di
            ))));
        }
        let end = offset + len as u64;
        if end <= clamp.offset {
            return Ok(len);
        }
        let mut clamped = (clamp.offset - offset) as usize;
        let rem = clamped % clamp.sector_size as usize;
        if rem != 0 {
            let rounded = clamped + (clamp.sector_size as usize - rem);
            if rounded <= block_size {
                clamped = rounded;
            }
        }
        if clamped > block_size {
            return Err(Box::new(CoreError::invalid_argument(
                "clamped write length exceeds block size",
            )));
        }
        Ok(clamped)
    }

    // ---- allocation / eviction ----------------------------------------------

    fn list_of(&mut self, slot: BlockId) -> &mut VecDeque<BlockId> {
        match self.slots[slot].meta.as_ref().unwrap().list {
            ListId::Free => &mut self.free,
            ListId::Clean => &mut self.clean,
            ListId::Dirty => &mut self.dirty,
            ListId::IoPending => &mut self.io_pending,
            ListId::Errored => &mut self.errored,
        }
    }

    fn unlink(&mut self, slot: BlockId) {
        let list = self.list_of(slot);
        if let Some(pos) = list.iter().position(|&s| s == slot) {
            list.remove(pos);
        }
    }

    fn link(&mut self, slot: BlockId, list: ListId) {
        self.slots[slot].meta.as_mut().unwrap().list = list;
        match list {
            ListId::Free => self.free.push_back(slot),
            ListId::Clean => self.clean.push_back(slot),
            ListId::Dirty => self.dirty.push_back(slot),
            ListId::IoPending => self.io_pending.push_back(slot),
            ListId::Errored => self.errored.push_back(slot),
        }
    }

    fn move_to(&mut self, slot: BlockId, list: ListId) {
        self.unlink(slot);
        self.link(slot, list);
    }

    /// Finds a slot to hold `(di, index)`, evicting or waiting as needed
    /// (§4.B "Eviction and allocation").
    fn new_block(&mut self, di: u32, index: u64, can_wait: bool) -> CoreResult<BlockId> {
        loop {
            if let Some(slot) = self.free.pop_front() {
                return Ok(slot);
            }
            if let Some(pos) = self
                .clean
                .iter()
                .position(|&s| !self.slots[s].meta.as_ref().unwrap().is_held())
            {
                let slot = self.clean.remove(pos).unwrap();
                let meta = self.slots[slot].meta.take().unwrap();
                self.index.remove(&block::cache_key(meta.di, meta.index));
                return Ok(slot);
            }
            if !can_wait {
                return Err(Box::new(CoreError::out_of_memory(format!(
                    "no free or clean block available for ({}, {})",
                    di, index
                ))));
            }
            if self.errored.len() >= self.engine.max_io() {
                return Err(Box::new(CoreError::io("errored list saturated, aborting allocation")));
            }
            let batch = self.dirty.len().min(MAX_WRITEBACK_BATCH);
            for _ in 0..batch {
                if let Some(&slot) = self.dirty.front() {
                    self.issue_write(slot)?;
                    self.dirty.pop_front();
                } else {
                    break;
                }
            }
            if self.io_pending.is_empty() {
                return Err(Box::new(CoreError::out_of_memory(
                    "no evictable block and nothing in flight",
                )));
            }
            self.wait_for_any()?;
        }
    }

    /// Preemptive writeback: when `(cache_blocks - (dirty - io_pending)) <
    /// 33% * cache_blocks`, issue writes until clean+free reaches 66%
    /// (§4.B).
    fn maybe_preemptive_writeback(&mut self) -> CoreResult<()> {
        let effective_dirty = self.dirty.len().saturating_sub(self.io_pending.len());
        let low_watermark = self.nr_cache_blocks * 33 / 100;
        let high_watermark = self.nr_cache_blocks * 66 / 100;
        if self.nr_cache_blocks.saturating_sub(effective_dirty) >= low_watermark {
            return Ok(());
        }
        while self.free.len() + self.clean.len() < high_watermark {
            let Some(&slot) = self.dirty.front() else { break };
            self.issue_write(slot)?;
            self.dirty.pop_front();
        }
        Ok(())
    }

    // ---- I/O issue / wait ----------------------------------------------------

    fn issue_read(&mut self, slot: BlockId) -> CoreResult<()> {
        let (di, index) = {
            let meta = self.slots[slot].meta.as_ref().unwrap();
            (meta.di, meta.index)
        };
        let fd = self.fds.fd(di)?;
        let sb = index * self.block_sectors;
        let se = sb + self.block_sectors;
        let buf = self.slots[slot].buffer.as_mut_slice();
        if !self.engine.issue(Dir::Read, fd, sb, se, buf, slot as u64) {
            return Err(Box::new(CoreError::io("engine rejected read submission")));
        }
        self.slots[slot].meta.as_mut().unwrap().flags.insert(BlockFlags::IO_PENDING);
        self.slots[slot].meta.as_mut().unwrap().last_dir = Some(Dir::Read);
        self.move_to(slot, ListId::IoPending);
        Ok(())
    }

    fn issue_write(&mut self, slot: BlockId) -> CoreResult<()> {
        let (di, index) = {
            let meta = self.slots[slot].meta.as_ref().unwrap();
            (meta.di, meta.index)
        };
        let fd = self.fds.fd(di)?;
        let sb = index * self.block_sectors;
        let se = sb + self.block_sectors;
        let buf = self.slots[slot].buffer.as_mut_slice();
        if !self.engine.issue(Dir::Write, fd, sb, se, buf, slot as u64) {
            return Err(Box::new(CoreError::io("engine rejected write submission")));
        }
        self.slots[slot].meta.as_mut().unwrap().flags.insert(BlockFlags::IO_PENDING);
        self.slots[slot].meta.as_mut().unwrap().last_dir = Some(Dir::Write);
        self.move_to(slot, ListId::IoPending);
        Ok(())
    }

    fn wait_for_any(&mut self) -> CoreResult<()> {
        let mut completions = Vec::new();
        self.engine.wait(&mut completions);
        for c in completions {
            self.complete(c);
        }
        Ok(())
    }

    fn complete(&mut self, c: Completion) {
        let slot = c.context as usize;
        if slot >= self.slots.len() || self.slots[slot].meta.is_none() {
            return;
        }
        let was_write = self.slots[slot].meta.as_ref().unwrap().last_dir == Some(Dir::Write);
        {
            let meta = self.slots[slot].meta.as_mut().unwrap();
            meta.flags.remove(BlockFlags::IO_PENDING);
            meta.error = c.error;
        }
        if c.error != 0 {
            self.move_to(slot, ListId::Errored);
            return;
        }
        if was_write {
            self.slots[slot].meta.as_mut().unwrap().flags.remove(BlockFlags::DIRTY);
            self.move_to(slot, ListId::Clean);
        } else {
            self.move_to(slot, ListId::Clean);
        }
    }

    fn wait_until_settled(&mut self, slot: BlockId) -> CoreResult<()> {
        while self.slots[slot].meta.as_ref().unwrap().is_io_pending() {
            self.wait_for_any()?;
        }
        Ok(())
    }

    // ---- public operations ---------------------------------------------------

    /// Best-effort: starts an async read if the block is not cached and
    /// in-flight I/O count is under `max_io`.
    pub fn prefetch(&mut self, di: u32, index: u64) {
        let key = block::cache_key(di, index);
        if self.index.lookup(&key).is_some() {
            return;
        }
        if self.io_pending.len() >= self.engine.max_io() {
            return;
        }
        let Ok(slot) = self.new_block(di, index, false) else {
            return;
        };
        self.slots[slot].meta = Some(block::BlockMeta::new(di, index, ListId::IoPending));
        self.index.insert(&key, Value::Ptr(slot));
        if self.issue_read(slot).is_err() {
            self.invalidate_slot(slot);
            return;
        }
        self.stats.prefetches += 1;
    }

    fn invalidate_slot(&mut self, slot: BlockId) {
        if let Some(meta) = self.slots[slot].meta.take() {
            self.index.remove(&block::cache_key(meta.di, meta.index));
        }
        self.unlink(slot);
        self.link(slot, ListId::Free);
    }

    /// Returns the held block for `(di, index)`, issuing a read (or zero-fill)
    /// on miss (§4.B `get`).
    pub fn get(&mut self, di: u32, index: u64, flags: GetFlags) -> CoreResult<BlockId> {
        let key = block::cache_key(di, index);
        let want_write = flags.contains(GetFlags::DIRTY);

        if let Some(Value::Ptr(slot)) = self.index.lookup(&key) {
            if want_write && self.slots[slot].meta.as_ref().unwrap().ref_count > 0 {
                return Err(Box::new(CoreError::invalid_argument(
                    "cannot take a write hold on a block already held",
                )));
            }
            self.wait_until_settled(slot)?;
            if self.slots[slot].meta.as_ref().unwrap().error != 0 {
                self.invalidate_slot(slot);
                return Err(Box::new(CoreError::io(format!(
                    "persistent read error on device {} block {}",
                    di, index
                ))));
            }
            {
                let meta = self.slots[slot].meta.as_mut().unwrap();
                meta.ref_count += 1;
                if want_write {
                    meta.flags.insert(BlockFlags::DIRTY);
                }
            }
            if self.slots[slot].meta.as_ref().unwrap().list == ListId::Clean
                && self.slots[slot].meta.as_ref().unwrap().is_dirty()
            {
                self.move_to(slot, ListId::Dirty);
            }
            if want_write {
                self.stats.write_hits += 1;
            } else {
                self.stats.read_hits += 1;
            }
            return Ok(slot);
        }

        let slot = self.new_block(di, index, true)?;
        self.slots[slot].meta = Some(block::BlockMeta::new(di, index, ListId::IoPending));
        self.index.insert(&key, Value::Ptr(slot));

        if flags.contains(GetFlags::ZERO) {
            self.slots[slot].buffer.as_mut_slice().fill(0);
            self.slots[slot].meta.as_mut().unwrap().flags.insert(BlockFlags::DIRTY);
            self.move_to(slot, ListId::Dirty);
            self.stats.write_zeroes += 1;
        } else {
            self.issue_read(slot)?;
            self.wait_until_settled(slot)?;
            if self.slots[slot].meta.as_ref().unwrap().error != 0 {
                self.invalidate_slot(slot);
                return Err(Box::new(CoreError::io(format!(
                    "read error on device {} block {}",
                    di, index
                ))));
            }
            if want_write {
                self.slots[slot].meta.as_mut().unwrap().flags.insert(BlockFlags::DIRTY);
                self.move_to(slot, ListId::Dirty);
            }
        }

        self.slots[slot].meta.as_mut().unwrap().ref_count = 1;
        if want_write {
            self.stats.write_misses += 1;
        } else {
            self.stats.read_misses += 1;
        }
        Ok(slot)
    }

    /// Decrements `ref_count`; if the block is now unheld and dirty, may
    /// trigger preemptive writeback (§4.B `put`).
    pub fn put(&mut self, slot: BlockId) -> CoreResult<()> {
        let meta = self
            .slots
            .get_mut(slot)
            .and_then(|s| s.meta.as_mut())
            .ok_or_else(|| CoreError::invalid_argument("put on an unoccupied slot"))?;
        if meta.ref_count == 0 {
            return Err(Box::new(CoreError::invalid_argument("put on a block with ref_count 0")));
        }
        meta.ref_count -= 1;
        let became_unheld_dirty = meta.ref_count == 0 && meta.is_dirty();
        if became_unheld_dirty {
            self.maybe_preemptive_writeback()?;
        }
        Ok(())
    }

    pub fn block_data(&self, slot: BlockId) -> &[u8] {
        self.slots[slot].buffer.as_slice()
    }

    pub fn block_data_mut(&mut self, slot: BlockId) -> &mut [u8] {
        self.slots[slot].buffer.as_mut_slice()
    }

    /// Writes every dirty and previously-errored block; moves the errored
    /// list back to dirty to retry first. Succeeds iff the errored list is
    /// empty afterwards (§4.B `flush`).
    pub fn flush(&mut self) -> CoreResult<()> {
        while let Some(slot) = self.errored.pop_front() {
            self.slots[slot].meta.as_mut().unwrap().error = 0;
            self.link(slot, ListId::Dirty);
        }
        while let Some(&slot) = self.dirty.front() {
            self.issue_write(slot)?;
            self.dirty.pop_front();
        }
        while !self.io_pending.is_empty() {
            self.wait_for_any()?;
        }
        if self.errored.is_empty() {
            Ok(())
        } else {
            Err(Box::new(CoreError::io(format!(
                "{} block(s) still errored after flush",
                self.errored.len()
            ))))
        }
    }

    /// Removes a single block; fails if it is held or dirty (dirty entries
    /// are flushed first, then re-checked) (§4.B `invalidate`).
    pub fn invalidate(&mut self, di: u32, index: u64) -> CoreResult<()> {
        let key = block::cache_key(di, index);
        let Some(Value::Ptr(slot)) = self.index.lookup(&key) else {
            return Ok(());
        };
        self.wait_until_settled(slot)?;
        if self.slots[slot].meta.as_ref().unwrap().is_dirty() {
            self.issue_write(slot)?;
            self.wait_until_settled(slot)?;
        }
        let meta = self.slots[slot].meta.as_ref().unwrap();
        if meta.is_held() {
            return Err(Box::new(CoreError::invalid_argument("cannot invalidate a held block")));
        }
        if meta.is_dirty() || meta.error != 0 {
            return Err(Box::new(CoreError::io("block still dirty or errored after flush attempt")));
        }
        self.invalidate_slot(slot);
        Ok(())
    }

    /// Removes every block for `di`; same held/dirty rules as `invalidate`.
    pub fn invalidate_di(&mut self, di: u32) -> CoreResult<()> {
        let entries = self.index.collect_prefix(&block::di_prefix(di));
        for (key, _) in entries {
            let index = u64::from_be_bytes(key[4..12].try_into().unwrap());
            self.invalidate(di, index)?;
        }
        Ok(())
    }

    /// Drops everything for `di` regardless of dirty state, after waiting
    /// for in-flight I/O — used after unrecoverable errors (§4.B `abort_di`).
    pub fn abort_di(&mut self, di: u32) {
        let entries = self.index.collect_prefix(&block::di_prefix(di));
        for (key, _) in entries {
            let index = u64::from_be_bytes(key[4..12].try_into().unwrap());
            if let Some(Value::Ptr(slot)) = self.index.lookup(&block::cache_key(di, index)) {
                let _ = self.wait_until_settled(slot);
                self.invalidate_slot(slot);
            }
        }
    }

    // ---- byte-range helpers ----------------------------------------------------

    fn for_each_block_in_range(&self, offset: u64, len: u64) -> Vec<(u64, u64, u64)> {
        // Returns (block_index, in_block_offset, in_block_len) triples
        // covering [offset, offset+len).
        let block_bytes = self.block_sectors * self.sector_size;
        let mut out = Vec::new();
        let mut pos = offset;
        let end = offset + len;
        while pos < end {
            let block_index = pos / block_bytes;
            let block_start = block_index * block_bytes;
            let in_block_offset = pos - block_start;
            let in_block_len = (block_bytes - in_block_offset).min(end - pos);
            out.push((block_index, in_block_offset, in_block_len));
            pos += in_block_len;
        }
        out
    }

    /// Reads `len` bytes starting at byte `offset` on `di` into `out`,
    /// translating the range into prefetch-then-get-copy-then-put over the
    /// overlapping blocks (§4.B byte-range helpers).
    pub fn read_bytes(&mut self, di: u32, offset: u64, out: &mut [u8]) -> CoreResult<()> {
        let ranges = self.for_each_block_in_range(offset, out.len() as u64);
        let mut written = 0usize;
        for (block_index, in_off, in_len) in ranges {
            self.prefetch(di, block_index + 1);
            let slot = self.get(di, block_index, GetFlags::empty())?;
            let data = self.block_data(slot);
            let in_off = in_off as usize;
            let in_len = in_len as usize;
            out[written..written + in_len].copy_from_slice(&data[in_off..in_off + in_len]);
            written += in_len;
            self.put(slot)?;
        }
        Ok(())
    }

    /// Writes `buf` starting at byte `offset` on `di`, applying the clamp
    /// rule per overlapping block (§4.B byte-range helpers, write clamping).
    pub fn write_bytes(&mut self, di: u32, offset: u64, buf: &[u8]) -> CoreResult<()> {
        let block_bytes = (self.block_sectors * self.sector_size) as usize;
        let clamped_len = self.clamp_write_len(di, offset, buf.len(), block_bytes)?;
        let buf = &buf[..clamped_len];
        let ranges = self.for_each_block_in_range(offset, buf.len() as u64);
        let mut read = 0usize;
        for (block_index, in_off, in_len) in ranges {
            let slot = self.get(di, block_index, GetFlags::DIRTY)?;
            let in_off = in_off as usize;
            let in_len = in_len as usize;
            self.block_data_mut(slot)[in_off..in_off + in_len].copy_from_slice(&buf[read..read + in_len]);
            read += in_len;
            self.put(slot)?;
        }
        Ok(())
    }

    /// Zero-fills `len` bytes starting at byte `offset` on `di`.
    pub fn write_zeros(&mut self, di: u32, offset: u64, len: u64) -> CoreResult<()> {
        let block_bytes = (self.block_sectors * self.sector_size) as usize;
        let clamped_len = self.clamp_write_len(di, offset, len as usize, block_bytes)?;
        let ranges = self.for_each_block_in_range(offset, clamped_len as u64);
        for (block_index, in_off, in_len) in ranges {
            let slot = self.get(di, block_index, GetFlags::DIRTY)?;
            let in_off = in_off as usize;
            let in_len = in_len as usize;
            for b in &mut self.block_data_mut(slot)[in_off..in_off + in_len] {
                *b = 0;
            }
            self.stats.write_zeroes += 1;
            self.put(slot)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::engine::mock::MockIoEngine;
    use super::*;

    fn new_mock_cache(block_sectors: u64, nr_blocks: usize) -> (Cache, u32) {
        let mut cache = Cache::create(block_sectors, nr_blocks, Box::new(MockIoEngine::new())).unwrap();
        let di = cache.set_fd(17);
        (cache, di)
    }

    #[test]
    fn create_and_destroy_cache() {
        let (cache, _) = new_mock_cache(8, 16);
        assert_eq!(cache.nr_cache_blocks(), 16);
        assert!(cache.destroy().is_ok());
    }

    #[test]
    fn invalid_cache_parameters_are_rejected() {
        assert!(Cache::create(3, 16, Box::new(MockIoEngine::new())).is_err());
        assert!(Cache::create(8, 0, Box::new(MockIoEngine::new())).is_err());
        assert!(Cache::create(0, 16, Box::new(MockIoEngine::new())).is_err());
    }

    #[test]
    fn repeated_read_caches_the_block() {
        let (mut cache, di) = new_mock_cache(8, 16);
        for _ in 0..100 {
            let slot = cache.get(di, 0, GetFlags::empty()).unwrap();
            cache.put(slot).unwrap();
        }
        assert_eq!(cache.stats().read_hits, 99);
        assert_eq!(cache.stats().read_misses, 1);
    }

    #[test]
    fn lru_eviction_recycles_the_oldest_unheld_block() {
        let (mut cache, di) = new_mock_cache(8, 16);
        for idx in 0..16 {
            let slot = cache.get(di, idx, GetFlags::empty()).unwrap();
            cache.put(slot).unwrap();
        }
        assert_eq!(cache.stats().read_misses, 16);
        // One further miss evicts block 0 (the LRU entry).
        let slot = cache.get(di, 16, GetFlags::empty()).unwrap();
        cache.put(slot).unwrap();
        assert_eq!(cache.stats().read_misses, 17);
        assert!(cache.index.lookup(&block::cache_key(di, 0)).is_none());
    }

    #[test]
    fn writeback_on_dirty_put_then_flush() {
        let (mut cache, di) = new_mock_cache(8, 16);
        let slot = cache.get(di, 0, GetFlags::DIRTY).unwrap();
        assert_eq!(cache.stats().write_misses, 1);
        cache.put(slot).unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.nr_dirty(), 0);
        assert!(cache.errored.is_empty());
    }

    #[test]
    fn get_zero_then_read_back_zeros() {
        let (mut cache, di) = new_mock_cache(8, 4);
        let slot = cache.get(di, 0, GetFlags::ZERO).unwrap();
        assert!(cache.block_data(slot).iter().all(|&b| b == 0));
        cache.put(slot).unwrap();
        cache.flush().unwrap();
        cache.invalidate(di, 0).unwrap();
        let slot = cache.get(di, 0, GetFlags::empty()).unwrap();
        assert!(cache.block_data(slot).iter().all(|&b| b == 0));
        cache.put(slot).unwrap();
    }

    #[test]
    fn set_last_byte_clamps_writes_past_the_boundary() {
        let (mut cache, di) = new_mock_cache(1, 4); // 512-byte blocks
        cache.set_last_byte(di, 500, 64).unwrap();
        let buf = vec![0xAAu8; 512];
        // Starts before the clamp, runs past it: should succeed, truncated.
        assert!(cache.write_bytes(di, 0, &buf).is_ok());
        // Starts exactly at the clamp: succeeds, truncated to zero bytes.
        assert!(cache.write_bytes(di, 500, &buf).is_ok());
        // Starts past the clamp: must fail outright.
        assert!(cache.write_bytes(di, 501, &buf).is_err());
    }

    #[test]
    fn invalidate_di_removes_all_blocks_for_a_device() {
        let (mut cache, di) = new_mock_cache(8, 16);
        for idx in 0..4 {
            let slot = cache.get(di, idx, GetFlags::empty()).unwrap();
            cache.put(slot).unwrap();
        }
        cache.invalidate_di(di).unwrap();
        for idx in 0..4 {
            assert!(cache.index.lookup(&block::cache_key(di, idx)).is_none());
        }
    }
}

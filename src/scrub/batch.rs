//! C2: Read-batch builder. Batches coalesce physically and logically
//! contiguous pages into one I/O (spec §4.1); the pool they're drawn from is
//! a free-list array addressed by slot index (spec §3 "Read-batch").
//!
//! Lock discipline follows spec §5 verbatim: `bios_lock` (pool resize) is
//! always taken outer to `list_lock` (free-list + slot array), which is
//! always taken outer to `curr_lock` (the "current" slot index). `list_lock`
//! and the slot array are merged into one `Mutex<PoolInner>` here, since they
//! are always touched together in this implementation, so splitting them would
//! only add lock-ordering surface without changing any observable behavior.

use crate::error::{Result, ScrubError};
use crate::scrub::block::BlockRef;
use crate::scrub::device::{DeviceId, Direction, Logical, Physical};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// A run of contiguous pages, in flight as a single I/O or under
/// construction as the pool's "current" batch.
pub struct Batch {
    pub device: DeviceId,
    pub mirror: u8,
    pub phys: Physical,
    pub log: Logical,
    pub direction: Direction,
    pub pages: Vec<(BlockRef, usize)>,
    pub capacity: usize,
    page_size: usize,
    pub completion_error: Option<ScrubError>,
    pub issued_at: Option<Instant>,
    pub wasted: Duration,
    pause_window_start: Option<Instant>,
    next_free: i64,
}

impl Batch {
    fn empty(capacity: usize, page_size: usize) -> Self {
        Self {
            device: 0,
            mirror: 0,
            phys: 0,
            log: 0,
            direction: Direction::Read,
            pages: Vec::with_capacity(capacity),
            capacity,
            page_size,
            completion_error: None,
            issued_at: None,
            wasted: Duration::ZERO,
            pause_window_start: None,
            next_free: -1,
        }
    }

    fn reset(&mut self, capacity: usize, page_size: usize) {
        self.device = 0;
        self.mirror = 0;
        self.phys = 0;
        self.log = 0;
        self.pages.clear();
        self.capacity = capacity;
        self.page_size = page_size;
        self.completion_error = None;
        self.issued_at = None;
        self.wasted = Duration::ZERO;
        self.pause_window_start = None;
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.pages.len() >= self.capacity
    }

    fn phys_tail(&self) -> Physical {
        self.phys + self.pages.len() as u64 * self.page_size as u64
    }

    fn log_tail(&self) -> Logical {
        self.log + self.pages.len() as u64 * self.page_size as u64
    }

    /// Appends one page, enforcing the contiguity rule of spec §4.1: `P` is
    /// appendable iff `P.phys == phys_tail ∧ P.log == log_tail ∧ P.dev ==
    /// B.dev`. Returns `false` (caller must submit-then-retry) when the page
    /// does not fit, either because the batch is full or not contiguous.
    pub fn try_append(
        &mut self,
        device: DeviceId,
        mirror: u8,
        logical: Logical,
        physical: Physical,
        direction: Direction,
        block: BlockRef,
        page_index: usize,
    ) -> bool {
        if self.is_full() {
            return false;
        }
        if self.pages.is_empty() {
            self.device = device;
            self.mirror = mirror;
            self.phys = physical;
            self.log = logical;
            self.direction = direction;
        } else if physical != self.phys_tail() || logical != self.log_tail() || device != self.device
        {
            return false;
        }
        self.pages.push((block, page_index));
        true
    }

    pub fn mark_pause_start(&mut self, now: Instant) {
        if self.pause_window_start.is_none() {
            self.pause_window_start = Some(now);
        }
    }

    /// Accumulates wasted time as `sum over pause windows of (resume -
    /// pause)` (spec §9 open question (a), resolved as written there).
    pub fn mark_pause_end(&mut self, now: Instant) {
        if let Some(start) = self.pause_window_start.take() {
            self.wasted += now.saturating_duration_since(start);
        }
    }
}

struct PoolInner {
    slots: Vec<Batch>,
    first_free: i64,
}

/// The batch pool: a dense array of slots linked into a free-list, plus the
/// single "current" slot being appended to (spec §3 "A batch is either on
/// the free-list, currently being appended to ... or in-flight").
pub struct BatchPool {
    list_lock: Mutex<PoolInner>,
    curr_lock: Mutex<Option<usize>>,
    bios_lock: Mutex<()>,
    pending_removals: AtomicUsize,
    capacity: usize,
    page_size: usize,
    max_pool: usize,
    notify_free: Notify,
}

impl BatchPool {
    pub fn new(initial_size: usize, capacity: usize, page_size: usize, max_pool: usize) -> Self {
        let mut slots = Vec::with_capacity(initial_size);
        for i in 0..initial_size {
            let mut b = Batch::empty(capacity, page_size);
            b.next_free = if i + 1 < initial_size { (i + 1) as i64 } else { -1 };
            slots.push(b);
        }
        let first_free = if initial_size > 0 { 0 } else { -1 };
        Self {
            list_lock: Mutex::new(PoolInner { slots, first_free }),
            curr_lock: Mutex::new(None),
            bios_lock: Mutex::new(()),
            pending_removals: AtomicUsize::new(0),
            capacity,
            page_size,
            max_pool,
            notify_free: Notify::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.list_lock.lock().slots.len()
    }

    pub fn max_pool(&self) -> usize {
        self.max_pool
    }

    fn try_acquire_free(&self) -> Option<usize> {
        let mut inner = self.list_lock.lock();
        if inner.first_free < 0 {
            return None;
        }
        let idx = inner.first_free as usize;
        inner.first_free = inner.slots[idx].next_free;
        Some(idx)
    }

    fn release_free(&self, idx: usize) {
        let mut inner = self.list_lock.lock();
        let capacity = self.capacity;
        let page_size = self.page_size;
        inner.slots[idx].reset(capacity, page_size);
        inner.slots[idx].next_free = inner.first_free;
        inner.first_free = idx as i64;
        drop(inner);
        self.notify_free.notify_one();
    }

    /// Blocks until a free slot is available (spec §4.1 "blocking if empty,
    /// with optional pool growth", growth is driven externally by the rate
    /// controller calling `grow_to`).
    pub async fn acquire_free(&self) -> usize {
        loop {
            if let Some(idx) = self.try_acquire_free() {
                return idx;
            }
            self.notify_free.notified().await;
        }
    }

    /// Returns the current "being appended to" slot, acquiring a fresh one
    /// from the free-list if none exists.
    pub async fn current_or_acquire(&self) -> usize {
        if let Some(idx) = *self.curr_lock.lock() {
            return idx;
        }
        let idx = self.acquire_free().await;
        let mut curr = self.curr_lock.lock();
        if let Some(existing) = *curr {
            drop(curr);
            self.release_free(idx);
            return existing;
        }
        *curr = Some(idx);
        idx
    }

    /// Clears the "current" slot and returns its index, for submission.
    pub fn take_current(&self) -> Option<usize> {
        self.curr_lock.lock().take()
    }

    pub fn with_slot<R>(&self, idx: usize, f: impl FnOnce(&mut Batch) -> R) -> R {
        let mut inner = self.list_lock.lock();
        f(&mut inner.slots[idx])
    }

    /// C6 pool growth: allocate additional slots and daisy-chain them onto
    /// the free-list (spec §4.6 "Pool growth").
    pub fn grow_to(&self, new_size: usize) {
        let _bios = self.bios_lock.lock();
        let mut inner = self.list_lock.lock();
        let old = inner.slots.len();
        if new_size <= old {
            return;
        }
        let capacity = self.capacity;
        let page_size = self.page_size;
        for i in old..new_size {
            let mut b = Batch::empty(capacity, page_size);
            b.next_free = inner.first_free;
            inner.first_free = i as i64;
            inner.slots.push(b);
        }
        drop(inner);
        self.notify_free.notify_waiters();
    }

    /// C6 pool shrink: schedules `current - new_size` removals, performed
    /// lazily as in-flight batches complete (spec §4.6 "Pool shrink").
    pub fn request_shrink_to(&self, new_size: usize) {
        let _bios = self.bios_lock.lock();
        let current_len = self.list_lock.lock().slots.len();
        if new_size >= current_len {
            return;
        }
        self.pending_removals
            .store(current_len - new_size, Ordering::SeqCst);
    }

    pub fn pending_removals(&self) -> usize {
        self.pending_removals.load(Ordering::SeqCst)
    }

    /// Called when a batch completes in place of a plain `release_free`: if
    /// a shrink is pending, frees this slot instead of returning it to the
    /// pool, backfilling the array from the tail to stay dense.
    pub fn release_or_shrink(&self, idx: usize) {
        let _bios = self.bios_lock.lock();
        if self.pending_removals.load(Ordering::SeqCst) == 0 {
            drop(_bios);
            self.release_free(idx);
            return;
        }
        self.pending_removals.fetch_sub(1, Ordering::SeqCst);

        let mut inner = self.list_lock.lock();
        let last = inner.slots.len() - 1;
        if idx != last {
            inner.slots.swap_remove(idx);
            for b in inner.slots.iter_mut() {
                if b.next_free == last as i64 {
                    b.next_free = idx as i64;
                }
            }
            if inner.first_free == last as i64 {
                inner.first_free = idx as i64;
            }
            drop(inner);
            let mut curr = self.curr_lock.lock();
            if *curr == Some(last) {
                *curr = Some(idx);
            }
        } else {
            inner.slots.truncate(last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::block::Block;
    use crate::scrub::device::{BlockKind, ExtentFlags};
    use crate::scrub::page::Page;

    fn test_block() -> BlockRef {
        let flags = ExtentFlags {
            kind: BlockKind::Data,
            has_csum: true,
            nocow: false,
        };
        Block::new(1, 0, BlockKind::Data, flags, 1, vec![Page::new(1, 0, 0, 0, 4096, 1)])
    }

    #[test]
    fn contiguous_pages_append() {
        let mut batch = Batch::empty(4, 4096);
        let block = test_block();
        assert!(batch.try_append(1, 0, 0, 0, Direction::Read, block.clone(), 0));
        assert!(batch.try_append(1, 0, 4096, 4096, Direction::Read, block.clone(), 0));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn non_contiguous_page_rejected() {
        let mut batch = Batch::empty(4, 4096);
        let block = test_block();
        assert!(batch.try_append(1, 0, 0, 0, Direction::Read, block.clone(), 0));
        // Skips a page worth of offset -> not contiguous.
        assert!(!batch.try_append(1, 0, 8192, 8192, Direction::Read, block, 0));
        assert_eq!(batch.len(), 1);
    }

    #[test]
    fn capacity_enforced() {
        let mut batch = Batch::empty(1, 4096);
        let block = test_block();
        assert!(batch.try_append(1, 0, 0, 0, Direction::Read, block.clone(), 0));
        assert!(!batch.try_append(1, 0, 4096, 4096, Direction::Read, block, 0));
    }

    #[tokio::test]
    async fn pool_free_list_acquire_and_release() {
        let pool = BatchPool::new(2, 4, 4096, 8);
        let a = pool.acquire_free().await;
        let b = pool.acquire_free().await;
        assert_ne!(a, b);
        pool.release_free(a);
        let c = pool.acquire_free().await;
        assert_eq!(c, a);
        pool.release_free(b);
        pool.release_free(c);
    }

    #[test]
    fn pool_grow_adds_slots() {
        let pool = BatchPool::new(1, 4, 4096, 8);
        assert_eq!(pool.size(), 1);
        pool.grow_to(4);
        assert_eq!(pool.size(), 4);
    }

    #[test]
    fn pool_shrink_frees_on_release() {
        let pool = BatchPool::new(4, 4, 4096, 8);
        pool.request_shrink_to(2);
        assert_eq!(pool.pending_removals(), 2);
        pool.release_or_shrink(0);
        assert_eq!(pool.size(), 3);
        pool.release_or_shrink(0);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.pending_removals(), 0);
    }
}

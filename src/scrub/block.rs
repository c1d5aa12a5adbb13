//! C1: Block. An ordered sequence of Page-entries representing one mirror
//! of a logical node/leaf/sector (spec §3). Invariants I1–I5 are enforced by
//! construction (pages always belong to exactly one Block) and by the
//! atomics below (outstanding-page count, sticky error flags).

use crate::scrub::device::{BlockKind, DeviceId, ExtentFlags, Logical};
use crate::scrub::page::Page;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

pub struct Block {
    pub device: DeviceId,
    pub logical: Logical,
    pub kind: BlockKind,
    pub flags: ExtentFlags,
    pub generation: u64,
    pages: Mutex<Vec<Page>>,
    outstanding_pages: AtomicI64,
    header_error: AtomicBool,
    checksum_error: AtomicBool,
    generation_error: AtomicBool,
    /// Monotonically cleared, never set back to true (I4).
    no_io_error_seen: AtomicBool,
}

pub type BlockRef = Arc<Block>;

impl Block {
    pub fn new(
        device: DeviceId,
        logical: Logical,
        kind: BlockKind,
        flags: ExtentFlags,
        generation: u64,
        pages: Vec<Page>,
    ) -> BlockRef {
        let n = pages.len() as i64;
        Arc::new(Block {
            device,
            logical,
            kind,
            flags,
            generation,
            pages: Mutex::new(pages),
            outstanding_pages: AtomicI64::new(n),
            header_error: AtomicBool::new(false),
            checksum_error: AtomicBool::new(false),
            generation_error: AtomicBool::new(false),
            no_io_error_seen: AtomicBool::new(true),
        })
    }

    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    pub fn with_page<R>(&self, idx: usize, f: impl FnOnce(&Page) -> R) -> R {
        let pages = self.pages.lock();
        f(&pages[idx])
    }

    pub fn with_page_mut<R>(&self, idx: usize, f: impl FnOnce(&mut Page) -> R) -> R {
        let mut pages = self.pages.lock();
        f(&mut pages[idx])
    }

    pub fn snapshot_pages(&self) -> Vec<Page> {
        self.pages.lock().clone()
    }

    pub fn replace_page(&self, idx: usize, page: Page) {
        let mut pages = self.pages.lock();
        pages[idx] = page;
    }

    /// Marks a single page as I/O-failed. Per spec §4.2(a), any batch error
    /// marks every page in the batch and clears `no_io_error_seen`.
    pub fn mark_io_error(&self, idx: usize) {
        self.with_page_mut(idx, |p| p.io_error = true);
        self.no_io_error_seen.store(false, Ordering::SeqCst);
    }

    /// Decrements the outstanding-page count (spec §4.2(b)). Returns `true`
    /// exactly on the completion that drives the counter to zero: the
    /// thread observing `true` is the one that runs block-complete (spec §4.2
    /// "Ordering guarantee").
    pub fn complete_page(&self) -> bool {
        let prev = self.outstanding_pages.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev >= 1, "outstanding_pages underflow (I2 violated)");
        prev == 1
    }

    pub fn outstanding(&self) -> i64 {
        self.outstanding_pages.load(Ordering::Acquire)
    }

    pub fn no_io_error_seen(&self) -> bool {
        self.no_io_error_seen.load(Ordering::Acquire)
    }

    pub fn header_error(&self) -> bool {
        self.header_error.load(Ordering::Acquire)
    }

    pub fn set_header_error(&self, v: bool) {
        self.header_error.store(v, Ordering::Release);
    }

    pub fn checksum_error(&self) -> bool {
        self.checksum_error.load(Ordering::Acquire)
    }

    pub fn set_checksum_error(&self, v: bool) {
        self.checksum_error.store(v, Ordering::Release);
    }

    pub fn generation_error(&self) -> bool {
        self.generation_error.load(Ordering::Acquire)
    }

    pub fn set_generation_error(&self, v: bool) {
        self.generation_error.store(v, Ordering::Release);
    }

    pub fn has_any_error(&self) -> bool {
        self.header_error() || self.checksum_error() || self.generation_error() || !self.no_io_error_seen()
    }

    pub fn byte_len(&self) -> u64 {
        self.pages.lock().iter().map(|p| p.len() as u64).sum()
    }
}

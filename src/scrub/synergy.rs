//! C8: Synergistic filter (spec §4.7). Consumes page-cache events from an
//! external observer subsystem, only its `register/deregister/fetch/
//! mark/unmark/check` ABI is modeled, per spec §1's "out of scope" list,
//! and maintains a range-compressed bitmap of LBAs the foreground workload
//! has already validated, so the walker can skip re-reading them.
//!
//! The bitmap is advisory, not authoritative (spec §4.7: "a missed unmark
//! only causes a false skip, which scrub will catch on a future pass").

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Foreground read-in recently validated a page-cache range.
    Add,
    /// Cache contents have diverged from disk.
    Modify,
}

#[derive(Debug, Clone, Copy)]
pub struct PageEvent {
    pub kind: EventKind,
    pub lba: u64,
    pub len: u64,
}

/// The observer ABI consumed by the filter (spec §4.7 "Interface
/// consumed"). Inode+page-index resolution to an LBA range is the
/// observer's job, out of scope here: events already carry a resolved LBA
/// range.
pub trait Observer: Send + Sync {
    fn register(&self, event_mask: u32, block_size: usize) -> u64;
    fn deregister(&self, task_id: u64);
    fn fetch(&self, task_id: u64, max_items: usize) -> Vec<PageEvent>;
}

/// In-memory observer used by tests and the `scrubd` demo binary.
pub struct MockObserver {
    events: Mutex<VecDeque<PageEvent>>,
    next_task: AtomicU64,
}

impl MockObserver {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            next_task: AtomicU64::new(1),
        }
    }

    pub fn emit(&self, event: PageEvent) {
        self.events.lock().push_back(event);
    }
}

impl Default for MockObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for MockObserver {
    fn register(&self, _event_mask: u32, _block_size: usize) -> u64 {
        self.next_task.fetch_add(1, Ordering::SeqCst)
    }

    fn deregister(&self, _task_id: u64) {}

    fn fetch(&self, _task_id: u64, max_items: usize) -> Vec<PageEvent> {
        let mut events = self.events.lock();
        let n = max_items.min(events.len());
        events.drain(..n).collect()
    }
}

/// A range-compressed bitmap: a sorted list of disjoint, non-adjacent
/// `[start, end)` intervals.
struct IntervalSet {
    intervals: Vec<(u64, u64)>,
}

impl IntervalSet {
    fn new() -> Self {
        Self {
            intervals: Vec::new(),
        }
    }

    fn mark(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        self.intervals.push((start, end));
        self.intervals.sort_by_key(|&(s, _)| s);
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.intervals.len());
        for &(s, e) in &self.intervals {
            if let Some(last) = merged.last_mut() {
                if s <= last.1 {
                    last.1 = last.1.max(e);
                    continue;
                }
            }
            merged.push((s, e));
        }
        self.intervals = merged;
    }

    fn unmark(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut next = Vec::with_capacity(self.intervals.len() + 1);
        for &(s, e) in &self.intervals {
            if e <= start || s >= end {
                next.push((s, e));
                continue;
            }
            if s < start {
                next.push((s, start));
            }
            if e > end {
                next.push((end, e));
            }
        }
        next.sort_by_key(|&(s, _)| s);
        self.intervals = next;
    }

    /// True iff `[start, end)` is entirely covered by marked intervals.
    fn covers(&self, start: u64, end: u64) -> bool {
        if start >= end {
            return true;
        }
        let mut cursor = start;
        for &(s, e) in &self.intervals {
            if s > cursor {
                break;
            }
            if e > cursor {
                cursor = e;
            }
            if cursor >= end {
                return true;
            }
        }
        cursor >= end
    }
}

pub struct SynergyFilter {
    intervals: Mutex<IntervalSet>,
    skip_count: AtomicU64,
}

impl SynergyFilter {
    pub fn new() -> Self {
        Self {
            intervals: Mutex::new(IntervalSet::new()),
            skip_count: AtomicU64::new(0),
        }
    }

    pub fn mark(&self, lba: u64, len: u64) {
        self.intervals.lock().mark(lba, lba + len);
    }

    pub fn unmark(&self, lba: u64, len: u64) {
        self.intervals.lock().unmark(lba, lba + len);
    }

    /// `check(lba, len) == 1` in spec terms (all-set). `-1` (err) never
    /// arises for this in-memory bitmap.
    pub fn check(&self, lba: u64, len: u64) -> bool {
        self.intervals.lock().covers(lba, lba + len)
    }

    /// Checks and, on a hit, bumps the skip counter in one call, the shape
    /// the walker actually wants at its call site (spec §4.7 "Use in the
    /// walker").
    pub fn should_skip(&self, lba: u64, len: u64) -> bool {
        let hit = self.check(lba, len);
        if hit {
            self.skip_count.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn skip_count(&self) -> u64 {
        self.skip_count.load(Ordering::Relaxed)
    }

    /// Drains up to `max_items` events from the observer and applies them
    /// (spec §4.7 "Event processing"), returning the number processed.
    pub fn process_events(&self, observer: &dyn Observer, task_id: u64, max_items: usize) -> usize {
        let events = observer.fetch(task_id, max_items);
        let n = events.len();
        for event in events {
            match event.kind {
                EventKind::Add => self.mark(event.lba, event.len),
                EventKind::Modify => self.unmark(event.lba, event.len),
            }
        }
        n
    }
}

impl Default for SynergyFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_then_check_covers_exact_range() {
        let filter = SynergyFilter::new();
        filter.mark(1000, 4096);
        assert!(filter.check(1000, 4096));
        assert!(!filter.check(1000, 8192));
    }

    #[test]
    fn unmark_punches_a_hole() {
        let filter = SynergyFilter::new();
        filter.mark(0, 10_000);
        filter.unmark(2000, 3000);
        assert!(!filter.check(0, 10_000));
        assert!(filter.check(0, 2000));
        assert!(filter.check(3000, 10_000));
    }

    #[test]
    fn should_skip_increments_counter_only_on_hit() {
        let filter = SynergyFilter::new();
        filter.mark(0, 4096);
        assert!(filter.should_skip(0, 4096));
        assert!(!filter.should_skip(4096, 8192));
        assert_eq!(filter.skip_count(), 1);
    }

    #[test]
    fn synergy_add_then_modify_round_trip_s6() {
        // S6: ADD for a 1 MiB range, walker skips; MODIFY the same range,
        // subsequent scrub re-reads it.
        let observer = MockObserver::new();
        let filter = SynergyFilter::new();
        let task_id = observer.register(0, 4096);

        observer.emit(PageEvent {
            kind: EventKind::Add,
            lba: 0,
            len: 1024 * 1024,
        });
        filter.process_events(&observer, task_id, 256);
        assert!(filter.should_skip(0, 1024 * 1024));

        observer.emit(PageEvent {
            kind: EventKind::Modify,
            lba: 0,
            len: 1024 * 1024,
        });
        filter.process_events(&observer, task_id, 256);
        assert!(!filter.check(0, 1024 * 1024));
    }

    #[test]
    fn overlapping_marks_merge() {
        let filter = SynergyFilter::new();
        filter.mark(0, 100);
        filter.mark(50, 200);
        assert!(filter.check(0, 200));
    }
}

//! Scrub configuration.
//!
//! Mirrors the teacher's `Config`/`DatabaseConfig` pattern: a plain struct
//! with a `Default` impl, constructed once at `scrub_start` time and passed
//! by value into the owning `ScrubContext`.

use std::time::Duration;

/// Background-mode flags (spec §6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BgFlags {
    /// `BGSC_ENUM`: pre-enumerate extents to refine the target-bytes estimate.
    pub enumerate_first: bool,
    /// `BGSC_BOOST`: allow I/O-priority boost when badly behind schedule.
    pub boost: bool,
}

/// Tunables for one scrub run.
#[derive(Debug, Clone)]
pub struct ScrubConfig {
    /// Page size in bytes (typically 4 KiB).
    pub page_size: usize,
    /// Sector size in bytes (checksum granularity for data blocks).
    pub sector_size: usize,
    /// Metadata node size in bytes (checksum granularity for tree blocks).
    pub node_size: usize,
    /// Maximum pages per batch I/O.
    pub pages_per_batch: usize,
    /// Maximum pages aggregated into one logical Block.
    pub max_pages_per_block: usize,
    /// Upper bound on mirrors the recovery state machine will consider.
    pub max_mirrors: usize,
    /// Upper bound the rate controller may grow the batch pool to.
    pub max_pool: usize,
    /// Steady-state pool size used when no deadline is set.
    pub default_pool_size: usize,
    /// Operator-supplied wall-clock deadline. `None`/zero means no pacing.
    pub deadline: Option<Duration>,
    /// Background-mode flags.
    pub bg_flags: BgFlags,
    /// Bound on events drained from the synergistic observer per pause point.
    pub max_events_per_poll: usize,
}

impl Default for ScrubConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            sector_size: 4096,
            node_size: 16384,
            pages_per_batch: 32,
            max_pages_per_block: 16,
            max_mirrors: 4,
            max_pool: 256,
            default_pool_size: 8,
            deadline: None,
            bg_flags: BgFlags::default(),
            max_events_per_poll: 256,
        }
    }
}

impl ScrubConfig {
    pub fn with_deadline(mut self, secs: u64) -> Self {
        self.deadline = if secs == 0 {
            None
        } else {
            Some(Duration::from_secs(secs))
        };
        self
    }
}

//! Progress / statistics record (spec §6): wire-stable, all 64-bit unless
//! noted. `ScrubStats` is the live, atomically-updated counter set a running
//! scrub mutates; `ScrubProgress` is the serializable snapshot handed back
//! through `scrub_progress`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($field:ident),* $(,)?) => {
        #[derive(Debug, Default)]
        pub struct ScrubStats {
            $(pub $field: AtomicU64,)*
        }

        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct ScrubProgress {
            $(pub $field: u64,)*
        }

        impl ScrubStats {
            pub fn new() -> Self {
                Self::default()
            }

            pub fn snapshot(&self) -> ScrubProgress {
                ScrubProgress {
                    $($field: self.$field.load(Ordering::Relaxed),)*
                }
            }

            /// Supplemented feature: statistics reset to zero at the start
            /// of every `scrub_start`, so a progress handle never mixes
            /// counts across runs.
            pub fn reset(&self) {
                $(self.$field.store(0, Ordering::Relaxed);)*
            }
        }
    };
}

counters! {
    data_extents_scrubbed,
    tree_extents_scrubbed,
    data_bytes_scrubbed,
    tree_bytes_scrubbed,
    data_bytes_verified,
    tree_bytes_verified,
    read_errors,
    csum_errors,
    verify_errors,
    super_errors,
    no_csum,
    csum_discards,
    corrected_errors,
    uncorrectable_errors,
    unverified_errors,
    malloc_errors,
    last_physical,
    sync_errors,
    skipped_extents,
}

impl ScrubStats {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn set_max(counter: &AtomicU64, value: u64) {
        counter.fetch_max(value, Ordering::Relaxed);
    }
}

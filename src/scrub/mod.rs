//! Background data-scrubber (spec §1–§9). The scrub engine proper: extent
//! enumeration and stripe walking (C7), read-batch pipelining (C2/C3),
//! checksum/header verification (C4), error recovery (C5), adaptive rate
//! control (C6), and the synergistic foreground-cache filter (C8), tied
//! together by a per-device `ScrubContext` and exposed through the
//! operator-facing entry points in spec §6.

pub mod batch;
pub mod block;
pub mod context;
pub mod device;
pub mod page;
pub mod pipeline;
pub mod rate;
pub mod recovery;
pub mod stats;
pub mod synergy;
pub mod verify;
pub mod walker;

use crate::config::ScrubConfig;
use crate::error::{Result, ScrubError};
use crate::scrub::context::ScrubContext;
use crate::scrub::device::{BlockDevice, DeviceId, DeviceLookup, ExtentTree, Logical, RaidMap};
use crate::scrub::stats::ScrubProgress;
use crate::scrub::verify::VerifyContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A running (or finished) scrub's externally visible handle (spec §6:
/// `scrub_start(...) -> progress-handle`).
pub struct ScrubHandle {
    pub device: DeviceId,
    context: Arc<ScrubContext>,
}

impl ScrubHandle {
    pub fn pause(&self) {
        self.context.pause();
    }

    pub fn resume(&self) {
        self.context.resume();
    }

    pub fn cancel(&self) {
        self.context.cancel();
    }

    pub fn progress(&self) -> ScrubProgress {
        self.context.progress()
    }
}

/// Tracks the one scrub context permitted per device at a time (spec §6/§7:
/// "replace-in-progress conflict" is an invalid-argument precondition).
#[derive(Default)]
pub struct ScrubRegistry {
    running: Mutex<HashMap<DeviceId, Arc<ScrubContext>>>,
}

impl ScrubRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a scrub of `[start_logical, end_logical)` on `device`. Fails
    /// with `ReplaceInProgress` if a scrub is already running on that
    /// device (spec §7 exit-code mapping).
    #[allow(clippy::too_many_arguments)]
    pub fn scrub_start(
        &self,
        device: DeviceId,
        config: ScrubConfig,
        verify_ctx: VerifyContext,
        target_bytes: u64,
    ) -> Result<ScrubHandle> {
        let mut running = self.running.lock();
        if running.contains_key(&device) {
            return Err(ScrubError::ReplaceInProgress(device));
        }
        let context = Arc::new(ScrubContext::new(device, config, verify_ctx, target_bytes));
        running.insert(device, context.clone());
        Ok(ScrubHandle { device, context })
    }

    /// Drives the walk to completion and removes the context from the
    /// registry regardless of outcome, so a later `scrub_start` on the same
    /// device is never blocked by a finished run.
    pub async fn run_to_completion(
        &self,
        handle: &ScrubHandle,
        raid_map: &dyn RaidMap,
        extent_tree: &dyn ExtentTree,
        lookup: &dyn DeviceLookup,
        start: Logical,
        end: Logical,
        replace_target: Option<&dyn BlockDevice>,
    ) -> Result<()> {
        let result = handle
            .context
            .run(raid_map, extent_tree, lookup, start, end, replace_target)
            .await;
        self.running.lock().remove(&handle.device);
        result
    }

    pub fn scrub_pause(&self, device: DeviceId) -> Result<()> {
        self.with_device(device, |ctx| ctx.pause())
    }

    pub fn scrub_resume(&self, device: DeviceId) -> Result<()> {
        self.with_device(device, |ctx| ctx.resume())
    }

    pub fn scrub_cancel(&self, device: DeviceId) -> Result<()> {
        self.with_device(device, |ctx| ctx.cancel())
    }

    pub fn scrub_progress(&self, device: DeviceId) -> Result<ScrubProgress> {
        let running = self.running.lock();
        running
            .get(&device)
            .map(|ctx| ctx.progress())
            .ok_or(ScrubError::DeviceNotFound(device))
    }

    fn with_device(&self, device: DeviceId, f: impl FnOnce(&ScrubContext)) -> Result<()> {
        let running = self.running.lock();
        let ctx = running.get(&device).ok_or(ScrubError::DeviceNotFound(device))?;
        f(ctx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::device::{
        BlockKind, ExtentFlags, ExtentRecord, InMemoryExtentTree, MockDevice, SimpleRaidMap,
    };
    use crate::storage::hardware_crc32c;
    use std::collections::HashMap as StdHashMap;

    struct TestLookup(StdHashMap<DeviceId, Arc<dyn BlockDevice>>);

    impl DeviceLookup for TestLookup {
        fn device(&self, id: DeviceId) -> Option<Arc<dyn BlockDevice>> {
            self.0.get(&id).cloned()
        }
    }

    #[tokio::test]
    async fn registry_rejects_double_start_then_frees_slot_on_completion() {
        let registry = ScrubRegistry::new();
        let sector = 16usize;
        let config = ScrubConfig {
            page_size: sector,
            sector_size: sector,
            node_size: sector,
            ..ScrubConfig::default()
        };
        let verify_ctx = VerifyContext {
            sectorsize: sector,
            ..VerifyContext::default()
        };

        let handle = registry
            .scrub_start(1, config.clone(), verify_ctx, 1_000_000)
            .unwrap();
        assert!(registry.scrub_start(1, config, verify_ctx, 1_000_000).is_err());

        let dev = Arc::new(MockDevice::new(1));
        let buf = vec![1u8; sector];
        let csum = hardware_crc32c(&buf);
        dev.seed(0, &buf);
        let mut extent_tree = InMemoryExtentTree::new();
        extent_tree.add_extent(ExtentRecord {
            logical: 0,
            length: sector as u64,
            flags: ExtentFlags {
                kind: BlockKind::Data,
                has_csum: true,
                nocow: false,
            },
            generation: 1,
        });
        extent_tree.set_csum(0, csum);
        let raid_map = SimpleRaidMap::single(1, 4096);
        let lookup = TestLookup(StdHashMap::from([(1, dev.clone() as Arc<dyn BlockDevice>)]));

        registry
            .run_to_completion(&handle, &raid_map, &extent_tree, &lookup, 0, sector as u64, None)
            .await
            .unwrap();

        let verify_ctx2 = VerifyContext {
            sectorsize: sector,
            ..VerifyContext::default()
        };
        assert!(registry
            .scrub_start(
                1,
                ScrubConfig {
                    page_size: sector,
                    sector_size: sector,
                    node_size: sector,
                    ..ScrubConfig::default()
                },
                verify_ctx2,
                1_000_000
            )
            .is_ok());
    }

    #[test]
    fn progress_lookup_on_unknown_device_is_device_not_found() {
        let registry = ScrubRegistry::new();
        assert!(matches!(
            registry.scrub_progress(99),
            Err(ScrubError::DeviceNotFound(99))
        ));
    }
}

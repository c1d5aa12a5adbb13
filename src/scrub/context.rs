//! Scrub context (spec §3 "Scrub context"): the process-wide per-device
//! handle bundling C2's batch pool, C6's rate controller, C8's synergy
//! filter, the pause/cancel broadcast, and statistics. Owns everything a
//! running scrub needs and is torn down once the walk returns.

use crate::config::ScrubConfig;
use crate::error::Result;
use crate::scrub::batch::BatchPool;
use crate::scrub::device::{BlockDevice, ControlToken, DeviceId, DeviceLookup, ExtentTree, Logical, RaidMap};
use crate::scrub::rate::RateController;
use crate::scrub::stats::{ScrubProgress, ScrubStats};
use crate::scrub::synergy::SynergyFilter;
use crate::scrub::verify::VerifyContext;
use crate::scrub::walker::ExtentWalker;
use std::sync::Arc;

/// Owns the batch pool, rate controller, statistics, synergy filter, and
/// control token for one scrub run against one device (spec §3: "a scrub
/// context is created at scrub start, owns all batches and their owned
/// pages").
pub struct ScrubContext {
    pub device: DeviceId,
    pub config: ScrubConfig,
    pub pool: BatchPool,
    pub rate: RateController,
    pub stats: Arc<ScrubStats>,
    pub synergy: Arc<SynergyFilter>,
    pub control: Arc<ControlToken>,
    pub verify_ctx: VerifyContext,
}

impl ScrubContext {
    pub fn new(device: DeviceId, config: ScrubConfig, verify_ctx: VerifyContext, target_bytes: u64) -> Self {
        let pool = BatchPool::new(
            config.default_pool_size,
            config.pages_per_batch,
            config.page_size,
            config.max_pool,
        );
        let rate = RateController::new(&config, target_bytes);
        Self {
            device,
            config,
            pool,
            rate,
            stats: Arc::new(ScrubStats::new()),
            synergy: Arc::new(SynergyFilter::new()),
            control: ControlToken::new(),
            verify_ctx,
        }
    }

    pub fn progress(&self) -> ScrubProgress {
        self.stats.snapshot()
    }

    pub fn pause(&self) {
        tracing::info!("scrub on device {} pausing", self.device);
        self.control.pause();
    }

    pub fn resume(&self) {
        tracing::info!("scrub on device {} resuming", self.device);
        self.control.resume();
    }

    pub fn cancel(&self) {
        tracing::info!("scrub on device {} cancelling", self.device);
        self.control.cancel();
    }

    /// Drives the extent walker across `[start, end)` on this context's
    /// device. `replace_target` is `Some` only for device-replace runs.
    pub async fn run(
        &self,
        raid_map: &dyn RaidMap,
        extent_tree: &dyn ExtentTree,
        lookup: &dyn DeviceLookup,
        start: Logical,
        end: Logical,
        replace_target: Option<&dyn BlockDevice>,
    ) -> Result<()> {
        tracing::info!(
            "scrub starting on device {} range [{}, {})",
            self.device,
            start,
            end
        );
        self.stats.reset();
        let mut walker = ExtentWalker::new(
            raid_map,
            extent_tree,
            lookup,
            &self.pool,
            &self.rate,
            &self.synergy,
            &self.control,
            &self.stats,
            self.verify_ctx,
            &self.config,
        );
        if let Some(target) = replace_target {
            walker = walker.with_replace_target(target);
        }
        let result = walker.scan_device_extent(self.device, start, end).await;
        match &result {
            Ok(()) => tracing::info!("scrub on device {} finished", self.device),
            Err(e) => tracing::info!("scrub on device {} stopped: {}", self.device, e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::device::{
        BlockKind, ExtentFlags, ExtentRecord, InMemoryExtentTree, MockDevice, SimpleRaidMap,
    };
    use crate::storage::hardware_crc32c;
    use std::collections::HashMap;

    struct TestLookup(HashMap<DeviceId, Arc<dyn BlockDevice>>);

    impl DeviceLookup for TestLookup {
        fn device(&self, id: DeviceId) -> Option<Arc<dyn BlockDevice>> {
            self.0.get(&id).cloned()
        }
    }

    #[tokio::test]
    async fn context_run_updates_progress_and_honors_cancel() {
        let sector = 16usize;
        let dev = Arc::new(MockDevice::new(1));
        let buf = vec![3u8; sector];
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
        let lookup = TestLookup(HashMap::from([(1, dev.clone() as Arc<dyn BlockDevice>)]));

        let config = ScrubConfig {
            page_size: sector,
            sector_size: sector,
            node_size: sector,
            pages_per_batch: 8,
            max_mirrors: 1,
            ..ScrubConfig::default()
        };
        let ctx = ScrubContext::new(1, config, VerifyContext { sectorsize: sector, ..VerifyContext::default() }, 1_000_000);

        ctx.run(&raid_map, &extent_tree, &lookup, 0, sector as u64, None)
            .await
            .unwrap();

        let progress = ctx.progress();
        assert_eq!(progress.data_extents_scrubbed, 1);
        assert_eq!(progress.data_bytes_verified, sector as u64);

        ctx.cancel();
        let result = ctx.run(&raid_map, &extent_tree, &lookup, 0, sector as u64, None).await;
        assert!(result.is_err());
    }
}

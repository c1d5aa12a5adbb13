//! C7: Extent walker (spec §4.4). For a device-extent on a device, computes
//! a RAID-aware stripe walk, searches the extent tree at commit-root for
//! overlapping extents, trims each to the stripe, and drives C2 (batch
//! submission), C4 (verification, via C3's own call to it) and C5
//! (recovery) for every sub-block.

use crate::config::ScrubConfig;
use crate::error::{Result, ScrubError};
use crate::ratelimit::{WarnKind, WarnLimiter};
use crate::scrub::batch::BatchPool;
use crate::scrub::block::Block;
use crate::scrub::device::{
    BlockDevice, BlockKind, ControlToken, DeviceId, DeviceLookup, Direction, ExtentRecord,
    ExtentTree, Logical, RaidMap, Stripe,
};
use crate::scrub::page::Page;
use crate::scrub::pipeline::submit_block;
use crate::scrub::rate::RateController;
use crate::scrub::recovery::{recover_block, RecoveryState};
use crate::scrub::stats::ScrubStats;
use crate::scrub::synergy::{Observer, SynergyFilter};
use crate::scrub::verify::{VerifyContext, VerifyOutcome};
use std::sync::atomic::Ordering;
use std::time::Instant;

pub struct ExtentWalker<'a> {
    raid_map: &'a dyn RaidMap,
    extent_tree: &'a dyn ExtentTree,
    lookup: &'a dyn DeviceLookup,
    pool: &'a BatchPool,
    rate: &'a RateController,
    synergy: &'a SynergyFilter,
    control: &'a ControlToken,
    stats: &'a ScrubStats,
    verify_ctx: VerifyContext,
    config: &'a ScrubConfig,
    replace_target: Option<&'a dyn BlockDevice>,
    started_at: Instant,
    /// spec §7: "Warnings are rate-limited at the source".
    warn_limiter: WarnLimiter,
}

impl<'a> ExtentWalker<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        raid_map: &'a dyn RaidMap,
        extent_tree: &'a dyn ExtentTree,
        lookup: &'a dyn DeviceLookup,
        pool: &'a BatchPool,
        rate: &'a RateController,
        synergy: &'a SynergyFilter,
        control: &'a ControlToken,
        stats: &'a ScrubStats,
        verify_ctx: VerifyContext,
        config: &'a ScrubConfig,
    ) -> Self {
        Self {
            raid_map,
            extent_tree,
            lookup,
            pool,
            rate,
            synergy,
            control,
            stats,
            verify_ctx,
            config,
            replace_target: None,
            started_at: Instant::now(),
            warn_limiter: WarnLimiter::default(),
        }
    }

    /// Re-derives the batch pool's target size from the rate controller
    /// (spec §4.6: recomputed on each batch completion) and grows or
    /// schedules a shrink of the pool to match.
    fn recompute_rate(&self) {
        let elapsed = self.started_at.elapsed();
        let progress = self.stats.data_bytes_scrubbed.load(Ordering::Relaxed)
            + self.stats.tree_bytes_scrubbed.load(Ordering::Relaxed);
        let (new_pool, delay) = self.rate.recompute(elapsed, progress);
        self.rate.update_boost(progress, elapsed);
        let current = self.pool.size();
        if new_pool > current {
            tracing::debug!(from = current, to = new_pool, "growing batch pool");
            self.pool.grow_to(new_pool);
        } else if new_pool < current {
            tracing::debug!(from = current, to = new_pool, "shrinking batch pool");
            self.pool.request_shrink_to(new_pool);
        }
        tracing::debug!(pool = new_pool, delay_us = delay.as_micros() as u64, "rate controller recomputed");
    }

    /// Switches the walker into device-replace mode: recovered pages are
    /// written to `target` instead of back onto the failing mirror.
    pub fn with_replace_target(mut self, target: &'a dyn BlockDevice) -> Self {
        self.replace_target = Some(target);
        self
    }

    /// Drains up to `max_events_per_poll` events from `observer` and applies
    /// them to the synergy filter (spec §4.7 "at each pause/idle point").
    pub fn process_synergy_events(&self, observer: &dyn Observer, task_id: u64) -> usize {
        self.synergy
            .process_events(observer, task_id, self.config.max_events_per_poll)
    }

    /// Walks every RAID stripe covering `[start, end)` on `device`, scrubbing
    /// every extent the extent tree reports inside each stripe (spec §4.4).
    pub async fn scan_device_extent(&self, device: DeviceId, start: Logical, end: Logical) -> Result<()> {
        let stripe_len = self.raid_map.stripe_len().max(1);
        let mut stripe_start = start - (start % stripe_len);

        while stripe_start < end {
            if self.control.is_cancelled() {
                return Err(ScrubError::Cancelled);
            }
            if self.control.is_paused() {
                // Drain: the current stripe's batches have already been
                // released synchronously by `submit_block`, so there is
                // nothing in flight to wait out here beyond the park
                // itself. Parking here (rather than mid-stripe) guarantees
                // resume restarts at `stripe_start`, satisfying spec §4.4's
                // "resumes exactly at the same logical offset".
                self.control.wait_for_resume().await;
                if self.control.is_cancelled() {
                    return Err(ScrubError::Cancelled);
                }
            }

            let stripe_end = (stripe_start + stripe_len).min(end);
            self.scan_stripe(device, stripe_start, stripe_end).await?;
            stripe_start += stripe_len;
        }
        Ok(())
    }

    async fn scan_stripe(&self, device: DeviceId, stripe_start: Logical, stripe_end: Logical) -> Result<()> {
        let extents = self.extent_tree.extents_in_range(stripe_start, stripe_end)?;

        for extent in extents {
            let ext_start = extent.logical.max(stripe_start);
            let ext_end = (extent.logical + extent.length).min(stripe_end);
            if ext_start >= ext_end {
                continue;
            }
            // Tie-break: a tree block that starts before this stripe or ends
            // past it straddles a stripe boundary, which violates metadata
            // layout invariants.
            if extent.flags.kind != BlockKind::Data
                && (extent.logical < stripe_start || extent.logical + extent.length > stripe_end)
            {
                if self.warn_limiter.allow(device, WarnKind::Structural) {
                    tracing::warn!(
                        "tree block at {} (len {}) straddles stripe [{}, {}), skipping",
                        extent.logical,
                        extent.length,
                        stripe_start,
                        stripe_end
                    );
                }
                continue;
            }
            self.scan_extent(device, &extent, ext_start, ext_end).await?;
        }
        Ok(())
    }

    async fn scan_extent(
        &self,
        device: DeviceId,
        extent: &ExtentRecord,
        range_start: Logical,
        range_end: Logical,
    ) -> Result<()> {
        let block_size = if extent.flags.kind == BlockKind::Data {
            self.config.sector_size
        } else {
            self.config.node_size
        };

        let mut offset = range_start;
        while offset < range_end {
            if self.control.is_cancelled() {
                return Err(ScrubError::Cancelled);
            }
            let len = block_size.min((range_end - offset) as usize) as u64;

            if self.synergy.should_skip(offset, len) {
                ScrubStats::add(&self.stats.skipped_extents, 1);
                offset += len;
                continue;
            }

            let csums = if extent.flags.has_csum {
                self.extent_tree.csum_range(offset, len)?
            } else {
                Vec::new()
            };

            self.scrub_sub_block(device, extent, offset, len, &csums).await?;
            offset += len;
        }
        Ok(())
    }

    async fn scrub_sub_block(
        &self,
        device: DeviceId,
        extent: &ExtentRecord,
        offset: Logical,
        len: u64,
        csums: &[(Logical, u32)],
    ) -> Result<()> {
        let mapping = self.raid_map.map(offset, len, Direction::Read)?;
        let bound = mapping.mirror_num.min(self.config.max_mirrors as u8);
        if let Some(first) = mapping.stripes.first() {
            ScrubStats::set_max(&self.stats.last_physical, first.physical + len);
        }

        for mirror in 0..bound {
            if self.control.is_cancelled() {
                return Err(ScrubError::Cancelled);
            }
            let stripe = self.raid_map.map_mirror(offset, len, mirror)?;
            let dev = match self.lookup.device(stripe.device) {
                Some(d) => d,
                None => return Err(ScrubError::DeviceNotFound(stripe.device)),
            };

            let pages = self.build_pages(&stripe, offset, len, extent, csums);
            let block = Block::new(device, offset, extent.flags.kind, extent.flags, extent.generation, pages);

            let outcome = submit_block(
                self.pool,
                dev.as_ref(),
                &block,
                Direction::Read,
                &self.verify_ctx,
                self.rate,
            )
            .await?;

            if !block.no_io_error_seen() {
                ScrubStats::add(&self.stats.read_errors, 1);
            }
            self.record_verify_stats(extent.flags.kind, len, &outcome.verify);

            if outcome.needs_recovery {
                let report = recover_block(
                    &block,
                    mirror,
                    self.raid_map,
                    self.lookup,
                    &self.verify_ctx,
                    self.config.max_mirrors,
                    self.config.page_size,
                    self.replace_target,
                )
                .await?;
                self.record_recovery_stats(device, offset, &report);
            }
        }
        self.recompute_rate();
        Ok(())
    }

    fn build_pages(
        &self,
        stripe: &Stripe,
        offset: Logical,
        len: u64,
        extent: &ExtentRecord,
        csums: &[(Logical, u32)],
    ) -> Vec<Page> {
        let page_size = self.config.page_size.min(len as usize).max(1);
        let mut pages = Vec::new();
        let mut consumed = 0u64;
        while consumed < len {
            let this_len = page_size.min((len - consumed) as usize);
            let page_logical = offset + consumed;
            let page_physical = stripe.physical + consumed;
            let mut page = Page::new(
                stripe.device,
                stripe.mirror,
                page_logical,
                page_physical,
                this_len,
                extent.generation,
            );
            if extent.flags.has_csum {
                if let Some((_, csum)) = csums.iter().find(|(l, _)| *l == page_logical) {
                    page = page.with_csum(*csum);
                }
            }
            pages.push(page);
            consumed += this_len as u64;
        }
        pages
    }

    fn record_verify_stats(&self, kind: BlockKind, len: u64, outcome: &VerifyOutcome) {
        let (bytes_counter, extents_counter, verified_counter) = match kind {
            BlockKind::Data => (
                &self.stats.data_bytes_scrubbed,
                &self.stats.data_extents_scrubbed,
                &self.stats.data_bytes_verified,
            ),
            _ => (
                &self.stats.tree_bytes_scrubbed,
                &self.stats.tree_extents_scrubbed,
                &self.stats.tree_bytes_verified,
            ),
        };
        ScrubStats::add(bytes_counter, len);
        ScrubStats::add(extents_counter, 1);
        match outcome {
            VerifyOutcome::Ok => ScrubStats::add(verified_counter, len),
            VerifyOutcome::NoCsum => ScrubStats::add(&self.stats.no_csum, 1),
            VerifyOutcome::ChecksumMismatch => ScrubStats::add(&self.stats.csum_errors, 1),
            VerifyOutcome::HeaderMismatch(_) => ScrubStats::add(&self.stats.verify_errors, 1),
            VerifyOutcome::GenerationMismatch { .. } => ScrubStats::add(&self.stats.verify_errors, 1),
        }
    }

    fn record_recovery_stats(&self, device: DeviceId, logical: Logical, report: &crate::scrub::recovery::RecoveryReport) {
        if report.super_error {
            ScrubStats::add(&self.stats.super_errors, 1);
            if self.warn_limiter.allow(device, WarnKind::SuperBlock) {
                tracing::error!(
                    "super-block error on device {} logical {}: reported only, repaired on next commit",
                    device,
                    logical
                );
            }
        }
        if report.unverified {
            ScrubStats::add(&self.stats.unverified_errors, 1);
        }
        match report.state {
            // Spec §4.5 step 3: the page-by-page reread came back clean, a
            // success outcome in its own right, not a failed repair attempt.
            RecoveryState::Unverified => {}
            RecoveryState::RepairBlockFromGood | RecoveryState::RepairPagesOnly => {
                if report.corrected {
                    ScrubStats::add(&self.stats.corrected_errors, 1);
                } else {
                    ScrubStats::add(&self.stats.uncorrectable_errors, 1);
                    if self.warn_limiter.allow(device, WarnKind::Uncorrectable) {
                        tracing::error!(
                            "uncorrectable block on device {} at logical {}",
                            device,
                            logical
                        );
                    }
                }
            }
            RecoveryState::Uncorrectable | RecoveryState::NodatasumFallback => {
                ScrubStats::add(&self.stats.uncorrectable_errors, 1);
                if self.warn_limiter.allow(device, WarnKind::Uncorrectable) {
                    tracing::error!(
                        "uncorrectable block on device {} at logical {}",
                        device,
                        logical
                    );
                }
            }
            RecoveryState::SuperReportOnly => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::device::{ExtentFlags, InMemoryExtentTree, MockDevice, SimpleRaidMap};
    use crate::storage::hardware_crc32c;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct TestLookup(HashMap<DeviceId, Arc<dyn crate::scrub::device::BlockDevice>>);

    impl DeviceLookup for TestLookup {
        fn device(&self, id: DeviceId) -> Option<Arc<dyn crate::scrub::device::BlockDevice>> {
            self.0.get(&id).cloned()
        }
    }

    fn seed_device_with_valid_sectors(dev: &MockDevice, start: u64, count: u64, sector: usize) -> Vec<(u64, u32)> {
        let mut csums = Vec::new();
        for i in 0..count {
            let logical = start + i * sector as u64;
            let buf = vec![(i + 1) as u8; sector];
            dev.seed(logical, &buf);
            csums.push((logical, hardware_crc32c(&buf)));
        }
        csums
    }

    #[tokio::test]
    async fn walker_scrubs_clean_extent_with_no_recovery() {
        let sector = 16usize;
        let dev_a = Arc::new(MockDevice::new(1));
        let csums = seed_device_with_valid_sectors(&dev_a, 0, 4, sector);

        let raid_map = SimpleRaidMap::single(1, 4096);
        let mut extent_tree = InMemoryExtentTree::new();
        extent_tree.add_extent(ExtentRecord {
            logical: 0,
            length: (sector * 4) as u64,
            flags: ExtentFlags {
                kind: BlockKind::Data,
                has_csum: true,
                nocow: false,
            },
            generation: 1,
        });
        for (logical, csum) in &csums {
            extent_tree.set_csum(*logical, *csum);
        }

        let lookup = TestLookup(HashMap::from([(
            1,
            dev_a.clone() as Arc<dyn crate::scrub::device::BlockDevice>,
        )]));

        let config = ScrubConfig {
            page_size: sector,
            sector_size: sector,
            node_size: sector * 4,
            pages_per_batch: 8,
            max_mirrors: 1,
            ..ScrubConfig::default()
        };
        let pool = BatchPool::new(2, config.pages_per_batch, config.page_size, config.max_pool);
        let rate = RateController::new(&config, 1_000_000);
        let synergy = SynergyFilter::new();
        let control = ControlToken::new();
        let stats = ScrubStats::new();
        let verify_ctx = VerifyContext {
            sectorsize: sector,
            ..VerifyContext::default()
        };

        let walker = ExtentWalker::new(
            &raid_map,
            &extent_tree,
            &lookup,
            &pool,
            &rate,
            &synergy,
            &control,
            &stats,
            verify_ctx,
            &config,
        );

        walker
            .scan_device_extent(1, 0, (sector * 4) as u64)
            .await
            .unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.data_extents_scrubbed, 4);
        assert_eq!(snap.data_bytes_verified, (sector * 4) as u64);
        assert_eq!(snap.csum_errors, 0);
        assert_eq!(snap.uncorrectable_errors, 0);
    }

    #[tokio::test]
    async fn walker_skips_synergy_marked_range() {
        let sector = 16usize;
        let dev_a = Arc::new(MockDevice::new(1));
        dev_a.seed(0, &vec![9u8; sector]);

        let raid_map = SimpleRaidMap::single(1, 4096);
        let mut extent_tree = InMemoryExtentTree::new();
        extent_tree.add_extent(ExtentRecord {
            logical: 0,
            length: sector as u64,
            flags: ExtentFlags {
                kind: BlockKind::Data,
                has_csum: false,
                nocow: false,
            },
            generation: 1,
        });

        let lookup = TestLookup(HashMap::from([(
            1,
            dev_a.clone() as Arc<dyn crate::scrub::device::BlockDevice>,
        )]));

        let config = ScrubConfig {
            page_size: sector,
            sector_size: sector,
            node_size: sector,
            pages_per_batch: 8,
            max_mirrors: 1,
            ..ScrubConfig::default()
        };
        let pool = BatchPool::new(2, config.pages_per_batch, config.page_size, config.max_pool);
        let rate = RateController::new(&config, 1_000_000);
        let synergy = SynergyFilter::new();
        synergy.mark(0, sector as u64);
        let control = ControlToken::new();
        let stats = ScrubStats::new();
        let verify_ctx = VerifyContext {
            sectorsize: sector,
            ..VerifyContext::default()
        };

        let walker = ExtentWalker::new(
            &raid_map,
            &extent_tree,
            &lookup,
            &pool,
            &rate,
            &synergy,
            &control,
            &stats,
            verify_ctx,
            &config,
        );

        walker.scan_device_extent(1, 0, sector as u64).await.unwrap();

        assert_eq!(synergy.skip_count(), 1);
        assert_eq!(stats.snapshot().data_extents_scrubbed, 0);
        assert_eq!(stats.snapshot().skipped_extents, 1);
    }

    #[tokio::test]
    async fn walker_recovers_corrupted_mirror_in_raid1() {
        let sector = 16usize;
        let good_buf = vec![7u8; sector];
        let csum = hardware_crc32c(&good_buf);

        let dev_a = Arc::new(MockDevice::new(1));
        dev_a.seed(0, &good_buf);
        dev_a.corrupt_byte(0);
        let dev_b = Arc::new(MockDevice::new(2));
        dev_b.seed(0, &good_buf);

        let raid_map = SimpleRaidMap::raid1(vec![1, 2], 4096);
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

        let lookup = TestLookup(HashMap::from([
            (1, dev_a.clone() as Arc<dyn crate::scrub::device::BlockDevice>),
            (2, dev_b.clone() as Arc<dyn crate::scrub::device::BlockDevice>),
        ]));

        let config = ScrubConfig {
            page_size: sector,
            sector_size: sector,
            node_size: sector,
            pages_per_batch: 8,
            max_mirrors: 2,
            ..ScrubConfig::default()
        };
        let pool = BatchPool::new(2, config.pages_per_batch, config.page_size, config.max_pool);
        let rate = RateController::new(&config, 1_000_000);
        let synergy = SynergyFilter::new();
        let control = ControlToken::new();
        let stats = ScrubStats::new();
        let verify_ctx = VerifyContext {
            sectorsize: sector,
            ..VerifyContext::default()
        };

        let walker = ExtentWalker::new(
            &raid_map,
            &extent_tree,
            &lookup,
            &pool,
            &rate,
            &synergy,
            &control,
            &stats,
            verify_ctx,
            &config,
        );

        walker.scan_device_extent(1, 0, sector as u64).await.unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.csum_errors, 1);
        assert_eq!(snap.corrected_errors, 1);
        assert_eq!(snap.uncorrectable_errors, 0);

        let mut repaired = vec![0u8; sector];
        dev_a.read_at(0, &mut repaired).await.unwrap();
        assert_eq!(repaired, good_buf);
    }

    #[tokio::test]
    async fn cancellation_short_circuits_the_walk() {
        let dev_a = Arc::new(MockDevice::new(1));
        let raid_map = SimpleRaidMap::single(1, 4096);
        let extent_tree = InMemoryExtentTree::new();
        let lookup = TestLookup(HashMap::from([(
            1,
            dev_a.clone() as Arc<dyn crate::scrub::device::BlockDevice>,
        )]));
        let config = ScrubConfig::default();
        let pool = BatchPool::new(2, config.pages_per_batch, config.page_size, config.max_pool);
        let rate = RateController::new(&config, 1_000_000);
        let synergy = SynergyFilter::new();
        let control = ControlToken::new();
        control.cancel();
        let stats = ScrubStats::new();
        let verify_ctx = VerifyContext::default();

        let walker = ExtentWalker::new(
            &raid_map,
            &extent_tree,
            &lookup,
            &pool,
            &rate,
            &synergy,
            &control,
            &stats,
            verify_ctx,
            &config,
        );

        let result = walker.scan_device_extent(1, 0, 4096).await;
        assert!(matches!(result, Err(ScrubError::Cancelled)));
    }
}

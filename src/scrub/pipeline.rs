//! C3: Submission & completion pipeline (spec §4.2). Takes a Block whose
//! pages are already laid out contiguously (spec §3 "Read-batch" invariant),
//! drives it through the batch pool, issues the I/O, and runs block-complete
//! exactly once per Block.
//!
//! This implementation executes one batch per Block synchronously rather
//! than fanning work out across a worker pool: the ordering guarantee and
//! pacing behavior spec §4.2/§4.6 describe are observable either way; what's
//! out of scope is the thread-pool fan-out itself (spec §5 "Scheduling
//! model" names it, but doesn't make it part of this crate's testable
//! surface).

use crate::error::{Result, ScrubError};
use crate::scrub::batch::BatchPool;
use crate::scrub::block::BlockRef;
use crate::scrub::device::{BlockDevice, Direction};
use crate::scrub::rate::{pacing_remainder, RateController};
use crate::scrub::verify::{verify_block, VerifyContext, VerifyOutcome};
use std::time::Instant;

pub struct SubmitOutcome {
    pub verify: VerifyOutcome,
    /// Block-complete decision (spec §4.3): false only when
    /// `no_io_error_seen() && verify.is_ok()`.
    pub needs_recovery: bool,
}

/// Submits `block`'s pages as one batch, in direction `direction`, pacing
/// the return of the batch slot to the free-list per the rate controller's
/// current delay (spec §4.6 "Pacing").
pub async fn submit_block(
    pool: &BatchPool,
    device: &dyn BlockDevice,
    block: &BlockRef,
    direction: Direction,
    verify_ctx: &VerifyContext,
    rate: &RateController,
) -> Result<SubmitOutcome> {
    let page_count = block.page_count();
    if page_count == 0 {
        return Err(ScrubError::Structural(format!(
            "block at {} has no pages",
            block.logical
        )));
    }

    let slot = pool.acquire_free().await;
    for idx in 0..page_count {
        let (dev, mirror, logical, physical) =
            block.with_page(idx, |p| (p.device, p.mirror, p.logical, p.physical));
        let fits = pool.with_slot(slot, |batch| {
            batch.try_append(dev, mirror, logical, physical, direction, block.clone(), idx)
        });
        if !fits {
            pool.release_or_shrink(slot);
            return Err(ScrubError::Structural(format!(
                "block at {} does not fit contiguously in one batch (capacity exceeded)",
                block.logical
            )));
        }
    }
    pool.with_slot(slot, |batch| batch.issued_at = Some(Instant::now()));

    // Spec §4.2(a): on any error, mark every page and clear no_io_error_seen.
    let mut batch_error = false;
    for idx in 0..page_count {
        let (physical, len) = block.with_page(idx, |p| (p.physical, p.buf.len()));
        match direction {
            Direction::Read => {
                let mut buf = vec![0u8; len];
                match device.read_at(physical, &mut buf).await {
                    Ok(()) => block.with_page_mut(idx, |p| p.buf = buf),
                    Err(_) => batch_error = true,
                }
            }
            Direction::Write => {
                let src = block.with_page(idx, |p| p.buf.clone());
                if device.write_at(physical, &src).await.is_err() {
                    batch_error = true;
                }
            }
        }
    }
    if batch_error {
        for idx in 0..page_count {
            block.mark_io_error(idx);
        }
    }

    // Spec §4.2(b): decrement outstanding_pages per page; block-complete
    // runs on the transition to zero.
    let mut block_complete = false;
    for _ in 0..page_count {
        block_complete = block.complete_page();
    }
    debug_assert!(
        block_complete,
        "submit_block drives exactly one batch covering every page of this block"
    );

    let issued_at = pool.with_slot(slot, |batch| batch.issued_at);
    if let Some(start) = issued_at {
        let scaled_wait = pacing_remainder(
            rate.delay(),
            page_count,
            rate.max_pages_per_batch(),
            start.elapsed(),
        );
        if let Some(wait) = scaled_wait {
            tracing::debug!(pages = page_count, delay_ms = wait.as_millis() as u64, "pacing batch before release");
            tokio::time::sleep(wait).await;
        }
    }
    pool.release_or_shrink(slot);

    let verify = if direction == Direction::Read {
        verify_block(block, verify_ctx)
    } else {
        VerifyOutcome::Ok
    };
    let needs_recovery = !block.no_io_error_seen() || !verify.is_ok();
    Ok(SubmitOutcome {
        verify,
        needs_recovery,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScrubConfig;
    use crate::scrub::block::Block;
    use crate::scrub::device::{BlockKind, ExtentFlags, MockDevice};
    use crate::scrub::page::Page;
    use crate::storage::hardware_crc32c;

    fn data_flags() -> ExtentFlags {
        ExtentFlags {
            kind: BlockKind::Data,
            has_csum: true,
            nocow: false,
        }
    }

    #[tokio::test]
    async fn clean_block_round_trips_with_no_recovery_needed() {
        let page_size = 16;
        let buf = vec![5u8; page_size];
        let csum = hardware_crc32c(&buf);
        let device = MockDevice::new(1);
        device.seed(0, &buf);

        let mut page = Page::new(1, 0, 0, 0, page_size, 1);
        page = page.with_csum(csum);
        let block = Block::new(1, 0, BlockKind::Data, data_flags(), 1, vec![page]);

        let config = ScrubConfig {
            page_size,
            sector_size: page_size,
            pages_per_batch: 4,
            ..ScrubConfig::default()
        };
        let pool = BatchPool::new(2, config.pages_per_batch, page_size, config.max_pool);
        let rate = RateController::new(&config, 4096);
        let verify_ctx = VerifyContext {
            sectorsize: page_size,
            ..VerifyContext::default()
        };

        let outcome = submit_block(&pool, &device, &block, Direction::Read, &verify_ctx, &rate)
            .await
            .unwrap();
        assert_eq!(outcome.verify, VerifyOutcome::Ok);
        assert!(!outcome.needs_recovery);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test]
    async fn read_failure_marks_block_and_requires_recovery() {
        let page_size = 16;
        let device = MockDevice::new(1);
        device.fail_at(0);

        let page = Page::new(1, 0, 0, 0, page_size, 1);
        let block = Block::new(1, 0, BlockKind::Data, data_flags(), 1, vec![page]);

        let config = ScrubConfig {
            page_size,
            sector_size: page_size,
            pages_per_batch: 4,
            ..ScrubConfig::default()
        };
        let pool = BatchPool::new(1, config.pages_per_batch, page_size, config.max_pool);
        let rate = RateController::new(&config, 4096);
        let verify_ctx = VerifyContext {
            sectorsize: page_size,
            ..VerifyContext::default()
        };

        let outcome = submit_block(&pool, &device, &block, Direction::Read, &verify_ctx, &rate)
            .await
            .unwrap();
        assert!(outcome.needs_recovery);
        assert!(!block.no_io_error_seen());
    }
}

//! C5: Error-recovery state machine (spec §4.5). Entered from block-complete
//! whenever a Block fails verification. Walks the states named in the spec
//! verbatim: `OK -> SUPER_REPORT_ONLY | NODATASUM_FALLBACK | MIRROR_SEARCH ->
//! REPAIR_BLOCK_FROM_GOOD | REPAIR_PAGES_ONLY | UNCORRECTABLE`.
//!
//! Non-goal carried over from spec §1: no combinatorial search for the
//! minimum surviving page-set across many mirrors (each mirror is tried at
//! most once per Block per scrub pass, spec §4.5 "Failure semantics").

use crate::error::{Result, ScrubError};
use crate::scrub::block::{Block, BlockRef};
use crate::scrub::device::{BlockDevice, BlockKind, DeviceId, DeviceLookup, Direction, ExtentFlags, RaidMap};
use crate::scrub::page::Page;
use crate::scrub::verify::{verify_block, VerifyContext};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    SuperReportOnly,
    NodatasumFallback,
    /// Step 3 of spec §4.5: the page-by-page reread of the failing mirror
    /// came back clean, so the original failure was merge-induced or
    /// transient rather than a real fault. This is a success outcome, not a
    /// repair: nothing was rewritten, and it must not be counted alongside
    /// REPAIR_BLOCK_FROM_GOOD/REPAIR_PAGES_ONLY failures as uncorrectable.
    Unverified,
    RepairBlockFromGood,
    RepairPagesOnly,
    Uncorrectable,
}

#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub state: RecoveryState,
    /// Set alongside `RecoveryState::Unverified` (spec §4.5 step 3).
    pub unverified: bool,
    pub corrected: bool,
    pub super_error: bool,
    /// Replace-mode only: pages with no good source, written as zeros.
    pub zero_filled_pages: usize,
}

impl RecoveryReport {
    fn simple(state: RecoveryState) -> Self {
        Self {
            state,
            unverified: false,
            corrected: false,
            super_error: false,
            zero_filled_pages: 0,
        }
    }
}

/// Finds the checksum the original (pre-recovery) Block recorded for the
/// page at `logical`, if any. Data-block checksums live in the csum-tree
/// rather than in the page bytes themselves, so a freshly-built recheck
/// block has no way to know them independently: they have to be carried
/// forward from the Block that triggered recovery.
fn csum_for_logical(block: &BlockRef, logical: u64) -> Option<u32> {
    for idx in 0..block.page_count() {
        let (page_logical, csum) = block.with_page(idx, |p| (p.logical, p.csum));
        if page_logical == logical {
            return csum;
        }
    }
    None
}

/// Builds a fresh recheck-block for `mirror` covering `[logical,
/// logical+length)`, reading page-by-page to defeat bio-merging (spec §4.5
/// step 2: "Re-issue reads page-by-page (not batched)"). `csum_source`, when
/// given, carries forward data-block checksums from the Block that failed
/// (see `csum_for_logical`); tree/super blocks verify from their own
/// embedded header and need no external source.
#[allow(clippy::too_many_arguments)]
async fn build_recheck_block(
    raid_map: &dyn RaidMap,
    lookup: &dyn DeviceLookup,
    logical: u64,
    length: u64,
    mirror: u8,
    generation: u64,
    kind: BlockKind,
    flags: ExtentFlags,
    page_size: usize,
    csum_source: Option<&BlockRef>,
) -> Result<BlockRef> {
    let stripe = raid_map.map_mirror(logical, length, mirror)?;
    let device = lookup
        .device(stripe.device)
        .ok_or(ScrubError::DeviceNotFound(stripe.device))?;
    let n_pages = ((length as usize) + page_size - 1) / page_size;
    let mut pages = Vec::with_capacity(n_pages.max(1));
    for i in 0..n_pages.max(1) {
        let offset = (i * page_size) as u64;
        let mut page = Page::new(
            stripe.device,
            mirror,
            logical + offset,
            stripe.physical + offset,
            page_size,
            generation,
        );
        if device.read_at(page.physical, &mut page.buf).await.is_err() {
            page.io_error = true;
        }
        if kind == BlockKind::Data {
            if let Some(src) = csum_source {
                if let Some(csum) = csum_for_logical(src, page.logical) {
                    page = page.with_csum(csum);
                }
            }
        }
        pages.push(page);
    }
    Ok(Block::new(stripe.device, logical, kind, flags, generation, pages))
}

async fn write_block_to_mirror(
    good: &BlockRef,
    raid_map: &dyn RaidMap,
    lookup: &dyn DeviceLookup,
    target_mirror: u8,
) -> Result<()> {
    let stripe = raid_map.map_mirror(good.logical, good.byte_len(), target_mirror)?;
    let device = lookup
        .device(stripe.device)
        .ok_or(ScrubError::DeviceNotFound(stripe.device))?;
    for idx in 0..good.page_count() {
        let (delta, buf) =
            good.with_page(idx, |p| (p.logical - good.logical, p.buf.clone()));
        device.write_at(stripe.physical + delta, &buf).await?;
    }
    Ok(())
}

async fn write_block_to_target(good: &BlockRef, target: &dyn BlockDevice) -> Result<()> {
    for idx in 0..good.page_count() {
        let (physical, buf) = good.with_page(idx, |p| (p.physical, p.buf.clone()));
        target.write_at(physical, &buf).await?;
    }
    Ok(())
}

/// Replace-mode variant of recovery: instead of repairing the bad mirror in
/// place, every page is copied onto the replacement target, one mirror scan
/// at a time; pages with no clean source anywhere are zero-filled (spec
/// §4.5 "Replace-mode differs").
#[allow(clippy::too_many_arguments)]
async fn replace_mode_copy(
    bad: &BlockRef,
    raid_map: &dyn RaidMap,
    lookup: &dyn DeviceLookup,
    target: &dyn BlockDevice,
    bound: u8,
    page_size: usize,
) -> Result<RecoveryReport> {
    let mut zero_filled = 0usize;
    let mut corrected = 0usize;
    let page_count = bad.page_count();
    for i in 0..page_count {
        let page_logical = bad.logical + (i * page_size) as u64;
        let mut written = false;
        for mirror in 0..bound {
            let candidate = build_recheck_block(
                raid_map,
                lookup,
                page_logical,
                page_size as u64,
                mirror,
                bad.generation,
                bad.kind,
                bad.flags,
                page_size,
                Some(bad),
            )
            .await?;
            let clean_page = candidate.with_page(0, |p| (!p.io_error).then(|| (p.physical, p.buf.clone())));
            if let Some((physical, buf)) = clean_page {
                target.write_at(physical, &buf).await?;
                written = true;
                corrected += 1;
                break;
            }
        }
        if !written {
            let physical = bad.with_page(i, |p| p.physical);
            target.write_at(physical, &vec![0u8; page_size]).await?;
            zero_filled += 1;
        }
    }
    let state = if zero_filled == 0 {
        RecoveryState::RepairPagesOnly
    } else {
        RecoveryState::Uncorrectable
    };
    Ok(RecoveryReport {
        state,
        unverified: false,
        corrected: corrected > 0,
        super_error: false,
        zero_filled_pages: zero_filled,
    })
}

/// Runs the recovery state machine for a Block that failed verification on
/// `failing_mirror`. `replace` is `Some` only during device-replace mode.
#[allow(clippy::too_many_arguments)]
pub async fn recover_block(
    bad: &BlockRef,
    failing_mirror: u8,
    raid_map: &dyn RaidMap,
    lookup: &dyn DeviceLookup,
    verify_ctx: &VerifyContext,
    max_mirrors: usize,
    page_size: usize,
    replace: Option<&dyn BlockDevice>,
) -> Result<RecoveryReport> {
    if bad.kind == BlockKind::SuperBlock {
        let mut report = RecoveryReport::simple(RecoveryState::SuperReportOnly);
        report.super_error = true;
        return Ok(report);
    }

    let length = bad.byte_len();
    let mapping = raid_map.map(bad.logical, length, Direction::Read)?;
    let bound = mapping.mirror_num.min(max_mirrors as u8);

    if let Some(target) = replace {
        return replace_mode_copy(bad, raid_map, lookup, target, bound, page_size).await;
    }

    // Step 2/3: page-by-page reread of the failing mirror.
    let recheck_failing = build_recheck_block(
        raid_map,
        lookup,
        bad.logical,
        length,
        failing_mirror,
        bad.generation,
        bad.kind,
        bad.flags,
        page_size,
        Some(bad),
    )
    .await?;

    if recheck_failing.no_io_error_seen() && verify_block(&recheck_failing, verify_ctx).is_ok() {
        let mut report = RecoveryReport::simple(RecoveryState::Unverified);
        report.unverified = true;
        return Ok(report);
    }

    // Step 4: scan other mirrors, ascending, skipping the failing one.
    for mirror in 0..bound {
        if mirror == failing_mirror {
            continue;
        }
        let candidate = build_recheck_block(
            raid_map,
            lookup,
            bad.logical,
            length,
            mirror,
            bad.generation,
            bad.kind,
            bad.flags,
            page_size,
            Some(bad),
        )
        .await?;
        if candidate.no_io_error_seen() && verify_block(&candidate, verify_ctx).is_ok() {
            write_block_to_mirror(&candidate, raid_map, lookup, failing_mirror).await?;
            let mut report = RecoveryReport::simple(RecoveryState::RepairBlockFromGood);
            report.corrected = true;
            return Ok(report);
        }
    }

    // Step 5: no entirely-clean mirror; try per-page coverage instead.
    let mut repaired_pages = recheck_failing.snapshot_pages();
    let mut fully_covered = true;
    for idx in 0..repaired_pages.len() {
        if !repaired_pages[idx].io_error {
            continue;
        }
        let page_logical = repaired_pages[idx].logical;
        let mut found = false;
        for mirror in 0..bound {
            if mirror == failing_mirror {
                continue;
            }
            let candidate = build_recheck_block(
                raid_map,
                lookup,
                page_logical,
                page_size as u64,
                mirror,
                bad.generation,
                bad.kind,
                bad.flags,
                page_size,
                Some(bad),
            )
            .await?;
            let clean = candidate.with_page(0, |p| (!p.io_error).then(|| p.clone()));
            if let Some(p) = clean {
                repaired_pages[idx] = p;
                found = true;
                break;
            }
        }
        if !found {
            fully_covered = false;
        }
    }

    if fully_covered {
        let repaired = Block::new(
            bad.device,
            bad.logical,
            bad.kind,
            bad.flags,
            bad.generation,
            repaired_pages,
        );
        if verify_block(&repaired, verify_ctx).is_ok() {
            write_block_to_mirror(&repaired, raid_map, lookup, failing_mirror).await?;
            let mut report = RecoveryReport::simple(RecoveryState::RepairPagesOnly);
            report.corrected = true;
            return Ok(report);
        }
    }

    // Step 6: nodatasum fallback for nocow data without a checksum. Per the
    // open question resolved in spec §9(b), this is still reported as
    // uncorrectable, no new policy is invented here.
    if bad.kind == BlockKind::Data && bad.flags.nocow && !bad.flags.has_csum {
        return Ok(RecoveryReport::simple(RecoveryState::NodatasumFallback));
    }

    Ok(RecoveryReport::simple(RecoveryState::Uncorrectable))
}

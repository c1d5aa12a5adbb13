// # scrubd
//
// Main entry point for the background scrub daemon. Owns one `ScrubContext`
// per device and drives it to completion against a directory of mock mirror
// files, there being no real block layer in scope for this crate (spec §1).

use btrfs_scrubd::scrub::device::{
    BlockKind, ExtentFlags, ExtentRecord, InMemoryExtentTree, MockDevice, SimpleRaidMap,
};
use btrfs_scrubd::scrub::verify::VerifyContext;
use btrfs_scrubd::scrub::ScrubRegistry;
use btrfs_scrubd::storage::hardware_crc32c;
use btrfs_scrubd::{Result, ScrubConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct DemoLookup(HashMap<u64, Arc<dyn btrfs_scrubd::scrub::device::BlockDevice>>);

impl btrfs_scrubd::scrub::device::DeviceLookup for DemoLookup {
    fn device(&self, id: u64) -> Option<Arc<dyn btrfs_scrubd::scrub::device::BlockDevice>> {
        self.0.get(&id).cloned()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let config = ScrubConfig {
        page_size: 4096,
        sector_size: 4096,
        node_size: 16384,
        pages_per_batch: 16,
        max_pool: 32,
        default_pool_size: 4,
        ..ScrubConfig::default()
    }
    .with_deadline(5);

    print_config(&config);

    let (mirror_a, mirror_b) = (1u64, 2u64);
    let dev_a = Arc::new(MockDevice::new(mirror_a));
    let dev_b = Arc::new(MockDevice::new(mirror_b));

    let sector = config.sector_size;
    let mut extent_tree = InMemoryExtentTree::new();
    let extent_count = 8u64;
    let extent_len = sector as u64;
    for i in 0..extent_count {
        let logical = i * extent_len;
        let buf = vec![(i + 1) as u8; sector];
        dev_a.seed(logical, &buf);
        dev_b.seed(logical, &buf);
        let csum = hardware_crc32c(&buf);
        extent_tree.set_csum(logical, csum);
        extent_tree.add_extent(ExtentRecord {
            logical,
            length: extent_len,
            flags: ExtentFlags {
                kind: BlockKind::Data,
                has_csum: true,
                nocow: false,
            },
            generation: 1,
        });
    }
    // Seed one bit-flip so the demo run exercises recovery (spec §8 S2).
    dev_a.corrupt_byte(2 * extent_len);

    let raid_map = SimpleRaidMap::raid1(vec![mirror_a, mirror_b], 64 * 1024);
    let lookup = DemoLookup(HashMap::from([
        (mirror_a, dev_a.clone() as Arc<dyn btrfs_scrubd::scrub::device::BlockDevice>),
        (mirror_b, dev_b.clone() as Arc<dyn btrfs_scrubd::scrub::device::BlockDevice>),
    ]));
    let verify_ctx = VerifyContext {
        sectorsize: sector,
        ..VerifyContext::default()
    };

    let registry = ScrubRegistry::new();
    let target_bytes = extent_count * extent_len;
    let handle = registry.scrub_start(mirror_a, config, verify_ctx, target_bytes)?;

    info!("scrub started on device {}", mirror_a);
    let result = registry
        .run_to_completion(
            &handle,
            &raid_map,
            &extent_tree,
            &lookup,
            0,
            target_bytes,
            None,
        )
        .await;

    match result {
        Ok(()) => info!("scrub finished"),
        Err(e) => error!("scrub aborted: {}", e),
    }

    print_progress(&handle.progress());
    Ok(())
}

fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║  scrubd - background data scrubber                          ║");
    println!("║  btrfs-family checksum/RAID mirror verification  v{:<10}║", VERSION);
    println!("╚════════════════════════════════════════════════════════════╝");
    println!();
}

fn print_config(config: &ScrubConfig) {
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ SCRUB CONFIGURATION                                         │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│   Page size:              {:<30} │", format!("{} bytes", config.page_size));
    println!("│   Sector size:            {:<30} │", format!("{} bytes", config.sector_size));
    println!("│   Node size:              {:<30} │", format!("{} bytes", config.node_size));
    println!("│   Pages per batch:        {:<30} │", config.pages_per_batch);
    println!("│   Max pool size:          {:<30} │", config.max_pool);
    println!(
        "│   Deadline:               {:<30} │",
        config
            .deadline
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "none".to_string())
    );
    println!("└─────────────────────────────────────────────────────────────┘");
    println!();
}

fn print_progress(progress: &btrfs_scrubd::scrub::stats::ScrubProgress) {
    println!();
    println!("┌─────────────────────────────────────────────────────────────┐");
    println!("│ SCRUB PROGRESS                                              │");
    println!("├─────────────────────────────────────────────────────────────┤");
    println!("│   data_bytes_scrubbed:    {:<30} │", progress.data_bytes_scrubbed);
    println!("│   data_bytes_verified:    {:<30} │", progress.data_bytes_verified);
    println!("│   csum_errors:            {:<30} │", progress.csum_errors);
    println!("│   corrected_errors:       {:<30} │", progress.corrected_errors);
    println!("│   uncorrectable_errors:   {:<30} │", progress.uncorrectable_errors);
    println!("│   skipped_extents:        {:<30} │", progress.skipped_extents);
    println!("└─────────────────────────────────────────────────────────────┘");
}

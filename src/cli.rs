// # scrubctl
//
// Interactive operator client for the scrub daemon. There is no network
// transport in scope for this crate (spec §1's "build glue" exclusion), so
// this binary drives a `ScrubRegistry` in-process rather than over a wire
// protocol, issuing the same `start|pause|resume|cancel|status` commands an
// operator would send a running `scrubd`.

use btrfs_scrubd::scrub::device::{
    BlockKind, ExtentFlags, ExtentRecord, InMemoryExtentTree, MockDevice, SimpleRaidMap,
};
use btrfs_scrubd::scrub::verify::VerifyContext;
use btrfs_scrubd::scrub::{ScrubHandle, ScrubRegistry};
use btrfs_scrubd::storage::hardware_crc32c;
use btrfs_scrubd::{Result, ScrubConfig};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{stdin, AsyncBufReadExt, BufReader};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct DemoLookup(HashMap<u64, Arc<dyn btrfs_scrubd::scrub::device::BlockDevice>>);

impl btrfs_scrubd::scrub::device::DeviceLookup for DemoLookup {
    fn device(&self, id: u64) -> Option<Arc<dyn btrfs_scrubd::scrub::device::BlockDevice>> {
        self.0.get(&id).cloned()
    }
}

fn demo_device(id: u64, sector: usize, extents: u64) -> (Arc<MockDevice>, InMemoryExtentTree, u64) {
    let dev = Arc::new(MockDevice::new(id));
    let mut extent_tree = InMemoryExtentTree::new();
    for i in 0..extents {
        let logical = i * sector as u64;
        let buf = vec![(i + 1) as u8; sector];
        dev.seed(logical, &buf);
        let csum = hardware_crc32c(&buf);
        extent_tree.set_csum(logical, csum);
        extent_tree.add_extent(ExtentRecord {
            logical,
            length: sector as u64,
            flags: ExtentFlags {
                kind: BlockKind::Data,
                has_csum: true,
                nocow: false,
            },
            generation: 1,
        });
    }
    (dev, extent_tree, extents * sector as u64)
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║          scrubctl - scrub operator console               ║");
    println!("║                    Version {}                          ║", VERSION);
    println!("╚══════════════════════════════════════════════════════════╝");
    println!();
    println!("Commands: start <device-id> | pause <device-id> | resume <device-id>");
    println!("          cancel <device-id> | status <device-id> | exit");
    println!();

    let registry = ScrubRegistry::new();
    let mut handles: HashMap<u64, ScrubHandle> = HashMap::new();
    let mut reader = BufReader::new(stdin());
    let mut input = String::new();

    loop {
        print!("scrubctl> ");
        std::io::Write::flush(&mut std::io::stdout()).unwrap();

        input.clear();
        let n = reader.read_line(&mut input).await?;
        if n == 0 {
            break;
        }
        let cmd = input.trim();
        if cmd.is_empty() {
            continue;
        }
        let mut parts = cmd.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let device: Option<u64> = parts.next().and_then(|s| s.parse().ok());

        match verb {
            "exit" | "quit" => {
                println!("Goodbye!");
                break;
            }
            "start" => {
                let Some(device) = device else {
                    println!("usage: start <device-id>");
                    continue;
                };
                let sector = 4096;
                let (dev, extent_tree, target_bytes) = demo_device(device, sector, 4);
                let raid_map = SimpleRaidMap::single(device, 64 * 1024);
                let lookup = DemoLookup(HashMap::from([(
                    device,
                    dev.clone() as Arc<dyn btrfs_scrubd::scrub::device::BlockDevice>,
                )]));
                let verify_ctx = VerifyContext {
                    sectorsize: sector,
                    ..VerifyContext::default()
                };
                match registry.scrub_start(device, ScrubConfig::default(), verify_ctx, target_bytes) {
                    Ok(handle) => {
                        println!("scrub started on device {}", device);
                        let result = registry
                            .run_to_completion(&handle, &raid_map, &extent_tree, &lookup, 0, target_bytes, None)
                            .await;
                        if let Err(e) = result {
                            println!("scrub error: {}", e);
                        } else {
                            println!("scrub finished on device {}", device);
                        }
                        handles.insert(device, handle);
                    }
                    Err(e) => println!("could not start: {}", e),
                }
            }
            "pause" => match device.map(|d| registry.scrub_pause(d)) {
                Some(Ok(())) => println!("paused"),
                Some(Err(e)) => println!("error: {}", e),
                None => println!("usage: pause <device-id>"),
            },
            "resume" => match device.map(|d| registry.scrub_resume(d)) {
                Some(Ok(())) => println!("resumed"),
                Some(Err(e)) => println!("error: {}", e),
                None => println!("usage: resume <device-id>"),
            },
            "cancel" => match device.map(|d| registry.scrub_cancel(d)) {
                Some(Ok(())) => println!("cancelled"),
                Some(Err(e)) => println!("error: {}", e),
                None => println!("usage: cancel <device-id>"),
            },
            "status" => {
                let Some(device) = device else {
                    println!("usage: status <device-id>");
                    continue;
                };
                match handles.get(&device).map(|h| h.progress()) {
                    Some(progress) => println!("{:?}", progress),
                    None => println!("no handle recorded for device {}", device),
                }
            }
            other => println!("unknown command: {}", other),
        }
        println!();
    }

    Ok(())
}

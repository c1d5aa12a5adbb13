//! External collaborators consumed only through their interfaces (spec §1,
//! §6): the block layer, the RAID mapping function, the extent-tree/commit-
//! root metadata search, and the pause/cancel broadcast. None of these are
//! implemented as "the real thing" here: btrfs's actual B-tree search, bio
//! submit/complete path, and transaction manager are explicitly out of
//! scope. What's implemented is the trait boundary plus an in-memory mock of
//! each, used by the walker/recovery state machine and exercised by tests.

use crate::error::{Result, ScrubError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub type DeviceId = u64;
pub type Logical = u64;
pub type Physical = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// The three checksum flavors a Block can carry (spec §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Data,
    TreeBlock,
    SuperBlock,
}

#[derive(Debug, Clone, Copy)]
pub struct ExtentFlags {
    pub kind: BlockKind,
    pub has_csum: bool,
    /// Set when the extent is a non-COW ("nodatacow") data extent, drives
    /// the NODATASUM_FALLBACK recovery path (spec §4.5 step 6).
    pub nocow: bool,
}

// ============================================================================
// Block layer
// ============================================================================

/// The block-layer submit/complete path (spec §6: "submit(batch, direction),
/// submit-and-wait, add-page-to-batch, allocate-batch"). Only the per-mirror
/// physical read/write primitive is modeled here; batching lives in
/// `scrub::pipeline`.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    fn id(&self) -> DeviceId;

    async fn read_at(&self, physical: Physical, buf: &mut [u8]) -> Result<()>;

    async fn write_at(&self, physical: Physical, buf: &[u8]) -> Result<()>;
}

/// Looks up a device handle by id, the collaborator the recovery state
/// machine and replace-mode need to reach a mirror or the replacement
/// target that isn't the one a Block was originally built against.
pub trait DeviceLookup: Send + Sync {
    fn device(&self, id: DeviceId) -> Option<Arc<dyn BlockDevice>>;
}

/// In-memory mock block device: a sparse byte store keyed by physical
/// offset, used by tests and by the `scrubd` demo binary in lieu of a real
/// block layer (out of scope per spec §1).
pub struct MockDevice {
    id: DeviceId,
    bytes: RwLock<BTreeMap<Physical, u8>>,
    fail_reads: RwLock<std::collections::HashSet<Physical>>,
}

impl MockDevice {
    pub fn new(id: DeviceId) -> Self {
        Self {
            id,
            bytes: RwLock::new(BTreeMap::new()),
            fail_reads: RwLock::new(std::collections::HashSet::new()),
        }
    }

    /// Seed this device's contents at `physical..physical+data.len()`.
    pub fn seed(&self, physical: Physical, data: &[u8]) {
        let mut bytes = self.bytes.write();
        for (i, b) in data.iter().enumerate() {
            bytes.insert(physical + i as u64, *b);
        }
    }

    /// Flip a single byte, used to inject checksum corruption in tests.
    pub fn corrupt_byte(&self, physical: Physical) {
        let mut bytes = self.bytes.write();
        let entry = bytes.entry(physical).or_insert(0);
        *entry ^= 0xFF;
    }

    /// Force subsequent reads covering `physical` to fail with an I/O error,
    /// modeling an unreadable sector independent of checksum corruption.
    pub fn fail_at(&self, physical: Physical) {
        self.fail_reads.write().insert(physical);
    }

    pub fn clear_fail_at(&self, physical: Physical) {
        self.fail_reads.write().remove(&physical);
    }
}

#[async_trait]
impl BlockDevice for MockDevice {
    fn id(&self) -> DeviceId {
        self.id
    }

    async fn read_at(&self, physical: Physical, buf: &mut [u8]) -> Result<()> {
        let fail = self.fail_reads.read();
        for i in 0..buf.len() as u64 {
            if fail.contains(&(physical + i)) {
                return Err(ScrubError::Io(format!(
                    "simulated read error at {}",
                    physical + i
                )));
            }
        }
        drop(fail);
        let bytes = self.bytes.read();
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = *bytes.get(&(physical + i as u64)).unwrap_or(&0);
        }
        Ok(())
    }

    async fn write_at(&self, physical: Physical, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        for (i, b) in buf.iter().enumerate() {
            bytes.insert(physical + i as u64, *b);
        }
        Ok(())
    }
}

// ============================================================================
// RAID mapping
// ============================================================================

/// One mirror's placement for a logical range (spec §6 `map(...)`).
#[derive(Debug, Clone)]
pub struct Stripe {
    pub device: DeviceId,
    pub physical: Physical,
    pub mirror: u8,
    /// Length of this stripe segment, in bytes.
    pub len: u64,
}

#[derive(Debug, Clone)]
pub struct RaidMapping {
    pub stripes: Vec<Stripe>,
    pub mirror_num: u8,
}

/// RAID layout families named in spec §4.4 ("single / DUP / RAID0 / RAID1 /
/// RAID10 / RAID5-6 data stripes only").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidLayout {
    Single,
    Dup,
    Raid0 { stripes: u8 },
    Raid1 { copies: u8 },
    Raid10 { stripes: u8, copies: u8 },
    Raid5 { data_stripes: u8 },
    Raid6 { data_stripes: u8 },
}

/// The RAID mapping function, consumed only through its interface (spec §1,
/// §6). Given a logical range it returns every mirror's physical placement.
pub trait RaidMap: Send + Sync {
    fn layout(&self) -> RaidLayout;

    fn stripe_len(&self) -> u64;

    /// Maps `[logical, logical+length)` to its per-mirror physical stripes.
    fn map(&self, logical: Logical, length: u64, direction: Direction) -> Result<RaidMapping>;

    /// Maps a single mirror's placement, used by the recovery state machine
    /// to materialize one recheck-block per surviving mirror (spec §4.5).
    fn map_mirror(&self, logical: Logical, length: u64, mirror: u8) -> Result<Stripe>;
}

/// A RAID map for the common small layouts (single/DUP/RAID1/RAID10),
/// sufficient for the scenarios in spec §8 and for tests. Devices are
/// addressed by index into `devices`; physical offset equals logical offset
/// (one chunk per device, no multi-chunk bookkeeping, out of scope here).
pub struct SimpleRaidMap {
    pub layout: RaidLayout,
    pub devices: Vec<DeviceId>,
    pub stripe_len: u64,
}

impl SimpleRaidMap {
    pub fn single(device: DeviceId, stripe_len: u64) -> Self {
        Self {
            layout: RaidLayout::Single,
            devices: vec![device],
            stripe_len,
        }
    }

    pub fn raid1(devices: Vec<DeviceId>, stripe_len: u64) -> Self {
        let copies = devices.len() as u8;
        Self {
            layout: RaidLayout::Raid1 { copies },
            devices,
            stripe_len,
        }
    }

    pub fn dup(device: DeviceId, stripe_len: u64) -> Self {
        Self {
            layout: RaidLayout::Dup,
            devices: vec![device, device],
            stripe_len,
        }
    }

    fn mirror_count(&self) -> u8 {
        match self.layout {
            RaidLayout::Single => 1,
            RaidLayout::Dup => 2,
            RaidLayout::Raid1 { copies } => copies,
            RaidLayout::Raid10 { copies, .. } => copies,
            RaidLayout::Raid0 { .. } => 1,
            RaidLayout::Raid5 { .. } => 1,
            RaidLayout::Raid6 { .. } => 2,
        }
    }
}

impl RaidMap for SimpleRaidMap {
    fn layout(&self) -> RaidLayout {
        self.layout
    }

    fn stripe_len(&self) -> u64 {
        self.stripe_len
    }

    fn map(&self, logical: Logical, length: u64, _direction: Direction) -> Result<RaidMapping> {
        let mirror_num = self.mirror_count();
        let mut stripes = Vec::with_capacity(mirror_num as usize);
        for mirror in 0..mirror_num {
            stripes.push(self.map_mirror(logical, length, mirror)?);
        }
        Ok(RaidMapping {
            stripes,
            mirror_num,
        })
    }

    fn map_mirror(&self, logical: Logical, length: u64, mirror: u8) -> Result<Stripe> {
        let mirror_num = self.mirror_count();
        if mirror >= mirror_num {
            return Err(ScrubError::RaidMap {
                logical,
                length,
                reason: format!("mirror {} out of range ({} mirrors)", mirror, mirror_num),
            });
        }
        let device_idx = match self.layout {
            RaidLayout::Dup => 0,
            _ => mirror as usize % self.devices.len(),
        };
        Ok(Stripe {
            device: self.devices[device_idx],
            physical: logical,
            mirror,
            len: length,
        })
    }
}

// ============================================================================
// Extent tree / commit-root metadata search
// ============================================================================

#[derive(Debug, Clone)]
pub struct ExtentRecord {
    pub logical: Logical,
    pub length: u64,
    pub flags: ExtentFlags,
    pub generation: u64,
}

/// The on-disk B-tree search primitives, out of scope per spec §1; only the
/// `search`/`next-leaf`/`next-item`-over-a-commit-root shape is modeled,
/// collapsed here into two range queries.
pub trait ExtentTree: Send + Sync {
    /// Every extent whose range overlaps `[start, end)`, ordered by logical.
    fn extents_in_range(&self, start: Logical, end: Logical) -> Result<Vec<ExtentRecord>>;

    /// Per-sector checksums covering `[start, start+length)`.
    fn csum_range(&self, start: Logical, length: u64) -> Result<Vec<(Logical, u32)>>;
}

pub struct InMemoryExtentTree {
    extents: Vec<ExtentRecord>,
    csums: BTreeMap<Logical, u32>,
}

impl InMemoryExtentTree {
    pub fn new() -> Self {
        Self {
            extents: Vec::new(),
            csums: BTreeMap::new(),
        }
    }

    pub fn add_extent(&mut self, record: ExtentRecord) {
        self.extents.push(record);
        self.extents.sort_by_key(|e| e.logical);
    }

    pub fn set_csum(&mut self, sector_logical: Logical, csum: u32) {
        self.csums.insert(sector_logical, csum);
    }
}

impl Default for InMemoryExtentTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ExtentTree for InMemoryExtentTree {
    fn extents_in_range(&self, start: Logical, end: Logical) -> Result<Vec<ExtentRecord>> {
        Ok(self
            .extents
            .iter()
            .filter(|e| e.logical < end && e.logical + e.length > start)
            .cloned()
            .collect())
    }

    fn csum_range(&self, start: Logical, length: u64) -> Result<Vec<(Logical, u32)>> {
        Ok(self
            .csums
            .range(start..start + length)
            .map(|(k, v)| (*k, *v))
            .collect())
    }
}

// ============================================================================
// Pause / cancel broadcast (spec §6, §5 suspension points)
// ============================================================================

/// The filesystem-wide pause/cancel signalling channel, out of scope per
/// spec §1; only the increment/decrement-counter-plus-wait-queue shape is
/// modeled (spec §9 "cooperative cancellation / pause").
pub struct ControlToken {
    paused: AtomicBool,
    cancelled: AtomicBool,
    resume_notify: Notify,
}

impl ControlToken {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            resume_notify: Notify::new(),
        })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.resume_notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Parks until resumed or cancelled (spec §5: "A pause request
    /// happens-before all further batch submissions").
    pub async fn wait_for_resume(&self) {
        while self.is_paused() && !self.is_cancelled() {
            self.resume_notify.notified().await;
        }
    }
}

impl Default for ControlToken {
    fn default() -> Self {
        Self {
            paused: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            resume_notify: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_device_roundtrip() {
        let dev = MockDevice::new(1);
        dev.seed(0, &[1, 2, 3, 4]);
        let mut buf = [0u8; 4];
        dev.read_at(0, &mut buf).await.unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn mock_device_corrupt_byte_flips() {
        let dev = MockDevice::new(1);
        dev.seed(0, &[0xAA]);
        dev.corrupt_byte(0);
        let mut buf = [0u8; 1];
        dev.read_at(0, &mut buf).await.unwrap();
        assert_eq!(buf[0], 0x55);
    }

    #[tokio::test]
    async fn mock_device_fail_at_errors() {
        let dev = MockDevice::new(1);
        dev.seed(0, &[1, 2]);
        dev.fail_at(0);
        let mut buf = [0u8; 2];
        assert!(dev.read_at(0, &mut buf).await.is_err());
    }

    #[test]
    fn simple_raid_map_raid1() {
        let map = SimpleRaidMap::raid1(vec![10, 20], 64 * 1024);
        let mapping = map.map(0, 4096, Direction::Read).unwrap();
        assert_eq!(mapping.mirror_num, 2);
        assert_eq!(mapping.stripes[0].device, 10);
        assert_eq!(mapping.stripes[1].device, 20);
    }

    #[tokio::test]
    async fn control_token_pause_resume() {
        let token = ControlToken::new();
        token.pause();
        assert!(token.is_paused());
        let t2 = token.clone();
        let handle = tokio::spawn(async move {
            t2.wait_for_resume().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        token.resume();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}

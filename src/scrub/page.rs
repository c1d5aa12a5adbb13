//! C1: Page-entry. A fixed-size unit of one mirror's data, owned inline by
//! its containing Block (spec §9 design note: "arena of page-entry indices
//! owned by the Block", realized here as a plain `Vec<Page>` inside
//! `Block`, with `Arc<Block>` clones standing in for the "refcount handle"
//! completion workers carry past the walker's own release).

use crate::scrub::device::{DeviceId, Logical, Physical};

#[derive(Debug, Clone)]
pub struct Page {
    pub buf: Vec<u8>,
    pub device: DeviceId,
    pub mirror: u8,
    pub logical: Logical,
    pub physical: Physical,
    pub generation: u64,
    /// On-disk checksum for this page's sector, when known.
    pub csum: Option<u32>,
    pub have_csum: bool,
    pub io_error: bool,
}

impl Page {
    pub fn new(
        device: DeviceId,
        mirror: u8,
        logical: Logical,
        physical: Physical,
        page_size: usize,
        generation: u64,
    ) -> Self {
        Self {
            buf: vec![0u8; page_size],
            device,
            mirror,
            logical,
            physical,
            generation,
            csum: None,
            have_csum: false,
            io_error: false,
        }
    }

    pub fn with_csum(mut self, csum: u32) -> Self {
        self.csum = Some(csum);
        self.have_csum = true;
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

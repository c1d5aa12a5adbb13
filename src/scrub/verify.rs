//! C4: Checksum & header verifier (spec §4.3). Three flavors selected by the
//! Block's extent kind: data (checksum only), tree-block (header fields +
//! checksum), super-block (same shape as tree-block, report-only downstream
//! in `scrub::recovery`).

use crate::scrub::block::BlockRef;
use crate::scrub::device::BlockKind;
use crate::storage::hardware_crc32c;

/// Header layout for tree-block and super-block kinds, modeled on the
/// on-disk shape named in spec §4.3 (`bytenr`, `generation`, `fsid`,
/// `chunk-tree-uuid`, plus a reserved csum field). The csum field is 32
/// bytes on disk; this implementation stores a 4-byte crc32c in its first
/// four bytes and leaves the rest reserved, matching `storage::checksum`.
const CSUM_FIELD_LEN: usize = 32;
const OFF_FSID: usize = 32;
const FSID_LEN: usize = 16;
const OFF_BYTENR: usize = 48;
const OFF_CHUNK_TREE_UUID: usize = 64;
const UUID_LEN: usize = 16;
const OFF_GENERATION: usize = 80;
pub const HEADER_LEN: usize = 101;

struct ParsedHeader {
    csum: u32,
    fsid: [u8; FSID_LEN],
    bytenr: u64,
    chunk_tree_uuid: [u8; UUID_LEN],
    generation: u64,
}

fn parse_header(bytes: &[u8]) -> std::result::Result<ParsedHeader, String> {
    if bytes.len() < HEADER_LEN {
        return Err(format!(
            "header truncated: {} bytes, need at least {}",
            bytes.len(),
            HEADER_LEN
        ));
    }
    let mut csum_bytes = [0u8; 4];
    csum_bytes.copy_from_slice(&bytes[0..4]);
    let mut fsid = [0u8; FSID_LEN];
    fsid.copy_from_slice(&bytes[OFF_FSID..OFF_FSID + FSID_LEN]);
    let mut bytenr_bytes = [0u8; 8];
    bytenr_bytes.copy_from_slice(&bytes[OFF_BYTENR..OFF_BYTENR + 8]);
    let mut chunk_tree_uuid = [0u8; UUID_LEN];
    chunk_tree_uuid.copy_from_slice(&bytes[OFF_CHUNK_TREE_UUID..OFF_CHUNK_TREE_UUID + UUID_LEN]);
    let mut generation_bytes = [0u8; 8];
    generation_bytes.copy_from_slice(&bytes[OFF_GENERATION..OFF_GENERATION + 8]);
    Ok(ParsedHeader {
        csum: u32::from_le_bytes(csum_bytes),
        fsid,
        bytenr: u64::from_le_bytes(bytenr_bytes),
        chunk_tree_uuid,
        generation: u64::from_le_bytes(generation_bytes),
    })
}

/// Writes a header in the layout `parse_header` expects. Used by tests and
/// by anything constructing synthetic tree/super blocks.
pub fn write_header(
    buf: &mut [u8],
    bytenr: u64,
    generation: u64,
    fsid: [u8; FSID_LEN],
    chunk_tree_uuid: [u8; UUID_LEN],
) {
    buf[OFF_FSID..OFF_FSID + FSID_LEN].copy_from_slice(&fsid);
    buf[OFF_BYTENR..OFF_BYTENR + 8].copy_from_slice(&bytenr.to_le_bytes());
    buf[OFF_CHUNK_TREE_UUID..OFF_CHUNK_TREE_UUID + UUID_LEN].copy_from_slice(&chunk_tree_uuid);
    buf[OFF_GENERATION..OFF_GENERATION + 8].copy_from_slice(&generation.to_le_bytes());
    let csum = hardware_crc32c(&buf[CSUM_FIELD_LEN..]);
    buf[0..4].copy_from_slice(&csum.to_le_bytes());
}

/// Filesystem identity the verifier checks tree/super headers against.
#[derive(Debug, Clone, Copy)]
pub struct VerifyContext {
    pub fsid: [u8; FSID_LEN],
    pub chunk_tree_uuid: [u8; UUID_LEN],
    pub sectorsize: usize,
    pub nodesize: usize,
}

impl Default for VerifyContext {
    fn default() -> Self {
        Self {
            fsid: [0u8; FSID_LEN],
            chunk_tree_uuid: [0u8; UUID_LEN],
            sectorsize: 4096,
            nodesize: 16384,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    NoCsum,
    ChecksumMismatch,
    HeaderMismatch(String),
    GenerationMismatch { expected: u64, found: u64 },
}

impl VerifyOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, VerifyOutcome::Ok)
    }
}

/// Concatenates page buffers until `len` bytes are gathered (spec §4.3:
/// "spilling into subsequent pages if sector > page").
fn gather_bytes(block: &BlockRef, len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut idx = 0;
    while out.len() < len && idx < block.page_count() {
        block.with_page(idx, |p| {
            let take = (len - out.len()).min(p.buf.len());
            out.extend_from_slice(&p.buf[..take]);
        });
        idx += 1;
    }
    out
}

fn verify_data_block(block: &BlockRef, ctx: &VerifyContext) -> VerifyOutcome {
    let expected = match block.with_page(0, |p| p.csum) {
        Some(c) => c,
        None => return VerifyOutcome::NoCsum,
    };
    let bytes = gather_bytes(block, ctx.sectorsize);
    let actual = hardware_crc32c(&bytes);
    if actual != expected {
        block.set_checksum_error(true);
        VerifyOutcome::ChecksumMismatch
    } else {
        VerifyOutcome::Ok
    }
}

/// Shared shape for tree-block and super-block verification (spec §4.3:
/// "Super block. Same shape as tree block with super-block offsets").
fn verify_tree_like(block: &BlockRef, ctx: &VerifyContext) -> VerifyOutcome {
    let bytes = gather_bytes(block, ctx.nodesize);
    let header = match parse_header(&bytes) {
        Ok(h) => h,
        Err(reason) => {
            block.set_header_error(true);
            return VerifyOutcome::HeaderMismatch(reason);
        }
    };
    if header.bytenr != block.logical {
        block.set_header_error(true);
        return VerifyOutcome::HeaderMismatch(format!(
            "bytenr {} != logical {}",
            header.bytenr, block.logical
        ));
    }
    if header.fsid != ctx.fsid || header.chunk_tree_uuid != ctx.chunk_tree_uuid {
        block.set_header_error(true);
        return VerifyOutcome::HeaderMismatch("fsid or chunk-tree-uuid mismatch".to_string());
    }
    if header.generation != block.generation {
        block.set_generation_error(true);
        return VerifyOutcome::GenerationMismatch {
            expected: block.generation,
            found: header.generation,
        };
    }
    let body = &bytes[CSUM_FIELD_LEN..];
    let actual = hardware_crc32c(body);
    if actual != header.csum {
        block.set_checksum_error(true);
        return VerifyOutcome::ChecksumMismatch;
    }
    VerifyOutcome::Ok
}

/// Dispatches on the Block's extent kind and sets the appropriate sticky
/// error flags as a side effect (spec §4.3: "Result: a set of sticky flags
/// on the Block").
pub fn verify_block(block: &BlockRef, ctx: &VerifyContext) -> VerifyOutcome {
    match block.kind {
        BlockKind::Data => verify_data_block(block, ctx),
        BlockKind::TreeBlock => verify_tree_like(block, ctx),
        BlockKind::SuperBlock => verify_tree_like(block, ctx),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scrub::block::Block;
    use crate::scrub::device::ExtentFlags;
    use crate::scrub::page::Page;

    fn data_flags() -> ExtentFlags {
        ExtentFlags {
            kind: BlockKind::Data,
            has_csum: true,
            nocow: false,
        }
    }

    fn tree_flags() -> ExtentFlags {
        ExtentFlags {
            kind: BlockKind::TreeBlock,
            has_csum: true,
            nocow: false,
        }
    }

    #[test]
    fn data_block_with_correct_csum_verifies_ok() {
        let page_size = 4096;
        let mut page = Page::new(1, 0, 0, 0, page_size, 1);
        let csum = hardware_crc32c(&page.buf[..page_size]);
        page = page.with_csum(csum);
        let block = Block::new(1, 0, BlockKind::Data, data_flags(), 1, vec![page]);
        let ctx = VerifyContext {
            sectorsize: page_size,
            ..VerifyContext::default()
        };
        assert_eq!(verify_block(&block, &ctx), VerifyOutcome::Ok);
        assert!(!block.checksum_error());
    }

    #[test]
    fn data_block_with_corrupt_bytes_fails_csum() {
        let page_size = 4096;
        let mut page = Page::new(1, 0, 0, 0, page_size, 1);
        let csum = hardware_crc32c(&page.buf[..page_size]);
        page = page.with_csum(csum);
        page.buf[10] ^= 0xFF;
        let block = Block::new(1, 0, BlockKind::Data, data_flags(), 1, vec![page]);
        let ctx = VerifyContext {
            sectorsize: page_size,
            ..VerifyContext::default()
        };
        assert_eq!(verify_block(&block, &ctx), VerifyOutcome::ChecksumMismatch);
        assert!(block.checksum_error());
    }

    #[test]
    fn data_block_without_csum_reports_no_csum() {
        let page_size = 4096;
        let page = Page::new(1, 0, 0, 0, page_size, 1);
        let block = Block::new(1, 0, BlockKind::Data, data_flags(), 1, vec![page]);
        let ctx = VerifyContext::default();
        assert_eq!(verify_block(&block, &ctx), VerifyOutcome::NoCsum);
    }

    #[test]
    fn tree_block_header_roundtrips() {
        let node_size = 512;
        let mut page = Page::new(1, 0, 1000, 1000, node_size, 7);
        write_header(&mut page.buf, 1000, 7, [1u8; 16], [2u8; 16]);
        let block = Block::new(1, 1000, BlockKind::TreeBlock, tree_flags(), 7, vec![page]);
        let ctx = VerifyContext {
            fsid: [1u8; 16],
            chunk_tree_uuid: [2u8; 16],
            nodesize: node_size,
            ..VerifyContext::default()
        };
        assert_eq!(verify_block(&block, &ctx), VerifyOutcome::Ok);
    }

    #[test]
    fn tree_block_bytenr_mismatch_is_header_error() {
        let node_size = 512;
        let mut page = Page::new(1, 0, 1000, 1000, node_size, 7);
        write_header(&mut page.buf, 999, 7, [1u8; 16], [2u8; 16]);
        let block = Block::new(1, 1000, BlockKind::TreeBlock, tree_flags(), 7, vec![page]);
        let ctx = VerifyContext {
            fsid: [1u8; 16],
            chunk_tree_uuid: [2u8; 16],
            nodesize: node_size,
            ..VerifyContext::default()
        };
        match verify_block(&block, &ctx) {
            VerifyOutcome::HeaderMismatch(_) => {}
            other => panic!("expected header mismatch, got {:?}", other),
        }
        assert!(block.header_error());
    }

    #[test]
    fn tree_block_generation_mismatch_detected() {
        let node_size = 512;
        let mut page = Page::new(1, 0, 1000, 1000, node_size, 7);
        write_header(&mut page.buf, 1000, 99, [1u8; 16], [2u8; 16]);
        let block = Block::new(1, 1000, BlockKind::TreeBlock, tree_flags(), 7, vec![page]);
        let ctx = VerifyContext {
            fsid: [1u8; 16],
            chunk_tree_uuid: [2u8; 16],
            nodesize: node_size,
            ..VerifyContext::default()
        };
        match verify_block(&block, &ctx) {
            VerifyOutcome::GenerationMismatch { expected, found } => {
                assert_eq!(expected, 7);
                assert_eq!(found, 99);
            }
            other => panic!("expected generation mismatch, got {:?}", other),
        }
        assert!(block.generation_error());
    }
}

//! Checksum utilities
//!
//! Every CRC in the storage core is IEEE CRC32: block CRCs in extent headers,
//! payload CRCs carried by random writes and read replies. Raft entries
//! written by older data nodes carry the same polynomial, so replay compares
//! like with like.

use crate::types::{BLOCK_CRC_SIZE, BLOCK_SIZE};
use crc32fast::Hasher as Crc32;

/// CRC32 of a buffer
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Continue a CRC32 over more data
#[must_use]
pub fn crc32_append(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = Crc32::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

/// CRC of one extent block. The block is treated as zero-padded to
/// `BLOCK_SIZE` so short trailing blocks hash the same as on a sparse file.
#[must_use]
pub fn block_crc(data: &[u8]) -> u32 {
    debug_assert!(data.len() as u64 <= BLOCK_SIZE);
    let mut hasher = Crc32::new();
    hasher.update(data);
    let zeros = [0u8; 4096];
    let mut left = BLOCK_SIZE as usize - data.len();
    while left > 0 {
        let n = left.min(zeros.len());
        hasher.update(&zeros[..n]);
        left -= n;
    }
    hasher.finalize()
}

/// Combine the block CRCs recorded in a header into one extent CRC.
///
/// Zero entries (never written blocks) do not contribute.
#[must_use]
pub fn combine_block_crcs(header: &[u8]) -> u32 {
    header
        .chunks_exact(BLOCK_CRC_SIZE as usize)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .fold(0, |acc, crc| acc ^ crc)
}

/// Verify data against an expected CRC
#[must_use]
pub fn verify_crc32(data: &[u8], expected: u32) -> bool {
    crc32(data) == expected
}

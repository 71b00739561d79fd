//! Helpers for backends that split large payloads into multipart uploads.
//!
//! A single sequential pass over the file yields both the part boundaries and
//! the tree hash of the whole object (plus one per part), so each part can
//! then be sent as an independent bounded read of the same file.

use std::io::{Read, Seek};

use crate::Result;

mod range;
mod tree_hash;

pub use range::OffsetRangeReader;
pub use tree_hash::{tree_hash, tree_root, TreeHasher, TREE_HASH_CHUNK_SIZE};

/// Size of each uploaded part.
pub const PART_SIZE: u64 = 64 * 1024 * 1024;

/// Payloads at or above this size go through multipart upload.
pub const MULTIPART_LIMIT: u64 = 100 * 1024 * 1024;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// First byte of the part (inclusive).
    pub start: u64,
    /// End of the part (exclusive).
    pub end: u64,
    /// Tree hash over this part alone.
    pub tree_hash: [u8; 32],
}

impl Part {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Content-Range style description, e.g. `bytes 0-1023/*`.
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/*", self.start, self.end.saturating_sub(1))
    }

    /// Opens a bounded view over this part of `stream`.
    pub fn reader<R: Read + Seek>(&self, stream: R) -> Result<OffsetRangeReader<R>> {
        OffsetRangeReader::new(stream, self.start, self.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    pub size: u64,
    pub parts: Vec<Part>,
    pub tree_hash: [u8; 32],
}

impl PartPlan {
    pub fn tree_hash_hex(&self) -> String {
        hex::encode(self.tree_hash)
    }
}

/// Reads `reader` once, splitting it into parts of `part_size` bytes and
/// computing the tree hash over the whole stream.
pub fn plan_parts<R: Read>(mut reader: R, part_size: u64) -> Result<PartPlan> {
    let chunk = TREE_HASH_CHUNK_SIZE as u64;
    if part_size == 0 || part_size % chunk != 0 {
        return Err(crate::icebox_error!(InvalidParameter {
            description: format!(
                "Part size {part_size} must be a non-zero multiple of {TREE_HASH_CHUNK_SIZE}"
            ),
        }));
    }

    let mut hasher = TreeHasher::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    let leaves = hasher.into_leaves();
    let leaves_per_part = (part_size / chunk) as usize;
    let mut parts = Vec::new();
    let mut start = 0u64;
    while start < size {
        let end = (start + part_size).min(size);
        let first_leaf = (start / chunk) as usize;
        let last_leaf = (first_leaf + leaves_per_part).min(leaves.len());
        parts.push(Part {
            start,
            end,
            tree_hash: tree_root(&leaves[first_leaf..last_leaf]),
        });
        start = end;
    }
    let tree_hash = tree_root(&leaves);

    Ok(PartPlan {
        size,
        parts,
        tree_hash,
    })
}

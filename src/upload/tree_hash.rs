use sha2::{Digest, Sha256};

/// Leaf size of the archival tree hash.
pub const TREE_HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// Streaming tree hash: SHA-256 over 1 MiB leaves, combined pairwise until a
/// single root remains. An odd node at any level is carried up unchanged.
#[derive(Default)]
pub struct TreeHasher {
    leaves: Vec<[u8; 32]>,
    pending: Vec<u8>,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let room = TREE_HASH_CHUNK_SIZE - self.pending.len();
            let take = room.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() == TREE_HASH_CHUNK_SIZE {
                self.flush_leaf();
            }
        }
    }

    /// Leaf hashes completed so far. A trailing partial chunk is not included.
    pub fn leaves(&self) -> &[[u8; 32]] {
        &self.leaves
    }

    pub fn finalize(self) -> [u8; 32] {
        tree_root(&self.into_leaves())
    }

    /// All leaf hashes, including the trailing partial chunk.
    pub fn into_leaves(mut self) -> Vec<[u8; 32]> {
        if !self.pending.is_empty() {
            self.flush_leaf();
        }
        self.leaves
    }

    fn flush_leaf(&mut self) {
        self.leaves.push(Sha256::digest(&self.pending).into());
        self.pending.clear();
    }
}

/// Combines leaf hashes into the tree hash root.
pub fn tree_root(leaves: &[[u8; 32]]) -> [u8; 32] {
    if leaves.is_empty() {
        return Sha256::digest(b"").into();
    }
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => {
                    let mut hasher = Sha256::new();
                    hasher.update(left);
                    hasher.update(right);
                    hasher.finalize().into()
                }
                [single] => *single,
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();
    }
    level[0]
}

pub fn tree_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = TreeHasher::new();
    hasher.update(data);
    hasher.finalize()
}

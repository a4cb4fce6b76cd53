//! Tiger-tree (TTH) Merkle construction.
//!
//! The tree hashes 1024-byte chunks of content as leaves (`0x00 || chunk`)
//! and combines nodes pairwise (`0x01 || left || right`), promoting an odd
//! trailing node unchanged, until a single root remains. The streaming
//! hashers keep a stack of subtree peaks, so memory stays bounded no matter
//! how the input is partitioned.

use crate::{HashResult, TigerHash, HASH_SIZE};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use tiger::{Digest, Tiger};

/// Size of a content leaf in bytes.
pub const LEAF_SIZE: usize = 1024;

/// Fan-out threshold: the retained leaves level is the lowest whose node
/// count does not exceed this, so at most 96 KiB of leaves per file.
pub const MAX_TTH_LEAVES: usize = 4096;

/// Read buffer for file hashing.
const FILE_BUF_SIZE: usize = 64 * 1024;

type Node = [u8; HASH_SIZE];

fn leaf_hash(chunk: &[u8]) -> Node {
    let mut h = Tiger::new();
    h.update([0x00u8]);
    h.update(chunk);
    h.finalize().into()
}

fn node_hash(left: &Node, right: &Node) -> Node {
    let mut h = Tiger::new();
    h.update([0x01u8]);
    h.update(left);
    h.update(right);
    h.finalize().into()
}

/// Fold a peak stack (largest subtree first) into a single node.
///
/// Folding from the smallest peak upward matches the level-by-level
/// reduction with odd-node promotion.
fn fold_peaks(mut peaks: Vec<(u32, Node)>) -> Node {
    let mut cur = peaks.pop().expect("fold_peaks on empty stack").1;
    while let Some((_, left)) = peaks.pop() {
        cur = node_hash(&left, &cur);
    }
    cur
}

/// Incremental TTH root hasher.
///
/// `update` may be called with any partitioning of the content; the final
/// root only depends on the byte sequence.
pub struct TreeHasher {
    peaks: Vec<(u32, Node)>,
    buf: Vec<u8>,
    hashed_leaves: u64,
}

impl TreeHasher {
    pub fn new() -> Self {
        Self {
            peaks: Vec::new(),
            buf: Vec::with_capacity(LEAF_SIZE),
            hashed_leaves: 0,
        }
    }

    /// Feed content bytes.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (LEAF_SIZE - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == LEAF_SIZE {
                let h = leaf_hash(&self.buf);
                self.buf.clear();
                self.push_leaf(h);
            }
        }
    }

    /// Finish and return the root.
    pub fn finalize(mut self) -> TigerHash {
        if !self.buf.is_empty() || self.hashed_leaves == 0 {
            let h = leaf_hash(&self.buf);
            self.push_leaf(h);
        }
        TigerHash(fold_peaks(self.peaks))
    }

    fn push_leaf(&mut self, h: Node) {
        self.hashed_leaves += 1;
        self.peaks.push((0, h));
        while self.peaks.len() >= 2 {
            let (la, _) = self.peaks[self.peaks.len() - 2];
            let (lb, _) = self.peaks[self.peaks.len() - 1];
            if la != lb {
                break;
            }
            let (_, right) = self.peaks.pop().unwrap();
            let (lvl, left) = self.peaks.pop().unwrap();
            self.peaks.push((lvl + 1, node_hash(&left, &right)));
        }
    }
}

impl Default for TreeHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Root plus retained leaves level of one piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeDigest {
    /// Merkle root.
    pub root: TigerHash,
    /// Nodes of the retained level, left to right.
    pub leaves: Vec<Node>,
}

impl TreeDigest {
    /// The leaves stream as served on the wire: concatenated 24-byte nodes,
    /// no header.
    pub fn leaves_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.leaves.len() * HASH_SIZE);
        for leaf in &self.leaves {
            out.extend_from_slice(leaf);
        }
        out
    }
}

/// Incremental hasher that also retains the TTH-leaves level.
///
/// The retained level is the lowest whose node count is at most
/// [`MAX_TTH_LEAVES`]; it is fixed from the total input size before hashing
/// starts, which keeps streaming memory bounded.
pub struct LeavesHasher {
    keep_level: u32,
    stack: Vec<(u32, Node)>,
    leaves: Vec<Node>,
    buf: Vec<u8>,
    hashed_leaves: u64,
}

impl LeavesHasher {
    /// `total_size` is the exact content length that will be fed.
    pub fn new(total_size: u64) -> Self {
        let mut count = (total_size.div_ceil(LEAF_SIZE as u64)).max(1);
        let mut keep_level = 0u32;
        while count > MAX_TTH_LEAVES as u64 {
            count = count.div_ceil(2);
            keep_level += 1;
        }
        Self {
            keep_level,
            stack: Vec::new(),
            leaves: Vec::new(),
            buf: Vec::with_capacity(LEAF_SIZE),
            hashed_leaves: 0,
        }
    }

    /// Feed content bytes.
    pub fn update(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let take = (LEAF_SIZE - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buf.len() == LEAF_SIZE {
                let h = leaf_hash(&self.buf);
                self.buf.clear();
                self.push_leaf(h);
            }
        }
    }

    /// Finish and return the root together with the retained leaves.
    pub fn finalize(mut self) -> TreeDigest {
        if !self.buf.is_empty() || self.hashed_leaves == 0 {
            let h = leaf_hash(&self.buf);
            self.push_leaf(h);
        }
        // The trailing partial subtree promotes unchanged up to the
        // retained level.
        if !self.stack.is_empty() {
            let node = fold_peaks(std::mem::take(&mut self.stack));
            self.leaves.push(node);
        }
        let root = root_from_leaves(&self.leaves);
        TreeDigest {
            root,
            leaves: self.leaves,
        }
    }

    fn push_leaf(&mut self, h: Node) {
        self.hashed_leaves += 1;
        if self.keep_level == 0 {
            self.leaves.push(h);
            return;
        }
        self.stack.push((0, h));
        while self.stack.len() >= 2 {
            let (la, _) = self.stack[self.stack.len() - 2];
            let (lb, _) = self.stack[self.stack.len() - 1];
            if la != lb {
                break;
            }
            let (_, right) = self.stack.pop().unwrap();
            let (lvl, left) = self.stack.pop().unwrap();
            let merged = node_hash(&left, &right);
            if lvl + 1 == self.keep_level {
                self.leaves.push(merged);
            } else {
                self.stack.push((lvl + 1, merged));
            }
        }
    }
}

/// Recompute a root from a leaves level by pairwise reduction.
pub fn root_from_leaves(leaves: &[Node]) -> TigerHash {
    assert!(!leaves.is_empty(), "leaves level cannot be empty");
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            if pair.len() == 2 {
                next.push(node_hash(&pair[0], &pair[1]));
            } else {
                next.push(pair[0]);
            }
        }
        level = next;
    }
    TigerHash(level[0])
}

/// TTH of an in-memory byte slice.
pub fn tth_of_bytes(data: &[u8]) -> TigerHash {
    let mut h = TreeHasher::new();
    h.update(data);
    h.finalize()
}

/// TTH of a file on disk, streaming with bounded memory.
pub fn tth_of_file<P: AsRef<Path>>(path: P) -> HashResult<TigerHash> {
    let mut file = File::open(path)?;
    let mut hasher = TreeHasher::new();
    let mut buf = vec![0u8; FILE_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Root and leaves of an in-memory byte slice.
pub fn leaves_of_bytes(data: &[u8]) -> TreeDigest {
    let mut h = LeavesHasher::new(data.len() as u64);
    h.update(data);
    h.finalize()
}

/// Root and leaves of a file on disk, streaming with bounded memory.
pub fn leaves_of_file<P: AsRef<Path>>(path: P) -> HashResult<TreeDigest> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let mut hasher = LeavesHasher::new(size);
    let mut buf = vec![0u8; FILE_BUF_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_input_vector() {
        assert_eq!(
            tth_of_bytes(&[]).to_string(),
            "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ"
        );
    }

    #[test]
    fn test_repeated_a_vector() {
        let data = vec![b'A'; 10_000];
        assert_eq!(
            tth_of_bytes(&data).to_string(),
            "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY"
        );
    }

    #[test]
    fn test_single_partial_leaf() {
        // Content below one leaf hashes as a single (short) leaf.
        let tth = tth_of_bytes(b"hello");
        assert_eq!(TigerHash(leaf_hash(b"hello")), tth);
    }

    #[test]
    fn test_streaming_partition_independence() {
        let data: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        let whole = tth_of_bytes(&data);

        for chunk_size in [1usize, 7, 1023, 1024, 1025, 4096] {
            let mut h = TreeHasher::new();
            for chunk in data.chunks(chunk_size) {
                h.update(chunk);
            }
            assert_eq!(h.finalize(), whole, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_file_matches_bytes() {
        let data = vec![b'A'; 10_000];
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        assert_eq!(tth_of_file(tmp.path()).unwrap(), tth_of_bytes(&data));
    }

    #[test]
    fn test_leaves_reduce_to_root() {
        let data: Vec<u8> = (0..123_456u32).map(|i| (i % 199) as u8).collect();
        let digest = leaves_of_bytes(&data);
        assert_eq!(root_from_leaves(&digest.leaves), digest.root);
        assert_eq!(digest.root, tth_of_bytes(&data));
    }

    #[test]
    fn test_leaves_level_selection() {
        // 10 000 bytes -> 10 level-0 leaves, under the threshold.
        let digest = leaves_of_bytes(&vec![b'A'; 10_000]);
        assert_eq!(digest.leaves.len(), 10);
        assert_eq!(digest.leaves_bytes().len(), 10 * HASH_SIZE);
    }

    #[test]
    fn test_odd_leaf_promotion() {
        // 3 leaves: ((ab) c)
        let data = vec![0x5Au8; LEAF_SIZE * 3];
        let a = leaf_hash(&data[..LEAF_SIZE]);
        let ab = node_hash(&a, &a);
        let expected = node_hash(&ab, &a);
        assert_eq!(tth_of_bytes(&data), TigerHash(expected));
    }

    #[test]
    fn test_leaves_of_file_matches_memory() {
        let data: Vec<u8> = (0..70_000u32).map(|i| (i % 13) as u8).collect();
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&data).unwrap();
        tmp.flush().unwrap();

        assert_eq!(leaves_of_file(tmp.path()).unwrap(), leaves_of_bytes(&data));
    }

    proptest::proptest! {
        #[test]
        fn prop_partitioning_never_changes_root(
            data in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..8192),
            cuts in proptest::collection::vec(0usize..8192, 0..8),
        ) {
            let whole = tth_of_bytes(&data);

            let mut bounds: Vec<usize> = cuts.iter().map(|c| c % (data.len() + 1)).collect();
            bounds.push(0);
            bounds.push(data.len());
            bounds.sort_unstable();

            let mut h = TreeHasher::new();
            for pair in bounds.windows(2) {
                h.update(&data[pair[0]..pair[1]]);
            }
            proptest::prop_assert_eq!(h.finalize(), whole);
        }
    }
}

//! The in-memory share tree and the directory scanner that builds it.

use crate::{ShareError, ShareResult};
use dctk_hash::{leaves_of_file, TigerHash, HASH_SIZE};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One shared regular file.
#[derive(Debug, Clone)]
pub struct ShareFile {
    /// File name, last component of the logical path.
    pub name: String,
    /// Absolute path on the local filesystem.
    pub real_path: PathBuf,
    /// Logical path inside the share, `alias/sub/name`.
    pub share_path: String,
    /// Size in bytes.
    pub size: u64,
    /// Content address.
    pub tth: TigerHash,
    /// Retained TTH-leaves level, left to right.
    pub leaves: Vec<[u8; HASH_SIZE]>,
}

impl ShareFile {
    /// The leaves stream as served for `tthl` requests: concatenated
    /// 24-byte nodes, no header.
    pub fn leaves_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.leaves.len() * HASH_SIZE);
        for leaf in &self.leaves {
            out.extend_from_slice(leaf);
        }
        out
    }
}

/// A directory node of the share, children ordered by name.
#[derive(Debug, Clone, Default)]
pub struct ShareDirectory {
    pub name: String,
    pub dirs: Vec<ShareDirectory>,
    pub files: Vec<ShareFile>,
}

/// The full share: one root directory per mount alias.
#[derive(Debug, Clone, Default)]
pub struct ShareTree {
    pub roots: Vec<ShareDirectory>,
}

impl ShareTree {
    /// An empty share.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Scan and hash every mount. Blocking; run it on a worker thread.
    ///
    /// Unreadable entries are skipped with a warning so one bad file does
    /// not lose the whole share.
    pub fn index(mounts: &[(String, PathBuf)]) -> ShareResult<ShareTree> {
        let mut roots = Vec::with_capacity(mounts.len());
        for (alias, path) in mounts {
            if !path.is_dir() {
                return Err(ShareError::BadPath(path.clone()));
            }
            let mut root = scan_directory(path, alias)?;
            root.name = alias.clone();
            roots.push(root);
        }
        let tree = ShareTree { roots };
        debug!(
            files = tree.file_count(),
            bytes = tree.total_size(),
            "share indexed"
        );
        Ok(tree)
    }

    /// Total shared bytes, as advertised to the hub.
    pub fn total_size(&self) -> u64 {
        fn dir_size(dir: &ShareDirectory) -> u64 {
            dir.files.iter().map(|f| f.size).sum::<u64>()
                + dir.dirs.iter().map(dir_size).sum::<u64>()
        }
        self.roots.iter().map(dir_size).sum()
    }

    /// Number of shared files.
    pub fn file_count(&self) -> usize {
        fn dir_count(dir: &ShareDirectory) -> usize {
            dir.files.len() + dir.dirs.iter().map(dir_count).sum::<usize>()
        }
        self.roots.iter().map(dir_count).sum()
    }

    /// Find a file by exact content address. Depth-first; the first scan
    /// hit wins when duplicate TTHs are shared.
    pub fn find_by_tth(&self, tth: TigerHash) -> Option<&ShareFile> {
        fn scan(dir: &ShareDirectory, tth: TigerHash) -> Option<&ShareFile> {
            for file in &dir.files {
                if file.tth == tth {
                    return Some(file);
                }
            }
            for sub in &dir.dirs {
                if let Some(hit) = scan(sub, tth) {
                    return Some(hit);
                }
            }
            None
        }
        self.roots.iter().find_map(|root| scan(root, tth))
    }

    /// Find files whose logical path contains every term,
    /// case-insensitively. Serves incoming hub searches.
    pub fn search_name(&self, terms: &[String], limit: usize) -> Vec<&ShareFile> {
        let lowered: Vec<String> = terms.iter().map(|t| t.to_lowercase()).collect();
        let mut hits = Vec::new();
        fn scan<'a>(
            dir: &'a ShareDirectory,
            terms: &[String],
            limit: usize,
            hits: &mut Vec<&'a ShareFile>,
        ) {
            for file in &dir.files {
                if hits.len() >= limit {
                    return;
                }
                let path = file.share_path.to_lowercase();
                if terms.iter().all(|t| path.contains(t)) {
                    hits.push(file);
                }
            }
            for sub in &dir.dirs {
                if hits.len() >= limit {
                    return;
                }
                scan(sub, terms, limit, hits);
            }
        }
        for root in &self.roots {
            scan(root, &lowered, limit, &mut hits);
        }
        hits
    }
}

fn scan_directory(path: &Path, share_path: &str) -> ShareResult<ShareDirectory> {
    let mut entries: Vec<_> = std::fs::read_dir(path)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());

    let mut dir = ShareDirectory {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        ..Default::default()
    };

    for entry in entries {
        let entry_path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let logical = format!("{}/{}", share_path, name);

        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                warn!(path = %entry_path.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if meta.is_dir() {
            dir.dirs.push(scan_directory(&entry_path, &logical)?);
        } else if meta.is_file() {
            match leaves_of_file(&entry_path) {
                Ok(digest) => dir.files.push(ShareFile {
                    name,
                    real_path: entry_path,
                    share_path: logical,
                    size: meta.len(),
                    tth: digest.root,
                    leaves: digest.leaves,
                }),
                Err(e) => {
                    warn!(path = %entry_path.display(), error = %e, "skipping unhashable file");
                }
            }
        }
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dctk_hash::tth_of_bytes;
    use std::fs;

    fn build_fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), vec![b'A'; 10_000]).unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("sub/deep")).unwrap();
        fs::write(dir.path().join("sub/deep/c.bin"), vec![0u8; 2048]).unwrap();
        dir
    }

    #[test]
    fn test_index_walks_tree() {
        let fixture = build_fixture();
        let tree =
            ShareTree::index(&[("share".to_string(), fixture.path().to_path_buf())]).unwrap();

        assert_eq!(tree.file_count(), 3);
        assert_eq!(tree.total_size(), 10_000 + 5 + 2048);

        let root = &tree.roots[0];
        assert_eq!(root.name, "share");
        assert_eq!(root.files[0].name, "a.txt");
        assert_eq!(root.files[0].share_path, "share/a.txt");
        assert_eq!(
            root.files[0].tth.to_string(),
            "UJUIOGYVALWRB56PRJEB6ZH3G4OLTELOEQ3UKMY"
        );
        assert_eq!(root.dirs[0].name, "sub");
        assert_eq!(root.dirs[0].files[0].share_path, "share/sub/b.txt");
    }

    #[test]
    fn test_find_by_tth() {
        let fixture = build_fixture();
        let tree =
            ShareTree::index(&[("share".to_string(), fixture.path().to_path_buf())]).unwrap();

        let tth = tth_of_bytes(b"hello");
        let hit = tree.find_by_tth(tth).unwrap();
        assert_eq!(hit.name, "b.txt");
        assert!(tree.find_by_tth(tth_of_bytes(b"missing")).is_none());
    }

    #[test]
    fn test_search_name() {
        let fixture = build_fixture();
        let tree =
            ShareTree::index(&[("share".to_string(), fixture.path().to_path_buf())]).unwrap();

        let hits = tree.search_name(&["B.TXT".to_string()], 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "b.txt");

        let hits = tree.search_name(&["sub".to_string()], 10);
        assert_eq!(hits.len(), 2);

        let hits = tree.search_name(&["sub".to_string()], 1);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_bad_mount_is_config_error() {
        let err = ShareTree::index(&[("x".to_string(), PathBuf::from("/does/not/exist"))]);
        assert!(matches!(err, Err(ShareError::BadPath(_))));
    }

    #[test]
    fn test_leaves_bytes_layout() {
        let fixture = build_fixture();
        let tree =
            ShareTree::index(&[("share".to_string(), fixture.path().to_path_buf())]).unwrap();
        let file = &tree.roots[0].files[0];
        assert_eq!(file.leaves_bytes().len(), file.leaves.len() * HASH_SIZE);
        assert!(!file.leaves.is_empty());
    }
}

//! SHA-256 content fingerprints used for change detection.

use std::fmt;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{io_err, ValueError};
use crate::tree::FileTree;

/// Lowercase hex SHA-256 digest of some content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(bytes)))
    }

    pub fn of_str(s: &str) -> Self {
        Self::of_bytes(s.as_bytes())
    }

    /// Hash a file on disk without loading it into memory at once.
    pub fn of_file(path: &Path) -> Result<Self, ValueError> {
        let mut file = std::fs::File::open(path).map_err(|e| io_err(path, e))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = file.read(&mut buf).map_err(|e| io_err(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hex::encode(hasher.finalize())))
    }

    /// Fingerprint of a whole tree: paths and per-file hashes in key order.
    pub fn of_tree(tree: &FileTree) -> Self {
        let mut hasher = Sha256::new();
        for (path, content) in tree {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update(Sha256::digest(content.as_bytes()));
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Wrap an already computed hex digest (e.g. one reported by a remote).
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::FileContent;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            ContentHash::of_str("hello").as_str(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_file_matches_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let data = vec![7u8; 20_000];
        std::fs::write(&path, &data).unwrap();
        assert_eq!(ContentHash::of_file(&path).unwrap(), ContentHash::of_bytes(&data));
    }

    #[test]
    fn test_tree_fingerprint_tracks_content_and_names() {
        let mut a = FileTree::new();
        a.insert("x.txt".into(), FileContent::from("1"));
        let mut b = a.clone();
        assert_eq!(ContentHash::of_tree(&a), ContentHash::of_tree(&b));

        b.insert("x.txt".into(), FileContent::from("2"));
        assert_ne!(ContentHash::of_tree(&a), ContentHash::of_tree(&b));

        let mut c = FileTree::new();
        c.insert("y.txt".into(), FileContent::from("1"));
        assert_ne!(ContentHash::of_tree(&a), ContentHash::of_tree(&c));
    }

    #[test]
    fn test_from_hex_normalises_case() {
        assert_eq!(ContentHash::from_hex("ABC").as_str(), "abc");
    }
}

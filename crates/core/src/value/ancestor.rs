//! Persisted ancestor snapshot: the last tree known to match the remote.
//!
//! Stored as two JSON files in the state directory, `version.json` and
//! `value.json`. Each is written atomically (temp file + rename). The two
//! must exist together; a state directory holding only one of them has no
//! ancestor.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{io_err, CoreError, ValueError};
use crate::tree::FileTree;
use crate::value::TreeValue;

const VERSION_FILE: &str = "version.json";
const VALUE_FILE: &str = "value.json";

/// An ancestor tree and the remote version it was taken from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AncestorSnapshot {
    pub value: FileTree,
    pub version: u64,
}

/// On-disk ancestor, cached in memory after [`AncestorStore::open`].
#[derive(Debug)]
pub struct AncestorStore {
    dir: PathBuf,
    value: FileTree,
    version: Option<u64>,
}

impl AncestorStore {
    /// Open the store in `dir`, loading any existing snapshot.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ValueError> {
        let dir = dir.into();
        let mut store = Self {
            dir,
            value: FileTree::new(),
            version: None,
        };
        if let Some(snapshot) = store.load()? {
            store.value = snapshot.value;
            store.version = Some(snapshot.version);
        }
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether both halves of a snapshot are present.
    pub fn exists(&self) -> bool {
        self.version.is_some()
    }

    pub fn current_version(&self) -> Option<u64> {
        self.version
    }

    pub fn tree(&self) -> &FileTree {
        &self.value
    }

    /// Read the snapshot from disk, bypassing the cache.
    pub fn load(&self) -> Result<Option<AncestorSnapshot>, ValueError> {
        let version_path = self.dir.join(VERSION_FILE);
        let value_path = self.dir.join(VALUE_FILE);

        match (version_path.exists(), value_path.exists()) {
            (true, true) => {}
            (false, false) => return Ok(None),
            (has_version, has_value) => {
                warn!(
                    dir = %self.dir.display(),
                    has_version,
                    has_value,
                    "incomplete ancestor snapshot, treating as absent"
                );
                return Ok(None);
            }
        }

        let version: u64 = read_json(&version_path)?;
        let value: FileTree = read_json(&value_path)?;
        debug!(version, files = value.len(), "loaded ancestor snapshot");
        Ok(Some(AncestorSnapshot { value, version }))
    }

    /// Persist a value and its version together.
    pub fn record(&mut self, value: &FileTree, version: u64) -> Result<(), ValueError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        write_atomic(&self.dir.join(VALUE_FILE), &serde_json::to_vec(value)?)?;
        write_atomic(&self.dir.join(VERSION_FILE), &serde_json::to_vec(&version)?)?;
        self.value = value.clone();
        self.version = Some(version);
        info!(version, files = value.len(), "ancestor recorded");
        Ok(())
    }

    pub fn set_version(&mut self, version: u64) -> Result<(), ValueError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        write_atomic(&self.dir.join(VERSION_FILE), &serde_json::to_vec(&version)?)?;
        self.version = Some(version);
        Ok(())
    }

    /// Forget the ancestor entirely. The next `init` must be allowed to seed.
    pub fn clear(&mut self) -> Result<(), ValueError> {
        for name in [VERSION_FILE, VALUE_FILE] {
            let path = self.dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(&path, e)),
            }
        }
        self.value = FileTree::new();
        self.version = None;
        Ok(())
    }
}

#[async_trait]
impl TreeValue for AncestorStore {
    async fn value(&self) -> Result<FileTree, CoreError> {
        Ok(self.value.clone())
    }

    async fn version(&self) -> Result<Option<u64>, CoreError> {
        Ok(self.version)
    }

    /// Replace the value, keeping the current version.
    async fn set_value(&mut self, value: &FileTree) -> Result<bool, CoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let bytes = serde_json::to_vec(value).map_err(ValueError::from)?;
        write_atomic(&self.dir.join(VALUE_FILE), &bytes)?;
        self.value = value.clone();
        Ok(true)
    }
}

pub(crate) fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ValueError> {
    let bytes = fs::read(path).map_err(|e| io_err(path, e))?;
    serde_json::from_slice(&bytes).map_err(|e| ValueError::Corrupt {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ValueError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    let mut file = File::create(&tmp_path).map_err(|e| io_err(&tmp_path, e))?;
    file.write_all(bytes).map_err(|e| io_err(&tmp_path, e))?;
    file.sync_all().map_err(|e| io_err(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::FileContent;
    use tempfile::TempDir;

    fn sample() -> FileTree {
        let mut t = FileTree::new();
        t.insert("a.txt".into(), FileContent::from("hello"));
        t.insert("img.png".into(), FileContent::Binary(vec![0x89, 0x50, 0xff]));
        t
    }

    #[test]
    fn test_empty_store_has_no_ancestor() {
        let dir = TempDir::new().unwrap();
        let store = AncestorStore::open(dir.path().join("state")).unwrap();
        assert!(!store.exists());
        assert_eq!(store.current_version(), None);
        assert!(store.tree().is_empty());
    }

    #[test]
    fn test_record_and_reopen() {
        let dir = TempDir::new().unwrap();
        let mut store = AncestorStore::open(dir.path()).unwrap();
        store.record(&sample(), 7).unwrap();

        let reopened = AncestorStore::open(dir.path()).unwrap();
        assert_eq!(reopened.current_version(), Some(7));
        assert_eq!(reopened.tree(), &sample());
        assert!(!dir.path().join("value.json.tmp").exists());
    }

    #[test]
    fn test_half_present_is_absent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(VERSION_FILE), "3").unwrap();
        let store = AncestorStore::open(dir.path()).unwrap();
        assert!(!store.exists());
    }

    #[test]
    fn test_corrupt_value_is_reported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(VERSION_FILE), "3").unwrap();
        std::fs::write(dir.path().join(VALUE_FILE), "{not json").unwrap();
        let err = AncestorStore::open(dir.path()).unwrap_err();
        assert!(matches!(err, ValueError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_set_value_keeps_version() {
        let dir = TempDir::new().unwrap();
        let mut store = AncestorStore::open(dir.path()).unwrap();
        store.record(&FileTree::new(), 2).unwrap();
        store.set_value(&sample()).await.unwrap();
        assert_eq!(store.version().await.unwrap(), Some(2));
        assert_eq!(store.load().unwrap().unwrap().value, sample());

        store.set_version(5).unwrap();
        assert_eq!(AncestorStore::open(dir.path()).unwrap().current_version(), Some(5));

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
    }
}

//! The working copy on disk.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::errors::{io_err, CoreError, ValueError};
use crate::path_policy::PathPolicy;
use crate::tree::{FileContent, FileTree};
use crate::value::TreeValue;

// ---------------------------------------------------------------------------
// Special paths
// ---------------------------------------------------------------------------

/// A path whose tree content is produced and consumed by custom code
/// instead of being read from and written to a plain file.
pub trait SpecialFile: Debug + Send + Sync {
    /// Current content, or `None` to leave the path out of the tree.
    fn read(&self, root: &Path, name: &str) -> Result<Option<FileContent>, ValueError>;

    /// Store `content` for the path.
    fn write(&self, root: &Path, name: &str, content: &FileContent) -> Result<(), ValueError>;
}

/// A JSON document kept in canonical compact form.
///
/// Reading parses the file and re-serialises it, so formatting differences
/// on disk never show up as edits. A missing file or a JSON `null` is
/// absent from the tree. Writing only touches the file when the canonical
/// text changes.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFile;

impl JsonFile {
    fn canonical(path: &Path, bytes: &[u8]) -> Result<Option<String>, ValueError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| ValueError::Corrupt {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(serde_json::to_string(&value)?))
    }
}

impl SpecialFile for JsonFile {
    fn read(&self, root: &Path, name: &str) -> Result<Option<FileContent>, ValueError> {
        let path = root.join(name);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&path, e)),
        };
        Ok(Self::canonical(&path, &bytes)?.map(FileContent::Text))
    }

    fn write(&self, root: &Path, name: &str, content: &FileContent) -> Result<(), ValueError> {
        let path = root.join(name);
        let text = Self::canonical(&path, content.as_bytes())?.unwrap_or_else(|| "null".to_string());
        if self.read(root, name)?.as_ref().and_then(FileContent::as_text) == Some(text.as_str()) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
        }
        std::fs::write(&path, text).map_err(|e| io_err(&path, e))
    }
}

// ---------------------------------------------------------------------------
// LocalFileTree
// ---------------------------------------------------------------------------

/// A directory tree read and written as a [`FileTree`].
///
/// Paths matched by the policy's ignore list are invisible: they are never
/// scanned, written or deleted. Special paths bypass the plain file scan and
/// go through their [`SpecialFile`] handler instead; a merge result without
/// them leaves them alone.
#[derive(Debug, Clone)]
pub struct LocalFileTree {
    root: PathBuf,
    policy: PathPolicy,
    specials: BTreeMap<String, Arc<dyn SpecialFile>>,
}

impl LocalFileTree {
    pub fn new(root: impl Into<PathBuf>, policy: PathPolicy) -> Self {
        Self {
            root: root.into(),
            policy,
            specials: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Route `name` through `handler` instead of the plain file scan.
    pub fn add_special(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn SpecialFile>,
    ) -> Result<(), ValueError> {
        let name = name.into();
        validate_rel_path(&name)?;
        debug!(path = %name, handler = ?handler, "special path registered");
        self.specials.insert(name, handler);
        Ok(())
    }

    /// Treat `name` as a JSON document in canonical form.
    pub fn add_special_json(&mut self, name: impl Into<String>) -> Result<(), ValueError> {
        self.add_special(name, Arc::new(JsonFile))
    }

    pub fn is_special(&self, name: &str) -> bool {
        self.specials.contains_key(name)
    }

    /// Read every non-ignored regular file under the root, plus the
    /// special paths that currently have content.
    pub fn scan(&self) -> Result<FileTree, ValueError> {
        let mut tree = FileTree::new();
        if self.root.exists() {
            self.scan_dir(&self.root, "", &mut tree)?;
        }
        for (name, handler) in &self.specials {
            if let Some(content) = handler.read(&self.root, name)? {
                tree.insert(name.clone(), content);
            }
        }
        Ok(tree)
    }

    fn scan_dir(&self, dir: &Path, prefix: &str, tree: &mut FileTree) -> Result<(), ValueError> {
        let entries = std::fs::read_dir(dir).map_err(|e| io_err(dir, e))?;

        for entry in entries {
            let entry = entry.map_err(|e| io_err(dir, e))?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!(dir = %dir.display(), name = ?raw, "skipping file name that is not UTF-8");
                    continue;
                }
            };
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };

            if let Some(pattern) = self.policy.ignored_by(&rel) {
                debug!(path = %rel, pattern, "skipping ignored path");
                continue;
            }
            if self.is_special(&rel) {
                continue;
            }

            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| io_err(&path, e))?;
            if file_type.is_dir() {
                self.scan_dir(&path, &rel, tree)?;
            } else if file_type.is_file() {
                let bytes = std::fs::read(&path).map_err(|e| io_err(&path, e))?;
                tree.insert(rel, FileContent::from_bytes(bytes));
            }
        }
        Ok(())
    }

    /// Make the directory match `target`: remove files missing from it and
    /// write files whose content differs.
    pub fn write_tree(&self, target: &FileTree) -> Result<(), ValueError> {
        for name in target.keys() {
            validate_rel_path(name)?;
        }

        let current = self.scan()?;
        let mut removed = 0usize;
        let mut written = 0usize;

        for name in current
            .keys()
            .filter(|n| !target.contains_key(*n) && !self.is_special(n))
        {
            let path = self.root.join(name);
            std::fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
            self.prune_empty_parents(&path);
            removed += 1;
        }

        for (name, content) in target {
            if self.policy.is_ignored(name) {
                debug!(path = %name, "not writing ignored path");
                continue;
            }
            if current.get(name) == Some(content) {
                continue;
            }
            if let Some(handler) = self.specials.get(name) {
                handler.write(&self.root, name, content)?;
                written += 1;
                continue;
            }
            let path = self.root.join(name);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
            std::fs::write(&path, content.as_bytes()).map_err(|e| io_err(&path, e))?;
            written += 1;
        }

        info!(root = %self.root.display(), written, removed, "local tree updated");
        Ok(())
    }

    fn prune_empty_parents(&self, file: &Path) {
        let mut dir = file.parent();
        while let Some(d) = dir {
            if d == self.root {
                break;
            }
            // Fails on non-empty directories, which ends the walk.
            if std::fs::remove_dir(d).is_err() {
                break;
            }
            dir = d.parent();
        }
    }
}

/// Reject keys that are empty, absolute or step outside the root.
pub(crate) fn validate_rel_path(name: &str) -> Result<(), ValueError> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && !name.contains('\\')
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(ValueError::InvalidPath(name.to_string()))
    }
}

#[async_trait]
impl TreeValue for LocalFileTree {
    async fn value(&self) -> Result<FileTree, CoreError> {
        Ok(self.scan()?)
    }

    async fn set_value(&mut self, value: &FileTree) -> Result<bool, CoreError> {
        self.write_tree(value)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(entries: &[(&str, &str)]) -> FileTree {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), FileContent::from(*v)))
            .collect()
    }

    #[test]
    fn test_scan_skips_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".treesync")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join(".treesync/version.json"), "1").unwrap();
        std::fs::write(dir.path().join("logo.png"), [0xffu8, 0xd8]).unwrap();

        let local = LocalFileTree::new(dir.path(), PathPolicy::new(vec![".treesync".into()]));
        let scanned = local.scan().unwrap();

        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned["src/main.rs"], FileContent::from("fn main() {}"));
        assert!(matches!(scanned["logo.png"], FileContent::Binary(_)));
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let local = LocalFileTree::new(dir.path().join("nope"), PathPolicy::default());
        assert!(local.scan().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_set_value_writes_and_deletes() {
        let dir = TempDir::new().unwrap();
        let mut local = LocalFileTree::new(dir.path(), PathPolicy::default());

        assert!(local
            .set_value(&tree(&[("a.txt", "1"), ("deep/nested/b.txt", "2")]))
            .await
            .unwrap());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("deep/nested/b.txt")).unwrap(),
            "2"
        );

        local.set_value(&tree(&[("a.txt", "changed")])).await.unwrap();
        assert_eq!(local.value().await.unwrap(), tree(&[("a.txt", "changed")]));
        assert!(!dir.path().join("deep").exists());
    }

    #[tokio::test]
    async fn test_set_value_leaves_ignored_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("keep.log"), "log").unwrap();
        let mut local = LocalFileTree::new(dir.path(), PathPolicy::new(vec!["*.log".into()]));

        local.set_value(&tree(&[("a.txt", "1")])).await.unwrap();
        assert!(dir.path().join("keep.log").exists());
    }

    #[tokio::test]
    async fn test_special_json_is_canonical() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("project.json"), "{\n  \"name\": \"demo\",\n  \"n\": 1\n}\n").unwrap();
        std::fs::write(dir.path().join("a.txt"), "1").unwrap();
        let mut local = LocalFileTree::new(dir.path(), PathPolicy::default());
        local.add_special_json("project.json").unwrap();

        let scanned = local.value().await.unwrap();
        assert_eq!(scanned["project.json"], FileContent::from(r#"{"n":1,"name":"demo"}"#));
        assert_eq!(scanned["a.txt"], FileContent::from("1"));

        // Same document, different layout: nothing is rewritten.
        local.set_value(&tree(&[("a.txt", "1"), ("project.json", r#"{ "name": "demo", "n": 1 }"#)])).await.unwrap();
        assert!(std::fs::read_to_string(dir.path().join("project.json")).unwrap().contains('\n'));

        local.set_value(&tree(&[("a.txt", "1"), ("project.json", r#"{"name":"renamed"}"#)])).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("project.json")).unwrap(),
            r#"{"name":"renamed"}"#
        );
    }

    #[tokio::test]
    async fn test_special_path_survives_missing_from_target() {
        let dir = TempDir::new().unwrap();
        let mut local = LocalFileTree::new(dir.path(), PathPolicy::default());
        local.add_special_json("settings.json").unwrap();
        assert!(local.scan().unwrap().is_empty());

        std::fs::write(dir.path().join("settings.json"), "null").unwrap();
        assert!(local.scan().unwrap().is_empty());

        std::fs::write(dir.path().join("settings.json"), r#"{"k":true}"#).unwrap();
        local.set_value(&tree(&[("a.txt", "x")])).await.unwrap();
        assert!(dir.path().join("settings.json").exists());
        assert_eq!(local.scan().unwrap().len(), 2);

        let err = local
            .write_tree(&tree(&[("settings.json", "not json")]))
            .unwrap_err();
        assert!(matches!(err, ValueError::Corrupt { .. }));
        assert!(local.add_special_json("../outside.json").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_scan_skips_non_utf8_names() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        let raw = OsStr::from_bytes(b"bad\xffname.txt");
        if std::fs::write(dir.path().join(raw), "x").is_err() {
            // Some filesystems refuse such names outright.
            return;
        }
        std::fs::write(dir.path().join("good.txt"), "y").unwrap();

        let local = LocalFileTree::new(dir.path(), PathPolicy::default());
        let scanned = local.scan().unwrap();
        assert_eq!(scanned, tree(&[("good.txt", "y")]));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let dir = TempDir::new().unwrap();
        let local = LocalFileTree::new(dir.path(), PathPolicy::default());
        for bad in ["../evil", "/etc/passwd", "a/../../b", "", "a\\b"] {
            let err = local.write_tree(&tree(&[(bad, "x")])).unwrap_err();
            assert!(matches!(err, ValueError::InvalidPath(_)), "accepted {bad:?}");
        }
        assert!(validate_rel_path("dir/file.txt").is_ok());
    }
}

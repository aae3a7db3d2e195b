//! File tree model shared by every value backend and the merge engine.
//!
//! A [`FileTree`] maps forward-slash relative paths to [`FileContent`]. It is
//! a `BTreeMap`, so structural equality only depends on the key set and the
//! content bytes, never on insertion order.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Relative path -> content.
pub type FileTree = BTreeMap<String, FileContent>;

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// The payload of one file.
///
/// Two contents are equal when their bytes are equal, regardless of which
/// variant holds them.
#[derive(Debug, Clone)]
pub enum FileContent {
    Text(String),
    Binary(Vec<u8>),
}

impl FileContent {
    /// Build content from raw bytes, keeping valid UTF-8 as text.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(s) => Self::Text(s),
            Err(e) => Self::Binary(e.into_bytes()),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(s) => s.as_bytes(),
            Self::Binary(b) => b,
        }
    }

    /// The content as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Binary(b) => std::str::from_utf8(b).ok(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(s) => s.into_bytes(),
            Self::Binary(b) => b,
        }
    }
}

impl PartialEq for FileContent {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for FileContent {}

impl From<&str> for FileContent {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for FileContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<Vec<u8>> for FileContent {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

// Text is stored as a plain JSON string, binary as `{"base64": "..."}`.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ContentRepr {
    Text(String),
    Binary { base64: String },
}

impl Serialize for FileContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            Self::Text(s) => ContentRepr::Text(s.clone()),
            Self::Binary(b) => ContentRepr::Binary {
                base64: STANDARD.encode(b),
            },
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for FileContent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match ContentRepr::deserialize(deserializer)? {
            ContentRepr::Text(s) => Ok(Self::Text(s)),
            ContentRepr::Binary { base64 } => STANDARD
                .decode(base64.as_bytes())
                .map(Self::Binary)
                .map_err(serde::de::Error::custom),
        }
    }
}

// ---------------------------------------------------------------------------
// Two-way diff
// ---------------------------------------------------------------------------

/// How a path differs from the ancestor on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    New,
    Delete,
    Change,
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Delete => write!(f, "delete"),
            Self::Change => write!(f, "change"),
        }
    }
}

/// Per-path status of `candidate` relative to `ancestor`. Unchanged paths
/// are omitted.
pub fn diff_tree(candidate: &FileTree, ancestor: &FileTree) -> BTreeMap<String, ChangeStatus> {
    let mut res = BTreeMap::new();
    for name in ancestor.keys() {
        if !candidate.contains_key(name) {
            res.insert(name.clone(), ChangeStatus::Delete);
        }
    }
    for (name, content) in candidate {
        match ancestor.get(name) {
            None => {
                res.insert(name.clone(), ChangeStatus::New);
            }
            Some(old) if old != content => {
                res.insert(name.clone(), ChangeStatus::Change);
            }
            Some(_) => {}
        }
    }
    res
}

/// Paths grouped by change kind, as reported before a push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub new: Vec<String>,
    pub delete: Vec<String>,
    pub changed: Vec<String>,
}

impl ChangeSet {
    /// Group the changes that turn `source` into `target`.
    pub fn between(source: &FileTree, target: &FileTree) -> Self {
        let mut set = Self::default();
        for (name, status) in diff_tree(target, source) {
            match status {
                ChangeStatus::New => set.new.push(name),
                ChangeStatus::Delete => set.delete.push(name),
                ChangeStatus::Change => set.changed.push(name),
            }
        }
        set
    }

    pub fn total(&self) -> usize {
        self.new.len() + self.delete.len() + self.changed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

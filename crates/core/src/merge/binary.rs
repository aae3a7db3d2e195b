//! Whole-file binary merge driven by content hashes.
//!
//! Binary files are never merged byte by byte. Each side either matches the
//! ancestor's recorded hash or it does not, and the outcome is a whole-file
//! copy (or nothing). The ancestor is described by a [`BaseRecord`] holding
//! the last known local and remote hashes; a plain ancestor file is the
//! record whose two hashes are equal.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::MergeError;
use crate::hash::ContentHash;
use crate::merge::ResolvePolicy;

// ---------------------------------------------------------------------------
// Base record
// ---------------------------------------------------------------------------

/// Last known state of a binary file on each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRecord {
    pub local: ContentHash,
    pub remote: ContentHash,
}

impl BaseRecord {
    /// Record for an ancestor file both sides last agreed on.
    pub fn uniform(hash: ContentHash) -> Self {
        Self {
            local: hash.clone(),
            remote: hash,
        }
    }
}

// ---------------------------------------------------------------------------
// Single-file merge
// ---------------------------------------------------------------------------

/// Effects of merging one binary file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryMerge {
    /// New local bytes, when the local file must be overwritten.
    pub local: Option<Vec<u8>>,
    /// Updated base record. Equal to the input when nothing moved.
    pub record: BaseRecord,
    /// Whether the file ended up as a resolved conflict.
    pub conflicted: bool,
}

impl BinaryMerge {
    pub fn is_noop(&self, before: &BaseRecord) -> bool {
        self.local.is_none() && self.record == *before
    }

    /// Whether the ancestor's remote reference moved to a new remote state.
    pub fn advances_ancestor(&self, before: &BaseRecord) -> bool {
        self.record.remote != before.remote
    }
}

/// Merge one binary file given the bytes of both sides and its base record.
///
/// | local vs base | remote vs base | effect |
/// |---|---|---|
/// | same | same | nothing |
/// | same | changed | local := remote, record := {remote, remote} |
/// | changed | same | nothing (local edit waits for a push) |
/// | changed | changed | conflict, settled by `resolve` |
///
/// A conflict resolved as `Local` leaves the local bytes alone and only
/// moves the record's remote reference; `Remote` overwrites the local bytes
/// and moves both references.
pub fn merge_binary(
    path: &str,
    local: &[u8],
    base: &BaseRecord,
    remote: &[u8],
    resolve: Option<ResolvePolicy>,
) -> Result<BinaryMerge, MergeError> {
    let local_hash = ContentHash::of_bytes(local);
    let remote_hash = ContentHash::of_bytes(remote);
    let local_changed = local_hash != base.local;
    let remote_changed = remote_hash != base.remote;

    let unchanged = BinaryMerge {
        local: None,
        record: base.clone(),
        conflicted: false,
    };

    match (local_changed, remote_changed) {
        (false, false) => {
            debug!(path, "binary unchanged on both sides");
            Ok(unchanged)
        }
        (false, true) => {
            debug!(path, "binary changed remotely, taking remote");
            Ok(BinaryMerge {
                local: Some(remote.to_vec()),
                record: BaseRecord::uniform(remote_hash),
                conflicted: false,
            })
        }
        (true, false) => {
            debug!(path, "binary changed locally, leaving for push");
            Ok(unchanged)
        }
        (true, true) => {
            info!(path, resolve = ?resolve, "binary conflict");
            match resolve {
                Some(ResolvePolicy::Local) => Ok(BinaryMerge {
                    local: None,
                    record: BaseRecord {
                        local: base.local.clone(),
                        remote: remote_hash,
                    },
                    conflicted: true,
                }),
                Some(ResolvePolicy::Remote) => Ok(BinaryMerge {
                    local: Some(remote.to_vec()),
                    record: BaseRecord::uniform(remote_hash),
                    conflicted: true,
                }),
                None => Err(MergeError::Conflict {
                    path: path.to_string(),
                }),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Manifest planner
// ---------------------------------------------------------------------------

/// Transfer needed to reconcile one file. Files needing nothing are omitted
/// from a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Upload,
    Download,
    Delete,
}

/// Counts per op kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounts {
    pub upload: usize,
    pub download: usize,
    pub delete: usize,
}

/// Reconciliation plan over hash manifests of both sides and the base records.
#[derive(Debug, Clone, Default)]
pub struct BinaryPlan {
    pub ops: BTreeMap<String, BinaryOp>,
}

impl BinaryPlan {
    /// Plan transfers for every file named by any of the three manifests.
    ///
    /// A file with a base record that vanished on either side is deleted.
    /// Files changed on both sides (or created on both sides) are conflicts
    /// and need `resolve`.
    pub fn build(
        local: &BTreeMap<String, ContentHash>,
        remote: &BTreeMap<String, ContentHash>,
        base: &BTreeMap<String, BaseRecord>,
        resolve: Option<ResolvePolicy>,
    ) -> Result<Self, MergeError> {
        let names: BTreeSet<&String> = local.keys().chain(remote.keys()).chain(base.keys()).collect();
        let mut ops = BTreeMap::new();

        let pick = |name: &str| match resolve {
            Some(ResolvePolicy::Local) => Ok(BinaryOp::Upload),
            Some(ResolvePolicy::Remote) => Ok(BinaryOp::Download),
            None => Err(MergeError::Conflict {
                path: name.to_string(),
            }),
        };

        for name in names {
            let l = local.get(name);
            let r = remote.get(name);
            let op = match (base.get(name), l, r) {
                (Some(_), None, _) | (Some(_), _, None) => Some(BinaryOp::Delete),
                (Some(rec), Some(l), Some(r)) => {
                    match (*l != rec.local, *r != rec.remote) {
                        (true, true) => Some(pick(name)?),
                        (true, false) => Some(BinaryOp::Upload),
                        (false, true) => Some(BinaryOp::Download),
                        (false, false) => None,
                    }
                }
                (None, Some(_), Some(_)) => Some(pick(name)?),
                (None, Some(_), None) => Some(BinaryOp::Upload),
                (None, None, Some(_)) => Some(BinaryOp::Download),
                (None, None, None) => None,
            };
            if let Some(op) = op {
                ops.insert(name.clone(), op);
            }
        }

        Ok(Self { ops })
    }

    pub fn op(&self, name: &str) -> Option<BinaryOp> {
        self.ops.get(name).copied()
    }

    pub fn counts(&self) -> OpCounts {
        let mut counts = OpCounts::default();
        for op in self.ops.values() {
            match op {
                BinaryOp::Upload => counts.upload += 1,
                BinaryOp::Download => counts.download += 1,
                BinaryOp::Delete => counts.delete += 1,
            }
        }
        counts
    }

    /// One-line summary such as `Content Changes: 1 upload, 2 download.`
    pub fn status_line(&self, include_local: bool) -> String {
        let counts = self.counts();
        let mut items = Vec::new();
        if counts.upload > 0 && include_local {
            items.push(format!("{} upload", counts.upload));
        }
        if counts.download > 0 {
            items.push(format!("{} download", counts.download));
        }
        if counts.delete > 0 {
            items.push(format!("{} delete", counts.delete));
        }
        if items.is_empty() {
            return "No Content Changes.".to_string();
        }
        format!("Content Changes: {}.", items.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(s: &str) -> ContentHash {
        ContentHash::of_str(s)
    }

    fn manifest(entries: &[(&str, &str)]) -> BTreeMap<String, ContentHash> {
        entries.iter().map(|(k, v)| (k.to_string(), h(v))).collect()
    }

    #[test]
    fn test_plan_noop_when_both_match_record() {
        let local = manifest(&[("a", "123")]);
        let remote = manifest(&[("a", "1234")]);
        let mut base = BTreeMap::new();
        base.insert(
            "a".to_string(),
            BaseRecord {
                local: h("123"),
                remote: h("1234"),
            },
        );
        let plan = BinaryPlan::build(&local, &remote, &base, None).unwrap();
        assert_eq!(plan.op("a"), None);
        assert_eq!(plan.status_line(true), "No Content Changes.");
    }

    #[test]
    fn test_plan_ops() {
        let local = manifest(&[("up", "new"), ("down", "same"), ("gone_remote", "x"), ("fresh", "f")]);
        let remote = manifest(&[("up", "same"), ("down", "new"), ("incoming", "i")]);
        let mut base = BTreeMap::new();
        base.insert("up".to_string(), BaseRecord::uniform(h("same")));
        base.insert("down".to_string(), BaseRecord::uniform(h("same")));
        base.insert("gone_remote".to_string(), BaseRecord::uniform(h("x")));

        let plan = BinaryPlan::build(&local, &remote, &base, None).unwrap();
        assert_eq!(plan.op("up"), Some(BinaryOp::Upload));
        assert_eq!(plan.op("down"), Some(BinaryOp::Download));
        assert_eq!(plan.op("gone_remote"), Some(BinaryOp::Delete));
        assert_eq!(plan.op("fresh"), Some(BinaryOp::Upload));
        assert_eq!(plan.op("incoming"), Some(BinaryOp::Download));
        assert_eq!(
            plan.counts(),
            OpCounts {
                upload: 2,
                download: 2,
                delete: 1
            }
        );
        assert_eq!(plan.status_line(true), "Content Changes: 2 upload, 2 download, 1 delete.");
        assert_eq!(plan.status_line(false), "Content Changes: 2 download, 1 delete.");
    }

    #[test]
    fn test_plan_conflicts_need_policy() {
        let local = manifest(&[("both", "l"), ("created", "l")]);
        let remote = manifest(&[("both", "r"), ("created", "r")]);
        let mut base = BTreeMap::new();
        base.insert("both".to_string(), BaseRecord::uniform(h("o")));

        assert!(matches!(
            BinaryPlan::build(&local, &remote, &base, None),
            Err(MergeError::Conflict { .. })
        ));
        let ours = BinaryPlan::build(&local, &remote, &base, Some(ResolvePolicy::Local)).unwrap();
        assert_eq!(ours.op("both"), Some(BinaryOp::Upload));
        assert_eq!(ours.op("created"), Some(BinaryOp::Upload));
        let theirs = BinaryPlan::build(&local, &remote, &base, Some(ResolvePolicy::Remote)).unwrap();
        assert_eq!(theirs.op("both"), Some(BinaryOp::Download));
    }

    #[test]
    fn test_merge_noop_against_split_record() {
        let base = BaseRecord {
            local: h("123"),
            remote: h("1234"),
        };
        let res = merge_binary("a", b"123", &base, b"1234", None).unwrap();
        assert!(res.is_noop(&base));
        assert!(!res.conflicted);
    }

    #[test]
    fn test_merge_remote_update() {
        let base = BaseRecord::uniform(h("hello"));
        let res = merge_binary("test1", b"hello", &base, b"hello2", Some(ResolvePolicy::Local)).unwrap();
        assert_eq!(res.local.as_deref(), Some(&b"hello2"[..]));
        assert_eq!(res.record, BaseRecord::uniform(h("hello2")));
    }

    #[test]
    fn test_merge_local_edit_leaves_ancestor_stale() {
        let base = BaseRecord::uniform(h("hello"));
        let res = merge_binary("test1", b"edited", &base, b"hello", None).unwrap();
        assert!(res.is_noop(&base));
        assert!(!res.advances_ancestor(&base));
    }

    #[test]
    fn test_merge_conflict_resolution() {
        let base = BaseRecord::uniform(h("o"));

        assert!(matches!(
            merge_binary("x.png", b"l", &base, b"r", None),
            Err(MergeError::Conflict { ref path }) if path == "x.png"
        ));

        let ours = merge_binary("x.png", b"l", &base, b"r", Some(ResolvePolicy::Local)).unwrap();
        assert!(ours.local.is_none());
        assert_eq!(ours.record.local, h("o"));
        assert_eq!(ours.record.remote, h("r"));
        assert!(ours.conflicted);
        assert!(ours.advances_ancestor(&base));

        let theirs = merge_binary("x.png", b"l", &base, b"r", Some(ResolvePolicy::Remote)).unwrap();
        assert_eq!(theirs.local.as_deref(), Some(&b"r"[..]));
        assert_eq!(theirs.record, BaseRecord::uniform(h("r")));
    }
}

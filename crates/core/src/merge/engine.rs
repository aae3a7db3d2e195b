//! Tree-level merge orchestration.
//!
//! [`MergeEngine::merge`] walks every path in the union of the local,
//! ancestor and remote trees, classifies it with [`diff_trees`] and decides
//! what the merged local tree and the updated ancestor hold for that path.
//! Files present everywhere go to the text or binary merge according to the
//! [`PathPolicy`] strategy table.
//!
//! The engine is pure: it never touches a value backend, so an error leaves
//! every replica as it was.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::MergeError;
use crate::hash::ContentHash;
use crate::merge::binary::{merge_binary, BaseRecord};
use crate::merge::presence::{diff_trees, DiffEntry, PresenceState};
use crate::merge::text::merge_text_counted;
use crate::merge::ResolvePolicy;
use crate::path_policy::{MergeStrategy, PathPolicy};
use crate::tree::{FileContent, FileTree};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// What the engine did for one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    /// Remote content copied into local and ancestor.
    TakeRemote,
    /// Local content stands as-is.
    KeepLocal,
    /// Path dropped from the ancestor only.
    DropAncestor,
    /// Path removed from local and ancestor.
    DeleteLocal,
    /// Three-way text merge produced the local content.
    TextMerged,
    /// Both sides touched the whole file; the local copy won.
    ConflictLocal,
    /// Both sides touched the whole file; the remote copy won.
    ConflictRemote,
}

impl std::fmt::Display for MergeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TakeRemote => write!(f, "take-remote"),
            Self::KeepLocal => write!(f, "keep-local"),
            Self::DropAncestor => write!(f, "drop-ancestor"),
            Self::DeleteLocal => write!(f, "delete-local"),
            Self::TextMerged => write!(f, "text-merged"),
            Self::ConflictLocal => write!(f, "conflict-local"),
            Self::ConflictRemote => write!(f, "conflict-remote"),
        }
    }
}

/// Output of a tree merge: the new local tree, the new ancestor tree and the
/// per-path actions taken, in path order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeMerge {
    pub local: FileTree,
    pub ancestor: FileTree,
    pub actions: Vec<(String, MergeAction)>,
    /// Conflicting text regions settled by the resolve policy, over all paths.
    pub text_conflicts: usize,
}

impl TreeMerge {
    pub fn action(&self, path: &str) -> Option<MergeAction> {
        self.actions
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, a)| *a)
    }

    /// Conflicts settled by the resolve policy: whole files plus text regions.
    pub fn conflicts(&self) -> usize {
        let files = self
            .actions
            .iter()
            .filter(|(_, a)| matches!(a, MergeAction::ConflictLocal | MergeAction::ConflictRemote))
            .count();
        files + self.text_conflicts
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Merges whole trees under one path policy and one resolve policy.
#[derive(Debug, Clone, Default)]
pub struct MergeEngine {
    policy: PathPolicy,
    resolve: Option<ResolvePolicy>,
}

impl MergeEngine {
    pub fn new(policy: PathPolicy, resolve: Option<ResolvePolicy>) -> Self {
        Self { policy, resolve }
    }

    pub fn policy(&self) -> &PathPolicy {
        &self.policy
    }

    pub fn resolve(&self) -> Option<ResolvePolicy> {
        self.resolve
    }

    /// Merge with the engine's configured resolve policy.
    pub fn merge(
        &self,
        local: &FileTree,
        ancestor: &FileTree,
        remote: &FileTree,
    ) -> Result<TreeMerge, MergeError> {
        self.merge_with(local, ancestor, remote, self.resolve)
    }

    /// Merge with an explicit resolve policy for this call only.
    pub fn merge_with(
        &self,
        local: &FileTree,
        ancestor: &FileTree,
        remote: &FileTree,
        resolve: Option<ResolvePolicy>,
    ) -> Result<TreeMerge, MergeError> {
        let mut out = TreeMerge {
            local: local.clone(),
            ancestor: ancestor.clone(),
            actions: Vec::new(),
            text_conflicts: 0,
        };

        for entry in diff_trees(local, ancestor, remote) {
            if !entry.needs_action() {
                continue;
            }
            let action = self.merge_entry(&entry, local, remote, resolve, &mut out)?;
            debug!(path = %entry.name, state = %entry.state, action = %action, "merged path");
            out.actions.push((entry.name, action));
        }

        info!(
            actions = out.actions.len(),
            conflicts = out.conflicts(),
            "tree merge complete"
        );
        Ok(out)
    }

    fn merge_entry(
        &self,
        entry: &DiffEntry,
        local: &FileTree,
        remote: &FileTree,
        resolve: Option<ResolvePolicy>,
        out: &mut TreeMerge,
    ) -> Result<MergeAction, MergeError> {
        let name = entry.name.as_str();

        match entry.state {
            PresenceState::RemoteCreated => {
                let theirs = content(remote, name)?;
                out.local.insert(name.to_string(), theirs.clone());
                out.ancestor.insert(name.to_string(), theirs);
                Ok(MergeAction::TakeRemote)
            }
            PresenceState::LocalCreated | PresenceState::LocalDeleted => Ok(MergeAction::KeepLocal),
            PresenceState::DeletedBoth => {
                out.ancestor.remove(name);
                Ok(MergeAction::DropAncestor)
            }
            PresenceState::RemoteDeleted => {
                out.local.remove(name);
                out.ancestor.remove(name);
                Ok(MergeAction::DeleteLocal)
            }
            PresenceState::CreatedBoth => {
                let theirs = content(remote, name)?;
                if entry.local_hash == entry.remote_hash {
                    debug!(path = name, "created identically on both sides");
                    out.ancestor.insert(name.to_string(), theirs);
                    return Ok(MergeAction::KeepLocal);
                }
                match resolve {
                    Some(ResolvePolicy::Local) => {
                        out.ancestor.insert(name.to_string(), theirs);
                        Ok(MergeAction::ConflictLocal)
                    }
                    Some(ResolvePolicy::Remote) => {
                        out.local.insert(name.to_string(), theirs.clone());
                        out.ancestor.insert(name.to_string(), theirs);
                        Ok(MergeAction::ConflictRemote)
                    }
                    None => Err(MergeError::Conflict {
                        path: name.to_string(),
                    }),
                }
            }
            PresenceState::Everywhere => self.merge_everywhere(entry, local, remote, resolve, out),
        }
    }

    fn merge_everywhere(
        &self,
        entry: &DiffEntry,
        local: &FileTree,
        remote: &FileTree,
        resolve: Option<ResolvePolicy>,
        out: &mut TreeMerge,
    ) -> Result<MergeAction, MergeError> {
        let name = entry.name.as_str();
        let l = content(local, name)?;
        let r = content(remote, name)?;
        let a = content(&out.ancestor, name)?;

        let strategy = self.policy.strategy_for(name);
        let texts = match strategy {
            MergeStrategy::Text => l.as_text().zip(a.as_text()).zip(r.as_text()),
            MergeStrategy::Binary => None,
        };

        if let Some(((lt, at), rt)) = texts {
            let merged = merge_text_counted(name, lt, at, rt, resolve)?;
            out.text_conflicts += merged.conflicts;
            out.local.insert(name.to_string(), FileContent::Text(merged.text));
            out.ancestor.insert(name.to_string(), r);
            return Ok(MergeAction::TextMerged);
        }

        if strategy == MergeStrategy::Text {
            warn!(path = name, "content is not UTF-8, merging as binary");
        }

        let base = BaseRecord::uniform(
            entry
                .ancestor_hash
                .clone()
                .unwrap_or_else(|| ContentHash::of_bytes(a.as_bytes())),
        );
        let res = merge_binary(name, l.as_bytes(), &base, r.as_bytes(), resolve)?;

        if let Some(bytes) = res.local.clone() {
            out.local.insert(name.to_string(), FileContent::from_bytes(bytes));
        }
        if res.advances_ancestor(&base) {
            out.ancestor.insert(name.to_string(), r);
        }

        Ok(match (res.conflicted, resolve) {
            (true, Some(ResolvePolicy::Local)) => MergeAction::ConflictLocal,
            (true, _) => MergeAction::ConflictRemote,
            (false, _) if res.local.is_some() => MergeAction::TakeRemote,
            (false, _) => MergeAction::KeepLocal,
        })
    }
}

// Unreachable for paths taken from the classifier.
fn missing(name: &str) -> MergeError {
    MergeError::Conflict {
        path: name.to_string(),
    }
}

fn content(tree: &FileTree, name: &str) -> Result<FileContent, MergeError> {
    tree.get(name).cloned().ok_or_else(|| missing(name))
}

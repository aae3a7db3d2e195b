//! Presence classification across the local, ancestor and remote trees.
//!
//! For every path in the union of the three trees the classifier records
//! which trees hold it and what each side did relative to the ancestor.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::hash::ContentHash;
use crate::tree::{ChangeStatus, FileTree};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Which of {local, ancestor, remote} hold a path.
///
/// The all-absent combination cannot occur for a path taken from the union
/// of the trees, so it has no variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    /// `--r`: created remotely.
    RemoteCreated,
    /// `l--`: created locally.
    LocalCreated,
    /// `-a-`: deleted on both sides.
    DeletedBoth,
    /// `-ar`: deleted locally.
    LocalDeleted,
    /// `la-`: deleted remotely.
    RemoteDeleted,
    /// `l-r`: created independently on both sides.
    CreatedBoth,
    /// `lar`: present everywhere.
    Everywhere,
}

impl PresenceState {
    /// Classify a presence triple. Returns `None` for `---`.
    pub fn classify(in_local: bool, in_ancestor: bool, in_remote: bool) -> Option<Self> {
        match (in_local, in_ancestor, in_remote) {
            (false, false, true) => Some(Self::RemoteCreated),
            (true, false, false) => Some(Self::LocalCreated),
            (false, true, false) => Some(Self::DeletedBoth),
            (false, true, true) => Some(Self::LocalDeleted),
            (true, true, false) => Some(Self::RemoteDeleted),
            (true, false, true) => Some(Self::CreatedBoth),
            (true, true, true) => Some(Self::Everywhere),
            (false, false, false) => None,
        }
    }

    /// Classify `name` by looking it up in the three trees.
    pub fn of(name: &str, local: &FileTree, ancestor: &FileTree, remote: &FileTree) -> Option<Self> {
        Self::classify(
            local.contains_key(name),
            ancestor.contains_key(name),
            remote.contains_key(name),
        )
    }

    /// Compact `lar` notation, `-` marking absence.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RemoteCreated => "--r",
            Self::LocalCreated => "l--",
            Self::DeletedBoth => "-a-",
            Self::LocalDeleted => "-ar",
            Self::RemoteDeleted => "la-",
            Self::CreatedBoth => "l-r",
            Self::Everywhere => "lar",
        }
    }

    /// Status of the local side implied by presence alone.
    ///
    /// For [`PresenceState::Everywhere`] this is `None`; content decides.
    pub fn local_status(&self) -> Option<ChangeStatus> {
        match self {
            Self::LocalCreated | Self::CreatedBoth => Some(ChangeStatus::New),
            Self::DeletedBoth | Self::LocalDeleted => Some(ChangeStatus::Delete),
            Self::RemoteCreated | Self::RemoteDeleted | Self::Everywhere => None,
        }
    }

    /// Status of the remote side implied by presence alone.
    pub fn remote_status(&self) -> Option<ChangeStatus> {
        match self {
            Self::RemoteCreated | Self::CreatedBoth => Some(ChangeStatus::New),
            Self::DeletedBoth | Self::RemoteDeleted => Some(ChangeStatus::Delete),
            Self::LocalCreated | Self::LocalDeleted | Self::Everywhere => None,
        }
    }
}

impl std::fmt::Display for PresenceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Classification of one path, relative to the ancestor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub name: String,
    pub state: PresenceState,
    pub local_status: Option<ChangeStatus>,
    pub remote_status: Option<ChangeStatus>,
    pub local_hash: Option<ContentHash>,
    pub ancestor_hash: Option<ContentHash>,
    pub remote_hash: Option<ContentHash>,
}

impl DiffEntry {
    /// Whether the merge engine has anything to do for this path.
    pub fn needs_action(&self) -> bool {
        self.local_status.is_some() || self.remote_status.is_some()
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Classify one path that appears in at least one of the trees.
pub fn diff_entry(
    name: &str,
    local: &FileTree,
    ancestor: &FileTree,
    remote: &FileTree,
) -> Option<DiffEntry> {
    let state = PresenceState::of(name, local, ancestor, remote)?;

    let local_hash = local.get(name).map(|c| ContentHash::of_bytes(c.as_bytes()));
    let ancestor_hash = ancestor.get(name).map(|c| ContentHash::of_bytes(c.as_bytes()));
    let remote_hash = remote.get(name).map(|c| ContentHash::of_bytes(c.as_bytes()));

    let (local_status, remote_status) = match state {
        PresenceState::Everywhere => (
            (local_hash != ancestor_hash).then_some(ChangeStatus::Change),
            (remote_hash != ancestor_hash).then_some(ChangeStatus::Change),
        ),
        other => (other.local_status(), other.remote_status()),
    };

    Some(DiffEntry {
        name: name.to_string(),
        state,
        local_status,
        remote_status,
        local_hash,
        ancestor_hash,
        remote_hash,
    })
}

/// Classify every path in the union of the three trees, in path order.
pub fn diff_trees(local: &FileTree, ancestor: &FileTree, remote: &FileTree) -> Vec<DiffEntry> {
    let names: BTreeSet<&String> = local
        .keys()
        .chain(ancestor.keys())
        .chain(remote.keys())
        .collect();

    let entries: Vec<DiffEntry> = names
        .into_iter()
        .filter_map(|name| diff_entry(name, local, ancestor, remote))
        .inspect(|e| {
            debug!(
                path = %e.name,
                state = %e.state,
                local = ?e.local_status,
                remote = ?e.remote_status,
                "classified path"
            )
        })
        .collect();

    info!(
        paths = entries.len(),
        pending = entries.iter().filter(|e| e.needs_action()).count(),
        "tree classification complete"
    );
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::FileContent;

    fn tree(entries: &[(&str, &str)]) -> FileTree {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), FileContent::from(*v)))
            .collect()
    }

    #[test]
    fn test_classify_all_combinations() {
        use PresenceState::*;
        assert_eq!(PresenceState::classify(false, false, true), Some(RemoteCreated));
        assert_eq!(PresenceState::classify(true, false, false), Some(LocalCreated));
        assert_eq!(PresenceState::classify(false, true, false), Some(DeletedBoth));
        assert_eq!(PresenceState::classify(false, true, true), Some(LocalDeleted));
        assert_eq!(PresenceState::classify(true, true, false), Some(RemoteDeleted));
        assert_eq!(PresenceState::classify(true, false, true), Some(CreatedBoth));
        assert_eq!(PresenceState::classify(true, true, true), Some(Everywhere));
        assert_eq!(PresenceState::classify(false, false, false), None);
    }

    #[test]
    fn test_codes() {
        assert_eq!(PresenceState::RemoteCreated.code(), "--r");
        assert_eq!(PresenceState::LocalDeleted.to_string(), "-ar");
        assert_eq!(PresenceState::Everywhere.code(), "lar");
    }

    #[test]
    fn test_diff_trees_statuses() {
        let local = tree(&[("l", "1"), ("la", "1"), ("lr", "1"), ("lar", "changed"), ("same", "s")]);
        let ancestor = tree(&[("a", "1"), ("ar", "1"), ("la", "1"), ("lar", "base"), ("same", "s")]);
        let remote = tree(&[("r", "1"), ("ar", "1"), ("lr", "2"), ("lar", "base"), ("same", "s")]);

        let entries = diff_trees(&local, &ancestor, &remote);
        let get = |n: &str| entries.iter().find(|e| e.name == n).unwrap().clone();

        assert_eq!(entries.len(), 8);

        let r = get("r");
        assert_eq!(r.state, PresenceState::RemoteCreated);
        assert_eq!((r.local_status, r.remote_status), (None, Some(ChangeStatus::New)));

        let a = get("a");
        assert_eq!(
            (a.local_status, a.remote_status),
            (Some(ChangeStatus::Delete), Some(ChangeStatus::Delete))
        );

        assert_eq!(get("ar").local_status, Some(ChangeStatus::Delete));
        assert_eq!(get("la").remote_status, Some(ChangeStatus::Delete));

        let lr = get("lr");
        assert_eq!(
            (lr.local_status, lr.remote_status),
            (Some(ChangeStatus::New), Some(ChangeStatus::New))
        );

        let lar = get("lar");
        assert_eq!((lar.local_status, lar.remote_status), (Some(ChangeStatus::Change), None));
        assert!(lar.needs_action());

        let same = get("same");
        assert!(!same.needs_action());
        assert_eq!(same.local_hash, same.ancestor_hash);
    }
}

//! Three-way merge of local, ancestor and remote file trees.
//!
//! The merge subsystem is responsible for:
//! 1. **Classification** -- which of the three trees hold a path ([`presence`]).
//! 2. **Text merge** -- line-granular diff3 with per-region resolution ([`text`]).
//! 3. **Binary merge** -- whole-file decisions from content hashes ([`binary`]).
//! 4. **Orchestration** -- per-path dispatch over whole trees ([`engine`]).

pub mod binary;
pub mod engine;
pub mod presence;
pub mod text;

use serde::{Deserialize, Serialize};

pub use binary::{BaseRecord, BinaryMerge, BinaryOp, BinaryPlan};
pub use engine::{MergeAction, MergeEngine, TreeMerge};
pub use presence::{diff_trees, DiffEntry, PresenceState};
pub use text::{merge_text, merge_text_counted, TextMerge, TextRegion};

/// Tie-break applied uniformly to every unresolved conflict in one merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvePolicy {
    /// Keep the local side of each conflict.
    Local,
    /// Take the remote side of each conflict.
    Remote,
}

impl std::fmt::Display for ResolvePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

impl std::str::FromStr for ResolvePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" | "ours" => Ok(Self::Local),
            "remote" | "theirs" => Ok(Self::Remote),
            other => Err(format!("unknown resolve policy '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_policy_parse() {
        assert_eq!("local".parse::<ResolvePolicy>().unwrap(), ResolvePolicy::Local);
        assert_eq!("theirs".parse::<ResolvePolicy>().unwrap(), ResolvePolicy::Remote);
        assert!("both".parse::<ResolvePolicy>().is_err());
        assert_eq!(ResolvePolicy::Remote.to_string(), "remote");
    }
}

//! treesync core library.
//!
//! This crate reconciles a local working tree with a remote authoritative
//! copy through a cached ancestor snapshot: per-path presence
//! classification, three-way text and binary merge, uniform value backends,
//! a version-gated pull/merge/push state machine and trigger coalescing.

pub mod coalescer;
pub mod config;
pub mod errors;
pub mod hash;
pub mod merge;
pub mod path_policy;
pub mod sync_manager;
pub mod tree;
pub mod value;

// Re-exports for convenience.
pub use coalescer::{Coalescer, CoalescerStatus};
pub use config::TreeSyncConfig;
pub use errors::CoreError;
pub use hash::ContentHash;
pub use merge::{MergeEngine, ResolvePolicy};
pub use path_policy::{MergeStrategy, PathPolicy};
pub use sync_manager::{SyncEvent, SyncManager, SyncOptions, SyncPhase, SyncStats};
pub use tree::{FileContent, FileTree};
pub use value::{AncestorStore, DirRemote, LocalFileTree, MemoryRemote, MemoryValue, RemoteClient, RemoteValue, TreeValue};

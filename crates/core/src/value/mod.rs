//! Value backends exposing local, ancestor and remote state uniformly.
//!
//! Every replica the sync manager touches implements [`TreeValue`]: read the
//! current tree, optionally report a version, and replace the tree. The
//! backends differ only in where the tree lives:
//!
//! - [`LocalFileTree`] -- the working copy on disk.
//! - [`MemoryValue`] -- an in-process tree, for embedding and tests.
//! - [`AncestorStore`] -- the persisted snapshot plus version.
//! - [`RemoteValue`] -- the remote copy, reachable only through a
//!   [`RemoteClient`] pull/push pair.

pub mod ancestor;
pub mod dir_remote;
pub mod local;
pub mod memory;
pub mod remote;

use async_trait::async_trait;

use crate::errors::CoreError;
use crate::tree::FileTree;

pub use ancestor::{AncestorSnapshot, AncestorStore};
pub use dir_remote::DirRemote;
pub use local::{JsonFile, LocalFileTree, SpecialFile};
pub use memory::MemoryValue;
pub use remote::{MemoryRemote, PushRequest, RemoteClient, RemoteSnapshot, RemoteValue};

/// Uniform get/set contract shared by every replica.
#[async_trait]
pub trait TreeValue: Send + Sync {
    /// The current tree. Recomputed from the backing store on every call.
    async fn value(&self) -> Result<FileTree, CoreError>;

    /// Version of the current tree, for backends that track one.
    async fn version(&self) -> Result<Option<u64>, CoreError> {
        Ok(None)
    }

    /// Replace the tree. `Ok(false)` means the backend refused the write
    /// (a remote compare-and-swap rejection); nothing was changed.
    async fn set_value(&mut self, value: &FileTree) -> Result<bool, CoreError>;
}

//! In-process tree value.

use async_trait::async_trait;

use crate::errors::CoreError;
use crate::tree::FileTree;
use crate::value::TreeValue;

/// A tree held in memory. Always accepts writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryValue {
    tree: FileTree,
    writes: usize,
}

impl MemoryValue {
    pub fn new(tree: FileTree) -> Self {
        Self { tree, writes: 0 }
    }

    pub fn tree(&self) -> &FileTree {
        &self.tree
    }

    /// Replace the tree outside of a sync cycle, as a local edit would.
    pub fn edit(&mut self, f: impl FnOnce(&mut FileTree)) {
        f(&mut self.tree);
    }

    /// Number of `set_value` calls that changed the tree.
    pub fn writes(&self) -> usize {
        self.writes
    }
}

#[async_trait]
impl TreeValue for MemoryValue {
    async fn value(&self) -> Result<FileTree, CoreError> {
        Ok(self.tree.clone())
    }

    async fn set_value(&mut self, value: &FileTree) -> Result<bool, CoreError> {
        if self.tree != *value {
            self.tree = value.clone();
            self.writes += 1;
        }
        Ok(true)
    }
}

//! Error types for the treesync core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Value(#[from] ValueError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Merge errors
// ---------------------------------------------------------------------------

/// Errors from the three-way merge subsystem.
#[derive(Debug, Error)]
pub enum MergeError {
    /// Both sides touched a whole file (independent creation or a binary
    /// edit) and no resolve policy was supplied.
    #[error("merge conflict on '{path}': no resolve policy")]
    Conflict { path: String },

    /// A text merge produced an overlapping edit region and no resolve
    /// policy was supplied.
    #[error("text merge conflict on '{path}' at ancestor lines {start}..{end}")]
    TextConflict {
        path: String,
        start: usize,
        end: usize,
    },
}

impl MergeError {
    /// The path the conflict was raised for.
    pub fn path(&self) -> &str {
        match self {
            Self::Conflict { path } | Self::TextConflict { path, .. } => path,
        }
    }
}

// ---------------------------------------------------------------------------
// Value backend errors
// ---------------------------------------------------------------------------

/// Errors from the local tree and ancestor snapshot backends.
#[derive(Debug, Error)]
pub enum ValueError {
    /// A tree key is absolute or escapes the backend root.
    #[error("invalid tree path '{0}'")]
    InvalidPath(String),

    /// Filesystem failure on a specific path.
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted snapshot could not be decoded.
    #[error("corrupt snapshot at '{path}': {detail}")]
    Corrupt { path: PathBuf, detail: String },

    /// JSON encoding failure.
    #[error("snapshot encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Attach a path to an I/O error.
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ValueError {
    ValueError::Io {
        path: path.into(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Remote errors
// ---------------------------------------------------------------------------

/// Errors from the remote value and its client collaborator.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote answered a pull without a usable version.
    #[error("remote value has no version")]
    MissingVersion,

    /// The remote value was used before the first pull.
    #[error("remote value has not been pulled yet")]
    NotPulled,

    /// Failure reported by the network (or storage) collaborator.
    #[error("remote transport error: {0}")]
    Transport(#[from] anyhow::Error),

    /// Failure reading the local copy of a directory-backed remote.
    #[error("remote storage error: {0}")]
    Storage(#[from] ValueError),
}

// ---------------------------------------------------------------------------
// Sync manager errors
// ---------------------------------------------------------------------------

/// Errors from the pull/merge/push cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No ancestor snapshot exists and initialisation was not allowed.
    #[error("no local ancestry: initialise the project before syncing")]
    NoAncestor,

    /// The merge step hit an unresolved conflict. The cycle wrote nothing.
    #[error("sync aborted: {0}")]
    Merge(#[from] MergeError),

    /// Local tree or ancestor snapshot failure.
    #[error("sync local state error: {0}")]
    Value(#[from] ValueError),

    /// Remote pull/push failure.
    #[error("sync remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A replica backend reported a configuration problem.
    #[error("sync configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<CoreError> for SyncError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Merge(e) => Self::Merge(e),
            CoreError::Value(e) => Self::Value(e),
            CoreError::Remote(e) => Self::Remote(e),
            CoreError::Sync(e) => e,
            CoreError::Config(e) => Self::Config(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

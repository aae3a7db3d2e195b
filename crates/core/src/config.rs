//! TOML-based configuration for a treesync project.
//!
//! Relative paths in `[project]` and `[remote]` are resolved against the
//! directory holding the configuration file by
//! [`TreeSyncConfig::load_from_file`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::merge::{MergeEngine, ResolvePolicy};
use crate::path_policy::{MergeStrategy, PathPolicy, DEFAULT_BINARY_SUFFIXES};
use crate::sync_manager::SyncOptions;
use crate::value::LocalFileTree;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSyncConfig {
    /// Working copy settings.
    pub project: ProjectConfig,

    /// Where the shared remote snapshot lives.
    pub remote: RemoteConfig,

    /// Merge behaviour.
    #[serde(default)]
    pub merge: MergeConfig,

    /// Sync cycle behaviour.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Daemon / polling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

// ---------------------------------------------------------------------------
// Project
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Root of the local working copy.
    pub root: PathBuf,

    /// Directory under `root` holding the ancestor snapshot. Always ignored.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Glob patterns excluded from sync.
    #[serde(default)]
    pub ignore: Vec<String>,

    /// Paths synced as canonical JSON documents rather than raw files.
    #[serde(default)]
    pub json_files: Vec<String>,
}

fn default_state_dir() -> String {
    ".treesync".into()
}

// ---------------------------------------------------------------------------
// Remote
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Directory of the shared remote snapshot.
    pub path: PathBuf,
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Tie-break for conflicts. Without one, a conflict aborts the cycle.
    #[serde(default)]
    pub resolve: Option<ResolvePolicy>,

    /// Path pattern or suffix -> merge strategy.
    #[serde(default = "default_strategies")]
    pub strategies: BTreeMap<String, MergeStrategy>,
}

fn default_strategies() -> BTreeMap<String, MergeStrategy> {
    DEFAULT_BINARY_SUFFIXES
        .iter()
        .map(|s| (s.to_string(), MergeStrategy::Binary))
        .collect()
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            resolve: None,
            strategies: default_strategies(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Push local changes during triggered cycles (default true).
    #[serde(default = "default_true")]
    pub push_enabled: bool,

    /// Milliseconds between a cycle and its queued rerun (default 250).
    #[serde(default = "default_delay_between")]
    pub delay_between_ms: u64,

    /// Milliseconds to wait before the first cycle of a burst (default 0).
    #[serde(default)]
    pub delay_before_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_delay_between() -> u64 {
    250
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            push_enabled: true,
            delay_between_ms: default_delay_between(),
            delay_before_ms: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between change checks (default 5).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
        }
    }
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// ---------------------------------------------------------------------------
// Loading and derived settings
// ---------------------------------------------------------------------------

impl TreeSyncConfig {
    /// Load configuration from a TOML file on disk.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut config: TreeSyncConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Make relative `project.root` and `remote.path` relative to `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        if self.project.root.is_relative() {
            self.project.root = base.join(&self.project.root);
        }
        if self.remote.path.is_relative() {
            self.remote.path = base.join(&self.remote.path);
        }
    }

    /// Validate semantic constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let state_dir = &self.project.state_dir;
        if state_dir.is_empty() || state_dir.contains('/') || state_dir.contains('\\') || state_dir == ".." {
            return Err(ConfigError::InvalidValue {
                field: "project.state_dir".into(),
                detail: "must be a single directory name".into(),
            });
        }
        if self.remote.path == self.project.root {
            return Err(ConfigError::InvalidValue {
                field: "remote.path".into(),
                detail: "remote must not be the project root".into(),
            });
        }
        if let Some(pattern) = self.merge.strategies.keys().find(|k| k.is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "merge.strategies".into(),
                detail: format!("empty pattern '{pattern}'"),
            });
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }
        if !LOG_LEVELS.contains(&self.daemon.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "daemon.log_level".into(),
                detail: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one step.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Absolute path of the ancestor state directory.
    pub fn state_path(&self) -> PathBuf {
        self.project.root.join(&self.project.state_dir)
    }

    /// Configured ignore patterns plus the state directory.
    pub fn ignore_patterns(&self) -> Vec<String> {
        let mut patterns = self.project.ignore.clone();
        if !patterns.contains(&self.project.state_dir) {
            patterns.push(self.project.state_dir.clone());
        }
        patterns
    }

    pub fn path_policy(&self) -> PathPolicy {
        PathPolicy::with_strategies(self.ignore_patterns(), &self.merge.strategies)
    }

    /// The working copy with its JSON special paths registered.
    pub fn local_tree(&self) -> Result<LocalFileTree, ConfigError> {
        let mut local = LocalFileTree::new(self.project.root.clone(), self.path_policy());
        for name in &self.project.json_files {
            local
                .add_special_json(name.clone())
                .map_err(|e| ConfigError::InvalidValue {
                    field: "project.json_files".into(),
                    detail: e.to_string(),
                })?;
        }
        Ok(local)
    }

    pub fn merge_engine(&self) -> MergeEngine {
        MergeEngine::new(self.path_policy(), self.merge.resolve)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            push_enabled: self.sync.push_enabled,
            delay_before: Duration::from_millis(self.sync.delay_before_ms),
            delay_between: Duration::from_millis(self.sync.delay_between_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.poll_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[project]
root = "/srv/work"
ignore = ["target/**", "*.log"]
json_files = ["project.json"]

[remote]
path = "/srv/shared"

[merge]
resolve = "remote"

[merge.strategies]
".psd" = "binary"
"docs/**/*.svg" = "text"

[sync]
push_enabled = false
delay_between_ms = 100

[daemon]
poll_interval_secs = 2
log_level = "debug"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: TreeSyncConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.project.root, PathBuf::from("/srv/work"));
        assert_eq!(config.project.state_dir, ".treesync");
        assert_eq!(config.merge.resolve, Some(ResolvePolicy::Remote));
        assert_eq!(config.merge.strategies[".psd"], MergeStrategy::Binary);
        assert!(!config.merge.strategies.contains_key(".png"));
        assert!(!config.sync.push_enabled);
        assert_eq!(config.sync_options().delay_between, Duration::from_millis(100));
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[project]
root = "/srv/work"
[remote]
path = "/srv/shared"
"#;
        let config: TreeSyncConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.merge.resolve, None);
        assert_eq!(config.merge.strategies.len(), 3);
        assert!(config.sync.push_enabled);
        assert_eq!(config.sync.delay_between_ms, 250);
        assert_eq!(config.sync.delay_before_ms, 0);
        assert_eq!(config.daemon.poll_interval_secs, 5);
        assert_eq!(config.daemon.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_state_dir_is_always_ignored() {
        let config: TreeSyncConfig = toml::from_str(sample_toml()).unwrap();
        let policy = config.path_policy();
        assert!(policy.is_ignored(".treesync"));
        assert!(policy.is_ignored("app.log"));
        assert_eq!(policy.strategy_for("art/cover.psd"), MergeStrategy::Binary);
        assert_eq!(config.state_path(), PathBuf::from("/srv/work/.treesync"));
    }

    #[test]
    fn test_local_tree_registers_json_files() {
        let mut config: TreeSyncConfig = toml::from_str(sample_toml()).unwrap();
        let local = config.local_tree().unwrap();
        assert!(local.is_special("project.json"));
        assert!(!local.is_special("other.json"));

        config.project.json_files.push("../escape.json".into());
        assert!(matches!(
            config.local_tree(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "project.json_files"
        ));
    }

    #[test]
    fn test_load_from_file_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("treesync.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(b"[project]\nroot = \"work\"\n[remote]\npath = \"shared\"\n")
            .unwrap();

        let config = TreeSyncConfig::load_and_validate(&path).expect("load failed");
        assert_eq!(config.project.root, dir.path().join("work"));
        assert_eq!(config.remote.path, dir.path().join("shared"));
    }

    #[test]
    fn test_file_not_found() {
        let result = TreeSyncConfig::load_from_file("/nonexistent/treesync.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[project\nroot = 1").unwrap();
        assert!(matches!(
            TreeSyncConfig::load_from_file(&path),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config: TreeSyncConfig = toml::from_str(sample_toml()).unwrap();
        config.project.state_dir = "a/b".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "project.state_dir"
        ));

        let mut config: TreeSyncConfig = toml::from_str(sample_toml()).unwrap();
        config.daemon.log_level = "loud".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "daemon.log_level"
        ));

        let mut config: TreeSyncConfig = toml::from_str(sample_toml()).unwrap();
        config.daemon.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config: TreeSyncConfig = toml::from_str(sample_toml()).unwrap();
        config.remote.path = config.project.root.clone();
        assert!(config.validate().is_err());
    }
}

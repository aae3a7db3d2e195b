//! Per-path policy: ignore patterns and merge strategy selection.
//!
//! Provides [`PathPolicy`] which combines the project's `ignore` globs with a
//! strategy table mapping path patterns to [`MergeStrategy`].
//!
//! # Decision model
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | Path matches an ignore pattern | `Ignored` |
//! | Path matches one or more strategy rules | `Merge(<longest rule>)` |
//! | None of the above | `Merge(default)` (text) |
//!
//! A rule that starts with `.` and contains no `/` or `*` is a suffix rule
//! (`.png` matches `img/logo.png`). Every other rule is a glob matched
//! against the full relative path.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// How a file that exists in all three trees is merged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Line-granular three-way merge.
    #[default]
    Text,
    /// Whole-file replacement decided by hashes.
    Binary,
}

impl std::fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

/// Suffixes merged as binary when no strategy table is configured.
pub const DEFAULT_BINARY_SUFFIXES: &[&str] = &[".jpg", ".png", ".gif"];

// ---------------------------------------------------------------------------
// Decision enum
// ---------------------------------------------------------------------------

/// The outcome of evaluating a path against the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    /// Path matches an ignore pattern; it is invisible to sync.
    Ignored { pattern: String },
    /// Path takes part in sync and merges with this strategy.
    Merge(MergeStrategy),
}

impl PathDecision {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored { .. })
    }

    /// Short human-readable label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ignored { .. } => "ignored",
            Self::Merge(MergeStrategy::Text) => "text",
            Self::Merge(MergeStrategy::Binary) => "binary",
        }
    }
}

// ---------------------------------------------------------------------------
// PathPolicy
// ---------------------------------------------------------------------------

/// Evaluates relative paths against ignore globs and the strategy table.
#[derive(Debug, Clone, Default)]
pub struct PathPolicy {
    ignore_patterns: Vec<String>,
    strategies: Vec<(String, MergeStrategy)>,
}

impl PathPolicy {
    /// Policy with ignore patterns and the default binary suffixes.
    pub fn new(ignore_patterns: Vec<String>) -> Self {
        let strategies = DEFAULT_BINARY_SUFFIXES
            .iter()
            .map(|s| (s.to_string(), MergeStrategy::Binary))
            .collect();
        Self {
            ignore_patterns,
            strategies,
        }
    }

    /// Policy with an explicit strategy table replacing the defaults.
    pub fn with_strategies(
        ignore_patterns: Vec<String>,
        strategies: &BTreeMap<String, MergeStrategy>,
    ) -> Self {
        Self {
            ignore_patterns,
            strategies: strategies
                .iter()
                .map(|(p, s)| (normalize(p), *s))
                .collect(),
        }
    }

    /// Add or replace one strategy rule.
    pub fn set_strategy(&mut self, pattern: impl Into<String>, strategy: MergeStrategy) {
        let pattern = normalize(&pattern.into());
        self.strategies.retain(|(p, _)| *p != pattern);
        self.strategies.push((pattern, strategy));
    }

    /// Evaluate a path relative to the tree root.
    pub fn evaluate(&self, rel_path: &str) -> PathDecision {
        if let Some(pattern) = self.ignored_by(rel_path) {
            return PathDecision::Ignored {
                pattern: pattern.to_string(),
            };
        }
        PathDecision::Merge(self.strategy_for(rel_path))
    }

    /// The first ignore pattern matching `rel_path`, if any.
    pub fn ignored_by(&self, rel_path: &str) -> Option<&str> {
        let path = normalize(rel_path);
        self.ignore_patterns
            .iter()
            .find(|p| glob_match::glob_match(&normalize(p), &path))
            .map(String::as_str)
    }

    pub fn is_ignored(&self, rel_path: &str) -> bool {
        self.ignored_by(rel_path).is_some()
    }

    /// Strategy for a path, ignoring the ignore list. Longest matching rule wins.
    pub fn strategy_for(&self, rel_path: &str) -> MergeStrategy {
        let path = normalize(rel_path);
        let best = self
            .strategies
            .iter()
            .filter(|(pattern, _)| rule_matches(pattern, &path))
            .max_by_key(|(pattern, _)| pattern.len());

        match best {
            Some((pattern, strategy)) => {
                debug!(path = %path, pattern = %pattern, strategy = %strategy, "strategy rule matched");
                *strategy
            }
            None => MergeStrategy::default(),
        }
    }

    pub fn ignore_patterns(&self) -> &[String] {
        &self.ignore_patterns
    }

    pub fn has_constraints(&self) -> bool {
        !self.ignore_patterns.is_empty() || !self.strategies.is_empty()
    }
}

fn is_suffix_rule(pattern: &str) -> bool {
    pattern.starts_with('.') && !pattern.contains('/') && !pattern.contains('*')
}

fn rule_matches(pattern: &str, path: &str) -> bool {
    if is_suffix_rule(pattern) {
        path.ends_with(pattern)
    } else {
        glob_match::glob_match(pattern, path)
    }
}

fn normalize(p: &str) -> String {
    p.replace('\\', "/")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_treat_images_as_binary() {
        let policy = PathPolicy::new(vec![]);
        assert_eq!(policy.evaluate("img/logo.png"), PathDecision::Merge(MergeStrategy::Binary));
        assert_eq!(policy.evaluate("a.gif"), PathDecision::Merge(MergeStrategy::Binary));
        assert_eq!(policy.evaluate("src/main.rs"), PathDecision::Merge(MergeStrategy::Text));
        assert_eq!(policy.evaluate("src/main.rs").label(), "text");
    }

    #[test]
    fn test_ignore_pattern_exact_dir_name() {
        let policy = PathPolicy::new(vec!["node_modules".into(), ".treesync".into()]);
        assert!(policy.is_ignored("node_modules"));
        assert!(policy.is_ignored(".treesync"));
        assert!(!policy.is_ignored("src/node_modules.rs"));
    }

    #[test]
    fn test_ignore_pattern_double_star() {
        let policy = PathPolicy::new(vec!["**/*.js.bundle".into()]);
        let decision = policy.evaluate("public/app/main.js.bundle");
        assert!(matches!(decision, PathDecision::Ignored { ref pattern } if pattern == "**/*.js.bundle"));
        assert!(decision.is_ignored());
        assert_eq!(decision.label(), "ignored");
    }

    #[test]
    fn test_ignore_checked_before_strategy() {
        let policy = PathPolicy::new(vec!["*.png".into()]);
        assert!(policy.evaluate("logo.png").is_ignored());
    }

    #[test]
    fn test_longest_rule_wins() {
        let mut table = BTreeMap::new();
        table.insert(".svg".to_string(), MergeStrategy::Binary);
        table.insert("icons/**/*.svg".to_string(), MergeStrategy::Text);
        let policy = PathPolicy::with_strategies(vec![], &table);
        assert_eq!(policy.strategy_for("art/big.svg"), MergeStrategy::Binary);
        assert_eq!(policy.strategy_for("icons/ui/x.svg"), MergeStrategy::Text);
        assert_eq!(policy.strategy_for("readme.md"), MergeStrategy::Text);
    }

    #[test]
    fn test_backslashes_are_normalised() {
        let mut policy = PathPolicy::new(vec!["build/**".into()]);
        policy.set_strategy("assets/**", MergeStrategy::Binary);
        assert!(policy.is_ignored("build\\out\\x.o"));
        assert_eq!(policy.strategy_for("assets\\font.ttf"), MergeStrategy::Binary);
    }

    #[test]
    fn test_set_strategy_replaces_rule() {
        let mut policy = PathPolicy::new(vec![]);
        policy.set_strategy(".png", MergeStrategy::Text);
        assert_eq!(policy.strategy_for("x.png"), MergeStrategy::Text);
        assert!(policy.has_constraints());
    }
}

//! Store configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default node radius in voxels.
pub const DEFAULT_NODE_RADIUS: f32 = 1.5;

/// Default bound on the undo history.
pub const DEFAULT_UNDO_DEPTH: usize = 50;

/// A comment substring that overrides the node radius.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentRadiusRule {
    pub substring: String,
    pub radius: f32,
}

/// Configuration for a skeleton session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkeletonConfig {
    /// Radius for nodes added without an explicit radius.
    pub default_radius: f32,
    /// How long a guarded call waits for the lock before giving up.
    pub lock_timeout_ms: u64,
    /// Maximum number of undo entries kept.
    pub undo_depth: usize,
    /// Delete trees left empty after nodes migrate out of them.
    pub remove_empty_trees: bool,
    /// Substring rules checked in order; first match wins.
    pub comment_radius_rules: Vec<CommentRadiusRule>,
    /// Whether `comment_radius_rules` are applied when comments are set.
    pub apply_comment_radius: bool,
    /// Experiment name written to saved documents.
    pub experiment: String,
    /// Autosave interval in seconds.
    pub autosave_interval_secs: u64,
}

impl Default for SkeletonConfig {
    fn default() -> Self {
        Self {
            default_radius: DEFAULT_NODE_RADIUS,
            lock_timeout_ms: 250,
            undo_depth: DEFAULT_UNDO_DEPTH,
            remove_empty_trees: true,
            comment_radius_rules: Vec::new(),
            apply_comment_radius: false,
            experiment: String::new(),
            autosave_interval_secs: 30,
        }
    }
}

impl SkeletonConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serialize the configuration to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn autosave_interval(&self) -> Duration {
        Duration::from_secs(self.autosave_interval_secs)
    }

    /// Radius dictated by the comment rules, if any rule matches.
    pub fn radius_for_comment(&self, comment: &str) -> Option<f32> {
        if !self.apply_comment_radius {
            return None;
        }
        self.comment_radius_rules
            .iter()
            .find(|rule| !rule.substring.is_empty() && comment.contains(&rule.substring))
            .map(|rule| rule.radius)
    }
}

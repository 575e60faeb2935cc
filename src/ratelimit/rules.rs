//! Named guard rules for local rate limiting.
//!
//! Guard rules configure the [`FixedWindowLimiter`](super::FixedWindowLimiter)
//! for client-side actions the server does not meter for us, such as
//! reconnect attempts per shard.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ShardgateError};

/// A rate limit rule specifying the limit and time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardRule {
    /// Number of actions allowed per window
    pub requests_per_unit: u64,
    /// The time unit
    pub unit: TimeUnit,
    /// How many units make up one window
    #[serde(default = "default_unit_count")]
    pub unit_count: u32,
}

fn default_unit_count() -> u32 {
    1
}

impl GuardRule {
    /// The window length of this rule.
    pub fn period(&self) -> Duration {
        self.unit.duration() * self.unit_count.max(1)
    }
}

/// Time unit for guard rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A set of guard rules indexed by name.
///
/// Names are case-insensitive: the `config` crate lowercases keys read from
/// files, so every name is stored and looked up in lower case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "HashMap<String, GuardRule>", into = "HashMap<String, GuardRule>")]
pub struct GuardRules {
    rules: HashMap<String, GuardRule>,
}

impl From<HashMap<String, GuardRule>> for GuardRules {
    fn from(rules: HashMap<String, GuardRule>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(name, rule)| (name.to_lowercase(), rule))
                .collect(),
        }
    }
}

impl From<GuardRules> for HashMap<String, GuardRule> {
    fn from(rules: GuardRules) -> Self {
        rules.rules
    }
}

impl GuardRules {
    /// Create an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading guard rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ShardgateError::Config(format!("Failed to parse guard rules: {}", e)))
    }

    /// Add or replace a rule.
    pub fn insert(&mut self, name: impl Into<String>, rule: GuardRule) {
        self.rules.insert(name.into().to_lowercase(), rule);
    }

    /// Get the rule with the given name.
    pub fn get(&self, name: &str) -> Option<&GuardRule> {
        self.rules.get(&name.to_lowercase())
    }

    /// Get the number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

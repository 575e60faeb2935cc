//! Configuration management for Shardgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, ShardgateError};
use crate::ratelimit::bucket::{DEFAULT_LIMIT, DEFAULT_REMAINING};
use crate::ratelimit::GuardRules;

/// Prefix for environment variable overrides, e.g. `SHARDGATE__LIMITER__DEFAULT_LIMIT`.
const ENV_PREFIX: &str = "SHARDGATE";

/// Main configuration for Shardgate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardgateConfig {
    /// Route rate limiter configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Named local guard rules
    #[serde(default)]
    pub guards: GuardRules,
}

/// Route rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Limit assumed for routes the server has not reported on yet
    #[serde(default = "default_limit")]
    pub default_limit: u64,

    /// Permits assumed for routes the server has not reported on yet
    #[serde(default = "default_remaining")]
    pub default_remaining: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_limit: default_limit(),
            default_remaining: default_remaining(),
        }
    }
}

fn default_limit() -> u64 {
    DEFAULT_LIMIT
}

fn default_remaining() -> u64 {
    DEFAULT_REMAINING
}

impl ShardgateConfig {
    /// Load configuration from a file path, with environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_file_with_env_prefix(path, ENV_PREFIX)
    }

    /// Load configuration from a file path, with overrides from environment
    /// variables named `{prefix}__SECTION__KEY`.
    pub fn from_file_with_env_prefix<P: AsRef<Path>>(path: P, prefix: &str) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), env_prefix = prefix, "Loading configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(prefix).separator("__"))
            .build()
            .map_err(|e| ShardgateError::Config(e.to_string()))?;

        let config: ShardgateConfig = settings
            .try_deserialize()
            .map_err(|e| ShardgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ShardgateConfig =
            serde_yaml::from_str(yaml).map_err(|e| ShardgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        // Unseen routes need one permit so their first response can be learned
        if self.limiter.default_remaining == 0 {
            return Err(ShardgateError::Config(
                "default_remaining must be at least 1".to_string(),
            ));
        }
        if self.limiter.default_remaining > self.limiter.default_limit {
            return Err(ShardgateError::Config(format!(
                "default_remaining ({}) exceeds default_limit ({})",
                self.limiter.default_remaining, self.limiter.default_limit
            )));
        }
        Ok(())
    }
}

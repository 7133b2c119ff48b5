// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration related types used by the Cirrus control plane.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub cloud: CloudConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Identity of the remote scope every resource id is addressed under.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudConfig {
    pub subscription_id: String,
    pub resource_group: String,
    /// Compute topology the cluster's nodes live in.
    #[serde(default)]
    pub vm_type: VmType,
    /// Scale set holding the nodes, required when `vm_type` is `scale-set`.
    #[serde(default)]
    pub scale_set_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum VmType {
    #[default]
    Standard,
    ScaleSet,
}

/// Token budgets for the resource client, one per call kind.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    #[serde(default)]
    pub reader: RateLimitConfig,
    #[serde(default)]
    pub writer: RateLimitConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Sustained admissions per second.
    pub qps: f64,
    /// Burst capacity of the bucket.
    pub burst: u32,
    /// Disables rate limiting entirely when false (an "always" limiter).
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig { qps: 10.0, burst: 100, enabled: true }
    }
}

/// Retry budget for controller flushes that hit throttling or conflicts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    /// Total time budget across retries of one flush.
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    30
}

fn default_max_elapsed_secs() -> u64 {
    120
}

impl Config {
    /// Load a `Config` from the given TOML file.
    pub fn from_file<P: AsRef<Utf8Path>>(
        path: P,
    ) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|error| {
            ConfigError::Io { error, path: path.to_owned() }
        })?;
        toml::from_str(&data).map_err(|error| ConfigError::Parse {
            error,
            path: path.to_owned(),
        })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {path}")]
    Io {
        #[source]
        error: std::io::Error,
        path: Utf8PathBuf,
    },
    #[error("Failed to parse config file: {path}")]
    Parse {
        #[source]
        error: toml::de::Error,
        path: Utf8PathBuf,
    },
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config: Config = toml::from_str(
            r#"
            [cloud]
            subscription_id = "sub"
            resource_group = "rg"
            "#,
        )
        .unwrap();
        assert_eq!(config.cloud.vm_type, VmType::Standard);
        assert!(config.rate_limits.reader.enabled);
        assert_eq!(config.retry.max_elapsed_secs, 120);
    }

    #[test]
    fn test_parse_full() {
        let config: Config = toml::from_str(
            r#"
            [cloud]
            subscription_id = "sub"
            resource_group = "rg"
            vm_type = "scale-set"
            scale_set_name = "agents"

            [rate_limits.reader]
            qps = 6.0
            burst = 20

            [rate_limits.writer]
            qps = 2.0
            burst = 10
            enabled = false

            [retry]
            max_elapsed_secs = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.cloud.vm_type, VmType::ScaleSet);
        assert_eq!(config.cloud.scale_set_name.as_deref(), Some("agents"));
        assert!(!config.rate_limits.writer.enabled);
        assert_eq!(config.retry.max_elapsed_secs, 10);
    }
}

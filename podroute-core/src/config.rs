use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub coordination: CoordinationConfig,
    pub discovery: DiscoveryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty disables cross-instance coordination
    pub url: String,
    pub key_prefix: String,
    pub operation_timeout_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            key_prefix: "podroute:".to_string(),
            operation_timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Coordination group shared by every proxy instance of one deployment
    pub group: String,
    pub lease_ttl_seconds: u64,
    pub election_interval_seconds: u64,
    pub identity_ttl_seconds: u64,
    pub identity_renew_interval_seconds: u64,
    pub subscriber_retry_seconds: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            group: String::new(),
            lease_ttl_seconds: 10,
            election_interval_seconds: 3,
            identity_ttl_seconds: 600,
            identity_renew_interval_seconds: 300,
            subscriber_retry_seconds: 3,
        }
    }
}

/// Label keys read from cluster resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelKeys {
    pub server_name: String,
    pub initial_server: String,
    pub strategy: String,
}

impl LabelKeys {
    /// Build the label keys under a common prefix, e.g. `podroute.io`
    #[must_use]
    pub fn with_prefix(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            server_name: format!("{prefix}/server-name"),
            initial_server: format!("{prefix}/initial-server"),
            strategy: format!("{prefix}/load-balancing"),
        }
    }
}

impl Default for LabelKeys {
    fn default() -> Self {
        Self::with_prefix("podroute.io")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Restrict listing to one namespace; all namespaces when unset
    pub namespace: Option<String>,
    pub label_selectors: BTreeMap<String, String>,
    pub labels: LabelKeys,
    pub poll_interval_seconds: u64,
    pub drain_threshold_seconds: u64,
    pub backend_port_name: String,
    pub default_backend_port: u16,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            label_selectors: BTreeMap::new(),
            labels: LabelKeys::default(),
            poll_interval_seconds: 5,
            drain_threshold_seconds: 50,
            backend_port_name: "minecraft".to_string(),
            default_backend_port: 25565,
        }
    }
}

impl DiscoveryConfig {
    /// Selector with keys and values lowercased
    #[must_use]
    pub fn selector(&self) -> BTreeMap<String, String> {
        self.label_selectors
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Whether instances coordinate through a shared store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationMode {
    Replicated,
    /// Single instance assumed; the registry lives only in this process
    Standalone { reason: String },
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // PODROUTE_REDIS__URL, PODROUTE_COORDINATION__GROUP, ...
        builder = builder.add_source(
            Environment::with_prefix("PODROUTE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Decide whether the coordination store can be used
    #[must_use]
    pub fn coordination_mode(&self) -> CoordinationMode {
        if self.redis.url.trim().is_empty() {
            return CoordinationMode::Standalone {
                reason: "redis.url is not set".to_string(),
            };
        }
        if self.coordination.group.trim().is_empty() {
            return CoordinationMode::Standalone {
                reason: "coordination.group is not set".to_string(),
            };
        }
        CoordinationMode::Replicated
    }

    /// Check for settings the coordinator cannot run with
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.discovery.label_selectors.is_empty() {
            errors.push("discovery.label_selectors must contain at least one key=value pair".to_string());
        }
        if self.discovery.poll_interval_seconds == 0 {
            errors.push("discovery.poll_interval_seconds must be positive".to_string());
        }
        if self.discovery.drain_threshold_seconds < 2 {
            errors.push("discovery.drain_threshold_seconds must be at least 2".to_string());
        }
        if self.discovery.backend_port_name.is_empty() {
            errors.push("discovery.backend_port_name must not be empty".to_string());
        }

        let coordination = &self.coordination;
        if coordination.election_interval_seconds == 0 {
            errors.push("coordination.election_interval_seconds must be positive".to_string());
        }
        if coordination.lease_ttl_seconds <= coordination.election_interval_seconds {
            errors.push(format!(
                "coordination.lease_ttl_seconds ({}) must exceed election_interval_seconds ({})",
                coordination.lease_ttl_seconds, coordination.election_interval_seconds
            ));
        }
        if coordination.identity_renew_interval_seconds == 0
            || coordination.identity_ttl_seconds <= coordination.identity_renew_interval_seconds
        {
            errors.push(
                "coordination.identity_ttl_seconds must exceed a positive identity_renew_interval_seconds"
                    .to_string(),
            );
        }
        if coordination.subscriber_retry_seconds == 0 {
            errors.push("coordination.subscriber_retry_seconds must be positive".to_string());
        }

        let url = self.redis.url.trim();
        if !url.is_empty() && !url.starts_with("redis://") && !url.starts_with("rediss://") {
            errors.push(format!("redis.url must use redis:// or rediss://, got {url}"));
        }
        if self.redis.operation_timeout_seconds == 0 {
            errors.push("redis.operation_timeout_seconds must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.discovery.poll_interval_seconds)
    }

    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.coordination.lease_ttl_seconds)
    }
}

//! Cluster configuration.

use crate::DirectoryOptions;
use serde::Deserialize;
use std::time::Duration;

fn default_service_name() -> String {
    "lattice".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(3)
}

/// Cluster configuration, loadable from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    /// Registry service name shared by all members.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Registry backend endpoints. Consumed by whichever registry
    /// implementation the deployment wires in.
    #[serde(default)]
    pub registry_endpoints: Vec<String>,

    /// Dial timeout for peer sessions.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Per-request deadline for peer reads and deletes.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            registry_endpoints: Vec::new(),
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl ClusterConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the registry service name.
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    /// Set the registry backend endpoints.
    pub fn with_registry_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.registry_endpoints = endpoints;
        self
    }

    /// Directory options derived from this config.
    pub fn directory_options(&self) -> DirectoryOptions {
        DirectoryOptions::new()
            .with_service_name(self.service_name.clone())
            .with_connect_timeout(self.connect_timeout)
            .with_request_timeout(self.request_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.service_name, "lattice");
        assert!(config.registry_endpoints.is_empty());
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_from_toml() {
        let config: ClusterConfig = toml::from_str(
            r#"
            service_name = "cache-prod"
            registry_endpoints = ["10.0.0.5:2379", "10.0.0.6:2379"]
            request_timeout = { secs = 1, nanos = 0 }
            "#,
        )
        .unwrap();

        assert_eq!(config.service_name, "cache-prod");
        assert_eq!(config.registry_endpoints.len(), 2);
        assert_eq!(config.request_timeout, Duration::from_secs(1));
        // Unset fields keep their defaults.
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_directory_options_inherit_config() {
        let config = ClusterConfig::new().with_service_name("svc");
        let options = config.directory_options();
        assert_eq!(options.service_name, "svc");
        assert_eq!(options.request_timeout, config.request_timeout);
    }
}

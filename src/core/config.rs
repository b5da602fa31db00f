//! Configuration parsing and validation.
//!
//! Configuration loads from an optional TOML file with CLI flag overrides on
//! top; every field has a default, so a bare `merlin start
//! --store-endpoints …` works without a file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Store backend selector values.
pub const BACKEND_ETCD2: &str = "etcd2";
pub const BACKEND_ETCD3: &str = "etcd3";

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// RPC port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// /health, /alive and /metrics port.
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Storage backend: "etcd2" or "etcd3".
    #[serde(default = "default_store_backend")]
    pub store_backend: String,

    /// Store endpoint URLs.
    #[serde(default)]
    pub store_endpoints: Vec<String>,

    /// Prefix all state is stored under.
    #[serde(default = "default_store_prefix")]
    pub store_prefix: String,

    /// How often to periodically sync kernel IPVS state, in seconds.
    #[serde(default = "default_reconcile_sync_period_seconds")]
    pub reconcile_sync_period_seconds: u64,

    /// When false, run the stub reconciler and never touch the kernel.
    #[serde(default = "default_reconcile")]
    pub reconcile: bool,

    /// Enable debug logs.
    #[serde(default)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            health_port: default_health_port(),
            store_backend: default_store_backend(),
            store_endpoints: Vec::new(),
            store_prefix: default_store_prefix(),
            reconcile_sync_period_seconds: default_reconcile_sync_period_seconds(),
            reconcile: default_reconcile(),
            debug: false,
        }
    }
}

// Default value functions

fn default_port() -> u16 {
    4282
}

fn default_health_port() -> u16 {
    4283
}

fn default_store_backend() -> String {
    BACKEND_ETCD2.to_string()
}

fn default_store_prefix() -> String {
    "/merlin".to_string()
}

fn default_reconcile_sync_period_seconds() -> u64 {
    60
}

fn default_reconcile() -> bool {
    true
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).with_context(|| "failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(health_port) = overrides.health_port {
            self.health_port = health_port;
        }
        if let Some(ref backend) = overrides.store_backend {
            self.store_backend = backend.clone();
        }
        if let Some(ref endpoints) = overrides.store_endpoints {
            self.store_endpoints = endpoints.clone();
        }
        if let Some(ref prefix) = overrides.store_prefix {
            self.store_prefix = prefix.clone();
        }
        if let Some(period) = overrides.reconcile_sync_period_seconds {
            self.reconcile_sync_period_seconds = period;
        }
        if let Some(reconcile) = overrides.reconcile {
            self.reconcile = reconcile;
        }
        if overrides.debug {
            self.debug = true;
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        if self.store_backend != BACKEND_ETCD2 && self.store_backend != BACKEND_ETCD3 {
            anyhow::bail!(
                "store-backend must be '{}' or '{}', got: {}",
                BACKEND_ETCD2,
                BACKEND_ETCD3,
                self.store_backend
            );
        }

        if self.store_endpoints.is_empty()
            || self.store_endpoints.iter().any(|e| e.trim().is_empty())
        {
            anyhow::bail!("store-endpoints requires at least one non-empty URL");
        }

        if !self.store_prefix.starts_with('/') {
            anyhow::bail!("store-prefix must start with '/', got: {}", self.store_prefix);
        }

        if self.reconcile_sync_period_seconds == 0 {
            anyhow::bail!("reconcile-sync-period must be > 0");
        }

        if self.port == self.health_port {
            anyhow::bail!("port and health-port must differ, both are {}", self.port);
        }

        Ok(())
    }

    /// Periodic reconcile interval.
    pub fn sync_period(&self) -> Duration {
        Duration::from_secs(self.reconcile_sync_period_seconds)
    }
}

/// CLI override options layered over a config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub health_port: Option<u16>,
    pub store_backend: Option<String>,
    pub store_endpoints: Option<Vec<String>>,
    pub store_prefix: Option<String>,
    pub reconcile_sync_period_seconds: Option<u64>,
    pub reconcile: Option<bool>,
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overrides_with_endpoints() -> ConfigOverrides {
        ConfigOverrides {
            store_endpoints: Some(vec!["http://127.0.0.1:2379".to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_daemon_contract() {
        let config = Config::default();
        assert_eq!(config.port, 4282);
        assert_eq!(config.health_port, 4283);
        assert_eq!(config.store_backend, "etcd2");
        assert_eq!(config.store_prefix, "/merlin");
        assert_eq!(config.sync_period(), Duration::from_secs(60));
        assert!(config.reconcile);
        assert!(!config.debug);
    }

    #[test]
    fn parse_config_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"
port = 4290
store_backend = "etcd3"
store_endpoints = ["http://etcd:2379"]
reconcile = false
"#,
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.port, 4290);
        assert_eq!(config.store_backend, "etcd3");
        assert!(!config.reconcile);
    }

    #[test]
    fn parse_minimal_toml() {
        let config = Config::from_toml(
            r#"
store_endpoints = ["http://etcd-1:2379", "http://etcd-2:2379"]
store_backend = "etcd3"
"#,
        )
        .unwrap();
        assert_eq!(config.store_backend, "etcd3");
        assert_eq!(config.store_endpoints.len(), 2);
        assert_eq!(config.port, 4282);
    }

    #[test]
    fn unknown_backend_rejected() {
        let result = Config::from_toml(
            r#"
store_backend = "consul"
store_endpoints = ["http://127.0.0.1:8500"]
"#,
        );
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("store-backend"));
    }

    #[test]
    fn endpoints_required() {
        let mut config = Config::default();
        assert!(config.validate().is_err());
        config.store_endpoints = vec!["http://127.0.0.1:2379".to_string()];
        config.validate().unwrap();
    }

    #[test]
    fn zero_period_rejected() {
        let mut config = Config::default();
        config.apply_overrides(&overrides_with_endpoints());
        config.reconcile_sync_period_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn prefix_must_be_rooted() {
        let mut config = Config::default();
        config.apply_overrides(&overrides_with_endpoints());
        config.store_prefix = "merlin".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_win_over_file_values() {
        let mut config = Config::from_toml(
            r#"
port = 5000
store_endpoints = ["http://file:2379"]
"#,
        )
        .unwrap();

        config.apply_overrides(&ConfigOverrides {
            port: Some(6000),
            store_endpoints: Some(vec!["http://flag:2379".to_string()]),
            reconcile: Some(false),
            debug: true,
            ..Default::default()
        });

        assert_eq!(config.port, 6000);
        assert_eq!(config.store_endpoints, vec!["http://flag:2379"]);
        assert!(!config.reconcile);
        assert!(config.debug);
    }
}

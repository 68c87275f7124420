//! Configuration parsing and validation.
//!
//! Trellis configuration is loaded from TOML files with CLI overrides. The
//! listener section carries the mutual-TLS material and gRPC keepalive
//! knobs; the coordinator and member sections describe the clusters being
//! federated.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client-facing gRPC listener.
    pub listener: ListenerConfig,

    /// Coordinator cluster hosting the meta-clock.
    pub coordinator: CoordinatorConfig,

    /// Member clusters holding the data plane.
    #[serde(default)]
    pub members: Vec<MemberConfig>,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Client-facing listener configuration.
///
/// TLS is mutual: the server presents `cert-file`/`key-file` and requires
/// client certificates signed by `ca-file`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:2379").
    pub bind: String,

    /// Trusted CA bundle path.
    #[serde(rename = "ca-file", default)]
    pub ca_file: Option<String>,

    /// Server certificate chain path.
    #[serde(rename = "cert-file", default)]
    pub cert_file: Option<String>,

    /// Server private key path.
    #[serde(rename = "key-file", default)]
    pub key_file: Option<String>,

    /// Max connection idle time, seconds.
    #[serde(rename = "max-idle", default = "default_max_idle")]
    pub max_idle: u64,

    /// Keepalive probe interval, seconds.
    #[serde(rename = "keepalive-interval", default = "default_keepalive_interval")]
    pub keepalive_interval: u64,

    /// Keepalive probe timeout, seconds.
    #[serde(rename = "keepalive-timeout", default = "default_keepalive_timeout")]
    pub keepalive_timeout: u64,
}

impl ListenerConfig {
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout)
    }

    /// True when all three TLS paths are present.
    pub fn tls_enabled(&self) -> bool {
        self.ca_file.is_some() && self.cert_file.is_some() && self.key_file.is_some()
    }
}

/// Coordinator cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// gRPC endpoint of the coordinator cluster.
    pub endpoint: String,
}

/// One member cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConfig {
    /// Stable member name, used in logs and errors.
    pub name: String,

    /// gRPC endpoint of the member cluster.
    pub endpoint: String,

    /// Key prefixes this member owns. An empty-string prefix makes the
    /// member a catch-all for otherwise unowned keys.
    #[serde(default)]
    pub prefixes: Vec<String>,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Watch multiplexer retention window, in events.
    #[serde(default = "default_watch_retention")]
    pub watch_retention: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            watch_retention: default_watch_retention(),
        }
    }
}

fn default_max_idle() -> u64 {
    300
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_keepalive_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_watch_retention() -> usize {
    4096
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints and referenced file paths.
    pub fn validate(&self) -> Result<()> {
        if self.listener.bind.is_empty() {
            anyhow::bail!("listener.bind must not be empty");
        }
        if self.coordinator.endpoint.is_empty() {
            anyhow::bail!("coordinator.endpoint must not be empty");
        }

        let tls_paths = [
            ("ca-file", &self.listener.ca_file),
            ("cert-file", &self.listener.cert_file),
            ("key-file", &self.listener.key_file),
        ];
        let present = tls_paths.iter().filter(|(_, p)| p.is_some()).count();
        if present != 0 && present != tls_paths.len() {
            anyhow::bail!("ca-file, cert-file and key-file must be set together");
        }
        for (name, path) in tls_paths {
            if let Some(path) = path {
                if !Path::new(path).exists() {
                    anyhow::bail!("{} not found: {}", name, path);
                }
            }
        }

        let mut names = std::collections::HashSet::new();
        for member in &self.members {
            if member.name.is_empty() {
                anyhow::bail!("member name must not be empty");
            }
            if member.endpoint.is_empty() {
                anyhow::bail!("member {} endpoint must not be empty", member.name);
            }
            if !names.insert(member.name.as_str()) {
                anyhow::bail!("duplicate member name {}", member.name);
            }
        }

        Ok(())
    }
}

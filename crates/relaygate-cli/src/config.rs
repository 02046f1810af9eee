//! Configuration file for the RelayGate CLI.

use anyhow::Context;
use relaygate_core::{
    GatewayConfig, MAX_BUFFER_SIZE, SupervisionConfig, SwitchFailurePolicy, TunnelConfig,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// RelayGate configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Gateway identity
    #[serde(default)]
    pub node: NodeConfig,
    /// Local socket handling
    #[serde(default)]
    pub tunnel: TunnelSection,
    /// Idle and stale-resource sweeps
    #[serde(default)]
    pub supervision: SupervisionSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name presented to relays, e.g. `gatekeeper.cloudA`
    #[serde(default = "default_node_name")]
    pub name: String,
    /// Private key file path
    #[serde(default = "default_private_key_path")]
    pub private_key_file: PathBuf,
    /// Relay used when a command does not name one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_relay: Option<String>,
}

/// `[tunnel]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSection {
    /// Socket read buffer in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Address consumer-side listeners bind to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Lowest port for consumer-side listeners
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_port: Option<u16>,
    /// Highest port for consumer-side listeners
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_port: Option<u16>,
    /// Seconds a consumer-side listener waits for its client
    #[serde(default = "default_accept_timeout")]
    pub accept_timeout_secs: u64,
    /// Seconds allowed for reaching the real provider
    #[serde(default = "default_connect_timeout")]
    pub provider_connect_timeout_secs: u64,
}

/// `[supervision]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionSection {
    /// Sweep period in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,
    /// Idle seconds before a consumer-side session is interrupted
    #[serde(default = "default_idle_timeout")]
    pub consumer_idle_timeout_secs: u64,
    /// `close` or `keep` when an incoming relay switch fails
    #[serde(default)]
    pub switch_failure_policy: SwitchFailurePolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_node_name() -> String {
    "relaygate.local".to_string()
}

fn default_private_key_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".relaygate")
        .join("identity.key")
}

fn default_buffer_size() -> usize {
    TunnelConfig::default().buffer_size
}

fn default_bind_host() -> String {
    TunnelConfig::default().bind_host.to_string()
}

fn default_accept_timeout() -> u64 {
    TunnelConfig::default().accept_timeout.as_secs()
}

fn default_connect_timeout() -> u64 {
    TunnelConfig::default().provider_connect_timeout.as_secs()
}

fn default_interval() -> u64 {
    SupervisionConfig::default().interval.as_secs()
}

fn default_idle_timeout() -> u64 {
    SupervisionConfig::default().consumer_idle_timeout.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            private_key_file: default_private_key_path(),
            default_relay: None,
        }
    }
}

impl Default for TunnelSection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            bind_host: default_bind_host(),
            min_port: None,
            max_port: None,
            accept_timeout_secs: default_accept_timeout(),
            provider_connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for SupervisionSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            consumer_idle_timeout_secs: default_idle_timeout(),
            switch_failure_policy: SwitchFailurePolicy::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Read a TOML config file. Missing sections take their defaults.
    ///
    /// # Errors
    ///
    /// Fails if the file is unreadable or not valid TOML for [`Config`].
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Write the config as TOML, creating parent directories.
    ///
    /// # Errors
    ///
    /// Fails if the directory or file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        fs::write(path, toml::to_string_pretty(self)?)
            .with_context(|| format!("writing config {}", path.display()))
    }

    /// `<config dir>/relaygate/config.toml`
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("relaygate")
            .join("config.toml")
    }

    /// Config from [`Config::default_path`], written out with defaults on
    /// first use.
    ///
    /// # Errors
    ///
    /// Fails if an existing file cannot be loaded or a new one cannot be saved.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            return Self::load(&path);
        }
        let config = Self::default();
        config.save(&path)?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.name.trim().is_empty() {
            anyhow::bail!("Node name must not be empty");
        }

        if let Some(relay) = &self.node.default_relay {
            relay
                .parse::<relaygate_relay::RelayDescriptor>()
                .map_err(|e| anyhow::anyhow!("Default relay '{}': {}", relay, e))?;
        }

        if self.tunnel.buffer_size == 0 || self.tunnel.buffer_size > MAX_BUFFER_SIZE {
            anyhow::bail!("Buffer size must be between 1 and {} bytes", MAX_BUFFER_SIZE);
        }

        self.tunnel
            .bind_host
            .parse::<IpAddr>()
            .map_err(|_| anyhow::anyhow!("Invalid bind host: {}", self.tunnel.bind_host))?;

        match (self.tunnel.min_port, self.tunnel.max_port) {
            (None, None) => {}
            (Some(min), Some(max)) => {
                if min == 0 || min > max {
                    anyhow::bail!("Invalid port range: {}-{}", min, max);
                }
            }
            _ => anyhow::bail!("min_port and max_port must be set together"),
        }

        if self.tunnel.accept_timeout_secs == 0 || self.tunnel.provider_connect_timeout_secs == 0 {
            anyhow::bail!("Tunnel timeouts must be at least 1 second");
        }

        if self.supervision.interval_secs == 0 {
            anyhow::bail!("Supervision interval must be at least 1 second");
        }

        if self.supervision.consumer_idle_timeout_secs < self.supervision.interval_secs {
            anyhow::bail!(
                "Consumer idle timeout ({}s) must not be shorter than the supervision interval ({}s)",
                self.supervision.consumer_idle_timeout_secs,
                self.supervision.interval_secs
            );
        }

        self.logging
            .level
            .parse::<tracing::Level>()
            .map_err(|_| anyhow::anyhow!("Invalid log level: {}", self.logging.level))?;

        Ok(())
    }

    /// Build the gateway configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the bind host cannot be parsed.
    pub fn gateway_config(&self) -> anyhow::Result<GatewayConfig> {
        let bind_host = self
            .tunnel
            .bind_host
            .parse::<IpAddr>()
            .map_err(|_| anyhow::anyhow!("Invalid bind host: {}", self.tunnel.bind_host))?;

        Ok(GatewayConfig {
            tunnel: TunnelConfig {
                buffer_size: self.tunnel.buffer_size,
                bind_host,
                port_range: self.tunnel.min_port.zip(self.tunnel.max_port),
                accept_timeout: Duration::from_secs(self.tunnel.accept_timeout_secs),
                provider_connect_timeout: Duration::from_secs(
                    self.tunnel.provider_connect_timeout_secs,
                ),
            },
            supervision: SupervisionConfig {
                interval: Duration::from_secs(self.supervision.interval_secs),
                consumer_idle_timeout: Duration::from_secs(
                    self.supervision.consumer_idle_timeout_secs,
                ),
                switch_failure_policy: self.supervision.switch_failure_policy,
            },
            ..GatewayConfig::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.name, "relaygate.local");
        assert_eq!(config.tunnel.buffer_size, 16 * 1024);
        assert_eq!(config.tunnel.bind_host, "127.0.0.1");
        assert_eq!(config.supervision.interval_secs, 30);
        assert_eq!(config.supervision.consumer_idle_timeout_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.tunnel.buffer_size = 0;
        assert!(config.validate().is_err());
        config.tunnel.buffer_size = 4096;

        config.tunnel.min_port = Some(40_000);
        assert!(config.validate().is_err());
        config.tunnel.max_port = Some(39_000);
        assert!(config.validate().is_err());
        config.tunnel.max_port = Some(40_100);
        assert!(config.validate().is_ok());

        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.node.default_relay = Some("no-port".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_gateway_config_conversion() {
        let mut config = Config::default();
        config.tunnel.min_port = Some(41_000);
        config.tunnel.max_port = Some(41_009);
        config.supervision.interval_secs = 5;
        config.supervision.consumer_idle_timeout_secs = 20;
        config.supervision.switch_failure_policy = SwitchFailurePolicy::Keep;

        let gateway = config.gateway_config().unwrap();
        assert_eq!(gateway.tunnel.port_range, Some((41_000, 41_009)));
        assert_eq!(gateway.supervision.provider_idle_timeout(), Duration::from_secs(25));
        assert_eq!(gateway.supervision.switch_failure_policy, SwitchFailurePolicy::Keep);
        assert!(gateway.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [node]
            name = "gatekeeper.cloudA"

            [supervision]
            switch_failure_policy = "keep"
            "#,
        )
        .unwrap();

        assert_eq!(config.node.name, "gatekeeper.cloudA");
        assert_eq!(config.supervision.interval_secs, 30);
        assert_eq!(config.supervision.switch_failure_policy, SwitchFailurePolicy::Keep);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.node.default_relay = Some("relay.example:61617".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.node.default_relay, config.node.default_relay);
        assert_eq!(loaded.tunnel.accept_timeout_secs, config.tunnel.accept_timeout_secs);
    }
}

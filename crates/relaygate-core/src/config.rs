//! Gateway configuration

use crate::error::{GatewayError, Result};
use relaygate_relay::RemoteBrokerConfig;
use relaygate_relay::queues::MAX_DELIVERY_WINDOW;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Largest socket read forwarded as one relay message
pub const MAX_BUFFER_SIZE: usize = 512 * 1024;

/// Gateway configuration
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Socket bridging
    pub tunnel: TunnelConfig,

    /// Idle and stale-resource sweeps
    pub supervision: SupervisionConfig,

    /// Broker client
    pub relay: RelayClientConfig,
}

impl GatewayConfig {
    /// Check every section.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::InvalidConfig`] naming the first bad value.
    pub fn validate(&self) -> Result<()> {
        self.tunnel.validate()?;
        self.supervision.validate()?;
        self.relay.validate()
    }
}

/// Socket bridging configuration
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Socket read buffer, and so the largest payload per relay message
    pub buffer_size: usize,

    /// Address consumer-side listeners bind to
    pub bind_host: IpAddr,

    /// Inclusive port range for consumer-side listeners; any free port if unset
    pub port_range: Option<(u16, u16)>,

    /// How long a consumer-side listener waits for its one connection
    pub accept_timeout: Duration,

    /// Timeout for reaching the real provider
    pub provider_connect_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            buffer_size: 16 * 1024,
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_range: None,
            accept_timeout: Duration::from_secs(60),
            provider_connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TunnelConfig {
    fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 || self.buffer_size > MAX_BUFFER_SIZE {
            return Err(GatewayError::InvalidConfig(Cow::Owned(format!(
                "buffer_size must be between 1 and {MAX_BUFFER_SIZE}, got {}",
                self.buffer_size
            ))));
        }
        if let Some((min, max)) = self.port_range {
            if min == 0 || min > max {
                return Err(GatewayError::InvalidConfig(Cow::Owned(format!(
                    "port range {min}-{max} is empty or starts at 0"
                ))));
            }
        }
        if self.accept_timeout.is_zero() {
            return Err(GatewayError::invalid_config("accept_timeout must be positive"));
        }
        if self.provider_connect_timeout.is_zero() {
            return Err(GatewayError::invalid_config(
                "provider_connect_timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// What a worker does when an incoming SWITCH cannot be honored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchFailurePolicy {
    /// Tear the session down
    #[default]
    Close,
    /// Keep the session on its current relay
    Keep,
}

/// Supervision configuration
#[derive(Debug, Clone)]
pub struct SupervisionConfig {
    /// Period of both supervision tasks, and the grace given to fresh
    /// quadruples and bindings
    pub interval: Duration,

    /// Consumer-side sessions idle longer than this are interrupted.
    /// Provider-side sessions get one extra `interval`.
    pub consumer_idle_timeout: Duration,

    /// Reaction to a rejected SWITCH
    pub switch_failure_policy: SwitchFailurePolicy,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            consumer_idle_timeout: Duration::from_secs(300), // 5 minutes
            switch_failure_policy: SwitchFailurePolicy::Close,
        }
    }
}

impl SupervisionConfig {
    /// Idle time after which provider-side sessions are closed
    #[must_use]
    pub fn provider_idle_timeout(&self) -> Duration {
        self.consumer_idle_timeout + self.interval
    }

    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(GatewayError::invalid_config("supervision interval must be positive"));
        }
        if self.consumer_idle_timeout.is_zero() {
            return Err(GatewayError::invalid_config(
                "consumer_idle_timeout must be positive",
            ));
        }
        Ok(())
    }
}

/// Broker client configuration
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Timeout for opening a broker connection
    pub connect_timeout: Duration,

    /// Timeout for one broker request
    pub request_timeout: Duration,

    /// Keepalive period on idle broker connections
    pub keepalive_interval: Duration,

    /// Unsettled relay deliveries per subscription
    pub delivery_window: u32,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        let broker = RemoteBrokerConfig::default();
        Self {
            connect_timeout: broker.connect_timeout,
            request_timeout: broker.request_timeout,
            keepalive_interval: broker.keepalive_interval,
            delivery_window: broker.delivery_window,
        }
    }
}

impl RelayClientConfig {
    /// Broker client settings
    #[must_use]
    pub fn broker_config(&self) -> RemoteBrokerConfig {
        RemoteBrokerConfig {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            keepalive_interval: self.keepalive_interval,
            delivery_window: self.delivery_window,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() || self.request_timeout.is_zero() {
            return Err(GatewayError::invalid_config("relay timeouts must be positive"));
        }
        if self.keepalive_interval.is_zero() {
            return Err(GatewayError::invalid_config(
                "relay keepalive_interval must be positive",
            ));
        }
        if self.delivery_window == 0 || self.delivery_window > MAX_DELIVERY_WINDOW {
            return Err(GatewayError::InvalidConfig(Cow::Owned(format!(
                "relay delivery_window must be between 1 and {MAX_DELIVERY_WINDOW}, got {}",
                self.delivery_window
            ))));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = GatewayConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.supervision.provider_idle_timeout(),
            Duration::from_secs(330)
        );
        assert_eq!(
            config.supervision.switch_failure_policy,
            SwitchFailurePolicy::Close
        );
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = GatewayConfig::default();
        config.tunnel.buffer_size = 0;
        assert!(matches!(config.validate(), Err(GatewayError::InvalidConfig(_))));

        let mut config = GatewayConfig::default();
        config.tunnel.port_range = Some((9000, 8000));
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.tunnel.port_range = Some((0, 10));
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.supervision.interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.relay.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_single_port_range_valid() {
        let mut config = GatewayConfig::default();
        config.tunnel.port_range = Some((40000, 40000));
        config.validate().unwrap();
    }

    #[test]
    fn test_broker_config_carries_timeouts() {
        let relay = RelayClientConfig {
            connect_timeout: Duration::from_secs(3),
            request_timeout: Duration::from_secs(4),
            keepalive_interval: Duration::from_secs(5),
            delivery_window: 32,
        };
        let broker = relay.broker_config();
        assert_eq!(broker.connect_timeout, Duration::from_secs(3));
        assert_eq!(broker.request_timeout, Duration::from_secs(4));
        assert_eq!(broker.keepalive_interval, Duration::from_secs(5));
        assert_eq!(broker.delivery_window, 32);
    }

    #[test]
    fn test_delivery_window_bounds() {
        let mut config = GatewayConfig::default();
        config.relay.delivery_window = 0;
        assert!(config.validate().is_err());
        config.relay.delivery_window = MAX_DELIVERY_WINDOW + 1;
        assert!(config.validate().is_err());
        config.relay.delivery_window = MAX_DELIVERY_WINDOW;
        config.validate().unwrap();
    }
}

//! Consumer-side listeners.
//!
//! Each consumer-side session gets its own listener that accepts exactly
//! one connection. With a configured port range, ports are handed out
//! round-robin and a port that fails to bind is skipped.

use crate::config::TunnelConfig;
use crate::error::{GatewayError, Result};
use relaygate_relay::RelayError;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

/// Hands out listeners inside the configured port range
#[derive(Debug)]
pub struct PortAllocator {
    range: Option<(u16, u16)>,
    next: AtomicU32,
}

impl PortAllocator {
    /// Allocator over `range`, or over ephemeral ports when `None`
    #[must_use]
    pub fn new(range: Option<(u16, u16)>) -> Self {
        Self {
            range,
            next: AtomicU32::new(0),
        }
    }

    /// Bind a listener on `config.bind_host`.
    ///
    /// # Errors
    ///
    /// Returns a transport error if no port of the range can be bound.
    pub async fn bind(&self, config: &TunnelConfig) -> Result<TcpListener> {
        let Some((min, max)) = self.range else {
            return Ok(TcpListener::bind(SocketAddr::new(config.bind_host, 0)).await?);
        };

        let total = u32::from(max - min) + 1;
        for _ in 0..total {
            let offset = self.next.fetch_add(1, Ordering::Relaxed) % total;
            let Ok(port) = u16::try_from(u32::from(min) + offset) else {
                continue;
            };
            match TcpListener::bind(SocketAddr::new(config.bind_host, port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) => debug!(port, error = %e, "Port unavailable, trying next"),
            }
        }
        Err(RelayError::transport(format!("no free local port in range {min}-{max}")).into())
    }
}

/// Accept the single connection a consumer-side listener serves
///
/// # Errors
///
/// Returns [`GatewayError::Io`] if nobody connects within `timeout` or the
/// accept fails.
pub async fn accept_one(listener: TcpListener, timeout: Duration) -> Result<(TcpStream, SocketAddr)> {
    match tokio::time::timeout(timeout, listener.accept()).await {
        Ok(accepted) => Ok(accepted?),
        Err(_) => Err(GatewayError::io("no local client connected before the accept timeout")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaygate_relay::ErrorKind;

    #[tokio::test]
    async fn test_ephemeral_port() {
        let listener = PortAllocator::new(None)
            .bind(&TunnelConfig::default())
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_range_skips_taken_port() {
        let config = TunnelConfig::default();
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let allocator = PortAllocator::new(Some((port, port)));
        let err = allocator.bind(&config).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        drop(taken);
        let listener = allocator.bind(&config).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().port(), port);
    }

    #[tokio::test]
    async fn test_accept_timeout() {
        let listener = PortAllocator::new(None)
            .bind(&TunnelConfig::default())
            .await
            .unwrap();
        let err = accept_one(listener, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Io(_)));
    }

    #[tokio::test]
    async fn test_accept_one() {
        let listener = PortAllocator::new(None)
            .bind(&TunnelConfig::default())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });

        let (_stream, peer) = accept_one(listener, Duration::from_secs(5)).await.unwrap();
        let client = client.await.unwrap();
        assert_eq!(peer, client.local_addr().unwrap());
    }
}

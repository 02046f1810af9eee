//! Supervision and administrative close over a TCP relay.
//!
//! These tests run the real supervision tasks with a one-second interval.

use relaygate_core::{GatewayConfig, SessionSide, SupervisionConfig};
use relaygate_integration_tests::fixtures::{TwoGatewayFixture, wait_until};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

const WAIT: Duration = Duration::from_secs(15);

fn fast_supervision(idle_secs: u64) -> GatewayConfig {
    GatewayConfig {
        supervision: SupervisionConfig {
            interval: Duration::from_secs(1),
            consumer_idle_timeout: Duration::from_secs(idle_secs),
            ..SupervisionConfig::default()
        },
        ..GatewayConfig::default()
    }
}

/// An idle tunnel is torn down on both sides and its client socket closes.
#[tokio::test]
async fn test_idle_tunnel_closed_by_sweep() {
    let fixture = TwoGatewayFixture::with_config(fast_supervision(1))
        .await
        .unwrap();
    fixture.provider.start_supervision();
    fixture.consumer.start_supervision();
    let mut tunnel = fixture.open_tunnel().await.unwrap();

    let mut received = Vec::new();
    tokio::time::timeout(WAIT, tunnel.client.read_to_end(&mut received))
        .await
        .expect("idle client socket stayed open")
        .unwrap();
    assert!(received.is_empty());

    let (provider, consumer) = (&fixture.provider, &fixture.consumer);
    assert!(
        wait_until(WAIT, || {
            provider.list_sessions().is_empty() && consumer.list_sessions().is_empty()
        })
        .await
    );
    assert_eq!(consumer.stats().sessions_closed, 1);
    fixture.cleanup().await;
}

/// Bindings left without sessions are closed by relay supervision.
#[tokio::test]
async fn test_empty_binding_reclaimed() {
    let fixture = TwoGatewayFixture::with_config(fast_supervision(1))
        .await
        .unwrap();
    fixture.consumer.start_supervision();
    let tunnel = fixture.open_tunnel().await.unwrap();
    assert_eq!(fixture.consumer.stats().relay_bindings, 1);

    let results = fixture
        .consumer
        .close_sessions(&[tunnel.consumed.session.clone()])
        .await;
    assert!(results[0].1.is_ok());

    let consumer = &fixture.consumer;
    assert!(wait_until(WAIT, || consumer.stats().relay_bindings == 0).await);
    fixture.cleanup().await;
}

/// Steady traffic keeps a tunnel alive past the idle timeout.
#[tokio::test]
async fn test_active_tunnel_survives_sweep() {
    let fixture = TwoGatewayFixture::with_config(fast_supervision(2))
        .await
        .unwrap();
    fixture.provider.start_supervision();
    fixture.consumer.start_supervision();
    let mut tunnel = fixture.open_tunnel().await.unwrap();

    let mut buf = [0u8; 1];
    for _ in 0..15 {
        tunnel.client.write_all(b"k").await.unwrap();
        tokio::time::timeout(WAIT, tunnel.provider_socket.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        tunnel.provider_socket.write_all(b"a").await.unwrap();
        tokio::time::timeout(WAIT, tunnel.client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
    }

    let consumer_worker = fixture
        .consumer
        .worker(SessionSide::Consumer, &tunnel.consumed.session)
        .unwrap();
    assert!(!consumer_worker.is_interrupted());
    assert!(consumer_worker.state().is_open());
    fixture.cleanup().await;
}

/// A CLOSE sent from outside the session's gateways ends the provider side.
#[tokio::test]
async fn test_close_via_control_relay() {
    let fixture = TwoGatewayFixture::new().await.unwrap();
    let mut tunnel = fixture.open_tunnel().await.unwrap();

    fixture
        .consumer
        .close_via_control_relay(
            &fixture.relay,
            &tunnel.provided.session,
            &fixture.provider.public_key(),
        )
        .await
        .unwrap();

    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(WAIT, tunnel.provider_socket.read(&mut buf))
        .await
        .expect("provider socket stayed open")
        .unwrap_or(0);
    assert_eq!(n, 0);

    let provider = &fixture.provider;
    assert!(wait_until(WAIT, || provider.list_sessions().is_empty()).await);
    fixture.cleanup().await;
}

//! Supervision tasks.
//!
//! Two periodic jobs share the registry with the workers but never touch a
//! socket or a relay handle of a running session. They only signal:
//!
//! - **connection removal**: consumer-side sessions idle past
//!   `consumer_idle_timeout` are interrupted (drain, then stop); provider-side
//!   sessions idle past `consumer_idle_timeout + interval` are closed at once
//! - **relay supervision**: quadruples no registered worker owns are
//!   destroyed, and bindings left empty are closed and forgotten

use crate::config::SupervisionConfig;
use crate::model::{SessionSide, now_ms};
use crate::registry::SessionRegistry;
use relaygate_relay::{RelayDescriptor, SessionId, StaleSweep};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Sessions signalled by one idle sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Consumer-side sessions asked to drain and stop
    pub interrupted: Vec<SessionId>,
    /// Provider-side sessions asked to stop now
    pub closed: Vec<SessionId>,
}

impl SweepReport {
    /// Returns true if nothing was signalled
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interrupted.is_empty() && self.closed.is_empty()
    }
}

/// Signal every session idle past its threshold at `now_ms`.
pub fn sweep_idle_sessions(
    registry: &SessionRegistry,
    config: &SupervisionConfig,
    now_ms: u64,
) -> SweepReport {
    let mut report = SweepReport::default();

    for handle in registry.handles(SessionSide::Consumer) {
        if handle.is_interrupted() || handle.state().is_terminating() {
            continue;
        }
        if handle.idle_for(now_ms) > config.consumer_idle_timeout {
            handle.interrupt();
            report.interrupted.push(handle.session().clone());
        }
    }

    let provider_timeout = config.provider_idle_timeout();
    for handle in registry.handles(SessionSide::Provider) {
        if handle.is_close_requested() || handle.state().is_terminating() {
            continue;
        }
        if handle.idle_for(now_ms) > provider_timeout {
            handle.close();
            report.closed.push(handle.session().clone());
        }
    }

    report
}

/// Reclaim stale quadruples and empty bindings.
///
/// Quadruples and bindings younger than `grace` are left alone.
pub async fn sweep_relays(
    registry: &SessionRegistry,
    grace: Duration,
) -> Vec<(RelayDescriptor, StaleSweep)> {
    let live = registry.live_sessions();
    let mut results = Vec::new();

    for binding in registry.bindings() {
        let sweep = binding
            .destroy_stale_queues_and_connections(&live, grace)
            .await;
        if sweep.binding_closed || !binding.is_open() {
            registry.remove_binding(&binding);
            debug!(relay = %binding.relay(), "Relay binding removed");
        }
        results.push((binding.relay().clone(), sweep));
    }
    results
}

/// Running supervision tasks
#[derive(Debug)]
pub struct Supervisor {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Start both supervision tasks on the current runtime
    #[must_use]
    pub fn spawn(registry: Arc<SessionRegistry>, config: SupervisionConfig) -> Self {
        let cancel = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(connection_removal_task(
                registry.clone(),
                config.clone(),
                cancel.child_token(),
            )),
            tokio::spawn(relay_supervision_task(
                registry,
                config.interval,
                cancel.child_token(),
            )),
        ];
        info!(interval = ?config.interval, "Supervision started");
        Self { cancel, tasks }
    }

    /// Stop both tasks and wait for them
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        debug!("Supervision stopped");
    }
}

fn ticker(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn connection_removal_task(
    registry: Arc<SessionRegistry>,
    config: SupervisionConfig,
    cancel: CancellationToken,
) {
    let mut ticker = ticker(config.interval);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let report = sweep_idle_sessions(&registry, &config, now_ms());
                if !report.is_empty() {
                    info!(
                        interrupted = report.interrupted.len(),
                        closed = report.closed.len(),
                        "Idle sessions signalled"
                    );
                }
            }
        }
    }
}

async fn relay_supervision_task(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = ticker(interval);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                sweep_relays(&registry, interval).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::WorkerHandle;
    use crate::handle::tests::record;
    use relaygate_relay::{MemoryConnector, Producer, RelayBinding};

    fn config() -> SupervisionConfig {
        SupervisionConfig {
            interval: Duration::from_secs(5),
            consumer_idle_timeout: Duration::from_secs(60),
            ..SupervisionConfig::default()
        }
    }

    fn register(registry: &SessionRegistry, side: SessionSide, queue_id: &str) -> Arc<WorkerHandle> {
        let handle = Arc::new(WorkerHandle::new(record(side, queue_id)).0);
        registry.register(handle.clone()).unwrap();
        handle
    }

    #[test]
    fn test_stale_consumer_interrupted_fresh_untouched() {
        let registry = SessionRegistry::new();
        let stale = register(&registry, SessionSide::Consumer, "stale");
        let fresh = register(&registry, SessionSide::Consumer, "fresh");
        let now = stale.last_interaction_ms() + 61_000;
        fresh.touch_at(now - 1_000);

        let report = sweep_idle_sessions(&registry, &config(), now);

        assert_eq!(report.interrupted, vec![stale.session().clone()]);
        assert!(stale.is_interrupted());
        assert!(!stale.is_close_requested());
        assert!(!fresh.is_interrupted());
    }

    #[test]
    fn test_provider_gets_extra_interval() {
        let registry = SessionRegistry::new();
        let provider = register(&registry, SessionSide::Provider, "p");
        let start = provider.last_interaction_ms();

        let report = sweep_idle_sessions(&registry, &config(), start + 61_000);
        assert!(report.is_empty());
        assert!(!provider.is_close_requested());

        let report = sweep_idle_sessions(&registry, &config(), start + 66_000);
        assert_eq!(report.closed, vec![provider.session().clone()]);
        assert!(provider.is_close_requested());
        assert!(!provider.is_interrupted());
    }

    #[test]
    fn test_already_signalled_not_reported_twice() {
        let registry = SessionRegistry::new();
        let consumer = register(&registry, SessionSide::Consumer, "c");
        let now = consumer.last_interaction_ms() + 120_000;

        assert_eq!(sweep_idle_sessions(&registry, &config(), now).interrupted.len(), 1);
        assert!(sweep_idle_sessions(&registry, &config(), now).is_empty());
    }

    #[tokio::test]
    async fn test_relay_sweep_spares_registered_sessions() {
        let registry = SessionRegistry::new();
        let connector = MemoryConnector::new();
        let relay = RelayDescriptor::new("relay", 61617);
        let binding = registry.insert_binding(
            RelayBinding::connect(&connector, &relay, "gatekeeper.cloudA")
                .await
                .unwrap(),
        );
        let table = connector.table(&relay);

        let live = register(&registry, SessionSide::Provider, "live");
        let orphan = SessionId::new("gatekeeper.cloudA", "orphan").unwrap();
        for session in [live.session(), &orphan] {
            let broker = binding.broker().unwrap();
            for queue in session.queues().names() {
                Producer::open(broker.clone(), queue).await.unwrap();
            }
            binding.track(session);
        }

        let results = sweep_relays(&registry, Duration::ZERO).await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.destroyed, vec![orphan.clone()]);
        assert!(table.contains(&live.session().queues().request));
        assert!(!table.contains(&orphan.queues().request));
        assert!(registry.binding(&relay).is_some());
    }

    #[tokio::test]
    async fn test_empty_binding_removed() {
        let registry = SessionRegistry::new();
        let connector = MemoryConnector::new();
        let relay = RelayDescriptor::new("relay", 61617);
        registry.insert_binding(
            RelayBinding::connect(&connector, &relay, "gatekeeper.cloudA")
                .await
                .unwrap(),
        );

        let results = sweep_relays(&registry, Duration::ZERO).await;

        assert!(results[0].1.binding_closed);
        assert!(registry.bindings().is_empty());
    }

    #[tokio::test]
    async fn test_supervisor_shutdown() {
        let registry = Arc::new(SessionRegistry::new());
        let supervisor = Supervisor::spawn(registry, config());
        tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .unwrap();
    }
}

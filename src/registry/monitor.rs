//! Periodic health sweep over every registered worker.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::ServiceRegistry;

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSweep {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Results dropped because the record changed while being probed.
    pub stale: usize,
}

pub struct HealthMonitor {
    registry: Arc<ServiceRegistry>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<ServiceRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Probe all registered workers concurrently, then record each result.
    ///
    /// Probes run without the registry lock, so a result is only applied if
    /// the record still matches the snapshot it was probed from. A failed
    /// persist is logged and the sweep carries on.
    pub async fn run_once(&self) -> HealthSweep {
        let records = self.registry.all().await;
        let probes = records.iter().map(|r| async move {
            let healthy = self.registry.probe.probe(&r.host, r.port).await;
            (r, healthy)
        });
        let results = join_all(probes).await;

        let mut sweep = HealthSweep::default();
        for (snapshot, healthy) in results {
            sweep.checked += 1;
            if healthy {
                sweep.healthy += 1;
            } else {
                sweep.unhealthy += 1;
            }
            match self.registry.record_probe_for(snapshot, healthy).await {
                Ok(Some(_)) => {}
                Ok(None) => sweep.stale += 1,
                Err(e) => {
                    error!(service = %snapshot.name, error = %e, "Failed to record health result")
                }
            }
        }

        debug!(
            checked = sweep.checked,
            healthy = sweep.healthy,
            unhealthy = sweep.unhealthy,
            stale = sweep.stale,
            "Health sweep done"
        );
        sweep
    }

    /// Sweep on a fixed interval until `shutdown` flips to true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            info!(interval_secs = self.interval.as_secs(), "Health monitor started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Health monitor stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HealthProbe, MockHealthProbe};
    use crate::storage::tests::temp_store;
    use crate::types::ServiceStatus;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    async fn registry_with(healthy_ports: &'static [u16]) -> (Arc<ServiceRegistry>, tempfile::TempDir) {
        let (store, dir) = temp_store().await;
        let mut probe = MockHealthProbe::new();
        probe
            .expect_probe()
            .returning(move |_, port| healthy_ports.contains(&port));
        let registry = ServiceRegistry::load(store, Arc::new(probe), "localhost")
            .await
            .unwrap();
        (Arc::new(registry), dir)
    }

    #[tokio::test]
    async fn test_sweep_marks_dead_workers_inactive() {
        let (registry, _dir) = registry_with(&[5001]).await;
        registry.register("scanner", None, 5001).await.unwrap();
        registry.register("pattern", None, 5002).await.unwrap();

        let monitor = HealthMonitor::new(registry.clone(), Duration::from_secs(60));
        let sweep = monitor.run_once().await;

        assert_eq!(
            sweep,
            HealthSweep {
                checked: 2,
                healthy: 1,
                unhealthy: 1,
                stale: 0,
            }
        );
        assert_eq!(registry.get("scanner").await.unwrap().status, ServiceStatus::Active);
        assert_eq!(registry.get("pattern").await.unwrap().status, ServiceStatus::Inactive);
    }

    /// Reports unhealthy, but only once the test lets it answer.
    #[derive(Default)]
    struct HeldProbe {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl HealthProbe for HeldProbe {
        async fn probe(&self, _host: &str, _port: u16) -> bool {
            self.entered.notify_one();
            self.release.notified().await;
            false
        }
    }

    #[tokio::test]
    async fn test_reregistration_during_sweep_wins() {
        let (store, _dir) = temp_store().await;
        let probe = Arc::new(HeldProbe::default());
        let registry = Arc::new(
            ServiceRegistry::load(store, probe.clone(), "localhost")
                .await
                .unwrap(),
        );
        registry.register("scanner", None, 5001).await.unwrap();

        let monitor = HealthMonitor::new(registry.clone(), Duration::from_secs(60));
        let sweep = tokio::spawn(async move { monitor.run_once().await });

        probe.entered.notified().await;
        registry.register("scanner", Some("10.0.0.7"), 5001).await.unwrap();
        probe.release.notify_one();

        let sweep = sweep.await.unwrap();
        assert_eq!((sweep.checked, sweep.unhealthy, sweep.stale), (1, 1, 1));
        let rec = registry.get("scanner").await.unwrap();
        assert_eq!(rec.status, ServiceStatus::Active);
        assert_eq!(rec.host, "10.0.0.7");
    }

    #[tokio::test]
    async fn test_sweep_on_empty_registry() {
        let (registry, _dir) = registry_with(&[]).await;
        let sweep = HealthMonitor::new(registry, Duration::from_secs(60)).run_once().await;
        assert_eq!(sweep, HealthSweep::default());
    }

    #[tokio::test]
    async fn test_spawned_monitor_stops_on_shutdown() {
        let (registry, _dir) = registry_with(&[5001]).await;
        registry.register("scanner", None, 5001).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = HealthMonitor::new(registry, Duration::from_millis(10)).spawn(rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }
}

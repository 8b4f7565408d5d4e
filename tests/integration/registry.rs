//! Registry and health monitoring against live workers.

use serde_json::json;
use std::time::Duration;

use coordinator::registry::monitor::HealthMonitor;
use coordinator::types::{KnownService, ServiceStatus};

use crate::mock_workers::MockWorker;
use crate::{http, Coordinator};

/// A localhost port with nothing listening on it.
async fn dead_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_force_register_and_status_with_three_healthy_workers() {
    let workers = [
        MockWorker::idle("scanner").await,
        MockWorker::idle("pattern").await,
        MockWorker::idle("trading").await,
    ];
    let catalog: Vec<KnownService> = workers.iter().map(MockWorker::known).collect();
    let coordinator = Coordinator::start(catalog).await;

    let (status, body) = http::post(&coordinator.router, "/force_register_all", json!({})).await;
    assert!(status.is_success());
    assert_eq!(body["status"], "completed");
    assert_eq!(body["count"], 3);

    let (_, entries) = http::get(&coordinator.router, "/service_status").await;
    let entries = entries.as_array().unwrap();
    assert_eq!(entries.len(), 3);
    for entry in entries {
        assert_eq!(entry["registered"], true);
        assert_eq!(entry["healthy"], true);
        assert_eq!(entry["status"], "active");
        assert!(entry["last_heartbeat"].is_string());
    }

    let (_, health) = http::get(&coordinator.router, "/health").await;
    assert_eq!(health["services_registered"], 3);
}

#[tokio::test]
async fn test_auto_discover_skips_dead_ports() {
    let alive = MockWorker::idle("scanner").await;
    let catalog = vec![alive.known(), KnownService::new("news", dead_port().await)];
    let coordinator = Coordinator::start(catalog.clone()).await;

    let added = coordinator.registry.auto_discover(&catalog).await.unwrap();
    assert_eq!(added, vec!["scanner".to_string()]);
    assert!(coordinator.registry.get("news").await.is_none());

    // Already registered entries are not probed again.
    let again = coordinator.registry.auto_discover(&catalog).await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_monitor_marks_stopped_worker_inactive() {
    let scanner = MockWorker::idle("scanner").await;
    let trading = MockWorker::idle("trading").await;
    let catalog = vec![scanner.known(), trading.known()];
    let coordinator = Coordinator::start(catalog.clone()).await;
    coordinator.register_all(&catalog).await;

    trading.stop().await;

    let monitor = HealthMonitor::new(coordinator.registry.clone(), Duration::from_secs(30));
    let sweep = monitor.run_once().await;
    assert_eq!(sweep.checked, 2);
    assert_eq!(sweep.healthy, 1);
    assert_eq!(sweep.unhealthy, 1);

    let trading = coordinator.registry.get("trading").await.unwrap();
    assert_eq!(trading.status, ServiceStatus::Inactive);
    let scanner = coordinator.registry.get("scanner").await.unwrap();
    assert_eq!(scanner.status, ServiceStatus::Active);
}

#[tokio::test]
async fn test_registrations_survive_restart() {
    let coordinator = Coordinator::start(Vec::new()).await;
    let (status, _) = http::post(
        &coordinator.router,
        "/register",
        json!({ "service_name": "reporting", "port": 5009, "host": "10.1.2.3" }),
    )
    .await;
    assert!(status.is_success());
    coordinator.store.checkpoint().await.unwrap();

    let restarted = Coordinator::open(&coordinator.db_path, Vec::new()).await;
    let record = restarted.registry.get("reporting").await.unwrap();
    assert_eq!(record.url(), "http://10.1.2.3:5009");
    assert_eq!(record.status, ServiceStatus::Active);
}

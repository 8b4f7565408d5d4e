//! Integration tests: the coordinator against real HTTP workers.
//!
//! Every test runs mock workers on ephemeral localhost ports and a fresh
//! SQLite file, and drives the coordinator through its public API.

mod mock_workers;
mod pipeline;
mod registry;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use coordinator::api::{build_router, CoordinatorState};
use coordinator::config::{DatabaseConfig, WorkflowConfig};
use coordinator::orchestrator::workers::HttpWorkerClient;
use coordinator::orchestrator::CycleOrchestrator;
use coordinator::registry::{HttpHealthProbe, ServiceRegistry};
use coordinator::scheduler::Scheduler;
use coordinator::storage::Store;
use coordinator::types::KnownService;
use coordinator::workflow::WorkflowEngine;

/// A fully wired coordinator on a throwaway database.
pub struct Coordinator {
    pub store: Store,
    pub registry: Arc<ServiceRegistry>,
    pub orchestrator: Arc<CycleOrchestrator>,
    pub scheduler: Arc<Scheduler>,
    pub router: axum::Router,
    pub db_path: String,
    _dir: Option<TempDir>,
}

impl Coordinator {
    pub async fn start(catalog: Vec<KnownService>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("coordinator.db").to_string_lossy().to_string();
        let mut coordinator = Self::open(&db_path, catalog).await;
        coordinator._dir = Some(dir);
        coordinator
    }

    /// Wire a coordinator over an existing database file.
    pub async fn open(db_path: &str, catalog: Vec<KnownService>) -> Self {
        let store = Store::open(&DatabaseConfig {
            path: db_path.to_string(),
            ..DatabaseConfig::default()
        })
        .await
        .unwrap();

        let probe = Arc::new(HttpHealthProbe::new(Duration::from_secs(2)).unwrap());
        let registry = Arc::new(
            ServiceRegistry::load(store.clone(), probe, "127.0.0.1")
                .await
                .unwrap(),
        );
        let orchestrator = Arc::new(CycleOrchestrator::new(
            WorkflowEngine::new(store.clone()),
            registry.clone(),
            Arc::new(HttpWorkerClient::new(Duration::from_secs(5)).unwrap()),
            WorkflowConfig {
                phase_retry_delay_ms: 10,
                ..WorkflowConfig::default()
            },
        ));
        let scheduler = Arc::new(
            Scheduler::load(store.clone(), orchestrator.clone(), Duration::from_secs(60))
                .await
                .unwrap(),
        );

        let router = build_router(Arc::new(CoordinatorState {
            registry: registry.clone(),
            orchestrator: orchestrator.clone(),
            scheduler: scheduler.clone(),
            catalog,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }));

        Self {
            store,
            registry,
            orchestrator,
            scheduler,
            router,
            db_path: db_path.to_string(),
            _dir: None,
        }
    }

    pub async fn register_all(&self, catalog: &[KnownService]) {
        for known in catalog {
            self.registry
                .register(&known.name, Some("127.0.0.1"), known.port)
                .await
                .unwrap();
        }
    }
}

/// Helpers for calling the router in-process.
pub mod http {
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use axum::Router;
    use serde_json::Value;
    use tower::ServiceExt;

    pub async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
        send(app, Request::builder().uri(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let req = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        send(app, req).await
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1_000_000).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }
}

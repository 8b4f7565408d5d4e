//! Mock phase workers for integration testing.
//!
//! Each mock is a real axum server on an ephemeral localhost port that
//! answers `/health` plus one phase endpoint with deterministic payloads.
//! `stop` shuts the server down gracefully, which is how tests take a
//! worker down mid-run.

use axum::{
    extract::Path,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use coordinator::types::KnownService;

/// A running mock worker.
pub struct MockWorker {
    pub name: String,
    pub port: u16,
    calls: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockWorker {
    /// Only answers `/health`.
    pub async fn idle(name: &str) -> Self {
        Self::start(name, Router::new(), Arc::new(AtomicUsize::new(0))).await
    }

    /// `GET /scan_securities` returns `{"securities": [...]}` for `symbols`.
    pub async fn scanner(symbols: &[&str]) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let securities: Vec<Value> = symbols
            .iter()
            .map(|s| json!({ "symbol": s, "price": 100.0, "volume": 1_000_000 }))
            .collect();

        let hits = calls.clone();
        let router = Router::new().route(
            "/scan_securities",
            get(move || {
                hits.fetch_add(1, Ordering::SeqCst);
                let body = json!({ "securities": securities.clone(), "count": securities.len() });
                async move { Json(body) }
            }),
        );
        Self::start("scanner", router, calls).await
    }

    /// `GET /analyze_patterns/{symbol}` reports one pattern per symbol and
    /// answers 500 for any symbol listed in `failing`.
    pub async fn pattern(failing: &[&str]) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing: Vec<String> = failing.iter().map(|s| s.to_string()).collect();

        let hits = calls.clone();
        let router = Router::new().route(
            "/analyze_patterns/:symbol",
            get(move |Path(symbol): Path<String>| {
                hits.fetch_add(1, Ordering::SeqCst);
                let fail = failing.contains(&symbol);
                async move {
                    if fail {
                        return Err((StatusCode::INTERNAL_SERVER_ERROR, "analysis crashed"));
                    }
                    Ok(Json(json!({
                        "symbol": symbol,
                        "patterns": [{ "name": "double_bottom", "confidence": 0.8 }],
                    })))
                }
            }),
        );
        Self::start("pattern", router, calls).await
    }

    /// `POST /generate_signals` emits one buy signal per submitted security,
    /// as a bare JSON array when `bare_list` is set and wrapped in
    /// `{"signals": [...]}` otherwise.
    pub async fn technical(bare_list: bool) -> Self {
        let calls = Arc::new(AtomicUsize::new(0));

        let hits = calls.clone();
        let router = Router::new().route(
            "/generate_signals",
            post(move |Json(body): Json<Value>| {
                hits.fetch_add(1, Ordering::SeqCst);
                async move {
                    let signals: Vec<Value> = body["securities"]
                        .as_array()
                        .map(|list| {
                            list.iter()
                                .map(|s| {
                                    json!({ "symbol": s["symbol"], "signal": "BUY", "confidence": 72 })
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    if bare_list {
                        Json(Value::Array(signals))
                    } else {
                        Json(json!({ "signals": signals }))
                    }
                }
            }),
        );
        Self::start("technical", router, calls).await
    }

    /// `POST /execute_trades` executes every submitted signal.
    pub async fn trading() -> Self {
        let calls = Arc::new(AtomicUsize::new(0));

        let hits = calls.clone();
        let router = Router::new().route(
            "/execute_trades",
            post(move |Json(body): Json<Value>| {
                hits.fetch_add(1, Ordering::SeqCst);
                async move {
                    let n = body["signals"].as_array().map_or(0, Vec::len);
                    Json(json!({ "trades_executed": n }))
                }
            }),
        );
        Self::start("trading", router, calls).await
    }

    async fn start(name: &str, router: Router, calls: Arc<AtomicUsize>) -> Self {
        let router = router.route("/health", get(|| async { Json(json!({ "status": "healthy" })) }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            name: name.to_string(),
            port,
            calls,
            shutdown: Some(tx),
            task,
        }
    }

    /// Stop accepting requests and close open connections.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }

    /// Phase endpoint hits so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn known(&self) -> KnownService {
        KnownService::new(self.name.as_str(), self.port)
    }
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// The four pipeline workers, registered under their default names.
pub struct Pipeline {
    pub scanner: MockWorker,
    pub pattern: MockWorker,
    pub technical: MockWorker,
    pub trading: MockWorker,
}

impl Pipeline {
    pub async fn start(symbols: &[&str], failing_patterns: &[&str]) -> Self {
        Self::start_with(symbols, failing_patterns, false).await
    }

    /// Like `start`, with the technical worker answering a bare signal list
    /// when `bare_signals` is set.
    pub async fn start_with(symbols: &[&str], failing_patterns: &[&str], bare_signals: bool) -> Self {
        Self {
            scanner: MockWorker::scanner(symbols).await,
            pattern: MockWorker::pattern(failing_patterns).await,
            technical: MockWorker::technical(bare_signals).await,
            trading: MockWorker::trading().await,
        }
    }

    pub fn catalog(&self) -> Vec<KnownService> {
        [&self.scanner, &self.pattern, &self.technical, &self.trading]
            .into_iter()
            .map(MockWorker::known)
            .collect()
    }
}

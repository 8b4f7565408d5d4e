//! Phase worker calls.
//!
//! Each pipeline phase talks to one worker over HTTP/JSON. Responses are
//! decoded into typed payloads here, at the boundary, so the orchestrator
//! never handles a security without a symbol.
//!
//! | Phase | Request |
//! |---|---|
//! | security selection | `GET /scan_securities` |
//! | pattern analysis | `GET /analyze_patterns/{symbol}` |
//! | signal generation | `POST /generate_signals {"securities": [security]}` |
//! | trade execution | `POST /execute_trades {"signals": [...]}` |

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;

use crate::types::{CoordinatorError, ServiceRecord};

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A security as returned by the scanner. Fields other than `symbol` are
/// passed through untouched to later phases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub symbol: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Security {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            extra: Map::new(),
        }
    }
}

/// Scanner output: a bare list or `{"securities": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScanResponse {
    List(Vec<Security>),
    Wrapped {
        #[serde(default)]
        securities: Vec<Security>,
    },
}

/// Pattern analysis output for one symbol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternReport {
    #[serde(default)]
    pub patterns: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A security enriched with its pattern report, as sent to signal generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyzedSecurity {
    #[serde(flatten)]
    pub security: Security,
    pub patterns: PatternReport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Signal output: a bare list or `{"signals": [...]}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignalResponse {
    List(Vec<Signal>),
    Wrapped {
        #[serde(default)]
        signals: Vec<Signal>,
    },
}

impl SignalResponse {
    fn into_signals(self) -> Vec<Signal> {
        match self {
            SignalResponse::List(signals) | SignalResponse::Wrapped { signals } => signals,
        }
    }
}

/// Trading output: `{"trades_executed": n}`, `{"trades": [...]}` or a list
/// of executions.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TradeResponse {
    List(Vec<Value>),
    Count { trades_executed: u64 },
    Trades { trades: Vec<Value> },
}

impl TradeResponse {
    fn executed(&self) -> u64 {
        match self {
            TradeResponse::List(list) => list.len() as u64,
            TradeResponse::Count { trades_executed } => *trades_executed,
            TradeResponse::Trades { trades } => trades.len() as u64,
        }
    }
}

fn check_symbols<'a>(
    service: &str,
    symbols: impl IntoIterator<Item = &'a str>,
) -> Result<(), CoordinatorError> {
    match symbols.into_iter().position(|s| s.trim().is_empty()) {
        Some(idx) => Err(CoordinatorError::downstream(
            service,
            format!("item {idx} has an empty symbol"),
        )),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Calls the phase workers. One implementation speaks HTTP; tests swap in
/// scripted fakes.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    async fn scan_securities(&self, worker: &ServiceRecord) -> Result<Vec<Security>, CoordinatorError>;

    async fn analyze_patterns(
        &self,
        worker: &ServiceRecord,
        symbol: &str,
    ) -> Result<PatternReport, CoordinatorError>;

    async fn generate_signals(
        &self,
        worker: &ServiceRecord,
        security: &AnalyzedSecurity,
    ) -> Result<Vec<Signal>, CoordinatorError>;

    /// Returns the number of executed trades.
    async fn execute_trades(
        &self,
        worker: &ServiceRecord,
        signals: &[Signal],
    ) -> Result<u64, CoordinatorError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpWorkerClient {
    http: Client,
}

impl HttpWorkerClient {
    pub fn new(timeout: Duration) -> Result<Self, CoordinatorError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("coordinator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CoordinatorError::Configuration(format!("worker client: {e}")))?;
        Ok(Self { http })
    }

    /// Send a request and decode a success body; transport failures mean the
    /// worker is unavailable, anything else is a worker error.
    async fn call<T: DeserializeOwned>(
        &self,
        worker: &ServiceRecord,
        request: RequestBuilder,
    ) -> Result<T, CoordinatorError> {
        let resp = request
            .send()
            .await
            .map_err(|e| CoordinatorError::unavailable(&worker.name, e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CoordinatorError::downstream(
                &worker.name,
                format!("HTTP {status}: {}", body.chars().take(200).collect::<String>()),
            ));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| CoordinatorError::unavailable(&worker.name, e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| {
            CoordinatorError::downstream(&worker.name, format!("malformed response: {e}"))
        })
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn scan_securities(&self, worker: &ServiceRecord) -> Result<Vec<Security>, CoordinatorError> {
        let url = format!("{}/scan_securities", worker.url());
        debug!(url = %url, "Requesting securities");
        let securities = match self.call(worker, self.http.get(&url)).await? {
            ScanResponse::List(list) => list,
            ScanResponse::Wrapped { securities } => securities,
        };
        check_symbols(&worker.name, securities.iter().map(|s| s.symbol.as_str()))?;
        Ok(securities)
    }

    async fn analyze_patterns(
        &self,
        worker: &ServiceRecord,
        symbol: &str,
    ) -> Result<PatternReport, CoordinatorError> {
        let url = format!(
            "{}/analyze_patterns/{}",
            worker.url(),
            urlencoding::encode(symbol)
        );
        debug!(url = %url, "Requesting pattern analysis");
        self.call(worker, self.http.get(&url)).await
    }

    async fn generate_signals(
        &self,
        worker: &ServiceRecord,
        security: &AnalyzedSecurity,
    ) -> Result<Vec<Signal>, CoordinatorError> {
        let url = format!("{}/generate_signals", worker.url());
        let body = serde_json::json!({ "securities": [security] });
        let resp: SignalResponse = self.call(worker, self.http.post(&url).json(&body)).await?;
        let signals = resp.into_signals();
        check_symbols(&worker.name, signals.iter().map(|s| s.symbol.as_str()))?;
        Ok(signals)
    }

    async fn execute_trades(
        &self,
        worker: &ServiceRecord,
        signals: &[Signal],
    ) -> Result<u64, CoordinatorError> {
        let url = format!("{}/execute_trades", worker.url());
        let body = serde_json::json!({ "signals": signals });
        let resp: TradeResponse = self.call(worker, self.http.post(&url).json(&body)).await?;
        Ok(resp.executed())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scan_response_list_and_wrapped() {
        let list: ScanResponse = serde_json::from_value(json!([{"symbol": "AAPL", "price": 190.0}])).unwrap();
        let wrapped: ScanResponse =
            serde_json::from_value(json!({"securities": [{"symbol": "MSFT"}], "count": 1})).unwrap();

        match list {
            ScanResponse::List(s) => {
                assert_eq!(s[0].symbol, "AAPL");
                assert_eq!(s[0].extra["price"], json!(190.0));
            }
            other => panic!("unexpected {other:?}"),
        }
        match wrapped {
            ScanResponse::Wrapped { securities } => assert_eq!(securities[0].symbol, "MSFT"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_security_without_symbol_is_rejected() {
        assert!(serde_json::from_value::<ScanResponse>(json!([{"price": 1.0}])).is_err());
        assert!(check_symbols("scanner", ["AAPL", " "]).is_err());
        assert!(check_symbols("scanner", ["AAPL", "MSFT"]).is_ok());
    }

    #[test]
    fn test_signal_response_list_and_wrapped() {
        let list: SignalResponse =
            serde_json::from_str(r#"[{"symbol":"AAPL","signal":"BUY","confidence":72}]"#).unwrap();
        let signals = list.into_signals();
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].symbol, "AAPL");
        assert_eq!(signals[0].extra["signal"], "BUY");

        let wrapped: SignalResponse =
            serde_json::from_value(json!({"signals": [{"symbol": "MSFT"}, {"symbol": "NVDA"}]})).unwrap();
        assert_eq!(wrapped.into_signals().len(), 2);

        let empty: SignalResponse = serde_json::from_value(json!({})).unwrap();
        assert!(empty.into_signals().is_empty());
    }

    #[test]
    fn test_trade_response_shapes() {
        let count: TradeResponse = serde_json::from_value(json!({"trades_executed": 3})).unwrap();
        let trades: TradeResponse = serde_json::from_value(json!({"trades": [{}, {}]})).unwrap();
        let list: TradeResponse = serde_json::from_value(json!([{"id": 1}])).unwrap();
        assert_eq!(count.executed(), 3);
        assert_eq!(trades.executed(), 2);
        assert_eq!(list.executed(), 1);
    }

    #[test]
    fn test_analyzed_security_serialises_flat() {
        let mut security = Security::new("AAPL");
        security.extra.insert("sector".into(), json!("tech"));
        let analyzed = AnalyzedSecurity {
            security,
            patterns: PatternReport {
                patterns: vec![json!({"name": "double_bottom"})],
                extra: Map::new(),
            },
        };
        let value = serde_json::to_value(&analyzed).unwrap();
        assert_eq!(value["symbol"], "AAPL");
        assert_eq!(value["sector"], "tech");
        assert_eq!(value["patterns"]["patterns"][0]["name"], "double_bottom");
    }

    #[test]
    fn test_pattern_report_defaults() {
        let report: PatternReport = serde_json::from_value(json!({"symbol": "AAPL"})).unwrap();
        assert!(report.patterns.is_empty());
        assert_eq!(report.extra["symbol"], "AAPL");
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_unavailable() {
        let client = HttpWorkerClient::new(Duration::from_millis(500)).unwrap();
        let worker = ServiceRecord {
            name: "scanner".into(),
            host: "127.0.0.1".into(),
            // Port 1 is reserved and nothing listens there in test environments.
            port: 1,
            status: crate::types::ServiceStatus::Active,
            last_heartbeat: None,
        };
        let err = client.scan_securities(&worker).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::DownstreamUnavailable { .. }));
    }
}

//! Full trading cycles over HTTP.

use serde_json::json;

use coordinator::types::{CycleStatus, PhaseStatus, ServiceStatus, WorkflowPhase};

use crate::mock_workers::Pipeline;
use crate::{http, Coordinator};

const SYMBOLS: [&str; 7] = ["AAPL", "MSFT", "NVDA", "AMZN", "GOOG", "META", "TSLA"];

async fn wired(symbols: &[&str], failing_patterns: &[&str]) -> (Pipeline, Coordinator) {
    let pipeline = Pipeline::start(symbols, failing_patterns).await;
    let catalog = pipeline.catalog();
    let coordinator = Coordinator::start(catalog.clone()).await;
    coordinator.register_all(&catalog).await;
    (pipeline, coordinator)
}

#[tokio::test]
async fn test_full_cycle_over_http() {
    let (pipeline, coordinator) = wired(&SYMBOLS, &[]).await;

    let summary = coordinator.orchestrator.run_cycle().await.unwrap();
    let cycle = &summary.cycle;
    assert_eq!(cycle.status, CycleStatus::Completed);
    assert_eq!(cycle.securities_scanned, 7);
    // Default batch of five carried through the later phases.
    assert_eq!(cycle.patterns_found, 5);
    assert_eq!(cycle.signals_generated, 5);
    assert_eq!(cycle.trades_executed, 5);
    assert_eq!(cycle.error_count, 0);
    assert!((cycle.success_rate - 1.0).abs() < 1e-9);
    assert!(cycle.end_time.is_some());

    assert!(summary.steps.iter().all(|s| s.status == PhaseStatus::Completed));
    assert_eq!(pipeline.scanner.calls(), 1);
    assert_eq!(pipeline.pattern.calls(), 5);
    assert_eq!(pipeline.technical.calls(), 5);
    assert_eq!(pipeline.trading.calls(), 1);
}

#[tokio::test]
async fn test_bare_signal_list_reaches_trading() {
    let pipeline = Pipeline::start_with(&["AAPL", "MSFT", "NVDA"], &[], true).await;
    let catalog = pipeline.catalog();
    let coordinator = Coordinator::start(catalog.clone()).await;
    coordinator.register_all(&catalog).await;

    let summary = coordinator.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.cycle.status, CycleStatus::Completed);
    assert_eq!(summary.cycle.signals_generated, 3);
    assert_eq!(summary.cycle.trades_executed, 3);

    let signals = summary.phase(WorkflowPhase::SignalGeneration).unwrap();
    assert_eq!(signals.status, PhaseStatus::Completed);
    assert_eq!(signals.items_succeeded, 3);
    assert_eq!(pipeline.trading.calls(), 1);
}

#[tokio::test]
async fn test_item_failure_is_recorded_and_cycle_continues() {
    let (_pipeline, coordinator) = wired(&["AAPL", "MSFT", "NVDA"], &["MSFT"]).await;

    let summary = coordinator.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.cycle.status, CycleStatus::CompletedWithErrors);
    assert_eq!(summary.cycle.patterns_found, 2);
    assert_eq!(summary.cycle.trades_executed, 2);

    let patterns = summary.phase(WorkflowPhase::PatternAnalysis).unwrap();
    assert_eq!(patterns.status, PhaseStatus::Completed);
    assert_eq!(patterns.items_processed, 3);
    assert_eq!(patterns.items_failed, 1);
    let metadata = patterns.metadata.as_ref().unwrap().to_string();
    assert!(metadata.contains("MSFT"));
}

#[tokio::test]
async fn test_zero_securities_completes_cleanly() {
    let (pipeline, coordinator) = wired(&[], &[]).await;

    let summary = coordinator.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.cycle.status, CycleStatus::Completed);
    assert_eq!(summary.cycle.securities_scanned, 0);
    assert_eq!(summary.cycle.trades_executed, 0);
    assert_eq!(summary.cycle.error_count, 0);

    assert_eq!(pipeline.pattern.calls(), 0);
    assert_eq!(pipeline.technical.calls(), 0);
    assert_eq!(pipeline.trading.calls(), 0);
}

#[tokio::test]
async fn test_trading_worker_down() {
    let (pipeline, coordinator) = wired(&["AAPL", "MSFT"], &[]).await;
    let Pipeline { trading, .. } = pipeline;
    trading.stop().await;

    let summary = coordinator.orchestrator.run_cycle().await.unwrap();
    assert_eq!(summary.cycle.status, CycleStatus::CompletedWithErrors);
    assert_eq!(summary.cycle.signals_generated, 2);
    assert_eq!(summary.cycle.trades_executed, 0);

    let trades = summary.phase(WorkflowPhase::TradeExecution).unwrap();
    assert_eq!(trades.status, PhaseStatus::Failed);
    assert_eq!(trades.retry_count, 2);
    assert!(trades.error_message.as_deref().unwrap().contains("trading"));

    let completion = summary.phase(WorkflowPhase::Completion).unwrap();
    assert_eq!(completion.status, PhaseStatus::Completed);

    let record = coordinator.registry.get("trading").await.unwrap();
    assert_eq!(record.status, ServiceStatus::Inactive);
}

#[tokio::test]
async fn test_cycle_through_api() {
    let (_pipeline, coordinator) = wired(&["AAPL", "MSFT", "NVDA"], &[]).await;
    let app = &coordinator.router;

    let (status, summary) = http::post(app, "/start_trading_cycle", json!({})).await;
    assert!(status.is_success());
    assert_eq!(summary["status"], "completed");
    assert_eq!(summary["trades_executed"], 3);
    let cycle_id = summary["cycle_id"].as_str().unwrap().to_string();
    assert!(cycle_id.starts_with("cycle_"));

    let (status, detail) = http::get(app, &format!("/workflow/{cycle_id}")).await;
    assert!(status.is_success());
    assert_eq!(detail["steps"].as_array().unwrap().len(), 6);
    let events = detail["events"].as_array().unwrap();
    let (first, last) = (events.first().unwrap(), events.last().unwrap());
    assert_eq!((&first["phase"], &first["event_type"]), (&json!("workflow"), &json!("started")));
    assert_eq!((&last["phase"], &last["event_type"]), (&json!("workflow"), &json!("completed")));

    let (_, latest) = http::get(app, "/latest_cycle").await;
    assert_eq!(latest["cycle_id"], cycle_id.as_str());

    let (_, schedule) = http::get(app, "/schedule/status").await;
    assert!(schedule["last_run"].is_string());

    let (_, stats) = http::get(app, "/workflow/stats").await;
    let trades = stats
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["phase"] == "trade_execution")
        .unwrap();
    assert_eq!(trades["total_runs"], 1);
}

#[tokio::test]
async fn test_history_survives_restart() {
    let (_pipeline, coordinator) = wired(&["AAPL"], &[]).await;
    let first = coordinator.orchestrator.run_cycle().await.unwrap();
    let second = coordinator.orchestrator.run_cycle().await.unwrap();
    coordinator.store.checkpoint().await.unwrap();

    let restarted = Coordinator::open(&coordinator.db_path, Vec::new()).await;
    let engine = restarted.orchestrator.engine();
    let recent = engine.recent_cycles(10).await.unwrap();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0].cycle_id, second.cycle.cycle_id);
    assert_eq!(recent[1].cycle_id, first.cycle.cycle_id);

    let summary = engine.summary(&first.cycle.cycle_id).await.unwrap().unwrap();
    assert_eq!(summary, first);
    assert!(engine.active_cycles().await.unwrap().is_empty());
}

//! Cycle orchestrator.
//!
//! Drives one trading cycle through the fixed phase pipeline:
//!   1. Initialization: check which workers are available
//!   2. Security selection: scan, keep the top `batch_size`
//!   3. Pattern analysis: one call per security
//!   4. Signal generation: one call per analysed security
//!   5. Trade execution: one call with every signal
//!   6. Completion: always recorded, even after an abort
//!
//! Every transition goes through the [`WorkflowEngine`], so the persisted
//! rows are the only record of a cycle. Worker failures are recorded and
//! handled per the configured [`FailurePolicy`](crate::config::FailurePolicy);
//! only store failures escape, as [`CoordinatorError::CycleAborted`].

pub mod workers;

use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{OnFailure, WorkflowConfig};
use crate::registry::ServiceRegistry;
use crate::types::{CoordinatorError, CycleSummary, ServiceRecord, WorkflowPhase};
use crate::workflow::{PhaseCounts, PhaseOutcome, WorkflowEngine};
use workers::{AnalyzedSecurity, Security, Signal, WorkerClient};

/// Result of a phase as seen by the pipeline.
enum Flow<T> {
    Next(T),
    Abort,
}

pub struct CycleOrchestrator {
    engine: WorkflowEngine,
    registry: Arc<ServiceRegistry>,
    workers: Arc<dyn WorkerClient>,
    settings: WorkflowConfig,
    /// Held for the whole cycle unless concurrent cycles are allowed.
    gate: Option<Mutex<()>>,
}

impl CycleOrchestrator {
    pub fn new(
        engine: WorkflowEngine,
        registry: Arc<ServiceRegistry>,
        workers: Arc<dyn WorkerClient>,
        settings: WorkflowConfig,
    ) -> Self {
        let gate = (!settings.allow_concurrent_cycles).then(|| Mutex::new(()));
        Self {
            engine,
            registry,
            workers,
            settings,
            gate,
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Run one full cycle and return its persisted summary.
    pub async fn run_cycle(&self) -> Result<CycleSummary, CoordinatorError> {
        let _turn = match &self.gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let cycle_id = self.engine.start_cycle().await?;
        let aborted = match self.drive(&cycle_id).await {
            Ok(aborted) => aborted,
            Err(e) => return Err(self.abandon(cycle_id, e).await),
        };

        match self.engine.complete_cycle(&cycle_id, aborted).await {
            Ok(summary) => Ok(summary),
            Err(e) => Err(self.abandon(cycle_id, e).await),
        }
    }

    /// Best-effort close of a cycle the store gave up on.
    async fn abandon(&self, cycle_id: String, source: CoordinatorError) -> CoordinatorError {
        error!(cycle_id = %cycle_id, error = %source, "Cycle aborted by store failure");
        if let Err(e) = self.engine.complete_cycle(&cycle_id, true).await {
            warn!(cycle_id = %cycle_id, error = %e, "Could not mark aborted cycle as failed");
        }
        CoordinatorError::CycleAborted {
            cycle_id,
            source: Box::new(source),
        }
    }

    /// Walk the pipeline. Returns whether the cycle was aborted.
    async fn drive(&self, cycle: &str) -> Result<bool, CoordinatorError> {
        self.initialize(cycle).await?;

        let aborted = match self.select_securities(cycle).await? {
            Flow::Abort => true,
            Flow::Next(securities) => match self.analyze_patterns(cycle, securities).await? {
                Flow::Abort => true,
                Flow::Next(analyzed) => match self.generate_signals(cycle, analyzed).await? {
                    Flow::Abort => true,
                    Flow::Next(signals) => matches!(self.execute_trades(cycle, signals).await?, Flow::Abort),
                },
            },
        };

        self.complete(cycle, aborted).await?;
        Ok(aborted)
    }

    // -- Phases ------------------------------------------------------------

    async fn initialize(&self, cycle: &str) -> Result<(), CoordinatorError> {
        let phase = WorkflowPhase::Initialization;
        self.engine.start_phase(cycle, phase, None).await?;

        let mut available = Vec::new();
        let mut missing = Vec::new();
        for name in WorkflowPhase::ALL
            .iter()
            .filter_map(|p| self.settings.workers.for_phase(*p))
        {
            match self.registry.get(name).await {
                Some(record) if record.is_active() => available.push(name),
                _ => missing.push(name),
            }
        }
        if !missing.is_empty() {
            warn!(cycle_id = cycle, missing = ?missing, "Some workers are not available");
        }

        let metadata = json!({ "available": available, "missing": missing });
        self.engine
            .complete_phase(
                cycle,
                phase,
                PhaseOutcome::success(PhaseCounts::default(), 0).with_metadata(metadata),
            )
            .await?;
        Ok(())
    }

    async fn select_securities(&self, cycle: &str) -> Result<Flow<Vec<Security>>, CoordinatorError> {
        let phase = WorkflowPhase::SecuritySelection;
        let service = self.worker_name(phase);
        self.engine.start_phase(cycle, phase, None).await?;

        let scanned = self
            .with_retries(cycle, phase, move || async move {
                let worker = self.registry.resolve(service).await?;
                self.bounded(service, self.workers.scan_securities(&worker)).await
            })
            .await?;

        match scanned {
            Ok(mut securities) => {
                let found = securities.len() as u64;
                securities.truncate(self.settings.batch_size);
                let symbols: Vec<&str> = securities.iter().map(|s| s.symbol.as_str()).collect();
                info!(cycle_id = cycle, found, selected = symbols.len(), "Securities selected");

                let outcome = PhaseOutcome::success(
                    PhaseCounts {
                        processed: found,
                        succeeded: found,
                        failed: 0,
                    },
                    found,
                )
                .with_metadata(json!({ "selected": symbols }));
                self.engine.complete_phase(cycle, phase, outcome).await?;
                Ok(Flow::Next(securities))
            }
            Err(e) => self.fail_phase(cycle, phase, &e, PhaseCounts::default()).await,
        }
    }

    async fn analyze_patterns(
        &self,
        cycle: &str,
        securities: Vec<Security>,
    ) -> Result<Flow<Vec<AnalyzedSecurity>>, CoordinatorError> {
        let phase = WorkflowPhase::PatternAnalysis;
        if securities.is_empty() {
            self.skip_phase(cycle, phase).await?;
            return Ok(Flow::Next(Vec::new()));
        }
        let service = self.worker_name(phase);
        self.engine.start_phase(cycle, phase, None).await?;

        let worker = match self.resolve_with_retries(cycle, phase, service).await? {
            Ok(worker) => worker,
            Err(e) => return self.fail_phase(cycle, phase, &e, all_failed(securities.len())).await,
        };

        let mut analyzed = Vec::with_capacity(securities.len());
        let mut failures = Vec::new();
        let mut patterns = 0u64;
        let mut counts = PhaseCounts::default();
        for security in securities {
            counts.processed += 1;
            let call = self.workers.analyze_patterns(&worker, &security.symbol);
            match self.bounded(service, call).await {
                Ok(report) => {
                    counts.succeeded += 1;
                    patterns += report.patterns.len() as u64;
                    analyzed.push(AnalyzedSecurity {
                        security,
                        patterns: report,
                    });
                }
                Err(e) if e.is_downstream() => {
                    counts.failed += 1;
                    warn!(cycle_id = cycle, symbol = %security.symbol, error = %e, "Pattern analysis failed");
                    failures.push(json!({ "symbol": security.symbol, "error": e.to_string() }));
                }
                Err(e) => return Err(e),
            }
            self.engine.update_phase_progress(cycle, phase, counts, None).await?;
        }

        self.finish_item_phase(cycle, phase, counts, patterns, failures, analyzed)
            .await
    }

    async fn generate_signals(
        &self,
        cycle: &str,
        analyzed: Vec<AnalyzedSecurity>,
    ) -> Result<Flow<Vec<Signal>>, CoordinatorError> {
        let phase = WorkflowPhase::SignalGeneration;
        if analyzed.is_empty() {
            self.skip_phase(cycle, phase).await?;
            return Ok(Flow::Next(Vec::new()));
        }
        let service = self.worker_name(phase);
        self.engine.start_phase(cycle, phase, None).await?;

        let worker = match self.resolve_with_retries(cycle, phase, service).await? {
            Ok(worker) => worker,
            Err(e) => return self.fail_phase(cycle, phase, &e, all_failed(analyzed.len())).await,
        };

        let mut signals = Vec::new();
        let mut failures = Vec::new();
        let mut counts = PhaseCounts::default();
        for security in &analyzed {
            counts.processed += 1;
            let call = self.workers.generate_signals(&worker, security);
            match self.bounded(service, call).await {
                Ok(generated) => {
                    counts.succeeded += 1;
                    signals.extend(generated);
                }
                Err(e) if e.is_downstream() => {
                    counts.failed += 1;
                    let symbol = &security.security.symbol;
                    warn!(cycle_id = cycle, symbol = %symbol, error = %e, "Signal generation failed");
                    failures.push(json!({ "symbol": symbol, "error": e.to_string() }));
                }
                Err(e) => return Err(e),
            }
            self.engine.update_phase_progress(cycle, phase, counts, None).await?;
        }

        let produced = signals.len() as u64;
        self.finish_item_phase(cycle, phase, counts, produced, failures, signals)
            .await
    }

    async fn execute_trades(
        &self,
        cycle: &str,
        signals: Vec<Signal>,
    ) -> Result<Flow<u64>, CoordinatorError> {
        let phase = WorkflowPhase::TradeExecution;
        if signals.is_empty() {
            self.skip_phase(cycle, phase).await?;
            return Ok(Flow::Next(0));
        }
        let service = self.worker_name(phase);
        self.engine.start_phase(cycle, phase, None).await?;

        let submitted = signals.len() as u64;
        let batch = signals.as_slice();
        let executed = self
            .with_retries(cycle, phase, move || async move {
                let worker = self.registry.resolve(service).await?;
                self.bounded(service, self.workers.execute_trades(&worker, batch))
                    .await
            })
            .await?;

        match executed {
            Ok(executed) => {
                let succeeded = executed.min(submitted);
                let rejected = submitted - succeeded;
                if rejected > 0 {
                    warn!(cycle_id = cycle, submitted, executed, rejected, "Some trades were not executed");
                } else {
                    info!(cycle_id = cycle, submitted, executed, "Trades executed");
                }
                let outcome = PhaseOutcome::success(
                    PhaseCounts {
                        processed: submitted,
                        succeeded,
                        failed: rejected,
                    },
                    executed,
                );
                self.engine.complete_phase(cycle, phase, outcome).await?;
                Ok(Flow::Next(executed))
            }
            Err(e) => self.fail_phase(cycle, phase, &e, all_failed(signals.len())).await,
        }
    }

    async fn complete(&self, cycle: &str, aborted: bool) -> Result<(), CoordinatorError> {
        let phase = WorkflowPhase::Completion;
        self.engine.start_phase(cycle, phase, None).await?;
        self.engine
            .complete_phase(
                cycle,
                phase,
                PhaseOutcome::success(PhaseCounts::default(), 0)
                    .with_metadata(json!({ "aborted": aborted })),
            )
            .await?;
        Ok(())
    }

    // -- Helpers -----------------------------------------------------------

    fn worker_name(&self, phase: WorkflowPhase) -> &str {
        self.settings.workers.for_phase(phase).unwrap_or_default()
    }

    /// Record an empty phase without contacting its worker.
    async fn skip_phase(&self, cycle: &str, phase: WorkflowPhase) -> Result<(), CoordinatorError> {
        self.engine.start_phase(cycle, phase, None).await?;
        self.engine
            .complete_phase(
                cycle,
                phase,
                PhaseOutcome::success(PhaseCounts::default(), 0)
                    .with_metadata(json!({ "skipped": "no input" })),
            )
            .await?;
        Ok(())
    }

    /// Mark a phase failed and apply the failure policy.
    async fn fail_phase<T: Default>(
        &self,
        cycle: &str,
        phase: WorkflowPhase,
        error: &CoordinatorError,
        counts: PhaseCounts,
    ) -> Result<Flow<T>, CoordinatorError> {
        self.engine
            .complete_phase(cycle, phase, PhaseOutcome::failure(error.to_string(), counts))
            .await?;
        Ok(self.after_failure(cycle, phase))
    }

    /// Close a per-item phase; it fails only when every item failed.
    async fn finish_item_phase<T: Default>(
        &self,
        cycle: &str,
        phase: WorkflowPhase,
        counts: PhaseCounts,
        produced: u64,
        failures: Vec<Value>,
        output: T,
    ) -> Result<Flow<T>, CoordinatorError> {
        let metadata = json!({ "failures": failures });
        if counts.succeeded == 0 {
            let outcome = PhaseOutcome::failure("every item failed", counts).with_metadata(metadata);
            self.engine.complete_phase(cycle, phase, outcome).await?;
            return Ok(self.after_failure(cycle, phase));
        }
        let outcome = PhaseOutcome::success(counts, produced).with_metadata(metadata);
        self.engine.complete_phase(cycle, phase, outcome).await?;
        Ok(Flow::Next(output))
    }

    fn after_failure<T: Default>(&self, cycle: &str, phase: WorkflowPhase) -> Flow<T> {
        match self.settings.failure_policy.on_failure(phase) {
            OnFailure::Abort => {
                warn!(cycle_id = cycle, phase = %phase, "Phase failed, aborting cycle");
                Flow::Abort
            }
            OnFailure::Continue => Flow::Next(T::default()),
        }
    }

    async fn resolve_with_retries(
        &self,
        cycle: &str,
        phase: WorkflowPhase,
        service: &str,
    ) -> Result<Result<ServiceRecord, CoordinatorError>, CoordinatorError> {
        self.with_retries(cycle, phase, move || self.registry.resolve(service))
            .await
    }

    /// Run a phase-level worker call, retrying downstream failures up to
    /// `max_phase_retries` times. The phase must be running.
    ///
    /// The outer error is a store failure; the inner one is the last worker
    /// error once retries are spent.
    async fn with_retries<T, F, Fut>(
        &self,
        cycle: &str,
        phase: WorkflowPhase,
        mut attempt: F,
    ) -> Result<Result<T, CoordinatorError>, CoordinatorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoordinatorError>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(Ok(value)),
                Err(e) if !e.is_downstream() => return Err(e),
                Err(e) if retries >= self.settings.max_phase_retries => return Ok(Err(e)),
                Err(e) => {
                    retries += 1;
                    self.engine.retry_phase(cycle, phase, &e.to_string()).await?;
                    tokio::time::sleep(self.settings.phase_retry_delay()).await;
                    self.engine.start_phase(cycle, phase, None).await?;
                }
            }
        }
    }

    /// Apply the phase timeout to a worker call.
    async fn bounded<T>(
        &self,
        service: &str,
        call: impl Future<Output = Result<T, CoordinatorError>>,
    ) -> Result<T, CoordinatorError> {
        let timeout = self.settings.phase_timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CoordinatorError::unavailable(
                service,
                format!("timed out after {}s", timeout.as_secs()),
            )),
        }
    }
}

fn all_failed(items: usize) -> PhaseCounts {
    PhaseCounts {
        processed: items as u64,
        succeeded: 0,
        failed: items as u64,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Workflow engine.
//!
//! Persists the state machine of a trading cycle: one `trading_cycles`
//! row, six `workflow_tracking` rows (one per phase) and an append-only
//! `workflow_events` log. Every transition writes its row change and its
//! event in one transaction, so the store alone is enough to reconstruct
//! any cycle (see [`history`]).
//!
//! Phase state machine:
//!
//! ```text
//! pending ──start──▶ running ──complete──▶ completed | failed
//!                     │   ▲
//!                   retry start
//!                     ▼   │
//!                    retrying
//! ```

pub mod history;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::storage::{Statement, Store};
use crate::types::{
    now_utc, parse_optional_timestamp, parse_timestamp, to_timestamp, CoordinatorError,
    CycleRecord, CycleStatus, CycleSummary, PhaseRecord, PhaseStatus, WorkflowPhase,
};

/// Phase name used for cycle-level events.
pub const WORKFLOW_EVENT_PHASE: &str = "workflow";

// ---------------------------------------------------------------------------
// Phase inputs
// ---------------------------------------------------------------------------

/// Item counters for a phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseCounts {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Final result of a phase, as reported by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhaseOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub counts: PhaseCounts,
    /// Output items the phase yielded (securities, patterns, signals,
    /// trades); becomes the cycle's total for this phase.
    pub produced: u64,
    pub metadata: Option<Value>,
}

impl PhaseOutcome {
    pub fn success(counts: PhaseCounts, produced: u64) -> Self {
        Self {
            success: true,
            counts,
            produced,
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>, counts: PhaseCounts) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            counts,
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// `trading_cycles` column holding a phase's total, if it has one.
fn cycle_total_column(phase: WorkflowPhase) -> Option<&'static str> {
    match phase {
        WorkflowPhase::SecuritySelection => Some("securities_scanned"),
        WorkflowPhase::PatternAnalysis => Some("patterns_found"),
        WorkflowPhase::SignalGeneration => Some("signals_generated"),
        WorkflowPhase::TradeExecution => Some("trades_executed"),
        WorkflowPhase::Initialization | WorkflowPhase::Completion => None,
    }
}

fn new_cycle_id(now: &DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("cycle_{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

fn seconds_between(start: &DateTime<Utc>, end: &DateTime<Utc>) -> f64 {
    (*end - *start)
        .num_microseconds()
        .map(|us| us as f64 / 1_000_000.0)
        .unwrap_or(0.0)
        .max(0.0)
}

fn event(
    cycle_id: &str,
    phase: &str,
    event_type: &str,
    data: Option<&Value>,
    at: &DateTime<Utc>,
) -> Statement {
    Statement::new(
        "INSERT INTO workflow_events (cycle_id, phase, event_type, event_data, timestamp) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(cycle_id)
    .bind(phase)
    .bind(event_type)
    .bind(data.map(Value::to_string))
    .bind(to_timestamp(at))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Persisted cycle/phase state machine. Cheap to clone.
#[derive(Clone)]
pub struct WorkflowEngine {
    store: Store,
    /// Serialises read-check-write transitions within this process.
    transitions: Arc<Mutex<()>>,
}

impl WorkflowEngine {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            transitions: Arc::new(Mutex::new(())),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Create a running cycle with all six phases pending.
    pub async fn start_cycle(&self) -> Result<String, CoordinatorError> {
        let now = now_utc();
        let cycle_id = new_cycle_id(&now);
        let ts = to_timestamp(&now);

        let mut stmts = Vec::with_capacity(WorkflowPhase::ALL.len() + 2);
        stmts.push(
            Statement::new(
                "INSERT INTO trading_cycles (cycle_id, status, start_time, created_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(cycle_id.as_str())
            .bind(CycleStatus::Running.as_str())
            .bind(ts.as_str())
            .bind(ts.as_str()),
        );
        for phase in WorkflowPhase::ALL {
            stmts.push(
                Statement::new(
                    "INSERT INTO workflow_tracking (cycle_id, phase, status) VALUES (?, ?, ?)",
                )
                .bind(cycle_id.as_str())
                .bind(phase.as_str())
                .bind(PhaseStatus::Pending.as_str()),
            );
        }
        stmts.push(event(
            &cycle_id,
            WORKFLOW_EVENT_PHASE,
            "started",
            Some(&json!({ "phases": WorkflowPhase::ALL.len() })),
            &now,
        ));

        self.store.transaction(stmts).await?;
        info!(cycle_id = %cycle_id, "Cycle started");
        Ok(cycle_id)
    }

    /// pending | retrying → running. The first start time is kept across retries.
    pub async fn start_phase(
        &self,
        cycle_id: &str,
        phase: WorkflowPhase,
        metadata: Option<Value>,
    ) -> Result<(), CoordinatorError> {
        let _guard = self.transitions.lock().await;
        let current = self.require_phase(cycle_id, phase).await?;
        check_transition(
            &current,
            &[PhaseStatus::Pending, PhaseStatus::Retrying],
            PhaseStatus::Running,
        )?;

        let now = now_utc();
        let ts = to_timestamp(&now);
        let update = match &metadata {
            Some(meta) => Statement::new(
                "UPDATE workflow_tracking SET status = ?, start_time = COALESCE(start_time, ?), \
                 metadata = ? WHERE cycle_id = ? AND phase = ?",
            )
            .bind(PhaseStatus::Running.as_str())
            .bind(ts.as_str())
            .bind(meta.to_string()),
            None => Statement::new(
                "UPDATE workflow_tracking SET status = ?, start_time = COALESCE(start_time, ?) \
                 WHERE cycle_id = ? AND phase = ?",
            )
            .bind(PhaseStatus::Running.as_str())
            .bind(ts.as_str()),
        }
        .bind(cycle_id)
        .bind(phase.as_str());

        let data = json!({ "attempt": current.retry_count + 1, "metadata": metadata });
        self.store
            .transaction(vec![update, event(cycle_id, phase.as_str(), "started", Some(&data), &now)])
            .await?;
        debug!(cycle_id, phase = %phase, "Phase started");
        Ok(())
    }

    /// Record intermediate counts while a phase is running.
    pub async fn update_phase_progress(
        &self,
        cycle_id: &str,
        phase: WorkflowPhase,
        counts: PhaseCounts,
        metadata: Option<Value>,
    ) -> Result<(), CoordinatorError> {
        let _guard = self.transitions.lock().await;
        let current = self.require_phase(cycle_id, phase).await?;
        check_transition(&current, &[PhaseStatus::Running], PhaseStatus::Running)?;

        let now = now_utc();
        let metadata = metadata.or(current.metadata);
        let update = Statement::new(
            "UPDATE workflow_tracking SET items_processed = ?, items_succeeded = ?, \
             items_failed = ?, metadata = ? WHERE cycle_id = ? AND phase = ?",
        )
        .bind(counts.processed)
        .bind(counts.succeeded)
        .bind(counts.failed)
        .bind(metadata.as_ref().map(Value::to_string))
        .bind(cycle_id)
        .bind(phase.as_str());

        let data = json!({
            "items_processed": counts.processed,
            "items_succeeded": counts.succeeded,
            "items_failed": counts.failed,
        });
        self.store
            .transaction(vec![update, event(cycle_id, phase.as_str(), "progress", Some(&data), &now)])
            .await?;
        Ok(())
    }

    /// running → retrying, bumping the retry counter.
    pub async fn retry_phase(
        &self,
        cycle_id: &str,
        phase: WorkflowPhase,
        error: &str,
    ) -> Result<u32, CoordinatorError> {
        let _guard = self.transitions.lock().await;
        let current = self.require_phase(cycle_id, phase).await?;
        check_transition(&current, &[PhaseStatus::Running], PhaseStatus::Retrying)?;

        let now = now_utc();
        let retry_count = current.retry_count + 1;
        let update = Statement::new(
            "UPDATE workflow_tracking SET status = ?, retry_count = ?, error_message = ? \
             WHERE cycle_id = ? AND phase = ?",
        )
        .bind(PhaseStatus::Retrying.as_str())
        .bind(retry_count)
        .bind(error)
        .bind(cycle_id)
        .bind(phase.as_str());

        let data = json!({ "retry_count": retry_count, "error": error });
        self.store
            .transaction(vec![update, event(cycle_id, phase.as_str(), "retry", Some(&data), &now)])
            .await?;
        warn!(cycle_id, phase = %phase, retry_count, error, "Phase retrying");
        Ok(retry_count)
    }

    /// running → completed | failed, and roll the phase's total into the cycle.
    pub async fn complete_phase(
        &self,
        cycle_id: &str,
        phase: WorkflowPhase,
        outcome: PhaseOutcome,
    ) -> Result<PhaseStatus, CoordinatorError> {
        let _guard = self.transitions.lock().await;
        let current = self.require_phase(cycle_id, phase).await?;
        let status = if outcome.success {
            PhaseStatus::Completed
        } else {
            PhaseStatus::Failed
        };
        check_transition(&current, &[PhaseStatus::Running], status)?;

        let now = now_utc();
        let duration = current
            .start_time
            .as_ref()
            .map(|start| seconds_between(start, &now));

        let total_column = cycle_total_column(phase);
        let metadata = match (outcome.metadata.or(current.metadata), total_column) {
            (Some(Value::Object(mut map)), Some(_)) => {
                map.insert("produced".into(), json!(outcome.produced));
                Some(Value::Object(map))
            }
            (None, Some(_)) => Some(json!({ "produced": outcome.produced })),
            (other, _) => other,
        };

        let mut stmts = vec![Statement::new(
            "UPDATE workflow_tracking SET status = ?, end_time = ?, duration_seconds = ?, \
             items_processed = ?, items_succeeded = ?, items_failed = ?, error_message = ?, \
             metadata = ? WHERE cycle_id = ? AND phase = ?",
        )
        .bind(status.as_str())
        .bind(to_timestamp(&now))
        .bind(duration)
        .bind(outcome.counts.processed)
        .bind(outcome.counts.succeeded)
        .bind(outcome.counts.failed)
        .bind(outcome.error.clone())
        .bind(metadata.as_ref().map(Value::to_string))
        .bind(cycle_id)
        .bind(phase.as_str())];

        if let Some(column) = total_column {
            stmts.push(
                Statement::new(format!(
                    "UPDATE trading_cycles SET {column} = ? WHERE cycle_id = ?"
                ))
                .bind(outcome.produced)
                .bind(cycle_id),
            );
        }

        let data = json!({
            "status": status,
            "duration_seconds": duration,
            "items_processed": outcome.counts.processed,
            "items_succeeded": outcome.counts.succeeded,
            "items_failed": outcome.counts.failed,
            "produced": outcome.produced,
            "error": outcome.error,
        });
        stmts.push(event(cycle_id, phase.as_str(), "completed", Some(&data), &now));

        self.store.transaction(stmts).await?;
        info!(
            cycle_id,
            phase = %phase,
            status = %status,
            processed = outcome.counts.processed,
            succeeded = outcome.counts.succeeded,
            failed = outcome.counts.failed,
            "Phase finished"
        );
        Ok(status)
    }

    /// Close the cycle from its persisted phase rows and return the summary.
    ///
    /// A cycle closes once; closing a finished cycle is an invalid transition
    /// and leaves its record untouched.
    pub async fn complete_cycle(
        &self,
        cycle_id: &str,
        aborted: bool,
    ) -> Result<CycleSummary, CoordinatorError> {
        let _guard = self.transitions.lock().await;
        let summary = self
            .summary(cycle_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("cycle {cycle_id}")))?;

        let (processed, succeeded) = summary.steps.iter().fold((0u64, 0u64), |(p, s), step| {
            (p + step.items_processed, s + step.items_succeeded)
        });
        let success_rate = if processed == 0 {
            0.0
        } else {
            succeeded as f64 / processed as f64
        };
        let error_count: u64 = summary
            .steps
            .iter()
            .map(|step| match step.status {
                PhaseStatus::Failed => 1,
                PhaseStatus::Completed => step.items_failed,
                _ => 0,
            })
            .sum();
        let status = if aborted {
            CycleStatus::Failed
        } else if error_count > 0 {
            CycleStatus::CompletedWithErrors
        } else {
            CycleStatus::Completed
        };
        if summary.cycle.status != CycleStatus::Running {
            return Err(CoordinatorError::InvalidCycleTransition {
                cycle_id: cycle_id.to_string(),
                from: summary.cycle.status,
                to: status,
            });
        }

        let now = now_utc();
        let duration = seconds_between(&summary.cycle.start_time, &now);
        let update = Statement::new(
            "UPDATE trading_cycles SET status = ?, end_time = ?, duration_seconds = ?, \
             error_count = ?, success_rate = ? WHERE cycle_id = ?",
        )
        .bind(status.as_str())
        .bind(to_timestamp(&now))
        .bind(duration)
        .bind(error_count)
        .bind(success_rate)
        .bind(cycle_id);

        let data = json!({
            "status": status,
            "duration_seconds": duration,
            "error_count": error_count,
            "success_rate": success_rate,
        });
        self.store
            .transaction(vec![
                update,
                event(cycle_id, WORKFLOW_EVENT_PHASE, "completed", Some(&data), &now),
            ])
            .await?;

        info!(
            cycle_id,
            status = %status,
            duration_secs = duration,
            error_count,
            success_rate,
            "Cycle finished"
        );

        self.summary(cycle_id)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("cycle {cycle_id}")))
    }

    pub async fn phase(
        &self,
        cycle_id: &str,
        phase: WorkflowPhase,
    ) -> Result<Option<PhaseRecord>, CoordinatorError> {
        let row = self
            .store
            .fetch_optional(
                Statement::new(format!(
                    "SELECT {PHASE_COLUMNS} FROM workflow_tracking WHERE cycle_id = ? AND phase = ?"
                ))
                .bind(cycle_id)
                .bind(phase.as_str()),
            )
            .await?;
        row.as_ref().map(phase_from_row).transpose()
    }

    async fn require_phase(
        &self,
        cycle_id: &str,
        phase: WorkflowPhase,
    ) -> Result<PhaseRecord, CoordinatorError> {
        self.phase(cycle_id, phase)
            .await?
            .ok_or_else(|| CoordinatorError::NotFound(format!("phase {phase} of cycle {cycle_id}")))
    }
}

fn check_transition(
    current: &PhaseRecord,
    allowed_from: &[PhaseStatus],
    to: PhaseStatus,
) -> Result<(), CoordinatorError> {
    if allowed_from.contains(&current.status) {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidTransition {
            cycle_id: current.cycle_id.clone(),
            phase: current.phase,
            from: current.status,
            to,
        })
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

pub(crate) const CYCLE_COLUMNS: &str = "cycle_id, status, start_time, end_time, duration_seconds, \
     securities_scanned, patterns_found, signals_generated, trades_executed, error_count, success_rate";

pub(crate) const PHASE_COLUMNS: &str = "cycle_id, phase, status, start_time, end_time, \
     duration_seconds, items_processed, items_succeeded, items_failed, retry_count, \
     error_message, metadata";

fn count(row: &SqliteRow, column: &str) -> Result<u64, CoordinatorError> {
    let value: i64 = row.try_get(column)?;
    u64::try_from(value).map_err(|_| CoordinatorError::Corrupt(format!("negative {column}: {value}")))
}

fn json_column(row: &SqliteRow, column: &str) -> Result<Option<Value>, CoordinatorError> {
    let raw: Option<String> = row.try_get(column)?;
    Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
}

pub(crate) fn cycle_from_row(row: &SqliteRow) -> Result<CycleRecord, CoordinatorError> {
    let status: String = row.try_get("status")?;
    let start: String = row.try_get("start_time")?;
    Ok(CycleRecord {
        cycle_id: row.try_get("cycle_id")?,
        status: status.parse()?,
        start_time: parse_timestamp(&start)?,
        end_time: parse_optional_timestamp(row.try_get("end_time")?)?,
        duration_seconds: row.try_get("duration_seconds")?,
        securities_scanned: count(row, "securities_scanned")?,
        patterns_found: count(row, "patterns_found")?,
        signals_generated: count(row, "signals_generated")?,
        trades_executed: count(row, "trades_executed")?,
        error_count: count(row, "error_count")?,
        success_rate: row.try_get("success_rate")?,
    })
}

pub(crate) fn phase_from_row(row: &SqliteRow) -> Result<PhaseRecord, CoordinatorError> {
    let phase: String = row.try_get("phase")?;
    let status: String = row.try_get("status")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(PhaseRecord {
        cycle_id: row.try_get("cycle_id")?,
        phase: phase.parse()?,
        status: status.parse()?,
        start_time: parse_optional_timestamp(row.try_get("start_time")?)?,
        end_time: parse_optional_timestamp(row.try_get("end_time")?)?,
        duration_seconds: row.try_get("duration_seconds")?,
        items_processed: count(row, "items_processed")?,
        items_succeeded: count(row, "items_succeeded")?,
        items_failed: count(row, "items_failed")?,
        retry_count: u32::try_from(retry_count)
            .map_err(|_| CoordinatorError::Corrupt(format!("bad retry_count: {retry_count}")))?,
        error_message: row.try_get("error_message")?,
        metadata: json_column(row, "metadata")?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

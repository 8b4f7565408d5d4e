//! Read side of the workflow store.
//!
//! Everything here is computed from persisted rows only, so a restarted
//! coordinator (or any other process with the database file) sees the
//! same history.

use serde::Serialize;
use sqlx::Row;

use super::{cycle_from_row, json_column, phase_from_row, WorkflowEngine, CYCLE_COLUMNS, PHASE_COLUMNS};
use crate::storage::Statement;
use crate::types::{
    parse_timestamp, CoordinatorError, CycleRecord, CycleStatus, CycleSummary, PhaseRecord,
    WorkflowEvent, WorkflowPhase,
};

/// Aggregate statistics for one phase across every recorded cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseStats {
    pub phase: WorkflowPhase,
    /// Phases that reached a terminal state.
    pub total_runs: u64,
    pub success_rate: f64,
    pub avg_duration_seconds: Option<f64>,
    pub min_duration_seconds: Option<f64>,
    pub max_duration_seconds: Option<f64>,
    pub avg_items_processed: f64,
}

impl WorkflowEngine {
    /// A cycle with its phases in execution order.
    pub async fn summary(&self, cycle_id: &str) -> Result<Option<CycleSummary>, CoordinatorError> {
        let Some(row) = self
            .store
            .fetch_optional(
                Statement::new(format!(
                    "SELECT {CYCLE_COLUMNS} FROM trading_cycles WHERE cycle_id = ?"
                ))
                .bind(cycle_id),
            )
            .await?
        else {
            return Ok(None);
        };
        let cycle = cycle_from_row(&row)?;

        let rows = self
            .store
            .fetch_all(
                Statement::new(format!(
                    "SELECT {PHASE_COLUMNS} FROM workflow_tracking WHERE cycle_id = ?"
                ))
                .bind(cycle_id),
            )
            .await?;
        let mut steps = rows
            .iter()
            .map(phase_from_row)
            .collect::<Result<Vec<PhaseRecord>, _>>()?;
        steps.sort_by_key(|s| s.phase.ordinal());

        Ok(Some(CycleSummary { cycle, steps }))
    }

    /// Most recent cycles first.
    pub async fn recent_cycles(&self, limit: u32) -> Result<Vec<CycleRecord>, CoordinatorError> {
        let rows = self
            .store
            .fetch_all(
                Statement::new(format!(
                    "SELECT {CYCLE_COLUMNS} FROM trading_cycles ORDER BY id DESC LIMIT ?"
                ))
                .bind(limit),
            )
            .await?;
        rows.iter().map(cycle_from_row).collect()
    }

    pub async fn latest_cycle(&self) -> Result<Option<CycleRecord>, CoordinatorError> {
        Ok(self.recent_cycles(1).await?.into_iter().next())
    }

    /// Cycles still marked running, oldest first.
    pub async fn active_cycles(&self) -> Result<Vec<CycleRecord>, CoordinatorError> {
        let rows = self
            .store
            .fetch_all(
                Statement::new(format!(
                    "SELECT {CYCLE_COLUMNS} FROM trading_cycles WHERE status = ? ORDER BY id"
                ))
                .bind(CycleStatus::Running.as_str()),
            )
            .await?;
        rows.iter().map(cycle_from_row).collect()
    }

    /// The event log of one cycle, in insertion order.
    pub async fn events(&self, cycle_id: &str) -> Result<Vec<WorkflowEvent>, CoordinatorError> {
        let rows = self
            .store
            .fetch_all(
                Statement::new(
                    "SELECT id, cycle_id, phase, event_type, event_data, timestamp \
                     FROM workflow_events WHERE cycle_id = ? ORDER BY id",
                )
                .bind(cycle_id),
            )
            .await?;

        rows.iter()
            .map(|row| {
                let timestamp: String = row.try_get("timestamp")?;
                Ok(WorkflowEvent {
                    id: row.try_get("id")?,
                    cycle_id: row.try_get("cycle_id")?,
                    phase: row.try_get("phase")?,
                    event_type: row.try_get("event_type")?,
                    event_data: json_column(row, "event_data")?,
                    timestamp: parse_timestamp(&timestamp)?,
                })
            })
            .collect()
    }

    /// Per-phase statistics over all finished phase runs.
    pub async fn phase_performance(&self) -> Result<Vec<PhaseStats>, CoordinatorError> {
        let rows = self
            .store
            .fetch_all(Statement::new(
                "SELECT phase, \
                        COUNT(*) AS total_runs, \
                        SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END) AS successes, \
                        AVG(duration_seconds) AS avg_duration, \
                        MIN(duration_seconds) AS min_duration, \
                        MAX(duration_seconds) AS max_duration, \
                        AVG(items_processed) AS avg_items \
                 FROM workflow_tracking \
                 WHERE status IN ('completed', 'failed') \
                 GROUP BY phase",
            ))
            .await?;

        let mut stats = Vec::with_capacity(rows.len());
        for row in &rows {
            let phase: String = row.try_get("phase")?;
            let total_runs: i64 = row.try_get("total_runs")?;
            let successes: i64 = row.try_get("successes")?;
            stats.push(PhaseStats {
                phase: phase.parse()?,
                total_runs: total_runs.max(0) as u64,
                success_rate: if total_runs > 0 {
                    successes as f64 / total_runs as f64
                } else {
                    0.0
                },
                avg_duration_seconds: row.try_get("avg_duration")?,
                min_duration_seconds: row.try_get("min_duration")?,
                max_duration_seconds: row.try_get("max_duration")?,
                avg_items_processed: row.try_get::<Option<f64>, _>("avg_items")?.unwrap_or(0.0),
            });
        }
        stats.sort_by_key(|s| s.phase.ordinal());
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use crate::types::{PhaseStatus, WorkflowPhase};
    use crate::workflow::tests::temp_engine;
    use crate::workflow::{PhaseCounts, PhaseOutcome, WorkflowEngine};

    async fn finished_cycle(engine: &WorkflowEngine, fail_patterns: bool) -> String {
        let cycle = engine.start_cycle().await.unwrap();
        for phase in WorkflowPhase::ALL {
            engine.start_phase(&cycle, phase, None).await.unwrap();
            let counts = PhaseCounts {
                processed: 4,
                succeeded: 4,
                failed: 0,
            };
            let outcome = if fail_patterns && phase == WorkflowPhase::PatternAnalysis {
                PhaseOutcome::failure("pattern service down", counts)
            } else {
                PhaseOutcome::success(counts, 4)
            };
            engine.complete_phase(&cycle, phase, outcome).await.unwrap();
        }
        engine.complete_cycle(&cycle, false).await.unwrap();
        cycle
    }

    #[tokio::test]
    async fn test_summary_of_unknown_cycle() {
        let (engine, _dir) = temp_engine().await;
        assert!(engine.summary("cycle_missing").await.unwrap().is_none());
        assert!(engine.latest_cycle().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recent_cycles_newest_first() {
        let (engine, _dir) = temp_engine().await;
        let first = engine.start_cycle().await.unwrap();
        let second = engine.start_cycle().await.unwrap();
        let third = engine.start_cycle().await.unwrap();

        let recent = engine.recent_cycles(2).await.unwrap();
        let ids: Vec<_> = recent.iter().map(|c| c.cycle_id.as_str()).collect();
        assert_eq!(ids, vec![third.as_str(), second.as_str()]);
        assert_eq!(engine.latest_cycle().await.unwrap().unwrap().cycle_id, third);
        assert_ne!(first, third);
    }

    #[tokio::test]
    async fn test_active_cycles() {
        let (engine, _dir) = temp_engine().await;
        let done = finished_cycle(&engine, false).await;
        let running = engine.start_cycle().await.unwrap();

        let active = engine.active_cycles().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].cycle_id, running);
        assert_ne!(active[0].cycle_id, done);
    }

    #[tokio::test]
    async fn test_history_survives_a_new_engine() {
        let (engine, _dir) = temp_engine().await;
        let cycle = finished_cycle(&engine, true).await;
        let before = engine.summary(&cycle).await.unwrap().unwrap();

        let fresh = WorkflowEngine::new(engine.store().clone());
        let after = fresh.summary(&cycle).await.unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(
            after.phase(WorkflowPhase::PatternAnalysis).unwrap().status,
            PhaseStatus::Failed
        );
        assert_eq!(fresh.events(&cycle).await.unwrap(), engine.events(&cycle).await.unwrap());
    }

    #[tokio::test]
    async fn test_events_are_ordered() {
        let (engine, _dir) = temp_engine().await;
        let cycle = finished_cycle(&engine, false).await;
        let events = engine.events(&cycle).await.unwrap();

        // started + (started, completed) per phase + completed
        assert_eq!(events.len(), 2 + 2 * WorkflowPhase::ALL.len());
        assert!(events.windows(2).all(|w| w[0].id < w[1].id));
        assert_eq!(events[0].event_type, "started");
        assert_eq!(events.last().unwrap().event_type, "completed");
    }

    #[tokio::test]
    async fn test_phase_performance() {
        let (engine, _dir) = temp_engine().await;
        finished_cycle(&engine, false).await;
        finished_cycle(&engine, true).await;

        let stats = engine.phase_performance().await.unwrap();
        assert_eq!(stats.len(), WorkflowPhase::ALL.len());
        assert_eq!(stats[0].phase, WorkflowPhase::Initialization);

        let pattern = stats
            .iter()
            .find(|s| s.phase == WorkflowPhase::PatternAnalysis)
            .unwrap();
        assert_eq!(pattern.total_runs, 2);
        assert!((pattern.success_rate - 0.5).abs() < 1e-9);
        assert!((pattern.avg_items_processed - 4.0).abs() < 1e-9);
        assert!(pattern.min_duration_seconds.unwrap() <= pattern.max_duration_seconds.unwrap());
    }
}

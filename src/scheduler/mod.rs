//! Trading schedule.
//!
//! Owns the singleton schedule row and triggers cycles on a fixed tick
//! when the schedule is enabled and due. Decisions are made and persisted
//! under the schedule lock; the cycle itself runs after the lock is
//! released, so a slow cycle never blocks config reads or updates.

pub mod policy;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::orchestrator::CycleOrchestrator;
use crate::storage::{Statement, Store};
use crate::types::{now_utc, to_timestamp, CoordinatorError, ScheduleConfig};
use policy::SchedulePolicy;

/// Partial schedule change; absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ScheduleUpdate {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<u32>,
    pub market_hours_only: Option<bool>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub timezone: Option<String>,
    pub excluded_days: Option<Vec<String>>,
}

impl ScheduleUpdate {
    fn apply(self, cfg: &mut ScheduleConfig) {
        if let Some(v) = self.enabled {
            cfg.enabled = v;
        }
        if let Some(v) = self.interval_minutes {
            cfg.interval_minutes = v;
        }
        if let Some(v) = self.market_hours_only {
            cfg.market_hours_only = v;
        }
        if let Some(v) = self.start_time {
            cfg.start_time = v;
        }
        if let Some(v) = self.end_time {
            cfg.end_time = v;
        }
        if let Some(v) = self.timezone {
            cfg.timezone = v;
        }
        if let Some(v) = self.excluded_days {
            cfg.excluded_days = v;
        }
    }
}

/// What one scheduler tick did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Disabled,
    NotDue {
        next_run: Option<DateTime<Utc>>,
    },
    SkippedOutsideWindow {
        next_run: DateTime<Utc>,
    },
    Triggered {
        /// Absent only if the cycle could not even be created.
        cycle_id: Option<String>,
        next_run: DateTime<Utc>,
    },
}

pub struct Scheduler {
    store: Store,
    orchestrator: Arc<CycleOrchestrator>,
    config: Mutex<ScheduleConfig>,
    tick: Duration,
}

impl Scheduler {
    /// Load the schedule row, inserting the default one on first start.
    pub async fn load(
        store: Store,
        orchestrator: Arc<CycleOrchestrator>,
        tick: Duration,
    ) -> Result<Self, CoordinatorError> {
        let row = store
            .fetch_optional(Statement::new(
                "SELECT config FROM trading_schedule_config WHERE id = 1",
            ))
            .await?;

        let config = match row {
            Some(row) => {
                let raw: String = row.try_get("config")?;
                serde_json::from_str(&raw)?
            }
            None => {
                let config = ScheduleConfig::default();
                persist(&store, &config).await?;
                info!("Created default trading schedule");
                config
            }
        };

        info!(
            enabled = config.enabled,
            interval_minutes = config.interval_minutes,
            next_run = ?config.next_run,
            "Schedule loaded"
        );
        Ok(Self {
            store,
            orchestrator,
            config: Mutex::new(config),
            tick,
        })
    }

    pub async fn config(&self) -> ScheduleConfig {
        self.config.lock().await.clone()
    }

    /// Validate and save a partial update. Enabling recomputes `next_run`
    /// from `now`; disabling clears it.
    pub async fn update(
        &self,
        update: ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<ScheduleConfig, CoordinatorError> {
        let mut current = self.config.lock().await;
        let mut next = current.clone();
        update.apply(&mut next);

        let policy = SchedulePolicy::from_config(&next)?;
        next.next_run = next.enabled.then(|| policy.next_run_after(now));

        persist(&self.store, &next).await?;
        *current = next.clone();
        info!(
            enabled = next.enabled,
            interval_minutes = next.interval_minutes,
            next_run = ?next.next_run,
            "Schedule updated"
        );
        Ok(next)
    }

    /// Switch the schedule on, applying any other fields of `settings` too.
    pub async fn enable(
        &self,
        settings: ScheduleUpdate,
        now: DateTime<Utc>,
    ) -> Result<ScheduleConfig, CoordinatorError> {
        self.update(
            ScheduleUpdate {
                enabled: Some(true),
                ..settings
            },
            now,
        )
        .await
    }

    pub async fn disable(&self, now: DateTime<Utc>) -> Result<ScheduleConfig, CoordinatorError> {
        self.update(
            ScheduleUpdate {
                enabled: Some(false),
                ..ScheduleUpdate::default()
            },
            now,
        )
        .await
    }

    /// A cycle was started by hand: stamp `last_run` and push `next_run`.
    pub async fn record_manual_run(&self, now: DateTime<Utc>) -> Result<(), CoordinatorError> {
        let mut current = self.config.lock().await;
        let mut next = current.clone();
        next.last_run = Some(now);
        if next.enabled {
            next.next_run = Some(SchedulePolicy::from_config(&next)?.next_run_after(now));
        }
        persist(&self.store, &next).await?;
        *current = next;
        Ok(())
    }

    /// Decide whether a cycle is due at `now` and, if so, run it.
    ///
    /// Cycle failures are logged and stay visible through the persisted
    /// cycle rows; only store failures are returned.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome, CoordinatorError> {
        let next_run = {
            let mut current = self.config.lock().await;
            if !current.enabled {
                return Ok(TickOutcome::Disabled);
            }
            if let Some(due) = current.next_run {
                if now < due {
                    return Ok(TickOutcome::NotDue {
                        next_run: Some(due),
                    });
                }
            }

            let policy = SchedulePolicy::from_config(&current)?;
            let mut next = current.clone();
            let next_run = policy.next_run_after(now);
            next.next_run = Some(next_run);

            if policy.market_hours_only() && !policy.in_window(now) {
                persist(&self.store, &next).await?;
                *current = next;
                debug!(next_run = %next_run, "Outside market hours, cycle skipped");
                return Ok(TickOutcome::SkippedOutsideWindow { next_run });
            }

            next.last_run = Some(now);
            persist(&self.store, &next).await?;
            *current = next;
            next_run
        };

        info!(next_run = %next_run, "Scheduled cycle starting");
        let cycle_id = match self.orchestrator.run_cycle().await {
            Ok(summary) => {
                info!(
                    cycle_id = %summary.cycle.cycle_id,
                    status = %summary.cycle.status,
                    "Scheduled cycle finished"
                );
                Some(summary.cycle.cycle_id)
            }
            Err(CoordinatorError::CycleAborted { cycle_id, source }) => {
                error!(cycle_id = %cycle_id, error = %source, "Scheduled cycle aborted");
                Some(cycle_id)
            }
            Err(e) => {
                error!(error = %e, "Scheduled cycle could not start");
                None
            }
        };
        Ok(TickOutcome::Triggered { cycle_id, next_run })
    }

    /// Tick on a fixed interval until `shutdown` flips to true.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            info!(tick_secs = self.tick.as_secs(), "Scheduler started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.tick(now_utc()).await {
                            Ok(outcome) => debug!(?outcome, "Scheduler tick"),
                            Err(e) => error!(error = %e, "Scheduler tick failed"),
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Scheduler stopped");
        })
    }
}

async fn persist(store: &Store, config: &ScheduleConfig) -> Result<(), CoordinatorError> {
    let json = serde_json::to_string(config)?;
    store
        .execute(
            Statement::new(
                "INSERT INTO trading_schedule_config (id, config, updated_at) VALUES (1, ?, ?) \
                 ON CONFLICT(id) DO UPDATE SET config = excluded.config, updated_at = excluded.updated_at",
            )
            .bind(json)
            .bind(to_timestamp(&now_utc())),
        )
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

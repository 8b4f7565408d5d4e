//! Table definitions.
//!
//! Applied idempotently on every open, in one transaction.

use tracing::debug;

use super::{Statement, Store};
use crate::types::CoordinatorError;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS service_coordination (
        service_name TEXT PRIMARY KEY,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'active',
        last_heartbeat TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trading_schedule_config (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        config TEXT NOT NULL,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS trading_cycles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cycle_id TEXT UNIQUE NOT NULL,
        status TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        duration_seconds REAL,
        securities_scanned INTEGER NOT NULL DEFAULT 0,
        patterns_found INTEGER NOT NULL DEFAULT 0,
        signals_generated INTEGER NOT NULL DEFAULT 0,
        trades_executed INTEGER NOT NULL DEFAULT 0,
        error_count INTEGER NOT NULL DEFAULT 0,
        success_rate REAL NOT NULL DEFAULT 0.0,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_tracking (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cycle_id TEXT NOT NULL REFERENCES trading_cycles(cycle_id),
        phase TEXT NOT NULL,
        status TEXT NOT NULL,
        start_time TEXT,
        end_time TEXT,
        duration_seconds REAL,
        items_processed INTEGER NOT NULL DEFAULT 0,
        items_succeeded INTEGER NOT NULL DEFAULT 0,
        items_failed INTEGER NOT NULL DEFAULT 0,
        error_message TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        metadata TEXT,
        UNIQUE(cycle_id, phase)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        cycle_id TEXT NOT NULL,
        phase TEXT NOT NULL,
        event_type TEXT NOT NULL,
        event_data TEXT,
        timestamp TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_cycle ON workflow_tracking(cycle_id)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_phase ON workflow_tracking(phase)",
    "CREATE INDEX IF NOT EXISTS idx_events_cycle ON workflow_events(cycle_id)",
    "CREATE INDEX IF NOT EXISTS idx_cycles_status ON trading_cycles(status)",
];

pub(crate) async fn migrate(store: &Store) -> Result<(), CoordinatorError> {
    let stmts = TABLES.iter().map(|sql| Statement::new(*sql)).collect();
    store.transaction(stmts).await?;
    debug!(tables = TABLES.len(), "Schema applied");
    Ok(())
}

//! Shared types for the coordinator.
//!
//! These types form the data model used across all modules: registry
//! records, the workflow's cycle/phase/event records, the schedule
//! singleton, and the crate-wide error enum.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Render a timestamp the way it is persisted: RFC 3339, UTC, microseconds.
///
/// The fixed width keeps stored timestamps lexicographically ordered.
pub fn to_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time at the precision timestamps are stored with.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Parse a persisted timestamp back into UTC.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, CoordinatorError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CoordinatorError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

pub(crate) fn parse_optional_timestamp(
    s: Option<String>,
) -> Result<Option<DateTime<Utc>>, CoordinatorError> {
    s.as_deref().map(parse_timestamp).transpose()
}

/// Implements `as_str`, `Display` and `FromStr` for a fieldless status enum
/// from a single table of (variant, persisted name) pairs.
macro_rules! string_enum {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = CoordinatorError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(CoordinatorError::Corrupt(format!(
                        concat!("unknown ", stringify!($ty), ": {:?}"),
                        other
                    ))),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Service registry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Active,
    Inactive,
}

string_enum!(ServiceStatus {
    Active => "active",
    Inactive => "inactive",
});

/// A worker service known to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: ServiceStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl ServiceRecord {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn is_active(&self) -> bool {
        self.status == ServiceStatus::Active
    }
}

/// An entry of the static worker catalog used for auto-discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownService {
    pub name: String,
    pub port: u16,
}

impl KnownService {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// The fixed, ordered stages of a trading cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Initialization,
    SecuritySelection,
    PatternAnalysis,
    SignalGeneration,
    TradeExecution,
    Completion,
}

string_enum!(WorkflowPhase {
    Initialization => "initialization",
    SecuritySelection => "security_selection",
    PatternAnalysis => "pattern_analysis",
    SignalGeneration => "signal_generation",
    TradeExecution => "trade_execution",
    Completion => "completion",
});

impl WorkflowPhase {
    /// Every phase, in execution order.
    pub const ALL: [WorkflowPhase; 6] = [
        WorkflowPhase::Initialization,
        WorkflowPhase::SecuritySelection,
        WorkflowPhase::PatternAnalysis,
        WorkflowPhase::SignalGeneration,
        WorkflowPhase::TradeExecution,
        WorkflowPhase::Completion,
    ];

    /// Position in the execution order.
    pub fn ordinal(&self) -> usize {
        Self::ALL
            .iter()
            .position(|p| p == self)
            .unwrap_or(Self::ALL.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

string_enum!(PhaseStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
    Retrying => "retrying",
});

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

string_enum!(CycleStatus {
    Running => "running",
    Completed => "completed",
    CompletedWithErrors => "completed_with_errors",
    Failed => "failed",
});

/// One end-to-end execution of the phase pipeline, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle_id: String,
    pub status: CycleStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub securities_scanned: u64,
    pub patterns_found: u64,
    pub signals_generated: u64,
    pub trades_executed: u64,
    pub error_count: u64,
    pub success_rate: f64,
}

/// Progress and outcome of one phase within a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub cycle_id: String,
    pub phase: WorkflowPhase,
    pub status: PhaseStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub id: i64,
    pub cycle_id: String,
    /// A phase name, or `workflow` for cycle-level events.
    pub phase: String,
    pub event_type: String,
    pub event_data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// A cycle together with its phase records, in phase order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSummary {
    #[serde(flatten)]
    pub cycle: CycleRecord,
    pub steps: Vec<PhaseRecord>,
}

impl CycleSummary {
    pub fn phase(&self, phase: WorkflowPhase) -> Option<&PhaseRecord> {
        self.steps.iter().find(|p| p.phase == phase)
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

/// The singleton trading schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub interval_minutes: u32,
    pub market_hours_only: bool,
    /// Local market open, `HH:MM`.
    pub start_time: String,
    /// Local market close, `HH:MM`.
    pub end_time: String,
    /// IANA time zone name the window is expressed in.
    pub timezone: String,
    pub excluded_days: Vec<String>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            market_hours_only: true,
            start_time: "09:30".to_string(),
            end_time: "16:00".to_string(),
            timezone: "America/New_York".to_string(),
            excluded_days: vec!["Saturday".to_string(), "Sunday".to_string()],
            last_run: None,
            next_run: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain-specific error types for the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Store busy during {operation}")]
    TransientStoreContention { operation: String },

    #[error("Store failure during {operation} after {attempts} attempts: {source}")]
    PersistentStoreFailure {
        operation: String,
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("Service {service} unavailable: {reason}")]
    DownstreamUnavailable { service: String, reason: String },

    #[error("Service {service} error: {message}")]
    DownstreamError { service: String, message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Cannot move {phase} of {cycle_id} from {from} to {to}")]
    InvalidTransition {
        cycle_id: String,
        phase: WorkflowPhase,
        from: PhaseStatus,
        to: PhaseStatus,
    },

    #[error("Cannot move cycle {cycle_id} from {from} to {to}")]
    InvalidCycleTransition {
        cycle_id: String,
        from: CycleStatus,
        to: CycleStatus,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cycle {cycle_id} aborted: {source}")]
    CycleAborted {
        cycle_id: String,
        #[source]
        source: Box<CoordinatorError>,
    },
}

impl CoordinatorError {
    /// Failures caused by a worker rather than by the coordinator itself.
    pub fn is_downstream(&self) -> bool {
        matches!(
            self,
            CoordinatorError::DownstreamUnavailable { .. } | CoordinatorError::DownstreamError { .. }
        )
    }

    pub fn unavailable(service: &str, reason: impl Into<String>) -> Self {
        CoordinatorError::DownstreamUnavailable {
            service: service.to_string(),
            reason: reason.into(),
        }
    }

    pub fn downstream(service: &str, message: impl Into<String>) -> Self {
        CoordinatorError::DownstreamError {
            service: service.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section and key has a default, so a partial file (or none, in tests)
//! still yields a runnable configuration.

use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

use crate::types::{KnownService, WorkflowPhase};

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub registry: RegistryConfig,
    pub workflow: WorkflowConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
        }
    }
}

/// SQLite store settings, including the contention retry budget.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    /// Upper bound on waiting for a pooled connection.
    pub connect_timeout_secs: u64,
    /// SQLite's own busy handler; kept short so the retry layer sees contention.
    pub busy_timeout_ms: u64,
    /// Total attempts per store call, first try included.
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "trading_system.db".to_string(),
            max_connections: 5,
            connect_timeout_secs: 30,
            busy_timeout_ms: 1000,
            max_retries: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 2000,
            jitter_ms: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RegistryConfig {
    /// Host assumed for catalog services and registrations without a host.
    pub default_host: String,
    pub probe_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    /// Static catalog of worker name -> default port, used for auto-discovery.
    pub known_services: BTreeMap<String, u16>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        let known_services = [
            ("scanner", 5001),
            ("pattern", 5002),
            ("technical", 5003),
            ("trading", 5005),
            ("pattern_rec", 5006),
            ("news", 5008),
            ("reporting", 5009),
            ("dashboard", 5010),
        ]
        .into_iter()
        .map(|(name, port)| (name.to_string(), port))
        .collect();

        Self {
            default_host: "localhost".to_string(),
            probe_timeout_secs: 2,
            health_check_interval_secs: 30,
            known_services,
        }
    }
}

impl RegistryConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// The auto-discovery catalog, ordered by name.
    pub fn catalog(&self) -> Vec<KnownService> {
        self.known_services
            .iter()
            .map(|(name, port)| KnownService::new(name.as_str(), *port))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkflowConfig {
    /// How many of the scanned securities are carried through a cycle.
    pub batch_size: usize,
    pub phase_timeout_secs: u64,
    pub max_phase_retries: u32,
    pub phase_retry_delay_ms: u64,
    /// When false, cycle starts queue behind the one in flight.
    pub allow_concurrent_cycles: bool,
    pub workers: PhaseWorkers,
    pub failure_policy: FailurePolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            phase_timeout_secs: 30,
            max_phase_retries: 2,
            phase_retry_delay_ms: 1000,
            allow_concurrent_cycles: false,
            workers: PhaseWorkers::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout_secs)
    }

    pub fn phase_retry_delay(&self) -> Duration {
        Duration::from_millis(self.phase_retry_delay_ms)
    }
}

/// Registry names of the workers responsible for each remote phase.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PhaseWorkers {
    pub security_selection: String,
    pub pattern_analysis: String,
    pub signal_generation: String,
    pub trade_execution: String,
}

impl Default for PhaseWorkers {
    fn default() -> Self {
        Self {
            security_selection: "scanner".to_string(),
            pattern_analysis: "pattern".to_string(),
            signal_generation: "technical".to_string(),
            trade_execution: "trading".to_string(),
        }
    }
}

impl PhaseWorkers {
    /// Worker for a phase; `None` for the coordinator-local phases.
    pub fn for_phase(&self, phase: WorkflowPhase) -> Option<&str> {
        match phase {
            WorkflowPhase::SecuritySelection => Some(&self.security_selection),
            WorkflowPhase::PatternAnalysis => Some(&self.pattern_analysis),
            WorkflowPhase::SignalGeneration => Some(&self.signal_generation),
            WorkflowPhase::TradeExecution => Some(&self.trade_execution),
            WorkflowPhase::Initialization | WorkflowPhase::Completion => None,
        }
    }
}

/// What a phase failure does to the rest of the cycle.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Abort,
    Continue,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FailurePolicy {
    pub security_selection: OnFailure,
    pub pattern_analysis: OnFailure,
    pub signal_generation: OnFailure,
    pub trade_execution: OnFailure,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            security_selection: OnFailure::Abort,
            pattern_analysis: OnFailure::Continue,
            signal_generation: OnFailure::Continue,
            trade_execution: OnFailure::Continue,
        }
    }
}

impl FailurePolicy {
    pub fn on_failure(&self, phase: WorkflowPhase) -> OnFailure {
        match phase {
            WorkflowPhase::SecuritySelection => self.security_selection,
            WorkflowPhase::PatternAnalysis => self.pattern_analysis,
            WorkflowPhase::SignalGeneration => self.signal_generation,
            WorkflowPhase::TradeExecution => self.trade_execution,
            WorkflowPhase::Initialization | WorkflowPhase::Completion => OnFailure::Continue,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_secs: 60 }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        Self::from_toml(&contents).with_context(|| format!("Failed to parse config file: {path}"))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot work with. Timer periods must be
    /// non-zero: `tokio::time::interval` panics on a zero period.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("registry.health_check_interval_secs", self.registry.health_check_interval_secs),
            ("registry.probe_timeout_secs", self.registry.probe_timeout_secs),
            ("workflow.phase_timeout_secs", self.workflow.phase_timeout_secs),
            ("scheduler.tick_secs", self.scheduler.tick_secs),
            ("database.connect_timeout_secs", self.database.connect_timeout_secs),
        ];
        for (key, value) in positive {
            ensure!(value > 0, "{key} must be greater than zero");
        }
        ensure!(
            self.database.max_connections > 0,
            "database.max_connections must be greater than zero"
        );
        ensure!(
            self.database.max_retries > 0,
            "database.max_retries must be at least 1"
        );
        ensure!(self.workflow.batch_size > 0, "workflow.batch_size must be greater than zero");
        Ok(())
    }
}

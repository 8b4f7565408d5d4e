//! Service registry.
//!
//! Maps worker name -> `{host, port, status, last_heartbeat}`. The
//! persisted `service_coordination` table is the source of truth; the
//! in-memory map is a cache rebuilt from it on startup. Every mutation
//! holds the registry mutex across the persist step, so an API
//! registration and a health-monitor tick can never interleave.

pub mod monitor;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::storage::{Statement, Store};
use crate::types::{
    now_utc, parse_optional_timestamp, to_timestamp, CoordinatorError, KnownService, ServiceRecord,
    ServiceStatus,
};

// ---------------------------------------------------------------------------
// Health probing
// ---------------------------------------------------------------------------

/// Liveness check against a worker's health endpoint.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// True only for a success response within the probe timeout.
    async fn probe(&self, host: &str, port: u16) -> bool;
}

/// Probes `GET http://{host}:{port}/health`.
pub struct HttpHealthProbe {
    http: Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, CoordinatorError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoordinatorError::Configuration(format!("health probe client: {e}")))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, host: &str, port: u16) -> bool {
        let url = format!("http://{host}:{port}/health");
        match self.http.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(url = %url, error = %e, "Health probe failed");
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Status view
// ---------------------------------------------------------------------------

/// One row of the `/service_status` listing.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatusEntry {
    pub name: String,
    pub url: String,
    pub port: u16,
    pub registered: bool,
    pub status: ServiceStatus,
    pub healthy: bool,
    pub last_heartbeat: Option<String>,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ServiceRegistry {
    store: Store,
    probe: Arc<dyn HealthProbe>,
    default_host: String,
    services: Mutex<HashMap<String, ServiceRecord>>,
}

impl ServiceRegistry {
    /// Rebuild the registry from the persisted table alone.
    pub async fn load(
        store: Store,
        probe: Arc<dyn HealthProbe>,
        default_host: impl Into<String>,
    ) -> Result<Self, CoordinatorError> {
        let rows = store
            .fetch_all(Statement::new(
                "SELECT service_name, host, port, status, last_heartbeat FROM service_coordination",
            ))
            .await?;

        let mut services = HashMap::with_capacity(rows.len());
        for row in rows {
            let port: i64 = row.try_get("port")?;
            let status: String = row.try_get("status")?;
            let record = ServiceRecord {
                name: row.try_get("service_name")?,
                host: row.try_get("host")?,
                port: u16::try_from(port)
                    .map_err(|_| CoordinatorError::Corrupt(format!("port out of range: {port}")))?,
                status: status.parse()?,
                last_heartbeat: parse_optional_timestamp(row.try_get("last_heartbeat")?)?,
            };
            services.insert(record.name.clone(), record);
        }

        info!(count = services.len(), "Loaded service registry from store");
        Ok(Self {
            store,
            probe,
            default_host: default_host.into(),
            services: Mutex::new(services),
        })
    }

    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    /// Upsert a worker as active with a fresh heartbeat.
    pub async fn register(
        &self,
        name: &str,
        host: Option<&str>,
        port: u16,
    ) -> Result<ServiceRecord, CoordinatorError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(CoordinatorError::Configuration("service_name is required".into()));
        }
        if port == 0 {
            return Err(CoordinatorError::Configuration("port must be non-zero".into()));
        }
        let host = host
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .unwrap_or(&self.default_host);

        let record = ServiceRecord {
            name: name.to_string(),
            host: host.to_string(),
            port,
            status: ServiceStatus::Active,
            last_heartbeat: Some(now_utc()),
        };

        let mut services = self.services.lock().await;
        self.persist(&record).await?;
        services.insert(record.name.clone(), record.clone());
        drop(services);

        info!(service = %record.name, url = %record.url(), "Registered service");
        Ok(record)
    }

    pub async fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.services.lock().await.get(name).cloned()
    }

    /// All records, sorted by name.
    pub async fn all(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<_> = self.services.lock().await.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub async fn len(&self) -> usize {
        self.services.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Apply a probe result: active with a new heartbeat, or inactive.
    ///
    /// Unknown names are ignored; records are never removed.
    pub async fn record_probe(
        &self,
        name: &str,
        healthy: bool,
    ) -> Result<Option<ServiceRecord>, CoordinatorError> {
        self.apply_probe(name, healthy, None).await
    }

    /// Apply a result for a probe made against `snapshot`, unless the record
    /// was re-registered or heartbeated since. Returns `None` when skipped.
    pub async fn record_probe_for(
        &self,
        snapshot: &ServiceRecord,
        healthy: bool,
    ) -> Result<Option<ServiceRecord>, CoordinatorError> {
        self.apply_probe(&snapshot.name, healthy, Some(snapshot)).await
    }

    async fn apply_probe(
        &self,
        name: &str,
        healthy: bool,
        snapshot: Option<&ServiceRecord>,
    ) -> Result<Option<ServiceRecord>, CoordinatorError> {
        let mut services = self.services.lock().await;
        let Some(current) = services.get(name) else {
            return Ok(None);
        };
        if let Some(seen) = snapshot {
            let unchanged = current.host == seen.host
                && current.port == seen.port
                && current.last_heartbeat == seen.last_heartbeat;
            if !unchanged {
                debug!(service = name, healthy, "Record changed during probe, result dropped");
                return Ok(None);
            }
        }

        let mut updated = current.clone();
        if healthy {
            updated.status = ServiceStatus::Active;
            updated.last_heartbeat = Some(now_utc());
        } else {
            updated.status = ServiceStatus::Inactive;
        }

        self.store
            .execute(
                Statement::new(
                    "UPDATE service_coordination SET status = ?, last_heartbeat = ?, updated_at = ? \
                     WHERE service_name = ?",
                )
                .bind(updated.status.as_str())
                .bind(updated.last_heartbeat.as_ref().map(to_timestamp))
                .bind(to_timestamp(&now_utc()))
                .bind(name),
            )
            .await?;

        if current.status != updated.status {
            info!(service = name, status = %updated.status, "Service status changed");
        }
        services.insert(name.to_string(), updated.clone());
        Ok(Some(updated))
    }

    /// Registered, health-checked worker for a phase call.
    pub async fn resolve(&self, name: &str) -> Result<ServiceRecord, CoordinatorError> {
        let record = self
            .get(name)
            .await
            .ok_or_else(|| CoordinatorError::unavailable(name, "not registered"))?;

        let healthy = self.probe.probe(&record.host, record.port).await;
        let record = self.record_probe(name, healthy).await?.unwrap_or(record);
        if healthy {
            Ok(record)
        } else {
            Err(CoordinatorError::unavailable(name, "health check failed"))
        }
    }

    /// Probe every catalog entry that is not registered yet and register the
    /// healthy ones. Returns the names that were added.
    pub async fn auto_discover(
        &self,
        catalog: &[KnownService],
    ) -> Result<Vec<String>, CoordinatorError> {
        let mut added = Vec::new();
        for known in catalog {
            if self.get(&known.name).await.is_some() {
                continue;
            }
            if self.probe.probe(&self.default_host, known.port).await {
                self.register(&known.name, None, known.port).await?;
                added.push(known.name.clone());
            }
        }
        if !added.is_empty() {
            info!(services = ?added, "Auto-discovered services");
        }
        Ok(added)
    }

    /// Re-register every healthy catalog entry at its catalog port. Entries
    /// already registered keep their host.
    pub async fn force_register_all(
        &self,
        catalog: &[KnownService],
    ) -> Result<Vec<String>, CoordinatorError> {
        let mut registered = Vec::new();
        for known in catalog {
            let host = self
                .get(&known.name)
                .await
                .map(|r| r.host)
                .unwrap_or_else(|| self.default_host.clone());
            if self.probe.probe(&host, known.port).await {
                self.register(&known.name, Some(&host), known.port).await?;
                registered.push(known.name.clone());
            } else {
                debug!(service = %known.name, host = %host, port = known.port, "Not responding, skipped");
            }
        }
        Ok(registered)
    }

    /// Live view for `/service_status`: discovers the catalog, then probes
    /// and records every registered worker.
    pub async fn service_status(
        &self,
        catalog: &[KnownService],
    ) -> Result<Vec<ServiceStatusEntry>, CoordinatorError> {
        self.auto_discover(catalog).await?;

        let mut entries = Vec::new();
        for record in self.all().await {
            let healthy = self.probe.probe(&record.host, record.port).await;
            let record = match self.record_probe(&record.name, healthy).await {
                Ok(Some(updated)) => updated,
                Ok(None) => record,
                Err(e) => {
                    warn!(service = %record.name, error = %e, "Could not persist probe result");
                    record
                }
            };
            entries.push(ServiceStatusEntry {
                name: record.name.clone(),
                url: record.url(),
                port: record.port,
                registered: true,
                status: record.status,
                healthy,
                last_heartbeat: record.last_heartbeat.as_ref().map(to_timestamp),
            });
        }
        Ok(entries)
    }

    async fn persist(&self, record: &ServiceRecord) -> Result<(), CoordinatorError> {
        let now = to_timestamp(&now_utc());
        self.store
            .execute(
                Statement::new(
                    "INSERT INTO service_coordination \
                     (service_name, host, port, status, last_heartbeat, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?) \
                     ON CONFLICT(service_name) DO UPDATE SET \
                     host = excluded.host, port = excluded.port, status = excluded.status, \
                     last_heartbeat = excluded.last_heartbeat, updated_at = excluded.updated_at",
                )
                .bind(record.name.as_str())
                .bind(record.host.as_str())
                .bind(record.port)
                .bind(record.status.as_str())
                .bind(record.last_heartbeat.as_ref().map(to_timestamp))
                .bind(now.as_str())
                .bind(now.as_str()),
            )
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Persistence layer.
//!
//! A single SQLite file opened in WAL mode (many readers, one writer) with
//! foreign keys enforced. All access goes through [`Store`], whose calls
//! are wrapped in the contention retry of [`retry`]; components never open
//! their own connections.

pub mod retry;
pub mod schema;

use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::DatabaseConfig;
use crate::types::CoordinatorError;
use retry::{retry_on_contention, RetryError, RetryPolicy};

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> Self {
        SqlValue::Integer(v as i64)
    }
}

impl From<u32> for SqlValue {
    fn from(v: u32) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<u16> for SqlValue {
    fn from(v: u16) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Integer(i64::from(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Real(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// One SQL statement with its positional parameters.
#[derive(Debug, Clone)]
pub struct Statement {
    sql: Cow<'static, str>,
    params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(sql: impl Into<Cow<'static, str>>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    fn query(&self) -> Query<'_, Sqlite, SqliteArguments<'_>> {
        self.params
            .iter()
            .fold(sqlx::query(&self.sql), |q, param| match param {
                SqlValue::Null => q.bind(None::<i64>),
                SqlValue::Integer(v) => q.bind(*v),
                SqlValue::Real(v) => q.bind(*v),
                SqlValue::Text(v) => q.bind(v.as_str()),
            })
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Retry-protected handle to the shared SQLite store. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl Store {
    /// Open (creating if needed) the database file and apply the schema.
    pub async fn open(cfg: &DatabaseConfig) -> Result<Self, CoordinatorError> {
        let options = SqliteConnectOptions::new()
            .filename(&cfg.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(cfg.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(cfg.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            retry: RetryPolicy::from(cfg),
        };
        schema::migrate(&store).await?;

        info!(path = %cfg.path, "Store opened (WAL, foreign keys on)");
        Ok(store)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Run one statement, returning the number of affected rows.
    pub async fn execute(&self, stmt: Statement) -> Result<u64, CoordinatorError> {
        let pool = &self.pool;
        let stmt = &stmt;
        let result = retry_on_contention(&self.retry, stmt.sql(), move || async move {
            stmt.query().execute(pool).await.map(|r| r.rows_affected())
        })
        .await;
        self.finish("execute", result)
    }

    /// Run statements atomically; any failure rolls back all of them.
    ///
    /// Returns the affected-row count of each statement, in order.
    pub async fn transaction(&self, stmts: Vec<Statement>) -> Result<Vec<u64>, CoordinatorError> {
        let pool = &self.pool;
        let stmts = &stmts;
        let result = retry_on_contention(&self.retry, "transaction", move || async move {
            let mut tx = pool.begin().await?;
            let mut affected = Vec::with_capacity(stmts.len());
            for stmt in stmts {
                let done = stmt.query().execute(&mut *tx).await?;
                affected.push(done.rows_affected());
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(affected)
        })
        .await;
        debug!(statements = stmts.len(), ok = result.is_ok(), "Transaction finished");
        self.finish("transaction", result)
    }

    pub async fn fetch_all(&self, stmt: Statement) -> Result<Vec<SqliteRow>, CoordinatorError> {
        let pool = &self.pool;
        let stmt = &stmt;
        let result = retry_on_contention(&self.retry, stmt.sql(), move || async move {
            stmt.query().fetch_all(pool).await
        })
        .await;
        self.finish("fetch_all", result)
    }

    pub async fn fetch_optional(&self, stmt: Statement) -> Result<Option<SqliteRow>, CoordinatorError> {
        let pool = &self.pool;
        let stmt = &stmt;
        let result = retry_on_contention(&self.retry, stmt.sql(), move || async move {
            stmt.query().fetch_optional(pool).await
        })
        .await;
        self.finish("fetch_optional", result)
    }

    /// Fold the write-ahead log back into the main database file.
    pub async fn checkpoint(&self) -> Result<(), CoordinatorError> {
        self.fetch_optional(Statement::new("PRAGMA wal_checkpoint(TRUNCATE)"))
            .await
            .map(|_| ())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn finish<T>(
        &self,
        operation: &str,
        result: Result<T, RetryError<sqlx::Error>>,
    ) -> Result<T, CoordinatorError> {
        match result {
            Ok(value) => Ok(value),
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(operation, attempts, error = %last, "Store still busy after retry budget");
                Err(CoordinatorError::PersistentStoreFailure {
                    operation: operation.to_string(),
                    attempts,
                    source: last,
                })
            }
            Err(RetryError::Fatal(e)) => Err(CoordinatorError::Store(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

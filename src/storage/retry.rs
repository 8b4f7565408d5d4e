//! Contention retry with exponential backoff.
//!
//! SQLite allows a single writer at a time; a second writer gets
//! `SQLITE_BUSY` once its busy handler gives up. Every store call is
//! routed through [`retry_on_contention`], which retries those errors
//! with capped exponential backoff plus jitter and lets every other error
//! through on the first failure.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::DatabaseConfig;
use crate::types::CoordinatorError;

/// SQLite primary/extended result codes that mean "another connection holds the lock".
const CONTENTION_CODES: &[&str] = &["5", "6", "261", "262", "517"];

/// Errors that can tell whether they were caused by lock contention.
pub trait Contention {
    fn is_contention(&self) -> bool;
}

impl Contention for sqlx::Error {
    fn is_contention(&self) -> bool {
        match self {
            sqlx::Error::Database(db) => {
                let by_code = db
                    .code()
                    .map(|code| CONTENTION_CODES.contains(&code.as_ref()))
                    .unwrap_or(false);
                let message = db.message();
                by_code
                    || message.contains("database is locked")
                    || message.contains("database table is locked")
            }
            sqlx::Error::PoolTimedOut => true,
            _ => false,
        }
    }
}

/// Backoff schedule for contended store calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, first try included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&DatabaseConfig::default())
    }
}

impl From<&DatabaseConfig> for RetryPolicy {
    fn from(cfg: &DatabaseConfig) -> Self {
        Self {
            max_attempts: cfg.max_retries.max(1),
            base_delay: Duration::from_millis(cfg.base_backoff_ms),
            max_delay: Duration::from_millis(cfg.max_backoff_ms),
            max_jitter: Duration::from_millis(cfg.jitter_ms),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(retry) + Duration::from_millis(jitter)
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// Still contended after the whole budget.
    Exhausted { attempts: u32, last: E },
    /// A non-contention error; not retried.
    Fatal(E),
}

/// Run `op` until it succeeds, fails with a non-contention error, or the
/// attempt budget is spent.
pub async fn retry_on_contention<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: Contention + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Store call succeeded after contention");
                }
                return Ok(value);
            }
            Err(e) if !e.is_contention() => return Err(RetryError::Fatal(e)),
            Err(e) if attempt >= policy.max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: e,
                });
            }
            Err(e) => {
                let delay = policy.jittered(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %busy_error(operation),
                    cause = %e,
                    "Backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// The error a contended attempt stands for; logged, never returned.
fn busy_error(operation: &str) -> CoordinatorError {
    CoordinatorError::TransientStoreContention {
        operation: operation.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Conflict retries for read-modify-write cycles against the API server.
//!
//! [`retry_on_conflict`] retries only optimistic concurrency conflicts. The
//! operation re-reads the object and recomputes its change on every attempt;
//! a stale write is never replayed.
//!
//! # Example
//!
//! ```ignore
//! use slurm_common::retry::{retry_on_conflict, RetryConfig};
//!
//! retry_on_conflict(&RetryConfig::conflict(), "update_status", || async move {
//!     let fresh = kube.get_cluster(ns, name).await?;
//!     kube.patch_cluster_status(&fresh, &status).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::Error;

/// Attempt budget and delays for conflict retries
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = unbounded)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Bounded fixed backoff for write conflicts: 5 attempts, 10ms apart
    pub fn conflict() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 1.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }
}

fn jittered(delay: Duration) -> Duration {
    // 0.5x to 1.5x of the delay
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter)
}

/// Execute an async read-modify-write, retrying only on conflicts.
///
/// Any non-conflict error is returned immediately. When the attempt budget
/// runs out the last conflict is returned.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_conflict() && !config.exhausted(attempt) => {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Write conflict, retrying with fresh object"
                );
                tokio::time::sleep(jittered(delay)).await;
                delay = config.next_delay(delay);
            }
            Err(e) => {
                if e.is_conflict() {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Conflict retry budget exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}

//! Lock-contention retry and optimistic write-conflict detection.
//!
//! The two failure modes are handled differently. A busy/locked report from
//! SQLite means another process holds the file for a moment, so the whole
//! operation is retried with exponential backoff. A stale [`ConflictToken`]
//! means another writer committed first; that is surfaced as
//! [`StoreError::Conflict`] and never retried.

mod versioned;

pub use versioned::{
    advance_token, apply_versioned, read_token, ConflictToken, Ident, RecordRef, SqlValue,
    VersionedWrite, LAST_MODIFIED_COLUMN, TOKEN_COLUMN,
};

use crate::cache::HandleLease;
use crate::config::RetryConfig;
use crate::error::{Result, StoreError};
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Sleep before the attempt following `attempt` (1-based): the base delay
    /// doubled each time, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails with something other than lock
/// contention, or exhausts the policy (`LockTimeout`).
///
/// `op` must be safe to repeat: each attempt has to start its own transaction.
pub async fn retry_on_contention<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(StoreError::LockContention(reason)) => {
                if attempt >= policy.max_attempts {
                    tracing::warn!(
                        "Store still locked after {} attempts, giving up: {}",
                        attempt,
                        reason
                    );
                    return Err(StoreError::LockTimeout { attempts: attempt });
                }
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    "Store locked on attempt {}/{}, retrying in {:?}",
                    attempt,
                    policy.max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConcurrencyController {
    policy: RetryPolicy,
}

impl ConcurrencyController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Retries `op` on lock contention only.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_on_contention(&self.policy, op).await
    }

    /// Applies `write` if the stored token still equals `write.expected`,
    /// returning the advanced token.
    pub async fn write_versioned(
        &self,
        lease: &HandleLease,
        write: &VersionedWrite,
    ) -> Result<ConflictToken> {
        let pool = lease.pool();
        self.run(|| async move {
            let mut tx = pool.begin().await?;
            let token = apply_versioned(&mut *tx, write).await?;
            tx.commit().await?;
            Ok::<_, StoreError>(token)
        })
        .await
    }
}

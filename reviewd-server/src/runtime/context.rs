//! Execution context handed to an orchestration body.
//!
//! Each externally-observable action runs through [`DurableContext::run_step`]
//! or [`DurableContext::sleep`], which journal their outcome under a
//! monotonically increasing step index. On crash-replay, journaled steps
//! return their recorded outcome instead of executing; only the first
//! not-yet-journaled step runs live. Between steps the orchestration body must
//! be deterministic.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use reviewd_core::ProviderError;

use crate::db::{self, SqliteDb};

/// Error from a single orchestration step.
#[derive(Debug)]
pub enum StepError {
    /// Not retried. The orchestrator marks the run failed before propagating.
    Terminal(anyhow::Error),
    /// Retried under the runtime's retry policy (attempt-counted).
    Transient(anyhow::Error),
    /// The invocation was cancelled; unwind without touching run status.
    Cancelled,
}

impl StepError {
    pub fn terminal(err: impl Into<anyhow::Error>) -> Self {
        StepError::Terminal(err.into())
    }

    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        StepError::Transient(err.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StepError::Cancelled)
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Terminal(e) => write!(f, "terminal: {:#}", e),
            StepError::Transient(e) => write!(f, "transient: {:#}", e),
            StepError::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Classifies a provider error for the retry machinery: auth and not-found
/// failures cannot be fixed by retrying; rate limits and network trouble can.
pub fn classify_provider_error(err: ProviderError) -> StepError {
    match err {
        ProviderError::NotFound
        | ProviderError::Unauthorized
        | ProviderError::Forbidden
        | ProviderError::InvalidInput(_) => StepError::terminal(err),
        ProviderError::RateLimited | ProviderError::Transient(_) => StepError::transient(err),
    }
}

/// Attempt-counted retry with capped exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Per-invocation durable execution context.
pub struct DurableContext {
    db: Arc<SqliteDb>,
    invocation_id: String,
    key: String,
    cancel: CancellationToken,
    retry: RetryPolicy,
    next_index: i64,
}

impl DurableContext {
    pub fn new(
        db: Arc<SqliteDb>,
        invocation_id: String,
        key: String,
        cancel: CancellationToken,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            db,
            invocation_id,
            key,
            cancel,
            retry,
            next_index: 0,
        }
    }

    /// The orchestration key (`<repo_id>-<mr_number>`) this invocation runs
    /// under.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn next_index(&mut self) -> i64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    async fn journaled_output(&self, index: i64) -> Result<Option<String>, StepError> {
        let invocation_id = self.invocation_id.clone();
        db::call(&self.db, move |db| db.get_step(&invocation_id, index))
            .await
            .map_err(StepError::Transient)
    }

    async fn journal_output(&self, index: i64, name: &str, output: String) -> Result<(), StepError> {
        let invocation_id = self.invocation_id.clone();
        let name = name.to_string();
        db::call(&self.db, move |db| {
            db.record_step(&invocation_id, index, &name, &output)
        })
        .await
        .map_err(StepError::Transient)
    }

    /// Execute a journaled step.
    ///
    /// If this step index is already journaled, the recorded output is
    /// returned without executing `f`. Otherwise `f` runs under the retry
    /// policy (transient failures only) and its output is journaled before
    /// being returned. Cancellation is observed before and during every
    /// attempt.
    pub async fn run_step<T, F, Fut>(&mut self, name: &str, mut f: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let index = self.next_index();

        if let Some(recorded) = self.journaled_output(index).await? {
            return serde_json::from_str(&recorded).map_err(|e| {
                StepError::terminal(anyhow::anyhow!(
                    "corrupt journal entry for step {} ({}): {}",
                    index,
                    name,
                    e
                ))
            });
        }

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(StepError::Cancelled);
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
                r = f() => r,
            };

            match result {
                Ok(value) => {
                    let output = serde_json::to_string(&value).map_err(|e| {
                        StepError::terminal(anyhow::anyhow!(
                            "serializing step {} output: {}",
                            name,
                            e
                        ))
                    })?;
                    self.journal_output(index, name, output).await?;
                    return Ok(value);
                }
                Err(StepError::Transient(err)) if attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        "Step {} attempt {}/{} failed (retrying in {:?}): {:#}",
                        name, attempt, self.retry.max_attempts, delay, err
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Durable sleep: the wake deadline is journaled on first execution, so a
    /// crash-replay resumes the original deadline instead of restarting the
    /// clock. Cancellable.
    pub async fn sleep(&mut self, duration: Duration) -> Result<(), StepError> {
        let index = self.next_index();

        let deadline_ms: i64 = match self.journaled_output(index).await? {
            Some(recorded) => serde_json::from_str(&recorded).map_err(|e| {
                StepError::terminal(anyhow::anyhow!("corrupt sleep journal entry: {}", e))
            })?,
            None => {
                let deadline = now_ms() + duration.as_millis() as i64;
                self.journal_output(index, "sleep", deadline.to_string())
                    .await?;
                deadline
            }
        };

        let remaining = deadline_ms - now_ms();
        if remaining > 0 {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(StepError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(remaining as u64)) => {}
            }
        }
        Ok(())
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

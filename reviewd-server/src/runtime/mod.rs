//! Embedded durable-execution runtime.
//!
//! One logical orchestration per key (`<repo_id>-<mr_number>`): per-key locks
//! guarantee at most one invocation per key executes at any time, and every
//! externally-observable step is journaled (see [`context`]) so invocations
//! survive process crashes. At startup [`Runtime::recover`] re-spawns any
//! invocation that was in flight; journaled steps replay, the first
//! unjournaled step executes.
//!
//! The ingress consumes the runtime through the [`Dispatcher`] seam, which
//! mirrors a submit/cancel ingress-and-admin API: submit is fire-and-forget
//! and returns an opaque invocation id; cancelling an already-finished
//! invocation reports [`CancelOutcome::NotFound`] and is ignored by callers.

pub mod context;

pub use context::{classify_provider_error, RetryPolicy, StepError};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::{self, SqliteDb};
use crate::orchestrator::{self, Deps, RunRequest};
use context::DurableContext;

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The invocation was live and has been asked to stop.
    Requested,
    /// No live invocation with that id (already completed or unknown).
    NotFound,
}

/// Submit/cancel seam between the ingress and the runtime.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Enqueue an orchestration invocation under the given key. Fire-and-forget;
    /// returns the opaque invocation id.
    async fn submit(&self, key: &str, request: RunRequest) -> Result<String>;

    /// Best-effort cancellation of a live invocation.
    async fn cancel(&self, invocation_id: &str) -> Result<CancelOutcome>;
}

pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    db: Arc<SqliteDb>,
    deps: Arc<Deps>,
    retry: RetryPolicy,
    /// Per-key locks serializing invocations for the same (repo, MR).
    key_locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    /// Cancellation tokens for live invocations.
    cancels: RwLock<HashMap<String, CancellationToken>>,
}

impl Runtime {
    pub fn new(db: Arc<SqliteDb>, deps: Arc<Deps>, retry: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                db,
                deps,
                retry,
                key_locks: RwLock::new(HashMap::new()),
                cancels: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Re-spawn every invocation that was pending or running when the process
    /// last stopped. Call once at startup, before accepting requests.
    pub async fn recover(&self) -> Result<usize> {
        let unfinished =
            db::call(&self.inner.db, |db| db.unfinished_invocations()).await?;
        let count = unfinished.len();

        for invocation in unfinished {
            let request: RunRequest = match serde_json::from_str(&invocation.payload) {
                Ok(r) => r,
                Err(e) => {
                    error!(
                        "Invocation {} has an unreadable payload, marking failed: {}",
                        invocation.id, e
                    );
                    let id = invocation.id.clone();
                    let msg = format!("unreadable payload: {}", e);
                    db::call(&self.inner.db, move |db| {
                        db.set_invocation_status(&id, "failed", Some(&msg))
                    })
                    .await?;
                    continue;
                }
            };

            info!(
                "Recovering invocation {} for key {}",
                invocation.id, invocation.key
            );
            self.spawn(invocation.id, invocation.key, request).await;
        }

        if count > 0 {
            info!("Recovered {} in-flight invocations", count);
        }
        Ok(count)
    }

    async fn spawn(&self, invocation_id: String, key: String, request: RunRequest) {
        let token = CancellationToken::new();
        self.inner
            .cancels
            .write()
            .await
            .insert(invocation_id.clone(), token.clone());

        let inner = self.inner.clone();
        tokio::spawn(async move {
            run_invocation(inner, invocation_id, key, request, token).await;
        });
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        key_lock(&self.inner, key).await
    }
}

async fn key_lock(inner: &Arc<RuntimeInner>, key: &str) -> Arc<Mutex<()>> {
    {
        let locks = inner.key_locks.read().await;
        if let Some(lock) = locks.get(key) {
            return lock.clone();
        }
    }
    let mut locks = inner.key_locks.write().await;
    locks
        .entry(key.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

async fn run_invocation(
    inner: Arc<RuntimeInner>,
    invocation_id: String,
    key: String,
    request: RunRequest,
    token: CancellationToken,
) {
    let lock = key_lock(&inner, &key).await;
    let _guard = lock.lock().await;

    // Superseded while queued behind the previous invocation for this key.
    if token.is_cancelled() {
        set_invocation_status(&inner, &invocation_id, "cancelled", None).await;
        inner.cancels.write().await.remove(&invocation_id);
        return;
    }

    set_invocation_status(&inner, &invocation_id, "running", None).await;

    let mut ctx = DurableContext::new(
        inner.db.clone(),
        invocation_id.clone(),
        key.clone(),
        token,
        inner.retry.clone(),
    );

    match orchestrator::run(&mut ctx, &inner.deps, request).await {
        Ok(run_id) => {
            info!(
                "Invocation {} for key {} completed (run {})",
                invocation_id, key, run_id
            );
            set_invocation_status(&inner, &invocation_id, "completed", None).await;
        }
        Err(StepError::Cancelled) => {
            info!("Invocation {} for key {} cancelled", invocation_id, key);
            set_invocation_status(&inner, &invocation_id, "cancelled", None).await;
        }
        Err(err) => {
            warn!("Invocation {} for key {} failed: {}", invocation_id, key, err);
            set_invocation_status(&inner, &invocation_id, "failed", Some(err.to_string())).await;
        }
    }

    inner.cancels.write().await.remove(&invocation_id);
}

async fn set_invocation_status(
    inner: &Arc<RuntimeInner>,
    invocation_id: &str,
    status: &'static str,
    error_msg: Option<String>,
) {
    let id = invocation_id.to_string();
    let result = db::call(&inner.db, move |db| {
        db.set_invocation_status(&id, status, error_msg.as_deref())
    })
    .await;
    if let Err(e) = result {
        error!(
            "Failed to update invocation {} to {}: {:#}",
            invocation_id, status, e
        );
    }
}

#[async_trait]
impl Dispatcher for Runtime {
    async fn submit(&self, key: &str, request: RunRequest) -> Result<String> {
        let invocation_id = Uuid::new_v4().to_string();
        let payload =
            serde_json::to_string(&request).context("serializing invocation payload")?;

        {
            let id = invocation_id.clone();
            let key = key.to_string();
            db::call(&self.inner.db, move |db| {
                db.create_invocation(&id, &key, &payload)
            })
            .await?;
        }

        // Pre-warm the key lock so serialization is in place before the task
        // starts.
        let _ = self.key_lock(key).await;

        self.spawn(invocation_id.clone(), key.to_string(), request)
            .await;
        Ok(invocation_id)
    }

    async fn cancel(&self, invocation_id: &str) -> Result<CancelOutcome> {
        let cancels = self.inner.cancels.read().await;
        match cancels.get(invocation_id) {
            Some(token) => {
                token.cancel();
                Ok(CancelOutcome::Requested)
            }
            None => Ok(CancelOutcome::NotFound),
        }
    }
}

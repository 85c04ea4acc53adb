//! Per-MR review orchestration.
//!
//! One durable keyed execution per `<repo_id>-<mr_number>`: adaptive
//! debounce, draft guard, diff-hash dedup, reviewer invocation, durable
//! comment persistence, idempotent posting, terminal status. The runtime
//! guarantees a single live invocation per key and replays journaled steps
//! after a crash, so every step here either runs exactly once or returns its
//! recorded outcome.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use reviewd_core::ReviewRequest;

use crate::db::{self, CommentInput, RunStatus, SqliteDb};
use crate::fetcher::{self, FetchRequest};
use crate::gitlab::ProviderFactory;
use crate::poster::{self, PostRequest};
use crate::reviewer::Reviewer;
use crate::runtime::context::{now_ms, DurableContext, StepError};

pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_secs(180);

const TOO_LARGE_SUMMARY: &str =
    "This PR is too large to review automatically (> 5000 changed lines).";

const DEBOUNCE_STATE_NAME: &str = "last_started_at";

/// Collaborators the orchestration steps run against.
pub struct Deps {
    pub db: Arc<SqliteDb>,
    pub encryption_key: Vec<u8>,
    pub providers: Arc<dyn ProviderFactory>,
    pub reviewer: Arc<dyn Reviewer>,
    /// Rapid re-triggers within this window coalesce into one review.
    pub debounce_window: Duration,
}

/// Payload submitted to the runtime for one orchestration invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// The caller creates the run row up-front and passes its id here.
    /// Absent only for legacy payloads; a pending row is created then.
    #[serde(default)]
    pub run_id: Option<String>,
    pub repo_id: String,
    pub mr_number: i64,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub force: bool,
}

/// The key under which the runtime serializes executions for one MR.
pub fn orchestration_key(repo_id: &str, mr_number: i64) -> String {
    format!("{}-{}", repo_id, mr_number)
}

#[derive(Debug, Serialize, Deserialize)]
struct DebounceStamp {
    last: Option<i64>,
    now: i64,
}

/// Orchestrate one full review. Returns the review run id.
pub async fn run(
    ctx: &mut DurableContext,
    deps: &Arc<Deps>,
    req: RunRequest,
) -> Result<String, StepError> {
    // Adaptive debounce: the first trigger after a quiet period proceeds
    // immediately; a trigger arriving within the window of the previous start
    // sleeps it out, coalescing rapid pushes into one review.
    let stamp: DebounceStamp = {
        let db = deps.db.clone();
        let key = ctx.key().to_string();
        ctx.run_step("debounce_stamp", move || {
            let db = db.clone();
            let key = key.clone();
            async move {
                let last = db::call(&db, {
                    let key = key.clone();
                    move |d| d.state_get(&key, DEBOUNCE_STATE_NAME)
                })
                .await
                .map_err(StepError::Transient)?;
                let last = last.and_then(|v| v.parse::<i64>().ok());

                let now = now_ms();
                db::call(&db, {
                    let key = key.clone();
                    move |d| d.state_set(&key, DEBOUNCE_STATE_NAME, &now.to_string())
                })
                .await
                .map_err(StepError::Transient)?;

                Ok(DebounceStamp { last, now })
            }
        })
        .await?
    };

    let window_ms = deps.debounce_window.as_millis() as i64;
    if let Some(last) = stamp.last {
        if stamp.now - last < window_ms {
            info!(
                "Debouncing review for key {} ({}ms since previous start)",
                ctx.key(),
                stamp.now - last
            );
            ctx.sleep(deps.debounce_window).await?;
        }
    }

    // Run-row selection.
    let run_id = match req.run_id.clone().filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            let db = deps.db.clone();
            let repo_id = req.repo_id.clone();
            let mr_number = req.mr_number;
            ctx.run_step("create_run", move || {
                let db = db.clone();
                let repo_id = repo_id.clone();
                async move {
                    db::call(&db, move |d| {
                        d.create_review_run(&repo_id, mr_number, RunStatus::Pending)
                    })
                    .await
                    .map_err(StepError::Transient)
                }
            })
            .await?
        }
    };

    // Fetch diff + details (includes the dedup check).
    let fetch_req = FetchRequest {
        repo_id: req.repo_id.clone(),
        mr_number: req.mr_number,
        force: req.force,
    };
    let fetch = {
        let deps_step = deps.clone();
        let fetch_req = fetch_req.clone();
        let result = ctx
            .run_step("fetch", move || {
                let deps = deps_step.clone();
                let fetch_req = fetch_req.clone();
                async move { fetcher::fetch_mr_details(&deps, &fetch_req).await }
            })
            .await;
        match result {
            Ok(f) => f,
            Err(e) => return Err(fail_run(deps, &run_id, e).await),
        }
    };

    // The MR may have become a draft during the debounce sleep.
    if fetch.draft {
        info!("MR {} is a draft, parking run {}", req.mr_number, run_id);
        set_status(deps, &run_id, RunStatus::Draft).await?;
        return Ok(run_id);
    }

    // Identical diff already reviewed.
    if fetch.skip {
        set_status(deps, &run_id, RunStatus::Skipped).await?;
        return Ok(run_id);
    }

    if !fetch.diff_hash.is_empty() {
        let result = {
            let db = deps.db.clone();
            let run_id = run_id.clone();
            let hash = fetch.diff_hash.clone();
            db::call(&db, move |d| d.update_run_diff_hash(&run_id, &hash)).await
        };
        if let Err(e) = result {
            return Err(fail_run(deps, &run_id, StepError::Transient(e)).await);
        }
    }

    if let Err(e) = set_status(deps, &run_id, RunStatus::Running).await {
        return Err(fail_run(deps, &run_id, e).await);
    }

    // Short-circuit oversized diffs with a single note.
    if fetch.diff_too_large {
        let post_req = PostRequest {
            review_run_id: run_id.clone(),
            repo_id: req.repo_id.clone(),
            mr_number: req.mr_number,
            repo_remote_id: fetch.repo_remote_id.clone(),
            summary: TOO_LARGE_SUMMARY.to_string(),
            dry_run: req.dry_run,
        };
        let result = {
            let deps_step = deps.clone();
            ctx.run_step("post_too_large", move || {
                let deps = deps_step.clone();
                let post_req = post_req.clone();
                async move { poster::post_review(&deps, &post_req).await }
            })
            .await
        };
        if let Err(e) = result {
            return Err(fail_run(deps, &run_id, e).await);
        }
        if let Err(e) = set_status(deps, &run_id, RunStatus::Completed).await {
            return Err(fail_run(deps, &run_id, e).await);
        }
        return Ok(run_id);
    }

    // Invoke the external reviewer.
    let review_req = ReviewRequest {
        diff: fetch.diff.clone(),
        mr_title: fetch.mr_title.clone(),
        mr_description: fetch.mr_description.clone(),
        mr_author: fetch.mr_author.clone(),
        source_branch: fetch.source_branch.clone(),
        target_branch: fetch.target_branch.clone(),
        changed_files: fetch.changed_files.clone(),
        model: None,
        max_tokens: None,
    };
    let review = {
        let deps_step = deps.clone();
        let result = ctx
            .run_step("review", move || {
                let deps = deps_step.clone();
                let review_req = review_req.clone();
                async move { deps.reviewer.run_review(&review_req).await }
            })
            .await;
        match result {
            Ok(r) => r,
            Err(e) => return Err(fail_run(deps, &run_id, e).await),
        }
    };

    // Persist comments before posting, so a crash between insertion and
    // posting loses nothing and duplicates nothing.
    let comment_inputs: Vec<CommentInput> = review
        .comments
        .iter()
        .map(|c| CommentInput {
            file_path: c.file_path.clone(),
            line_start: c.line_start,
            line_end: c.line_end,
            body: c.body.clone(),
        })
        .collect();
    let persisted: Result<i64, StepError> = {
        let db = deps.db.clone();
        let run_id_step = run_id.clone();
        ctx.run_step("persist_comments", move || {
            let db = db.clone();
            let run_id = run_id_step.clone();
            let inputs = comment_inputs.clone();
            async move {
                let count = inputs.len() as i64;
                db::call(&db, move |d| d.insert_review_comments(&run_id, &inputs))
                    .await
                    .map_err(StepError::Transient)?;
                Ok(count)
            }
        })
        .await
    };
    if let Err(e) = persisted {
        return Err(fail_run(deps, &run_id, e).await);
    }

    // Post summary and inline comments. Retries skip rows already posted.
    let post_req = PostRequest {
        review_run_id: run_id.clone(),
        repo_id: req.repo_id.clone(),
        mr_number: req.mr_number,
        repo_remote_id: fetch.repo_remote_id.clone(),
        summary: review.summary.clone(),
        dry_run: req.dry_run,
    };
    let posted = {
        let deps_step = deps.clone();
        ctx.run_step("post", move || {
            let deps = deps_step.clone();
            let post_req = post_req.clone();
            async move { poster::post_review(&deps, &post_req).await }
        })
        .await
    };
    if let Err(e) = posted {
        return Err(fail_run(deps, &run_id, e).await);
    }

    if let Err(e) = set_status(deps, &run_id, RunStatus::Completed).await {
        return Err(fail_run(deps, &run_id, e).await);
    }

    info!("Review run {} completed for key {}", run_id, ctx.key());
    Ok(run_id)
}

async fn set_status(deps: &Arc<Deps>, run_id: &str, status: RunStatus) -> Result<(), StepError> {
    let run_id = run_id.to_string();
    db::call(&deps.db, move |db| {
        db.update_run_status(&run_id, status).map(|_| ())
    })
    .await
    .map_err(StepError::Transient)
}

/// Mark the run failed (best-effort) and hand the error back. Cancellation is
/// not a failure: the run row keeps its current non-terminal status so the
/// superseding invocation can take over.
async fn fail_run(deps: &Arc<Deps>, run_id: &str, err: StepError) -> StepError {
    if err.is_cancelled() {
        return err;
    }
    let run_id_owned = run_id.to_string();
    let result = db::call(&deps.db, move |db| {
        db.update_run_status(&run_id_owned, RunStatus::Failed).map(|_| ())
    })
    .await;
    if let Err(e) = result {
        error!("Failed to mark run {} as failed: {:#}", run_id, e);
    }
    err
}

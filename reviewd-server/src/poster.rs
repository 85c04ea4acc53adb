//! Comment poster: persists then posts the summary note and each inline
//! comment, idempotently.
//!
//! Every provider write is guarded by a persisted id (`summary_comment_id` on
//! the run, `provider_comment_id` on each comment), so a retry after a crash
//! or partial failure re-posts nothing that already landed.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use reviewd_core::{crypto, InlineComment, ProviderError};

use crate::db;
use crate::orchestrator::Deps;
use crate::runtime::context::{classify_provider_error, StepError};

/// Sentinel stored in `provider_comment_id` for comments the provider
/// permanently rejected (e.g. a line that is not part of the diff), so they
/// are not retried forever.
pub const SKIPPED_SENTINEL: &str = "skipped";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostRequest {
    pub review_run_id: String,
    pub repo_id: String,
    pub mr_number: i64,
    pub repo_remote_id: String,
    pub summary: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostResponse {
    pub comments_posted: i64,
    pub summary_posted: bool,
}

/// Store the summary and post it plus all unposted inline comments to the
/// provider. In dry-run mode the summary is stored but nothing is posted.
pub async fn post_review(deps: &Deps, req: &PostRequest) -> Result<PostResponse, StepError> {
    {
        let run_id = req.review_run_id.clone();
        let summary = req.summary.clone();
        db::call(&deps.db, move |db| db.update_run_summary(&run_id, &summary))
            .await
            .map_err(StepError::Transient)?;
    }

    if req.dry_run {
        return Ok(PostResponse {
            comments_posted: 0,
            summary_posted: false,
        });
    }

    let (_, provider_row) = {
        let repo_id = req.repo_id.clone();
        db::call(&deps.db, move |db| db.get_repo_with_provider(&repo_id))
            .await
            .map_err(StepError::Transient)?
            .ok_or_else(|| {
                StepError::terminal(anyhow::anyhow!("repo not found: {}", req.repo_id))
            })?
    };

    let token = crypto::decrypt(&provider_row.token_encrypted, &deps.encryption_key)
        .map_err(|e| StepError::terminal(e.context("decrypting provider token")))?;
    let token = String::from_utf8(token)
        .map_err(|_| StepError::terminal(anyhow::anyhow!("decrypted token is not UTF-8")))?;

    let provider = deps
        .providers
        .create(provider_row.kind, &provider_row.base_url, &token);

    // Post the summary note once. The persisted note id makes retries skip it.
    let run = {
        let run_id = req.review_run_id.clone();
        db::call(&deps.db, move |db| db.get_review_run(&run_id))
            .await
            .map_err(StepError::Transient)?
            .ok_or_else(|| {
                StepError::terminal(anyhow::anyhow!("review run not found: {}", req.review_run_id))
            })?
    };

    if run.summary_comment_id.is_none() {
        let note = provider
            .post_note(&req.repo_remote_id, req.mr_number, &req.summary)
            .await
            .map_err(classify_provider_error)?;

        let run_id = req.review_run_id.clone();
        let note_id = note.id.clone();
        db::call(&deps.db, move |db| {
            db.set_run_summary_comment(&run_id, &note_id)
        })
        .await
        .map_err(StepError::Transient)?;
        info!(
            "Posted summary note {} for run {}",
            note.id, req.review_run_id
        );
    }

    // Inline comments, in insertion order. Rows already carrying a provider id
    // were posted by a previous attempt and are not loaded here.
    let unposted = {
        let run_id = req.review_run_id.clone();
        db::call(&deps.db, move |db| db.unposted_comments(&run_id))
            .await
            .map_err(StepError::Transient)?
    };

    let mut posted = 0i64;
    for comment in unposted {
        let inline = InlineComment {
            file_path: comment.file_path.clone(),
            line: comment.line_start,
            body: comment.body.clone(),
            new_side: true,
        };

        let result = provider
            .post_inline_comment(&req.repo_remote_id, req.mr_number, &inline)
            .await;

        match result {
            Ok(created) => {
                let comment_id = comment.id.clone();
                let provider_id = created.id.clone();
                let newly_marked = db::call(&deps.db, move |db| {
                    db.mark_comment_posted(&comment_id, &provider_id)
                })
                .await
                .map_err(StepError::Transient)?;
                if newly_marked {
                    posted += 1;
                }
            }
            Err(ProviderError::InvalidInput(reason)) => {
                // The position will never be accepted; mark it skipped so
                // retries don't loop on it.
                warn!(
                    "Provider rejected inline comment on {}:{} ({}), skipping",
                    comment.file_path, comment.line_start, reason
                );
                let comment_id = comment.id.clone();
                db::call(&deps.db, move |db| {
                    db.mark_comment_posted(&comment_id, SKIPPED_SENTINEL)
                })
                .await
                .map_err(StepError::Transient)?;
            }
            Err(err) => {
                // Partial progress is already persisted; the retry will skip
                // every row marked posted above.
                return Err(classify_provider_error(err));
            }
        }
    }

    Ok(PostResponse {
        comments_posted: posted,
        summary_posted: true,
    })
}

//! Diff fetcher: loads provider credentials, pulls MR metadata and the diff,
//! and reports the dedup/draft/too-large verdicts the orchestrator acts on.

use serde::{Deserialize, Serialize};
use tracing::info;

use reviewd_core::crypto;

use crate::db;
use crate::orchestrator::Deps;
use crate::runtime::context::{classify_provider_error, StepError};

/// Reviews are skipped entirely above this many changed lines.
pub const MAX_CHANGED_LINES: i64 = 5000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchRequest {
    pub repo_id: String,
    pub mr_number: i64,
    pub force: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    pub diff: String,
    pub mr_title: String,
    pub mr_description: String,
    pub mr_author: String,
    pub source_branch: String,
    pub target_branch: String,
    pub changed_files: Vec<String>,
    pub changed_lines: i64,
    pub diff_too_large: bool,
    pub repo_remote_id: String,
    /// Identity of the content the reviewer would see. The head commit SHA
    /// serves as the identity since every push produces a new SHA.
    pub diff_hash: String,
    /// An identical diff hash was already reviewed; nothing to do.
    pub skip: bool,
    pub draft: bool,
}

/// Fetch MR details and diff for a review. When `force` is false and the most
/// recent completed run for this MR carries the same diff hash, the diff is
/// not fetched at all and `skip` is set.
pub async fn fetch_mr_details(deps: &Deps, req: &FetchRequest) -> Result<FetchResponse, StepError> {
    let (repo, provider_row) = {
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

    let details = provider
        .get_mr_details(&repo.remote_id, req.mr_number)
        .await
        .map_err(classify_provider_error)?;

    let diff_hash = details.head_sha.clone();

    if !req.force {
        let prev_hash = {
            let repo_id = req.repo_id.clone();
            let mr_number = req.mr_number;
            db::call(&deps.db, move |db| {
                db.latest_completed_diff_hash(&repo_id, mr_number)
            })
            .await
            .map_err(StepError::Transient)?
        };
        if prev_hash.as_deref() == Some(diff_hash.as_str()) {
            info!(
                "MR {} in repo {} already reviewed at {}, skipping",
                req.mr_number, req.repo_id, diff_hash
            );
            return Ok(FetchResponse {
                skip: true,
                diff_hash,
                draft: details.draft,
                ..Default::default()
            });
        }
    }

    let diff = provider
        .get_mr_diff(&repo.remote_id, req.mr_number)
        .await
        .map_err(classify_provider_error)?;

    let changed_files = diff
        .changed_files
        .iter()
        .map(|f| f.new_path.clone())
        .collect();

    Ok(FetchResponse {
        diff: diff.unified_diff,
        mr_title: details.title,
        mr_description: details.description,
        mr_author: details.author,
        source_branch: details.source_branch,
        target_branch: details.target_branch,
        changed_files,
        changed_lines: diff.changed_lines,
        diff_too_large: diff.changed_lines > MAX_CHANGED_LINES,
        repo_remote_id: repo.remote_id,
        diff_hash,
        skip: false,
        draft: details.draft,
    })
}

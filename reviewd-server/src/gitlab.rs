//! GitLab REST v4 provider adapter.
//!
//! Implements the [`GitProvider`] contract. No retries happen here; failures
//! are classified into [`ProviderError`] kinds and the orchestration layer
//! decides what to do with them.
//!
//! Endpoints used:
//! - GET  /projects?membership=true                 (paginated via x-next-page)
//! - GET  /projects/:id/merge_requests/:iid
//! - GET  /projects/:id/merge_requests/:iid/changes
//! - GET  /projects/:id/merge_requests/:iid/versions
//! - POST /projects/:id/merge_requests/:iid/notes
//! - POST /projects/:id/merge_requests/:iid/discussions

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use reviewd_core::{
    ChangedFile, CommentResult, GitProvider, InlineComment, MrDetails, MrDiff, ProviderError,
    ProviderKind, ProviderResult, Repo,
};

const DEFAULT_BASE_URL: &str = "https://gitlab.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct GitlabClient {
    http: Client,
    base_url: String,
    token: String,
}

impl GitlabClient {
    /// `base_url` is the GitLab instance root (e.g. "https://gitlab.com"),
    /// with or without a trailing slash.
    pub fn new(http: Client, base_url: &str, token: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn mr_url(&self, repo_remote_id: &str, mr_number: i64, suffix: &str) -> String {
        format!(
            "{}/api/v4/projects/{}/merge_requests/{}{}",
            self.base_url,
            urlencoding::encode(repo_remote_id),
            mr_number,
            suffix
        )
    }

    async fn get_mr_versions(
        &self,
        repo_remote_id: &str,
        mr_number: i64,
    ) -> ProviderResult<GitlabMrVersion> {
        let resp = self
            .http
            .get(self.mr_url(repo_remote_id, mr_number, "/versions"))
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        let versions: Vec<GitlabMrVersion> = decode_json(resp).await?;
        versions.into_iter().next().ok_or_else(|| {
            ProviderError::Transient(format!("no versions found for MR {}", mr_number))
        })
    }
}

#[async_trait]
impl GitProvider for GitlabClient {
    async fn list_repos(&self) -> ProviderResult<Vec<Repo>> {
        let mut repos = Vec::new();
        let mut next_page = Some("1".to_string());

        while let Some(page) = next_page {
            let url = format!(
                "{}/api/v4/projects?membership=true&per_page=100&page={}",
                self.base_url,
                urlencoding::encode(&page)
            );
            let resp = self
                .http
                .get(url)
                .header("PRIVATE-TOKEN", &self.token)
                .send()
                .await
                .map_err(transport_error)?;
            let resp = check_status(resp).await?;

            next_page = resp
                .headers()
                .get("x-next-page")
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string());

            let projects: Vec<GitlabProject> = decode_json(resp).await?;
            for p in projects {
                repos.push(Repo {
                    remote_id: p.id.to_string(),
                    name: p.name,
                    full_path: p.path_with_namespace,
                    http_url: p.http_url_to_repo,
                });
            }
        }

        Ok(repos)
    }

    async fn get_mr_details(
        &self,
        repo_remote_id: &str,
        mr_number: i64,
    ) -> ProviderResult<MrDetails> {
        let resp = self
            .http
            .get(self.mr_url(repo_remote_id, mr_number, ""))
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        let mr: GitlabMr = decode_json(resp).await?;
        Ok(MrDetails {
            title: mr.title,
            description: mr.description.unwrap_or_default(),
            author: mr.author.username,
            source_branch: mr.source_branch,
            target_branch: mr.target_branch,
            head_sha: mr.sha,
            draft: mr.draft || mr.work_in_progress,
        })
    }

    async fn get_mr_diff(&self, repo_remote_id: &str, mr_number: i64) -> ProviderResult<MrDiff> {
        let resp = self
            .http
            .get(self.mr_url(repo_remote_id, mr_number, "/changes"))
            .header("PRIVATE-TOKEN", &self.token)
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        let changes: GitlabMrChanges = decode_json(resp).await?;
        Ok(reconstruct_unified_diff(&changes.changes))
    }

    async fn post_note(
        &self,
        repo_remote_id: &str,
        mr_number: i64,
        body: &str,
    ) -> ProviderResult<CommentResult> {
        let resp = self
            .http
            .post(self.mr_url(repo_remote_id, mr_number, "/notes"))
            .header("PRIVATE-TOKEN", &self.token)
            .json(&json!({ "body": body }))
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        let note: GitlabNote = decode_json(resp).await?;
        Ok(CommentResult {
            id: note.id.to_string(),
        })
    }

    async fn post_inline_comment(
        &self,
        repo_remote_id: &str,
        mr_number: i64,
        comment: &InlineComment,
    ) -> ProviderResult<CommentResult> {
        // The discussion position payload requires the current MR version's
        // base/head/start SHAs, fetched separately.
        let version = self.get_mr_versions(repo_remote_id, mr_number).await?;

        let mut position = json!({
            "base_sha": version.base_commit_sha,
            "head_sha": version.head_commit_sha,
            "start_sha": version.start_commit_sha,
            "position_type": "text",
            "new_path": comment.file_path,
            "old_path": comment.file_path,
        });
        if comment.new_side {
            position["new_line"] = json!(comment.line);
        } else {
            position["old_line"] = json!(comment.line);
        }

        let resp = self
            .http
            .post(self.mr_url(repo_remote_id, mr_number, "/discussions"))
            .header("PRIVATE-TOKEN", &self.token)
            .json(&json!({ "body": comment.body, "position": position }))
            .send()
            .await
            .map_err(transport_error)?;
        let resp = check_status(resp).await?;

        let discussion: GitlabDiscussion = decode_json(resp).await?;
        Ok(CommentResult { id: discussion.id })
    }
}

/// Creates provider adapters bound to stored credentials. The seam exists so
/// the orchestration layer and its tests can swap in fakes.
pub trait ProviderFactory: Send + Sync {
    fn create(&self, kind: ProviderKind, base_url: &str, token: &str) -> Arc<dyn GitProvider>;
}

pub struct HttpProviderFactory {
    http: Client,
}

impl HttpProviderFactory {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { http })
    }
}

impl ProviderFactory for HttpProviderFactory {
    fn create(&self, _kind: ProviderKind, base_url: &str, token: &str) -> Arc<dyn GitProvider> {
        let base_url = if base_url.is_empty() {
            DEFAULT_BASE_URL
        } else {
            base_url
        };
        Arc::new(GitlabClient::new(self.http.clone(), base_url, token))
    }
}

async fn check_status(resp: reqwest::Response) -> ProviderResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ProviderError::from_status(status.as_u16(), &body))
}

async fn decode_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> ProviderResult<T> {
    resp.json::<T>()
        .await
        .map_err(|e| ProviderError::Transient(format!("decoding response: {}", e)))
}

fn transport_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        return ProviderError::Transient("request timed out".to_string());
    }
    ProviderError::Transient(format!("network error: {}", e))
}

/// Rebuilds a standard unified diff from GitLab's per-file fragments, which
/// arrive without `diff --git` headers. Also counts changed lines (lines
/// starting with `+` or `-`, excluding the `+++`/`---` file headers).
pub fn reconstruct_unified_diff(changes: &[GitlabChange]) -> MrDiff {
    let mut unified = String::new();
    let mut changed_files = Vec::with_capacity(changes.len());
    let mut total_lines = 0i64;

    for ch in changes {
        let old_path = if ch.new_file {
            "/dev/null"
        } else {
            ch.old_path.as_str()
        };
        let new_path = if ch.deleted_file {
            "/dev/null"
        } else {
            ch.new_path.as_str()
        };

        let _ = writeln!(unified, "diff --git a/{} b/{}", ch.old_path, ch.new_path);
        if ch.new_file {
            unified.push_str("new file mode 100644\n");
        } else if ch.deleted_file {
            unified.push_str("deleted file mode 100644\n");
        }
        let _ = writeln!(unified, "--- {}", a_path(old_path));
        let _ = writeln!(unified, "+++ {}", b_path(new_path));
        unified.push_str(&ch.diff);
        if !ch.diff.is_empty() && !ch.diff.ends_with('\n') {
            unified.push('\n');
        }

        total_lines += count_changed_lines(&ch.diff);

        changed_files.push(ChangedFile {
            old_path: ch.old_path.clone(),
            new_path: ch.new_path.clone(),
            diff: ch.diff.clone(),
            new_file: ch.new_file,
            deleted_file: ch.deleted_file,
            renamed_file: ch.renamed_file,
        });
    }

    MrDiff {
        unified_diff: unified,
        changed_files,
        changed_lines: total_lines,
    }
}

fn a_path(p: &str) -> String {
    if p == "/dev/null" {
        p.to_string()
    } else {
        format!("a/{}", p)
    }
}

fn b_path(p: &str) -> String {
    if p == "/dev/null" {
        p.to_string()
    } else {
        format!("b/{}", p)
    }
}

fn count_changed_lines(diff: &str) -> i64 {
    let mut n = 0;
    for line in diff.lines() {
        let Some(first) = line.bytes().next() else {
            continue;
        };
        if (first == b'+' || first == b'-')
            && !line.starts_with("+++")
            && !line.starts_with("---")
        {
            n += 1;
        }
    }
    n
}

// --- GitLab response shapes (subset of fields we actually use) ---

#[derive(Debug, Deserialize)]
struct GitlabProject {
    id: i64,
    name: String,
    path_with_namespace: String,
    http_url_to_repo: String,
}

#[derive(Debug, Deserialize)]
struct GitlabMr {
    title: String,
    description: Option<String>,
    source_branch: String,
    target_branch: String,
    sha: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    work_in_progress: bool,
    author: GitlabUser,
}

#[derive(Debug, Deserialize)]
struct GitlabUser {
    username: String,
}

#[derive(Debug, Deserialize)]
pub struct GitlabMrChanges {
    pub changes: Vec<GitlabChange>,
}

#[derive(Debug, Deserialize)]
pub struct GitlabChange {
    pub old_path: String,
    pub new_path: String,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub new_file: bool,
    #[serde(default)]
    pub deleted_file: bool,
    #[serde(default)]
    pub renamed_file: bool,
}

#[derive(Debug, Deserialize)]
struct GitlabNote {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct GitlabDiscussion {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GitlabMrVersion {
    head_commit_sha: String,
    base_commit_sha: String,
    start_commit_sha: String,
}

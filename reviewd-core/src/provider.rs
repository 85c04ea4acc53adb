//! Provider contract: the uniform read/write surface over a remote
//! code-hosting API.
//!
//! Implementations classify failures into [`ProviderError`] kinds and never
//! retry; all retry policy is owned by the orchestration layer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error taxonomy for provider operations. Callers match on the kind, not on
/// message text.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("not found")]
    NotFound,

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("rate limited")]
    RateLimited,

    /// The provider rejected the request payload (HTTP 400), e.g. an inline
    /// comment position that is not part of the diff.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network failures, timeouts, 5xx and any other retryable condition.
    #[error("transient provider error: {0}")]
    Transient(String),
}

impl ProviderError {
    /// Maps an HTTP status to an error kind. `body` is included for the
    /// kinds where the provider's explanation matters.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            400 => ProviderError::InvalidInput(truncate(body)),
            401 => ProviderError::Unauthorized,
            403 => ProviderError::Forbidden,
            404 => ProviderError::NotFound,
            429 => ProviderError::RateLimited,
            _ => ProviderError::Transient(format!("unexpected status {}: {}", status, truncate(body))),
        }
    }
}

fn truncate(s: &str) -> String {
    const MAX: usize = 512;
    let s = s.trim();
    if s.len() <= MAX {
        s.to_string()
    } else {
        let mut end = MAX;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// The provider family. Only the GitLab family is implemented at the protocol
/// level; the two variants differ only in their default base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderKind {
    GitlabSelfHosted,
    GitlabCloud,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gitlab_self_hosted" => Some(ProviderKind::GitlabSelfHosted),
            "gitlab_cloud" => Some(ProviderKind::GitlabCloud),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GitlabSelfHosted => "gitlab_self_hosted",
            ProviderKind::GitlabCloud => "gitlab_cloud",
        }
    }
}

/// A repository accessible to the authenticated token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    /// Provider-specific identifier (numeric string for GitLab).
    pub remote_id: String,
    pub name: String,
    pub full_path: String,
    pub http_url: String,
}

/// Metadata about a merge request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrDetails {
    pub title: String,
    pub description: String,
    pub author: String,
    pub source_branch: String,
    pub target_branch: String,
    pub head_sha: String,
    pub draft: bool,
}

/// A single file changed in a merge request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    pub old_path: String,
    pub new_path: String,
    pub diff: String,
    pub new_file: bool,
    pub deleted_file: bool,
    pub renamed_file: bool,
}

/// The diff for a merge request, reconstructed into standard unified form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrDiff {
    pub unified_diff: String,
    pub changed_files: Vec<ChangedFile>,
    /// Lines beginning with `+` or `-`, excluding the `+++`/`---` headers.
    pub changed_lines: i64,
}

/// A comment anchored to a specific line in a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineComment {
    pub file_path: String,
    pub line: i64,
    pub body: String,
    /// true anchors to the new (right) side of the diff, false to the old side.
    pub new_side: bool,
}

/// The result of posting a note or inline discussion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommentResult {
    pub id: String,
}

/// Uniform contract over a remote code-hosting API. The authentication token
/// is bound to the instance at construction time.
///
/// `repo_remote_id` is provider-specific; `mr_number` is the MR/PR number
/// (GitLab MR IID).
#[async_trait]
pub trait GitProvider: Send + Sync {
    /// Enumerates all repositories, following pagination until the provider
    /// signals no more pages.
    async fn list_repos(&self) -> ProviderResult<Vec<Repo>>;

    async fn get_mr_details(&self, repo_remote_id: &str, mr_number: i64)
        -> ProviderResult<MrDetails>;

    async fn get_mr_diff(&self, repo_remote_id: &str, mr_number: i64) -> ProviderResult<MrDiff>;

    /// Posts a top-level MR note (not anchored to a line).
    async fn post_note(
        &self,
        repo_remote_id: &str,
        mr_number: i64,
        body: &str,
    ) -> ProviderResult<CommentResult>;

    /// Posts a discussion anchored to a file and line in the diff.
    async fn post_inline_comment(
        &self,
        repo_remote_id: &str,
        mr_number: i64,
        comment: &InlineComment,
    ) -> ProviderResult<CommentResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            ProviderError::from_status(401, ""),
            ProviderError::Unauthorized
        ));
        assert!(matches!(
            ProviderError::from_status(403, ""),
            ProviderError::Forbidden
        ));
        assert!(matches!(
            ProviderError::from_status(404, ""),
            ProviderError::NotFound
        ));
        assert!(matches!(
            ProviderError::from_status(429, ""),
            ProviderError::RateLimited
        ));
        assert!(matches!(
            ProviderError::from_status(400, "line not in diff"),
            ProviderError::InvalidInput(_)
        ));
        assert!(matches!(
            ProviderError::from_status(500, "boom"),
            ProviderError::Transient(_)
        ));
        assert!(matches!(
            ProviderError::from_status(302, ""),
            ProviderError::Transient(_)
        ));
    }

    #[test]
    fn test_invalid_input_carries_body() {
        match ProviderError::from_status(400, "  line_code is invalid  ") {
            ProviderError::InvalidInput(msg) => assert_eq!(msg, "line_code is invalid"),
            other => panic!("unexpected kind: {:?}", other),
        }
    }

    #[test]
    fn test_provider_kind_round_trip() {
        for kind in [ProviderKind::GitlabSelfHosted, ProviderKind::GitlabCloud] {
            assert_eq!(ProviderKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ProviderKind::parse("github"), None);
    }
}

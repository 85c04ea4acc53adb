//! Wire contract with the external reviewer service.
//!
//! The reviewer runs in a separate process (and language); the request and
//! response are plain JSON with snake_case field names. Treat the reviewer as
//! a black box: its failure taxonomy is mapped into the core's by the client.

use serde::{Deserialize, Serialize};

/// Input to the reviewer: the diff plus enough MR context to review it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub diff: String,
    pub mr_title: String,
    pub mr_description: String,
    pub mr_author: String,
    pub source_branch: String,
    pub target_branch: String,
    pub changed_files: Vec<String>,
    /// Model override; omitted when the deployment uses the reviewer default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// A single inline comment produced by the reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewDraftComment {
    pub file_path: String,
    pub line_start: i64,
    pub line_end: i64,
    pub body: String,
}

/// The reviewer's output: a prose summary and zero or more inline comments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResponse {
    pub summary: String,
    #[serde(default)]
    pub comments: Vec<ReviewDraftComment>,
}

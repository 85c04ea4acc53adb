//! Shared fakes for orchestrator and ingress tests: a scriptable provider, a
//! canned reviewer, and a dispatcher that records calls instead of running
//! anything.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use reviewd_core::{
    ChangedFile, CommentResult, GitProvider, InlineComment, MrDetails, MrDiff, ProviderError,
    ProviderKind, ProviderResult, Repo, ReviewDraftComment, ReviewRequest, ReviewResponse,
};

use crate::db::SqliteDb;
use crate::gitlab::ProviderFactory;
use crate::orchestrator::{Deps, RunRequest};
use crate::reviewer::Reviewer;
use crate::runtime::context::StepError;
use crate::runtime::{CancelOutcome, Dispatcher};

pub fn test_encryption_key() -> Vec<u8> {
    (0u8..32).collect()
}

/// A provider whose responses are scripted per test.
pub struct FakeProvider {
    pub details: Mutex<MrDetails>,
    pub diff: Mutex<MrDiff>,
    pub details_calls: AtomicU32,
    pub diff_calls: AtomicU32,
    /// Bodies of posted top-level notes, in order.
    pub notes: Mutex<Vec<String>>,
    /// Accepted inline comments, in order.
    pub inline_posts: Mutex<Vec<InlineComment>>,
    /// Lines rejected with InvalidInput (position not in diff).
    pub reject_lines: Mutex<HashSet<i64>>,
    /// When set, inline posts fail with a transient error after this many
    /// successes (simulates a mid-posting outage).
    pub inline_failures_after: Mutex<Option<u32>>,
    next_id: AtomicU32,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            details: Mutex::new(MrDetails {
                title: "Add order processing".to_string(),
                description: "adds the order pipeline".to_string(),
                author: "dev".to_string(),
                source_branch: "feature/orders".to_string(),
                target_branch: "main".to_string(),
                head_sha: "bbb222".to_string(),
                draft: false,
            }),
            diff: Mutex::new(diff_with_changed_lines(10)),
            details_calls: AtomicU32::new(0),
            diff_calls: AtomicU32::new(0),
            notes: Mutex::new(Vec::new()),
            inline_posts: Mutex::new(Vec::new()),
            reject_lines: Mutex::new(HashSet::new()),
            inline_failures_after: Mutex::new(None),
            next_id: AtomicU32::new(1),
        })
    }

    pub fn set_head_sha(&self, sha: &str) {
        self.details.lock().unwrap().head_sha = sha.to_string();
    }

    pub fn set_draft(&self, draft: bool) {
        self.details.lock().unwrap().draft = draft;
    }

    pub fn set_changed_lines(&self, lines: i64) {
        *self.diff.lock().unwrap() = diff_with_changed_lines(lines);
    }

    fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// A diff over a single file with the given number of changed lines.
pub fn diff_with_changed_lines(lines: i64) -> MrDiff {
    let mut fragment = String::from("@@ -1,0 +1,0 @@\n");
    for i in 0..lines {
        fragment.push_str(&format!("+line {}\n", i));
    }
    MrDiff {
        unified_diff: format!(
            "diff --git a/src/handler.go b/src/handler.go\n--- a/src/handler.go\n+++ b/src/handler.go\n{}",
            fragment
        ),
        changed_files: vec![ChangedFile {
            old_path: "src/handler.go".to_string(),
            new_path: "src/handler.go".to_string(),
            diff: fragment,
            new_file: false,
            deleted_file: false,
            renamed_file: false,
        }],
        changed_lines: lines,
    }
}

#[async_trait]
impl GitProvider for FakeProvider {
    async fn list_repos(&self) -> ProviderResult<Vec<Repo>> {
        Ok(vec![Repo {
            remote_id: "100".to_string(),
            name: "orders".to_string(),
            full_path: "team/orders".to_string(),
            http_url: "https://gitlab.example.com/team/orders.git".to_string(),
        }])
    }

    async fn get_mr_details(&self, _repo: &str, _mr: i64) -> ProviderResult<MrDetails> {
        self.details_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.details.lock().unwrap().clone())
    }

    async fn get_mr_diff(&self, _repo: &str, _mr: i64) -> ProviderResult<MrDiff> {
        self.diff_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.diff.lock().unwrap().clone())
    }

    async fn post_note(&self, _repo: &str, _mr: i64, body: &str) -> ProviderResult<CommentResult> {
        self.notes.lock().unwrap().push(body.to_string());
        Ok(CommentResult {
            id: format!("note-{}", self.next_id()),
        })
    }

    async fn post_inline_comment(
        &self,
        _repo: &str,
        _mr: i64,
        comment: &InlineComment,
    ) -> ProviderResult<CommentResult> {
        if self.reject_lines.lock().unwrap().contains(&comment.line) {
            return Err(ProviderError::InvalidInput(format!(
                "line {} is not part of the diff",
                comment.line
            )));
        }
        if let Some(after) = *self.inline_failures_after.lock().unwrap() {
            if self.inline_posts.lock().unwrap().len() as u32 >= after {
                return Err(ProviderError::Transient("connection reset".to_string()));
            }
        }
        self.inline_posts.lock().unwrap().push(comment.clone());
        Ok(CommentResult {
            id: format!("disc-{}", self.next_id()),
        })
    }
}

pub struct FakeFactory {
    pub provider: Arc<FakeProvider>,
}

impl ProviderFactory for FakeFactory {
    fn create(&self, _kind: ProviderKind, _base_url: &str, _token: &str) -> Arc<dyn GitProvider> {
        self.provider.clone()
    }
}

/// A reviewer returning a canned response.
pub struct FakeReviewer {
    pub response: Mutex<ReviewResponse>,
    pub calls: AtomicU32,
    pub fail_terminal: AtomicBool,
}

impl FakeReviewer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            response: Mutex::new(ReviewResponse {
                summary: "has a potential nil pointer issue".to_string(),
                comments: vec![
                    ReviewDraftComment {
                        file_path: "src/handler.go".to_string(),
                        line_start: 12,
                        line_end: 12,
                        body: "possible nil dereference".to_string(),
                    },
                    ReviewDraftComment {
                        file_path: "src/handler.go".to_string(),
                        line_start: 17,
                        line_end: 17,
                        body: "missing error check".to_string(),
                    },
                ],
            }),
            calls: AtomicU32::new(0),
            fail_terminal: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Reviewer for FakeReviewer {
    async fn run_review(&self, _request: &ReviewRequest) -> Result<ReviewResponse, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminal.load(Ordering::SeqCst) {
            return Err(StepError::terminal(anyhow::anyhow!(
                "model gateway returned 400"
            )));
        }
        Ok(self.response.lock().unwrap().clone())
    }
}

/// A dispatcher that records submits/cancels without executing anything.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub submitted: Mutex<Vec<(String, RunRequest)>>,
    pub cancelled: Mutex<Vec<String>>,
    next: AtomicU32,
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn submit(&self, key: &str, request: RunRequest) -> Result<String> {
        self.submitted
            .lock()
            .unwrap()
            .push((key.to_string(), request));
        Ok(format!("inv-{}", self.next.fetch_add(1, Ordering::SeqCst)))
    }

    async fn cancel(&self, invocation_id: &str) -> Result<CancelOutcome> {
        self.cancelled
            .lock()
            .unwrap()
            .push(invocation_id.to_string());
        Ok(CancelOutcome::Requested)
    }
}

/// Seed a database with the default org, one provider (encrypted token) and
/// one review-enabled repository. Returns the repo id.
pub fn seed_repo(db: &SqliteDb) -> String {
    let org_id = db.default_org_id().unwrap();
    let token = reviewd_core::crypto::encrypt(b"glpat-token", &test_encryption_key()).unwrap();
    let provider_id = db
        .insert_provider_with_repos(
            &org_id,
            ProviderKind::GitlabSelfHosted,
            "test-gitlab",
            "https://gitlab.example.com",
            &token,
            "hook-secret",
            &[crate::db::RepoUpsertInput {
                remote_id: "100".to_string(),
                name: "orders".to_string(),
                full_path: "team/orders".to_string(),
            }],
        )
        .unwrap();
    let repo = db
        .get_repo_by_remote_id(&provider_id, "100")
        .unwrap()
        .unwrap();
    db.set_review_enabled(&repo.id, true).unwrap();
    repo.id
}

pub struct TestHarness {
    pub db: Arc<SqliteDb>,
    pub deps: Arc<Deps>,
    pub provider: Arc<FakeProvider>,
    pub reviewer: Arc<FakeReviewer>,
    pub repo_id: String,
}

pub fn harness() -> TestHarness {
    let db = Arc::new(SqliteDb::new_in_memory().unwrap());
    let repo_id = seed_repo(&db);
    let provider = FakeProvider::new();
    let reviewer = FakeReviewer::new();
    let deps = Arc::new(Deps {
        db: db.clone(),
        encryption_key: test_encryption_key(),
        providers: Arc::new(FakeFactory {
            provider: provider.clone(),
        }),
        reviewer: reviewer.clone(),
        debounce_window: Duration::from_millis(200),
    });
    TestHarness {
        db,
        deps,
        provider,
        reviewer,
        repo_id,
    }
}

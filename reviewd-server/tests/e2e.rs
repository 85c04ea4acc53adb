//! End-to-end tests: webhook ingress through the durable runtime to a mock
//! GitLab instance and a mock reviewer, both served in-process over real
//! sockets.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

use reviewd_core::{crypto, ProviderKind};
use reviewd_server::admin::admin_router;
use reviewd_server::db::{RepoUpsertInput, RunStatus, SqliteDb};
use reviewd_server::gitlab::HttpProviderFactory;
use reviewd_server::orchestrator::Deps;
use reviewd_server::reviewer::HttpReviewer;
use reviewd_server::runtime::{Dispatcher, RetryPolicy, Runtime};
use reviewd_server::webhook::webhook_router;
use reviewd_server::AppState;

const WEBHOOK_SECRET: &str = "hook-secret";

fn encryption_key() -> Vec<u8> {
    (0u8..32).collect()
}

/// Scriptable mock GitLab instance.
#[derive(Default)]
struct MockGitlab {
    draft: Mutex<bool>,
    head_sha: Mutex<String>,
    notes: Mutex<Vec<String>>,
    discussions: Mutex<Vec<Value>>,
    next_note_id: AtomicU32,
}

impl MockGitlab {
    fn new() -> Arc<Self> {
        let mock = Self::default();
        *mock.head_sha.lock().unwrap() = "bbb222".to_string();
        Arc::new(mock)
    }
}

async fn start_mock_gitlab(mock: Arc<MockGitlab>) -> String {
    async fn projects() -> Json<Value> {
        Json(json!([{
            "id": 100,
            "name": "orders",
            "path_with_namespace": "team/orders",
            "http_url_to_repo": "https://gitlab.example.com/team/orders.git"
        }]))
    }

    async fn mr_details(State(mock): State<Arc<MockGitlab>>) -> Json<Value> {
        Json(json!({
            "title": "Add order processing",
            "description": "adds the order pipeline",
            "source_branch": "feature/orders",
            "target_branch": "main",
            "sha": *mock.head_sha.lock().unwrap(),
            "draft": *mock.draft.lock().unwrap(),
            "work_in_progress": false,
            "author": {"username": "dev"}
        }))
    }

    async fn mr_changes() -> Json<Value> {
        Json(json!({
            "changes": [{
                "old_path": "src/handler.go",
                "new_path": "src/handler.go",
                "diff": "@@ -10,4 +10,6 @@\n context\n-old\n+new\n+handler := order.Handler()\n+handler.Process()\n",
                "new_file": false,
                "deleted_file": false,
                "renamed_file": false
            }]
        }))
    }

    async fn mr_versions() -> Json<Value> {
        Json(json!([{
            "head_commit_sha": "bbb222",
            "base_commit_sha": "aaa111",
            "start_commit_sha": "aaa111"
        }]))
    }

    async fn post_note(
        State(mock): State<Arc<MockGitlab>>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let id = mock.next_note_id.fetch_add(1, Ordering::SeqCst) + 1;
        mock.notes
            .lock()
            .unwrap()
            .push(body["body"].as_str().unwrap_or_default().to_string());
        (StatusCode::CREATED, Json(json!({"id": id})))
    }

    async fn post_discussion(
        State(mock): State<Arc<MockGitlab>>,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let id = mock.next_note_id.fetch_add(1, Ordering::SeqCst) + 1;
        mock.discussions.lock().unwrap().push(body);
        (StatusCode::CREATED, Json(json!({"id": format!("disc-{}", id)})))
    }

    let app = Router::new()
        .route("/api/v4/projects", get(projects))
        .route("/api/v4/projects/{id}/merge_requests/{iid}", get(mr_details))
        .route(
            "/api/v4/projects/{id}/merge_requests/{iid}/changes",
            get(mr_changes),
        )
        .route(
            "/api/v4/projects/{id}/merge_requests/{iid}/versions",
            get(mr_versions),
        )
        .route(
            "/api/v4/projects/{id}/merge_requests/{iid}/notes",
            post(post_note),
        )
        .route(
            "/api/v4/projects/{id}/merge_requests/{iid}/discussions",
            post(post_discussion),
        )
        .with_state(mock);

    serve(app).await
}

#[derive(Default)]
struct MockReviewer {
    calls: AtomicU32,
    requests: Mutex<Vec<Value>>,
}

async fn start_mock_reviewer(mock: Arc<MockReviewer>) -> String {
    async fn review(
        State(mock): State<Arc<MockReviewer>>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        mock.calls.fetch_add(1, Ordering::SeqCst);
        mock.requests.lock().unwrap().push(body);
        Json(json!({
            "summary": "The handler has a potential nil pointer issue.",
            "comments": [
                {"file_path": "src/handler.go", "line_start": 12, "line_end": 12,
                 "body": "possible nil dereference"},
                {"file_path": "src/handler.go", "line_start": 17, "line_end": 17,
                 "body": "missing error check"}
            ]
        }))
    }

    let app = Router::new()
        .route("/review", post(review))
        .with_state(mock);
    serve(app).await
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

struct E2e {
    db: Arc<SqliteDb>,
    app: Router,
    gitlab: Arc<MockGitlab>,
    reviewer: Arc<MockReviewer>,
    provider_id: String,
    repo_id: String,
}

async fn setup() -> E2e {
    let gitlab = MockGitlab::new();
    let gitlab_url = start_mock_gitlab(gitlab.clone()).await;
    let reviewer_mock = Arc::new(MockReviewer::default());
    let reviewer_url = start_mock_reviewer(reviewer_mock.clone()).await;

    let db = Arc::new(SqliteDb::new_in_memory().unwrap());
    let org_id = db.default_org_id().unwrap();
    let token = crypto::encrypt(b"glpat-token", &encryption_key()).unwrap();
    let provider_id = db
        .insert_provider_with_repos(
            &org_id,
            ProviderKind::GitlabSelfHosted,
            "mock-gitlab",
            &gitlab_url,
            &token,
            WEBHOOK_SECRET,
            &[RepoUpsertInput {
                remote_id: "100".to_string(),
                name: "orders".to_string(),
                full_path: "team/orders".to_string(),
            }],
        )
        .unwrap();
    let repo_id = db
        .get_repo_by_remote_id(&provider_id, "100")
        .unwrap()
        .unwrap()
        .id;
    db.set_review_enabled(&repo_id, true).unwrap();

    let providers: Arc<dyn reviewd_server::gitlab::ProviderFactory> =
        Arc::new(HttpProviderFactory::new().unwrap());
    let reviewer = Arc::new(HttpReviewer::new(&reviewer_url, None, None).unwrap());
    let deps = Arc::new(Deps {
        db: db.clone(),
        encryption_key: encryption_key(),
        providers: providers.clone(),
        reviewer,
        debounce_window: Duration::from_millis(50),
    });
    let runtime = Arc::new(Runtime::new(
        db.clone(),
        deps,
        RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
    ));

    let dispatcher: Arc<dyn Dispatcher> = runtime;
    let state = Arc::new(AppState {
        db: db.clone(),
        dispatcher,
        providers,
        encryption_key: encryption_key(),
    });

    let app = Router::new()
        .merge(webhook_router())
        .merge(admin_router())
        .with_state(state);

    E2e {
        db,
        app,
        gitlab,
        reviewer: reviewer_mock,
        provider_id,
        repo_id,
    }
}

async fn send_webhook(e2e: &E2e, body: Value) -> StatusCode {
    let request = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{}", e2e.provider_id))
        .header("x-gitlab-token", WEBHOOK_SECRET)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    e2e.app.clone().oneshot(request).await.unwrap().status()
}

fn mr_event(action: &str, iid: i64, draft: bool) -> Value {
    json!({
        "object_kind": "merge_request",
        "project": {"id": 100},
        "object_attributes": {
            "iid": iid,
            "action": action,
            "draft": draft,
            "work_in_progress": false
        }
    })
}

/// Poll until the latest run for the MR reaches a terminal status.
async fn wait_for_terminal(e2e: &E2e, mr_number: i64) -> reviewd_server::db::ReviewRunRow {
    for _ in 0..200 {
        if let Some(run) = e2e.db.latest_run(&e2e.repo_id, mr_number).unwrap() {
            if run.status.is_terminal() {
                return run;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("review run for MR {} did not reach a terminal status", mr_number);
}

#[tokio::test]
async fn test_happy_path_review_flow() {
    let e2e = setup().await;

    let status = send_webhook(&e2e, mr_event("open", 1, false)).await;
    assert_eq!(status, StatusCode::OK);

    let run = wait_for_terminal(&e2e, 1).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.diff_hash.as_deref(), Some("bbb222"));
    assert_eq!(
        run.summary.as_deref(),
        Some("The handler has a potential nil pointer issue.")
    );

    // Both inline comments carry provider ids.
    let comments = e2e.db.comments_for_run(&run.id).unwrap();
    assert_eq!(comments.len(), 2);
    assert!(comments.iter().all(|c| c.posted()));

    // One summary note, two discussions, positions anchored to the version
    // SHAs on the new side.
    let notes = e2e.gitlab.notes.lock().unwrap();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].contains("nil pointer"));
    let discussions = e2e.gitlab.discussions.lock().unwrap();
    assert_eq!(discussions.len(), 2);
    for (discussion, line) in discussions.iter().zip([12, 17]) {
        let position = &discussion["position"];
        assert_eq!(position["base_sha"], "aaa111");
        assert_eq!(position["head_sha"], "bbb222");
        assert_eq!(position["start_sha"], "aaa111");
        assert_eq!(position["new_path"], "src/handler.go");
        assert_eq!(position["new_line"], line);
    }

    // The reviewer saw the reconstructed unified diff and the MR context.
    assert_eq!(e2e.reviewer.calls.load(Ordering::SeqCst), 1);
    let requests = e2e.reviewer.requests.lock().unwrap();
    let diff = requests[0]["diff"].as_str().unwrap();
    assert!(diff.starts_with("diff --git a/src/handler.go b/src/handler.go"));
    assert_eq!(requests[0]["mr_title"], "Add order processing");
    assert_eq!(requests[0]["source_branch"], "feature/orders");
}

#[tokio::test]
async fn test_draft_then_ready_reviews_once() {
    let e2e = setup().await;
    *e2e.gitlab.draft.lock().unwrap() = true;

    // Draft open: recorded, nothing dispatched, no provider traffic.
    let status = send_webhook(&e2e, mr_event("open", 42, true)).await;
    assert_eq!(status, StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let run = e2e.db.latest_run(&e2e.repo_id, 42).unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Draft);
    assert!(e2e.gitlab.notes.lock().unwrap().is_empty());
    assert_eq!(e2e.reviewer.calls.load(Ordering::SeqCst), 0);

    // Ready: the draft row transitions and the review runs.
    *e2e.gitlab.draft.lock().unwrap() = false;
    let mut ready = mr_event("update", 42, false);
    ready["changes"] = json!({"draft": {"previous": true, "current": false}});
    let status = send_webhook(&e2e, ready).await;
    assert_eq!(status, StatusCode::OK);

    let done = wait_for_terminal(&e2e, 42).await;
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.id, run.id, "the draft row itself was transitioned");
    assert_eq!(e2e.reviewer.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_repo_webhook_is_ignored() {
    let e2e = setup().await;

    let mut event = mr_event("open", 1, false);
    event["project"] = json!({"id": 999});
    let status = send_webhook(&e2e, event).await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(e2e.db.latest_run(&e2e.repo_id, 1).unwrap().is_none());
    assert!(e2e.db.unfinished_invocations().unwrap().is_empty());
    assert_eq!(e2e.reviewer.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_identical_diff_retrigger_skips() {
    let e2e = setup().await;

    send_webhook(&e2e, mr_event("open", 7, false)).await;
    let first = wait_for_terminal(&e2e, 7).await;
    assert_eq!(first.status, RunStatus::Completed);

    // Same head SHA pushed again: the new run is debounced, then skipped
    // without another reviewer call or provider comment.
    send_webhook(&e2e, mr_event("update", 7, false)).await;
    let second = wait_for_terminal(&e2e, 7).await;
    assert_eq!(second.status, RunStatus::Skipped);
    assert_ne!(second.id, first.id);

    assert_eq!(e2e.reviewer.calls.load(Ordering::SeqCst), 1);
    assert_eq!(e2e.gitlab.notes.lock().unwrap().len(), 1);
    assert_eq!(e2e.gitlab.discussions.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_admin_trigger_forces_rereview() {
    let e2e = setup().await;

    send_webhook(&e2e, mr_event("open", 3, false)).await;
    wait_for_terminal(&e2e, 3).await;
    assert_eq!(e2e.reviewer.calls.load(Ordering::SeqCst), 1);

    // Admin trigger with force bypasses the diff-hash dedup.
    let request = Request::builder()
        .method("POST")
        .uri("/rpc/reviews/trigger")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({"repo_id": e2e.repo_id, "mr_number": 3}).to_string(),
        ))
        .unwrap();
    let response = e2e.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let run = wait_for_terminal(&e2e, 3).await;
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(e2e.reviewer.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_repo_listing_follows_pagination() {
    use axum::extract::Query;
    use axum::response::IntoResponse;
    use std::collections::HashMap;

    // Three pages of projects, linked via x-next-page.
    async fn projects(Query(params): Query<HashMap<String, String>>) -> axum::response::Response {
        let page: u32 = params
            .get("page")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        let (ids, next): (&[i64], &str) = match page {
            1 => (&[1, 2], "2"),
            2 => (&[3, 4], "3"),
            _ => (&[5], ""),
        };
        let body: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "id": id,
                    "name": format!("repo-{}", id),
                    "path_with_namespace": format!("team/repo-{}", id),
                    "http_url_to_repo": format!("https://git.example/team/repo-{}.git", id)
                })
            })
            .collect();
        let mut response = axum::Json(body).into_response();
        if !next.is_empty() {
            response
                .headers_mut()
                .insert("x-next-page", next.parse().unwrap());
        }
        response
    }

    let app = Router::new().route("/api/v4/projects", get(projects));
    let gitlab_url = serve(app).await;

    let e2e = setup().await;
    let request = Request::builder()
        .method("POST")
        .uri("/rpc/providers/create")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({
                "type": "gitlab_self_hosted",
                "name": "paginated",
                "base_url": gitlab_url,
                "token": "glpat-other"
            })
            .to_string(),
        ))
        .unwrap();
    let response = e2e.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    let provider_id = body["provider"]["id"].as_str().unwrap();

    // All three pages landed, in order.
    let repos = e2e.db.list_repos_by_provider(provider_id).unwrap();
    let remote_ids: Vec<&str> = repos.iter().map(|r| r.remote_id.as_str()).collect();
    assert_eq!(remote_ids, vec!["1", "2", "3", "4", "5"]);
}

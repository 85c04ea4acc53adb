//! Admin RPC endpoints: provider CRUD, repository review toggles, manual
//! review triggers and run inspection.
//!
//! All endpoints are POST with JSON bodies. Errors use a small envelope
//! (`{code, message}`) with codes `invalid_argument`, `not_found` and
//! `internal`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use reviewd_core::{crypto, ProviderKind};

use crate::db::{self, ProviderRow, RepoRow, ReviewCommentRow, ReviewRunRow, RunStatus};
use crate::orchestrator::{orchestration_key, RunRequest};
use crate::AppState;

pub enum AdminError {
    InvalidArgument(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for AdminError {
    fn from(e: anyhow::Error) -> Self {
        AdminError::Internal(e)
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            AdminError::InvalidArgument(msg) => {
                (StatusCode::BAD_REQUEST, "invalid_argument", msg)
            }
            AdminError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AdminError::Internal(e) => {
                error!("admin: internal error: {:#}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal error".to_string(),
                )
            }
        };
        (status, Json(json!({ "code": code, "message": message }))).into_response()
    }
}

type AdminResult<T> = Result<Json<T>, AdminError>;

#[derive(Debug, Serialize)]
pub struct ProviderDto {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub base_url: String,
    pub created_at: String,
}

impl From<ProviderRow> for ProviderDto {
    fn from(row: ProviderRow) -> Self {
        Self {
            id: row.id,
            kind: row.kind.as_str().to_string(),
            name: row.name,
            base_url: row.base_url,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RepoDto {
    pub id: String,
    pub provider_id: String,
    pub remote_id: String,
    pub name: String,
    pub full_path: String,
    pub review_enabled: bool,
    pub created_at: String,
}

impl From<RepoRow> for RepoDto {
    fn from(row: RepoRow) -> Self {
        Self {
            id: row.id,
            provider_id: row.provider_id,
            remote_id: row.remote_id,
            name: row.name,
            full_path: row.full_path,
            review_enabled: row.review_enabled,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CommentDto {
    pub id: String,
    pub file_path: String,
    pub line_start: i64,
    pub line_end: i64,
    pub body: String,
    pub provider_comment_id: Option<String>,
    pub posted: bool,
}

impl From<ReviewCommentRow> for CommentDto {
    fn from(row: ReviewCommentRow) -> Self {
        let posted = row.posted();
        Self {
            id: row.id,
            file_path: row.file_path,
            line_start: row.line_start,
            line_end: row.line_end,
            body: row.body,
            provider_comment_id: row.provider_comment_id,
            posted,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ReviewRunDto {
    pub id: String,
    pub repo_id: String,
    pub mr_number: i64,
    pub status: String,
    pub summary: Option<String>,
    pub diff_hash: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comments: Option<Vec<CommentDto>>,
}

impl ReviewRunDto {
    fn from_row(row: ReviewRunRow, comments: Option<Vec<ReviewCommentRow>>) -> Self {
        Self {
            id: row.id,
            repo_id: row.repo_id,
            mr_number: row.mr_number,
            status: row.status.as_str().to_string(),
            summary: row.summary,
            diff_hash: row.diff_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
            comments: comments.map(|c| c.into_iter().map(CommentDto::from).collect()),
        }
    }
}

pub fn admin_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/rpc/providers/create", post(create_provider))
        .route("/rpc/providers/list", post(list_providers))
        .route("/rpc/providers/delete", post(delete_provider))
        .route("/rpc/repositories/list", post(list_repos))
        .route("/rpc/repositories/enable_review", post(enable_review))
        .route("/rpc/repositories/disable_review", post(disable_review))
        .route("/rpc/reviews/trigger", post(trigger_review))
        .route("/rpc/reviews/get", post(get_review_run))
}

#[derive(Debug, Deserialize)]
pub struct CreateProviderRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct CreateProviderResponse {
    pub provider: ProviderDto,
    /// Shown once at creation; configure it in the GitLab webhook settings.
    pub webhook_secret: String,
}

async fn create_provider(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateProviderRequest>,
) -> AdminResult<CreateProviderResponse> {
    if req.name.is_empty() {
        return Err(AdminError::InvalidArgument("name is required".to_string()));
    }
    if req.token.is_empty() {
        return Err(AdminError::InvalidArgument("token is required".to_string()));
    }
    let kind = ProviderKind::parse(&req.kind)
        .ok_or_else(|| AdminError::InvalidArgument("unsupported provider type".to_string()))?;

    let org_id = db::call(&state.db, |db| db.default_org_id()).await?;

    let token_encrypted = crypto::encrypt(req.token.as_bytes(), &state.encryption_key)?;

    // Enumerate repositories before writing anything, so a bad token or
    // unreachable instance never leaves a half-registered provider.
    let client = state.providers.create(kind, &req.base_url, &req.token);
    let repos = client
        .list_repos()
        .await
        .map_err(|e| AdminError::Internal(anyhow::anyhow!("listing repositories: {}", e)))?;
    let upserts: Vec<db::RepoUpsertInput> = repos
        .into_iter()
        .map(|r| db::RepoUpsertInput {
            remote_id: r.remote_id,
            name: r.name,
            full_path: r.full_path,
        })
        .collect();

    let webhook_secret = crypto::random_hex(32);

    let provider_id = {
        let secret = webhook_secret.clone();
        let name = req.name.clone();
        let base_url = req.base_url.clone();
        db::call(&state.db, move |db| {
            db.insert_provider_with_repos(
                &org_id,
                kind,
                &name,
                &base_url,
                &token_encrypted,
                &secret,
                &upserts,
            )
        })
        .await?
    };

    let provider = {
        let id = provider_id.clone();
        db::call(&state.db, move |db| db.get_provider(&id))
            .await?
            .ok_or_else(|| AdminError::Internal(anyhow::anyhow!("provider vanished after insert")))?
    };

    Ok(Json(CreateProviderResponse {
        provider: provider.into(),
        webhook_secret,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListProvidersRequest {}

#[derive(Debug, Serialize)]
pub struct ListProvidersResponse {
    pub providers: Vec<ProviderDto>,
}

async fn list_providers(
    State(state): State<Arc<AppState>>,
    Json(_req): Json<ListProvidersRequest>,
) -> AdminResult<ListProvidersResponse> {
    let rows = db::call(&state.db, |db| db.list_providers()).await?;
    Ok(Json(ListProvidersResponse {
        providers: rows.into_iter().map(ProviderDto::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct DeleteProviderRequest {
    pub id: String,
}

async fn delete_provider(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteProviderRequest>,
) -> AdminResult<serde_json::Value> {
    if req.id.is_empty() {
        return Err(AdminError::InvalidArgument("id is required".to_string()));
    }
    let deleted = {
        let id = req.id.clone();
        db::call(&state.db, move |db| db.soft_delete_provider(&id)).await?
    };
    if !deleted {
        return Err(AdminError::NotFound("provider not found".to_string()));
    }
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct ListReposRequest {
    pub provider_id: String,
}

#[derive(Debug, Serialize)]
pub struct ListReposResponse {
    pub repos: Vec<RepoDto>,
}

async fn list_repos(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ListReposRequest>,
) -> AdminResult<ListReposResponse> {
    if req.provider_id.is_empty() {
        return Err(AdminError::InvalidArgument(
            "provider_id is required".to_string(),
        ));
    }
    let provider = {
        let id = req.provider_id.clone();
        db::call(&state.db, move |db| db.get_provider(&id)).await?
    };
    if provider.is_none() {
        return Err(AdminError::NotFound("provider not found".to_string()));
    }

    let rows = {
        let id = req.provider_id.clone();
        db::call(&state.db, move |db| db.list_repos_by_provider(&id)).await?
    };
    Ok(Json(ListReposResponse {
        repos: rows.into_iter().map(RepoDto::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct SetReviewEnabledRequest {
    pub repo_id: String,
}

#[derive(Debug, Serialize)]
pub struct SetReviewEnabledResponse {
    pub repo: RepoDto,
}

async fn enable_review(
    state: State<Arc<AppState>>,
    req: Json<SetReviewEnabledRequest>,
) -> AdminResult<SetReviewEnabledResponse> {
    set_review_enabled(state, req, true).await
}

async fn disable_review(
    state: State<Arc<AppState>>,
    req: Json<SetReviewEnabledRequest>,
) -> AdminResult<SetReviewEnabledResponse> {
    set_review_enabled(state, req, false).await
}

async fn set_review_enabled(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetReviewEnabledRequest>,
    enabled: bool,
) -> AdminResult<SetReviewEnabledResponse> {
    if req.repo_id.is_empty() {
        return Err(AdminError::InvalidArgument("repo_id is required".to_string()));
    }
    let repo = {
        let id = req.repo_id.clone();
        db::call(&state.db, move |db| db.set_review_enabled(&id, enabled)).await?
    }
    .ok_or_else(|| AdminError::NotFound("repository not found".to_string()))?;

    Ok(Json(SetReviewEnabledResponse { repo: repo.into() }))
}

#[derive(Debug, Deserialize)]
pub struct TriggerReviewRequest {
    pub repo_id: String,
    pub mr_number: i64,
}

#[derive(Debug, Serialize)]
pub struct TriggerReviewResponse {
    pub review_run: ReviewRunDto,
}

/// Create a pending run and dispatch a forced orchestration for it. The admin
/// is authoritative: no draft or review-enabled checks here.
async fn trigger_review(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TriggerReviewRequest>,
) -> AdminResult<TriggerReviewResponse> {
    if req.repo_id.is_empty() {
        return Err(AdminError::InvalidArgument("repo_id is required".to_string()));
    }
    if req.mr_number <= 0 {
        return Err(AdminError::InvalidArgument(
            "mr_number must be positive".to_string(),
        ));
    }

    let repo = {
        let id = req.repo_id.clone();
        db::call(&state.db, move |db| db.get_repo(&id)).await?
    }
    .ok_or_else(|| AdminError::NotFound("repository not found".to_string()))?;

    let run_id = {
        let repo_id = repo.id.clone();
        let mr_number = req.mr_number;
        db::call(&state.db, move |db| {
            db.create_review_run(&repo_id, mr_number, RunStatus::Pending)
        })
        .await?
    };

    let key = orchestration_key(&repo.id, req.mr_number);
    let invocation_id = state
        .dispatcher
        .submit(
            &key,
            RunRequest {
                run_id: Some(run_id.clone()),
                repo_id: repo.id.clone(),
                mr_number: req.mr_number,
                dry_run: false,
                force: true,
            },
        )
        .await
        .map_err(AdminError::Internal)?;

    {
        let run_id_db = run_id.clone();
        db::call(&state.db, move |db| {
            db.set_run_invocation(&run_id_db, &invocation_id)
        })
        .await?;
    }

    let run = {
        let id = run_id.clone();
        db::call(&state.db, move |db| db.get_review_run(&id))
            .await?
            .ok_or_else(|| AdminError::Internal(anyhow::anyhow!("run vanished after insert")))?
    };

    Ok(Json(TriggerReviewResponse {
        review_run: ReviewRunDto::from_row(run, None),
    }))
}

#[derive(Debug, Deserialize)]
pub struct GetReviewRunRequest {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct GetReviewRunResponse {
    pub review_run: ReviewRunDto,
}

async fn get_review_run(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GetReviewRunRequest>,
) -> AdminResult<GetReviewRunResponse> {
    if req.id.is_empty() {
        return Err(AdminError::InvalidArgument("id is required".to_string()));
    }

    let run = {
        let id = req.id.clone();
        db::call(&state.db, move |db| db.get_review_run(&id)).await?
    }
    .ok_or_else(|| AdminError::NotFound("review run not found".to_string()))?;

    let comments = {
        let id = run.id.clone();
        db::call(&state.db, move |db| db.comments_for_run(&id)).await?
    };

    Ok(Json(GetReviewRunResponse {
        review_run: ReviewRunDto::from_row(run, Some(comments)),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteDb;
    use crate::test_support::{
        seed_repo, test_encryption_key, FakeFactory, FakeProvider, RecordingDispatcher,
    };
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct AdminHarness {
        state: Arc<AppState>,
        dispatcher: Arc<RecordingDispatcher>,
        db: Arc<SqliteDb>,
        repo_id: String,
    }

    fn admin_harness() -> AdminHarness {
        let db = Arc::new(SqliteDb::new_in_memory().unwrap());
        let repo_id = seed_repo(&db);
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = Arc::new(AppState {
            db: db.clone(),
            dispatcher: dispatcher.clone(),
            providers: Arc::new(FakeFactory {
                provider: FakeProvider::new(),
            }),
            encryption_key: test_encryption_key(),
        });
        AdminHarness {
            state,
            dispatcher,
            db,
            repo_id,
        }
    }

    async fn rpc(
        h: &AdminHarness,
        path: &str,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = admin_router()
            .with_state(h.state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_create_provider_syncs_repos_and_returns_secret() {
        let h = admin_harness();
        let (status, body) = rpc(
            &h,
            "/rpc/providers/create",
            json!({
                "type": "gitlab_self_hosted",
                "name": "corp-gitlab",
                "base_url": "https://gitlab.corp.example",
                "token": "glpat-xyz"
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["provider"]["name"], "corp-gitlab");
        assert_eq!(body["provider"]["type"], "gitlab_self_hosted");
        assert!(body["provider"].get("token_encrypted").is_none());
        let secret = body["webhook_secret"].as_str().unwrap();
        assert_eq!(secret.len(), 64);

        // Repos from the provider were upserted inside the same call.
        let provider_id = body["provider"]["id"].as_str().unwrap();
        let repos = h.db.list_repos_by_provider(provider_id).unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].remote_id, "100");

        // The token round-trips through the stored ciphertext.
        let stored = h.db.get_provider(provider_id).unwrap().unwrap();
        let decrypted =
            crypto::decrypt(&stored.token_encrypted, &test_encryption_key()).unwrap();
        assert_eq!(decrypted, b"glpat-xyz");
    }

    #[tokio::test]
    async fn test_create_provider_validation() {
        let h = admin_harness();

        let (status, body) = rpc(
            &h,
            "/rpc/providers/create",
            json!({"type": "gitlab_self_hosted", "name": "", "token": "t"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_argument");

        let (status, _) = rpc(
            &h,
            "/rpc/providers/create",
            json!({"type": "github", "name": "x", "token": "t"}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = rpc(
            &h,
            "/rpc/providers/create",
            json!({"type": "gitlab_cloud", "name": "x", "token": ""}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_delete_provider() {
        let h = admin_harness();
        let provider_id = h.db.list_providers().unwrap()[0].id.clone();

        let (status, _) = rpc(&h, "/rpc/providers/delete", json!({"id": provider_id})).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = rpc(&h, "/rpc/providers/delete", json!({"id": provider_id})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "not_found");
    }

    #[tokio::test]
    async fn test_enable_and_disable_review() {
        let h = admin_harness();
        h.db.set_review_enabled(&h.repo_id, false).unwrap();

        let (status, body) = rpc(
            &h,
            "/rpc/repositories/enable_review",
            json!({"repo_id": h.repo_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repo"]["review_enabled"], true);

        let (status, body) = rpc(
            &h,
            "/rpc/repositories/disable_review",
            json!({"repo_id": h.repo_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repo"]["review_enabled"], false);

        let (status, _) = rpc(
            &h,
            "/rpc/repositories/enable_review",
            json!({"repo_id": "missing"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_trigger_review_dispatches_forced_run() {
        let h = admin_harness();
        let (status, body) = rpc(
            &h,
            "/rpc/reviews/trigger",
            json!({"repo_id": h.repo_id, "mr_number": 5}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["review_run"]["status"], "pending");
        assert_eq!(body["review_run"]["mr_number"], 5);

        let submitted = h.dispatcher.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        let (key, req) = &submitted[0];
        assert_eq!(*key, format!("{}-5", h.repo_id));
        assert!(req.force, "admin triggers bypass the dedup check");
        assert_eq!(
            req.run_id.as_deref(),
            body["review_run"]["id"].as_str(),
            "the pre-created run id rides in the payload"
        );
    }

    #[tokio::test]
    async fn test_trigger_review_validation() {
        let h = admin_harness();

        let (status, _) = rpc(
            &h,
            "/rpc/reviews/trigger",
            json!({"repo_id": h.repo_id, "mr_number": 0}),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = rpc(
            &h,
            "/rpc/reviews/trigger",
            json!({"repo_id": "missing", "mr_number": 1}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        assert!(h.dispatcher.submitted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_review_run_includes_comments() {
        let h = admin_harness();
        let run_id = h
            .db
            .create_review_run(&h.repo_id, 3, RunStatus::Running)
            .unwrap();
        h.db.insert_review_comments(
            &run_id,
            &[crate::db::CommentInput {
                file_path: "src/handler.go".to_string(),
                line_start: 12,
                line_end: 12,
                body: "nil check".to_string(),
            }],
        )
        .unwrap();

        let (status, body) = rpc(&h, "/rpc/reviews/get", json!({"id": run_id})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["review_run"]["status"], "running");
        let comments = body["review_run"]["comments"].as_array().unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0]["posted"], false);

        let (status, _) = rpc(&h, "/rpc/reviews/get", json!({"id": "missing"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_providers_and_repos() {
        let h = admin_harness();

        let (status, body) = rpc(&h, "/rpc/providers/list", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["providers"].as_array().unwrap().len(), 1);
        let provider_id = body["providers"][0]["id"].as_str().unwrap().to_string();

        let (status, body) = rpc(
            &h,
            "/rpc/repositories/list",
            json!({"provider_id": provider_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["repos"].as_array().unwrap().len(), 1);
        assert_eq!(body["repos"][0]["full_path"], "team/orders");

        let (status, _) = rpc(
            &h,
            "/rpc/repositories/list",
            json!({"provider_id": "missing"}),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

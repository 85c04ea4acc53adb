//! Webhook ingress: validates inbound GitLab events, tracks the draft
//! lifecycle, and supersedes any active orchestration for the MR with a fresh
//! one (cancel-then-dispatch).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use serde::Deserialize;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

use crate::db::{self, RunStatus};
use crate::orchestrator::{orchestration_key, RunRequest};
use crate::runtime::CancelOutcome;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GitlabWebhookPayload {
    #[serde(default)]
    pub object_kind: String,
    pub project: Option<WebhookProject>,
    pub object_attributes: Option<MrAttributes>,
    pub changes: Option<WebhookChanges>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookProject {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct MrAttributes {
    #[serde(default)]
    pub iid: i64,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub work_in_progress: bool,
}

#[derive(Debug, Deserialize)]
pub struct WebhookChanges {
    pub draft: Option<FieldChange>,
}

#[derive(Debug, Deserialize)]
pub struct FieldChange {
    #[serde(default)]
    pub previous: serde_json::Value,
    #[serde(default)]
    pub current: serde_json::Value,
}

/// True when the `changes` block records a draft -> ready flip.
fn is_draft_to_ready_transition(changes: Option<&WebhookChanges>) -> bool {
    let Some(field) = changes.and_then(|c| c.draft.as_ref()) else {
        return false;
    };
    matches!(
        (field.previous.as_bool(), field.current.as_bool()),
        (Some(true), Some(false))
    )
}

pub fn webhook_router() -> Router<Arc<AppState>> {
    Router::new().route("/webhooks/{provider_id}", post(gitlab_webhook_handler))
}

fn internal_error() -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

fn ack() -> Response {
    StatusCode::OK.into_response()
}

pub async fn gitlab_webhook_handler(
    State(state): State<Arc<AppState>>,
    Path(provider_id): Path<String>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let provider = {
        let id = provider_id.clone();
        match db::call(&state.db, move |db| db.get_provider(&id)).await {
            Ok(Some(p)) => p,
            Ok(None) => return (StatusCode::NOT_FOUND, "provider not found").into_response(),
            Err(e) => {
                error!("webhook: loading provider {}: {:#}", provider_id, e);
                return internal_error();
            }
        }
    };

    // Shared-secret check, constant-time. A provider without a configured
    // secret accepts nothing.
    let token = headers
        .get("x-gitlab-token")
        .and_then(|v| v.to_str().ok());
    let authorized = match (token, provider.webhook_secret.as_deref()) {
        (Some(token), Some(secret)) => bool::from(token.as_bytes().ct_eq(secret.as_bytes())),
        _ => false,
    };
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }

    let payload: GitlabWebhookPayload = match serde_json::from_slice(&body) {
        Ok(p) => p,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid json").into_response(),
    };

    if payload.object_kind != "merge_request" {
        info!("webhook: ignoring non-MR event: {}", payload.object_kind);
        return ack();
    }

    let (Some(attrs), Some(project)) = (payload.object_attributes.as_ref(), payload.project.as_ref())
    else {
        info!("webhook: MR event without attributes or project, ignoring");
        return ack();
    };

    let action = attrs.action.as_str();
    if !matches!(action, "open" | "update" | "reopen") {
        info!("webhook: ignoring non-reviewable action: {}", action);
        return ack();
    }

    let mr_number = attrs.iid;
    let remote_id = project.id.to_string();
    info!(
        "webhook: provider={} action={} iid={} project_id={} draft={}",
        provider_id,
        action,
        mr_number,
        remote_id,
        attrs.draft || attrs.work_in_progress,
    );

    let repo = {
        let provider_id = provider.id.clone();
        let remote_id_for_call = remote_id.clone();
        match db::call(&state.db, move |db| {
            db.get_repo_by_remote_id(&provider_id, &remote_id_for_call)
        })
        .await
        {
            Ok(Some(r)) => r,
            Ok(None) => {
                info!(
                    "webhook: repo not found for provider={} remote_id={}, ignoring",
                    provider.id, remote_id
                );
                return ack();
            }
            Err(e) => {
                error!("webhook: looking up repo: {:#}", e);
                return internal_error();
            }
        }
    };
    if !repo.review_enabled {
        info!("webhook: review disabled for repo={}, ignoring", repo.id);
        return ack();
    }

    let is_draft = attrs.draft || attrs.work_in_progress;
    let is_draft_to_ready =
        action == "update" && is_draft_to_ready_transition(payload.changes.as_ref());

    if is_draft && !is_draft_to_ready {
        // Draft MR: record it, don't dispatch. The draft row transitions to
        // pending when the MR is marked ready.
        let repo_id = repo.id.clone();
        match db::call(&state.db, move |db| {
            db.create_review_run(&repo_id, mr_number, RunStatus::Draft)
        })
        .await
        {
            Ok(run_id) => {
                info!(
                    "webhook: draft MR {} recorded as run={}, skipping dispatch",
                    mr_number, run_id
                );
                return ack();
            }
            Err(e) => {
                error!("webhook: recording draft run: {:#}", e);
                return internal_error();
            }
        }
    }

    // Cancel any active orchestration for this MR (best-effort) before
    // dispatching its replacement.
    let active = {
        let repo_id = repo.id.clone();
        db::call(&state.db, move |db| {
            db.active_invocation_id(&repo_id, mr_number)
        })
        .await
    };
    match active {
        Ok(Some(invocation_id)) => match state.dispatcher.cancel(&invocation_id).await {
            Ok(CancelOutcome::Requested) => {
                info!(
                    "webhook: cancelled invocation {} for repo={} mr={}",
                    invocation_id, repo.id, mr_number
                );
            }
            Ok(CancelOutcome::NotFound) => {}
            Err(e) => {
                warn!(
                    "webhook: cancelling invocation {}: {:#} (continuing)",
                    invocation_id, e
                );
            }
        },
        Ok(None) => {}
        Err(e) => warn!("webhook: looking up active invocation: {:#}", e),
    }

    // The ingress owns the run row: transition the draft row (draft -> ready)
    // or create a fresh pending one, then hand its id to the orchestration.
    let run_id = if is_draft_to_ready {
        let repo_id = repo.id.clone();
        match db::call(&state.db, move |db| {
            db.transition_draft_to_pending(&repo_id, mr_number)
        })
        .await
        {
            Ok(Some(id)) => {
                info!("webhook: MR {} draft->ready, transitioned run={}", mr_number, id);
                id
            }
            Ok(None) => {
                // Ready transition without a recorded draft (e.g. the draft
                // webhook was missed); fall through to a fresh row.
                let repo_id = repo.id.clone();
                match db::call(&state.db, move |db| {
                    db.create_review_run(&repo_id, mr_number, RunStatus::Pending)
                })
                .await
                {
                    Ok(id) => id,
                    Err(e) => {
                        error!("webhook: creating review run: {:#}", e);
                        return internal_error();
                    }
                }
            }
            Err(e) => {
                error!("webhook: transitioning draft run: {:#}", e);
                return internal_error();
            }
        }
    } else {
        let repo_id = repo.id.clone();
        match db::call(&state.db, move |db| {
            db.create_review_run(&repo_id, mr_number, RunStatus::Pending)
        })
        .await
        {
            Ok(id) => id,
            Err(e) => {
                error!("webhook: creating review run: {:#}", e);
                return internal_error();
            }
        }
    };

    let key = orchestration_key(&repo.id, mr_number);
    let request = RunRequest {
        run_id: Some(run_id.clone()),
        repo_id: repo.id.clone(),
        mr_number,
        dry_run: false,
        force: false,
    };
    let invocation_id = match state.dispatcher.submit(&key, request).await {
        Ok(id) => id,
        Err(e) => {
            error!("webhook: submitting orchestration: {:#}", e);
            return internal_error();
        }
    };

    {
        let run_id_db = run_id.clone();
        let invocation_db = invocation_id.clone();
        if let Err(e) = db::call(&state.db, move |db| {
            db.set_run_invocation(&run_id_db, &invocation_db)
        })
        .await
        {
            error!("webhook: recording invocation id: {:#}", e);
            return internal_error();
        }
    }

    info!(
        "webhook: dispatched run={} invocation={} repo={} mr={}",
        run_id, invocation_id, repo.id, mr_number
    );
    ack()
}

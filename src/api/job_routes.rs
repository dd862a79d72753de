//! Job status and cancellation endpoints

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::database::{JobRepository, PermissionRepository};
use crate::error::{DomainError, DomainResult};
use crate::models::{AnalysisRun, PermissionKind, RunStatus, User};

use super::auth::AuthUser;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct JobListQuery {
    pub dataset_id: Option<Uuid>,
    pub status: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

/// A job is visible to its owner and to anyone who can read its dataset.
async fn load_visible_job(
    state: &AppState,
    user: &User,
    job_id: Uuid,
) -> DomainResult<AnalysisRun> {
    let job = JobRepository::get(&state.pool, job_id)
        .await?
        .ok_or(DomainError::NotFound)?;

    if job.user_id != user.id {
        PermissionRepository::check(&state.pool, user, job.dataset_id, PermissionKind::Read)
            .await?;
    }

    Ok(job)
}

async fn get_job(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(job_id): Path<Uuid>,
) -> DomainResult<impl IntoResponse> {
    let job = load_visible_job(&state, &user, job_id).await?;
    Ok(Json(job))
}

async fn list_jobs(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<JobListQuery>,
) -> DomainResult<impl IntoResponse> {
    let status = match &query.status {
        None => None,
        Some(s) => Some(RunStatus::parse(s).ok_or_else(|| {
            DomainError::Validation(format!("unknown job status '{s}'"))
        })?),
    };

    let (offset, limit) =
        crate::services::page_bounds(query.offset, query.limit, state.config.max_page_limit)?;

    let jobs = JobRepository::list_for_user(
        &state.pool,
        user.id,
        query.dataset_id,
        status,
        offset,
        limit,
    )
    .await?;
    Ok(Json(jobs))
}

async fn cancel_job(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(job_id): Path<Uuid>,
) -> DomainResult<impl IntoResponse> {
    let job = load_visible_job(&state, &user, job_id).await?;

    // Only the owner or a dataset admin may cancel.
    if job.user_id != user.id {
        PermissionRepository::check(&state.pool, &user, job.dataset_id, PermissionKind::Admin)
            .await?;
    }

    let cancelled = JobRepository::cancel(&state.pool, job_id).await?;
    if !cancelled {
        return Err(DomainError::BusinessRule(
            "job is already in a terminal state".into(),
        ));
    }

    tracing::info!(job_id = %job_id, user_id = %user.id, "job cancelled");
    Ok(Json(json!({"job_id": job_id, "status": "cancelled"})))
}

/// Create router for job endpoints
pub fn create_job_router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/:id", get(get_job))
        .route("/api/jobs/:id/cancel", post(cancel_job))
        .with_state(state)
}

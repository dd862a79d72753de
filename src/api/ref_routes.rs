//! Branch (ref) endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use uuid::Uuid;

use crate::error::DomainResult;
use crate::services::ref_service::CreateRefRequest;

use super::auth::AuthUser;
use super::AppState;

async fn create_ref(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(dataset_id): Path<Uuid>,
    Json(req): Json<CreateRefRequest>,
) -> DomainResult<impl IntoResponse> {
    let created = state.refs.create(&user, dataset_id, req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn list_refs(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(dataset_id): Path<Uuid>,
) -> DomainResult<impl IntoResponse> {
    let refs = state.refs.list(&user, dataset_id).await?;
    Ok(Json(refs))
}

async fn delete_ref(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, name)): Path<(Uuid, String)>,
) -> DomainResult<impl IntoResponse> {
    state.refs.delete(&user, dataset_id, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create router for ref endpoints
pub fn create_ref_router(state: AppState) -> Router {
    Router::new()
        .route("/api/datasets/:id/refs", get(list_refs).post(create_ref))
        .route("/api/datasets/:id/refs/:name", delete(delete_ref))
        .with_state(state)
}

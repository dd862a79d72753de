//! Dataset CRUD, discovery and permission endpoints

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::models::PermissionKind;
use crate::services::dataset_service::{CreateDatasetRequest, UpdateDatasetRequest};

use super::auth::AuthUser;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_ref")]
    pub r#ref: String,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_ref() -> String {
    crate::models::MAIN_REF.to_string()
}

#[derive(Debug, Deserialize)]
pub struct GrantRequest {
    pub user_id: Uuid,
    pub kind: String,
}

async fn create_dataset(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(req): Json<CreateDatasetRequest>,
) -> DomainResult<impl IntoResponse> {
    let summary = state.datasets.create(&user, req).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

async fn list_datasets(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(page): Query<PageQuery>,
) -> DomainResult<impl IntoResponse> {
    let datasets = state.datasets.list(&user, page.offset, page.limit).await?;
    Ok(Json(datasets))
}

async fn search_datasets(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Query(query): Query<SearchQuery>,
) -> DomainResult<impl IntoResponse> {
    let results = state
        .datasets
        .search(&user, &query.q, query.offset, query.limit)
        .await?;
    Ok(Json(results))
}

async fn get_dataset(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(dataset_id): Path<Uuid>,
) -> DomainResult<impl IntoResponse> {
    let (dataset, tags) = state.datasets.get(&user, dataset_id).await?;
    Ok(Json(json!({
        "id": dataset.id,
        "name": dataset.name,
        "description": dataset.description,
        "created_by": dataset.created_by,
        "created_at": dataset.created_at,
        "updated_at": dataset.updated_at,
        "tags": tags,
    })))
}

async fn update_dataset(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(dataset_id): Path<Uuid>,
    Json(req): Json<UpdateDatasetRequest>,
) -> DomainResult<impl IntoResponse> {
    let dataset = state.datasets.update(&user, dataset_id, req).await?;
    Ok(Json(dataset))
}

async fn delete_dataset(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(dataset_id): Path<Uuid>,
) -> DomainResult<impl IntoResponse> {
    state.datasets.delete(&user, dataset_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_overview(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(dataset_id): Path<Uuid>,
) -> DomainResult<impl IntoResponse> {
    let overview = state.queries.get_overview(&user, dataset_id).await?;
    Ok(Json(overview))
}

async fn get_history(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(dataset_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> DomainResult<impl IntoResponse> {
    let commits = state
        .refs
        .history(&user, dataset_id, &query.r#ref, query.offset, query.limit)
        .await?;
    Ok(Json(commits))
}

async fn list_permissions(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(dataset_id): Path<Uuid>,
) -> DomainResult<impl IntoResponse> {
    let permissions = state.datasets.list_permissions(&user, dataset_id).await?;
    let body: Vec<_> = permissions
        .into_iter()
        .map(|(user_id, username, kind)| {
            json!({"user_id": user_id, "username": username, "kind": kind.as_str()})
        })
        .collect();
    Ok(Json(body))
}

async fn grant_permission(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(dataset_id): Path<Uuid>,
    Json(req): Json<GrantRequest>,
) -> DomainResult<impl IntoResponse> {
    let kind = PermissionKind::parse(&req.kind).ok_or_else(|| {
        DomainError::Validation(format!(
            "unknown permission kind '{}'; expected read, write or admin",
            req.kind
        ))
    })?;
    state
        .datasets
        .grant_permission(&user, dataset_id, req.user_id, kind)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke_permission(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, target_user)): Path<(Uuid, Uuid)>,
) -> DomainResult<impl IntoResponse> {
    state
        .datasets
        .revoke_permission(&user, dataset_id, target_user)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create router for dataset endpoints
pub fn create_dataset_router(state: AppState) -> Router {
    Router::new()
        .route("/api/datasets", post(create_dataset).get(list_datasets))
        .route("/api/datasets/search", get(search_datasets))
        .route(
            "/api/datasets/:id",
            get(get_dataset).patch(update_dataset).delete(delete_dataset),
        )
        .route("/api/datasets/:id/overview", get(get_overview))
        .route("/api/datasets/:id/history", get(get_history))
        .route(
            "/api/datasets/:id/permissions",
            get(list_permissions).post(grant_permission),
        )
        .route(
            "/api/datasets/:id/permissions/:user_id",
            delete(revoke_permission),
        )
        .with_state(state)
}

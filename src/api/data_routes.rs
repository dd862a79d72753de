//! Data read endpoints: paginated rows at a ref or pinned commit, table
//! listings, schemas, and SQL preview.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::DomainResult;

use super::auth::AuthUser;
use super::AppState;

#[derive(Debug, Deserialize)]
pub struct DataQuery {
    pub table_key: String,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    100
}

#[derive(Debug, Deserialize)]
pub struct SchemaQuery {
    pub table_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SqlPreviewRequest {
    pub table_key: String,
    pub sql: String,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

async fn data_at_ref(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, ref_name)): Path<(Uuid, String)>,
    Query(query): Query<DataQuery>,
) -> DomainResult<impl IntoResponse> {
    let page = state
        .queries
        .get_data_at_ref(
            &user,
            dataset_id,
            &ref_name,
            &query.table_key,
            query.offset,
            query.limit,
        )
        .await?;
    Ok(Json(page))
}

async fn data_at_commit(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, commit_id)): Path<(Uuid, String)>,
    Query(query): Query<DataQuery>,
) -> DomainResult<impl IntoResponse> {
    let page = state
        .queries
        .get_data_at_commit(
            &user,
            dataset_id,
            &commit_id,
            &query.table_key,
            query.offset,
            query.limit,
        )
        .await?;
    Ok(Json(page))
}

async fn get_commit(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, commit_id)): Path<(Uuid, String)>,
) -> DomainResult<impl IntoResponse> {
    let commit = state.queries.get_commit(&user, dataset_id, &commit_id).await?;
    Ok(Json(commit))
}

async fn get_schema(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, commit_id)): Path<(Uuid, String)>,
    Query(query): Query<SchemaQuery>,
) -> DomainResult<impl IntoResponse> {
    let schema = state
        .queries
        .get_schema(&user, dataset_id, &commit_id, query.table_key.as_deref())
        .await?;
    Ok(Json(schema))
}

async fn list_tables(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, commit_id)): Path<(Uuid, String)>,
) -> DomainResult<impl IntoResponse> {
    let tables = state.queries.list_tables(&user, dataset_id, &commit_id).await?;
    Ok(Json(tables))
}

async fn sql_preview(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, commit_id)): Path<(Uuid, String)>,
    Json(req): Json<SqlPreviewRequest>,
) -> DomainResult<impl IntoResponse> {
    let result = state
        .sql
        .preview(
            &user,
            dataset_id,
            &commit_id,
            &req.table_key,
            &req.sql,
            req.limit,
        )
        .await?;
    Ok(Json(result))
}

/// Create router for data read endpoints
pub fn create_data_router(state: AppState) -> Router {
    Router::new()
        .route("/api/datasets/:id/refs/:ref/data", get(data_at_ref))
        .route("/api/datasets/:id/commits/:commit_id/data", get(data_at_commit))
        .route("/api/datasets/:id/commits/:commit_id", get(get_commit))
        .route("/api/datasets/:id/commits/:commit_id/schema", get(get_schema))
        .route("/api/datasets/:id/commits/:commit_id/tables", get(list_tables))
        .route("/api/datasets/:id/commits/:commit_id/sql", post(sql_preview))
        .with_state(state)
}

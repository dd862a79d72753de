//! Import upload and derived-op enqueue endpoints
//!
//! The import endpoint streams the multipart upload into the staging area
//! chunk by chunk, enforcing the size cap before anything is enqueued, then
//! creates a pending import job and answers 202 with the job id. Sampling
//! and exploration runs are enqueued against the resolved tip of a ref.

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use crate::database::unit_of_work::UnitOfWork;
use crate::database::{JobRepository, PermissionRepository, RefRepository};
use crate::error::{DomainError, DomainResult};
use crate::import::staging::StagedUploadWriter;
use crate::import::ImportParams;
use crate::models::{PermissionKind, RunType};
use crate::services::sampling_service::SamplingParams;

use super::auth::AuthUser;
use super::AppState;

async fn import_upload(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, ref_name)): Path<(Uuid, String)>,
    mut multipart: Multipart,
) -> DomainResult<impl IntoResponse> {
    PermissionRepository::check(&state.pool, &user, dataset_id, PermissionKind::Write).await?;

    // The target ref must exist before we accept any bytes.
    RefRepository::resolve(&state.pool, dataset_id, &ref_name)
        .await?
        .ok_or(DomainError::NotFound)?;

    let active = JobRepository::count_active(&state.pool, dataset_id, RunType::Import).await?;
    if active >= state.config.import.max_concurrent_imports {
        return Err(DomainError::QuotaExceeded(format!(
            "dataset already has {active} imports in flight"
        )));
    }

    let mut staged = None;
    let mut original_filename = String::from("upload");
    let mut message = String::from("import");

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| DomainError::Validation(format!("malformed multipart body: {e}")))?
    {
        let field_name = field.name().map(|s| s.to_string());
        match field_name.as_deref() {
            Some("file") => {
                if let Some(name) = field.file_name() {
                    original_filename = name.to_string();
                }

                let mut writer = StagedUploadWriter::create(
                    &state.config.import.staging_dir,
                    state.config.import.max_upload_bytes,
                    state.config.import.chunk_bytes,
                )
                .await?;

                loop {
                    let chunk = match field.chunk().await {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(e) => {
                            writer.abort().await;
                            return Err(DomainError::Validation(format!(
                                "upload stream failed: {e}"
                            )));
                        }
                    };
                    if let Err(err) = writer.append(&chunk).await {
                        writer.abort().await;
                        return Err(err);
                    }
                }

                staged = Some(writer.finish().await?);
            }
            Some("message") => {
                message = field
                    .text()
                    .await
                    .map_err(|e| DomainError::Validation(format!("bad message field: {e}")))?;
            }
            _ => {}
        }
    }

    let staged = staged
        .ok_or_else(|| DomainError::Validation("multipart field 'file' is required".into()))?;

    let params = ImportParams {
        file_path: staged.path.clone(),
        original_filename,
        file_bytes: staged.bytes,
        ref_name,
        message,
    };

    let mut uow = UnitOfWork::begin(&state.pool).await?;
    let job_id = crate::import::enqueue_import(&mut uow, dataset_id, user.id, &params).await?;
    uow.commit().await?;

    tracing::info!(job_id = %job_id, dataset_id = %dataset_id, bytes = staged.bytes, "import enqueued");
    Ok((StatusCode::ACCEPTED, Json(json!({"job_id": job_id}))))
}

async fn enqueue_sampling(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, ref_name)): Path<(Uuid, String)>,
    Json(params): Json<SamplingParams>,
) -> DomainResult<impl IntoResponse> {
    // Sampling persists derived commits, so it requires write.
    PermissionRepository::check(&state.pool, &user, dataset_id, PermissionKind::Write).await?;

    if params.rounds.is_empty() {
        return Err(DomainError::Validation("at least one sampling round is required".into()));
    }

    let source_commit = RefRepository::resolve(&state.pool, dataset_id, &ref_name)
        .await?
        .ok_or(DomainError::NotFound)?
        .ok_or_else(|| DomainError::Validation(format!("ref '{ref_name}' has no commits yet")))?;

    let value = serde_json::to_value(&params)
        .map_err(|e| DomainError::Validation(format!("bad sampling parameters: {e}")))?;

    let mut uow = UnitOfWork::begin(&state.pool).await?;
    let job_id = JobRepository::enqueue(
        uow.tx(),
        RunType::Sampling,
        dataset_id,
        Some(source_commit.as_str()),
        user.id,
        &value,
    )
    .await?;
    uow.commit().await?;

    Ok((StatusCode::ACCEPTED, Json(json!({"job_id": job_id}))))
}

#[derive(Debug, Deserialize)]
pub struct ExploreRequest {
    pub table_key: String,
    /// Profiling adds value frequencies and numeric means.
    #[serde(default)]
    pub profile: bool,
    pub max_rows: Option<u64>,
}

async fn enqueue_exploration(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path((dataset_id, ref_name)): Path<(Uuid, String)>,
    Json(req): Json<ExploreRequest>,
) -> DomainResult<impl IntoResponse> {
    PermissionRepository::check(&state.pool, &user, dataset_id, PermissionKind::Read).await?;

    let source_commit = RefRepository::resolve(&state.pool, dataset_id, &ref_name)
        .await?
        .ok_or(DomainError::NotFound)?
        .ok_or_else(|| DomainError::Validation(format!("ref '{ref_name}' has no commits yet")))?;

    let run_type = if req.profile {
        RunType::Profiling
    } else {
        RunType::Exploration
    };
    let value = json!({"table_key": req.table_key, "max_rows": req.max_rows});

    let mut uow = UnitOfWork::begin(&state.pool).await?;
    let job_id = JobRepository::enqueue(
        uow.tx(),
        run_type,
        dataset_id,
        Some(source_commit.as_str()),
        user.id,
        &value,
    )
    .await?;
    uow.commit().await?;

    Ok((StatusCode::ACCEPTED, Json(json!({"job_id": job_id}))))
}

/// Create router for import and derived-op endpoints
pub fn create_import_router(state: AppState) -> Router {
    // The streaming cap is enforced by the staging writer; the axum body
    // limit just needs headroom for the multipart framing.
    let body_limit = state.config.import.max_upload_bytes as usize + (4 << 20);

    Router::new()
        .route(
            "/api/datasets/:id/refs/:ref/import",
            post(import_upload).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/api/datasets/:id/refs/:ref/sample", post(enqueue_sampling))
        .route("/api/datasets/:id/refs/:ref/explore", post(enqueue_exploration))
        .with_state(state)
}

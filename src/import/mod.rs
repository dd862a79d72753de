//! Import pipeline
//!
//! Turns a staged upload into a new commit parented on the current tip of
//! the target ref, with at most one successful ref advance per job.
//!
//! The worker-side flow: resolve the parent tip (or recover it from a
//! checkpoint), stream-parse the file in batches, canonicalize + hash each
//! batch, set-insert novel rows into the row store while staging manifest
//! pairs in the unlogged scratch table, then create the commit, materialize
//! the manifest, capture the schema and advance the ref by compare-and-set.
//! If the CAS loses, the job reparents onto the new tip and retries exactly
//! once before failing with `RefMovedUnderImport`.

pub mod readers;
pub mod staging;

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::config::ImportConfig;
use crate::database::{CommitRepository, DatasetRepository, JobRepository, RefRepository, RowStore, UnitOfWork};
use crate::error::{DomainError, DomainResult};
use crate::events::{event_types, DomainEvent, EventBus};
use crate::models::{
    AnalysisRun, Commit, CommitSchema, ImportCheckpoint, ManifestEntry, RunProgress, RunStatus,
};

use readers::{spawn_reader, ReaderEvent};

/// Import job parameters, stored at the top level of `run_parameters`
/// (alongside the `progress` and `checkpoint` substructures written while
/// the job runs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportParams {
    pub file_path: PathBuf,
    pub original_filename: String,
    pub file_bytes: u64,
    pub ref_name: String,
    pub message: String,
}

#[derive(Debug)]
pub enum ImportOutcome {
    Completed(Value),
    Cancelled,
}

pub struct ImportPipeline {
    pool: PgPool,
    config: ImportConfig,
    bus: EventBus,
}

impl ImportPipeline {
    pub fn new(pool: PgPool, config: ImportConfig, bus: EventBus) -> Self {
        Self { pool, config, bus }
    }

    /// Execute one claimed import job. Temp file and scratch rows are
    /// cleaned up on every exit path.
    pub async fn run(&self, job: &AnalysisRun) -> DomainResult<ImportOutcome> {
        let params: ImportParams = serde_json::from_value(job.run_parameters.clone())
            .map_err(|e| DomainError::Validation(format!("bad import parameters: {e}")))?;

        let result = self.run_inner(job, &params).await;

        // Stage 11: cleanup regardless of outcome.
        staging::remove_staged(&params.file_path).await;
        if let Err(e) = CommitRepository::clear_staging(&self.pool, job.id).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to clear import scratch region");
        }

        result
    }

    async fn run_inner(
        &self,
        job: &AnalysisRun,
        params: &ImportParams,
    ) -> DomainResult<ImportOutcome> {
        let checkpoint: Option<ImportCheckpoint> = job
            .run_parameters
            .get("checkpoint")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok());

        // The parent observed at job start. A resumed job must keep the
        // parent it originally observed, not re-read the tip.
        let parent_at_start = match &checkpoint {
            Some(cp) => cp.parent_at_start.clone(),
            None => RefRepository::resolve(&self.pool, job.dataset_id, &params.ref_name)
                .await?
                .ok_or(DomainError::NotFound)?,
        };

        let format = readers::detect_format(&params.file_path, &params.original_filename)?;
        tracing::info!(
            job_id = %job.id,
            dataset_id = %job.dataset_id,
            ref_name = %params.ref_name,
            format = format.as_str(),
            resumed = checkpoint.is_some(),
            "starting import"
        );

        let mut rows_emitted: BTreeMap<String, u64> = checkpoint
            .as_ref()
            .map(|cp| cp.rows_emitted_per_sheet.clone())
            .unwrap_or_default();
        let mut manifest_length: u64 = checkpoint.as_ref().map(|cp| cp.manifest_length).unwrap_or(0);

        let mut rx = spawn_reader(
            params.file_path.clone(),
            format,
            self.config.batch_size,
            rows_emitted.clone(),
        );

        let mut schemas: Option<BTreeMap<String, crate::models::TableSchema>> = None;
        let mut batches_done: u64 = 0;
        let checkpoint_every = self.config.checkpoint_interval_batches.max(1);

        while let Some(event) = rx.recv().await {
            match event? {
                ReaderEvent::Batch(batch) => {
                    // Cancellation is observed at batch boundaries.
                    match JobRepository::heartbeat(&self.pool, job.id).await? {
                        Some(RunStatus::Cancelled) => {
                            tracing::info!(job_id = %job.id, "import cancelled at batch boundary");
                            return Ok(ImportOutcome::Cancelled);
                        }
                        Some(RunStatus::Running) => {}
                        other => {
                            return Err(DomainError::Transient(format!(
                                "job left running state unexpectedly: {other:?}"
                            )));
                        }
                    }

                    let mut store_batch = Vec::with_capacity(batch.rows.len());
                    let mut entries = Vec::with_capacity(batch.rows.len());
                    for row in &batch.rows {
                        let (hash, canonical) = crate::canonical::canonicalize_and_hash(&row.data);
                        entries.push(ManifestEntry {
                            table_key: row.table_key.clone(),
                            row_index: row.row_index,
                            row_hash: hash.clone(),
                        });
                        store_batch.push((hash, canonical));
                        let emitted = rows_emitted.entry(row.table_key.clone()).or_insert(0);
                        *emitted = (*emitted).max(row.row_index as u64);
                    }

                    // One transaction per batch: novel rows + staged manifest.
                    let mut tx = self.pool.begin().await?;
                    RowStore::put_rows(&mut tx, &store_batch).await?;
                    CommitRepository::stage_manifest_batch(&mut tx, job.id, &entries).await?;
                    tx.commit().await?;

                    manifest_length += entries.len() as u64;
                    batches_done += 1;

                    let progress = RunProgress {
                        bytes_processed: batch.file_position,
                        bytes_total: params.file_bytes,
                        rows_processed: manifest_length,
                    };
                    JobRepository::set_progress(&self.pool, job.id, &progress).await?;

                    if batches_done % checkpoint_every == 0 {
                        let cp = ImportCheckpoint {
                            file_position: batch.file_position,
                            rows_emitted_per_sheet: rows_emitted.clone(),
                            manifest_length,
                            parent_at_start: parent_at_start.clone(),
                        };
                        JobRepository::set_checkpoint(&self.pool, job.id, &cp).await?;
                    }
                }
                ReaderEvent::Done(summary) => {
                    schemas = Some(summary.schemas);
                }
            }
        }

        let schemas = schemas.ok_or_else(|| {
            DomainError::InvalidFileFormat("reader terminated without a summary".into())
        })?;
        let schema = CommitSchema { tables: schemas };

        // The scratch table is the source of truth for the manifest; a
        // crash between staging and checkpointing can leave the running
        // counter behind it.
        let staged_total = CommitRepository::staged_manifest_count(&self.pool, job.id).await? as u64;
        if staged_total != manifest_length {
            tracing::warn!(
                job_id = %job.id,
                staged = staged_total,
                counted = manifest_length,
                "staged manifest disagrees with running counter; using staged count"
            );
            manifest_length = staged_total;
        }

        // Stage 8/9: commit, then CAS; reparent and retry once on loss.
        let commit = match self
            .try_commit(job, params, parent_at_start.as_deref(), &schema)
            .await?
        {
            Some(commit) => commit,
            None => {
                let new_tip = RefRepository::resolve(&self.pool, job.dataset_id, &params.ref_name)
                    .await?
                    .ok_or(DomainError::NotFound)?;
                tracing::warn!(
                    job_id = %job.id,
                    ref_name = %params.ref_name,
                    "ref moved during import; reparenting onto new tip"
                );
                match self
                    .try_commit(job, params, new_tip.as_deref(), &schema)
                    .await?
                {
                    Some(commit) => commit,
                    None => return Err(DomainError::RefMovedUnderImport),
                }
            }
        };

        let sheets: Vec<Value> = rows_emitted
            .iter()
            .map(|(key, count)| json!({"key": key, "row_count": count}))
            .collect();

        tracing::info!(
            job_id = %job.id,
            commit_id = %commit.commit_id,
            rows = manifest_length,
            "import complete"
        );

        Ok(ImportOutcome::Completed(json!({
            "commit_id": commit.commit_id,
            "row_count": manifest_length,
            "sheets": sheets,
        })))
    }

    /// Create the commit, materialize the staged manifest and schema, and
    /// attempt the CAS advance. Returns `None` (after rollback) if another
    /// commit advanced the ref first; nothing is persisted in that case.
    async fn try_commit(
        &self,
        job: &AnalysisRun,
        params: &ImportParams,
        parent: Option<&str>,
        schema: &CommitSchema,
    ) -> DomainResult<Option<Commit>> {
        let mut uow = UnitOfWork::begin(&self.pool).await?;

        // The job id salts the commit id, so a retried job regenerates the
        // same id for the same parent.
        let commit = CommitRepository::create_commit(
            uow.tx(),
            job.dataset_id,
            parent,
            &params.message,
            job.user_id,
            Utc::now(),
            job.id,
        )
        .await?;

        CommitRepository::insert_manifest_from_staging(uow.tx(), &commit.commit_id, job.id).await?;
        CommitRepository::store_schema(uow.tx(), &commit.commit_id, schema).await?;
        DatasetRepository::touch(uow.tx(), job.dataset_id).await?;

        let advanced = RefRepository::update_ref_cas(
            uow.tx(),
            job.dataset_id,
            &params.ref_name,
            parent,
            &commit.commit_id,
        )
        .await?;

        if !advanced {
            uow.rollback().await?;
            return Ok(None);
        }

        uow.collect(DomainEvent::new(
            event_types::DATASET_COMMITTED,
            "dataset",
            job.dataset_id,
            Some(job.user_id),
            json!({
                "commit_id": commit.commit_id,
                "ref": params.ref_name,
                "job_id": job.id,
            }),
        ));
        uow.collect(DomainEvent::new(
            event_types::DATASET_UPDATED,
            "dataset",
            job.dataset_id,
            Some(job.user_id),
            json!({"reason": "import"}),
        ));

        let events = uow.commit().await?;
        self.bus.publish_all(events);

        Ok(Some(commit))
    }
}

/// Enqueue an import job for a staged upload. Runs inside the caller's
/// unit of work so the job row and any dataset bookkeeping commit together.
pub async fn enqueue_import(
    uow: &mut UnitOfWork,
    dataset_id: Uuid,
    user_id: Uuid,
    params: &ImportParams,
) -> DomainResult<Uuid> {
    let value = serde_json::to_value(params)
        .map_err(|e| DomainError::Validation(format!("bad import parameters: {e}")))?;

    let id = JobRepository::enqueue(
        uow.tx(),
        crate::models::RunType::Import,
        dataset_id,
        None,
        user_id,
        &value,
    )
    .await?;

    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_params_roundtrip_through_run_parameters() {
        let params = ImportParams {
            file_path: PathBuf::from("/tmp/import-abc.upload"),
            original_filename: "trades.csv".into(),
            file_bytes: 1234,
            ref_name: "main".into(),
            message: "weekly load".into(),
        };

        // run_parameters later gains progress/checkpoint keys; parsing must
        // tolerate them.
        let mut value = serde_json::to_value(&params).unwrap();
        value["progress"] = json!({"bytes_processed": 10, "bytes_total": 1234, "rows_processed": 5});
        value["checkpoint"] = json!({
            "file_position": 10,
            "rows_emitted_per_sheet": {"primary": 5},
            "manifest_length": 5,
            "parent_at_start": null,
        });

        let parsed: ImportParams = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(parsed.ref_name, "main");
        assert_eq!(parsed.file_bytes, 1234);

        let cp: ImportCheckpoint =
            serde_json::from_value(value["checkpoint"].clone()).unwrap();
        assert_eq!(cp.manifest_length, 5);
        assert_eq!(cp.rows_emitted_per_sheet["primary"], 5);
        assert_eq!(cp.parent_at_start, None);
    }
}

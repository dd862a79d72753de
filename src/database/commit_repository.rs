//! Commit graph repository
//!
//! Immutable commits with parent pointers, their row manifests, and the
//! per-commit schema record. A commit and its manifest are only ever
//! written inside one transaction, so observers never see a partially
//! inserted manifest.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::canonical;
use crate::models::{Commit, CommitSchema, ManifestEntry};

pub struct CommitRepository;

type CommitRow = (
    String,
    Uuid,
    Option<String>,
    String,
    Uuid,
    DateTime<Utc>,
    DateTime<Utc>,
);

fn commit_from_row(row: CommitRow) -> Commit {
    let (commit_id, dataset_id, parent_commit_id, message, author_id, authored_at, committed_at) =
        row;
    Commit {
        commit_id,
        dataset_id,
        parent_commit_id,
        message,
        author_id,
        authored_at,
        committed_at,
    }
}

impl CommitRepository {
    /// Insert a commit record. The id is derived deterministically from the
    /// identifying fields plus `salt`; callers that need reproducible ids
    /// (tests, reparenting with an unchanged manifest) pass a fixed salt.
    ///
    /// The caller is responsible for writing the manifest and schema in the
    /// same transaction; `create_commit` only writes the commit row.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_commit(
        tx: &mut Transaction<'static, Postgres>,
        dataset_id: Uuid,
        parent_commit_id: Option<&str>,
        message: &str,
        author_id: Uuid,
        authored_at: DateTime<Utc>,
        salt: Uuid,
    ) -> Result<Commit, sqlx::Error> {
        let commit_id =
            canonical::commit_id(&dataset_id, parent_commit_id, message, &authored_at, &salt);

        let row: CommitRow = sqlx::query_as(
            r#"
            INSERT INTO commits (commit_id, dataset_id, parent_commit_id, message, author_id, authored_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING commit_id, dataset_id, parent_commit_id, message, author_id, authored_at, committed_at
            "#,
        )
        .bind(&commit_id)
        .bind(dataset_id)
        .bind(parent_commit_id)
        .bind(message)
        .bind(author_id)
        .bind(authored_at)
        .fetch_one(&mut **tx)
        .await?;

        Ok(commit_from_row(row))
    }

    pub async fn get_commit(
        pool: &PgPool,
        commit_id: &str,
    ) -> Result<Option<Commit>, sqlx::Error> {
        let row: Option<CommitRow> = sqlx::query_as(
            r#"
            SELECT commit_id, dataset_id, parent_commit_id, message, author_id, authored_at, committed_at
            FROM commits
            WHERE commit_id = $1
            "#,
        )
        .bind(commit_id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(commit_from_row))
    }

    /// Walk the parent chain starting at `commit_id` (inclusive), newest
    /// first. Tie-break is `committed_at DESC, commit_id DESC`.
    pub async fn list_ancestors(
        pool: &PgPool,
        commit_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Commit>, sqlx::Error> {
        let rows: Vec<CommitRow> = sqlx::query_as(
            r#"
            WITH RECURSIVE ancestry AS (
                SELECT c.commit_id, c.dataset_id, c.parent_commit_id, c.message,
                       c.author_id, c.authored_at, c.committed_at
                FROM commits c
                WHERE c.commit_id = $1
                UNION ALL
                SELECT p.commit_id, p.dataset_id, p.parent_commit_id, p.message,
                       p.author_id, p.authored_at, p.committed_at
                FROM commits p
                JOIN ancestry a ON p.commit_id = a.parent_commit_id
            )
            SELECT commit_id, dataset_id, parent_commit_id, message, author_id, authored_at, committed_at
            FROM ancestry
            ORDER BY committed_at DESC, commit_id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(commit_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(commit_from_row).collect())
    }

    /// Bulk-insert manifest entries for a commit via one UNNEST statement.
    pub async fn insert_manifest_entries(
        tx: &mut Transaction<'static, Postgres>,
        commit_id: &str,
        entries: &[ManifestEntry],
    ) -> Result<(), sqlx::Error> {
        if entries.is_empty() {
            return Ok(());
        }

        let table_keys: Vec<&str> = entries.iter().map(|e| e.table_key.as_str()).collect();
        let row_indices: Vec<i64> = entries.iter().map(|e| e.row_index).collect();
        let row_hashes: Vec<&str> = entries.iter().map(|e| e.row_hash.as_str()).collect();

        sqlx::query(
            r#"
            INSERT INTO commit_manifests (commit_id, table_key, row_index, row_hash)
            SELECT $1, t.k, t.i, t.h
            FROM UNNEST($2::text[], $3::bigint[], $4::text[]) AS t(k, i, h)
            "#,
        )
        .bind(commit_id)
        .bind(&table_keys)
        .bind(&row_indices)
        .bind(&row_hashes)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Materialize the staged manifest of an import job as the manifest of
    /// `commit_id`. One set-based statement; no per-row round-trips.
    pub async fn insert_manifest_from_staging(
        tx: &mut Transaction<'static, Postgres>,
        commit_id: &str,
        job_id: Uuid,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO commit_manifests (commit_id, table_key, row_index, row_hash)
            SELECT $1, s.table_key, s.row_index, s.row_hash
            FROM import_manifest_staging s
            WHERE s.job_id = $2
            "#,
        )
        .bind(commit_id)
        .bind(job_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Stage manifest pairs for an in-flight import. Conflict-ignoring so a
    /// resumed job can safely replay a partially written batch.
    pub async fn stage_manifest_batch(
        tx: &mut Transaction<'static, Postgres>,
        job_id: Uuid,
        entries: &[ManifestEntry],
    ) -> Result<(), sqlx::Error> {
        if entries.is_empty() {
            return Ok(());
        }

        let table_keys: Vec<&str> = entries.iter().map(|e| e.table_key.as_str()).collect();
        let row_indices: Vec<i64> = entries.iter().map(|e| e.row_index).collect();
        let row_hashes: Vec<&str> = entries.iter().map(|e| e.row_hash.as_str()).collect();

        sqlx::query(
            r#"
            INSERT INTO import_manifest_staging (job_id, table_key, row_index, row_hash)
            SELECT $1, t.k, t.i, t.h
            FROM UNNEST($2::text[], $3::bigint[], $4::text[]) AS t(k, i, h)
            ON CONFLICT (job_id, table_key, row_index) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(&table_keys)
        .bind(&row_indices)
        .bind(&row_hashes)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// Length of the staged manifest for a job, used to validate checkpoints.
    pub async fn staged_manifest_count(pool: &PgPool, job_id: Uuid) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM import_manifest_staging WHERE job_id = $1")
                .bind(job_id)
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    /// Drop a job's scratch region. Runs regardless of import outcome.
    pub async fn clear_staging(pool: &PgPool, job_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM import_manifest_staging WHERE job_id = $1")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Manifest entries for a commit in stable row order, optionally scoped
    /// to one table.
    pub async fn get_manifest(
        pool: &PgPool,
        commit_id: &str,
        table_key: Option<&str>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ManifestEntry>, sqlx::Error> {
        let rows: Vec<(String, i64, String)> = sqlx::query_as(
            r#"
            SELECT table_key, row_index, row_hash
            FROM commit_manifests
            WHERE commit_id = $1
              AND ($2::text IS NULL OR table_key = $2)
            ORDER BY table_key, row_index
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(commit_id)
        .bind(table_key)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(table_key, row_index, row_hash)| ManifestEntry {
                table_key,
                row_index,
                row_hash,
            })
            .collect())
    }

    /// Paginated manifest ⋈ row-store read. Ordering is `(table_key,
    /// row_index)` and therefore stable across calls.
    pub async fn get_data_page(
        pool: &PgPool,
        commit_id: &str,
        table_key: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<(i64, serde_json::Value)>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT m.row_index, r.data
            FROM commit_manifests m
            JOIN rows r ON r.row_hash = m.row_hash
            WHERE m.commit_id = $1 AND m.table_key = $2
            ORDER BY m.row_index
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(commit_id)
        .bind(table_key)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// Distinct table keys in a commit with their row counts.
    pub async fn list_tables(
        pool: &PgPool,
        commit_id: &str,
    ) -> Result<Vec<(String, i64)>, sqlx::Error> {
        sqlx::query_as(
            r#"
            SELECT table_key, COUNT(*)::bigint AS row_count
            FROM commit_manifests
            WHERE commit_id = $1
            GROUP BY table_key
            ORDER BY table_key
            "#,
        )
        .bind(commit_id)
        .fetch_all(pool)
        .await
    }

    pub async fn manifest_row_count(
        pool: &PgPool,
        commit_id: &str,
    ) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM commit_manifests WHERE commit_id = $1")
                .bind(commit_id)
                .fetch_one(pool)
                .await?;
        Ok(count)
    }

    pub async fn store_schema(
        tx: &mut Transaction<'static, Postgres>,
        commit_id: &str,
        schema: &CommitSchema,
    ) -> Result<(), sqlx::Error> {
        let definition =
            serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"tables": {}}));

        sqlx::query(
            r#"
            INSERT INTO commit_schemas (commit_id, schema_definition)
            VALUES ($1, $2)
            "#,
        )
        .bind(commit_id)
        .bind(definition)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn get_schema(
        pool: &PgPool,
        commit_id: &str,
    ) -> Result<Option<CommitSchema>, sqlx::Error> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT schema_definition FROM commit_schemas WHERE commit_id = $1",
        )
        .bind(commit_id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(|(definition,)| serde_json::from_value(definition).unwrap_or_default()))
    }
}

//! Content-addressed row store
//!
//! Rows are keyed by the SHA-256 of their canonical serialization and are
//! insert-only: `put` is put-if-absent, duplicates are silently ignored,
//! and nothing here is ever deleted. Bulk writes go through a single
//! UNNEST insert so import batches cost one round-trip.

use std::collections::HashMap;

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};

use crate::canonical;

pub struct RowStore;

impl RowStore {
    /// Insert a batch of `(row_hash, canonical_json)` pairs, skipping hashes
    /// already present. Returns the number of newly inserted rows.
    pub async fn put_rows(
        tx: &mut Transaction<'static, Postgres>,
        batch: &[(String, String)],
    ) -> Result<u64, sqlx::Error> {
        if batch.is_empty() {
            return Ok(0);
        }

        let hashes: Vec<&str> = batch.iter().map(|(h, _)| h.as_str()).collect();
        let payloads: Vec<&str> = batch.iter().map(|(_, d)| d.as_str()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO rows (row_hash, data)
            SELECT t.h, t.d::jsonb
            FROM UNNEST($1::text[], $2::text[]) AS t(h, d)
            ON CONFLICT (row_hash) DO NOTHING
            "#,
        )
        .bind(&hashes)
        .bind(&payloads)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected())
    }

    /// Canonicalize, hash, and store a single payload. Returns the row hash.
    pub async fn put_row(
        tx: &mut Transaction<'static, Postgres>,
        data: &Value,
    ) -> Result<String, sqlx::Error> {
        let (hash, canonical) = canonical::canonicalize_and_hash(data);
        Self::put_rows(tx, &[(hash.clone(), canonical)]).await?;
        Ok(hash)
    }

    /// Fetch payloads for a set of hashes. Missing hashes are simply absent
    /// from the result map.
    pub async fn get_rows(
        pool: &PgPool,
        hashes: &[String],
    ) -> Result<HashMap<String, Value>, sqlx::Error> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }

        let rows: Vec<(String, Value)> = sqlx::query_as(
            r#"
            SELECT row_hash, data
            FROM rows
            WHERE row_hash = ANY($1)
            "#,
        )
        .bind(hashes)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().collect())
    }

    /// Total distinct hashes in the store. Used by ingest accounting and
    /// dedup assertions.
    pub async fn count(pool: &PgPool) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM rows")
            .fetch_one(pool)
            .await?;
        Ok(count)
    }
}

//! Ref registry
//!
//! Named branch pointers per dataset. The only way a ref advances during an
//! import is the compare-and-set update, which succeeds iff the stored
//! commit id still equals the value observed at job start.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::Ref;

pub struct RefRepository;

impl RefRepository {
    /// Create a ref pointing at `from_commit` (or nowhere, for a fresh
    /// dataset's `main`). Fails with a unique violation if the name exists.
    pub async fn create_ref(
        tx: &mut Transaction<'static, Postgres>,
        dataset_id: Uuid,
        name: &str,
        from_commit: Option<&str>,
    ) -> Result<Ref, sqlx::Error> {
        let row: (Uuid, String, Option<String>, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO refs (dataset_id, name, commit_id)
            VALUES ($1, $2, $3)
            RETURNING dataset_id, name, commit_id, updated_at
            "#,
        )
        .bind(dataset_id)
        .bind(name)
        .bind(from_commit)
        .fetch_one(&mut **tx)
        .await?;

        Ok(Ref {
            dataset_id: row.0,
            name: row.1,
            commit_id: row.2,
            updated_at: row.3,
        })
    }

    /// Compare-and-set the ref tip. `IS NOT DISTINCT FROM` makes the null
    /// (empty dataset) expectation participate in the comparison. Returns
    /// whether the update won.
    pub async fn update_ref_cas(
        tx: &mut Transaction<'static, Postgres>,
        dataset_id: Uuid,
        name: &str,
        expected_commit_id: Option<&str>,
        new_commit_id: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE refs
            SET commit_id = $4, updated_at = now()
            WHERE dataset_id = $1
              AND name = $2
              AND commit_id IS NOT DISTINCT FROM $3
            "#,
        )
        .bind(dataset_id)
        .bind(name)
        .bind(expected_commit_id)
        .bind(new_commit_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Unconditional move, used by explicit branch-reset operations only.
    pub async fn set_ref(
        tx: &mut Transaction<'static, Postgres>,
        dataset_id: Uuid,
        name: &str,
        commit_id: Option<&str>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE refs
            SET commit_id = $3, updated_at = now()
            WHERE dataset_id = $1 AND name = $2
            "#,
        )
        .bind(dataset_id)
        .bind(name)
        .bind(commit_id)
        .execute(&mut **tx)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_ref(
        tx: &mut Transaction<'static, Postgres>,
        dataset_id: Uuid,
        name: &str,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM refs WHERE dataset_id = $1 AND name = $2")
            .bind(dataset_id)
            .bind(name)
            .execute(&mut **tx)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Current tip of a ref. Outer `Option` is ref existence, inner is the
    /// (possibly null) commit id.
    pub async fn resolve(
        pool: &PgPool,
        dataset_id: Uuid,
        name: &str,
    ) -> Result<Option<Option<String>>, sqlx::Error> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT commit_id FROM refs WHERE dataset_id = $1 AND name = $2")
                .bind(dataset_id)
                .bind(name)
                .fetch_optional(pool)
                .await?;

        Ok(row.map(|(commit_id,)| commit_id))
    }

    pub async fn list_refs(pool: &PgPool, dataset_id: Uuid) -> Result<Vec<Ref>, sqlx::Error> {
        let rows: Vec<(Uuid, String, Option<String>, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT dataset_id, name, commit_id, updated_at
            FROM refs
            WHERE dataset_id = $1
            ORDER BY name
            "#,
        )
        .bind(dataset_id)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(dataset_id, name, commit_id, updated_at)| Ref {
                dataset_id,
                name,
                commit_id,
                updated_at,
            })
            .collect())
    }
}

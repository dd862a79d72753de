//! Dataset repository
//!
//! CRUD for datasets and their tag links. Deleting a dataset cascades to
//! commits, manifests, refs, schemas, runs, permissions and tag links via
//! foreign keys; row blobs are content-addressed and left in place.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::Dataset;

pub struct DatasetRepository;

type DatasetRow = (Uuid, String, String, Uuid, DateTime<Utc>, DateTime<Utc>);

fn dataset_from_row(row: DatasetRow) -> Dataset {
    let (id, name, description, created_by, created_at, updated_at) = row;
    Dataset {
        id,
        name,
        description,
        created_by,
        created_at,
        updated_at,
    }
}

impl DatasetRepository {
    pub async fn create(
        tx: &mut Transaction<'static, Postgres>,
        name: &str,
        description: &str,
        created_by: Uuid,
    ) -> Result<Dataset, sqlx::Error> {
        let row: DatasetRow = sqlx::query_as(
            r#"
            INSERT INTO datasets (name, description, created_by)
            VALUES ($1, $2, $3)
            RETURNING id, name, description, created_by, created_at, updated_at
            "#,
        )
        .bind(name)
        .bind(description)
        .bind(created_by)
        .fetch_one(&mut **tx)
        .await?;

        Ok(dataset_from_row(row))
    }

    pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<Dataset>, sqlx::Error> {
        let row: Option<DatasetRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, created_by, created_at, updated_at
            FROM datasets
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(pool)
        .await?;

        Ok(row.map(dataset_from_row))
    }

    /// Datasets visible to a user: anything they hold a permission on.
    /// Service-level admins list everything.
    pub async fn list_visible(
        pool: &PgPool,
        user_id: Uuid,
        is_admin: bool,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Dataset>, sqlx::Error> {
        let rows: Vec<DatasetRow> = sqlx::query_as(
            r#"
            SELECT d.id, d.name, d.description, d.created_by, d.created_at, d.updated_at
            FROM datasets d
            WHERE $2
               OR EXISTS (
                    SELECT 1 FROM dataset_permissions p
                    WHERE p.dataset_id = d.id AND p.user_id = $1
               )
            ORDER BY d.updated_at DESC, d.id
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(user_id)
        .bind(is_admin)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(dataset_from_row).collect())
    }

    pub async fn update(
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
        name: Option<&str>,
        description: Option<&str>,
    ) -> Result<Option<Dataset>, sqlx::Error> {
        let row: Option<DatasetRow> = sqlx::query_as(
            r#"
            UPDATE datasets
            SET name = COALESCE($2, name),
                description = COALESCE($3, description),
                updated_at = now()
            WHERE id = $1
            RETURNING id, name, description, created_by, created_at, updated_at
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(description)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(dataset_from_row))
    }

    /// Bump `updated_at`, used after imports and other mutating operations.
    pub async fn touch(
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE datasets SET updated_at = now() WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn delete(
        tx: &mut Transaction<'static, Postgres>,
        id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM datasets WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Replace a dataset's tag set. Tag names are upserted into the shared
    /// tag table, then the link rows are rewritten.
    pub async fn set_tags(
        tx: &mut Transaction<'static, Postgres>,
        dataset_id: Uuid,
        tags: &[String],
    ) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM dataset_tags WHERE dataset_id = $1")
            .bind(dataset_id)
            .execute(&mut **tx)
            .await?;

        if tags.is_empty() {
            return Ok(());
        }

        sqlx::query(
            r#"
            INSERT INTO tags (name)
            SELECT UNNEST($1::text[])
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(tags)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO dataset_tags (dataset_id, tag_id)
            SELECT $1, t.id FROM tags t WHERE t.name = ANY($2)
            "#,
        )
        .bind(dataset_id)
        .bind(tags)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn get_tags(pool: &PgPool, dataset_id: Uuid) -> Result<Vec<String>, sqlx::Error> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT t.name
            FROM dataset_tags dt
            JOIN tags t ON t.id = dt.tag_id
            WHERE dt.dataset_id = $1
            ORDER BY t.name
            "#,
        )
        .bind(dataset_id)
        .fetch_all(pool)
        .await?;

        Ok(rows.into_iter().map(|(name,)| name).collect())
    }
}

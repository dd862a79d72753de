//! Permission gate and user lookups
//!
//! Per-(user, dataset) permission checks invoked at the service entry of
//! every operation. The gate deliberately reports a missing dataset and a
//! denied dataset identically (`NotFound`), so unauthorized callers cannot
//! probe for existence. `Forbidden` is only surfaced to callers who can
//! already see the dataset but lack the required level.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::error::{DomainError, DomainResult};
use crate::models::{PermissionKind, User, UserRole};

pub struct UserRepository;

impl UserRepository {
    pub async fn get(pool: &PgPool, id: Uuid) -> Result<Option<User>, sqlx::Error> {
        let row: Option<(Uuid, String, String, DateTime<Utc>)> =
            sqlx::query_as("SELECT id, username, role, created_at FROM users WHERE id = $1")
                .bind(id)
                .fetch_optional(pool)
                .await?;

        Ok(row.map(|(id, username, role, created_at)| User {
            id,
            username,
            role: UserRole::parse(&role),
            created_at,
        }))
    }

    pub async fn create(
        tx: &mut Transaction<'static, Postgres>,
        username: &str,
        role: UserRole,
    ) -> Result<User, sqlx::Error> {
        let row: (Uuid, String, String, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO users (username, role)
            VALUES ($1, $2)
            RETURNING id, username, role, created_at
            "#,
        )
        .bind(username)
        .bind(role.as_str())
        .fetch_one(&mut **tx)
        .await?;

        Ok(User {
            id: row.0,
            username: row.1,
            role: UserRole::parse(&row.2),
            created_at: row.3,
        })
    }
}

pub struct PermissionRepository;

impl PermissionRepository {
    /// The permission a user holds on a dataset, if any.
    pub async fn get_kind(
        pool: &PgPool,
        dataset_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<PermissionKind>, sqlx::Error> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT kind FROM dataset_permissions WHERE dataset_id = $1 AND user_id = $2",
        )
        .bind(dataset_id)
        .bind(user_id)
        .fetch_optional(pool)
        .await?;

        Ok(row.and_then(|(kind,)| PermissionKind::parse(&kind)))
    }

    pub async fn grant(
        tx: &mut Transaction<'static, Postgres>,
        dataset_id: Uuid,
        user_id: Uuid,
        kind: PermissionKind,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO dataset_permissions (dataset_id, user_id, kind)
            VALUES ($1, $2, $3)
            ON CONFLICT (dataset_id, user_id) DO UPDATE SET kind = EXCLUDED.kind
            "#,
        )
        .bind(dataset_id)
        .bind(user_id)
        .bind(kind.as_str())
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    pub async fn revoke(
        tx: &mut Transaction<'static, Postgres>,
        dataset_id: Uuid,
        user_id: Uuid,
    ) -> Result<bool, sqlx::Error> {
        let result =
            sqlx::query("DELETE FROM dataset_permissions WHERE dataset_id = $1 AND user_id = $2")
                .bind(dataset_id)
                .bind(user_id)
                .execute(&mut **tx)
                .await?;

        Ok(result.rows_affected() == 1)
    }

    pub async fn list(
        pool: &PgPool,
        dataset_id: Uuid,
    ) -> Result<Vec<(Uuid, String, PermissionKind)>, sqlx::Error> {
        let rows: Vec<(Uuid, String, String)> = sqlx::query_as(
            r#"
            SELECT p.user_id, u.username, p.kind
            FROM dataset_permissions p
            JOIN users u ON u.id = p.user_id
            WHERE p.dataset_id = $1
            ORDER BY u.username
            "#,
        )
        .bind(dataset_id)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(user_id, username, kind)| {
                PermissionKind::parse(&kind).map(|k| (user_id, username, k))
            })
            .collect())
    }

    /// Number of admins on a dataset. Guards the "revoking the only admin"
    /// business rule.
    pub async fn count_admins(pool: &PgPool, dataset_id: Uuid) -> Result<i64, sqlx::Error> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM dataset_permissions WHERE dataset_id = $1 AND kind = 'admin'",
        )
        .bind(dataset_id)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Gate check invoked at every service entry.
    ///
    /// Returns `NotFound` when the dataset does not exist *or* the caller
    /// holds no permission at all; `Forbidden` when the caller can see the
    /// dataset but lacks `required`. Service-level admins pass every check
    /// for datasets that exist.
    pub async fn check(
        pool: &PgPool,
        user: &User,
        dataset_id: Uuid,
        required: PermissionKind,
    ) -> DomainResult<()> {
        let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM datasets WHERE id = $1")
            .bind(dataset_id)
            .fetch_optional(pool)
            .await?;

        if exists.is_none() {
            return Err(DomainError::NotFound);
        }

        if user.role == UserRole::Admin {
            return Ok(());
        }

        match Self::get_kind(pool, dataset_id, user.id).await? {
            None => Err(DomainError::NotFound),
            Some(held) if held.satisfies(required) => Ok(()),
            Some(_) => Err(DomainError::Forbidden),
        }
    }
}

//! Dataset lifecycle operations
//!
//! Create/read/update/delete for datasets, tag management, permission
//! grants and full-text discovery. Creation seeds the `main` ref and gives
//! the creator admin on the new dataset.

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::unit_of_work::{run_in_uow, UnitOfWork};
use crate::database::{
    DatasetRepository, PermissionRepository, RefRepository, SearchIndex,
};
use crate::error::{DomainError, DomainResult};
use crate::events::{event_types, DomainEvent, EventBus};
use crate::models::{Dataset, DatasetSummary, PermissionKind, User, UserRole, MAIN_REF};

use super::page_bounds;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateDatasetRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct UpdateDatasetRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

#[derive(Clone)]
pub struct DatasetService {
    pool: PgPool,
    bus: EventBus,
    max_page_limit: i64,
}

impl DatasetService {
    pub fn new(pool: PgPool, bus: EventBus, max_page_limit: i64) -> Self {
        Self {
            pool,
            bus,
            max_page_limit,
        }
    }

    fn validate_name(name: &str) -> DomainResult<()> {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(DomainError::Validation("dataset name must not be empty".into()));
        }
        if trimmed.len() > 200 {
            return Err(DomainError::Validation(
                "dataset name must be at most 200 characters".into(),
            ));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        user: &User,
        req: CreateDatasetRequest,
    ) -> DomainResult<DatasetSummary> {
        Self::validate_name(&req.name)?;

        let mut uow = UnitOfWork::begin(&self.pool).await?;

        let dataset = DatasetRepository::create(
            uow.tx(),
            req.name.trim(),
            &req.description,
            user.id,
        )
        .await
        .map_err(|e| {
            if DomainError::is_unique_violation(&e) {
                DomainError::Conflict(format!("dataset '{}' already exists", req.name.trim()))
            } else {
                DomainError::from(e)
            }
        })?;

        // Canonical branch exists from the start, pointing nowhere.
        RefRepository::create_ref(uow.tx(), dataset.id, MAIN_REF, None).await?;
        PermissionRepository::grant(uow.tx(), dataset.id, user.id, PermissionKind::Admin).await?;

        if !req.tags.is_empty() {
            DatasetRepository::set_tags(uow.tx(), dataset.id, &req.tags).await?;
        }

        uow.collect(DomainEvent::new(
            event_types::DATASET_CREATED,
            "dataset",
            dataset.id,
            Some(user.id),
            json!({"name": dataset.name}),
        ));

        let events = uow.commit().await?;
        self.bus.publish_all(events);

        tracing::info!(dataset_id = %dataset.id, user_id = %user.id, "dataset created");

        Ok(DatasetSummary {
            id: dataset.id,
            name: dataset.name,
            description: dataset.description,
            creator: user.username.clone(),
            tags: req.tags,
            created_at: dataset.created_at,
            updated_at: dataset.updated_at,
        })
    }

    pub async fn get(&self, user: &User, dataset_id: Uuid) -> DomainResult<(Dataset, Vec<String>)> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Read).await?;

        let dataset = DatasetRepository::get(&self.pool, dataset_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        let tags = DatasetRepository::get_tags(&self.pool, dataset_id).await?;
        Ok((dataset, tags))
    }

    pub async fn list(
        &self,
        user: &User,
        offset: i64,
        limit: i64,
    ) -> DomainResult<Vec<Dataset>> {
        let (offset, limit) = page_bounds(offset, limit, self.max_page_limit)?;
        let is_admin = user.role == UserRole::Admin;
        Ok(DatasetRepository::list_visible(&self.pool, user.id, is_admin, offset, limit).await?)
    }

    pub async fn update(
        &self,
        user: &User,
        dataset_id: Uuid,
        req: UpdateDatasetRequest,
    ) -> DomainResult<Dataset> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Write).await?;

        if let Some(name) = &req.name {
            Self::validate_name(name)?;
        }

        let mut uow = UnitOfWork::begin(&self.pool).await?;

        let dataset = DatasetRepository::update(
            uow.tx(),
            dataset_id,
            req.name.as_deref().map(str::trim),
            req.description.as_deref(),
        )
        .await
        .map_err(|e| {
            if DomainError::is_unique_violation(&e) {
                DomainError::Conflict("another dataset already has that name".into())
            } else {
                DomainError::from(e)
            }
        })?
        .ok_or(DomainError::NotFound)?;

        if let Some(tags) = &req.tags {
            DatasetRepository::set_tags(uow.tx(), dataset_id, tags).await?;
        }

        uow.collect(DomainEvent::new(
            event_types::DATASET_UPDATED,
            "dataset",
            dataset_id,
            Some(user.id),
            json!({"reason": "update"}),
        ));

        let events = uow.commit().await?;
        self.bus.publish_all(events);

        Ok(dataset)
    }

    pub async fn delete(&self, user: &User, dataset_id: Uuid) -> DomainResult<()> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Admin).await?;

        let user_id = user.id;
        run_in_uow(&self.pool, &self.bus, |uow| {
            Box::pin(async move {
                // Cascades to commits, manifests, refs, schemas, runs,
                // permissions and tag links; row blobs are shared and stay.
                let deleted = DatasetRepository::delete(uow.tx(), dataset_id).await?;
                if !deleted {
                    return Err(DomainError::NotFound);
                }

                uow.collect(DomainEvent::new(
                    event_types::DATASET_DELETED,
                    "dataset",
                    dataset_id,
                    Some(user_id),
                    json!({}),
                ));
                Ok(())
            })
        })
        .await?;

        tracing::info!(dataset_id = %dataset_id, user_id = %user.id, "dataset deleted");
        Ok(())
    }

    pub async fn search(
        &self,
        user: &User,
        query: &str,
        offset: i64,
        limit: i64,
    ) -> DomainResult<Vec<DatasetSummary>> {
        if query.trim().is_empty() {
            return Err(DomainError::Validation("search query must not be empty".into()));
        }
        let (offset, limit) = page_bounds(offset, limit, self.max_page_limit)?;
        let is_admin = user.role == UserRole::Admin;
        Ok(SearchIndex::search(&self.pool, query, user.id, is_admin, offset, limit).await?)
    }

    // ------------------------------------------------------------------
    // Permissions
    // ------------------------------------------------------------------

    pub async fn list_permissions(
        &self,
        user: &User,
        dataset_id: Uuid,
    ) -> DomainResult<Vec<(Uuid, String, PermissionKind)>> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Admin).await?;
        Ok(PermissionRepository::list(&self.pool, dataset_id).await?)
    }

    pub async fn grant_permission(
        &self,
        user: &User,
        dataset_id: Uuid,
        target_user: Uuid,
        kind: PermissionKind,
    ) -> DomainResult<()> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Admin).await?;

        let mut uow = UnitOfWork::begin(&self.pool).await?;
        PermissionRepository::grant(uow.tx(), dataset_id, target_user, kind).await?;

        uow.collect(DomainEvent::new(
            event_types::PERMISSION_GRANTED,
            "dataset",
            dataset_id,
            Some(user.id),
            json!({"target_user": target_user, "kind": kind.as_str()}),
        ));

        let events = uow.commit().await?;
        self.bus.publish_all(events);
        Ok(())
    }

    pub async fn revoke_permission(
        &self,
        user: &User,
        dataset_id: Uuid,
        target_user: Uuid,
    ) -> DomainResult<()> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Admin).await?;

        // Never leave a dataset without an admin.
        let held = PermissionRepository::get_kind(&self.pool, dataset_id, target_user).await?;
        if held == Some(PermissionKind::Admin) {
            let admins = PermissionRepository::count_admins(&self.pool, dataset_id).await?;
            if admins <= 1 {
                return Err(DomainError::BusinessRule(
                    "cannot revoke the only admin of a dataset".into(),
                ));
            }
        }

        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let revoked = PermissionRepository::revoke(uow.tx(), dataset_id, target_user).await?;
        if !revoked {
            uow.rollback().await?;
            return Err(DomainError::NotFound);
        }

        uow.collect(DomainEvent::new(
            event_types::PERMISSION_REVOKED,
            "dataset",
            dataset_id,
            Some(user.id),
            json!({"target_user": target_user}),
        ));

        let events = uow.commit().await?;
        self.bus.publish_all(events);
        Ok(())
    }
}

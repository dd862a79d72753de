//! Branch (ref) operations and commit history

use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::unit_of_work::UnitOfWork;
use crate::database::{CommitRepository, PermissionRepository, RefRepository};
use crate::error::{DomainError, DomainResult};
use crate::events::{event_types, DomainEvent, EventBus};
use crate::models::{Commit, PermissionKind, Ref, User, MAIN_REF};

use super::page_bounds;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct CreateRefRequest {
    pub name: String,
    /// Ref the new branch forks from; defaults to `main`.
    pub from_ref: Option<String>,
}

#[derive(Clone)]
pub struct RefService {
    pool: PgPool,
    bus: EventBus,
    max_page_limit: i64,
}

impl RefService {
    pub fn new(pool: PgPool, bus: EventBus, max_page_limit: i64) -> Self {
        Self {
            pool,
            bus,
            max_page_limit,
        }
    }

    fn validate_ref_name(name: &str) -> DomainResult<()> {
        if name.is_empty() || name.len() > 100 {
            return Err(DomainError::Validation(
                "ref name must be between 1 and 100 characters".into(),
            ));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/' | '.'))
        {
            return Err(DomainError::Validation(
                "ref name may only contain alphanumerics, '-', '_', '/' and '.'".into(),
            ));
        }
        Ok(())
    }

    pub async fn create(
        &self,
        user: &User,
        dataset_id: Uuid,
        req: CreateRefRequest,
    ) -> DomainResult<Ref> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Write).await?;
        Self::validate_ref_name(&req.name)?;

        let from_ref = req.from_ref.as_deref().unwrap_or(MAIN_REF);
        let from_commit = RefRepository::resolve(&self.pool, dataset_id, from_ref)
            .await?
            .ok_or_else(|| DomainError::Validation(format!("source ref '{from_ref}' does not exist")))?;

        let mut uow = UnitOfWork::begin(&self.pool).await?;

        let created = RefRepository::create_ref(
            uow.tx(),
            dataset_id,
            &req.name,
            from_commit.as_deref(),
        )
        .await
        .map_err(|e| {
            if DomainError::is_unique_violation(&e) {
                DomainError::Conflict(format!("ref '{}' already exists", req.name))
            } else {
                DomainError::from(e)
            }
        })?;

        uow.collect(DomainEvent::new(
            event_types::REF_CREATED,
            "dataset",
            dataset_id,
            Some(user.id),
            json!({"name": created.name, "from": from_ref, "commit_id": created.commit_id}),
        ));

        let events = uow.commit().await?;
        self.bus.publish_all(events);

        Ok(created)
    }

    /// Delete a branch. Deleting `main` is a business-rule violation while
    /// the dataset exists; commits reachable from other refs are untouched.
    pub async fn delete(&self, user: &User, dataset_id: Uuid, name: &str) -> DomainResult<()> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Write).await?;

        if name == MAIN_REF {
            return Err(DomainError::BusinessRule("the main ref cannot be deleted".into()));
        }

        let mut uow = UnitOfWork::begin(&self.pool).await?;
        let deleted = RefRepository::delete_ref(uow.tx(), dataset_id, name).await?;
        if !deleted {
            uow.rollback().await?;
            return Err(DomainError::NotFound);
        }

        uow.collect(DomainEvent::new(
            event_types::REF_DELETED,
            "dataset",
            dataset_id,
            Some(user.id),
            json!({"name": name}),
        ));

        let events = uow.commit().await?;
        self.bus.publish_all(events);

        Ok(())
    }

    pub async fn list(&self, user: &User, dataset_id: Uuid) -> DomainResult<Vec<Ref>> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Read).await?;
        Ok(RefRepository::list_refs(&self.pool, dataset_id).await?)
    }

    /// Commit ancestry starting at the tip of `ref_name`, newest first.
    pub async fn history(
        &self,
        user: &User,
        dataset_id: Uuid,
        ref_name: &str,
        offset: i64,
        limit: i64,
    ) -> DomainResult<Vec<Commit>> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Read).await?;
        let (offset, limit) = page_bounds(offset, limit, self.max_page_limit)?;

        let tip = RefRepository::resolve(&self.pool, dataset_id, ref_name)
            .await?
            .ok_or(DomainError::NotFound)?;

        match tip {
            None => Ok(Vec::new()), // empty dataset: no history yet
            Some(commit_id) => {
                Ok(CommitRepository::list_ancestors(&self.pool, &commit_id, limit, offset).await?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_name_validation() {
        assert!(RefService::validate_ref_name("main").is_ok());
        assert!(RefService::validate_ref_name("feature/q3-load").is_ok());
        assert!(RefService::validate_ref_name("sample_2024.v1").is_ok());
        assert!(RefService::validate_ref_name("").is_err());
        assert!(RefService::validate_ref_name("has space").is_err());
        assert!(RefService::validate_ref_name(&"x".repeat(101)).is_err());
    }
}

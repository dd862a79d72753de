//! Read paths: paginated data at a ref or pinned commit, table listings,
//! schemas, and the dataset overview.

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::database::{CommitRepository, PermissionRepository, RefRepository};
use crate::error::{DomainError, DomainResult};
use crate::models::{
    Commit, CommitSchema, DatasetOverview, PermissionKind, RefOverview, TableOverview, TableSchema,
    User, MAIN_REF,
};

use super::page_bounds;

#[derive(Debug, Serialize)]
pub struct DataPage {
    /// Commit the page was read at; `None` for an empty ref.
    pub commit_id: Option<String>,
    pub table_key: String,
    pub offset: i64,
    pub limit: i64,
    pub rows: Vec<Value>,
}

#[derive(Clone)]
pub struct QueryService {
    pool: PgPool,
    max_page_limit: i64,
}

impl QueryService {
    pub fn new(pool: PgPool, max_page_limit: i64) -> Self {
        Self {
            pool,
            max_page_limit,
        }
    }

    /// Resolve a commit that must belong to `dataset_id`; a commit of
    /// another dataset is indistinguishable from a missing one.
    async fn commit_in_dataset(&self, dataset_id: Uuid, commit_id: &str) -> DomainResult<Commit> {
        let commit = CommitRepository::get_commit(&self.pool, commit_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if commit.dataset_id != dataset_id {
            return Err(DomainError::NotFound);
        }
        Ok(commit)
    }

    pub async fn get_data_at_ref(
        &self,
        user: &User,
        dataset_id: Uuid,
        ref_name: &str,
        table_key: &str,
        offset: i64,
        limit: i64,
    ) -> DomainResult<DataPage> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Read).await?;
        let (offset, limit) = page_bounds(offset, limit, self.max_page_limit)?;

        let tip = RefRepository::resolve(&self.pool, dataset_id, ref_name)
            .await?
            .ok_or(DomainError::NotFound)?;

        match tip {
            None => Ok(DataPage {
                commit_id: None,
                table_key: table_key.to_string(),
                offset,
                limit,
                rows: Vec::new(),
            }),
            Some(commit_id) => {
                self.read_page(dataset_id, &commit_id, table_key, offset, limit)
                    .await
            }
        }
    }

    pub async fn get_data_at_commit(
        &self,
        user: &User,
        dataset_id: Uuid,
        commit_id: &str,
        table_key: &str,
        offset: i64,
        limit: i64,
    ) -> DomainResult<DataPage> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Read).await?;
        let (offset, limit) = page_bounds(offset, limit, self.max_page_limit)?;
        self.read_page(dataset_id, commit_id, table_key, offset, limit)
            .await
    }

    async fn read_page(
        &self,
        dataset_id: Uuid,
        commit_id: &str,
        table_key: &str,
        offset: i64,
        limit: i64,
    ) -> DomainResult<DataPage> {
        self.commit_in_dataset(dataset_id, commit_id).await?;

        let rows = CommitRepository::get_data_page(&self.pool, commit_id, table_key, offset, limit)
            .await?
            .into_iter()
            .map(|(_, data)| data)
            .collect();

        Ok(DataPage {
            commit_id: Some(commit_id.to_string()),
            table_key: table_key.to_string(),
            offset,
            limit,
            rows,
        })
    }

    pub async fn get_commit(
        &self,
        user: &User,
        dataset_id: Uuid,
        commit_id: &str,
    ) -> DomainResult<Commit> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Read).await?;
        self.commit_in_dataset(dataset_id, commit_id).await
    }

    pub async fn list_tables(
        &self,
        user: &User,
        dataset_id: Uuid,
        commit_id: &str,
    ) -> DomainResult<Vec<TableOverview>> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Read).await?;
        self.commit_in_dataset(dataset_id, commit_id).await?;
        self.tables_of(commit_id).await
    }

    async fn tables_of(&self, commit_id: &str) -> DomainResult<Vec<TableOverview>> {
        let counts = CommitRepository::list_tables(&self.pool, commit_id).await?;
        let schema = CommitRepository::get_schema(&self.pool, commit_id)
            .await?
            .unwrap_or_default();

        Ok(counts
            .into_iter()
            .map(|(key, row_count)| {
                let column_count = schema
                    .tables
                    .get(&key)
                    .map(|t| t.columns.len() as i64)
                    .unwrap_or(0);
                TableOverview {
                    key,
                    row_count,
                    column_count,
                }
            })
            .collect())
    }

    /// Per-commit schema; scoped to one table when `table_key` is given.
    pub async fn get_schema(
        &self,
        user: &User,
        dataset_id: Uuid,
        commit_id: &str,
        table_key: Option<&str>,
    ) -> DomainResult<CommitSchema> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Read).await?;
        self.commit_in_dataset(dataset_id, commit_id).await?;

        let schema = CommitRepository::get_schema(&self.pool, commit_id)
            .await?
            .unwrap_or_default();

        match table_key {
            None => Ok(schema),
            Some(key) => {
                let table: TableSchema =
                    schema.tables.get(key).cloned().ok_or(DomainError::NotFound)?;
                let mut scoped = CommitSchema::default();
                scoped.tables.insert(key.to_string(), table);
                Ok(scoped)
            }
        }
    }

    /// Refs with their tables and counts, plus the default ref name.
    pub async fn get_overview(
        &self,
        user: &User,
        dataset_id: Uuid,
    ) -> DomainResult<DatasetOverview> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Read).await?;

        let refs = RefRepository::list_refs(&self.pool, dataset_id).await?;
        let mut overviews = Vec::with_capacity(refs.len());

        for r in refs {
            let tables = match &r.commit_id {
                Some(commit_id) => self.tables_of(commit_id).await?,
                None => Vec::new(),
            };
            overviews.push(RefOverview {
                name: r.name,
                commit_id: r.commit_id,
                tables,
            });
        }

        Ok(DatasetOverview {
            refs: overviews,
            default_ref: MAIN_REF.to_string(),
        })
    }
}

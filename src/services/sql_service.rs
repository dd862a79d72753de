//! SQL preview over a commit's rows
//!
//! Runs a restricted, read-only SELECT against a per-request temporary
//! table materialized from one table of a commit. The temp table is named
//! `dataset`, lives inside a single transaction (`ON COMMIT DROP`) and is
//! populated from the manifest ⋈ row store join, so the preview can never
//! touch real tables. Results are capped at the pagination limit.

use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::database::{CommitRepository, PermissionRepository, RowStore};
use crate::error::{DomainError, DomainResult};
use crate::models::{PermissionKind, User};

use super::page_bounds;

/// Upper bound on source rows materialized for a preview.
const PREVIEW_SOURCE_CAP: i64 = 100_000;

/// Words that must not appear anywhere in a preview statement. `into`
/// guards against `SELECT ... INTO`, which would create a table.
const FORBIDDEN_TOKENS: &[&str] = &[
    "insert", "update", "delete", "drop", "alter", "create", "truncate", "grant", "revoke",
    "copy", "vacuum", "call", "do", "into", "set", "listen", "notify",
];

/// Validate that `sql` is a single read-only SELECT statement.
pub fn validate_select(sql: &str) -> DomainResult<()> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(DomainError::Validation("SQL statement must not be empty".into()));
    }
    if trimmed.contains(';') {
        return Err(DomainError::Validation(
            "only a single statement is allowed; ';' is not permitted".into(),
        ));
    }

    let lower = trimmed.to_ascii_lowercase();
    if !(lower.starts_with("select") || lower.starts_with("with")) {
        return Err(DomainError::Validation(
            "only SELECT statements are allowed".into(),
        ));
    }

    let mut token = String::new();
    for c in lower.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_alphanumeric() || c == '_' {
            token.push(c);
        } else {
            if FORBIDDEN_TOKENS.contains(&token.as_str()) {
                return Err(DomainError::Validation(format!(
                    "'{token}' is not allowed in a preview statement"
                )));
            }
            token.clear();
        }
    }

    Ok(())
}

/// Double-quote an identifier for inclusion in DDL.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[derive(Clone)]
pub struct SqlService {
    pool: PgPool,
    max_page_limit: i64,
}

impl SqlService {
    pub fn new(pool: PgPool, max_page_limit: i64) -> Self {
        Self {
            pool,
            max_page_limit,
        }
    }

    /// Execute a preview SELECT against the rows of `(commit_id, table_key)`.
    /// The table is exposed to the statement as `dataset`, with every source
    /// column as text.
    pub async fn preview(
        &self,
        user: &User,
        dataset_id: Uuid,
        commit_id: &str,
        table_key: &str,
        sql: &str,
        limit: i64,
    ) -> DomainResult<Value> {
        PermissionRepository::check(&self.pool, user, dataset_id, PermissionKind::Read).await?;
        validate_select(sql)?;
        let (_, limit) = page_bounds(0, limit, self.max_page_limit)?;

        let commit = CommitRepository::get_commit(&self.pool, commit_id)
            .await?
            .ok_or(DomainError::NotFound)?;
        if commit.dataset_id != dataset_id {
            return Err(DomainError::NotFound);
        }

        let schema = CommitRepository::get_schema(&self.pool, commit_id)
            .await?
            .unwrap_or_default();
        let table = schema
            .tables
            .get(table_key)
            .ok_or(DomainError::NotFound)?;
        if table.columns.is_empty() {
            return Err(DomainError::Validation(format!(
                "table '{table_key}' has no columns to query"
            )));
        }

        let column_defs: Vec<String> = table
            .columns
            .iter()
            .map(|c| format!("{} text", quote_ident(&c.name)))
            .collect();

        // Temp table and preview run on one pinned connection; ON COMMIT
        // DROP cleans it up even on error paths.
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "CREATE TEMP TABLE dataset ({}) ON COMMIT DROP",
            column_defs.join(", ")
        ))
        .execute(&mut *tx)
        .await?;

        let record_shape = column_defs.join(", ");
        let insert_sql = format!(
            "INSERT INTO dataset SELECT * FROM jsonb_to_recordset($1::jsonb) AS x({record_shape})"
        );

        let mut offset = 0i64;
        const PAGE: i64 = 10_000;
        while offset < PREVIEW_SOURCE_CAP {
            let entries = CommitRepository::get_manifest(
                &self.pool,
                commit_id,
                Some(table_key),
                offset,
                PAGE.min(PREVIEW_SOURCE_CAP - offset),
            )
            .await?;
            if entries.is_empty() {
                break;
            }
            offset += entries.len() as i64;

            let hashes: Vec<String> = entries.iter().map(|e| e.row_hash.clone()).collect();
            let rows = RowStore::get_rows(&self.pool, &hashes).await?;
            let page: Vec<&Value> = entries.iter().filter_map(|e| rows.get(&e.row_hash)).collect();

            sqlx::query(&insert_sql)
                .bind(serde_json::to_value(&page).unwrap_or(Value::Array(vec![])))
                .execute(&mut *tx)
                .await?;
        }

        let wrapped = format!(
            "SELECT COALESCE(jsonb_agg(to_jsonb(sub)), '[]'::jsonb) AS result \
             FROM (SELECT * FROM ({sql}) q LIMIT {limit}) sub"
        );

        let row = sqlx::query(&wrapped)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| DomainError::Validation(format!("preview query failed: {e}")))?;
        let result: Value = row.try_get("result")?;

        tx.commit().await?;

        let returned = result.as_array().map(|a| a.len()).unwrap_or(0);
        Ok(json!({
            "commit_id": commit_id,
            "table_key": table_key,
            "row_limit": limit,
            "returned_rows": returned,
            "rows": result,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_select_accepts_plain_select() {
        assert!(validate_select("SELECT * FROM dataset WHERE id = '3'").is_ok());
        assert!(validate_select("with top as (select * from dataset) select count(*) from top").is_ok());
    }

    #[test]
    fn test_validate_select_rejects_mutations() {
        assert!(validate_select("DELETE FROM dataset").is_err());
        assert!(validate_select("SELECT 1; DROP TABLE rows").is_err());
        assert!(validate_select("select * into evil from dataset").is_err());
        assert!(validate_select("update dataset set x = 1").is_err());
        assert!(validate_select("").is_err());
    }

    #[test]
    fn test_validate_select_checks_whole_tokens() {
        // Column names merely containing forbidden substrings are fine.
        assert!(validate_select("select updated_at, dropped_count from dataset").is_ok());
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}

//! Search index sync
//!
//! `dataset_search` is a materialized summary of datasets refreshed after
//! mutating operations. Refreshes run `CONCURRENTLY` so reads never block,
//! and requests are coalesced: any number of refresh requests queued while
//! one is in flight collapse into a single follow-up refresh.

use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::events::{event_types, EventBus};
use crate::models::DatasetSummary;

pub struct SearchIndex;

impl SearchIndex {
    /// Refresh the materialized summary. Idempotent; repeated refreshes
    /// converge on the same observable state.
    pub async fn refresh(pool: &PgPool) -> Result<(), sqlx::Error> {
        sqlx::query("REFRESH MATERIALIZED VIEW CONCURRENTLY dataset_search")
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Full-text search over the summary, restricted to datasets the user
    /// can see.
    pub async fn search(
        pool: &PgPool,
        query: &str,
        user_id: Uuid,
        is_admin: bool,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<DatasetSummary>, sqlx::Error> {
        let rows: Vec<(
            Uuid,
            String,
            String,
            String,
            Vec<String>,
            chrono::DateTime<chrono::Utc>,
            chrono::DateTime<chrono::Utc>,
        )> = sqlx::query_as(
            r#"
            SELECT s.dataset_id, s.name, s.description, s.creator, s.tags, s.created_at, s.updated_at
            FROM dataset_search s
            WHERE s.search_text @@ plainto_tsquery('english', $1)
              AND ($3 OR EXISTS (
                    SELECT 1 FROM dataset_permissions p
                    WHERE p.dataset_id = s.dataset_id AND p.user_id = $2
              ))
            ORDER BY ts_rank(s.search_text, plainto_tsquery('english', $1)) DESC, s.updated_at DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(query)
        .bind(user_id)
        .bind(is_admin)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, name, description, creator, tags, created_at, updated_at)| DatasetSummary {
                    id,
                    name,
                    description,
                    creator,
                    tags,
                    created_at,
                    updated_at,
                },
            )
            .collect())
    }
}

/// Handle for requesting (coalesced) background refreshes.
#[derive(Clone)]
pub struct SearchRefresher {
    notify: Arc<Notify>,
}

impl SearchRefresher {
    /// Spawn the refresh loop. `notify` coalesces: N requests while a
    /// refresh is running produce at most one trailing refresh.
    pub fn spawn(pool: PgPool) -> Self {
        let notify = Arc::new(Notify::new());
        let waiter = Arc::clone(&notify);

        tokio::spawn(async move {
            loop {
                waiter.notified().await;
                if let Err(e) = SearchIndex::refresh(&pool).await {
                    tracing::warn!(error = %e, "search index refresh failed");
                }
            }
        });

        Self { notify }
    }

    pub fn request_refresh(&self) {
        self.notify.notify_one();
    }

    /// Subscribe to the bus and request a refresh for every dataset
    /// mutation event.
    pub fn spawn_event_listener(&self, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let mut rx = bus.subscribe();
        let refresher = self.clone();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if matches!(
                            event.event_type.as_str(),
                            event_types::DATASET_CREATED
                                | event_types::DATASET_UPDATED
                                | event_types::DATASET_DELETED
                                | event_types::DATASET_COMMITTED
                        ) {
                            refresher.request_refresh();
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        // Missed events still imply staleness; refresh once.
                        refresher.request_refresh();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

//! Audit log writer
//!
//! Persists published domain events to the `domain_events` table. The
//! writer runs as a bus subscriber; because delivery is at-least-once the
//! insert is keyed on `event_id` and re-deliveries are no-ops.

use sqlx::PgPool;

use crate::events::{DomainEvent, EventBus};

pub struct EventLogWriter;

impl EventLogWriter {
    pub async fn record(pool: &PgPool, event: &DomainEvent) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO domain_events
                (event_id, event_type, aggregate_id, aggregate_type, user_id, payload, occurred_at, correlation_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(event.event_id)
        .bind(&event.event_type)
        .bind(&event.aggregate_id)
        .bind(&event.aggregate_type)
        .bind(event.user_id)
        .bind(&event.payload)
        .bind(event.occurred_at)
        .bind(event.correlation_id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn list_for_aggregate(
        pool: &PgPool,
        aggregate_type: &str,
        aggregate_id: &str,
        limit: i64,
    ) -> Result<Vec<DomainEvent>, sqlx::Error> {
        let rows: Vec<(
            uuid::Uuid,
            String,
            String,
            String,
            Option<uuid::Uuid>,
            serde_json::Value,
            chrono::DateTime<chrono::Utc>,
            Option<uuid::Uuid>,
        )> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, aggregate_id, aggregate_type, user_id, payload, occurred_at, correlation_id
            FROM domain_events
            WHERE aggregate_type = $1 AND aggregate_id = $2
            ORDER BY occurred_at DESC
            LIMIT $3
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(
                    event_id,
                    event_type,
                    aggregate_id,
                    aggregate_type,
                    user_id,
                    payload,
                    occurred_at,
                    correlation_id,
                )| DomainEvent {
                    event_id,
                    event_type,
                    aggregate_id,
                    aggregate_type,
                    user_id,
                    payload,
                    occurred_at,
                    correlation_id,
                },
            )
            .collect())
    }

    /// Subscribe to the bus and persist every event until the bus closes.
    pub fn spawn(pool: PgPool, bus: &EventBus) -> tokio::task::JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = Self::record(&pool, &event).await {
                            tracing::warn!(
                                event_type = %event.event_type,
                                error = %e,
                                "failed to persist audit event"
                            );
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "audit writer lagged behind the event bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

//! Unit-of-Work: transactional envelope with deferred event emission
//!
//! Groups repository operations into one database transaction and buffers
//! domain events raised along the way. Events reach the bus only after the
//! transaction commits; rollback drops them. Service-layer writes go
//! through [`run_in_uow`], which expresses the acquire → try → commit +
//! publish / rollback + drop pattern in one place.

use std::future::Future;
use std::pin::Pin;

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{DomainError, DomainResult};
use crate::events::{DomainEvent, EventBus};

pub struct UnitOfWork {
    tx: Transaction<'static, Postgres>,
    events: Vec<DomainEvent>,
}

impl UnitOfWork {
    /// Open a transaction against the pool.
    pub async fn begin(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let tx = pool.begin().await?;
        Ok(Self {
            tx,
            events: Vec::new(),
        })
    }

    /// The open transaction, for repository calls.
    pub fn tx(&mut self) -> &mut Transaction<'static, Postgres> {
        &mut self.tx
    }

    /// Buffer an event for publication after commit.
    pub fn collect(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    /// Commit the transaction and hand back the buffered events. The caller
    /// publishes them; nothing is published if commit fails.
    pub async fn commit(self) -> Result<Vec<DomainEvent>, sqlx::Error> {
        self.tx.commit().await?;
        Ok(self.events)
    }

    /// Roll back and drop any buffered events.
    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}

type UowFuture<'t, T> = Pin<Box<dyn Future<Output = DomainResult<T>> + Send + 't>>;

/// Run `f` inside a unit of work: on success commit and publish the
/// collected events, on error roll back and drop them.
pub async fn run_in_uow<T, F>(pool: &PgPool, bus: &EventBus, f: F) -> DomainResult<T>
where
    F: for<'t> FnOnce(&'t mut UnitOfWork) -> UowFuture<'t, T>,
{
    let mut uow = UnitOfWork::begin(pool).await.map_err(DomainError::from)?;

    match f(&mut uow).await {
        Ok(value) => {
            let events = uow.commit().await.map_err(DomainError::from)?;
            bus.publish_all(events);
            Ok(value)
        }
        Err(err) => {
            // Rollback failure is secondary to the original error.
            if let Err(rb) = uow.rollback().await {
                tracing::warn!(error = %rb, "rollback failed after operation error");
            }
            Err(err)
        }
    }
}

//! REST API module
//!
//! HTTP surface over the service layer. Each route module exports a
//! `create_*_router` and the composition happens in [`create_router`];
//! every handler authenticates via [`auth::AuthUser`] and returns domain
//! errors that map to status codes in one place (`error::DomainError`).

pub mod auth;
pub mod data_routes;
pub mod dataset_routes;
pub mod import_routes;
pub mod job_routes;
pub mod ref_routes;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use sqlx::PgPool;

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::services::{DatasetService, QueryService, RefService, SqlService};

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub bus: EventBus,
    pub datasets: DatasetService,
    pub refs: RefService,
    pub queries: QueryService,
    pub sql: SqlService,
}

impl AppState {
    pub fn new(pool: PgPool, config: AppConfig, bus: EventBus) -> Self {
        let limit = config.max_page_limit;
        Self {
            datasets: DatasetService::new(pool.clone(), bus.clone(), limit),
            refs: RefService::new(pool.clone(), bus.clone(), limit),
            queries: QueryService::new(pool.clone(), limit),
            sql: SqlService::new(pool.clone(), limit),
            pool,
            config: Arc::new(config),
            bus,
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

/// Assemble the full API router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .merge(dataset_routes::create_dataset_router(state.clone()))
        .merge(ref_routes::create_ref_router(state.clone()))
        .merge(data_routes::create_data_router(state.clone()))
        .merge(import_routes::create_import_router(state.clone()))
        .merge(job_routes::create_job_router(state))
}

//! datavault — dataset management with git-like versioning of tabular data.
//!
//! Uploaded CSV/XLSX/Parquet files are ingested into a content-addressed
//! row store; each import creates an immutable commit chained by parent
//! pointers, and named refs (branches) point into the commit graph.
//! Long-running work (imports, sampling, exploration, profiling) runs
//! through a persistent job queue drained by background workers.

pub mod api;
pub mod canonical;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod import;
pub mod jobs;
pub mod models;
pub mod services;

pub use config::AppConfig;
pub use error::{DomainError, DomainResult};

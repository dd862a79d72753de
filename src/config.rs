//! Service configuration
//!
//! All tunables are read once from the environment at startup into a typed
//! config struct. Defaults are chosen for local development; production
//! deployments override via environment variables (see `.env`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Database connection configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub connection_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_lifetime: Option<Duration>,
    /// Request-level deadline propagated to the database as a per-session
    /// statement timeout.
    pub statement_timeout: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/datavault".to_string()),
            max_connections: env_parse("DATABASE_POOL_SIZE", 10),
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            statement_timeout: Some(Duration::from_millis(env_parse(
                "DB_STATEMENT_TIMEOUT_MS",
                30_000,
            ))),
        }
    }
}

/// Import pipeline tunables
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Hard cap on uploaded file size, enforced while streaming the upload.
    pub max_upload_bytes: u64,
    /// Rows accumulated before a batch is staged and hashed.
    pub batch_size: usize,
    /// Upload copy chunk size.
    pub chunk_bytes: usize,
    /// Persist a resume checkpoint every N batches.
    pub checkpoint_interval_batches: u64,
    /// Directory staged upload files are written to.
    pub staging_dir: PathBuf,
    /// Pending + running imports allowed per dataset.
    pub max_concurrent_imports: i64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", 1_073_741_824),
            batch_size: env_parse("IMPORT_BATCH_SIZE", 10_000),
            chunk_bytes: env_parse("UPLOAD_CHUNK_BYTES", 1 << 20),
            checkpoint_interval_batches: env_parse("CHECKPOINT_INTERVAL_BATCHES", 5),
            staging_dir: std::env::var("STAGING_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir().join("datavault-staging")),
            max_concurrent_imports: env_parse("MAX_CONCURRENT_IMPORTS", 4),
        }
    }
}

/// Worker runtime tunables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_count: usize,
    /// Idle poll interval when no pending jobs are found.
    pub poll_interval: Duration,
    /// A running job whose heartbeat is older than this is presumed dead
    /// and reset to pending on recovery sweeps.
    pub heartbeat_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: env_parse("WORKER_COUNT", 2),
            poll_interval: Duration::from_millis(env_parse("WORKER_POLL_MS", 500)),
            heartbeat_timeout: Duration::from_secs(env_parse("HEARTBEAT_TIMEOUT_SECS", 120)),
        }
    }
}

/// Top-level application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub token_secret: String,
    pub database: DatabaseConfig,
    pub import: ImportConfig,
    pub worker: WorkerConfig,
    /// Pagination limit cap; larger requested limits are clamped.
    pub max_page_limit: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: std::env::var("BIND_ADDR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 3000))),
            token_secret: std::env::var("TOKEN_SECRET")
                .unwrap_or_else(|_| "dev-secret-do-not-use-in-production".to_string()),
            database: DatabaseConfig::default(),
            import: ImportConfig::default(),
            worker: WorkerConfig::default(),
            max_page_limit: env_parse("MAX_PAGE_LIMIT", 1000),
        }
    }
}

impl AppConfig {
    /// Load configuration from the environment
    pub fn from_env() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = AppConfig::default();
        assert!(config.import.batch_size > 0, "batch size must be positive");
        assert!(config.max_page_limit > 0, "page limit cap must be positive");
        assert!(
            config.worker.heartbeat_timeout > config.worker.poll_interval,
            "heartbeat timeout should exceed the poll interval"
        );
    }
}

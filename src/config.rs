//! Configuration management

use anyhow::{Context, Result};

use crate::services::import::ImportLimits;
use crate::types::DEFAULT_BATCH_SIZE;

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// NATS server URL
    pub nats_url: String,

    /// Optional NATS credentials
    pub nats_user: Option<String>,
    pub nats_password: Option<String>,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Prefix for every NATS subject this worker serves
    pub subject_prefix: String,

    /// Directory for rolling log files
    pub log_dir: String,

    /// Where the job store persists its history
    pub job_store_path: String,

    /// Upload size cap in bytes
    pub max_upload_bytes: usize,

    /// Batch size used when a job does not set one
    pub default_batch_size: u32,

    /// Number of errors included in a status response
    pub status_error_limit: usize,

    /// Number of preview rows in a validate response
    pub preview_rows: usize,

    /// Jobs kept in the history before terminal ones are evicted
    pub job_history_limit: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let nats_url =
            std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string());

        let nats_user = std::env::var("NATS_USER").ok();
        let nats_password = std::env::var("NATS_PASSWORD").ok();

        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let subject_prefix =
            std::env::var("SUBJECT_PREFIX").unwrap_or_else(|_| "kartoteka".to_string());

        let log_dir = std::env::var("LOG_DIR").unwrap_or_else(|_| "logs".to_string());

        let job_store_path = std::env::var("JOB_STORE_PATH")
            .unwrap_or_else(|_| "data/import-jobs.json".to_string());

        let max_upload_bytes = match std::env::var("MAX_UPLOAD_BYTES") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("MAX_UPLOAD_BYTES must be a number, got '{}'", raw))?,
            Err(_) => 10 * 1024 * 1024,
        };

        let default_batch_size = match std::env::var("DEFAULT_BATCH_SIZE") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("DEFAULT_BATCH_SIZE must be a number, got '{}'", raw))?,
            Err(_) => DEFAULT_BATCH_SIZE,
        };

        let status_error_limit = match std::env::var("STATUS_ERROR_LIMIT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("STATUS_ERROR_LIMIT must be a number, got '{}'", raw))?,
            Err(_) => 50,
        };

        let preview_rows = match std::env::var("PREVIEW_ROWS") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("PREVIEW_ROWS must be a number, got '{}'", raw))?,
            Err(_) => 10,
        };

        let job_history_limit = match std::env::var("JOB_HISTORY_LIMIT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("JOB_HISTORY_LIMIT must be a number, got '{}'", raw))?,
            Err(_) => 200,
        };

        Ok(Self {
            nats_url,
            nats_user,
            nats_password,
            database_url,
            subject_prefix,
            log_dir,
            job_store_path,
            max_upload_bytes,
            default_batch_size,
            status_error_limit,
            preview_rows,
            job_history_limit,
        })
    }

    /// Boundaries handed to the import service.
    pub fn import_limits(&self) -> ImportLimits {
        ImportLimits {
            max_upload_bytes: self.max_upload_bytes,
            default_batch_size: self.default_batch_size,
            status_error_limit: self.status_error_limit,
            preview_rows: self.preview_rows,
        }
    }
}

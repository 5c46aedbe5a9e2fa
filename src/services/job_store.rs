//! Import job registry
//!
//! Keeps jobs in memory with file-backed persistence so history survives
//! worker restarts. The store is the single writer of job state: every
//! mutation goes through [`JobStore::update`], which enforces the lifecycle
//! rules (terminal states absorb, status never moves backwards, counters
//! never exceed the row total, and frozen fields stay frozen).
//!
//! Constructed once at startup and shared as an `Arc`; there is no global
//! instance.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::{
    ImportIssue, ImportJob, ImportJobStatus, ImportType, JobPatch, JobSummary,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job is already {status} and can no longer change")]
    Terminal { status: ImportJobStatus },
    #[error("cannot move job from {from} to {to}")]
    Regression {
        from: ImportJobStatus,
        to: ImportJobStatus,
    },
    #[error("counters exceed row total: {processed} processed + {failed} failed > {total}")]
    CounterInvariant {
        processed: u32,
        failed: u32,
        total: u32,
    },
    #[error("field '{field}' can no longer change")]
    Immutable { field: &'static str },
}

/// Optional filters for history listings.
#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryFilter {
    pub import_type: Option<ImportType>,
    pub status: Option<ImportJobStatus>,
}

/// One page of job summaries, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub items: Vec<JobSummary>,
    pub total: u32,
    pub page: u32,
    pub per_page: u32,
}

/// Job storage backed by an in-memory deque + JSON file on disk.
pub struct JobStore {
    jobs: RwLock<VecDeque<ImportJob>>,
    path: Option<PathBuf>,
    capacity: usize,
}

impl JobStore {
    /// Open the store, loading persisted jobs when `path` exists. Jobs that
    /// were still active when the previous process stopped are marked failed:
    /// their staged file content lived only in that process.
    pub fn new(path: Option<PathBuf>, capacity: usize) -> Self {
        let mut jobs = VecDeque::with_capacity(capacity);
        if let Some(path) = path.as_deref() {
            if let Some(loaded) = Self::load_from_disk(path) {
                let mut quarantined = 0usize;
                for mut job in loaded {
                    if !job.status.is_terminal() {
                        job.status = ImportJobStatus::Failed;
                        job.errors.push(ImportIssue::new(
                            0,
                            "",
                            "import interrupted by worker restart",
                        ));
                        job.current_operation = None;
                        job.updated_at = Utc::now();
                        job.completed_at = Some(job.updated_at);
                        quarantined += 1;
                    }
                    jobs.push_back(job);
                }
                info!("Loaded {} import jobs from disk", jobs.len());
                if quarantined > 0 {
                    warn!(
                        "Marked {} interrupted import jobs as failed after restart",
                        quarantined
                    );
                    Self::save_to_disk(path, &jobs);
                }
            }
        }
        Self {
            jobs: RwLock::new(jobs),
            path,
            capacity,
        }
    }

    /// In-memory store without persistence; used in tests.
    pub fn ephemeral(capacity: usize) -> Self {
        Self::new(None, capacity)
    }

    /// Register a new job, evicting the oldest terminal job when full.
    pub fn create(&self, job: ImportJob) -> Uuid {
        let id = job.id;
        let mut jobs = self.jobs.write();

        while jobs.len() >= self.capacity {
            let Some(evict) = jobs.iter().rposition(|j| j.status.is_terminal()) else {
                warn!(
                    "Job store over capacity ({}) with only active jobs, keeping all",
                    self.capacity
                );
                break;
            };
            jobs.remove(evict);
        }

        jobs.push_front(job);
        self.persist(&jobs);
        id
    }

    pub fn get(&self, id: Uuid) -> Option<ImportJob> {
        self.jobs.read().iter().find(|j| j.id == id).cloned()
    }

    /// Apply one atomic patch, returning the updated job.
    pub fn update(&self, id: Uuid, patch: JobPatch) -> Result<ImportJob, JobStoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or(JobStoreError::NotFound(id))?;

        if job.status.is_terminal() {
            return Err(JobStoreError::Terminal { status: job.status });
        }

        if let Some(next) = patch.status {
            if next.rank() < job.status.rank() {
                return Err(JobStoreError::Regression {
                    from: job.status,
                    to: next,
                });
            }
        }

        // Settings freeze once processing starts; mapping and row total are
        // fixed as soon as validation has run.
        if patch.settings.is_some() && job.status.rank() >= ImportJobStatus::Processing.rank() {
            return Err(JobStoreError::Immutable { field: "settings" });
        }
        if patch.column_mapping.is_some() && job.status != ImportJobStatus::Pending {
            return Err(JobStoreError::Immutable {
                field: "columnMapping",
            });
        }
        if patch.total_rows.is_some() && job.status != ImportJobStatus::Pending {
            return Err(JobStoreError::Immutable { field: "totalRows" });
        }

        let total = patch.total_rows.unwrap_or(job.total_rows);
        let (processed, failed) = patch
            .counters
            .unwrap_or((job.processed_rows, job.failed_rows));
        if u64::from(processed) + u64::from(failed) > u64::from(total) {
            return Err(JobStoreError::CounterInvariant {
                processed,
                failed,
                total,
            });
        }

        if let Some(settings) = patch.settings {
            job.settings = settings;
        }
        if let Some(mapping) = patch.column_mapping {
            job.column_mapping = mapping;
        }
        if let Some(total) = patch.total_rows {
            job.total_rows = total;
        }
        if let Some((processed, failed)) = patch.counters {
            job.processed_rows = processed;
            job.failed_rows = failed;
        }
        job.errors.extend(patch.append_errors);
        if let Some(operation) = patch.current_operation {
            job.current_operation = operation;
        }

        job.updated_at = Utc::now();
        if let Some(next) = patch.status {
            job.status = next;
            if next.is_terminal() {
                job.completed_at = Some(job.updated_at);
            }
        }

        let updated = job.clone();
        self.persist(&jobs);
        Ok(updated)
    }

    /// Paginated history, newest first. Pages are 1-based.
    pub fn list(&self, filter: HistoryFilter, page: u32, per_page: u32) -> JobPage {
        let jobs = self.jobs.read();
        let page = page.max(1);
        let per_page = per_page.max(1);

        let matching: Vec<&ImportJob> = jobs
            .iter()
            .filter(|j| filter.import_type.is_none_or(|t| j.import_type == t))
            .filter(|j| filter.status.is_none_or(|s| j.status == s))
            .collect();

        let total = matching.len() as u32;
        let start = ((page - 1) as usize).saturating_mul(per_page as usize);
        let items = matching
            .into_iter()
            .skip(start)
            .take(per_page as usize)
            .map(|j| j.summary())
            .collect();

        JobPage {
            items,
            total,
            page,
            per_page,
        }
    }

    fn persist(&self, jobs: &VecDeque<ImportJob>) {
        if let Some(path) = self.path.as_deref() {
            Self::save_to_disk(path, jobs);
        }
    }

    fn load_from_disk(path: &Path) -> Option<Vec<ImportJob>> {
        if !path.exists() {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<Vec<ImportJob>>(&content) {
                Ok(jobs) => Some(jobs),
                Err(e) => {
                    warn!("Failed to parse job store file: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("Failed to read job store file: {}", e);
                None
            }
        }
    }

    fn save_to_disk(path: &Path, jobs: &VecDeque<ImportJob>) {
        if let Some(dir) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("Failed to create job store directory: {}", e);
                return;
            }
        }
        let entries: Vec<&ImportJob> = jobs.iter().collect();
        match serde_json::to_string_pretty(&entries) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!("Failed to write job store file: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize job store: {}", e),
        }
    }
}

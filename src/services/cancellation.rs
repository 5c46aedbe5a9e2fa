//! Cancellation registry for running imports
//!
//! Provides cooperative cancellation with RAII-based cleanup via `JobGuard`.
//! The executor polls `is_cancelled` at batch boundaries only, so a cancel
//! request never preempts an in-flight batch.
//!
//! One registry is constructed at startup and shared through the import
//! service; there is no global instance.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// RAII guard that removes the job from the registry when dropped.
/// Held by the executor task for the duration of processing.
pub struct JobGuard {
    job_id: Uuid,
    registry: CancellationRegistry,
}

impl JobGuard {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.job_id);
    }
}

/// Thread-safe registry of running jobs and their cancellation tokens.
/// All operations are single HashMap lookups under a Mutex.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    jobs: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job. Returns a `JobGuard` that must be held in scope during
    /// processing; dropping it removes the job from the registry.
    pub fn register(&self, job_id: Uuid) -> JobGuard {
        self.jobs.lock().insert(job_id, CancellationToken::new());
        JobGuard {
            job_id,
            registry: self.clone(),
        }
    }

    /// Request cancellation of a running job.
    ///
    /// Returns:
    /// - `true`  — job found, cancellation recorded
    /// - `false` — job not registered (already finished or never started)
    pub fn cancel(&self, job_id: &Uuid) -> bool {
        match self.jobs.lock().get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Check if a job has been cancelled. Called between batches.
    pub fn is_cancelled(&self, job_id: &Uuid) -> bool {
        self.jobs
            .lock()
            .get(job_id)
            .map_or(false, |t| t.is_cancelled())
    }

    /// Remove a finished job from the registry.
    /// Called automatically by `JobGuard::drop`.
    pub fn remove(&self, job_id: &Uuid) {
        self.jobs.lock().remove(job_id);
    }

    /// Check if a job is currently registered (for testing)
    #[cfg(test)]
    fn contains(&self, job_id: &Uuid) -> bool {
        self.jobs.lock().contains_key(job_id)
    }
}

//! Batch executor
//!
//! One dispatcher task owns the job queue. Start requests enqueue a
//! [`JobDispatch`]; the dispatcher spawns one task per job, so distinct jobs
//! run concurrently while each job's batches stay strictly sequential.
//!
//! Progress is persisted through the job store after every batch, and that
//! persist is the cancellation checkpoint: a cancel request never interrupts
//! an in-flight batch, it is observed once the batch's counters are stored.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::parser::{RawRow, TabularFile};
use super::schema::schema_for;
use super::sink::SinkError;
use super::validator::validate_row;
use super::ImportService;
use crate::services::cancellation::JobGuard;
use crate::types::{
    DuplicateHandling, ImportIssue, ImportJobStatus, JobPatch, LogVerbosity, ValidationMode,
};

/// Everything the dispatcher needs to run one accepted job. The guard keeps
/// the job registered for cancellation until the task finishes.
pub struct JobDispatch {
    pub job_id: Uuid,
    pub guard: JobGuard,
}

/// Consume accepted jobs until shutdown or all senders are gone.
pub async fn run_dispatcher(service: Arc<ImportService>, mut queue: mpsc::Receiver<JobDispatch>) {
    info!("Import dispatcher started");
    loop {
        tokio::select! {
            _ = service.shutdown.cancelled() => {
                info!("Import dispatcher stopping (shutdown requested)");
                break;
            }
            dispatch = queue.recv() => {
                let Some(dispatch) = dispatch else {
                    info!("Import dispatcher stopping (queue closed)");
                    break;
                };
                let service = Arc::clone(&service);
                tokio::spawn(execute_job(service, dispatch));
            }
        }
    }
}

async fn execute_job(service: Arc<ImportService>, dispatch: JobDispatch) {
    let job_id = dispatch.job_id;
    // Held for the whole run; dropping it deregisters the job.
    let _guard = dispatch.guard;

    if let Err(e) = run_import(&service, job_id).await {
        error!("Import job {} aborted: {:#}", job_id, e);
        let patch = JobPatch::status(ImportJobStatus::Failed)
            .with_errors(vec![ImportIssue::new(0, "", format!("internal error: {:#}", e))])
            .clear_operation();
        if let Err(store_err) = service.store.update(job_id, patch) {
            warn!(
                "Could not record failure for import job {}: {}",
                job_id, store_err
            );
        }
    }

    service.after_terminal(job_id).await;
}

async fn run_import(service: &ImportService, job_id: Uuid) -> anyhow::Result<()> {
    let job = service
        .store
        .get(job_id)
        .ok_or_else(|| anyhow::anyhow!("job {} missing from store", job_id))?;
    if job.status != ImportJobStatus::Processing {
        // A cancel can land between acceptance and pickup.
        info!("Import job {} is {}, nothing to run", job_id, job.status);
        return Ok(());
    }
    let staged = service
        .staged_file(job_id)
        .ok_or_else(|| anyhow::anyhow!("no staged file for job {}", job_id))?;

    let schema = schema_for(job.import_type);
    let sink = service.sinks.for_type(job.import_type);
    let settings = job.settings.clone();
    let mapping = job.column_mapping.clone();

    let file = TabularFile::parse(&staged.content, staged.delimiter)?;
    let batch_size = settings.batch_size.max(1);
    let total_batches = job.total_rows.div_ceil(batch_size);

    info!(
        "Import job {} started: {} rows from '{}' in batches of {}",
        job_id, job.total_rows, job.file_name, batch_size
    );

    let mut processed = job.processed_rows;
    let mut failed = job.failed_rows;

    // The start of the run is the first batch boundary.
    if cancellation_requested(service, job_id) {
        finish_cancelled(service, job_id, processed, failed)?;
        return Ok(());
    }

    let mut rows = file.rows();
    let mut batch_index = 0u32;

    loop {
        let batch: Vec<RawRow> = rows.by_ref().take(batch_size as usize).collect();
        if batch.is_empty() {
            break;
        }
        batch_index += 1;

        service.store.update(
            job_id,
            JobPatch::default().with_operation(format!("batch {}/{}", batch_index, total_batches)),
        )?;

        let mut batch_issues: Vec<ImportIssue> = Vec::new();

        for row in &batch {
            let outcome = validate_row(row, &mapping, schema, &settings);
            if !outcome.is_valid() {
                // The issues were already recorded during validation.
                failed += 1;
                continue;
            }

            let result = match sink.insert(&outcome.record).await {
                Err(SinkError::Duplicate { key }) => match settings.duplicate_handling {
                    DuplicateHandling::Skip => {
                        if matches!(settings.log_verbosity, LogVerbosity::Verbose) {
                            debug!("Job {}: row {} skipped, key '{}' exists", job_id, row.line, key);
                        }
                        Ok(())
                    }
                    DuplicateHandling::Update => sink.update_by_key(&outcome.record).await,
                    DuplicateHandling::CreateNew => sink.force_insert(&outcome.record).await,
                },
                other => other,
            };

            match result {
                Ok(()) => {
                    processed += 1;
                    if matches!(settings.log_verbosity, LogVerbosity::Verbose) {
                        debug!("Job {}: row {} written via {}", job_id, row.line, sink.name());
                    }
                }
                Err(e) => {
                    failed += 1;
                    let issue = ImportIssue::new(
                        row.line,
                        "",
                        format!("row could not be written: {}", e),
                    );

                    if settings.validation_mode == ValidationMode::Strict {
                        batch_issues.push(issue);
                        warn!(
                            "Import job {} failed at row {} under strict mode",
                            job_id, row.line
                        );
                        service.store.update(
                            job_id,
                            JobPatch::status(ImportJobStatus::Failed)
                                .with_counters(processed, failed)
                                .with_errors(batch_issues)
                                .clear_operation(),
                        )?;
                        return Ok(());
                    }
                    batch_issues.push(issue);
                }
            }
        }

        // Persist the batch, then honor any cancellation recorded meanwhile.
        service.store.update(
            job_id,
            JobPatch::default()
                .with_counters(processed, failed)
                .with_errors(batch_issues),
        )?;
        if !matches!(settings.log_verbosity, LogVerbosity::Minimal) {
            debug!(
                "Import job {}: batch {}/{} persisted ({} processed, {} failed)",
                job_id, batch_index, total_batches, processed, failed
            );
        }

        if cancellation_requested(service, job_id) {
            finish_cancelled(service, job_id, processed, failed)?;
            return Ok(());
        }
    }

    let status = terminal_status(processed, failed);
    let mut patch = JobPatch::status(status)
        .with_counters(processed, failed)
        .clear_operation();
    if status == ImportJobStatus::Failed {
        patch = patch.with_errors(vec![ImportIssue::new(0, "", "no rows could be imported")]);
    }
    service.store.update(job_id, patch)?;

    info!(
        "Import job {} finished as {}: {} processed, {} failed of {}",
        job_id, status, processed, failed, job.total_rows
    );
    Ok(())
}

fn cancellation_requested(service: &ImportService, job_id: Uuid) -> bool {
    service.registry.is_cancelled(&job_id) || service.shutdown.is_cancelled()
}

fn finish_cancelled(
    service: &ImportService,
    job_id: Uuid,
    processed: u32,
    failed: u32,
) -> anyhow::Result<()> {
    service.store.update(
        job_id,
        JobPatch::status(ImportJobStatus::Cancelled)
            .with_counters(processed, failed)
            .clear_operation(),
    )?;
    info!(
        "Import job {} cancelled after {} processed rows",
        job_id, processed
    );
    Ok(())
}

/// Classify the end state from the final counters.
fn terminal_status(processed: u32, failed: u32) -> ImportJobStatus {
    if failed == 0 {
        ImportJobStatus::Completed
    } else if processed > 0 {
        ImportJobStatus::CompletedWithErrors
    } else {
        ImportJobStatus::Failed
    }
}

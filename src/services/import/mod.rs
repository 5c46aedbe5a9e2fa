//! Import pipeline
//!
//! Orchestrates the full flow: upload staging, mapping + validation preview,
//! start, background execution, polling, cancellation, report and history.
//! One [`ImportService`] is constructed at startup and shared with the NATS
//! handlers; the paired dispatcher task (see [`executor`]) consumes accepted
//! jobs from an mpsc queue, so a start request only enqueues and returns.

pub mod executor;
pub mod mapper;
pub mod parser;
pub mod report;
pub mod schema;
pub mod sink;
pub mod validator;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::services::cancellation::CancellationRegistry;
use crate::services::job_store::{HistoryFilter, JobPage, JobStore, JobStoreError};
use crate::types::{
    ColumnBinding, ImportIssue, ImportJob, ImportJobStatus, ImportSettings, ImportSettingsUpdate,
    ImportType, InvalidSettings, JobPatch, MappingAssignment, UnknownImportType, ValidationMode,
};

pub use executor::{run_dispatcher, JobDispatch};
use mapper::{resolve_mapping, MappingError};
use parser::{ParseError, TabularFile};
use report::ImportStatusResponse;
use schema::{schema_for, FieldDescriptor};
pub use sink::SinkSet;

// ==========================================================================
// Errors
// ==========================================================================

/// Problems reported synchronously to the caller, before or instead of
/// touching a running job. Row-level issues never appear here; those are
/// recorded on the job itself.
#[derive(Debug, thiserror::Error)]
pub enum ImportInputError {
    #[error(transparent)]
    UnknownType(#[from] UnknownImportType),
    #[error("file exceeds the {limit} byte upload limit")]
    FileTooLarge { limit: usize },
    #[error("unsupported file '{0}', expected a .csv or .txt upload")]
    UnsupportedFile(String),
    #[error("unsupported delimiter '{0}', expected ',' or ';'")]
    UnsupportedDelimiter(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error(transparent)]
    Settings(#[from] InvalidSettings),
    #[error("job {0} not found")]
    JobNotFound(Uuid),
    #[error("operation not allowed while job is {status}")]
    InvalidState { status: ImportJobStatus },
    #[error("{count} validation errors must be resolved before a strict import can start")]
    BlockingErrors { count: usize },
    #[error("report is only available once the job has finished")]
    ReportNotReady,
    #[error("import queue is full, retry later")]
    QueueFull,
    #[error("missing parameter '{0}'")]
    MissingParameter(&'static str),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ImportInputError {
    /// Stable machine-readable code for error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            ImportInputError::UnknownType(_) => "UNKNOWN_IMPORT_TYPE",
            ImportInputError::FileTooLarge { .. } => "FILE_TOO_LARGE",
            ImportInputError::UnsupportedFile(_) => "UNSUPPORTED_FILE",
            ImportInputError::UnsupportedDelimiter(_) => "UNSUPPORTED_DELIMITER",
            ImportInputError::Parse(_) => "PARSE_ERROR",
            ImportInputError::Mapping(MappingError::Incomplete { .. }) => "INCOMPLETE_MAPPING",
            ImportInputError::Mapping(MappingError::Duplicate { .. }) => "DUPLICATE_MAPPING",
            ImportInputError::Mapping(MappingError::UnknownField { .. }) => "UNKNOWN_FIELD",
            ImportInputError::Settings(_) => "INVALID_SETTINGS",
            ImportInputError::JobNotFound(_) => "JOB_NOT_FOUND",
            ImportInputError::InvalidState { .. } => "INVALID_JOB_STATE",
            ImportInputError::BlockingErrors { .. } => "VALIDATION_FAILED",
            ImportInputError::ReportNotReady => "REPORT_NOT_READY",
            ImportInputError::QueueFull => "QUEUE_FULL",
            ImportInputError::MissingParameter(_) => "MISSING_PARAMETER",
            ImportInputError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<JobStoreError> for ImportInputError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => ImportInputError::JobNotFound(id),
            JobStoreError::Terminal { status } => ImportInputError::InvalidState { status },
            JobStoreError::Regression { from, .. } => {
                ImportInputError::InvalidState { status: from }
            }
            other => ImportInputError::Internal(anyhow::anyhow!(other)),
        }
    }
}

// ==========================================================================
// Requests and responses
// ==========================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub import_type: String,
    pub file_name: String,
    pub file_content: String,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub settings: ImportSettingsUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub job_id: Uuid,
    pub file_name: String,
    pub status: ImportJobStatus,
    pub headers: Vec<String>,
}

/// Validate either an already uploaded job (`jobId`) or an inline file
/// (`importType` + `fileContent`), which is staged first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    #[serde(default)]
    pub job_id: Option<Uuid>,
    #[serde(default)]
    pub import_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_content: Option<String>,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub mapping: Vec<MappingAssignment>,
    #[serde(default)]
    pub settings: ImportSettingsUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationStats {
    pub total_rows: u32,
    pub valid_rows: u32,
    pub invalid_rows: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub job_id: Uuid,
    pub status: ImportJobStatus,
    pub headers: Vec<String>,
    /// Preview of the first rows as header-keyed objects.
    pub rows: Vec<serde_json::Value>,
    pub column_mapping: Vec<ColumnBinding>,
    pub validation_results: Vec<ImportIssue>,
    pub stats: ValidationStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub job_id: Uuid,
    #[serde(default)]
    pub settings: ImportSettingsUpdate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub job_id: Uuid,
    pub status: ImportJobStatus,
}

/// Reference to an existing job; used by status, cancel and report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRef {
    pub job_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: ImportJobStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportResponse {
    pub job_id: Uuid,
    pub file_name: String,
    pub report: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRequest {
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
    #[serde(default)]
    pub import_type: Option<ImportType>,
    #[serde(default)]
    pub status: Option<ImportJobStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRequest {
    pub import_type: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaResponse {
    pub import_type: ImportType,
    pub key: &'static str,
    pub fields: Vec<FieldDescriptor>,
}

/// Published on `{prefix}.import.completed` when a job asked for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotice {
    pub job_id: Uuid,
    pub import_type: ImportType,
    pub file_name: String,
    pub status: ImportJobStatus,
    pub total_rows: u32,
    pub processed_rows: u32,
    pub failed_rows: u32,
    pub error_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ==========================================================================
// Service
// ==========================================================================

/// Capacity of the queue between start requests and the dispatcher.
pub const DISPATCH_QUEUE_DEPTH: usize = 16;

/// Tunable boundaries, sourced from configuration at startup.
#[derive(Debug, Clone)]
pub struct ImportLimits {
    pub max_upload_bytes: usize,
    pub default_batch_size: u32,
    pub status_error_limit: usize,
    pub preview_rows: usize,
}

impl Default for ImportLimits {
    fn default() -> Self {
        Self {
            max_upload_bytes: 10 * 1024 * 1024,
            default_batch_size: 50,
            status_error_limit: 50,
            preview_rows: 10,
        }
    }
}

/// Publishes completion notices over NATS.
pub struct Notifier {
    pub client: async_nats::Client,
    pub subject: String,
}

/// Uploaded file held in memory for the job's active lifetime.
#[derive(Clone)]
pub(crate) struct StagedFile {
    pub content: Arc<str>,
    pub delimiter: Option<u8>,
}

pub struct ImportService {
    pub(crate) store: Arc<JobStore>,
    pub(crate) registry: CancellationRegistry,
    pub(crate) sinks: Arc<SinkSet>,
    pub(crate) shutdown: CancellationToken,
    uploads: Mutex<HashMap<Uuid, StagedFile>>,
    dispatch_tx: mpsc::Sender<JobDispatch>,
    notifier: Option<Notifier>,
    limits: ImportLimits,
}

impl ImportService {
    /// Build the service and the receiving end of its dispatch queue. The
    /// caller must hand the receiver to [`run_dispatcher`].
    pub fn new(
        store: Arc<JobStore>,
        sinks: Arc<SinkSet>,
        limits: ImportLimits,
        notifier: Option<Notifier>,
        shutdown: CancellationToken,
        queue_depth: usize,
    ) -> (Arc<Self>, mpsc::Receiver<JobDispatch>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(queue_depth.max(1));
        let service = Arc::new(Self {
            store,
            registry: CancellationRegistry::new(),
            sinks,
            shutdown,
            uploads: Mutex::new(HashMap::new()),
            dispatch_tx,
            notifier,
            limits,
        });
        (service, dispatch_rx)
    }

    /// Stage an uploaded file and create its pending job.
    pub fn upload(&self, request: UploadRequest) -> Result<UploadResponse, ImportInputError> {
        let import_type: ImportType = request.import_type.parse()?;

        if request.file_content.len() > self.limits.max_upload_bytes {
            return Err(ImportInputError::FileTooLarge {
                limit: self.limits.max_upload_bytes,
            });
        }
        if !has_supported_extension(&request.file_name) {
            return Err(ImportInputError::UnsupportedFile(request.file_name));
        }
        let delimiter = parse_delimiter(request.delimiter.as_deref())?;
        let file = TabularFile::parse(&request.file_content, delimiter)?;

        let settings = self.base_settings().apply(&request.settings)?;
        let job = ImportJob::new(import_type, &request.file_name, settings);
        let job_id = job.id;
        self.store.create(job);
        self.uploads.lock().insert(
            job_id,
            StagedFile {
                content: request.file_content.into(),
                delimiter,
            },
        );

        info!(
            "Staged {} import '{}' as job {} ({} columns)",
            import_type,
            request.file_name,
            job_id,
            file.headers().len()
        );
        Ok(UploadResponse {
            job_id,
            file_name: request.file_name,
            status: ImportJobStatus::Pending,
            headers: file.headers().to_vec(),
        })
    }

    /// Resolve the mapping and validate every row. On a pending job this runs
    /// once and moves it to `validating`; repeating the call returns the
    /// stored outcome without growing the error list.
    pub fn validate(&self, request: ValidateRequest) -> Result<ValidateResponse, ImportInputError> {
        let job_id = match request.job_id {
            Some(id) => id,
            None => {
                // Inline file: stage it first, then validate the new job.
                let import_type = request
                    .import_type
                    .clone()
                    .ok_or(ImportInputError::MissingParameter("importType"))?;
                let file_content = request
                    .file_content
                    .clone()
                    .ok_or(ImportInputError::MissingParameter("fileContent"))?;
                let uploaded = self.upload(UploadRequest {
                    import_type,
                    file_name: request
                        .file_name
                        .clone()
                        .unwrap_or_else(|| "upload.csv".to_string()),
                    file_content,
                    delimiter: request.delimiter.clone(),
                    settings: request.settings.clone(),
                })?;
                uploaded.job_id
            }
        };

        let job = self
            .store
            .get(job_id)
            .ok_or(ImportInputError::JobNotFound(job_id))?;

        match job.status {
            ImportJobStatus::Pending => self.run_validation(job, &request),
            ImportJobStatus::Validating => self.validation_snapshot(job),
            status => Err(ImportInputError::InvalidState { status }),
        }
    }

    fn run_validation(
        &self,
        job: ImportJob,
        request: &ValidateRequest,
    ) -> Result<ValidateResponse, ImportInputError> {
        let staged = self.staged_file(job.id).ok_or_else(|| {
            ImportInputError::Internal(anyhow::anyhow!("staged file for job {} is missing", job.id))
        })?;
        let file = TabularFile::parse(&staged.content, staged.delimiter)?;
        let schema = schema_for(job.import_type);

        let settings = job.settings.apply(&request.settings)?;
        let mapping = resolve_mapping(file.headers(), schema, &request.mapping)?;

        let mut issues: Vec<ImportIssue> = Vec::new();
        let mut total_rows = 0u32;
        let mut invalid_rows = 0u32;
        for row in file.rows() {
            total_rows += 1;
            let outcome = validator::validate_row(&row, &mapping, schema, &settings);
            if !outcome.is_valid() {
                invalid_rows += 1;
                issues.extend(outcome.issues);
            }
        }

        let updated = self.store.update(
            job.id,
            JobPatch {
                status: Some(ImportJobStatus::Validating),
                settings: Some(settings),
                column_mapping: Some(mapping.clone()),
                total_rows: Some(total_rows),
                append_errors: issues.clone(),
                ..Default::default()
            },
        )?;

        info!(
            "Validated job {}: {} rows, {} invalid",
            job.id, total_rows, invalid_rows
        );
        Ok(ValidateResponse {
            job_id: job.id,
            status: updated.status,
            headers: file.headers().to_vec(),
            rows: preview_rows(&file, self.limits.preview_rows),
            column_mapping: mapping,
            validation_results: issues,
            stats: ValidationStats {
                total_rows,
                valid_rows: total_rows - invalid_rows,
                invalid_rows,
            },
        })
    }

    fn validation_snapshot(&self, job: ImportJob) -> Result<ValidateResponse, ImportInputError> {
        let staged = self.staged_file(job.id).ok_or_else(|| {
            ImportInputError::Internal(anyhow::anyhow!("staged file for job {} is missing", job.id))
        })?;
        let file = TabularFile::parse(&staged.content, staged.delimiter)?;

        let invalid_rows = job
            .errors
            .iter()
            .map(|issue| issue.row)
            .collect::<HashSet<_>>()
            .len() as u32;

        Ok(ValidateResponse {
            job_id: job.id,
            status: job.status,
            headers: file.headers().to_vec(),
            rows: preview_rows(&file, self.limits.preview_rows),
            column_mapping: job.column_mapping.clone(),
            validation_results: job.errors.clone(),
            stats: ValidationStats {
                total_rows: job.total_rows,
                valid_rows: job.total_rows - invalid_rows,
                invalid_rows,
            },
        })
    }

    /// Accept a validated job for background execution. Only enqueues; the
    /// dispatcher picks the job up from the queue.
    pub fn start(&self, request: StartRequest) -> Result<StartResponse, ImportInputError> {
        let job = self
            .store
            .get(request.job_id)
            .ok_or(ImportInputError::JobNotFound(request.job_id))?;
        if job.status != ImportJobStatus::Validating {
            return Err(ImportInputError::InvalidState { status: job.status });
        }

        let settings = job.settings.apply(&request.settings)?;
        if settings.validation_mode == ValidationMode::Strict && !job.errors.is_empty() {
            return Err(ImportInputError::BlockingErrors {
                count: job.errors.len(),
            });
        }

        let permit = self
            .dispatch_tx
            .try_reserve()
            .map_err(|_| ImportInputError::QueueFull)?;
        let guard = self.registry.register(request.job_id);

        // Persist the accepted state first; an enqueue is irrevocable.
        self.store.update(
            request.job_id,
            JobPatch {
                status: Some(ImportJobStatus::Processing),
                settings: Some(settings),
                current_operation: Some(Some("queued".to_string())),
                ..Default::default()
            },
        )?;
        permit.send(JobDispatch {
            job_id: request.job_id,
            guard,
        });

        info!("Import job {} accepted for processing", request.job_id);
        Ok(StartResponse {
            job_id: request.job_id,
            status: ImportJobStatus::Processing,
        })
    }

    /// Progress payload with the first errors, for polling.
    pub fn status(&self, job_id: Uuid) -> Result<ImportStatusResponse, ImportInputError> {
        let job = self
            .store
            .get(job_id)
            .ok_or(ImportInputError::JobNotFound(job_id))?;
        Ok(report::progress_payload(&job, self.limits.status_error_limit))
    }

    /// Request cancellation. Jobs not yet processing stop immediately; a
    /// processing job stops at its next batch boundary; finished jobs
    /// acknowledge without changing.
    pub fn cancel(&self, job_id: Uuid) -> Result<CancelResponse, ImportInputError> {
        let job = self
            .store
            .get(job_id)
            .ok_or(ImportInputError::JobNotFound(job_id))?;

        match job.status {
            ImportJobStatus::Pending | ImportJobStatus::Validating => {
                let updated = self
                    .store
                    .update(job_id, JobPatch::status(ImportJobStatus::Cancelled))?;
                self.uploads.lock().remove(&job_id);
                info!("Import job {} cancelled before processing", job_id);
                Ok(CancelResponse {
                    job_id,
                    status: updated.status,
                    message: "import cancelled".to_string(),
                })
            }
            ImportJobStatus::Processing => {
                let recorded = self.registry.cancel(&job_id);
                let message = if recorded {
                    "cancellation recorded, the import stops at the next batch boundary"
                } else {
                    "the import is already finishing"
                };
                Ok(CancelResponse {
                    job_id,
                    status: job.status,
                    message: message.to_string(),
                })
            }
            status => Ok(CancelResponse {
                job_id,
                status,
                message: "job already finished".to_string(),
            }),
        }
    }

    /// Error report for a finished job. Output depends only on stored state,
    /// so repeated calls return identical bytes.
    pub fn report(&self, job_id: Uuid) -> Result<ReportResponse, ImportInputError> {
        let job = self
            .store
            .get(job_id)
            .ok_or(ImportInputError::JobNotFound(job_id))?;
        if !job.status.is_terminal() {
            return Err(ImportInputError::ReportNotReady);
        }
        let rendered = report::render_report(&job)?;
        Ok(ReportResponse {
            job_id,
            file_name: job.file_name,
            report: rendered,
        })
    }

    /// Paginated job history, optionally filtered by type and status.
    pub fn history(&self, request: HistoryRequest) -> JobPage {
        let filter = HistoryFilter {
            import_type: request.import_type,
            status: request.status,
        };
        let page = request.page.unwrap_or(1);
        let per_page = request.per_page.unwrap_or(20).min(100);
        self.store.list(filter, page, per_page)
    }

    /// Target schema description for mapping UIs.
    pub fn schema(&self, request: SchemaRequest) -> Result<SchemaResponse, ImportInputError> {
        let import_type: ImportType = request.import_type.parse()?;
        let schema = schema_for(import_type);
        Ok(SchemaResponse {
            import_type,
            key: schema.key,
            fields: schema.describe(),
        })
    }

    pub(crate) fn staged_file(&self, job_id: Uuid) -> Option<StagedFile> {
        self.uploads.lock().get(&job_id).cloned()
    }

    /// Cleanup once a job has reached a terminal state: release the staged
    /// file and publish the completion notice when the job asked for one.
    pub(crate) async fn after_terminal(&self, job_id: Uuid) {
        let Some(job) = self.store.get(job_id) else {
            return;
        };
        if !job.status.is_terminal() {
            return;
        }
        self.uploads.lock().remove(&job_id);

        if !job.settings.notify_on_completion {
            return;
        }
        let Some(notifier) = &self.notifier else {
            return;
        };
        let notice = CompletionNotice {
            job_id: job.id,
            import_type: job.import_type,
            file_name: job.file_name.clone(),
            status: job.status,
            total_rows: job.total_rows,
            processed_rows: job.processed_rows,
            failed_rows: job.failed_rows,
            error_count: job.errors.len() as u32,
            completed_at: job.completed_at,
        };
        match serde_json::to_vec(&notice) {
            Ok(bytes) => {
                if let Err(e) = notifier
                    .client
                    .publish(notifier.subject.clone(), bytes.into())
                    .await
                {
                    warn!("Failed to publish completion notice for job {}: {}", job_id, e);
                }
            }
            Err(e) => warn!("Failed to serialize completion notice: {}", e),
        }
    }

    fn base_settings(&self) -> ImportSettings {
        ImportSettings {
            batch_size: self.limits.default_batch_size,
            ..Default::default()
        }
    }
}

fn has_supported_extension(file_name: &str) -> bool {
    let lower = file_name.to_ascii_lowercase();
    lower.ends_with(".csv") || lower.ends_with(".txt")
}

fn parse_delimiter(raw: Option<&str>) -> Result<Option<u8>, ImportInputError> {
    match raw {
        None => Ok(None),
        Some(",") => Ok(Some(b',')),
        Some(";") => Ok(Some(b';')),
        Some(other) => Err(ImportInputError::UnsupportedDelimiter(other.to_string())),
    }
}

fn preview_rows(file: &TabularFile, limit: usize) -> Vec<serde_json::Value> {
    file.rows()
        .take(limit)
        .map(|row| {
            let map: serde_json::Map<String, serde_json::Value> = row
                .fields()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        serde_json::Value::String(value.to_string()),
                    )
                })
                .collect();
            serde_json::Value::Object(map)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::import::sink::{MemorySink, RecordSink, SinkError, SinkOpKind};
    use crate::types::{DuplicateHandling, MappedRecord, ValidationMode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        service: Arc<ImportService>,
        employees: Arc<MemorySink>,
        // Held when no dispatcher is spawned so the dispatch queue stays open
        // (a dropped receiver reads as a closed channel, not a full one).
        _dispatch_rx: Option<mpsc::Receiver<JobDispatch>>,
    }

    fn build_harness(
        employees: Arc<dyn RecordSink>,
        plain: Arc<MemorySink>,
        limits: ImportLimits,
        spawn_dispatcher: bool,
        queue_depth: usize,
    ) -> Harness {
        let store = Arc::new(JobStore::ephemeral(100));
        let sinks = Arc::new(SinkSet::with_sinks(
            employees,
            Arc::new(MemorySink::new("memory:equipment", "serial_number")),
            Arc::new(MemorySink::new("memory:companies", "registration_number")),
        ));
        let (service, dispatch_rx) = ImportService::new(
            store,
            sinks,
            limits,
            None,
            CancellationToken::new(),
            queue_depth,
        );
        let dispatch_rx = if spawn_dispatcher {
            tokio::spawn(run_dispatcher(Arc::clone(&service), dispatch_rx));
            None
        } else {
            Some(dispatch_rx)
        };
        Harness {
            service,
            employees: plain,
            _dispatch_rx: dispatch_rx,
        }
    }

    fn harness() -> Harness {
        let employees = Arc::new(MemorySink::new("memory:employees", "personnel_number"));
        build_harness(
            Arc::clone(&employees) as Arc<dyn RecordSink>,
            employees,
            ImportLimits::default(),
            true,
            16,
        )
    }

    fn upload_req(csv: &str) -> UploadRequest {
        UploadRequest {
            import_type: "employees".to_string(),
            file_name: "staff.csv".to_string(),
            file_content: csv.to_string(),
            delimiter: None,
            settings: ImportSettingsUpdate::default(),
        }
    }

    fn settings(update: impl FnOnce(&mut ImportSettingsUpdate)) -> ImportSettingsUpdate {
        let mut s = ImportSettingsUpdate::default();
        update(&mut s);
        s
    }

    async fn wait_terminal(service: &ImportService, job_id: Uuid) -> ImportJob {
        for _ in 0..400 {
            if let Some(job) = service.store.get(job_id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} did not reach a terminal state", job_id);
    }

    /// Upload + validate + start, returning the job id.
    fn accept(service: &ImportService, csv: &str, start_settings: ImportSettingsUpdate) -> Uuid {
        let uploaded = service.upload(upload_req(csv)).unwrap();
        service
            .validate(ValidateRequest {
                job_id: Some(uploaded.job_id),
                ..Default::default()
            })
            .unwrap();
        service
            .start(StartRequest {
                job_id: uploaded.job_id,
                settings: start_settings,
            })
            .unwrap();
        uploaded.job_id
    }

    fn clean_rows(n: usize) -> String {
        let mut csv = String::from("personnel_number;name\n");
        for i in 1..=n {
            csv.push_str(&format!("E-{};Employee {}\n", i, i));
        }
        csv
    }

    // ==========================================================================
    // Upload and validate
    // ==========================================================================

    #[tokio::test]
    async fn test_upload_rejects_unknown_type() {
        let h = harness();
        let mut req = upload_req("personnel_number;name\nE-1;Ada\n");
        req.import_type = "invoices".to_string();

        let err = h.service.upload(req).unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_IMPORT_TYPE");
    }

    #[tokio::test]
    async fn test_upload_rejects_oversized_file() {
        let employees = Arc::new(MemorySink::new("memory:employees", "personnel_number"));
        let h = build_harness(
            Arc::clone(&employees) as Arc<dyn RecordSink>,
            employees,
            ImportLimits {
                max_upload_bytes: 32,
                ..Default::default()
            },
            true,
            16,
        );

        let err = h.service.upload(upload_req(&clean_rows(10))).unwrap_err();
        assert_eq!(err.code(), "FILE_TOO_LARGE");
    }

    #[tokio::test]
    async fn test_upload_rejects_unsupported_extension() {
        let h = harness();
        let mut req = upload_req("personnel_number;name\nE-1;Ada\n");
        req.file_name = "staff.xlsx".to_string();

        let err = h.service.upload(req).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FILE");
    }

    #[tokio::test]
    async fn test_upload_stages_file_and_returns_headers() {
        let h = harness();
        let response = h
            .service
            .upload(upload_req("personnel_number;name\nE-1;Ada\n"))
            .unwrap();

        assert_eq!(response.status, ImportJobStatus::Pending);
        assert_eq!(response.headers, vec!["personnel_number", "name"]);
        assert!(h.service.staged_file(response.job_id).is_some());
    }

    #[tokio::test]
    async fn test_validate_reports_row_with_missing_required_field() {
        // three rows, the second one has an empty required name
        let h = harness();
        let csv = "personnel_number;name\nE-1;A\nE-2;\nE-3;C\n";
        let uploaded = h.service.upload(upload_req(csv)).unwrap();

        let response = h
            .service
            .validate(ValidateRequest {
                job_id: Some(uploaded.job_id),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(response.status, ImportJobStatus::Validating);
        assert_eq!(response.stats.total_rows, 3);
        assert_eq!(response.stats.invalid_rows, 1);
        assert_eq!(response.stats.valid_rows, 2);
        assert_eq!(response.validation_results.len(), 1);
        assert_eq!(response.validation_results[0].row, 2);
    }

    #[tokio::test]
    async fn test_validate_inline_file_stages_then_validates() {
        let h = harness();
        let response = h
            .service
            .validate(ValidateRequest {
                import_type: Some("employees".to_string()),
                file_content: Some("personnel_number;name\nE-1;Ada\n".to_string()),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(response.stats.total_rows, 1);
        let job = h.service.store.get(response.job_id).unwrap();
        assert_eq!(job.status, ImportJobStatus::Validating);
    }

    #[tokio::test]
    async fn test_validate_twice_does_not_duplicate_errors() {
        let h = harness();
        let csv = "personnel_number;name\nE-1;\n";
        let uploaded = h.service.upload(upload_req(csv)).unwrap();
        let req = ValidateRequest {
            job_id: Some(uploaded.job_id),
            ..Default::default()
        };

        let first = h.service.validate(req.clone()).unwrap();
        let second = h.service.validate(req).unwrap();

        assert_eq!(first.validation_results.len(), 1);
        assert_eq!(second.validation_results.len(), 1);
        let job = h.service.store.get(uploaded.job_id).unwrap();
        assert_eq!(job.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_validate_preview_is_limited() {
        let employees = Arc::new(MemorySink::new("memory:employees", "personnel_number"));
        let h = build_harness(
            Arc::clone(&employees) as Arc<dyn RecordSink>,
            employees,
            ImportLimits {
                preview_rows: 2,
                ..Default::default()
            },
            true,
            16,
        );

        let uploaded = h.service.upload(upload_req(&clean_rows(5))).unwrap();
        let response = h
            .service
            .validate(ValidateRequest {
                job_id: Some(uploaded.job_id),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(response.rows.len(), 2);
        assert_eq!(response.stats.total_rows, 5);
        assert_eq!(response.rows[0]["personnel_number"], "E-1");
    }

    // ==========================================================================
    // Full runs
    // ==========================================================================

    #[tokio::test]
    async fn test_clean_import_completes_with_all_rows() {
        let h = harness();
        let job_id = accept(&h.service, &clean_rows(7), ImportSettingsUpdate::default());

        let job = wait_terminal(&h.service, job_id).await;
        assert_eq!(job.status, ImportJobStatus::Completed);
        assert_eq!(job.total_rows, 7);
        assert_eq!(job.processed_rows, 7);
        assert_eq!(job.failed_rows, 0);
        assert!(job.errors.is_empty());
        assert!(job.completed_at.is_some());
        assert_eq!(h.employees.row_count(), 7);

        // staged content is released once the job is done; the cleanup runs
        // just after the terminal status is stored
        for _ in 0..100 {
            if h.service.staged_file(job_id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(h.service.staged_file(job_id).is_none());
    }

    #[tokio::test]
    async fn test_duplicate_skip_counts_row_without_second_write() {
        let h = harness();
        let csv = "personnel_number;name\nE-1;Ada\nE-1;Grace\n";
        let job_id = accept(
            &h.service,
            csv,
            settings(|s| s.duplicate_handling = Some(DuplicateHandling::Skip)),
        );

        let job = wait_terminal(&h.service, job_id).await;
        assert_eq!(job.status, ImportJobStatus::Completed);
        assert_eq!(job.processed_rows, 2);
        assert_eq!(job.failed_rows, 0);

        let ops: Vec<SinkOpKind> = h.employees.operations().iter().map(|o| o.kind).collect();
        assert_eq!(ops, vec![SinkOpKind::Insert]);
        assert_eq!(h.employees.row_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_update_issues_one_update_call() {
        let h = harness();
        let csv = "personnel_number;name\nE-1;Ada\nE-1;Grace\n";
        let job_id = accept(
            &h.service,
            csv,
            settings(|s| s.duplicate_handling = Some(DuplicateHandling::Update)),
        );

        let job = wait_terminal(&h.service, job_id).await;
        assert_eq!(job.status, ImportJobStatus::Completed);
        assert_eq!(job.processed_rows, 2);

        let ops: Vec<SinkOpKind> = h.employees.operations().iter().map(|o| o.kind).collect();
        assert_eq!(ops, vec![SinkOpKind::Insert, SinkOpKind::Update]);
        assert_eq!(h.employees.row_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_create_new_inserts_both_rows() {
        let h = harness();
        let csv = "personnel_number;name\nE-1;Ada\nE-1;Grace\n";
        let job_id = accept(
            &h.service,
            csv,
            settings(|s| s.duplicate_handling = Some(DuplicateHandling::CreateNew)),
        );

        let job = wait_terminal(&h.service, job_id).await;
        assert_eq!(job.processed_rows, 2);

        let ops: Vec<SinkOpKind> = h.employees.operations().iter().map(|o| o.kind).collect();
        assert_eq!(ops, vec![SinkOpKind::Insert, SinkOpKind::ForceInsert]);
        assert_eq!(h.employees.row_count(), 2);
    }

    #[tokio::test]
    async fn test_lenient_mode_records_failures_and_continues() {
        let employees = Arc::new(MemorySink::new("memory:employees", "personnel_number"));
        employees.fail_on_key("E-3");
        let h = build_harness(
            Arc::clone(&employees) as Arc<dyn RecordSink>,
            employees,
            ImportLimits::default(),
            true,
            16,
        );

        let job_id = accept(
            &h.service,
            &clean_rows(5),
            settings(|s| s.validation_mode = Some(ValidationMode::Lenient)),
        );

        let job = wait_terminal(&h.service, job_id).await;
        assert_eq!(job.status, ImportJobStatus::CompletedWithErrors);
        assert_eq!(job.processed_rows, 4);
        assert_eq!(job.failed_rows, 1);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].row, 3);
        assert_eq!(h.employees.row_count(), 4);
    }

    #[tokio::test]
    async fn test_strict_mode_aborts_on_first_backend_error() {
        let employees = Arc::new(MemorySink::new("memory:employees", "personnel_number"));
        employees.fail_on_key("E-3");
        let h = build_harness(
            Arc::clone(&employees) as Arc<dyn RecordSink>,
            employees,
            ImportLimits::default(),
            true,
            16,
        );

        let job_id = accept(
            &h.service,
            &clean_rows(5),
            settings(|s| {
                s.validation_mode = Some(ValidationMode::Strict);
                s.batch_size = Some(2);
            }),
        );

        let job = wait_terminal(&h.service, job_id).await;
        assert_eq!(job.status, ImportJobStatus::Failed);
        // rows 1 and 2 committed in batch 1, row 3 aborted batch 2
        assert_eq!(job.processed_rows, 2);
        assert_eq!(job.failed_rows, 1);
        assert_eq!(job.errors.len(), 1);
        assert_eq!(job.errors[0].row, 3);
        assert_eq!(h.employees.row_count(), 2);
    }

    #[tokio::test]
    async fn test_all_rows_invalid_fails_the_job() {
        let h = harness();
        // every row is missing the required name
        let csv = "personnel_number;name\nE-1;\nE-2;\n";
        let job_id = accept(&h.service, csv, ImportSettingsUpdate::default());

        let job = wait_terminal(&h.service, job_id).await;
        assert_eq!(job.status, ImportJobStatus::Failed);
        assert_eq!(job.processed_rows, 0);
        assert_eq!(job.failed_rows, 2);
        assert!(job
            .errors
            .iter()
            .any(|e| e.message.contains("no rows could be imported")));
    }

    // ==========================================================================
    // Cancellation
    // ==========================================================================

    /// Sink wrapper that requests cancellation after a fixed number of
    /// successful inserts, simulating an operator cancel mid-run.
    struct CancelAfterSink {
        inner: MemorySink,
        remaining: AtomicUsize,
        armed: Mutex<Option<(CancellationRegistry, Uuid)>>,
    }

    impl CancelAfterSink {
        fn arm(&self, registry: CancellationRegistry, job_id: Uuid) {
            *self.armed.lock() = Some((registry, job_id));
        }
    }

    #[async_trait::async_trait]
    impl RecordSink for CancelAfterSink {
        async fn insert(&self, record: &MappedRecord) -> Result<(), SinkError> {
            self.inner.insert(record).await?;
            if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                if let Some((registry, job_id)) = &*self.armed.lock() {
                    registry.cancel(job_id);
                }
            }
            Ok(())
        }

        async fn update_by_key(&self, record: &MappedRecord) -> Result<(), SinkError> {
            self.inner.update_by_key(record).await
        }

        async fn force_insert(&self, record: &MappedRecord) -> Result<(), SinkError> {
            self.inner.force_insert(record).await
        }

        fn name(&self) -> &str {
            "cancel-after"
        }
    }

    #[tokio::test]
    async fn test_cancel_during_processing_stops_at_batch_boundary() {
        // the wrapper requests cancellation after the fifth insert, i.e. in
        // the middle of batch 1
        let cancel_sink = Arc::new(CancelAfterSink {
            inner: MemorySink::new("memory:employees", "personnel_number"),
            remaining: AtomicUsize::new(5),
            armed: Mutex::new(None),
        });
        let sinks = Arc::new(SinkSet::with_sinks(
            Arc::clone(&cancel_sink) as Arc<dyn RecordSink>,
            Arc::new(MemorySink::new("memory:equipment", "serial_number")),
            Arc::new(MemorySink::new("memory:companies", "registration_number")),
        ));
        let (service, dispatch_rx) = ImportService::new(
            Arc::new(JobStore::ephemeral(100)),
            sinks,
            ImportLimits::default(),
            None,
            CancellationToken::new(),
            16,
        );
        tokio::spawn(run_dispatcher(Arc::clone(&service), dispatch_rx));

        let uploaded = service.upload(upload_req(&clean_rows(25))).unwrap();
        cancel_sink.arm(service.registry.clone(), uploaded.job_id);
        service
            .validate(ValidateRequest {
                job_id: Some(uploaded.job_id),
                ..Default::default()
            })
            .unwrap();
        service
            .start(StartRequest {
                job_id: uploaded.job_id,
                settings: settings(|s| s.batch_size = Some(10)),
            })
            .unwrap();

        let job = wait_terminal(&service, uploaded.job_id).await;
        assert_eq!(job.status, ImportJobStatus::Cancelled);
        // batch 1 was in flight when the cancel arrived: it commits fully,
        // nothing after it runs
        assert_eq!(job.processed_rows, 10);
        assert_eq!(cancel_sink.inner.row_count(), 10);
    }

    #[tokio::test]
    async fn test_cancel_pending_job_is_immediate() {
        let h = harness();
        let uploaded = h
            .service
            .upload(upload_req("personnel_number;name\nE-1;Ada\n"))
            .unwrap();

        let response = h.service.cancel(uploaded.job_id).unwrap();
        assert_eq!(response.status, ImportJobStatus::Cancelled);
        assert!(h.service.staged_file(uploaded.job_id).is_none());

        let job = h.service.store.get(uploaded.job_id).unwrap();
        assert_eq!(job.status, ImportJobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_finished_job_acknowledges_without_change() {
        let h = harness();
        let job_id = accept(&h.service, &clean_rows(2), ImportSettingsUpdate::default());
        wait_terminal(&h.service, job_id).await;

        let response = h.service.cancel(job_id).unwrap();
        assert_eq!(response.status, ImportJobStatus::Completed);
        assert!(response.message.contains("already finished"));
    }

    // ==========================================================================
    // Start preconditions
    // ==========================================================================

    #[tokio::test]
    async fn test_start_requires_validation_first() {
        let h = harness();
        let uploaded = h
            .service
            .upload(upload_req("personnel_number;name\nE-1;Ada\n"))
            .unwrap();

        let err = h
            .service
            .start(StartRequest {
                job_id: uploaded.job_id,
                settings: ImportSettingsUpdate::default(),
            })
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_JOB_STATE");
    }

    #[tokio::test]
    async fn test_start_strict_blocks_on_validation_errors() {
        let h = harness();
        let csv = "personnel_number;name\nE-1;Ada\nE-2;\n";
        let uploaded = h.service.upload(upload_req(csv)).unwrap();
        h.service
            .validate(ValidateRequest {
                job_id: Some(uploaded.job_id),
                ..Default::default()
            })
            .unwrap();

        let err = h
            .service
            .start(StartRequest {
                job_id: uploaded.job_id,
                settings: settings(|s| s.validation_mode = Some(ValidationMode::Strict)),
            })
            .unwrap_err();
        assert!(matches!(
            err,
            ImportInputError::BlockingErrors { count: 1 }
        ));

        // the job stays startable under lenient mode
        let job = h.service.store.get(uploaded.job_id).unwrap();
        assert_eq!(job.status, ImportJobStatus::Validating);
    }

    #[tokio::test]
    async fn test_start_reports_full_queue() {
        let employees = Arc::new(MemorySink::new("memory:employees", "personnel_number"));
        // queue depth 1 and no dispatcher draining it
        let h = build_harness(
            Arc::clone(&employees) as Arc<dyn RecordSink>,
            employees,
            ImportLimits::default(),
            false,
            1,
        );

        let first = h.service.upload(upload_req(&clean_rows(1))).unwrap();
        h.service
            .validate(ValidateRequest {
                job_id: Some(first.job_id),
                ..Default::default()
            })
            .unwrap();
        h.service
            .start(StartRequest {
                job_id: first.job_id,
                settings: ImportSettingsUpdate::default(),
            })
            .unwrap();

        let second = h.service.upload(upload_req(&clean_rows(1))).unwrap();
        h.service
            .validate(ValidateRequest {
                job_id: Some(second.job_id),
                ..Default::default()
            })
            .unwrap();
        let err = h
            .service
            .start(StartRequest {
                job_id: second.job_id,
                settings: ImportSettingsUpdate::default(),
            })
            .unwrap_err();
        assert_eq!(err.code(), "QUEUE_FULL");

        // the rejected job is untouched and can be retried
        let job = h.service.store.get(second.job_id).unwrap();
        assert_eq!(job.status, ImportJobStatus::Validating);
    }

    // ==========================================================================
    // Status, report and history
    // ==========================================================================

    #[tokio::test]
    async fn test_status_truncates_errors_to_limit() {
        let employees = Arc::new(MemorySink::new("memory:employees", "personnel_number"));
        let h = build_harness(
            Arc::clone(&employees) as Arc<dyn RecordSink>,
            employees,
            ImportLimits {
                status_error_limit: 2,
                ..Default::default()
            },
            true,
            16,
        );

        // five invalid rows
        let csv = "personnel_number;name\nE-1;\nE-2;\nE-3;\nE-4;\nE-5;\n";
        let uploaded = h.service.upload(upload_req(csv)).unwrap();
        h.service
            .validate(ValidateRequest {
                job_id: Some(uploaded.job_id),
                ..Default::default()
            })
            .unwrap();

        let status = h.service.status(uploaded.job_id).unwrap();
        assert_eq!(status.errors.len(), 2);
        assert_eq!(status.error_count, 5);
    }

    #[tokio::test]
    async fn test_report_requires_terminal_state() {
        let h = harness();
        let uploaded = h
            .service
            .upload(upload_req("personnel_number;name\nE-1;Ada\n"))
            .unwrap();

        let err = h.service.report(uploaded.job_id).unwrap_err();
        assert_eq!(err.code(), "REPORT_NOT_READY");
    }

    #[tokio::test]
    async fn test_report_is_idempotent_after_completion() {
        let h = harness();
        let csv = "personnel_number;name\nE-1;Ada\nE-2;\n";
        let job_id = accept(&h.service, csv, ImportSettingsUpdate::default());
        wait_terminal(&h.service, job_id).await;

        let first = h.service.report(job_id).unwrap();
        let second = h.service.report(job_id).unwrap();
        assert_eq!(first.report, second.report);
        assert!(first.report.contains("staff.csv"));
        assert!(first.report.contains("required field is empty"));
    }

    #[tokio::test]
    async fn test_history_filters_and_paginates() {
        let h = harness();
        let completed = accept(&h.service, &clean_rows(1), ImportSettingsUpdate::default());
        wait_terminal(&h.service, completed).await;
        let pending = h
            .service
            .upload(upload_req("personnel_number;name\nE-1;Ada\n"))
            .unwrap()
            .job_id;

        let all = h.service.history(HistoryRequest::default());
        assert_eq!(all.total, 2);
        assert_eq!(all.items[0].id, pending);

        let finished = h.service.history(HistoryRequest {
            status: Some(ImportJobStatus::Completed),
            ..Default::default()
        });
        assert_eq!(finished.total, 1);
        assert_eq!(finished.items[0].id, completed);
    }

    #[tokio::test]
    async fn test_schema_describes_target_fields() {
        let h = harness();
        let response = h
            .service
            .schema(SchemaRequest {
                import_type: "equipment".to_string(),
            })
            .unwrap();

        assert_eq!(response.import_type, ImportType::Equipment);
        assert_eq!(response.key, "serial_number");
        assert!(response.fields.iter().any(|f| f.name == "category"));

        let err = h
            .service
            .schema(SchemaRequest {
                import_type: "gadgets".to_string(),
            })
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_IMPORT_TYPE");
    }
}

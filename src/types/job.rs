//! Import job model and lifecycle types
//!
//! A job moves pending -> validating -> processing and ends in exactly one of
//! completed, completed_with_errors, failed or cancelled. Terminal states
//! absorb every later transition attempt; the job store is the single writer
//! and rejects anything that would move a job backwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::import::{ColumnBinding, ImportIssue, ImportSettings, ImportType};

// ==========================================================================
// Tests First (TDD)
// ==========================================================================


// ==========================================================================
// Implementation
// ==========================================================================

/// Lifecycle state of an import job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportJobStatus {
    /// File staged, nothing checked yet
    Pending,
    /// Mapping resolved and rows validated, waiting for start
    Validating,
    /// Executor is writing batches
    Processing,
    /// All rows imported
    Completed,
    /// Finished, but some rows were skipped
    CompletedWithErrors,
    /// Aborted, nothing more will happen
    Failed,
    /// Stopped on user request
    Cancelled,
}

impl ImportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportJobStatus::Pending => "pending",
            ImportJobStatus::Validating => "validating",
            ImportJobStatus::Processing => "processing",
            ImportJobStatus::Completed => "completed",
            ImportJobStatus::CompletedWithErrors => "completed_with_errors",
            ImportJobStatus::Failed => "failed",
            ImportJobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportJobStatus::Completed
                | ImportJobStatus::CompletedWithErrors
                | ImportJobStatus::Failed
                | ImportJobStatus::Cancelled
        )
    }

    /// Position in the lifecycle. A transition must never decrease the rank;
    /// all terminal states share the top rank.
    pub fn rank(&self) -> u8 {
        match self {
            ImportJobStatus::Pending => 0,
            ImportJobStatus::Validating => 1,
            ImportJobStatus::Processing => 2,
            ImportJobStatus::Completed
            | ImportJobStatus::CompletedWithErrors
            | ImportJobStatus::Failed
            | ImportJobStatus::Cancelled => 3,
        }
    }
}

impl std::fmt::Display for ImportJobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full job record as persisted and reported
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub id: Uuid,
    pub import_type: ImportType,
    /// Original file name as uploaded (display only, never a path)
    pub file_name: String,
    pub status: ImportJobStatus,
    pub settings: ImportSettings,
    /// Resolved source-header-to-field bindings, empty until validation
    #[serde(default)]
    pub column_mapping: Vec<ColumnBinding>,
    pub total_rows: u32,
    pub processed_rows: u32,
    pub failed_rows: u32,
    /// Append-only list of row-level problems
    #[serde(default)]
    pub errors: Vec<ImportIssue>,
    /// Human-readable label of what the executor is doing right now
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    pub fn new(
        import_type: ImportType,
        file_name: impl Into<String>,
        settings: ImportSettings,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            import_type,
            file_name: file_name.into(),
            status: ImportJobStatus::Pending,
            settings,
            column_mapping: Vec::new(),
            total_rows: 0,
            processed_rows: 0,
            failed_rows: 0,
            errors: Vec::new(),
            current_operation: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            import_type: self.import_type,
            file_name: self.file_name.clone(),
            status: self.status,
            total_rows: self.total_rows,
            processed_rows: self.processed_rows,
            failed_rows: self.failed_rows,
            error_count: self.errors.len() as u32,
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Condensed job record for history listings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: Uuid,
    pub import_type: ImportType,
    pub file_name: String,
    pub status: ImportJobStatus,
    pub total_rows: u32,
    pub processed_rows: u32,
    pub failed_rows: u32,
    pub error_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One atomic mutation applied by the job store. Fields left at `None`
/// (or empty, for `append_errors`) are untouched.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<ImportJobStatus>,
    pub settings: Option<ImportSettings>,
    pub column_mapping: Option<Vec<ColumnBinding>>,
    pub total_rows: Option<u32>,
    /// `(processed_rows, failed_rows)`, taken together so the counter
    /// invariant is checked against a consistent pair
    pub counters: Option<(u32, u32)>,
    pub append_errors: Vec<ImportIssue>,
    /// `Some(None)` clears the operation label, `Some(Some(_))` replaces it
    pub current_operation: Option<Option<String>>,
}

impl JobPatch {
    pub fn status(status: ImportJobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_counters(mut self, processed: u32, failed: u32) -> Self {
        self.counters = Some((processed, failed));
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.current_operation = Some(Some(operation.into()));
        self
    }

    pub fn clear_operation(mut self) -> Self {
        self.current_operation = Some(None);
        self
    }

    pub fn with_errors(mut self, errors: Vec<ImportIssue>) -> Self {
        self.append_errors = errors;
        self
    }
}

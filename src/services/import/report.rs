//! Progress payloads and the downloadable error report
//!
//! Everything here renders from the stored job alone, with no clock reads or
//! other ambient input, so repeated calls on a terminal job produce identical
//! output.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{ImportIssue, ImportJob, ImportJobStatus, ImportType};

/// Status payload returned to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStatusResponse {
    pub job_id: Uuid,
    pub import_type: ImportType,
    pub file_name: String,
    pub status: ImportJobStatus,
    pub total_rows: u32,
    pub processed_rows: u32,
    pub failed_rows: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_operation: Option<String>,
    /// First `errorLimit` errors only; `errorCount` carries the full count.
    pub errors: Vec<ImportIssue>,
    pub error_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Build the polling payload, truncating the error list to `error_limit`.
pub fn progress_payload(job: &ImportJob, error_limit: usize) -> ImportStatusResponse {
    ImportStatusResponse {
        job_id: job.id,
        import_type: job.import_type,
        file_name: job.file_name.clone(),
        status: job.status,
        total_rows: job.total_rows,
        processed_rows: job.processed_rows,
        failed_rows: job.failed_rows,
        current_operation: job.current_operation.clone(),
        errors: job.errors.iter().take(error_limit).cloned().collect(),
        error_count: job.errors.len() as u32,
        created_at: job.created_at,
        updated_at: job.updated_at,
        completed_at: job.completed_at,
    }
}

/// Render the downloadable report: a summary block followed by one record per
/// accumulated error, semicolon-delimited.
pub fn render_report(job: &ImportJob) -> Result<String> {
    let mut buffer = Vec::new();
    {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .flexible(true)
            .from_writer(&mut buffer);

        writer.write_record(["file", "status", "totalRows", "processedRows", "failedRows"])?;
        let total = job.total_rows.to_string();
        let processed = job.processed_rows.to_string();
        let failed = job.failed_rows.to_string();
        writer.write_record([
            job.file_name.as_str(),
            job.status.as_str(),
            total.as_str(),
            processed.as_str(),
            failed.as_str(),
        ])?;

        writer.write_record(["row", "column", "message", "value"])?;
        for error in &job.errors {
            writer.write_record([
                error.row.to_string().as_str(),
                error.column.as_str(),
                error.message.as_str(),
                error.value.as_deref().unwrap_or(""),
            ])?;
        }
        writer.flush()?;
    }
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImportSettings;

    fn finished_job() -> ImportJob {
        let mut job = ImportJob::new(
            ImportType::Employees,
            "staff.csv",
            ImportSettings::default(),
        );
        job.status = ImportJobStatus::CompletedWithErrors;
        job.total_rows = 3;
        job.processed_rows = 2;
        job.failed_rows = 1;
        job.errors
            .push(ImportIssue::new(2, "name", "required field is empty"));
        job.errors
            .push(ImportIssue::new(3, "monthly_salary", "invalid number").with_value("abc"));
        job
    }

    #[test]
    fn test_progress_payload_truncates_errors_but_keeps_count() {
        let job = finished_job();
        let payload = progress_payload(&job, 1);

        assert_eq!(payload.errors.len(), 1);
        assert_eq!(payload.error_count, 2);
        assert_eq!(payload.errors[0].row, 2);
        assert_eq!(payload.processed_rows, 2);
    }

    #[test]
    fn test_progress_payload_serializes_camel_case() {
        let payload = progress_payload(&finished_job(), 10);
        let json = serde_json::to_string(&payload).unwrap();

        assert!(json.contains("\"jobId\""));
        assert!(json.contains("\"errorCount\":2"));
        assert!(json.contains("\"totalRows\":3"));
        assert!(!json.contains("\"currentOperation\""));
    }

    #[test]
    fn test_report_layout() {
        let report = render_report(&finished_job()).unwrap();
        let lines: Vec<&str> = report.lines().collect();

        assert_eq!(lines[0], "file;status;totalRows;processedRows;failedRows");
        assert_eq!(lines[1], "staff.csv;completed_with_errors;3;2;1");
        assert_eq!(lines[2], "row;column;message;value");
        assert_eq!(lines[3], "2;name;required field is empty;");
        assert_eq!(lines[4], "3;monthly_salary;invalid number;abc");
        assert_eq!(lines.len(), 5);
    }

    #[test]
    fn test_report_is_byte_identical_across_calls() {
        let job = finished_job();
        let first = render_report(&job).unwrap();
        let second = render_report(&job).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_report_quotes_cells_containing_delimiter() {
        let mut job = finished_job();
        job.errors
            .push(ImportIssue::new(4, "notes", "contains ; semicolon"));

        let report = render_report(&job).unwrap();
        assert!(report.contains("\"contains ; semicolon\""));
    }

    #[test]
    fn test_report_for_clean_job_has_only_headers_and_summary() {
        let mut job = finished_job();
        job.errors.clear();
        job.failed_rows = 0;
        job.processed_rows = 3;
        job.status = ImportJobStatus::Completed;

        let report = render_report(&job).unwrap();
        assert_eq!(report.lines().count(), 3);
        assert!(report.contains("staff.csv;completed;3;3;0"));
    }
}

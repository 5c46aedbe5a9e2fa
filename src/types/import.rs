//! Import pipeline domain types
//!
//! The import type is a closed enum: every variant maps to a fixed target
//! schema and a fixed record sink. Caller-supplied strings are parsed at the
//! transport boundary and never reach a storage identifier.

use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Kinds of records the worker can bulk-load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportType {
    Employees,
    Equipment,
    Companies,
}

impl ImportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportType::Employees => "employees",
            ImportType::Equipment => "equipment",
            ImportType::Companies => "companies",
        }
    }

    pub const ALL: [ImportType; 3] = [
        ImportType::Employees,
        ImportType::Equipment,
        ImportType::Companies,
    ];
}

impl fmt::Display for ImportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error for unrecognized import type strings at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown import type '{0}' (expected employees, equipment or companies)")]
pub struct UnknownImportType(pub String);

impl FromStr for ImportType {
    type Err = UnknownImportType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "employees" => Ok(ImportType::Employees),
            "equipment" => Ok(ImportType::Equipment),
            "companies" => Ok(ImportType::Companies),
            other => Err(UnknownImportType(other.to_string())),
        }
    }
}

/// What to do when a row collides with an existing record key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateHandling {
    /// Count the row as processed, leave the stored record untouched.
    Skip,
    /// Overwrite the stored record via an update-by-key.
    Update,
    /// Insert a fresh record, ignoring the key collision.
    CreateNew,
}

/// Whether a row-level failure aborts the whole job or is recorded and skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    Strict,
    Lenient,
}

/// How chatty the executor is about individual rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogVerbosity {
    Minimal,
    Normal,
    Verbose,
}

pub const DEFAULT_BATCH_SIZE: u32 = 50;
pub const MAX_BATCH_SIZE: u32 = 1000;

/// Per-job configuration, frozen once processing begins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSettings {
    pub duplicate_handling: DuplicateHandling,
    pub validation_mode: ValidationMode,
    pub batch_size: u32,
    pub skip_empty_values: bool,
    pub notify_on_completion: bool,
    pub log_verbosity: LogVerbosity,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            duplicate_handling: DuplicateHandling::Skip,
            validation_mode: ValidationMode::Lenient,
            batch_size: DEFAULT_BATCH_SIZE,
            skip_empty_values: false,
            notify_on_completion: false,
            log_verbosity: LogVerbosity::Normal,
        }
    }
}

/// Error for settings that decode but carry unusable values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid import settings: {0}")]
pub struct InvalidSettings(pub String);

impl ImportSettings {
    /// Apply a partial update, validating the result. Fields absent from the
    /// update keep their current value.
    pub fn apply(&self, update: &ImportSettingsUpdate) -> Result<ImportSettings, InvalidSettings> {
        let merged = ImportSettings {
            duplicate_handling: update.duplicate_handling.unwrap_or(self.duplicate_handling),
            validation_mode: update.validation_mode.unwrap_or(self.validation_mode),
            batch_size: update.batch_size.unwrap_or(self.batch_size),
            skip_empty_values: update.skip_empty_values.unwrap_or(self.skip_empty_values),
            notify_on_completion: update
                .notify_on_completion
                .unwrap_or(self.notify_on_completion),
            log_verbosity: update.log_verbosity.unwrap_or(self.log_verbosity),
        };

        if merged.batch_size == 0 {
            return Err(InvalidSettings("batchSize must be at least 1".to_string()));
        }
        if merged.batch_size > MAX_BATCH_SIZE {
            return Err(InvalidSettings(format!(
                "batchSize must not exceed {}",
                MAX_BATCH_SIZE
            )));
        }

        Ok(merged)
    }
}

/// Partial settings as they arrive in request payloads. Every field is
/// optional; omitted fields fall back to the job's current settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSettingsUpdate {
    #[serde(default)]
    pub duplicate_handling: Option<DuplicateHandling>,
    #[serde(default)]
    pub validation_mode: Option<ValidationMode>,
    #[serde(default)]
    pub batch_size: Option<u32>,
    #[serde(default)]
    pub skip_empty_values: Option<bool>,
    #[serde(default)]
    pub notify_on_completion: Option<bool>,
    #[serde(default)]
    pub log_verbosity: Option<LogVerbosity>,
}

/// One row-level problem recorded against a job.
///
/// `row` is the 1-based data row number, header row excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportIssue {
    pub row: u32,
    pub column: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ImportIssue {
    pub fn new(row: u32, column: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            row,
            column: column.into(),
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }
}

/// Caller-supplied header-to-field assignment, as sent by the mapping UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingAssignment {
    pub source: String,
    pub target: String,
}

/// One resolved column binding: which source header feeds which target field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnBinding {
    pub source: String,
    pub target: String,
    pub required: bool,
}

/// A value coerced to its target field type.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

/// A validated row keyed by target field names, ready for the record sink.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedRecord {
    /// 1-based data row number, header row excluded.
    pub row: u32,
    values: Vec<(String, Option<FieldValue>)>,
}

impl MappedRecord {
    pub fn new(row: u32, values: Vec<(String, Option<FieldValue>)>) -> Self {
        Self { row, values }
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.values
            .iter()
            .find(|(name, _)| name == field)
            .and_then(|(_, value)| value.as_ref())
    }

    pub fn text(&self, field: &str) -> Option<&str> {
        match self.get(field) {
            Some(FieldValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn number(&self, field: &str) -> Option<f64> {
        match self.get(field) {
            Some(FieldValue::Number(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn date(&self, field: &str) -> Option<NaiveDate> {
        match self.get(field) {
            Some(FieldValue::Date(d)) => Some(*d),
            _ => None,
        }
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, Option<&FieldValue>)> {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_ref()))
    }
}

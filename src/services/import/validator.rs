//! Row validation and type coercion
//!
//! Pure transform: one raw row plus the resolved mapping in, a typed record
//! plus its issues out. No I/O happens here, so the same function backs both
//! the validation preview and the batch executor.
//!
//! Empty-value policy: an empty required field is always an error. An empty
//! optional text field is simply absent. An empty optional number/date/enum
//! field is a coercion error unless `skipEmptyValues` is set, in which case it
//! is treated as absent.

use chrono::NaiveDate;

use super::parser::RawRow;
use super::schema::{FieldKind, TargetSchema};
use crate::types::{ColumnBinding, FieldValue, ImportIssue, ImportSettings, MappedRecord};

const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%d.%m.%Y"];

/// Result of validating one row.
#[derive(Debug, Clone)]
pub struct RowOutcome {
    pub record: MappedRecord,
    pub issues: Vec<ImportIssue>,
}

impl RowOutcome {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

pub fn validate_row(
    row: &RawRow,
    mapping: &[ColumnBinding],
    schema: &TargetSchema,
    settings: &ImportSettings,
) -> RowOutcome {
    let mut values = Vec::with_capacity(mapping.len());
    let mut issues = Vec::new();

    for binding in mapping {
        let Some(field) = schema.field(&binding.target) else {
            continue;
        };
        let raw = row.get(&binding.source).unwrap_or("");

        if raw.is_empty() {
            if field.required {
                issues.push(ImportIssue::new(
                    row.line,
                    field.name,
                    "required field is empty",
                ));
            } else if !settings.skip_empty_values && !matches!(field.kind, FieldKind::Text) {
                issues.push(
                    ImportIssue::new(
                        row.line,
                        field.name,
                        format!("empty value, field expects a {}", field.kind.type_name()),
                    )
                    .with_value(raw),
                );
            }
            values.push((field.name.to_string(), None));
            continue;
        }

        match coerce(raw, field.kind) {
            Ok(value) => values.push((field.name.to_string(), Some(value))),
            Err(message) => {
                issues.push(ImportIssue::new(row.line, field.name, message).with_value(raw));
                values.push((field.name.to_string(), None));
            }
        }
    }

    RowOutcome {
        record: MappedRecord::new(row.line, values),
        issues,
    }
}

fn coerce(raw: &str, kind: FieldKind) -> Result<FieldValue, String> {
    match kind {
        FieldKind::Text => Ok(FieldValue::Text(raw.to_string())),
        FieldKind::Number => {
            // Decimal commas are common in exported spreadsheets.
            let normalized = raw.replace(',', ".");
            normalized
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .map(FieldValue::Number)
                .ok_or_else(|| "invalid number".to_string())
        }
        FieldKind::Date => DATE_FORMATS
            .iter()
            .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
            .map(FieldValue::Date)
            .ok_or_else(|| "invalid date, expected YYYY-MM-DD or DD.MM.YYYY".to_string()),
        FieldKind::Enumeration(allowed) => allowed
            .iter()
            .find(|v| v.eq_ignore_ascii_case(raw))
            .map(|v| FieldValue::Text(v.to_string()))
            .ok_or_else(|| format!("invalid value, expected one of: {}", allowed.join(", "))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::import::mapper::resolve_mapping;
    use crate::services::import::parser::TabularFile;
    use crate::services::import::schema::schema_for;
    use crate::types::ImportType;

    fn outcome_for(csv: &str, settings: &ImportSettings) -> Vec<RowOutcome> {
        let schema = schema_for(ImportType::Employees);
        let file = TabularFile::parse(csv, None).unwrap();
        let mapping = resolve_mapping(file.headers(), schema, &[]).unwrap();
        file.rows()
            .map(|row| validate_row(&row, &mapping, schema, settings))
            .collect()
    }

    #[test]
    fn test_valid_row_produces_typed_record() {
        let csv = "personnel_number;name;hired_on;monthly_salary;employment_type\n\
                   E-1;Ada;2024-03-01;3200,50;Full_Time\n";
        let outcomes = outcome_for(csv, &ImportSettings::default());

        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert!(outcome.is_valid());
        assert_eq!(outcome.record.text("personnel_number"), Some("E-1"));
        assert_eq!(outcome.record.number("monthly_salary"), Some(3200.5));
        assert_eq!(
            outcome.record.date("hired_on"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        // enum values are canonicalized to the allowed spelling
        assert_eq!(outcome.record.text("employment_type"), Some("full_time"));
    }

    #[test]
    fn test_date_accepts_dotted_european_format() {
        let csv = "personnel_number;name;hired_on\nE-1;Ada;01.03.2024\n";
        let outcomes = outcome_for(csv, &ImportSettings::default());
        assert_eq!(
            outcomes[0].record.date("hired_on"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
    }

    #[test]
    fn test_empty_required_field_yields_one_error_with_row_number() {
        let csv = "personnel_number;name\nE-1;Ada\nE-2;\nE-3;Grace\n";
        let outcomes = outcome_for(csv, &ImportSettings::default());

        assert!(outcomes[0].is_valid());
        assert!(outcomes[2].is_valid());

        let issues = &outcomes[1].issues;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].row, 2);
        assert_eq!(issues[0].column, "name");
        assert_eq!(issues[0].message, "required field is empty");
        assert!(issues[0].value.is_none());
    }

    #[test]
    fn test_empty_optional_text_field_is_absent_not_error() {
        let csv = "personnel_number;name;department\nE-1;Ada;\n";
        let outcomes = outcome_for(csv, &ImportSettings::default());

        assert!(outcomes[0].is_valid());
        assert!(outcomes[0].record.get("department").is_none());
    }

    #[test]
    fn test_empty_optional_typed_field_errors_by_default() {
        let csv = "personnel_number;name;monthly_salary\nE-1;Ada;\n";
        let outcomes = outcome_for(csv, &ImportSettings::default());

        assert_eq!(outcomes[0].issues.len(), 1);
        assert_eq!(outcomes[0].issues[0].column, "monthly_salary");
    }

    #[test]
    fn test_skip_empty_values_suppresses_optional_typed_errors() {
        let csv = "personnel_number;name;monthly_salary\nE-1;Ada;\n";
        let settings = ImportSettings {
            skip_empty_values: true,
            ..Default::default()
        };
        let outcomes = outcome_for(csv, &settings);

        assert!(outcomes[0].is_valid());
        assert!(outcomes[0].record.get("monthly_salary").is_none());
    }

    #[test]
    fn test_skip_empty_values_never_excuses_required_fields() {
        let csv = "personnel_number;name\n;Ada\n";
        let settings = ImportSettings {
            skip_empty_values: true,
            ..Default::default()
        };
        let outcomes = outcome_for(csv, &settings);

        assert_eq!(outcomes[0].issues.len(), 1);
        assert_eq!(outcomes[0].issues[0].column, "personnel_number");
    }

    #[test]
    fn test_invalid_number_records_offending_value() {
        let csv = "personnel_number;name;monthly_salary\nE-1;Ada;lots\n";
        let outcomes = outcome_for(csv, &ImportSettings::default());

        let issue = &outcomes[0].issues[0];
        assert_eq!(issue.column, "monthly_salary");
        assert_eq!(issue.message, "invalid number");
        assert_eq!(issue.value.as_deref(), Some("lots"));
    }

    #[test]
    fn test_invalid_date_is_rejected() {
        let csv = "personnel_number;name;hired_on\nE-1;Ada;03/01/2024\n";
        let outcomes = outcome_for(csv, &ImportSettings::default());

        assert_eq!(outcomes[0].issues.len(), 1);
        assert!(outcomes[0].issues[0].message.contains("invalid date"));
    }

    #[test]
    fn test_invalid_enum_names_allowed_values() {
        let csv = "personnel_number;name;employment_type\nE-1;Ada;freelance\n";
        let outcomes = outcome_for(csv, &ImportSettings::default());

        let issue = &outcomes[0].issues[0];
        assert!(issue.message.contains("full_time"));
        assert!(issue.message.contains("contractor"));
        assert_eq!(issue.value.as_deref(), Some("freelance"));
    }

    #[test]
    fn test_multiple_issues_follow_mapping_order() {
        let csv = "personnel_number;name;hired_on;monthly_salary\n;Ada;bad;worse\n";
        let outcomes = outcome_for(csv, &ImportSettings::default());

        let columns: Vec<&str> = outcomes[0]
            .issues
            .iter()
            .map(|i| i.column.as_str())
            .collect();
        assert_eq!(columns, vec!["personnel_number", "hired_on", "monthly_salary"]);
    }

    #[test]
    fn test_validation_is_deterministic() {
        let csv = "personnel_number;name\nE-1;\n";
        let first = outcome_for(csv, &ImportSettings::default());
        let second = outcome_for(csv, &ImportSettings::default());
        assert_eq!(first[0].issues, second[0].issues);
    }
}

//! Header-to-field mapping resolution
//!
//! Caller-supplied assignments take precedence; anything left unassigned is
//! matched case-insensitively against the target field's name or label. The
//! result is ordered by schema field order, and every required field must end
//! up bound to exactly one source header.

use super::schema::TargetSchema;
use crate::types::{ColumnBinding, MappingAssignment};

// Manual Display/Error impls: `thiserror::Error` cannot be derived here
// because the `Duplicate` variant's field is named `source`, which the derive
// unconditionally treats as an error source (requiring `String: Error`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    Incomplete { missing: Vec<String> },
    Duplicate { source: String },
    UnknownField { field: String },
}

impl std::fmt::Display for MappingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingError::Incomplete { missing } => write!(
                f,
                "required fields have no mapped column: {}",
                missing.join(", ")
            ),
            MappingError::Duplicate { source } => {
                write!(f, "column '{source}' is mapped to more than one field")
            }
            MappingError::UnknownField { field } => {
                write!(f, "unknown target field '{field}'")
            }
        }
    }
}

impl std::error::Error for MappingError {}

/// Resolve the final column mapping for one file against one schema.
pub fn resolve_mapping(
    headers: &[String],
    schema: &TargetSchema,
    assignments: &[MappingAssignment],
) -> Result<Vec<ColumnBinding>, MappingError> {
    // target field name -> source header, in schema order
    let mut bound: Vec<(&'static str, Option<String>)> =
        schema.fields.iter().map(|f| (f.name, None)).collect();

    for assignment in assignments {
        let field = schema
            .field(assignment.target.as_str())
            .ok_or_else(|| MappingError::UnknownField {
                field: assignment.target.clone(),
            })?;

        // Assignments that reference a header the file does not have leave
        // the field unbound; a required field then fails the coverage check.
        let Some(header) = headers.iter().find(|h| h.as_str() == assignment.source) else {
            continue;
        };

        if let Some((_, slot)) = bound.iter_mut().find(|(name, _)| *name == field.name) {
            *slot = Some(header.clone());
        }
    }

    // Auto-match the rest by field name or label.
    for field in schema.fields {
        let taken = bound
            .iter()
            .find(|(name, _)| *name == field.name)
            .and_then(|(_, slot)| slot.as_ref())
            .is_some();
        if taken {
            continue;
        }

        let matched = headers.iter().find(|h| {
            let h = h.trim();
            h.eq_ignore_ascii_case(field.name) || h.eq_ignore_ascii_case(field.label)
        });
        if let Some(header) = matched {
            if let Some((_, slot)) = bound.iter_mut().find(|(name, _)| *name == field.name) {
                *slot = Some(header.clone());
            }
        }
    }

    // One source header must not feed two target fields.
    for (i, (_, source)) in bound.iter().enumerate() {
        let Some(source) = source else { continue };
        let reused = bound
            .iter()
            .skip(i + 1)
            .any(|(_, other)| other.as_ref() == Some(source));
        if reused {
            return Err(MappingError::Duplicate {
                source: source.clone(),
            });
        }
    }

    let missing: Vec<String> = schema
        .required_fields()
        .filter(|f| {
            bound
                .iter()
                .find(|(name, _)| *name == f.name)
                .map_or(true, |(_, slot)| slot.is_none())
        })
        .map(|f| f.name.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(MappingError::Incomplete { missing });
    }

    Ok(bound
        .into_iter()
        .filter_map(|(name, slot)| {
            let field = schema.field(name)?;
            slot.map(|source| ColumnBinding {
                source,
                target: name.to_string(),
                required: field.required,
            })
        })
        .collect())
}

//! Target schemas for the supported import types
//!
//! Each import type owns a fixed set of target fields plus a natural key used
//! for duplicate detection. The tables are compiled in; callers can read them
//! through [`schema_for`] but never extend them at runtime.

use serde::Serialize;

use crate::types::ImportType;

/// Data type a target field coerces its raw cell into.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    Text,
    Number,
    Date,
    /// Case-insensitive match against a fixed list of allowed values.
    Enumeration(&'static [&'static str]),
}

impl FieldKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldKind::Text => "string",
            FieldKind::Number => "number",
            FieldKind::Date => "date",
            FieldKind::Enumeration(_) => "enum",
        }
    }
}

/// One target field of an import schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

/// Complete schema for one import type.
#[derive(Debug, Clone, Copy)]
pub struct TargetSchema {
    pub import_type: ImportType,
    /// Field used for duplicate detection against existing records.
    pub key: &'static str,
    pub fields: &'static [FieldSpec],
}

impl TargetSchema {
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &'static FieldSpec> {
        self.fields.iter().filter(|f| f.required)
    }

    /// Serializable description of the schema for mapping UIs.
    pub fn describe(&self) -> Vec<FieldDescriptor> {
        self.fields
            .iter()
            .map(|f| FieldDescriptor {
                name: f.name,
                label: f.label,
                kind: f.kind.type_name(),
                required: f.required,
                allowed_values: match f.kind {
                    FieldKind::Enumeration(values) => Some(values.to_vec()),
                    _ => None,
                },
            })
            .collect()
    }
}

/// Wire form of a field spec, as returned by the schema endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    pub name: &'static str,
    pub label: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_values: Option<Vec<&'static str>>,
}

pub const EMPLOYMENT_TYPES: &[&str] = &["full_time", "part_time", "contractor"];
pub const EQUIPMENT_CATEGORIES: &[&str] = &["tool", "machine", "vehicle", "electronics"];

const EMPLOYEE_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "personnel_number",
        label: "Personnel number",
        kind: FieldKind::Text,
        required: true,
    },
    FieldSpec {
        name: "name",
        label: "Full name",
        kind: FieldKind::Text,
        required: true,
    },
    FieldSpec {
        name: "email",
        label: "Email",
        kind: FieldKind::Text,
        required: false,
    },
    FieldSpec {
        name: "department",
        label: "Department",
        kind: FieldKind::Text,
        required: false,
    },
    FieldSpec {
        name: "hired_on",
        label: "Hired on",
        kind: FieldKind::Date,
        required: false,
    },
    FieldSpec {
        name: "monthly_salary",
        label: "Monthly salary",
        kind: FieldKind::Number,
        required: false,
    },
    FieldSpec {
        name: "employment_type",
        label: "Employment type",
        kind: FieldKind::Enumeration(EMPLOYMENT_TYPES),
        required: false,
    },
];

const EQUIPMENT_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "serial_number",
        label: "Serial number",
        kind: FieldKind::Text,
        required: true,
    },
    FieldSpec {
        name: "name",
        label: "Name",
        kind: FieldKind::Text,
        required: true,
    },
    FieldSpec {
        name: "manufacturer",
        label: "Manufacturer",
        kind: FieldKind::Text,
        required: false,
    },
    FieldSpec {
        name: "category",
        label: "Category",
        kind: FieldKind::Enumeration(EQUIPMENT_CATEGORIES),
        required: false,
    },
    FieldSpec {
        name: "purchased_on",
        label: "Purchased on",
        kind: FieldKind::Date,
        required: false,
    },
    FieldSpec {
        name: "purchase_price",
        label: "Purchase price",
        kind: FieldKind::Number,
        required: false,
    },
];

const COMPANY_FIELDS: &[FieldSpec] = &[
    FieldSpec {
        name: "registration_number",
        label: "Registration number",
        kind: FieldKind::Text,
        required: true,
    },
    FieldSpec {
        name: "name",
        label: "Company name",
        kind: FieldKind::Text,
        required: true,
    },
    FieldSpec {
        name: "city",
        label: "City",
        kind: FieldKind::Text,
        required: false,
    },
    FieldSpec {
        name: "email",
        label: "Email",
        kind: FieldKind::Text,
        required: false,
    },
    FieldSpec {
        name: "employee_count",
        label: "Employee count",
        kind: FieldKind::Number,
        required: false,
    },
    FieldSpec {
        name: "founded_on",
        label: "Founded on",
        kind: FieldKind::Date,
        required: false,
    },
];

const EMPLOYEES: TargetSchema = TargetSchema {
    import_type: ImportType::Employees,
    key: "personnel_number",
    fields: EMPLOYEE_FIELDS,
};

const EQUIPMENT: TargetSchema = TargetSchema {
    import_type: ImportType::Equipment,
    key: "serial_number",
    fields: EQUIPMENT_FIELDS,
};

const COMPANIES: TargetSchema = TargetSchema {
    import_type: ImportType::Companies,
    key: "registration_number",
    fields: COMPANY_FIELDS,
};

pub fn schema_for(import_type: ImportType) -> &'static TargetSchema {
    match import_type {
        ImportType::Employees => &EMPLOYEES,
        ImportType::Equipment => &EQUIPMENT,
        ImportType::Companies => &COMPANIES,
    }
}

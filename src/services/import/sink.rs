//! Record sink abstraction
//!
//! The executor writes validated rows through [`RecordSink`] and never touches
//! storage directly. Each import type has exactly one sink, selected through
//! [`SinkSet::for_type`]; the type is a closed enum, so no caller-supplied
//! string ever picks a write target.
//!
//! Uses Postgres in production, the in-memory sink in tests.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::PgPool;

use crate::db::sinks::{PgCompanySink, PgEmployeeSink, PgEquipmentSink};
use crate::types::{FieldValue, ImportType, MappedRecord};

/// Failure modes of a single sink write.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("duplicate key '{key}'")]
    Duplicate { key: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Storage capability for one record kind.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Insert a new record; a natural-key collision is reported as
    /// [`SinkError::Duplicate`], nothing is written.
    async fn insert(&self, record: &MappedRecord) -> Result<(), SinkError>;

    /// Overwrite the stored record sharing the record's natural key.
    async fn update_by_key(&self, record: &MappedRecord) -> Result<(), SinkError>;

    /// Insert without the duplicate check.
    async fn force_insert(&self, record: &MappedRecord) -> Result<(), SinkError>;

    /// Sink name for logging.
    fn name(&self) -> &str;
}

/// One sink per import type, fixed at construction.
pub struct SinkSet {
    employees: Arc<dyn RecordSink>,
    equipment: Arc<dyn RecordSink>,
    companies: Arc<dyn RecordSink>,
}

impl SinkSet {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            employees: Arc::new(PgEmployeeSink::new(pool.clone())),
            equipment: Arc::new(PgEquipmentSink::new(pool.clone())),
            companies: Arc::new(PgCompanySink::new(pool)),
        }
    }

    /// Every type backed by an in-memory sink; used in tests.
    pub fn in_memory() -> Self {
        Self {
            employees: Arc::new(MemorySink::new("memory:employees", "personnel_number")),
            equipment: Arc::new(MemorySink::new("memory:equipment", "serial_number")),
            companies: Arc::new(MemorySink::new("memory:companies", "registration_number")),
        }
    }

    pub fn with_sinks(
        employees: Arc<dyn RecordSink>,
        equipment: Arc<dyn RecordSink>,
        companies: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            employees,
            equipment,
            companies,
        }
    }

    pub fn for_type(&self, import_type: ImportType) -> Arc<dyn RecordSink> {
        match import_type {
            ImportType::Employees => Arc::clone(&self.employees),
            ImportType::Equipment => Arc::clone(&self.equipment),
            ImportType::Companies => Arc::clone(&self.companies),
        }
    }
}

// ==========================================================================
// In-memory sink
// ==========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOpKind {
    Insert,
    Update,
    ForceInsert,
}

/// One successful write, recorded for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkOp {
    pub kind: SinkOpKind,
    pub key: String,
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<(String, Vec<(String, Option<String>)>)>,
    operations: Vec<SinkOp>,
    failing_keys: HashSet<String>,
}

/// Mock sink for tests: keeps rows in a vector and records every write.
pub struct MemorySink {
    name: &'static str,
    key_field: &'static str,
    state: Mutex<MemoryState>,
}

impl MemorySink {
    pub fn new(name: &'static str, key_field: &'static str) -> Self {
        Self {
            name,
            key_field,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Make every write touching `key` fail with a backend error.
    pub fn fail_on_key(&self, key: impl Into<String>) {
        self.state.lock().failing_keys.insert(key.into());
    }

    pub fn operations(&self) -> Vec<SinkOp> {
        self.state.lock().operations.clone()
    }

    pub fn row_count(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state
            .lock()
            .rows
            .iter()
            .map(|(key, _)| key.clone())
            .collect()
    }

    fn key_of(&self, record: &MappedRecord) -> Result<String, SinkError> {
        record
            .text(self.key_field)
            .map(str::to_string)
            .ok_or_else(|| {
                SinkError::Backend(anyhow::anyhow!("record has no '{}' value", self.key_field))
            })
    }

    fn check_failure(&self, state: &MemoryState, key: &str) -> Result<(), SinkError> {
        if state.failing_keys.contains(key) {
            return Err(SinkError::Backend(anyhow::anyhow!(
                "simulated backend failure for key '{}'",
                key
            )));
        }
        Ok(())
    }

    fn materialize(record: &MappedRecord) -> Vec<(String, Option<String>)> {
        record
            .fields()
            .map(|(name, value)| {
                let rendered = value.map(|v| match v {
                    FieldValue::Text(s) => s.clone(),
                    FieldValue::Number(n) => n.to_string(),
                    FieldValue::Date(d) => d.to_string(),
                });
                (name.to_string(), rendered)
            })
            .collect()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn insert(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = self.key_of(record)?;
        let mut state = self.state.lock();
        self.check_failure(&state, &key)?;

        if state.rows.iter().any(|(k, _)| *k == key) {
            return Err(SinkError::Duplicate { key });
        }
        state.rows.push((key.clone(), Self::materialize(record)));
        state.operations.push(SinkOp {
            kind: SinkOpKind::Insert,
            key,
        });
        Ok(())
    }

    async fn update_by_key(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = self.key_of(record)?;
        let mut state = self.state.lock();
        self.check_failure(&state, &key)?;

        let Some(slot) = state.rows.iter_mut().find(|(k, _)| *k == key) else {
            return Err(SinkError::Backend(anyhow::anyhow!(
                "no stored record with key '{}'",
                key
            )));
        };
        slot.1 = Self::materialize(record);
        state.operations.push(SinkOp {
            kind: SinkOpKind::Update,
            key,
        });
        Ok(())
    }

    async fn force_insert(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = self.key_of(record)?;
        let mut state = self.state.lock();
        self.check_failure(&state, &key)?;

        state.rows.push((key.clone(), Self::materialize(record)));
        state.operations.push(SinkOp {
            kind: SinkOpKind::ForceInsert,
            key,
        });
        Ok(())
    }

    fn name(&self) -> &str {
        self.name
    }
}

//! Postgres record sinks
//!
//! One sink per import target, each writing a fixed column set. Duplicate
//! detection runs as a lookup on the natural key before the insert; the
//! executor decides what a duplicate means for the row.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::services::import::sink::{RecordSink, SinkError};
use crate::types::MappedRecord;

fn db_err(err: sqlx::Error) -> SinkError {
    SinkError::Backend(err.into())
}

/// Natural key of the record; validation guarantees it for valid rows.
fn required_key(record: &MappedRecord, field: &str) -> Result<String, SinkError> {
    record
        .text(field)
        .map(str::to_string)
        .ok_or_else(|| SinkError::Backend(anyhow::anyhow!("record is missing its '{}' key", field)))
}

// =============================================================================
// EMPLOYEES
// =============================================================================

pub struct PgEmployeeSink {
    pool: PgPool,
}

impl PgEmployeeSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, key: &str) -> Result<bool, SinkError> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM employees WHERE personnel_number = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn insert_row(&self, record: &MappedRecord, key: &str) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO employees (
                id, personnel_number, name, email, department,
                hired_on, monthly_salary, employment_type,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW(), NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(record.text("name"))
        .bind(record.text("email"))
        .bind(record.text("department"))
        .bind(record.date("hired_on"))
        .bind(record.number("monthly_salary"))
        .bind(record.text("employment_type"))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for PgEmployeeSink {
    async fn insert(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = required_key(record, "personnel_number")?;
        if self.exists(&key).await? {
            return Err(SinkError::Duplicate { key });
        }
        self.insert_row(record, &key).await
    }

    async fn update_by_key(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = required_key(record, "personnel_number")?;
        let result = sqlx::query(
            r#"
            UPDATE employees SET
                name = $2, email = $3, department = $4,
                hired_on = $5, monthly_salary = $6, employment_type = $7,
                updated_at = NOW()
            WHERE personnel_number = $1
            "#,
        )
        .bind(&key)
        .bind(record.text("name"))
        .bind(record.text("email"))
        .bind(record.text("department"))
        .bind(record.date("hired_on"))
        .bind(record.number("monthly_salary"))
        .bind(record.text("employment_type"))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(SinkError::Backend(anyhow::anyhow!(
                "no employee with personnel number '{}' to update",
                key
            )));
        }
        Ok(())
    }

    async fn force_insert(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = required_key(record, "personnel_number")?;
        self.insert_row(record, &key).await
    }

    fn name(&self) -> &str {
        "postgres:employees"
    }
}

// =============================================================================
// EQUIPMENT
// =============================================================================

pub struct PgEquipmentSink {
    pool: PgPool,
}

impl PgEquipmentSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, key: &str) -> Result<bool, SinkError> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM equipment WHERE serial_number = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn insert_row(&self, record: &MappedRecord, key: &str) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO equipment (
                id, serial_number, name, manufacturer, category,
                purchased_on, purchase_price,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(record.text("name"))
        .bind(record.text("manufacturer"))
        .bind(record.text("category"))
        .bind(record.date("purchased_on"))
        .bind(record.number("purchase_price"))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for PgEquipmentSink {
    async fn insert(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = required_key(record, "serial_number")?;
        if self.exists(&key).await? {
            return Err(SinkError::Duplicate { key });
        }
        self.insert_row(record, &key).await
    }

    async fn update_by_key(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = required_key(record, "serial_number")?;
        let result = sqlx::query(
            r#"
            UPDATE equipment SET
                name = $2, manufacturer = $3, category = $4,
                purchased_on = $5, purchase_price = $6,
                updated_at = NOW()
            WHERE serial_number = $1
            "#,
        )
        .bind(&key)
        .bind(record.text("name"))
        .bind(record.text("manufacturer"))
        .bind(record.text("category"))
        .bind(record.date("purchased_on"))
        .bind(record.number("purchase_price"))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(SinkError::Backend(anyhow::anyhow!(
                "no equipment with serial number '{}' to update",
                key
            )));
        }
        Ok(())
    }

    async fn force_insert(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = required_key(record, "serial_number")?;
        self.insert_row(record, &key).await
    }

    fn name(&self) -> &str {
        "postgres:equipment"
    }
}

// =============================================================================
// COMPANIES
// =============================================================================

pub struct PgCompanySink {
    pool: PgPool,
}

impl PgCompanySink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(&self, key: &str) -> Result<bool, SinkError> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM companies WHERE registration_number = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn insert_row(&self, record: &MappedRecord, key: &str) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO companies (
                id, registration_number, name, city, email,
                employee_count, founded_on,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key)
        .bind(record.text("name"))
        .bind(record.text("city"))
        .bind(record.text("email"))
        .bind(record.number("employee_count"))
        .bind(record.date("founded_on"))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl RecordSink for PgCompanySink {
    async fn insert(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = required_key(record, "registration_number")?;
        if self.exists(&key).await? {
            return Err(SinkError::Duplicate { key });
        }
        self.insert_row(record, &key).await
    }

    async fn update_by_key(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = required_key(record, "registration_number")?;
        let result = sqlx::query(
            r#"
            UPDATE companies SET
                name = $2, city = $3, email = $4,
                employee_count = $5, founded_on = $6,
                updated_at = NOW()
            WHERE registration_number = $1
            "#,
        )
        .bind(&key)
        .bind(record.text("name"))
        .bind(record.text("city"))
        .bind(record.text("email"))
        .bind(record.number("employee_count"))
        .bind(record.date("founded_on"))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(SinkError::Backend(anyhow::anyhow!(
                "no company with registration number '{}' to update",
                key
            )));
        }
        Ok(())
    }

    async fn force_insert(&self, record: &MappedRecord) -> Result<(), SinkError> {
        let key = required_key(record, "registration_number")?;
        self.insert_row(record, &key).await
    }

    fn name(&self) -> &str {
        "postgres:companies"
    }
}

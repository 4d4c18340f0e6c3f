use async_trait::async_trait;
use chrono::NaiveDate;
use permit_core::{PermitFields, PermitRecord, PermitUpdate, RecordKey, StoredPermit};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{RecordStore, StoreError};

const FIND_BY_PERMIT_NUMBER: &str = "SELECT id, permit_number, fields, date_created, last_seen, pdf_reference, pdf_url \
     FROM permits WHERE permit_number = $1 ORDER BY date_created, id";

const FIND_LATEST: &str = "SELECT id, permit_number, fields, date_created, last_seen, pdf_reference, pdf_url \
     FROM permits ORDER BY date_created DESC, id LIMIT $1";

/// Postgres-backed record store; source fields live in a JSONB column.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("permit schema migrated");
        Ok(())
    }
}

fn row_to_permit(row: &PgRow) -> Result<StoredPermit, sqlx::Error> {
    let id: Uuid = row.try_get("id")?;
    let fields: Json<PermitFields> = row.try_get("fields")?;
    let date_created: NaiveDate = row.try_get("date_created")?;
    let last_seen: NaiveDate = row.try_get("last_seen")?;
    Ok(StoredPermit {
        key: RecordKey(id),
        record: PermitRecord {
            permit_number: row.try_get("permit_number")?,
            fields: fields.0,
            date_created,
            last_seen,
            pdf_reference: row.try_get("pdf_reference")?,
            pdf_url: row.try_get("pdf_url")?,
        },
    })
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn find_by_permit_number(&self, permit_number: &str) -> Result<Vec<StoredPermit>, StoreError> {
        let rows = sqlx::query(FIND_BY_PERMIT_NUMBER)
            .bind(permit_number)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(row_to_permit)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn find_latest(&self, limit: usize) -> Result<Vec<StoredPermit>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(FIND_LATEST)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(row_to_permit)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn insert(&self, record: &PermitRecord) -> Result<RecordKey, StoreError> {
        let key = RecordKey::new();
        sqlx::query(
            "INSERT INTO permits (id, permit_number, fields, date_created, last_seen, pdf_reference, pdf_url) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(key.0)
        .bind(&record.permit_number)
        .bind(Json(&record.fields))
        .bind(record.date_created)
        .bind(record.last_seen)
        .bind(record.pdf_reference.as_deref())
        .bind(record.pdf_url.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(key)
    }

    async fn update(&self, key: RecordKey, update: &PermitUpdate) -> Result<(), StoreError> {
        let (pdf_reference, pdf_url) = match &update.pdf {
            Some(pdf) => (Some(pdf.reference.as_str()), Some(pdf.url.as_str())),
            None => (None, None),
        };
        // GREATEST/COALESCE keep last_seen monotonic and the archived PDF write-once.
        let result = sqlx::query(
            "UPDATE permits SET \
               last_seen = GREATEST(last_seen, COALESCE($2, last_seen)), \
               pdf_url = CASE WHEN pdf_reference IS NULL THEN COALESCE($4, pdf_url) ELSE pdf_url END, \
               pdf_reference = COALESCE(pdf_reference, $3) \
             WHERE id = $1",
        )
        .bind(key.0)
        .bind(update.last_seen)
        .bind(pdf_reference)
        .bind(pdf_url)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::UnknownKey(key));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_lookups_order_deterministically() {
        assert!(FIND_BY_PERMIT_NUMBER.ends_with("ORDER BY date_created, id"));
        assert!(FIND_LATEST.contains("ORDER BY date_created DESC, id LIMIT $1"));
    }
}

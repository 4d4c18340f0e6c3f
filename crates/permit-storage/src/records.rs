use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use permit_core::{PermitRecord, PermitUpdate, RecordKey, StoredPermit};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{RecordStore, StoreError};

/// In-process table shared by the memory and JSON-file stores.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct PermitTable {
    #[serde(default)]
    permits: BTreeMap<RecordKey, PermitRecord>,
}

impl PermitTable {
    /// Matches oldest first, ties broken by key.
    fn find_by_permit_number(&self, permit_number: &str) -> Vec<StoredPermit> {
        let mut found: Vec<_> = self
            .permits
            .iter()
            .filter(|(_, record)| record.permit_number == permit_number)
            .map(|(key, record)| StoredPermit {
                key: *key,
                record: record.clone(),
            })
            .collect();
        found.sort_by(|a, b| (a.record.date_created, a.key).cmp(&(b.record.date_created, b.key)));
        found
    }

    fn find_latest(&self, limit: usize) -> Vec<StoredPermit> {
        let mut all: Vec<_> = self
            .permits
            .iter()
            .map(|(key, record)| StoredPermit {
                key: *key,
                record: record.clone(),
            })
            .collect();
        all.sort_by(|a, b| b.record.date_created.cmp(&a.record.date_created));
        all.truncate(limit);
        all
    }

    fn insert(&mut self, record: &PermitRecord) -> RecordKey {
        let key = RecordKey::new();
        self.permits.insert(key, record.clone());
        key
    }

    fn update(&mut self, key: RecordKey, update: &PermitUpdate) -> Result<(), StoreError> {
        let record = self.permits.get_mut(&key).ok_or(StoreError::UnknownKey(key))?;
        record.apply(update);
        Ok(())
    }
}

/// Volatile store used for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    table: Mutex<PermitTable>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store with already-known permits.
    pub fn with_records(records: impl IntoIterator<Item = PermitRecord>) -> Self {
        let mut table = PermitTable::default();
        for record in records {
            table.insert(&record);
        }
        Self {
            table: Mutex::new(table),
        }
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.permits.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// All stored records, sorted by permit number.
    pub async fn records(&self) -> Vec<PermitRecord> {
        let mut records: Vec<_> = self.table.lock().await.permits.values().cloned().collect();
        records.sort_by(|a, b| a.permit_number.cmp(&b.permit_number));
        records
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn find_by_permit_number(&self, permit_number: &str) -> Result<Vec<StoredPermit>, StoreError> {
        Ok(self.table.lock().await.find_by_permit_number(permit_number))
    }

    async fn find_latest(&self, limit: usize) -> Result<Vec<StoredPermit>, StoreError> {
        Ok(self.table.lock().await.find_latest(limit))
    }

    async fn insert(&self, record: &PermitRecord) -> Result<RecordKey, StoreError> {
        Ok(self.table.lock().await.insert(record))
    }

    async fn update(&self, key: RecordKey, update: &PermitUpdate) -> Result<(), StoreError> {
        self.table.lock().await.update(key, update)
    }
}

/// Single JSON document on disk, rewritten atomically after every change.
#[derive(Debug)]
pub struct JsonFileRecordStore {
    path: PathBuf,
    table: Mutex<PermitTable>,
}

impl JsonFileRecordStore {
    /// Opens `path`, starting empty if the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let table = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt {
                path: path.clone(),
                source,
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => PermitTable::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, table: &PermitTable) -> Result<(), StoreError> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.path.clone(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(table).map_err(|source| StoreError::Corrupt {
            path: self.path.clone(),
            source,
        })?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent).await.map_err(io_err)?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_err)?;
        file.write_all(&bytes).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_err(err));
        }
        debug!(path = %self.path.display(), permits = table.permits.len(), "record store persisted");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn find_by_permit_number(&self, permit_number: &str) -> Result<Vec<StoredPermit>, StoreError> {
        Ok(self.table.lock().await.find_by_permit_number(permit_number))
    }

    async fn find_latest(&self, limit: usize) -> Result<Vec<StoredPermit>, StoreError> {
        Ok(self.table.lock().await.find_latest(limit))
    }

    async fn insert(&self, record: &PermitRecord) -> Result<RecordKey, StoreError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        let key = next.insert(record);
        self.persist(&next).await?;
        *table = next;
        Ok(key)
    }

    async fn update(&self, key: RecordKey, update: &PermitUpdate) -> Result<(), StoreError> {
        let mut table = self.table.lock().await;
        let mut next = table.clone();
        next.update(key, update)?;
        self.persist(&next).await?;
        *table = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use permit_core::{PdfArchive, PermitFields};
    use tempfile::tempdir;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(number: &str, created: NaiveDate) -> PermitRecord {
        let mut fields = PermitFields::new();
        fields.insert("PermitNumber".into(), number.into());
        PermitRecord::first_seen(number, fields, created)
    }

    #[tokio::test]
    async fn latest_orders_by_date_created_descending() {
        let store = MemoryRecordStore::with_records([
            record("A", date(2024, 1, 3)),
            record("B", date(2024, 2, 1)),
            record("C", date(2023, 12, 30)),
        ]);
        let latest = store.find_latest(1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].record.permit_number, "B");

        let all = store.find_latest(10).await.unwrap();
        let order: Vec<_> = all.iter().map(|p| p.record.permit_number.as_str()).collect();
        assert_eq!(order, vec!["B", "A", "C"]);
    }

    #[tokio::test]
    async fn empty_store_has_no_latest() {
        let store = MemoryRecordStore::new();
        assert!(store.find_latest(1).await.unwrap().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn update_of_unknown_key_fails() {
        let store = MemoryRecordStore::new();
        let err = store
            .update(RecordKey::new(), &PermitUpdate::last_seen(date(2024, 1, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownKey(_)));
    }

    #[tokio::test]
    async fn json_file_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state").join("permits.json");

        let store = JsonFileRecordStore::open(&path).await.expect("open new");
        let key = store.insert(&record("P1", date(2024, 1, 1))).await.unwrap();
        store
            .update(key, &PermitUpdate::last_seen(date(2024, 1, 5)))
            .await
            .unwrap();
        store
            .update(
                key,
                &PermitUpdate::pdf(PdfArchive {
                    reference: "P1.pdf".into(),
                    url: "file:///blobs/permitpdf/P1.pdf".into(),
                }),
            )
            .await
            .unwrap();
        drop(store);

        let reopened = JsonFileRecordStore::open(&path).await.expect("reopen");
        let found = reopened.find_by_permit_number("P1").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].key, key);
        assert_eq!(found[0].record.date_created, date(2024, 1, 1));
        assert_eq!(found[0].record.last_seen, date(2024, 1, 5));
        assert_eq!(found[0].record.pdf_reference.as_deref(), Some("P1.pdf"));
        assert_eq!(found[0].record.fields["PermitNumber"], "P1");
    }

    #[tokio::test]
    async fn duplicates_come_back_oldest_first() {
        let store = MemoryRecordStore::with_records([
            record("D1", date(2024, 3, 9)),
            record("D1", date(2024, 1, 2)),
            record("D2", date(2024, 1, 1)),
        ]);
        let found = store.find_by_permit_number("D1").await.unwrap();
        let created: Vec<_> = found.iter().map(|p| p.record.date_created).collect();
        assert_eq!(created, vec![date(2024, 1, 2), date(2024, 3, 9)]);
    }

    #[tokio::test]
    async fn failed_write_leaves_json_store_unchanged() {
        let dir = tempdir().expect("tempdir");
        let state_dir = dir.path().join("state");
        let store = JsonFileRecordStore::open(state_dir.join("permits.json"))
            .await
            .expect("open new");

        // A plain file where the parent directory should be makes persist fail.
        std::fs::write(&state_dir, b"").unwrap();
        let err = store.insert(&record("P1", date(2024, 1, 1))).await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        assert!(store.find_by_permit_number("P1").await.unwrap().is_empty());
        assert!(store.find_latest(1).await.unwrap().is_empty());

        std::fs::remove_file(&state_dir).unwrap();
        let key = store.insert(&record("P2", date(2024, 1, 2))).await.unwrap();
        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, b"").unwrap();
        let err = store
            .update(key, &PermitUpdate::last_seen(date(2024, 2, 1)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
        let found = store.find_by_permit_number("P2").await.unwrap();
        assert_eq!(found[0].record.last_seen, date(2024, 1, 2));
    }

    #[tokio::test]
    async fn corrupt_json_file_is_reported() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("permits.json");
        std::fs::write(&path, b"{not json").unwrap();
        let err = JsonFileRecordStore::open(&path).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }
}

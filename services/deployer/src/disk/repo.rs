//! SQLite-backed disk registry.
//!
//! The registry is the source of truth for which cloud disks belong to the
//! deployment and which one is current.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use dirboot_id::{DiskCid, DiskRecordId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use super::DiskRecord;
use crate::cloud::CloudProperties;

/// Errors from disk registry operations.
#[derive(Debug, Error)]
pub enum DiskRepoError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Disk record not found: {0}")]
    NotFound(String),

    #[error("Invalid disk record: {0}")]
    Invalid(String),
}

/// Persistent store of disk records.
pub trait DiskRepo: Send + Sync {
    /// Records a newly created disk. The new record is not made current.
    fn save(
        &self,
        cid: &DiskCid,
        size: u64,
        cloud_properties: &CloudProperties,
    ) -> Result<DiskRecord, DiskRepoError>;

    /// All records, oldest first.
    fn all(&self) -> Result<Vec<DiskRecord>, DiskRepoError>;

    fn find(&self, cid: &DiskCid) -> Result<Option<DiskRecord>, DiskRepoError>;

    fn find_current(&self) -> Result<Option<DiskRecord>, DiskRepoError>;

    /// Marks an existing record as current.
    fn update_current(&self, id: DiskRecordId) -> Result<(), DiskRepoError>;

    /// Removes a record. Removing the current record clears the pointer.
    fn delete(&self, id: DiskRecordId) -> Result<(), DiskRepoError>;
}

/// SQLite disk registry.
pub struct SqliteDiskRepo {
    conn: Mutex<Connection>,
}

impl SqliteDiskRepo {
    /// Open or create a registry at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DiskRepoError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let repo = Self {
            conn: Mutex::new(conn),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    /// Open an in-memory registry (for testing).
    pub fn open_in_memory() -> Result<Self, DiskRepoError> {
        let repo = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        repo.init_schema()?;
        Ok(repo)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> Result<(), DiskRepoError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS deployment_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                current_disk_id TEXT
            );

            INSERT OR IGNORE INTO deployment_state (id) VALUES (1);

            CREATE TABLE IF NOT EXISTS disks (
                id TEXT PRIMARY KEY,
                cid TEXT NOT NULL UNIQUE,
                size INTEGER NOT NULL,
                cloud_properties TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Disk registry schema initialized");
        Ok(())
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<(String, String, i64, String, i64)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode(raw: (String, String, i64, String, i64)) -> Result<DiskRecord, DiskRepoError> {
    let (id, cid, size, cloud_properties, created_at) = raw;

    Ok(DiskRecord {
        id: DiskRecordId::parse(&id).map_err(|e| DiskRepoError::Invalid(format!("{id}: {e}")))?,
        cid: DiskCid::parse(cid).map_err(|e| DiskRepoError::Invalid(e.to_string()))?,
        size: u64::try_from(size).map_err(|_| DiskRepoError::Invalid(format!("negative size {size}")))?,
        cloud_properties: serde_json::from_str(&cloud_properties)
            .map_err(|e| DiskRepoError::Invalid(format!("cloud properties: {e}")))?,
        created_at: DateTime::<Utc>::from_timestamp_millis(created_at)
            .ok_or_else(|| DiskRepoError::Invalid(format!("timestamp {created_at}")))?,
    })
}

const SELECT_DISK: &str = "SELECT id, cid, size, cloud_properties, created_at FROM disks";

impl DiskRepo for SqliteDiskRepo {
    fn save(
        &self,
        cid: &DiskCid,
        size: u64,
        cloud_properties: &CloudProperties,
    ) -> Result<DiskRecord, DiskRepoError> {
        let record = DiskRecord {
            id: DiskRecordId::new(),
            cid: cid.clone(),
            size,
            cloud_properties: cloud_properties.clone(),
            created_at: Utc::now(),
        };

        let properties = serde_json::to_string(&record.cloud_properties)
            .map_err(|e| DiskRepoError::Invalid(format!("cloud properties: {e}")))?;
        let size = i64::try_from(size).map_err(|_| DiskRepoError::Invalid(format!("size {size} too large")))?;

        self.conn().execute(
            "INSERT INTO disks (id, cid, size, cloud_properties, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id.to_string(),
                record.cid.as_str(),
                size,
                properties,
                record.created_at.timestamp_millis()
            ],
        )?;

        debug!(disk_id = %record.id, disk_cid = %record.cid, "Saved disk record");
        Ok(record)
    }

    fn all(&self) -> Result<Vec<DiskRecord>, DiskRepoError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!("{SELECT_DISK} ORDER BY created_at, rowid"))?;
        let rows = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(decode).collect()
    }

    fn find(&self, cid: &DiskCid) -> Result<Option<DiskRecord>, DiskRepoError> {
        let raw = self
            .conn()
            .query_row(&format!("{SELECT_DISK} WHERE cid = ?1"), params![cid.as_str()], record_from_row)
            .optional()?;

        raw.map(decode).transpose()
    }

    fn find_current(&self) -> Result<Option<DiskRecord>, DiskRepoError> {
        let raw = self
            .conn()
            .query_row(
                &format!(
                    "{SELECT_DISK} WHERE id = (SELECT current_disk_id FROM deployment_state WHERE id = 1)"
                ),
                [],
                record_from_row,
            )
            .optional()?;

        raw.map(decode).transpose()
    }

    fn update_current(&self, id: DiskRecordId) -> Result<(), DiskRepoError> {
        let conn = self.conn();
        let exists: Option<String> = conn
            .query_row("SELECT id FROM disks WHERE id = ?1", params![id.to_string()], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            return Err(DiskRepoError::NotFound(id.to_string()));
        }

        conn.execute(
            "UPDATE deployment_state SET current_disk_id = ?1 WHERE id = 1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    fn delete(&self, id: DiskRecordId) -> Result<(), DiskRepoError> {
        let conn = self.conn();
        conn.execute("DELETE FROM disks WHERE id = ?1", params![id.to_string()])?;
        conn.execute(
            "UPDATE deployment_state SET current_disk_id = NULL WHERE id = 1 AND current_disk_id = ?1",
            params![id.to_string()],
        )?;

        debug!(disk_id = %id, "Deleted disk record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;

    fn cid(s: &str) -> DiskCid {
        DiskCid::parse(s).unwrap()
    }

    fn props() -> CloudProperties {
        json!({"type": "gp3"}).as_object().unwrap().clone()
    }

    #[test]
    fn test_save_and_find() {
        let repo = SqliteDiskRepo::open_in_memory().unwrap();

        let saved = repo.save(&cid("vol-1"), 1024, &props()).unwrap();
        let found = repo.find(&cid("vol-1")).unwrap().unwrap();

        assert_eq!(found.id, saved.id);
        assert_eq!(found.size, 1024);
        assert_eq!(found.cloud_properties, props());
        assert!(repo.find(&cid("vol-2")).unwrap().is_none());
    }

    #[test]
    fn test_current_pointer() {
        let repo = SqliteDiskRepo::open_in_memory().unwrap();
        assert!(repo.find_current().unwrap().is_none());

        let first = repo.save(&cid("vol-1"), 1024, &props()).unwrap();
        let second = repo.save(&cid("vol-2"), 2048, &props()).unwrap();
        assert!(repo.find_current().unwrap().is_none());

        repo.update_current(first.id).unwrap();
        assert_eq!(repo.find_current().unwrap().unwrap().id, first.id);

        repo.update_current(second.id).unwrap();
        assert_eq!(repo.find_current().unwrap().unwrap().cid, cid("vol-2"));
    }

    #[test]
    fn test_update_current_unknown_id() {
        let repo = SqliteDiskRepo::open_in_memory().unwrap();
        let err = repo.update_current(DiskRecordId::new()).unwrap_err();
        assert!(matches!(err, DiskRepoError::NotFound(_)));
    }

    #[test]
    fn test_delete_current_clears_pointer() {
        let repo = SqliteDiskRepo::open_in_memory().unwrap();
        let record = repo.save(&cid("vol-1"), 1024, &props()).unwrap();
        repo.update_current(record.id).unwrap();

        repo.delete(record.id).unwrap();

        assert!(repo.find_current().unwrap().is_none());
        assert!(repo.all().unwrap().is_empty());
    }

    #[test]
    fn test_all_in_creation_order() {
        let repo = SqliteDiskRepo::open_in_memory().unwrap();
        for name in ["vol-a", "vol-b", "vol-c"] {
            repo.save(&cid(name), 1, &CloudProperties::new()).unwrap();
        }

        let cids: Vec<String> = repo.all().unwrap().iter().map(|r| r.cid.to_string()).collect();
        assert_eq!(cids, vec!["vol-a", "vol-b", "vol-c"]);
    }

    #[test]
    fn test_duplicate_cid_rejected() {
        let repo = SqliteDiskRepo::open_in_memory().unwrap();
        repo.save(&cid("vol-1"), 1, &CloudProperties::new()).unwrap();

        let err = repo.save(&cid("vol-1"), 1, &CloudProperties::new()).unwrap_err();
        assert!(matches!(err, DiskRepoError::Sqlite(_)));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("disks.db");

        let id = {
            let repo = SqliteDiskRepo::open(&path).unwrap();
            let record = repo.save(&cid("vol-1"), 512, &props()).unwrap();
            repo.update_current(record.id).unwrap();
            record.id
        };

        let repo = SqliteDiskRepo::open(&path).unwrap();
        assert_eq!(repo.find_current().unwrap().unwrap().id, id);
    }
}

//! SQLite persistence for sync records and listener watermarks.
//!
//! A restarted engine resumes each agreement from its persisted
//! [`SyncRecord`] and each event stream from its persisted block watermark,
//! so confirmed observations are neither lost nor replayed as changes.
//!
//! The connection is shared behind `Arc<Mutex<_>>`. Async callers go
//! through [`CursorStore::run_blocking`], which moves the work onto the
//! blocking thread pool.

use std::path::Path;
use std::sync::{Arc, Mutex};

use leasehold_core::agreement::Address;
use leasehold_core::sync_record::SyncRecord;
use rusqlite::{Connection, OptionalExtension, params};
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA_SQL: &str = "
    CREATE TABLE IF NOT EXISTS sync_records (
        address TEXT PRIMARY KEY,
        record TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS listener_watermark (
        address TEXT PRIMARY KEY,
        block INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
";

/// Errors from the cursor store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CursorStoreError {
    /// SQLite failure or lock poisoning.
    #[error("cursor database error: {0}")]
    Database(String),

    /// A stored record could not be encoded or decoded.
    #[error("cursor record serialization error: {0}")]
    Serialization(String),
}

/// Durable cursors keyed by agreement address.
#[derive(Debug, Clone)]
pub struct CursorStore {
    conn: Arc<Mutex<Connection>>,
}

impl CursorStore {
    /// Opens (or creates) the database at `path` in WAL mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: &Path) -> Result<Self, CursorStoreError> {
        let conn = Connection::open(path)
            .map_err(|e| CursorStoreError::Database(format!("open failed: {e}")))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(|e| CursorStoreError::Database(format!("enabling WAL failed: {e}")))?;
        info!(path = %path.display(), "cursor store opened");
        Self::with_connection(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, CursorStoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CursorStoreError::Database(format!("open failed: {e}")))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, CursorStoreError> {
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| CursorStoreError::Database(format!("schema init failed: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn locked<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, CursorStoreError>,
    ) -> Result<T, CursorStoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| CursorStoreError::Database(format!("mutex poisoned: {e}")))?;
        f(&conn)
    }

    /// Runs `f` against a clone of this store on the blocking thread pool.
    ///
    /// # Errors
    ///
    /// Returns the error of `f`, or a database error if the task panicked.
    pub async fn run_blocking<T, F>(&self, f: F) -> Result<T, CursorStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Self) -> Result<T, CursorStoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| CursorStoreError::Database(format!("spawn_blocking failed: {e}")))?
    }

    /// Persists `record` for `address`.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or database failure.
    #[allow(clippy::cast_possible_wrap)]
    pub fn save_record(
        &self,
        address: &Address,
        record: &SyncRecord,
    ) -> Result<(), CursorStoreError> {
        let json = serde_json::to_string(record)
            .map_err(|e| CursorStoreError::Serialization(e.to_string()))?;
        let now = unix_now();
        self.locked(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO sync_records (address, record, updated_at)
                 VALUES (?1, ?2, ?3)",
                params![address.as_str(), json, now as i64],
            )
            .map_err(|e| CursorStoreError::Database(e.to_string()))?;
            Ok(())
        })
    }

    /// Loads the record for `address`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or a corrupt record.
    pub fn load_record(&self, address: &Address) -> Result<Option<SyncRecord>, CursorStoreError> {
        let json: Option<String> = self.locked(|conn| {
            conn.query_row(
                "SELECT record FROM sync_records WHERE address = ?1",
                params![address.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| CursorStoreError::Database(e.to_string()))
        })?;
        json.map(|j| {
            serde_json::from_str(&j).map_err(|e| CursorStoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    /// Addresses with a persisted record.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure or an invalid stored address.
    pub fn recorded_addresses(&self) -> Result<Vec<Address>, CursorStoreError> {
        let raw: Vec<String> = self.locked(|conn| {
            let mut stmt = conn
                .prepare("SELECT address FROM sync_records ORDER BY address")
                .map_err(|e| CursorStoreError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| CursorStoreError::Database(e.to_string()))?;
            rows.collect::<Result<_, _>>()
                .map_err(|e| CursorStoreError::Database(e.to_string()))
        })?;
        raw.iter()
            .map(|a| Address::parse(a).map_err(|e| CursorStoreError::Serialization(e.to_string())))
            .collect()
    }

    /// Advances the processed-block watermark of `address` to `block`.
    /// A lower block than the stored one is ignored.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[allow(clippy::cast_possible_wrap)]
    pub fn save_watermark(&self, address: &Address, block: u64) -> Result<(), CursorStoreError> {
        let now = unix_now();
        self.locked(|conn| {
            conn.execute(
                "INSERT INTO listener_watermark (address, block, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(address) DO UPDATE SET
                     block = MAX(block, excluded.block),
                     updated_at = excluded.updated_at",
                params![address.as_str(), block as i64, now as i64],
            )
            .map_err(|e| CursorStoreError::Database(e.to_string()))?;
            Ok(())
        })?;
        debug!(address = %address, block, "watermark saved");
        Ok(())
    }

    /// Loads the processed-block watermark of `address`.
    ///
    /// # Errors
    ///
    /// Returns an error on database failure.
    #[allow(clippy::cast_sign_loss)]
    pub fn load_watermark(&self, address: &Address) -> Result<Option<u64>, CursorStoreError> {
        self.locked(|conn| {
            conn.query_row(
                "SELECT block FROM listener_watermark WHERE address = ?1",
                params![address.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()
            .map(|block| block.map(|b| b as u64))
            .map_err(|e| CursorStoreError::Database(e.to_string()))
        })
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use leasehold_core::agreement::AgreementStatus;
    use tempfile::TempDir;

    use super::*;

    fn address(byte: u8) -> Address {
        Address::parse(&format!("0x{}", format!("{byte:02x}").repeat(20))).unwrap()
    }

    #[test]
    fn test_record_roundtrip_and_overwrite() {
        let store = CursorStore::open_in_memory().unwrap();
        let a = address(0xab);
        assert!(store.load_record(&a).unwrap().is_none());

        let mut record = SyncRecord::new();
        record.last_observed_status = Some(AgreementStatus::Ready);
        record.last_observed_block = 12;
        store.save_record(&a, &record).unwrap();
        assert_eq!(store.load_record(&a).unwrap(), Some(record.clone()));

        record.last_observed_status = Some(AgreementStatus::Active);
        store.save_record(&a, &record).unwrap();
        assert_eq!(
            store.load_record(&a).unwrap().unwrap().last_observed_status,
            Some(AgreementStatus::Active)
        );
        assert_eq!(store.recorded_addresses().unwrap(), vec![a]);
    }

    #[test]
    fn test_watermark_never_moves_backwards() {
        let store = CursorStore::open_in_memory().unwrap();
        let a = address(0x01);
        assert_eq!(store.load_watermark(&a).unwrap(), None);
        store.save_watermark(&a, 10).unwrap();
        store.save_watermark(&a, 7).unwrap();
        assert_eq!(store.load_watermark(&a).unwrap(), Some(10));
        store.save_watermark(&a, 11).unwrap();
        assert_eq!(store.load_watermark(&a).unwrap(), Some(11));
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cursor.db");
        let a = address(0x02);
        {
            let store = CursorStore::open(&path).unwrap();
            store.save_watermark(&a, 99).unwrap();
            store.save_record(&a, &SyncRecord::new()).unwrap();
        }
        let store = CursorStore::open(&path).unwrap();
        assert_eq!(store.load_watermark(&a).unwrap(), Some(99));
        assert_eq!(store.load_record(&a).unwrap(), Some(SyncRecord::new()));
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let store = CursorStore::open_in_memory().unwrap();
        let a = address(0x03);
        let target = a.clone();
        store
            .run_blocking(move |s| s.save_watermark(&target, 5))
            .await
            .unwrap();
        let loaded = store
            .run_blocking(move |s| s.load_watermark(&a))
            .await
            .unwrap();
        assert_eq!(loaded, Some(5));
    }
}

//! Synchronous key/value blob store backing the disk cache.
//!
//! Layout under the cache root:
//! - `manifest.sqlite`: one row per key with size, access time, access
//!   sequence, flags and (for small values) the inline bytes.
//! - `blobs/`: one file per large value, named by `CacheKey::file_name`.
//!
//! Both are created together. If either one is missing while the other
//! exists, or the index cannot be read, the whole root is wiped and recreated.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, trace, warn};

use crate::domain::entities::CacheKey;
use crate::domain::errors::StorageError;

const INDEX_FILE_NAME: &str = "manifest.sqlite";
const BLOB_DIR_NAME: &str = "blobs";

/// Rows removed per trim batch.
const TRIM_BATCH: usize = 16;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS manifest (
        key TEXT PRIMARY KEY NOT NULL,
        file_name TEXT,
        size INTEGER NOT NULL,
        last_access_time INTEGER NOT NULL,
        access_seq INTEGER NOT NULL,
        flags INTEGER NOT NULL,
        inline_data BLOB
    );
    CREATE INDEX IF NOT EXISTS idx_manifest_access_seq ON manifest(access_seq);
    CREATE INDEX IF NOT EXISTS idx_manifest_last_access ON manifest(last_access_time);
";

bitflags::bitflags! {
    /// Storage flags persisted with each record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RecordFlags: u32 {
        /// Bytes live in the index row.
        const INLINE = 1 << 0;
        /// Bytes live in a blob file.
        const FILE = 1 << 1;
    }
}

/// Index metadata for one stored value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    /// Record key.
    pub key: CacheKey,
    /// Stored size in bytes.
    pub size: u64,
    /// Last access, milliseconds since the Unix epoch.
    pub last_access_time: i64,
    /// Storage flags.
    pub flags: RecordFlags,
}

/// Index + blob store. Not thread-safe on its own; callers serialize access.
pub struct DiskStore {
    root: PathBuf,
    blob_dir: PathBuf,
    conn: Connection,
    inline_threshold: usize,
    next_seq: i64,
}

impl DiskStore {
    /// Opens or creates the store, wiping it if it is corrupt.
    ///
    /// # Errors
    /// Returns `StorageError` if the store cannot be created even after a
    /// wipe.
    pub fn open(root: &Path, inline_threshold: usize) -> Result<Self, StorageError> {
        match Self::try_open(root, inline_threshold) {
            Ok(store) => Ok(store),
            Err(e) => {
                warn!(path = %root.display(), error = %e, "Disk cache unreadable, recreating");
                wipe_dir(root)?;
                Self::try_open(root, inline_threshold)
            }
        }
    }

    fn try_open(root: &Path, inline_threshold: usize) -> Result<Self, StorageError> {
        let index_path = root.join(INDEX_FILE_NAME);
        let blob_dir = root.join(BLOB_DIR_NAME);

        if index_path.exists() != blob_dir.is_dir() {
            return Err(StorageError::corrupt("index and blob store out of sync"));
        }

        std::fs::create_dir_all(&blob_dir)?;
        let conn = Connection::open(&index_path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;

        let max_seq: i64 =
            conn.query_row("SELECT COALESCE(MAX(access_seq), 0) FROM manifest", [], |row| {
                row.get(0)
            })?;

        debug!(path = %root.display(), "Opened disk store");

        Ok(Self {
            root: root.to_path_buf(),
            blob_dir,
            conn,
            inline_threshold,
            next_seq: max_seq + 1,
        })
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bump_seq(&mut self) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn blob_path(&self, file_name: &str) -> PathBuf {
        self.blob_dir.join(file_name)
    }

    fn stored_file_name(&self, key: &CacheKey) -> Result<Option<String>, StorageError> {
        let name: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT file_name FROM manifest WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(name.flatten())
    }

    fn remove_blob(&self, file_name: &str) {
        let path = self.blob_path(file_name);
        if let Err(e) = std::fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "Failed to remove blob file");
        }
    }

    /// Inserts or replaces a value and marks it most recently used.
    ///
    /// # Errors
    /// Returns `StorageError` if the blob or the index row cannot be written.
    pub fn set(&mut self, key: &CacheKey, data: &[u8]) -> Result<(), StorageError> {
        let now = now_millis();
        let seq = self.bump_seq();
        let previous_file = self.stored_file_name(key)?;
        let size = i64::try_from(data.len()).unwrap_or(i64::MAX);

        if data.len() < self.inline_threshold {
            self.conn.execute(
                "INSERT OR REPLACE INTO manifest
                    (key, file_name, size, last_access_time, access_seq, flags, inline_data)
                 VALUES (?1, NULL, ?2, ?3, ?4, ?5, ?6)",
                params![key.as_str(), size, now, seq, RecordFlags::INLINE.bits(), data],
            )?;
            if let Some(file_name) = previous_file {
                self.remove_blob(&file_name);
            }
        } else {
            let file_name = key.file_name();
            let mut temp = tempfile::NamedTempFile::new_in(&self.blob_dir)?;
            temp.write_all(data)?;
            temp.persist(self.blob_path(&file_name))
                .map_err(|e| StorageError::from(e.error))?;

            let written = self.conn.execute(
                "INSERT OR REPLACE INTO manifest
                    (key, file_name, size, last_access_time, access_seq, flags, inline_data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)",
                params![key.as_str(), file_name, size, now, seq, RecordFlags::FILE.bits()],
            );
            if let Err(e) = written {
                self.remove_blob(&file_name);
                return Err(e.into());
            }
        }

        trace!(key = %key, size = data.len(), "Stored record");
        Ok(())
    }

    /// Reads a value and marks it most recently used. A row whose blob file
    /// has vanished is deleted and reported as a miss.
    ///
    /// # Errors
    /// Returns `StorageError` on index or file read failures.
    pub fn get(&mut self, key: &CacheKey) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Option<String>, u32, Option<Vec<u8>>)> = self
            .conn
            .query_row(
                "SELECT file_name, flags, inline_data FROM manifest WHERE key = ?1",
                params![key.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((file_name, flags, inline_data)) = row else {
            return Ok(None);
        };

        let flags = RecordFlags::from_bits_truncate(flags);
        let data = if flags.contains(RecordFlags::INLINE) {
            inline_data.unwrap_or_default()
        } else {
            let Some(file_name) = file_name else {
                self.delete_row(key)?;
                return Ok(None);
            };
            match std::fs::read(self.blob_path(&file_name)) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(key = %key, "Blob missing for index row, dropping row");
                    self.delete_row(key)?;
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            }
        };

        let seq = self.bump_seq();
        self.conn.execute(
            "UPDATE manifest SET last_access_time = ?1, access_seq = ?2 WHERE key = ?3",
            params![now_millis(), seq, key.as_str()],
        )?;

        Ok(Some(data))
    }

    /// Returns true if a row exists for the key. Does not touch it.
    ///
    /// # Errors
    /// Returns `StorageError` on index read failures.
    pub fn contains(&self, key: &CacheKey) -> Result<bool, StorageError> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM manifest WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns index metadata for a key.
    ///
    /// # Errors
    /// Returns `StorageError` on index read failures.
    pub fn record(&self, key: &CacheKey) -> Result<Option<DiskRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "SELECT size, last_access_time, flags FROM manifest WHERE key = ?1",
                params![key.as_str()],
                |row| {
                    Ok(DiskRecord {
                        key: key.clone(),
                        size: u64::try_from(row.get::<_, i64>(0)?).unwrap_or(0),
                        last_access_time: row.get(1)?,
                        flags: RecordFlags::from_bits_truncate(row.get(2)?),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn delete_row(&self, key: &CacheKey) -> Result<(), StorageError> {
        self.conn
            .execute("DELETE FROM manifest WHERE key = ?1", params![key.as_str()])?;
        Ok(())
    }

    /// Removes a value. Returns true if it existed.
    ///
    /// # Errors
    /// Returns `StorageError` on index failures.
    pub fn remove(&mut self, key: &CacheKey) -> Result<bool, StorageError> {
        let file_name = self.stored_file_name(key)?;
        let removed = self
            .conn
            .execute("DELETE FROM manifest WHERE key = ?1", params![key.as_str()])?;
        if let Some(file_name) = file_name {
            self.remove_blob(&file_name);
        }
        Ok(removed > 0)
    }

    /// Removes every value.
    ///
    /// # Errors
    /// Returns `StorageError` if the index or blob directory cannot be reset.
    pub fn remove_all(&mut self) -> Result<(), StorageError> {
        self.conn.execute("DELETE FROM manifest", [])?;
        if self.blob_dir.exists() {
            std::fs::remove_dir_all(&self.blob_dir)?;
        }
        std::fs::create_dir_all(&self.blob_dir)?;
        debug!(path = %self.root.display(), "Cleared disk store");
        Ok(())
    }

    /// Summed size of all records.
    ///
    /// # Errors
    /// Returns `StorageError` on index read failures.
    pub fn total_size(&self) -> Result<u64, StorageError> {
        let size: i64 = self.conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM manifest",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(size).unwrap_or(0))
    }

    /// Number of records.
    ///
    /// # Errors
    /// Returns `StorageError` on index read failures.
    pub fn total_count(&self) -> Result<u64, StorageError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM manifest", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Keys ordered from least to most recently used.
    ///
    /// # Errors
    /// Returns `StorageError` on index read failures.
    pub fn keys_by_access(&self) -> Result<Vec<CacheKey>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM manifest ORDER BY access_seq ASC")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys.into_iter().map(CacheKey::from_raw).collect())
    }

    /// Least recently used rows: `(key, file_name, size)`.
    fn oldest_rows(&self, limit: usize) -> Result<Vec<(String, Option<String>, u64)>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT key, file_name, size FROM manifest ORDER BY access_seq ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    u64::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes rows in one transaction, then their blob files.
    fn remove_rows(&mut self, rows: &[(String, Option<String>, u64)]) -> Result<(), StorageError> {
        let tx = self.conn.transaction()?;
        for (key, _, _) in rows {
            tx.execute("DELETE FROM manifest WHERE key = ?1", params![key])?;
        }
        tx.commit()?;
        for (_, file_name, _) in rows {
            if let Some(file_name) = file_name {
                self.remove_blob(file_name);
            }
        }
        Ok(())
    }

    /// Removes records not accessed within `max_age`. Returns the number
    /// removed.
    ///
    /// # Errors
    /// Returns `StorageError` on index failures.
    pub fn trim_to_age(&mut self, max_age: Duration) -> Result<usize, StorageError> {
        let age = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now_millis().saturating_sub(age);
        let rows = {
            let mut stmt = self.conn.prepare(
                "SELECT key, file_name, size FROM manifest
                 WHERE last_access_time < ?1 ORDER BY access_seq ASC",
            )?;
            stmt.query_map(params![cutoff], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    u64::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
        };
        self.remove_rows(&rows)?;
        Ok(rows.len())
    }

    /// Removes least recently used records until the total size is at most
    /// `max_size`. Returns the number removed.
    ///
    /// # Errors
    /// Returns `StorageError` on index failures.
    pub fn trim_to_size(&mut self, max_size: u64) -> Result<usize, StorageError> {
        let mut total = self.total_size()?;
        let mut removed = 0;
        while total > max_size {
            let batch = self.oldest_rows(TRIM_BATCH)?;
            if batch.is_empty() {
                break;
            }
            let mut victims = Vec::new();
            for row in batch {
                if total <= max_size {
                    break;
                }
                total = total.saturating_sub(row.2);
                victims.push(row);
            }
            self.remove_rows(&victims)?;
            removed += victims.len();
        }
        Ok(removed)
    }

    /// Removes least recently used records until at most `max_count` remain.
    /// Returns the number removed.
    ///
    /// # Errors
    /// Returns `StorageError` on index failures.
    pub fn trim_to_count(&mut self, max_count: u64) -> Result<usize, StorageError> {
        let count = self.total_count()?;
        if count <= max_count {
            return Ok(0);
        }
        let excess = usize::try_from(count - max_count).unwrap_or(usize::MAX);
        let rows = self.oldest_rows(excess)?;
        self.remove_rows(&rows)?;
        Ok(rows.len())
    }
}

impl std::fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskStore")
            .field("root", &self.root)
            .field("inline_threshold", &self.inline_threshold)
            .finish_non_exhaustive()
    }
}

fn wipe_dir(root: &Path) -> Result<(), StorageError> {
    if root.exists() {
        std::fs::remove_dir_all(root)?;
    }
    std::fs::create_dir_all(root)?;
    Ok(())
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! `catalog_store` persists the per-directory catalog a tree walker and
//! reconciliation engine build up: one [`FileRecord`] per live file, plus
//! [`SubCatalogMarker`]-style nested-catalog bookkeeping and a small
//! key/value [`ConfigEntry`] table, all backed by a single SQLite database
//! file living at the catalog's root directory.
//!
//! # Design
//!
//! [`Store`] owns one exclusive [`rusqlite::Connection`]; concurrent
//! invocations against the same root are undefined, matching the
//! single-threaded, synchronous resource model the rest of the catalog
//! tool assumes. Mutating calls run inside a lazily-opened transaction that
//! [`Store::commit`] flushes; reads always observe the connection's own
//! uncommitted writes (SQLite's same-connection read-your-writes
//! guarantee), so `insert` followed by `list_files` returns the inserted
//! record regardless of whether `commit` has run yet. Records left
//! uncommitted when a `Store` is dropped are lost, by design: durability is
//! only promised at `commit` boundaries.
//!
//! All dynamic values (`size`, `relpath`, digests) are bound as SQL
//! parameters, never interpolated into query text.
//!
//! # Errors
//!
//! [`StoreError`] reports I/O failures opening the database file, SQLite
//! failures, and [`StoreError::MissingDigest`] when an [`insert`](Store::insert)
//! is attempted for a record with neither `hash` nor `parthash` populated,
//! which would otherwise violate the catalog's core invariant silently.

use std::cell::Cell;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, params};

/// Default catalog database filename (`--dbfilename` default).
pub const DEFAULT_DB_FILENAME: &str = ".dir.db";

/// Default partial-hash chunk size in bytes (`--partial-hash-size` default).
pub const DEFAULT_PARTIAL_HASH_SIZE: u64 = 4096;

/// Errors produced by catalog store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database file could not be opened or created.
    #[error("failed to open catalog database at {path}: {source}")]
    Open {
        /// Path of the database file.
        path: String,
        /// Underlying SQLite failure.
        #[source]
        source: rusqlite::Error,
    },
    /// A SQLite operation failed after the database was opened.
    #[error("catalog database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// A [`FileRecord`] was inserted with neither `hash` nor `parthash` set.
    #[error("file record for {relpath:?} has neither hash nor parthash")]
    MissingDigest {
        /// The record's relative path, for diagnostics.
        relpath: String,
    },
}

/// Result type returned by catalog store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// One catalog entry: a single file known to a [`Store`].
///
/// Invariant: at least one of `hash`/`parthash` is populated. Which one is
/// determined by the owning store's `partial_hash` config at the moment of
/// insertion ([`Store::insert`] enforces this).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Basename of the file (final component of `relpath`).
    pub filename: String,
    /// Path relative to the catalog's root, `/`-separated, never starting with `/`.
    pub relpath: String,
    /// On-disk byte size at the time the digest was computed.
    pub size: u64,
    /// Full-content digest, hex-encoded, when the store runs in full-hash mode.
    pub hash: Option<String>,
    /// Partial (head+tail) digest, hex-encoded, when the store runs in partial-hash mode.
    pub parthash: Option<String>,
}

impl FileRecord {
    /// Returns the single non-null digest column the sync planner matches
    /// candidates on, preferring `parthash` since that is the common case
    /// and the original tool's own matching key.
    #[must_use]
    pub fn content_key(&self) -> Option<&str> {
        self.parthash.as_deref().or(self.hash.as_deref())
    }
}

/// A single catalog store bound to one root directory.
pub struct Store {
    conn: Connection,
    root: PathBuf,
    dbfilename: String,
    in_txn: Cell<bool>,
}

impl Store {
    /// Opens (creating if necessary) the catalog database at
    /// `root/<dbfilename>`, ensuring the `files`, `sub_dbs`, and `config`
    /// relations exist. Missing relations are recreated in place, so a
    /// database that only has some of the three tables (corruption, or a
    /// file created by an unrelated tool) is repaired rather than rejected.
    pub fn open(root: &Path, dbfilename: &str) -> StoreResult<Self> {
        let db_path = root.join(dbfilename);
        let conn = Connection::open(&db_path).map_err(|source| StoreError::Open {
            path: db_path.display().to_string(),
            source,
        })?;

        let store = Self {
            conn,
            root: root.to_path_buf(),
            dbfilename: dbfilename.to_owned(),
            in_txn: Cell::new(false),
        };
        store.ensure_schema()?;
        store.ensure_default_config()?;
        store.commit()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> StoreResult<()> {
        self.ensure_txn()?;
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS files(filename TEXT, relpath TEXT, size INTEGER, hash TEXT, parthash TEXT);
             CREATE TABLE IF NOT EXISTS sub_dbs(relpath TEXT);
             CREATE TABLE IF NOT EXISTS config(key TEXT, value TEXT);",
        )?;
        Ok(())
    }

    fn ensure_default_config(&self) -> StoreResult<()> {
        if self.get_config("partial_hash")?.is_none() {
            self.set_config("partial_hash", "true")?;
        }
        if self.get_config("partial_hash_size")?.is_none() {
            self.set_config("partial_hash_size", &DEFAULT_PARTIAL_HASH_SIZE.to_string())?;
        }
        Ok(())
    }

    /// The directory this store is bound to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The catalog database's filename (not the full path).
    #[must_use]
    pub fn dbfilename(&self) -> &str {
        &self.dbfilename
    }

    /// Path to this store's backing database file.
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.root.join(&self.dbfilename)
    }

    fn ensure_txn(&self) -> StoreResult<()> {
        if !self.in_txn.get() {
            self.conn.execute_batch("BEGIN")?;
            self.in_txn.set(true);
        }
        Ok(())
    }

    /// Durably flushes any pending mutations performed since the last
    /// `commit`. A no-op when nothing is pending.
    pub fn commit(&self) -> StoreResult<()> {
        if self.in_txn.get() {
            self.conn.execute_batch("COMMIT")?;
            self.in_txn.set(false);
        }
        Ok(())
    }

    /// Returns every [`FileRecord`] currently in this store.
    pub fn list_files(&self) -> StoreResult<Vec<FileRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT filename, relpath, size, hash, parthash FROM files")?;
        let rows = stmt.query_map([], Self::row_to_record)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Returns every [`FileRecord`] whose stored `size` equals `size`.
    pub fn files_by_size(&self, size: u64) -> StoreResult<Vec<FileRecord>> {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare("SELECT filename, relpath, size, hash, parthash FROM files WHERE size = ?1")?;
        let rows = stmt.query_map(params![size], Self::row_to_record)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Returns every [`FileRecord`] whose `size` matches and whose content
    /// key (`hash` or `parthash`, whichever is populated) equals
    /// `content_key`. This is the lookup the sync planner uses to build its
    /// many-to-many candidate sets.
    pub fn files_by_fingerprint(&self, size: u64, content_key: &str) -> StoreResult<Vec<FileRecord>> {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT filename, relpath, size, hash, parthash FROM files \
             WHERE size = ?1 AND (hash = ?2 OR parthash = ?2)",
        )?;
        let rows = stmt.query_map(params![size, content_key], Self::row_to_record)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileRecord> {
        Ok(FileRecord {
            filename: row.get(0)?,
            relpath: row.get(1)?,
            size: {
                let size: i64 = row.get(2)?;
                size.max(0) as u64
            },
            hash: row.get(3)?,
            parthash: row.get(4)?,
        })
    }

    /// Inserts `record`. Fails with [`StoreError::MissingDigest`] if
    /// neither `hash` nor `parthash` is populated.
    pub fn insert(&self, record: &FileRecord) -> StoreResult<()> {
        if record.hash.is_none() && record.parthash.is_none() {
            return Err(StoreError::MissingDigest {
                relpath: record.relpath.clone(),
            });
        }
        self.ensure_txn()?;
        let size = i64::try_from(record.size).unwrap_or(i64::MAX);
        self.conn.execute(
            "INSERT INTO files (filename, relpath, size, hash, parthash) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![record.filename, record.relpath, size, record.hash, record.parthash],
        )?;
        Ok(())
    }

    /// Deletes the file record at `relpath`, if any.
    pub fn delete_by_relpath(&self, relpath: &str) -> StoreResult<()> {
        self.ensure_txn()?;
        self.conn
            .execute("DELETE FROM files WHERE relpath = ?1", params![relpath])?;
        Ok(())
    }

    /// Records that a nested catalog exists at `relpath`, if not already present.
    pub fn upsert_subcatalog(&self, relpath: &str) -> StoreResult<()> {
        self.ensure_txn()?;
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sub_dbs WHERE relpath = ?1",
                params![relpath],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            self.conn
                .execute("INSERT INTO sub_dbs (relpath) VALUES (?1)", params![relpath])?;
        }
        Ok(())
    }

    /// Removes the sub-catalog marker at `relpath`, if present.
    pub fn delete_subcatalog(&self, relpath: &str) -> StoreResult<()> {
        self.ensure_txn()?;
        self.conn
            .execute("DELETE FROM sub_dbs WHERE relpath = ?1", params![relpath])?;
        Ok(())
    }

    /// Lists every nested catalog's relative path known to this store.
    pub fn list_subcatalogs(&self) -> StoreResult<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT relpath FROM sub_dbs")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Reads a config value, or `None` if `key` has never been set.
    pub fn get_config(&self, key: &str) -> StoreResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Into::into)
    }

    /// Sets a config value, replacing any prior value for `key`.
    pub fn set_config(&self, key: &str, value: &str) -> StoreResult<()> {
        self.ensure_txn()?;
        self.conn
            .execute("DELETE FROM config WHERE key = ?1", params![key])?;
        self.conn.execute(
            "INSERT INTO config (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Convenience accessor for the cached `partial_hash` config entry,
    /// defaulting to `true` if somehow unset.
    pub fn partial_hash(&self) -> StoreResult<bool> {
        Ok(self
            .get_config("partial_hash")?
            .map(|v| v == "true")
            .unwrap_or(true))
    }

    /// Convenience accessor for the cached `partial_hash_size` config
    /// entry, defaulting to [`DEFAULT_PARTIAL_HASH_SIZE`] if unset or unparsable.
    pub fn partial_hash_size(&self) -> StoreResult<u64> {
        Ok(self
            .get_config("partial_hash_size")?
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PARTIAL_HASH_SIZE))
    }
}

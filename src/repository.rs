//! Durable share repository on SQLite with an FTS5 filename index.
//!
//! Every public operation opens its own connection and finishes its own transaction.
//! Concurrency between readers and writers is left to SQLite's WAL mode; the only
//! application-level lock keeps writers out while a backup or restore copies pages.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::backup::Backup;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Params, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Span};

use crate::config::DEFAULT_SEPARATOR;
use crate::error::{Error, Result};
use crate::model::{FileAttribute, FileEntry, FileMetadata, SharedDirectory, SharedFile};
use crate::query::SearchQuery;
use crate::scan::ScanResult;

// ============================================================================
// Schema
// ============================================================================

pub const DIRECTORIES_DDL: &str =
    "CREATE TABLE directories (name TEXT PRIMARY KEY, timestamp INTEGER NOT NULL)";

pub const FILENAMES_DDL: &str = "CREATE VIRTUAL TABLE filenames USING fts5(maskedFilename)";

pub const FILES_DDL: &str = "CREATE TABLE files (maskedFilename TEXT PRIMARY KEY, originalFilename TEXT NOT NULL, size BIGINT NOT NULL, touchedAt TEXT NOT NULL, code INTEGER DEFAULT 1 NOT NULL, extension TEXT, attributeJson TEXT NOT NULL, timestamp INTEGER NOT NULL)";

/// Table name and the exact DDL the catalog must report for it.
const SCHEMA: [(&str, &str); 3] = [
    ("directories", DIRECTORIES_DDL),
    ("filenames", FILENAMES_DDL),
    ("files", FILES_DDL),
];

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);
const BACKUP_PAGES_PER_STEP: i32 = 256;
const BACKUP_PAUSE: Duration = Duration::from_millis(10);

const UPSERT_DIRECTORY: &str = "INSERT INTO directories (name, timestamp) VALUES (?1, ?2) \
     ON CONFLICT(name) DO UPDATE SET timestamp = excluded.timestamp";

const UPSERT_FILE: &str = "INSERT INTO files (maskedFilename, originalFilename, size, touchedAt, code, extension, attributeJson, timestamp) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
     ON CONFLICT(maskedFilename) DO UPDATE SET \
     originalFilename = excluded.originalFilename, size = excluded.size, touchedAt = excluded.touchedAt, \
     code = excluded.code, extension = excluded.extension, attributeJson = excluded.attributeJson, \
     timestamp = excluded.timestamp";

const SELECT_FILES: &str = "SELECT f.maskedFilename, f.originalFilename, f.size, f.touchedAt, f.code, f.extension, f.attributeJson, f.timestamp \
     FROM files f \
     WHERE ?1 IS NULL OR substr(f.maskedFilename, 1, length(?1)) = ?1 \
     ORDER BY f.maskedFilename ASC";

const SEARCH_FILES: &str = "SELECT f.maskedFilename, f.originalFilename, f.size, f.touchedAt, f.code, f.extension, f.attributeJson, f.timestamp \
     FROM filenames JOIN files f ON f.maskedFilename = filenames.maskedFilename \
     WHERE filenames MATCH ?1 \
     ORDER BY f.maskedFilename ASC";

/// Match-all left operand: every file the exclusion group does not match.
const SEARCH_FILES_EXCEPT: &str = "SELECT f.maskedFilename, f.originalFilename, f.size, f.touchedAt, f.code, f.extension, f.attributeJson, f.timestamp \
     FROM files f \
     WHERE f.maskedFilename NOT IN (SELECT maskedFilename FROM filenames WHERE filenames MATCH ?1) \
     ORDER BY f.maskedFilename ASC";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStats {
    pub directories: usize,
    pub files: usize,
    pub total_bytes: u64,
}

/// A `files` row before its text columns are decoded.
struct FileRow {
    masked: String,
    original: String,
    size: u64,
    touched_at: String,
    code: i32,
    extension: Option<String>,
    attributes: String,
    timestamp: i64,
}

impl FileRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            masked: row.get(0)?,
            original: row.get(1)?,
            size: row.get(2)?,
            touched_at: row.get(3)?,
            code: row.get(4)?,
            extension: row.get(5)?,
            attributes: row.get(6)?,
            timestamp: row.get(7)?,
        })
    }

    fn decode(self) -> Result<SharedFile> {
        let attributes: Vec<FileAttribute> =
            serde_json::from_str(&self.attributes).map_err(|source| Error::Attributes {
                masked: self.masked.clone(),
                source,
            })?;
        let touched_at = DateTime::parse_from_rfc3339(&self.touched_at)
            .map_err(|source| Error::Timestamp {
                masked: self.masked.clone(),
                source,
            })?
            .with_timezone(&Utc);

        Ok(SharedFile {
            masked_filename: self.masked,
            original_filename: self.original,
            touched_at,
            timestamp: self.timestamp,
            metadata: FileMetadata {
                size: self.size,
                code: self.code,
                extension: self.extension.unwrap_or_default(),
                attributes,
            },
        })
    }
}

// ============================================================================
// Repository
// ============================================================================

pub struct Repository {
    path: PathBuf,
    separator: char,
    /// Writers hold this shared; backup and restore hold it exclusively.
    maintenance: RwLock<()>,
    span: Span,
}

impl Repository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            separator: DEFAULT_SEPARATOR,
            maintenance: RwLock::new(()),
            span: info_span!("repository"),
        }
    }

    pub fn with_separator(mut self, separator: char) -> Self {
        self.separator = separator;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    /// Create any missing tables, dropping all three first when `discard_existing`.
    pub fn create(&self, discard_existing: bool) -> Result<()> {
        let _write = self.maintenance.read();
        let conn = self.connect()?;

        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
        "#,
        )?;

        if discard_existing {
            conn.execute_batch(
                r#"
                DROP TABLE IF EXISTS directories;
                DROP TABLE IF EXISTS filenames;
                DROP TABLE IF EXISTS files;
            "#,
            )?;
        }

        for (name, ddl) in SCHEMA {
            if !table_exists(&conn, name)? {
                conn.execute(ddl, [])?;
            }
        }

        info!(parent: &self.span, path = %self.path.display(), discard_existing, "Share repository ready");
        Ok(())
    }

    /// Whether the catalog holds exactly the expected DDL for all three tables.
    pub fn validate(&self, conn: &Connection) -> bool {
        let found = conn
            .prepare(
                "SELECT name, sql FROM sqlite_master \
                 WHERE type = 'table' AND name IN ('directories', 'filenames', 'files')",
            )
            .and_then(|mut stmt| {
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            });

        let found = match found {
            Ok(found) => found,
            Err(e) => {
                warn!(parent: &self.span, "Unable to read schema catalog: {}", e);
                return false;
            }
        };

        if found.len() != SCHEMA.len() {
            debug!(parent: &self.span, tables = found.len(), "Schema table count mismatch");
            return false;
        }

        SCHEMA.iter().all(|&(name, ddl)| {
            let matches = found
                .iter()
                .any(|(table, sql)| table.as_str() == name && sql.as_deref() == Some(ddl));
            if !matches {
                debug!(parent: &self.span, table = name, "Schema DDL mismatch");
            }
            matches
        })
    }

    /// Open the database and [`validate`](Self::validate) it. Open failures count as invalid.
    pub fn is_valid(&self) -> bool {
        match self.connect() {
            Ok(conn) => self.validate(&conn),
            Err(e) => {
                warn!(parent: &self.span, "Unable to open share repository: {}", e);
                false
            }
        }
    }

    pub fn insert_directory(&self, name: &str, timestamp: i64) -> Result<()> {
        let _write = self.maintenance.read();
        let conn = self.connect()?;
        conn.execute(UPSERT_DIRECTORY, params![name, timestamp])?;
        Ok(())
    }

    pub fn insert_file(
        &self,
        masked: &str,
        original: &str,
        touched_at: DateTime<Utc>,
        metadata: &FileMetadata,
        timestamp: i64,
    ) -> Result<()> {
        let _write = self.maintenance.read();
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        write_file(&tx, masked, original, touched_at, metadata, timestamp)?;
        tx.commit()?;
        Ok(())
    }

    /// Upsert a whole scan in one transaction. Returns `(directories, files)` written.
    pub fn insert_scan(&self, scan: &ScanResult) -> Result<(usize, usize)> {
        let _write = self.maintenance.read();
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;

        for name in &scan.directories {
            tx.prepare_cached(UPSERT_DIRECTORY)?
                .execute(params![name, scan.generation])?;
        }
        for file in scan.files.values() {
            write_file(
                &tx,
                &file.masked_filename,
                &file.original_filename,
                file.touched_at,
                &file.metadata,
                scan.generation,
            )?;
        }
        tx.commit()?;

        info!(
            parent: &self.span,
            directories = scan.directories.len(),
            files = scan.files.len(),
            generation = scan.generation,
            "Persisted scan"
        );
        Ok((scan.directories.len(), scan.files.len()))
    }

    /// Delete directories last seen before `older_than`.
    pub fn prune_directories(&self, older_than: i64) -> Result<usize> {
        let _write = self.maintenance.read();
        let conn = self.connect()?;
        let pruned = conn.execute(
            "DELETE FROM directories WHERE timestamp < ?1",
            params![older_than],
        )?;
        info!(parent: &self.span, pruned, older_than, "Pruned stale directories");
        Ok(pruned)
    }

    /// Delete files last seen before `older_than`, along with their index rows.
    pub fn prune_files(&self, older_than: i64) -> Result<usize> {
        let _write = self.maintenance.read();
        let mut conn = self.connect()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM filenames WHERE rowid IN (SELECT rowid FROM files WHERE timestamp < ?1)",
            params![older_than],
        )?;
        let pruned = tx.execute("DELETE FROM files WHERE timestamp < ?1", params![older_than])?;
        tx.commit()?;
        info!(parent: &self.span, pruned, older_than, "Pruned stale files");
        Ok(pruned)
    }

    /// Local path behind a masked filename.
    pub fn find_filename(&self, masked: &str) -> Result<Option<String>> {
        let conn = self.connect()?;
        let original = conn
            .query_row(
                "SELECT originalFilename FROM files WHERE maskedFilename = ?1",
                params![masked],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        if original.is_none() {
            debug!(parent: &self.span, masked, "No shared file for masked filename");
        }
        Ok(original)
    }

    pub fn list_directories(&self, prefix: Option<&str>) -> Result<Vec<SharedDirectory>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT name, timestamp FROM directories \
             WHERE ?1 IS NULL OR substr(name, 1, length(?1)) = ?1 \
             ORDER BY name ASC",
        )?;
        let directories = stmt
            .query_map(params![prefix], |row| {
                Ok(SharedDirectory {
                    name: row.get(0)?,
                    timestamp: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(directories)
    }

    /// Listing entries for files under `prefix`, named by basename unless
    /// `include_full_path`.
    pub fn list_files(&self, prefix: Option<&str>, include_full_path: bool) -> Result<Vec<FileEntry>> {
        let entries = self
            .shared_files(prefix)?
            .into_iter()
            .map(|file| {
                if include_full_path {
                    FileEntry {
                        filename: file.masked_filename,
                        metadata: file.metadata,
                    }
                } else {
                    file.entry(self.separator)
                }
            })
            .collect();
        Ok(entries)
    }

    /// Full records for files under `prefix`, ordered by masked filename.
    pub fn shared_files(&self, prefix: Option<&str>) -> Result<Vec<SharedFile>> {
        let conn = self.connect()?;
        query_files(&conn, SELECT_FILES, params![prefix])
    }

    pub fn count_directories(&self, prefix: Option<&str>) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM directories WHERE ?1 IS NULL OR substr(name, 1, length(?1)) = ?1",
            params![prefix],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_files(&self, prefix: Option<&str>) -> Result<usize> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM files WHERE ?1 IS NULL OR substr(maskedFilename, 1, length(?1)) = ?1",
            params![prefix],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Files matching `query`, ordered by masked filename.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<SharedFile>> {
        let expr = query.compile();
        let (sql, pattern) = match (expr.to_fts(), expr.exclusion()) {
            (Some(fts), _) => (SEARCH_FILES, fts),
            (None, Some(exclusion)) => (SEARCH_FILES_EXCEPT, exclusion),
            (None, None) => {
                debug!(parent: &self.span, "Empty query, nothing to search");
                return Ok(Vec::new());
            }
        };

        let conn = self.connect()?;
        match query_files(&conn, sql, params![pattern]) {
            Ok(files) => {
                debug!(parent: &self.span, query = %expr, results = files.len(), "Searched share repository");
                Ok(files)
            }
            Err(Error::Storage(e)) if is_match_error(&e) => {
                warn!(parent: &self.span, query = %expr, "Search degraded to no results: {}", e);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    pub fn stats(&self) -> Result<RepositoryStats> {
        let conn = self.connect()?;
        let directories: i64 =
            conn.query_row("SELECT COUNT(*) FROM directories", [], |row| row.get(0))?;
        let (files, total_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM files",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(RepositoryStats {
            directories: directories as usize,
            files: files as usize,
            total_bytes: total_bytes as u64,
        })
    }

    /// Highest scan generation stored, if any.
    pub fn latest_generation(&self) -> Result<Option<i64>> {
        let conn = self.connect()?;
        let latest = conn.query_row(
            "SELECT MAX(timestamp) FROM (SELECT timestamp FROM files UNION ALL SELECT timestamp FROM directories)",
            [],
            |row| row.get::<_, Option<i64>>(0),
        )?;
        Ok(latest)
    }

    /// Copy the whole database to `target` with SQLite's online backup.
    pub fn backup_to(&self, target: &Path) -> Result<()> {
        let _exclusive = self.maintenance.write();
        let source = self.connect()?;
        let mut destination = Connection::open(target)?;
        copy_database(&source, &mut destination)?;
        info!(parent: &self.span, target = %target.display(), "Backed up share repository");
        Ok(())
    }

    /// Replace the whole database with the contents of `source`.
    pub fn restore_from(&self, source: &Path) -> Result<()> {
        let _exclusive = self.maintenance.write();
        let source_conn = Connection::open_with_flags(source, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let mut destination = self.connect()?;
        copy_database(&source_conn, &mut destination)?;
        info!(parent: &self.span, source = %source.display(), "Restored share repository");
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![name],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Upsert one file and replace its full-text row, which shares the file's rowid.
fn write_file(
    conn: &Connection,
    masked: &str,
    original: &str,
    touched_at: DateTime<Utc>,
    metadata: &FileMetadata,
    timestamp: i64,
) -> Result<()> {
    let attributes = serde_json::to_string(&metadata.attributes).map_err(|source| Error::Attributes {
        masked: masked.to_string(),
        source,
    })?;

    conn.prepare_cached(UPSERT_FILE)?.execute(params![
        masked,
        original,
        metadata.size,
        touched_at.to_rfc3339(),
        metadata.code,
        metadata.extension,
        attributes,
        timestamp,
    ])?;

    let rowid: i64 = conn
        .prepare_cached("SELECT rowid FROM files WHERE maskedFilename = ?1")?
        .query_row(params![masked], |row| row.get(0))?;
    conn.prepare_cached("DELETE FROM filenames WHERE rowid = ?1")?
        .execute(params![rowid])?;
    conn.prepare_cached("INSERT INTO filenames (rowid, maskedFilename) VALUES (?1, ?2)")?
        .execute(params![rowid, masked])?;
    Ok(())
}

fn query_files<P: Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<SharedFile>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, FileRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(FileRow::decode).collect()
}

/// Whether SQLite rejected a full-text `MATCH` expression.
fn is_match_error(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(_, Some(message)) => {
            message.starts_with("fts5:") || message.contains("MATCH")
        }
        _ => false,
    }
}

fn copy_database(source: &Connection, destination: &mut Connection) -> Result<()> {
    let backup = Backup::new(source, destination)?;
    backup.run_to_completion(BACKUP_PAGES_PER_STEP, BACKUP_PAUSE, None)?;
    Ok(())
}

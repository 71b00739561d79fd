//! Durable per-box bookkeeping: known sources and in-flight backend jobs.
//!
//! The catalog lives in `<box>/box.db`. Its schema version is stamped into the
//! `settings` table on creation and checked on every open; a mismatch is a
//! hard error rather than a migration.

use std::path::{Path, PathBuf};

use log::debug;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};

use crate::Result;

pub const CATALOG_FILE: &str = "box.db";
pub const SCHEMA_VERSION: &str = "1";

const SCHEMA_KEY: &str = "schema";

const CREATE_SETTINGS: &str = "CREATE TABLE IF NOT EXISTS settings (
    key TEXT UNIQUE NOT NULL,
    value TEXT
)";

const CREATE_SOURCES: &str = "CREATE TABLE IF NOT EXISTS sources (
    name TEXT UNIQUE NOT NULL,
    comment TEXT,
    size INTEGER NOT NULL,
    data_key TEXT NOT NULL,
    meta_key TEXT NOT NULL
)";

const CREATE_JOBS: &str = "CREATE TABLE IF NOT EXISTS jobs (
    name TEXT UNIQUE NOT NULL,
    key TEXT NOT NULL
)";

/// A logical object stored in a box as an encrypted data/metadata pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub comment: Option<String>,
    /// Size of the encrypted data archive in bytes.
    pub size: u64,
    pub data_key: String,
    pub meta_key: String,
}

impl Source {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let size: i64 = row.get(2)?;
        Ok(Self {
            name: row.get(0)?,
            comment: row.get(1)?,
            size: size.max(0) as u64,
            data_key: row.get(3)?,
            meta_key: row.get(4)?,
        })
    }
}

pub struct Catalog {
    conn: Connection,
    path: PathBuf,
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl Catalog {
    /// Opens (or creates) the catalog inside `box_dir`.
    pub fn open(box_dir: &Path) -> Result<Self> {
        let path = box_dir.join(CATALOG_FILE);
        let conn = Connection::open(&path)?;
        let catalog = Self { conn, path };
        catalog.ensure_schema()?;
        Ok(catalog)
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn.execute(CREATE_SETTINGS, [])?;
        let schema: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![SCHEMA_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match schema.flatten() {
            None => {
                debug!("Creating catalog tables in {}", self.path.display());
                self.conn.execute_batch(&format!(
                    "BEGIN;
                     {CREATE_SOURCES};
                     {CREATE_JOBS};
                     INSERT OR REPLACE INTO settings (key, value) VALUES ('{SCHEMA_KEY}', '{SCHEMA_VERSION}');
                     COMMIT;"
                ))?;
                Ok(())
            }
            Some(version) if version == SCHEMA_VERSION => Ok(()),
            Some(version) => Err(crate::icebox_error!(SchemaMismatch {
                found: version,
                expected: SCHEMA_VERSION.to_string(),
            })),
        }
    }

    pub fn load_source(&self, name: &str) -> Result<Option<Source>> {
        Ok(self
            .conn
            .query_row(
                "SELECT name, comment, size, data_key, meta_key FROM sources WHERE name = ?1",
                params![name],
                Source::from_row,
            )
            .optional()?)
    }

    /// All sources, ordered by name ignoring case.
    pub fn load_all_sources(&self) -> Result<Vec<Source>> {
        let mut stmt = self.conn.prepare(
            "SELECT name, comment, size, data_key, meta_key FROM sources
             ORDER BY name COLLATE NOCASE",
        )?;
        let sources = stmt
            .query_map([], Source::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sources)
    }

    pub fn save_source(&self, source: &Source) -> Result<()> {
        let size = i64::try_from(source.size).map_err(|_| {
            crate::icebox_error!(InvalidParameter {
                description: format!("Source size {} is out of range", source.size),
            })
        })?;
        self.conn
            .execute(
                "INSERT INTO sources (name, comment, size, data_key, meta_key)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    source.name,
                    source.comment,
                    size,
                    source.data_key,
                    source.meta_key
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    crate::icebox_error!(SourceExists {
                        name: source.name.clone(),
                    })
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    pub fn delete_source(&self, name: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM sources WHERE name = ?1", params![name])?;
        Ok(())
    }

    pub fn load_job(&self, name: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT key FROM jobs WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn save_job(&self, name: &str, key: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO jobs (name, key) VALUES (?1, ?2)",
                params![name, key],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    crate::icebox_error!(JobExists {
                        operation: name.to_string(),
                    })
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    pub fn delete_job(&self, name: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM jobs WHERE name = ?1", params![name])?;
        Ok(())
    }
}

//! Key-value persistence medium.
//!
//! The location store and the order registry each own one key and read or
//! write the whole serialized collection under it. No partial or range
//! queries are assumed, so any string-keyed store can stand in.
//!
//! Two implementations are provided:
//! - [`SqliteMedium`], a durable `SQLite` database (used by the binary)
//! - [`MemoryMedium`], a process-local map (used by tests)

pub mod migrations;
pub mod schema;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// A string-keyed store of whole values.
pub trait Medium: Send + Sync + std::fmt::Debug {
    /// Read the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove `key`. Returns `true` if it existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying store cannot be written.
    fn remove(&self, key: &str) -> Result<bool>;
}

/// `SQLite`-backed medium.
#[derive(Debug)]
pub struct SqliteMedium {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Mutex<Connection>,
}

impl SqliteMedium {
    /// Open or create a database at the given path.
    ///
    /// Creates the parent directories and database file if they don't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        migrations::initialize_schema(&conn)?;

        info!("Database opened successfully at {}", path.display());
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory database, mostly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;

        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn: Mutex::new(conn),
        })
    }

    /// Get the path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the database file in bytes (0 for in-memory databases).
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("database connection lock poisoned"))
    }
}

impl Medium for SqliteMedium {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self
            .conn()?
            .query_row("SELECT value FROM entries WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.conn()?.execute(
            r"
            INSERT INTO entries (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            ",
            params![key, value],
        )?;
        debug!("Wrote {} bytes under key {}", value.len(), key);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()?
            .execute("DELETE FROM entries WHERE key = ?1", [key])?;
        Ok(affected > 0)
    }
}

/// Process-local medium backed by a map.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryMedium {
    /// Create an empty medium.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, BTreeMap<String, String>>> {
        self.entries
            .lock()
            .map_err(|_| Error::internal("memory medium lock poisoned"))
    }
}

impl Medium for MemoryMedium {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        Ok(self.entries()?.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(medium: &dyn Medium) {
        assert_eq!(medium.get("a").unwrap(), None);

        medium.set("a", "[1]").unwrap();
        medium.set("b", "{}").unwrap();
        assert_eq!(medium.get("a").unwrap().as_deref(), Some("[1]"));

        medium.set("a", "[1,2]").unwrap();
        assert_eq!(medium.get("a").unwrap().as_deref(), Some("[1,2]"));

        assert_eq!(medium.get("b").unwrap().as_deref(), Some("{}"));

        assert!(medium.remove("a").unwrap());
        assert!(!medium.remove("a").unwrap());
        assert_eq!(medium.get("a").unwrap(), None);
    }

    #[test]
    fn test_memory_medium() {
        exercise(&MemoryMedium::new());
    }

    #[test]
    fn test_sqlite_medium_in_memory() {
        let medium = SqliteMedium::open_in_memory().unwrap();
        exercise(&medium);
        assert_eq!(medium.size_bytes(), 0);
        assert_eq!(medium.path(), Path::new(":memory:"));
    }

    #[test]
    fn test_sqlite_medium_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("geotrack.db");

        {
            let medium = SqliteMedium::open(&path).unwrap();
            medium.set("location_updates", "[]").unwrap();
        }

        let medium = SqliteMedium::open(&path).unwrap();
        assert_eq!(
            medium.get("location_updates").unwrap().as_deref(),
            Some("[]")
        );
        assert!(medium.size_bytes() > 0);
    }
}

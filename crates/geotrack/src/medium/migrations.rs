//! Schema versioning for the `SQLite` medium.

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result};

use super::schema::SCHEMA_STATEMENTS;

/// The current schema version.
pub const CURRENT_VERSION: i32 = 1;

/// Key used to store the schema version in the metadata table.
const VERSION_KEY: &str = "schema_version";

/// Create the tables if needed and check the stored schema version.
///
/// A fresh database is stamped with [`CURRENT_VERSION`]. A database written
/// by a newer release is refused rather than read with the wrong layout.
///
/// # Errors
///
/// Returns an error if table creation fails or the stored version is
/// unreadable or newer than supported.
pub fn initialize_schema(conn: &Connection) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        conn.execute(statement, [])?;
    }

    match get_schema_version(conn)? {
        None => set_schema_version(conn, CURRENT_VERSION),
        Some(version) if version > CURRENT_VERSION => Err(Error::DatabaseMigration {
            message: format!(
                "database schema version {version} is newer than supported version {CURRENT_VERSION}"
            ),
        }),
        Some(_) => Ok(()),
    }
}

/// The stored schema version, or `None` for a fresh database.
fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM metadata WHERE key = ?1",
            [VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    value
        .map(|value| {
            value.parse().map_err(|_| Error::DatabaseMigration {
                message: format!("invalid schema version: {value}"),
            })
        })
        .transpose()
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
        (VERSION_KEY, version.to_string()),
    )?;
    Ok(())
}

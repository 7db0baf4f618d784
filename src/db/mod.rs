// Database layer: the SQLite document store the crawler writes into, and the
// PostgreSQL relational store the transfer process replicates into.
//
// We use rusqlite with the "bundled" feature so there's no system SQLite
// dependency. The document store file lives wherever FOLLOWGRAPH_DB_PATH
// points (defaults to ./followgraph.db).

pub mod models;
pub mod queries;
pub mod schema;
pub mod sqlite;
pub mod traits;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use traits::{DocumentStore, RelationalStore, Subject, SubjectSource, TransferError};

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

/// Open (or create) the document store and create its tables.
///
/// Called by `followgraph init` and by any command that needs the store.
pub fn initialize(db_path: &str) -> Result<Connection> {
    // Create parent directories if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory for database: {}", db_path))?;
        }
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path))?;

    // WAL lets the crawler and the transfer process share the file
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    schema::create_tables(&conn)?;

    Ok(conn)
}

/// Open an existing document store (fails if it doesn't exist yet).
pub fn open(db_path: &str) -> Result<Connection> {
    if !Path::new(db_path).exists() {
        anyhow::bail!(
            "Database not found at {}. Run `followgraph init` first.",
            db_path
        );
    }

    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database at {}", db_path))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    Ok(conn)
}

/// Open the document store behind the `DocumentStore` trait.
pub fn open_store(db_path: &str) -> Result<Arc<dyn DocumentStore>> {
    let conn = open(db_path)?;
    Ok(Arc::new(sqlite::SqliteStore::new(conn)))
}

/// Connect to the relational store behind the `RelationalStore` trait.
#[cfg(feature = "postgres")]
pub async fn connect_postgres(database_url: &str) -> Result<Arc<dyn RelationalStore>> {
    let store = postgres::PgStore::connect(database_url, &crate::retry::Backoff::default()).await?;
    Ok(Arc::new(store))
}

// Database module

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use anyhow::Result;

use crate::constants::DB_BUSY_TIMEOUT_MS;

/// Open or create a database at the given path
pub fn open_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(db_path)?;

    // Several daemons share this file; wait for their write locks instead of failing fast
    conn.busy_timeout(Duration::from_millis(DB_BUSY_TIMEOUT_MS))?;

    // Enable WAL mode for better concurrency
    conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;

    // Run migrations
    migrations::run_migrations(&conn)?;

    Ok(conn)
}

/// Owned connection to the job store.
///
/// A connection that starts failing is not retried in place: the poll loop
/// calls [`Store::reset`] to drop it and open a fresh one.
pub struct Store {
    db_path: PathBuf,
    conn: Connection,
}

impl Store {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = open_db(db_path)?;
        Ok(Self {
            db_path: db_path.to_path_buf(),
            conn,
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Discard the current connection and open a new one.
    /// On failure the old handle is kept and the caller retries later.
    pub fn reset(&mut self) -> Result<()> {
        let fresh = open_db(&self.db_path)?;
        let stale = std::mem::replace(&mut self.conn, fresh);
        if let Err((_, e)) = stale.close() {
            log::warn!("Store: closing stale connection failed (ignored): {}", e);
        }
        log::info!("Store: reconnected to {}", self.db_path.display());
        Ok(())
    }
}

//! Snapshot metadata store.
//!
//! A single SQLite database file holds one row per snapshot. Writable
//! transactions share one connection and are serialized on it; read-only
//! transactions each open their own connection and run concurrently with the
//! writer under WAL.
//!
//! Every [`Transaction`] rolls back on drop unless it was committed, so an
//! early return through `?` never leaves a write half-applied.

pub mod storage;

use std::path::{Path, PathBuf};
use std::time::Duration;

use lvmsnap_common::{SnapError, SnapResult};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OpenFlags};

/// Current schema version, stored in `PRAGMA user_version`.
const SCHEMA_VERSION: i64 = 1;

/// How long a connection waits on a locked database.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// Ids are never reused so that a leaked volume can't collide with a new record.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS snapshots (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    key        TEXT NOT NULL UNIQUE,
    kind       TEXT NOT NULL CHECK (kind IN ('active', 'view', 'committed')),
    parent_id  INTEGER REFERENCES snapshots(id) ON DELETE RESTRICT,
    labels     TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    size       INTEGER NOT NULL DEFAULT 0,
    inodes     INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS snapshots_parent ON snapshots(parent_id);
";

/// Map a SQLite error into the snapshot error space.
pub(crate) fn from_rusqlite(err: rusqlite::Error) -> SnapError {
    SnapError::Store {
        message: err.to_string(),
    }
}

/// Handle on the metadata database.
#[derive(Debug)]
pub struct MetaStore {
    path: PathBuf,
    writer: Mutex<Connection>,
}

impl MetaStore {
    /// Open (creating if needed) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or was written by a newer schema.
    pub fn open(path: impl Into<PathBuf>) -> SnapResult<Self> {
        let path = path.into();
        let conn = Connection::open(&path).map_err(from_rusqlite)?;
        configure(&conn)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(from_rusqlite)?;
        migrate(&conn)?;

        tracing::debug!(path = %path.display(), journal = %mode, "Opened metadata store");
        Ok(Self {
            path,
            writer: Mutex::new(conn),
        })
    }

    /// Database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Begin a transaction.
    ///
    /// A writable transaction holds the writer until it ends.
    ///
    /// # Errors
    ///
    /// Fails if the database cannot be locked or a reader cannot be opened.
    pub fn transaction(&self, writable: bool) -> SnapResult<Transaction<'_>> {
        let handle = if writable {
            let guard = self.writer.lock();
            guard
                .execute_batch("BEGIN IMMEDIATE")
                .map_err(from_rusqlite)?;
            Handle::Writer(guard)
        } else {
            let conn = Connection::open_with_flags(
                &self.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )
            .map_err(from_rusqlite)?;
            configure(&conn)?;
            conn.execute_batch("BEGIN").map_err(from_rusqlite)?;
            Handle::Reader(conn)
        };

        Ok(Transaction {
            handle,
            writable,
            finished: false,
        })
    }

    /// Close the database.
    ///
    /// # Errors
    ///
    /// Fails if SQLite cannot finalize the connection.
    pub fn close(self) -> SnapResult<()> {
        let path = self.path;
        self.writer
            .into_inner()
            .close()
            .map_err(|(_, err)| from_rusqlite(err))?;
        tracing::debug!(path = %path.display(), "Closed metadata store");
        Ok(())
    }
}

fn configure(conn: &Connection) -> SnapResult<()> {
    conn.busy_timeout(BUSY_TIMEOUT).map_err(from_rusqlite)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(from_rusqlite)?;
    Ok(())
}

fn migrate(conn: &Connection) -> SnapResult<()> {
    let version: i64 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(from_rusqlite)?;

    match version {
        0 => {
            conn.execute_batch(SCHEMA).map_err(from_rusqlite)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(from_rusqlite)?;
            tracing::info!(version = SCHEMA_VERSION, "Initialized metadata schema");
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        newer => Err(SnapError::Store {
            message: format!(
                "database schema version {newer} is newer than supported version {SCHEMA_VERSION}"
            ),
        }),
    }
}

#[derive(Debug)]
enum Handle<'a> {
    Writer(MutexGuard<'a, Connection>),
    Reader(Connection),
}

/// An open metadata transaction.
#[derive(Debug)]
pub struct Transaction<'a> {
    handle: Handle<'a>,
    writable: bool,
    finished: bool,
}

impl Transaction<'_> {
    /// Whether the transaction may write.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// Make the transaction's writes durable.
    ///
    /// On failure the transaction is still open and is rolled back on drop.
    ///
    /// # Errors
    ///
    /// Fails if SQLite refuses the commit.
    pub fn commit(mut self) -> SnapResult<()> {
        self.conn().execute_batch("COMMIT").map_err(from_rusqlite)?;
        self.finished = true;
        Ok(())
    }

    /// Discard the transaction's writes.
    ///
    /// # Errors
    ///
    /// Fails if SQLite refuses the rollback.
    pub fn rollback(mut self) -> SnapResult<()> {
        self.conn()
            .execute_batch("ROLLBACK")
            .map_err(from_rusqlite)?;
        self.finished = true;
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        match &self.handle {
            Handle::Writer(guard) => guard,
            Handle::Reader(conn) => conn,
        }
    }

    pub(crate) fn require_writable(&self) -> SnapResult<()> {
        if self.writable {
            Ok(())
        } else {
            Err(SnapError::FailedPrecondition {
                message: "transaction is read-only".to_string(),
            })
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.conn().execute_batch("ROLLBACK") {
            tracing::warn!(error = %err, "Failed to roll back metadata transaction");
        }
    }
}

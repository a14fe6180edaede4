//! Database connection management.
//!
//! The [`Database`] struct owns a single [`rusqlite::Connection`] behind a
//! mutex and guarantees that migrations are run before any other operation.
//! All access goes through [`Database::read`] or [`Database::write`], each of
//! which wraps the closure in one SQLite transaction. A closure that returns
//! an error rolls back everything it did.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use directories::ProjectDirs;
use rusqlite::{Connection, TransactionBehavior};

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Mutex<Connection>,
}

/// A handle valid for the duration of one transaction.
///
/// Typed CRUD helpers for every model are implemented on this type.
pub struct Txn<'c> {
    conn: &'c Connection,
}

impl<'c> Txn<'c> {
    /// Return the connection the transaction runs on.
    pub fn conn(&self) -> &'c Connection {
        self.conn
    }
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/fellowship/fellowship.db`
    /// - macOS:   `~/Library/Application Support/org.fellowship.fellowship/fellowship.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\fellowship\fellowship\data\fellowship.db`
    pub fn new() -> Result<Self> {
        let project_dirs =
            ProjectDirs::from("org", "fellowship", "fellowship").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        let db_path = data_dir.join("fellowship.db");

        tracing::info!(path = %db_path.display(), "opening database");

        Self::open_at(&db_path)
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;

        Self::init(conn)
    }

    /// Open a private in-memory database. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        // Run schema migrations.
        migrations::run_migrations(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run `f` inside a deferred (read) transaction.
    pub fn read<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Txn<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        self.run(TransactionBehavior::Deferred, f)
    }

    /// Run `f` inside an immediate (write) transaction. The write lock is
    /// taken up front so the facts `f` reads cannot change before it writes.
    pub fn write<T, E, F>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Txn<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        self.run(TransactionBehavior::Immediate, f)
    }

    fn run<T, E, F>(&self, behavior: TransactionBehavior, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&Txn<'_>) -> std::result::Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(behavior)
            .map_err(StoreError::from)?;

        // Dropping `tx` without commit rolls back.
        let out = f(&Txn { conn: &*tx })?;

        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.lock()
            .ok()
            .and_then(|c| c.path().filter(|p| !p.is_empty()).map(PathBuf::from))
    }
}

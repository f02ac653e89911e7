//! Durable SQLite store shared by the ledger, graph, path index, and
//! reconciliation engine
//!
//! One store handle is opened at account activation and passed explicitly
//! into every component; there is no global instance. Check-then-write
//! sequences run inside a single transaction on a pooled connection.

mod schema;

use std::path::{Path, PathBuf};

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::info;
use uuid::Uuid;

use crate::error::LedgerError;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Handle to the durable store
#[derive(Clone)]
pub struct Store {
    pool: DbPool,
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, LedgerError> {
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().max_size(5).build(manager)?;
        let store = Self { pool };
        store.initialize()?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self, LedgerError> {
        let manager = SqliteConnectionManager::memory();
        // A single connection so every component sees the same memory DB.
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = Self { pool };
        store.initialize()?;
        Ok(store)
    }

    /// Default on-disk location for the ledger database.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sync-ledger")
            .join("ledger.db")
    }

    /// Mint a temporary client-side server id for an object created while
    /// offline; reconciliation rewrites it once the server assigns a real one.
    pub fn new_client_server_id() -> String {
        format!("tmp-{}", Uuid::new_v4())
    }

    pub(crate) fn connection(&self) -> Result<DbConnection, LedgerError> {
        self.pool.get().map_err(LedgerError::from)
    }

    fn initialize(&self) -> Result<(), LedgerError> {
        let conn = self.connection()?;
        schema::initialize_schema(&conn)
    }

    /// Account teardown: drop every pending, edge, path node, and cached
    /// object belonging to the account. The only way path nodes are deleted.
    pub fn reset_account(&self, account_id: &str) -> Result<(), LedgerError> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM pend_deps WHERE pred_id IN (SELECT id FROM pendings WHERE account_id = ?1)
             OR succ_id IN (SELECT id FROM pendings WHERE account_id = ?1)",
            params![account_id],
        )?;
        tx.execute("DELETE FROM pendings WHERE account_id = ?1", params![account_id])?;
        tx.execute("DELETE FROM paths WHERE account_id = ?1", params![account_id])?;
        tx.execute("DELETE FROM folders WHERE account_id = ?1", params![account_id])?;
        tx.execute("DELETE FROM items WHERE account_id = ?1", params![account_id])?;
        tx.commit()?;
        info!(account_id, "Account state reset");
        Ok(())
    }
}

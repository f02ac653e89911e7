use rusqlite::Connection;

use crate::error::LedgerError;

pub fn initialize_schema(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute_batch(
        r#"
        PRAGMA foreign_keys = ON;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        -- Pending operations: the durable queue of not-yet-confirmed mutations
        CREATE TABLE IF NOT EXISTS pendings (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id          TEXT NOT NULL,
            token               TEXT NOT NULL UNIQUE,   -- caller correlation handle (UUID)
            capability          TEXT NOT NULL,          -- dispatch queue
            op_name             TEXT NOT NULL,
            operation           TEXT NOT NULL,          -- JSON Operation
            server_id           TEXT NOT NULL CHECK (server_id != ''),
            parent_id           TEXT,
            dest_parent_id      TEXT,
            client_id           TEXT,
            display_name        TEXT,
            state               TEXT NOT NULL DEFAULT 'eligible',
            deferred_reason     TEXT,                   -- until_time | until_sync | until_fsync | until_fsync_then_sync | until_fmetadata
            deferred_until      TEXT,                   -- RFC 3339, for until_time
            deferred_folder_id  TEXT,                   -- target folder, for until_fmetadata
            defer_count         INTEGER NOT NULL DEFAULT 0,
            block_reason        TEXT,
            result              TEXT,                   -- JSON StatusResult, set on terminal failure
            delay_not_allowed   INTEGER NOT NULL DEFAULT 0,
            priority_stamp      INTEGER NOT NULL DEFAULT 0,
            item_id             TEXT,                   -- back-reference to a locally created object
            created_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_pendings_account_state ON pendings(account_id, state);
        CREATE INDEX IF NOT EXISTS idx_pendings_server        ON pendings(account_id, server_id);

        -- Dependency edges: predecessor must resolve before successor runs
        CREATE TABLE IF NOT EXISTS pend_deps (
            pred_id INTEGER NOT NULL,
            succ_id INTEGER NOT NULL,
            PRIMARY KEY (pred_id, succ_id)
        );

        CREATE INDEX IF NOT EXISTS idx_pend_deps_succ ON pend_deps(succ_id);

        -- Path index: confirmed parent/child topology, kept separate from the
        -- live folder/item cache so dominance queries stay stable mid-reconcile
        CREATE TABLE IF NOT EXISTS paths (
            account_id TEXT NOT NULL,
            server_id  TEXT NOT NULL,
            parent_id  TEXT NOT NULL,
            PRIMARY KEY (account_id, server_id)
        );

        CREATE INDEX IF NOT EXISTS idx_paths_parent ON paths(account_id, parent_id);

        -- Local object cache mutated by reconciliation
        CREATE TABLE IF NOT EXISTS folders (
            account_id   TEXT NOT NULL,
            server_id    TEXT NOT NULL,
            parent_id    TEXT NOT NULL,
            display_name TEXT NOT NULL,
            kind         TEXT NOT NULL,   -- generic | calendar | contact | task
            client_owned INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (account_id, server_id)
        );

        CREATE TABLE IF NOT EXISTS items (
            account_id TEXT NOT NULL,
            server_id  TEXT NOT NULL,
            parent_id  TEXT NOT NULL,
            kind       TEXT NOT NULL,     -- email | calendar | contact | task
            PRIMARY KEY (account_id, server_id)
        );

        CREATE INDEX IF NOT EXISTS idx_items_parent ON items(account_id, parent_id);
        "#,
    )?;

    Ok(())
}

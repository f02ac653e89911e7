//! Path index: confirmed remote topology for dominance queries
//!
//! A lightweight forest of (server_id, parent_id) nodes per account, updated
//! only when the server confirms a parent/child relationship. It is kept
//! apart from the live folder/item cache so `dominates` answers stay correct
//! even while a reconciliation pass is rewriting the live tree.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::LedgerError;
use crate::store::Store;

/// Parent chains deeper than this indicate a corrupt index.
const MAX_DEPTH: usize = 256;

pub struct PathIndex {
    store: Store,
}

impl PathIndex {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Record a server-confirmed parent for an object, replacing any earlier
    /// record for the same object.
    pub fn record_confirmed_parent(
        &self,
        account_id: &str,
        server_id: &str,
        parent_id: &str,
    ) -> Result<(), LedgerError> {
        let conn = self.store.connection()?;
        record_tx(&conn, account_id, server_id, parent_id)
    }

    /// True iff `x == y` or `x` is a strict ancestor of `y`.
    pub fn dominates(&self, account_id: &str, x: &str, y: &str) -> Result<bool, LedgerError> {
        let conn = self.store.connection()?;
        dominates_tx(&conn, account_id, x, y)
    }
}

pub(crate) fn record_tx(
    conn: &Connection,
    account_id: &str,
    server_id: &str,
    parent_id: &str,
) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO paths (account_id, server_id, parent_id) VALUES (?1, ?2, ?3)
         ON CONFLICT (account_id, server_id) DO UPDATE SET parent_id = excluded.parent_id",
        params![account_id, server_id, parent_id],
    )?;
    Ok(())
}

pub(crate) fn dominates_tx(
    conn: &Connection,
    account_id: &str,
    x: &str,
    y: &str,
) -> Result<bool, LedgerError> {
    if x.is_empty() || y.is_empty() {
        return Ok(false);
    }
    if x == y {
        return Ok(true);
    }
    let mut current = y.to_string();
    for _ in 0..MAX_DEPTH {
        let parent: Option<String> = conn
            .query_row(
                "SELECT parent_id FROM paths WHERE account_id = ?1 AND server_id = ?2",
                params![account_id, &current],
                |row| row.get(0),
            )
            .optional()?;
        match parent {
            Some(parent) if parent == x => return Ok(true),
            Some(parent) if parent == current => return Ok(false), // self-loop guard
            Some(parent) => current = parent,
            None => return Ok(false),
        }
    }
    Ok(false)
}

/// Every node in the subtree rooted at `root`, root included, in
/// parent-before-child order.
pub(crate) fn subtree_tx(
    conn: &Connection,
    account_id: &str,
    root: &str,
) -> Result<Vec<String>, LedgerError> {
    let mut result = vec![root.to_string()];
    let mut frontier = vec![root.to_string()];
    while let Some(current) = frontier.pop() {
        let mut stmt = conn.prepare(
            "SELECT server_id FROM paths WHERE account_id = ?1 AND parent_id = ?2",
        )?;
        let children = stmt
            .query_map(params![account_id, &current], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for child in children {
            if child != current && !result.contains(&child) {
                result.push(child.clone());
                frontier.push(child);
            }
        }
    }
    Ok(result)
}

pub(crate) fn delete_subtree_tx(
    conn: &Connection,
    account_id: &str,
    root: &str,
) -> Result<Vec<String>, LedgerError> {
    let members = subtree_tx(conn, account_id, root)?;
    for server_id in &members {
        conn.execute(
            "DELETE FROM paths WHERE account_id = ?1 AND server_id = ?2",
            params![account_id, server_id],
        )?;
    }
    Ok(members)
}

pub(crate) fn rewrite_server_id_tx(
    conn: &Connection,
    account_id: &str,
    old: &str,
    new: &str,
) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE OR REPLACE paths SET server_id = ?3 WHERE account_id = ?1 AND server_id = ?2",
        params![account_id, old, new],
    )?;
    conn.execute(
        "UPDATE paths SET parent_id = ?3 WHERE account_id = ?1 AND parent_id = ?2",
        params![account_id, old, new],
    )?;
    Ok(())
}

//! Local folder/item cache
//!
//! The reconciliation engine's view of what exists locally. Rows are written
//! when callers create objects offline and when inbound server deltas are
//! applied. The cache carries just enough shape (parent, name, kind) for the
//! conflict rules; full message/event payloads live outside this core.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::LedgerError;
use crate::op::ItemKind;
use crate::path_index;
use crate::store::Store;

/// Server id of the per-account client-owned lost-and-found container.
pub const LOST_AND_FOUND_ID: &str = "LAF";

/// Remote root folder id.
pub const ROOT_ID: &str = "0";

/// Folder flavors the remote store distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderKind {
    Generic,
    Calendar,
    Contact,
    Task,
}

impl FolderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FolderKind::Generic => "generic",
            FolderKind::Calendar => "calendar",
            FolderKind::Contact => "contact",
            FolderKind::Task => "task",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "calendar" => FolderKind::Calendar,
            "contact" => FolderKind::Contact,
            "task" => FolderKind::Task,
            _ => FolderKind::Generic,
        }
    }
}

impl ItemKind {
    pub(crate) fn as_db_str(self) -> &'static str {
        match self {
            ItemKind::Email => "email",
            ItemKind::Calendar => "calendar",
            ItemKind::Contact => "contact",
            ItemKind::Task => "task",
        }
    }

    pub(crate) fn parse_db_str(s: &str) -> Self {
        match s {
            "calendar" => ItemKind::Calendar,
            "contact" => ItemKind::Contact,
            "task" => ItemKind::Task,
            _ => ItemKind::Email,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderRecord {
    pub account_id: String,
    pub server_id: String,
    pub parent_id: String,
    pub display_name: String,
    pub kind: FolderKind,
    pub client_owned: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRecord {
    pub account_id: String,
    pub server_id: String,
    pub parent_id: String,
    pub kind: ItemKind,
}

/// Cache access for callers; reconciliation uses the `_tx` functions below
/// inside its own transactions.
pub struct ObjectStore {
    store: Store,
}

impl ObjectStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn upsert_folder(&self, folder: &FolderRecord) -> Result<(), LedgerError> {
        let conn = self.store.connection()?;
        upsert_folder_tx(&conn, folder)
    }

    pub fn get_folder(
        &self,
        account_id: &str,
        server_id: &str,
    ) -> Result<Option<FolderRecord>, LedgerError> {
        let conn = self.store.connection()?;
        get_folder_tx(&conn, account_id, server_id)
    }

    pub fn upsert_item(&self, item: &ItemRecord) -> Result<(), LedgerError> {
        let conn = self.store.connection()?;
        conn.execute(
            "INSERT INTO items (account_id, server_id, parent_id, kind) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (account_id, server_id)
             DO UPDATE SET parent_id = excluded.parent_id, kind = excluded.kind",
            params![item.account_id, item.server_id, item.parent_id, item.kind.as_db_str()],
        )?;
        Ok(())
    }

    pub fn get_item(
        &self,
        account_id: &str,
        server_id: &str,
    ) -> Result<Option<ItemRecord>, LedgerError> {
        let conn = self.store.connection()?;
        get_item_tx(&conn, account_id, server_id)
    }
}

fn map_folder(row: &Row<'_>) -> rusqlite::Result<FolderRecord> {
    Ok(FolderRecord {
        account_id: row.get(0)?,
        server_id: row.get(1)?,
        parent_id: row.get(2)?,
        display_name: row.get(3)?,
        kind: FolderKind::parse(&row.get::<_, String>(4)?),
        client_owned: row.get::<_, i64>(5)? != 0,
    })
}

pub(crate) fn get_folder_tx(
    conn: &Connection,
    account_id: &str,
    server_id: &str,
) -> Result<Option<FolderRecord>, LedgerError> {
    conn.query_row(
        "SELECT account_id, server_id, parent_id, display_name, kind, client_owned
         FROM folders WHERE account_id = ?1 AND server_id = ?2",
        params![account_id, server_id],
        map_folder,
    )
    .optional()
    .map_err(LedgerError::from)
}

pub(crate) fn upsert_folder_tx(conn: &Connection, folder: &FolderRecord) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO folders (account_id, server_id, parent_id, display_name, kind, client_owned)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT (account_id, server_id) DO UPDATE SET
             parent_id = excluded.parent_id,
             display_name = excluded.display_name,
             kind = excluded.kind",
        params![
            folder.account_id,
            folder.server_id,
            folder.parent_id,
            folder.display_name,
            folder.kind.as_str(),
            folder.client_owned as i64,
        ],
    )?;
    Ok(())
}

pub(crate) fn get_item_tx(
    conn: &Connection,
    account_id: &str,
    server_id: &str,
) -> Result<Option<ItemRecord>, LedgerError> {
    conn.query_row(
        "SELECT account_id, server_id, parent_id, kind FROM items
         WHERE account_id = ?1 AND server_id = ?2",
        params![account_id, server_id],
        |row| {
            Ok(ItemRecord {
                account_id: row.get(0)?,
                server_id: row.get(1)?,
                parent_id: row.get(2)?,
                kind: ItemKind::parse_db_str(&row.get::<_, String>(3)?),
            })
        },
    )
    .optional()
    .map_err(LedgerError::from)
}

pub(crate) fn upsert_item_tx(conn: &Connection, item: &ItemRecord) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO items (account_id, server_id, parent_id, kind) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (account_id, server_id)
         DO UPDATE SET parent_id = excluded.parent_id, kind = excluded.kind",
        params![item.account_id, item.server_id, item.parent_id, item.kind.as_db_str()],
    )?;
    Ok(())
}

/// Ensure the client-owned lost-and-found container exists and return its id.
pub(crate) fn ensure_lost_and_found_tx(
    conn: &Connection,
    account_id: &str,
) -> Result<String, LedgerError> {
    conn.execute(
        "INSERT OR IGNORE INTO folders
             (account_id, server_id, parent_id, display_name, kind, client_owned)
         VALUES (?1, ?2, ?3, 'Lost and Found', 'generic', 1)",
        params![account_id, LOST_AND_FOUND_ID, ROOT_ID],
    )?;
    Ok(LOST_AND_FOUND_ID.to_string())
}

/// Re-parent an item into the lost-and-found container. The path index is
/// not updated: the index records server-confirmed topology only, and the
/// lost-and-found is purely client-side.
pub(crate) fn move_item_to_lost_and_found_tx(
    conn: &Connection,
    account_id: &str,
    server_id: &str,
) -> Result<(), LedgerError> {
    let laf = ensure_lost_and_found_tx(conn, account_id)?;
    conn.execute(
        "UPDATE items SET parent_id = ?3 WHERE account_id = ?1 AND server_id = ?2",
        params![account_id, server_id, laf],
    )?;
    conn.execute(
        "DELETE FROM paths WHERE account_id = ?1 AND server_id = ?2",
        params![account_id, server_id],
    )?;
    Ok(())
}

/// Delete a folder or item and, via the path index, everything beneath it.
/// Returns the deleted server ids.
pub(crate) fn delete_subtree_tx(
    conn: &Connection,
    account_id: &str,
    root: &str,
) -> Result<Vec<String>, LedgerError> {
    let members = path_index::delete_subtree_tx(conn, account_id, root)?;
    for server_id in &members {
        conn.execute(
            "DELETE FROM folders WHERE account_id = ?1 AND server_id = ?2",
            params![account_id, server_id],
        )?;
        conn.execute(
            "DELETE FROM items WHERE account_id = ?1 AND server_id = ?2",
            params![account_id, server_id],
        )?;
        // Items linked under a deleted folder but absent from the path index.
        conn.execute(
            "DELETE FROM items WHERE account_id = ?1 AND parent_id = ?2",
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
        "UPDATE OR REPLACE folders SET server_id = ?3 WHERE account_id = ?1 AND server_id = ?2",
        params![account_id, old, new],
    )?;
    conn.execute(
        "UPDATE folders SET parent_id = ?3 WHERE account_id = ?1 AND parent_id = ?2",
        params![account_id, old, new],
    )?;
    conn.execute(
        "UPDATE OR REPLACE items SET server_id = ?3 WHERE account_id = ?1 AND server_id = ?2",
        params![account_id, old, new],
    )?;
    conn.execute(
        "UPDATE items SET parent_id = ?3 WHERE account_id = ?1 AND parent_id = ?2",
        params![account_id, old, new],
    )?;
    path_index::rewrite_server_id_tx(conn, account_id, old, new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path_index::PathIndex;

    #[test]
    fn folder_upsert_and_get() {
        let store = Store::in_memory().unwrap();
        let objects = ObjectStore::new(store);
        let folder = FolderRecord {
            account_id: "acct".into(),
            server_id: "1".into(),
            parent_id: ROOT_ID.into(),
            display_name: "Projects".into(),
            kind: FolderKind::Generic,
            client_owned: false,
        };
        objects.upsert_folder(&folder).unwrap();

        let found = objects.get_folder("acct", "1").unwrap().unwrap();
        assert_eq!(found.display_name, "Projects");

        objects
            .upsert_folder(&FolderRecord {
                display_name: "Projects 2".into(),
                ..folder
            })
            .unwrap();
        let found = objects.get_folder("acct", "1").unwrap().unwrap();
        assert_eq!(found.display_name, "Projects 2");
    }

    #[test]
    fn lost_and_found_is_created_once_and_holds_items() {
        let store = Store::in_memory().unwrap();
        let objects = ObjectStore::new(store.clone());
        objects
            .upsert_item(&ItemRecord {
                account_id: "acct".into(),
                server_id: "i1".into(),
                parent_id: "1".into(),
                kind: ItemKind::Calendar,
            })
            .unwrap();

        let conn = store.connection().unwrap();
        move_item_to_lost_and_found_tx(&conn, "acct", "i1").unwrap();
        move_item_to_lost_and_found_tx(&conn, "acct", "i1").unwrap();
        drop(conn);

        let item = objects.get_item("acct", "i1").unwrap().unwrap();
        assert_eq!(item.parent_id, LOST_AND_FOUND_ID);
        let laf = objects.get_folder("acct", LOST_AND_FOUND_ID).unwrap().unwrap();
        assert!(laf.client_owned);
    }

    #[test]
    fn subtree_delete_removes_folders_items_and_paths() {
        let store = Store::in_memory().unwrap();
        let objects = ObjectStore::new(store.clone());
        let index = PathIndex::new(store.clone());

        for (id, parent) in [("1", "0"), ("2", "1")] {
            objects
                .upsert_folder(&FolderRecord {
                    account_id: "acct".into(),
                    server_id: id.into(),
                    parent_id: parent.into(),
                    display_name: format!("f{id}"),
                    kind: FolderKind::Generic,
                    client_owned: false,
                })
                .unwrap();
            index.record_confirmed_parent("acct", id, parent).unwrap();
        }
        objects
            .upsert_item(&ItemRecord {
                account_id: "acct".into(),
                server_id: "i1".into(),
                parent_id: "2".into(),
                kind: ItemKind::Email,
            })
            .unwrap();
        index.record_confirmed_parent("acct", "i1", "2").unwrap();

        let conn = store.connection().unwrap();
        let mut deleted = delete_subtree_tx(&conn, "acct", "1").unwrap();
        drop(conn);
        deleted.sort();
        assert_eq!(deleted, vec!["1", "2", "i1"]);
        assert!(objects.get_folder("acct", "2").unwrap().is_none());
        assert!(objects.get_item("acct", "i1").unwrap().is_none());
        assert!(!index.dominates("acct", "1", "2").unwrap());
    }
}

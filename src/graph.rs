//! Dependency graph over pending operations
//!
//! Edges are computed once, at insertion time, against every other
//! unresolved operation for the account, and are removed only when their
//! predecessor resolves. A successor becomes eligible when its last edge is
//! removed with a proceed outcome; a fail outcome fails the successor
//! immediately and cascades to its own successors.

use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::LedgerError;
use crate::op::{ItemKind, Operation};
use crate::status::{StatusResult, Why};

/// A successor failed because its predecessor failed; the ledger emits the
/// notification after the surrounding transaction commits.
#[derive(Debug)]
pub(crate) struct CascadeFailure {
    pub account_id: String,
    pub token: String,
    pub status: StatusResult,
}

struct Candidate {
    id: i64,
    operation: Operation,
    server_id: String,
    parent_id: Option<String>,
    dest_parent_id: Option<String>,
}

/// Ordering rules, evaluated for a new operation against every unresolved
/// operation on the same account. Any matching rule creates a predecessor
/// edge (existing -> new).
pub(crate) fn compute_predecessors(
    conn: &Connection,
    account_id: &str,
    operation: &Operation,
    server_id: &str,
    parent_id: Option<&str>,
    dest_parent_id: Option<&str>,
) -> Result<Vec<i64>, LedgerError> {
    let mut stmt = conn.prepare(
        "SELECT id, operation, server_id, parent_id, dest_parent_id
         FROM pendings WHERE account_id = ?1 AND state != 'failed'",
    )?;
    let candidates = stmt
        .query_map(params![account_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut preds = Vec::new();
    for (id, op_json, cand_server_id, cand_parent, cand_dest) in candidates {
        let candidate = Candidate {
            id,
            operation: serde_json::from_str(&op_json)?,
            server_id: cand_server_id,
            parent_id: cand_parent,
            dest_parent_id: cand_dest,
        };
        if blocks(&candidate, operation, server_id, parent_id, dest_parent_id) {
            preds.push(candidate.id);
        }
    }
    Ok(preds)
}

fn blocks(
    existing: &Candidate,
    new_op: &Operation,
    new_server_id: &str,
    new_parent_id: Option<&str>,
    new_dest_parent_id: Option<&str>,
) -> bool {
    // Concurrent folder deletes on an evolving tree are unsafe to interleave.
    if existing.operation == Operation::FolderDelete && *new_op == Operation::FolderDelete {
        return true;
    }

    // You cannot mutate what the server has not confirmed created yet.
    if existing.operation.is_create()
        && (new_op.is_create() || new_op.is_update_class())
        && existing.server_id == new_server_id
        && existing.operation.object_kind() == new_op.object_kind()
    {
        return true;
    }

    // A move/create into a destination that is itself an in-flight create
    // waits for the destination to become real. Email creates are not
    // containers, so only folder and calendar/contact/task creates qualify.
    if (new_op.is_create() || new_op.is_move()) && creates_container(&existing.operation) {
        let dest_hits = |id: Option<&str>| id == Some(existing.server_id.as_str());
        if dest_hits(new_parent_id) || dest_hits(new_dest_parent_id) {
            return true;
        }
    }

    // Folder updates serialize behind earlier updates/creates of the folder.
    if *new_op == Operation::FolderUpdate
        && matches!(existing.operation, Operation::FolderUpdate | Operation::FolderCreate)
        && existing.server_id == new_server_id
    {
        return true;
    }

    false
}

fn creates_container(op: &Operation) -> bool {
    match op {
        Operation::FolderCreate => true,
        Operation::ItemCreate(kind) => matches!(
            kind,
            ItemKind::Calendar | ItemKind::Contact | ItemKind::Task
        ),
        _ => false,
    }
}

pub(crate) fn insert_edges(
    conn: &Connection,
    succ_id: i64,
    pred_ids: &[i64],
) -> Result<(), LedgerError> {
    for pred_id in pred_ids {
        conn.execute(
            "INSERT OR IGNORE INTO pend_deps (pred_id, succ_id) VALUES (?1, ?2)",
            params![pred_id, succ_id],
        )?;
    }
    Ok(())
}

pub(crate) fn incoming_edge_count(conn: &Connection, succ_id: i64) -> Result<i64, LedgerError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM pend_deps WHERE succ_id = ?1",
        params![succ_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub(crate) fn delete_incoming_edges(conn: &Connection, succ_id: i64) -> Result<(), LedgerError> {
    conn.execute("DELETE FROM pend_deps WHERE succ_id = ?1", params![succ_id])?;
    Ok(())
}

/// Remove every edge rooted at `pred_id` and transition successors.
///
/// `proceed == true`: a successor whose incoming-edge count reaches zero
/// becomes eligible. `proceed == false`: each blocked successor fails
/// immediately and its own successors fail transitively.
pub(crate) fn unblock_successors(
    conn: &Connection,
    pred_id: i64,
    proceed: bool,
) -> Result<Vec<CascadeFailure>, LedgerError> {
    let mut stmt = conn.prepare("SELECT succ_id FROM pend_deps WHERE pred_id = ?1")?;
    let successors = stmt
        .query_map(params![pred_id], |row| row.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    drop(stmt);

    conn.execute("DELETE FROM pend_deps WHERE pred_id = ?1", params![pred_id])?;

    let mut failures = Vec::new();
    for succ_id in successors {
        let (account_id, token, state, op_json): (String, String, String, String) = conn.query_row(
            "SELECT account_id, token, state, operation FROM pendings WHERE id = ?1",
            params![succ_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        if state != "pred_blocked" {
            continue;
        }
        if proceed {
            if incoming_edge_count(conn, succ_id)? == 0 {
                conn.execute(
                    "UPDATE pendings SET state = 'eligible' WHERE id = ?1",
                    params![succ_id],
                )?;
                debug!(succ_id, "Predecessor cleared, operation now eligible");
            }
        } else {
            let operation: Operation = serde_json::from_str(&op_json)?;
            let status = StatusResult::error(operation.failure_sub_kind(), Why::PredecessorFailed);
            delete_incoming_edges(conn, succ_id)?;
            conn.execute(
                "UPDATE pendings SET state = 'failed', result = ?2 WHERE id = ?1",
                params![succ_id, serde_json::to_string(&status)?],
            )?;
            debug!(succ_id, "Predecessor failed, failing successor");
            failures.push(CascadeFailure {
                account_id,
                token,
                status,
            });
            failures.extend(unblock_successors(conn, succ_id, false)?);
        }
    }
    Ok(failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn insert_pending(
        conn: &Connection,
        id: i64,
        op: Operation,
        server_id: &str,
        parent_id: Option<&str>,
        dest_parent_id: Option<&str>,
        state: &str,
    ) {
        conn.execute(
            "INSERT INTO pendings (id, account_id, token, capability, op_name, operation,
                 server_id, parent_id, dest_parent_id, state, created_at)
             VALUES (?1, 'acct', ?2, 'mail_writer', ?3, ?4, ?5, ?6, ?7, ?8, '2026-01-01T00:00:00Z')",
            params![
                id,
                format!("token-{id}"),
                op.name(),
                serde_json::to_string(&op).unwrap(),
                server_id,
                parent_id,
                dest_parent_id,
                state,
            ],
        )
        .unwrap();
    }

    #[test]
    fn folder_deletes_serialize() {
        let store = Store::in_memory().unwrap();
        let conn = store.connection().unwrap();
        insert_pending(&conn, 1, Operation::FolderDelete, "1", Some("0"), None, "eligible");

        let preds = compute_predecessors(
            &conn,
            "acct",
            &Operation::FolderDelete,
            "7",
            Some("0"),
            None,
        )
        .unwrap();
        assert_eq!(preds, vec![1]);
    }

    #[test]
    fn update_blocks_on_inflight_create_of_same_object() {
        let store = Store::in_memory().unwrap();
        let conn = store.connection().unwrap();
        insert_pending(&conn, 1, Operation::FolderCreate, "tmp-1", Some("0"), None, "eligible");

        let preds = compute_predecessors(
            &conn,
            "acct",
            &Operation::FolderUpdate,
            "tmp-1",
            Some("0"),
            None,
        )
        .unwrap();
        assert_eq!(preds, vec![1]);

        // Different object kind: an email create does not block a folder update.
        let preds = compute_predecessors(
            &conn,
            "acct",
            &Operation::ItemUpdate(ItemKind::Email),
            "tmp-1",
            Some("0"),
            None,
        )
        .unwrap();
        assert!(preds.is_empty());
    }

    #[test]
    fn move_into_inflight_create_destination_blocks() {
        let store = Store::in_memory().unwrap();
        let conn = store.connection().unwrap();
        insert_pending(&conn, 1, Operation::FolderCreate, "tmp-dest", Some("0"), None, "eligible");

        let preds = compute_predecessors(
            &conn,
            "acct",
            &Operation::ItemMove(ItemKind::Email),
            "i1",
            Some("1"),
            Some("tmp-dest"),
        )
        .unwrap();
        assert_eq!(preds, vec![1]);

        // An email create is not a container destination.
        insert_pending(
            &conn,
            2,
            Operation::ItemCreate(ItemKind::Email),
            "tmp-mail",
            Some("0"),
            None,
            "eligible",
        );
        let preds = compute_predecessors(
            &conn,
            "acct",
            &Operation::ItemMove(ItemKind::Email),
            "i2",
            Some("tmp-mail"),
            None,
        )
        .unwrap();
        assert!(preds.is_empty());
    }

    #[test]
    fn failed_predecessors_are_not_scanned() {
        let store = Store::in_memory().unwrap();
        let conn = store.connection().unwrap();
        insert_pending(&conn, 1, Operation::FolderDelete, "1", Some("0"), None, "failed");

        let preds = compute_predecessors(
            &conn,
            "acct",
            &Operation::FolderDelete,
            "2",
            Some("0"),
            None,
        )
        .unwrap();
        assert!(preds.is_empty());
    }

    #[test]
    fn proceed_unblocks_only_when_all_predecessors_clear() {
        let store = Store::in_memory().unwrap();
        let conn = store.connection().unwrap();
        insert_pending(&conn, 1, Operation::FolderDelete, "1", Some("0"), None, "dispatched");
        insert_pending(&conn, 2, Operation::FolderDelete, "2", Some("0"), None, "dispatched");
        insert_pending(&conn, 3, Operation::FolderDelete, "3", Some("0"), None, "pred_blocked");
        insert_edges(&conn, 3, &[1, 2]).unwrap();

        let failures = unblock_successors(&conn, 1, true).unwrap();
        assert!(failures.is_empty());
        let state: String = conn
            .query_row("SELECT state FROM pendings WHERE id = 3", [], |r| r.get(0))
            .unwrap();
        assert_eq!(state, "pred_blocked");

        unblock_successors(&conn, 2, true).unwrap();
        let state: String = conn
            .query_row("SELECT state FROM pendings WHERE id = 3", [], |r| r.get(0))
            .unwrap();
        assert_eq!(state, "eligible");
        assert_eq!(incoming_edge_count(&conn, 3).unwrap(), 0);
    }

    #[test]
    fn failure_cascades_through_blocked_successors() {
        let store = Store::in_memory().unwrap();
        let conn = store.connection().unwrap();
        insert_pending(&conn, 1, Operation::FolderCreate, "tmp-1", Some("0"), None, "dispatched");
        insert_pending(&conn, 2, Operation::FolderUpdate, "tmp-1", Some("0"), None, "pred_blocked");
        insert_pending(&conn, 3, Operation::FolderUpdate, "tmp-1", Some("0"), None, "pred_blocked");
        insert_edges(&conn, 2, &[1]).unwrap();
        insert_edges(&conn, 3, &[2]).unwrap();

        let failures = unblock_successors(&conn, 1, false).unwrap();
        assert_eq!(failures.len(), 2);
        for id in [2, 3] {
            let state: String = conn
                .query_row("SELECT state FROM pendings WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })
                .unwrap();
            assert_eq!(state, "failed");
        }
        assert!(failures
            .iter()
            .all(|f| f.status.why == Why::PredecessorFailed));
    }
}

//! Reconciliation of inbound server deltas against the pending ledger
//!
//! The server's view arrives as add/change/delete commands. Before a command
//! is applied locally it is resolved against every unresolved pending
//! operation for the account: superseded pendings are removed silently (the
//! user's intent was satisfied or mooted, never "failed"), simultaneous
//! creates are unified by rewriting the client's temporary id, and commands
//! targeting objects the client is about to delete or relocate are dropped.
//!
//! Each batch runs in one transaction. Set-changed notifications are
//! collected during the transaction, deduplicated per object set, and emitted
//! only after commit.

use std::collections::BTreeSet;

use rusqlite::{params, Connection};
use tracing::debug;

use crate::error::LedgerError;
use crate::ledger::{self, PendingRow};
use crate::notify::StatusChannel;
use crate::objects::{self, FolderKind, FolderRecord, ItemRecord};
use crate::op::{ItemKind, ObjKind, Operation};
use crate::path_index;
use crate::status::{SetKind, StatusResult, SubKind};
use crate::store::Store;

/// What the server says happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Add,
    Change,
    Delete,
}

/// The object a delta command describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaObject {
    Folder { display_name: String, kind: FolderKind },
    Item { kind: ItemKind },
}

impl DeltaObject {
    fn set_kind(&self) -> SetKind {
        match self {
            DeltaObject::Folder { .. } => SetKind::Folder,
            DeltaObject::Item { kind } => match kind {
                ItemKind::Email => SetKind::Email,
                ItemKind::Calendar => SetKind::Calendar,
                ItemKind::Contact => SetKind::Contact,
                ItemKind::Task => SetKind::Task,
            },
        }
    }
}

/// One inbound server delta
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaCommand {
    pub kind: DeltaKind,
    pub object: DeltaObject,
    pub server_id: String,
    pub parent_id: String,
}

impl DeltaCommand {
    pub fn folder_add(server_id: &str, parent_id: &str, name: &str, kind: FolderKind) -> Self {
        Self {
            kind: DeltaKind::Add,
            object: DeltaObject::Folder {
                display_name: name.to_string(),
                kind,
            },
            server_id: server_id.to_string(),
            parent_id: parent_id.to_string(),
        }
    }

    pub fn folder_change(server_id: &str, parent_id: &str, name: &str, kind: FolderKind) -> Self {
        Self {
            kind: DeltaKind::Change,
            ..Self::folder_add(server_id, parent_id, name, kind)
        }
    }

    pub fn folder_delete(server_id: &str) -> Self {
        Self {
            kind: DeltaKind::Delete,
            object: DeltaObject::Folder {
                display_name: String::new(),
                kind: FolderKind::Generic,
            },
            server_id: server_id.to_string(),
            parent_id: String::new(),
        }
    }

    pub fn item_add(server_id: &str, parent_id: &str, kind: ItemKind) -> Self {
        Self {
            kind: DeltaKind::Add,
            object: DeltaObject::Item { kind },
            server_id: server_id.to_string(),
            parent_id: parent_id.to_string(),
        }
    }

    pub fn item_change(server_id: &str, parent_id: &str, kind: ItemKind) -> Self {
        Self {
            kind: DeltaKind::Change,
            ..Self::item_add(server_id, parent_id, kind)
        }
    }

    pub fn item_delete(server_id: &str, kind: ItemKind) -> Self {
        Self {
            kind: DeltaKind::Delete,
            object: DeltaObject::Item { kind },
            server_id: server_id.to_string(),
            parent_id: String::new(),
        }
    }
}

/// Name suffix applied when a client create collides with a server object of
/// the same name but different shape.
pub const CLIENT_CREATED_SUFFIX: &str = " Client-Created";

/// Name suffix applied when a server Add lands in the slot a pending folder
/// move or rename is about to occupy.
pub const CLIENT_MOVED_SUFFIX: &str = " Client-Moved";

/// Applies inbound delta batches with conflict resolution
pub struct ReconcileEngine {
    store: Store,
    status: StatusChannel,
}

impl ReconcileEngine {
    pub fn new(store: Store, status: StatusChannel) -> Self {
        Self { store, status }
    }

    /// Resolve and apply one batch of server deltas for an account.
    pub fn apply_batch(
        &self,
        account_id: &str,
        commands: &[DeltaCommand],
    ) -> Result<(), LedgerError> {
        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let mut changed_sets = BTreeSet::new();

        for command in commands {
            let apply = self.resolve_command(&tx, account_id, command)?;
            if !apply {
                debug!(
                    server_id = %command.server_id,
                    "Inbound command suppressed by pending operations"
                );
                continue;
            }
            apply_command_tx(&tx, account_id, command)?;
            changed_sets.insert(command.object.set_kind());
        }
        tx.commit()?;

        for set in changed_sets {
            self.status
                .emit(account_id, StatusResult::info(SubKind::SetChanged(set)), None);
        }
        Ok(())
    }

    /// Run the conflict rules for one command against every pending row.
    /// Returns whether the command should still be applied locally.
    fn resolve_command(
        &self,
        tx: &Connection,
        account_id: &str,
        command: &DeltaCommand,
    ) -> Result<bool, LedgerError> {
        let pendings = ledger::load_account_rows_tx(tx, account_id)?;
        let mut apply = true;

        for pending in &pendings {
            match command.kind {
                DeltaKind::Delete => {
                    if !self.resolve_delete(tx, account_id, command, pending)? {
                        apply = false;
                    }
                }
                DeltaKind::Add => {
                    if !self.resolve_add(tx, account_id, command, pending)? {
                        apply = false;
                    }
                }
                DeltaKind::Change => {
                    if !self.resolve_change(tx, account_id, command, pending)? {
                        apply = false;
                    }
                }
            }
        }
        Ok(apply)
    }

    fn resolve_delete(
        &self,
        tx: &Connection,
        account_id: &str,
        command: &DeltaCommand,
        pending: &PendingRow,
    ) -> Result<bool, LedgerError> {
        if pending.server_id == command.server_id {
            if pending.operation.is_delete() {
                // The client already deleted the same object; both sides
                // agree and there is nothing to apply or report.
                ledger::delete_row_tx(tx, pending.id)?;
                return Ok(false);
            }
            // Any other pending work on the object is superseded. When the
            // target is an item it was just relocated to the lost-and-found,
            // so the destructive apply must not run.
            supersede_pending_tx(tx, account_id, pending)?;
            return Ok(!matches!(
                pending.operation.object_kind(),
                Some(ObjKind::Item(_))
            ));
        }

        // The pending delete or move already covers the server's target
        // (strict ancestor); the client's disposition wins.
        if pending_protects(tx, account_id, pending, &command.server_id)? {
            return Ok(false);
        }

        // The server's delete covers the pending operation's target or its
        // destination; the pending work is moot.
        let covers_target =
            path_index::dominates_tx(tx, account_id, &command.server_id, &pending.server_id)?;
        let covers_dest = dominates_opt(tx, account_id, Some(command.server_id.as_str()), pending.parent_id.as_deref())?
            || dominates_opt(tx, account_id, Some(command.server_id.as_str()), pending.dest_parent_id.as_deref())?;
        if covers_target || covers_dest {
            supersede_pending_tx(tx, account_id, pending)?;
        }
        Ok(true)
    }

    fn resolve_add(
        &self,
        tx: &Connection,
        account_id: &str,
        command: &DeltaCommand,
        pending: &PendingRow,
    ) -> Result<bool, LedgerError> {
        if pending_protects(tx, account_id, pending, &command.server_id)?
            || pending_protects(tx, account_id, pending, &command.parent_id)?
        {
            return Ok(false);
        }

        let DeltaObject::Folder { display_name, kind } = &command.object else {
            return Ok(true);
        };

        // A pending folder move or rename headed for the same (parent, name)
        // slot: the server object keeps the name, the client folder's name is
        // flagged so both survive the eventual apply.
        if matches!(pending.operation, Operation::FolderUpdate)
            && pending.display_name.as_deref() == Some(display_name.as_str())
        {
            let effective_parent = pending.dest_parent_id.as_deref().or(pending.parent_id.as_deref());
            if effective_parent == Some(command.parent_id.as_str()) {
                let new_name = format!("{display_name}{CLIENT_MOVED_SUFFIX}");
                tx.execute(
                    "UPDATE pendings SET display_name = ?2 WHERE id = ?1",
                    params![pending.id, new_name],
                )?;
                tx.execute(
                    "UPDATE folders SET display_name = ?3 WHERE account_id = ?1 AND server_id = ?2",
                    params![account_id, pending.server_id, new_name],
                )?;
                return Ok(true);
            }
        }

        if !matches!(pending.operation, Operation::FolderCreate) {
            return Ok(true);
        }
        let same_slot = pending.parent_id.as_deref() == Some(command.parent_id.as_str())
            && pending.display_name.as_deref() == Some(display_name.as_str());
        if !same_slot {
            return Ok(true);
        }

        let local_kind = objects::get_folder_tx(tx, account_id, &pending.server_id)?
            .map(|folder| folder.kind)
            .unwrap_or(*kind);
        if local_kind == *kind {
            // Simultaneous create of the same logical folder: adopt the
            // server's id everywhere the temporary id appears.
            let temp_id = pending.server_id.clone();
            ledger::delete_row_tx(tx, pending.id)?;
            rewrite_pending_refs_tx(tx, account_id, &temp_id, &command.server_id)?;
            objects::rewrite_server_id_tx(tx, account_id, &temp_id, &command.server_id)?;
            debug!(
                temp_id = %temp_id,
                server_id = %command.server_id,
                "Unified simultaneous folder create"
            );
        } else {
            // Same name, different shape: the server owns the identity; the
            // client's folder is flagged so the eventual create is visible.
            let new_name = format!(
                "{}{}",
                pending.display_name.as_deref().unwrap_or_default(),
                CLIENT_CREATED_SUFFIX
            );
            tx.execute(
                "UPDATE pendings SET display_name = ?2 WHERE id = ?1",
                params![pending.id, new_name],
            )?;
            tx.execute(
                "UPDATE folders SET display_name = ?3 WHERE account_id = ?1 AND server_id = ?2",
                params![account_id, pending.server_id, new_name],
            )?;
        }
        Ok(true)
    }

    fn resolve_change(
        &self,
        tx: &Connection,
        account_id: &str,
        command: &DeltaCommand,
        pending: &PendingRow,
    ) -> Result<bool, LedgerError> {
        // The server changed the same object the client is editing or
        // moving; the server's field values win and the local edit is
        // discarded without a failure callback.
        if pending.operation.is_update_class() && pending.server_id == command.server_id {
            ledger::delete_row_tx(tx, pending.id)?;
            return Ok(true);
        }

        // The command's target sits inside the subtree a pending delete
        // covers, or inside the destination of a pending move.
        if pending_protects(tx, account_id, pending, &command.server_id)?
            || pending_dest_protects(tx, account_id, pending, &command.server_id)?
        {
            return Ok(false);
        }
        Ok(true)
    }
}

/// Remove a pending made moot by a server-side delete. Item content the user
/// produced or touched is preserved in the lost-and-found; a client-created
/// folder's local subtree goes away with it.
fn supersede_pending_tx(
    conn: &Connection,
    account_id: &str,
    pending: &PendingRow,
) -> Result<(), LedgerError> {
    if !pending.operation.is_delete() {
        match pending.operation.object_kind() {
            Some(ObjKind::Item(_)) => {
                objects::move_item_to_lost_and_found_tx(conn, account_id, &pending.server_id)?;
            }
            Some(ObjKind::Folder) if pending.operation.is_create() => {
                objects::delete_subtree_tx(conn, account_id, &pending.server_id)?;
            }
            _ => {}
        }
    }
    ledger::delete_row_tx(conn, pending.id)
}

/// Rule-8 core: a pending delete or move whose own target contains `target`.
fn pending_protects(
    conn: &Connection,
    account_id: &str,
    pending: &PendingRow,
    target: &str,
) -> Result<bool, LedgerError> {
    if !(pending.operation.is_delete() || pending.operation.is_move()) {
        return Ok(false);
    }
    path_index::dominates_tx(conn, account_id, &pending.server_id, target)
}

/// A pending move also claims the subtree it is moving into.
fn pending_dest_protects(
    conn: &Connection,
    account_id: &str,
    pending: &PendingRow,
    target: &str,
) -> Result<bool, LedgerError> {
    if !pending.operation.is_move() {
        return Ok(false);
    }
    dominates_opt(conn, account_id, pending.dest_parent_id.as_deref(), Some(target))
}

fn dominates_opt(
    conn: &Connection,
    account_id: &str,
    ancestor: Option<&str>,
    descendant: Option<&str>,
) -> Result<bool, LedgerError> {
    match (ancestor, descendant) {
        (Some(a), Some(d)) => path_index::dominates_tx(conn, account_id, a, d),
        _ => Ok(false),
    }
}

fn apply_command_tx(
    conn: &Connection,
    account_id: &str,
    command: &DeltaCommand,
) -> Result<(), LedgerError> {
    match (command.kind, &command.object) {
        (DeltaKind::Delete, _) => {
            objects::delete_subtree_tx(conn, account_id, &command.server_id)?;
        }
        (_, DeltaObject::Folder { display_name, kind }) => {
            objects::upsert_folder_tx(
                conn,
                &FolderRecord {
                    account_id: account_id.to_string(),
                    server_id: command.server_id.clone(),
                    parent_id: command.parent_id.clone(),
                    display_name: display_name.clone(),
                    kind: *kind,
                    client_owned: false,
                },
            )?;
            path_index::record_tx(conn, account_id, &command.server_id, &command.parent_id)?;
        }
        (_, DeltaObject::Item { kind }) => {
            objects::upsert_item_tx(
                conn,
                &ItemRecord {
                    account_id: account_id.to_string(),
                    server_id: command.server_id.clone(),
                    parent_id: command.parent_id.clone(),
                    kind: *kind,
                },
            )?;
            path_index::record_tx(conn, account_id, &command.server_id, &command.parent_id)?;
        }
    }
    Ok(())
}

/// Rewrite references to a temporary id held by other pending rows.
fn rewrite_pending_refs_tx(
    conn: &Connection,
    account_id: &str,
    old: &str,
    new: &str,
) -> Result<(), LedgerError> {
    conn.execute(
        "UPDATE pendings SET server_id = ?3 WHERE account_id = ?1 AND server_id = ?2",
        params![account_id, old, new],
    )?;
    conn.execute(
        "UPDATE pendings SET parent_id = ?3 WHERE account_id = ?1 AND parent_id = ?2",
        params![account_id, old, new],
    )?;
    conn.execute(
        "UPDATE pendings SET dest_parent_id = ?3 WHERE account_id = ?1 AND dest_parent_id = ?2",
        params![account_id, old, new],
    )?;
    conn.execute(
        "UPDATE pendings SET deferred_folder_id = ?3
         WHERE account_id = ?1 AND deferred_folder_id = ?2",
        params![account_id, old, new],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flume::Receiver;

    use crate::ledger::{Enqueued, NewPending, PendingLedger, State};
    use crate::notify::Notification;
    use crate::objects::{ObjectStore, LOST_AND_FOUND_ID, ROOT_ID};
    use crate::path_index::PathIndex;
    use crate::status::ResultKind;

    struct Fixture {
        ledger: PendingLedger,
        engine: ReconcileEngine,
        objects: ObjectStore,
        index: PathIndex,
        rx: Receiver<Notification>,
    }

    fn fixture() -> Fixture {
        let store = Store::in_memory().unwrap();
        let (status, rx) = StatusChannel::new();
        Fixture {
            ledger: PendingLedger::new(store.clone(), status.clone()),
            engine: ReconcileEngine::new(store.clone(), status),
            objects: ObjectStore::new(store.clone()),
            index: PathIndex::new(store),
            rx,
        }
    }

    fn confirmed_folder(fx: &Fixture, server_id: &str, parent_id: &str, name: &str) {
        fx.objects
            .upsert_folder(&FolderRecord {
                account_id: "acct".into(),
                server_id: server_id.into(),
                parent_id: parent_id.into(),
                display_name: name.into(),
                kind: FolderKind::Generic,
                client_owned: false,
            })
            .unwrap();
        fx.index
            .record_confirmed_parent("acct", server_id, parent_id)
            .unwrap();
    }

    fn confirmed_item(fx: &Fixture, server_id: &str, parent_id: &str) {
        fx.objects
            .upsert_item(&ItemRecord {
                account_id: "acct".into(),
                server_id: server_id.into(),
                parent_id: parent_id.into(),
                kind: ItemKind::Email,
            })
            .unwrap();
        fx.index
            .record_confirmed_parent("acct", server_id, parent_id)
            .unwrap();
    }

    fn enqueue(fx: &Fixture, new: NewPending) -> i64 {
        match fx.ledger.enqueue(new).unwrap() {
            Enqueued::Inserted { id, .. } => id,
            Enqueued::Duplicate { .. } => panic!("unexpected duplicate"),
        }
    }

    fn drain(fx: &Fixture) -> Vec<Notification> {
        fx.rx.drain().collect()
    }

    #[test]
    fn unrelated_add_applies_and_leaves_ledger_alone() {
        let fx = fixture();
        let mut new = NewPending::new("acct", Operation::ItemMove(ItemKind::Email), "i1");
        new.parent_id = Some("1".into());
        new.dest_parent_id = Some("2".into());
        let id = enqueue(&fx, new);

        fx.engine
            .apply_batch(
                "acct",
                &[DeltaCommand::folder_add("9", ROOT_ID, "Archive", FolderKind::Generic)],
            )
            .unwrap();

        assert!(fx.objects.get_folder("acct", "9").unwrap().is_some());
        assert_eq!(fx.ledger.get(id).unwrap().unwrap().state, State::Eligible);
        let notes = drain(&fx);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].status.sub_kind, SubKind::SetChanged(SetKind::Folder));
    }

    #[test]
    fn simultaneous_folder_create_rewrites_the_temporary_id() {
        let fx = fixture();
        let temp = Store::new_client_server_id();
        fx.objects
            .upsert_folder(&FolderRecord {
                account_id: "acct".into(),
                server_id: temp.clone(),
                parent_id: ROOT_ID.into(),
                display_name: "Projects".into(),
                kind: FolderKind::Generic,
                client_owned: false,
            })
            .unwrap();
        let mut create = NewPending::new("acct", Operation::FolderCreate, &temp);
        create.parent_id = Some(ROOT_ID.into());
        create.display_name = Some("Projects".into());
        let create_id = enqueue(&fx, create);

        // An item create into the not-yet-confirmed folder references the
        // temporary id and is blocked behind the folder create.
        let mut item = NewPending::new("acct", Operation::ItemCreate(ItemKind::Email), "tmp-i");
        item.parent_id = Some(temp.clone());
        let item_id = enqueue(&fx, item);
        assert_eq!(fx.ledger.get(item_id).unwrap().unwrap().state, State::PredBlocked);

        fx.engine
            .apply_batch(
                "acct",
                &[DeltaCommand::folder_add("42", ROOT_ID, "Projects", FolderKind::Generic)],
            )
            .unwrap();

        // The create is satisfied: pending gone, successor released, every
        // temp-id reference now carries the server's id.
        assert!(fx.ledger.get(create_id).unwrap().is_none());
        let item = fx.ledger.get(item_id).unwrap().unwrap();
        assert_eq!(item.state, State::Eligible);
        assert_eq!(item.parent_id.as_deref(), Some("42"));
        assert!(fx.objects.get_folder("acct", &temp).unwrap().is_none());
        assert!(fx.objects.get_folder("acct", "42").unwrap().is_some());

        let notes = drain(&fx);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].status.kind, ResultKind::Info);
        assert_eq!(notes[0].status.sub_kind, SubKind::SetChanged(SetKind::Folder));
    }

    #[test]
    fn name_collision_with_different_kind_flags_the_client_create() {
        let fx = fixture();
        let temp = Store::new_client_server_id();
        fx.objects
            .upsert_folder(&FolderRecord {
                account_id: "acct".into(),
                server_id: temp.clone(),
                parent_id: ROOT_ID.into(),
                display_name: "Travel".into(),
                kind: FolderKind::Calendar,
                client_owned: false,
            })
            .unwrap();
        let mut create = NewPending::new("acct", Operation::FolderCreate, &temp);
        create.parent_id = Some(ROOT_ID.into());
        create.display_name = Some("Travel".into());
        let id = enqueue(&fx, create);

        fx.engine
            .apply_batch(
                "acct",
                &[DeltaCommand::folder_add("42", ROOT_ID, "Travel", FolderKind::Generic)],
            )
            .unwrap();

        // Server object applied under its id; client create survives with a
        // flagged name.
        assert!(fx.objects.get_folder("acct", "42").unwrap().is_some());
        let row = fx.ledger.get(id).unwrap().unwrap();
        assert_eq!(row.display_name.as_deref(), Some("Travel Client-Created"));
        let local = fx.objects.get_folder("acct", &temp).unwrap().unwrap();
        assert_eq!(local.display_name, "Travel Client-Created");
    }

    #[test]
    fn add_colliding_with_a_pending_folder_rename_flags_the_client_name() {
        let fx = fixture();
        confirmed_folder(&fx, "1", ROOT_ID, "Old Name");
        let mut rename = NewPending::new("acct", Operation::FolderUpdate, "1");
        rename.parent_id = Some(ROOT_ID.into());
        rename.display_name = Some("Reports".into());
        let id = enqueue(&fx, rename);

        fx.engine
            .apply_batch(
                "acct",
                &[DeltaCommand::folder_add("9", ROOT_ID, "Reports", FolderKind::Generic)],
            )
            .unwrap();

        // The server folder keeps the name; the pending rename carries a
        // flagged one and still applies later.
        assert!(fx.objects.get_folder("acct", "9").unwrap().is_some());
        let row = fx.ledger.get(id).unwrap().unwrap();
        assert_eq!(row.display_name.as_deref(), Some("Reports Client-Moved"));
    }

    #[test]
    fn server_delete_of_ancestor_cancels_dependent_pendings_silently() {
        let fx = fixture();
        confirmed_folder(&fx, "1", ROOT_ID, "Inbox");
        confirmed_folder(&fx, "2", "1", "Sub");
        confirmed_item(&fx, "i1", "2");

        // A move whose destination lives inside the doomed subtree.
        let mut mv = NewPending::new("acct", Operation::ItemMove(ItemKind::Email), "i1");
        mv.parent_id = Some("2".into());
        mv.dest_parent_id = Some("2".into());
        let mv_id = enqueue(&fx, mv);

        fx.engine
            .apply_batch("acct", &[DeltaCommand::folder_delete("1")])
            .unwrap();

        assert!(fx.ledger.get(mv_id).unwrap().is_none());
        assert!(fx.objects.get_folder("acct", "2").unwrap().is_none());
        // The moved item's content is preserved, not destroyed.
        let item = fx.objects.get_item("acct", "i1").unwrap().unwrap();
        assert_eq!(item.parent_id, LOST_AND_FOUND_ID);

        // No failure notifications; only the folder set changed.
        let notes = drain(&fx);
        assert!(notes.iter().all(|n| n.status.kind == ResultKind::Info));
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].status.sub_kind, SubKind::SetChanged(SetKind::Folder));
    }

    #[test]
    fn server_delete_cancels_a_client_created_folder_inside_the_subtree() {
        let fx = fixture();
        confirmed_folder(&fx, "1", ROOT_ID, "Inbox");
        let temp = Store::new_client_server_id();
        fx.objects
            .upsert_folder(&FolderRecord {
                account_id: "acct".into(),
                server_id: temp.clone(),
                parent_id: "1".into(),
                display_name: "Drafts".into(),
                kind: FolderKind::Generic,
                client_owned: false,
            })
            .unwrap();
        let mut create = NewPending::new("acct", Operation::FolderCreate, &temp);
        create.parent_id = Some("1".into());
        create.display_name = Some("Drafts".into());
        let id = enqueue(&fx, create);

        fx.engine
            .apply_batch("acct", &[DeltaCommand::folder_delete("1")])
            .unwrap();

        assert!(fx.ledger.get(id).unwrap().is_none());
        assert!(fx.objects.get_folder("acct", &temp).unwrap().is_none());
    }

    #[test]
    fn matching_deletes_cancel_each_other_without_notification() {
        let fx = fixture();
        confirmed_folder(&fx, "1", ROOT_ID, "Old");
        let id = enqueue(&fx, NewPending::new("acct", Operation::FolderDelete, "1"));

        fx.engine
            .apply_batch("acct", &[DeltaCommand::folder_delete("1")])
            .unwrap();

        assert!(fx.ledger.get(id).unwrap().is_none());
        assert!(drain(&fx).is_empty());
    }

    #[test]
    fn server_delete_supersedes_a_pending_item_update() {
        let fx = fixture();
        confirmed_folder(&fx, "1", ROOT_ID, "Calendar");
        fx.objects
            .upsert_item(&ItemRecord {
                account_id: "acct".into(),
                server_id: "e1".into(),
                parent_id: "1".into(),
                kind: ItemKind::Calendar,
            })
            .unwrap();
        fx.index.record_confirmed_parent("acct", "e1", "1").unwrap();

        let mut update = NewPending::new("acct", Operation::ItemUpdate(ItemKind::Calendar), "e1");
        update.parent_id = Some("1".into());
        let id = enqueue(&fx, update);

        fx.engine
            .apply_batch("acct", &[DeltaCommand::item_delete("e1", ItemKind::Calendar)])
            .unwrap();

        assert!(fx.ledger.get(id).unwrap().is_none());
        let item = fx.objects.get_item("acct", "e1").unwrap().unwrap();
        assert_eq!(item.parent_id, LOST_AND_FOUND_ID);
        let notes = drain(&fx);
        assert!(notes.iter().all(|n| n.status.kind == ResultKind::Info));
    }

    #[test]
    fn server_change_discards_a_pending_local_edit() {
        let fx = fixture();
        confirmed_folder(&fx, "1", ROOT_ID, "Old Name");
        let mut rename = NewPending::new("acct", Operation::FolderUpdate, "1");
        rename.parent_id = Some(ROOT_ID.into());
        rename.display_name = Some("Client Name".into());
        let id = enqueue(&fx, rename);

        fx.engine
            .apply_batch(
                "acct",
                &[DeltaCommand::folder_change("1", ROOT_ID, "Server Name", FolderKind::Generic)],
            )
            .unwrap();

        assert!(fx.ledger.get(id).unwrap().is_none());
        let folder = fx.objects.get_folder("acct", "1").unwrap().unwrap();
        assert_eq!(folder.display_name, "Server Name");
    }

    #[test]
    fn pending_delete_of_ancestor_suppresses_commands_in_its_subtree() {
        let fx = fixture();
        confirmed_folder(&fx, "1", ROOT_ID, "Doomed");
        confirmed_item(&fx, "i1", "1");
        let id = enqueue(&fx, NewPending::new("acct", Operation::FolderDelete, "1"));

        fx.engine
            .apply_batch("acct", &[DeltaCommand::item_change("i1", "1", ItemKind::Email)])
            .unwrap();

        // Command dropped; pending intact; no set-changed fired.
        assert!(fx.ledger.get(id).unwrap().is_some());
        assert!(drain(&fx).is_empty());
    }

    #[test]
    fn pending_move_destination_suppresses_commands_for_the_destination() {
        let fx = fixture();
        confirmed_folder(&fx, "1", ROOT_ID, "Dst");
        confirmed_folder(&fx, "4", ROOT_ID, "Moving");
        let mut mv = NewPending::new("acct", Operation::FolderUpdate, "4");
        mv.parent_id = Some(ROOT_ID.into());
        mv.dest_parent_id = Some("1".into());
        let id = enqueue(&fx, mv);

        fx.engine
            .apply_batch(
                "acct",
                &[DeltaCommand::folder_change("1", ROOT_ID, "Renamed", FolderKind::Generic)],
            )
            .unwrap();

        // The destination is claimed by the pending move; the command is
        // dropped and the move proceeds untouched.
        assert!(fx.ledger.get(id).unwrap().is_some());
        assert!(fx.objects.get_folder("acct", "1").unwrap().unwrap().display_name == "Dst");
        assert!(drain(&fx).is_empty());
    }

    #[test]
    fn server_change_on_a_moving_item_discards_the_pending_move() {
        let fx = fixture();
        confirmed_folder(&fx, "1", ROOT_ID, "Src");
        confirmed_folder(&fx, "2", ROOT_ID, "Dst");
        confirmed_item(&fx, "i1", "1");
        let mut mv = NewPending::new("acct", Operation::ItemMove(ItemKind::Email), "i1");
        mv.parent_id = Some("1".into());
        mv.dest_parent_id = Some("2".into());
        let id = enqueue(&fx, mv);

        fx.engine
            .apply_batch("acct", &[DeltaCommand::item_change("i1", "1", ItemKind::Email)])
            .unwrap();

        // Exact-match change: the server's view of the item wins outright.
        assert!(fx.ledger.get(id).unwrap().is_none());
        let notes = drain(&fx);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].status.sub_kind, SubKind::SetChanged(SetKind::Email));
    }

    #[test]
    fn set_changed_is_emitted_once_per_object_set_per_batch() {
        let fx = fixture();
        fx.engine
            .apply_batch(
                "acct",
                &[
                    DeltaCommand::folder_add("1", ROOT_ID, "A", FolderKind::Generic),
                    DeltaCommand::folder_add("2", ROOT_ID, "B", FolderKind::Generic),
                    DeltaCommand::item_add("i1", "1", ItemKind::Email),
                    DeltaCommand::item_add("i2", "1", ItemKind::Email),
                ],
            )
            .unwrap();

        let mut kinds: Vec<SubKind> = drain(&fx).into_iter().map(|n| n.status.sub_kind).collect();
        kinds.dedup();
        assert_eq!(
            kinds,
            vec![
                SubKind::SetChanged(SetKind::Folder),
                SubKind::SetChanged(SetKind::Email),
            ]
        );
    }

    #[test]
    fn reapplying_a_batch_is_idempotent() {
        let fx = fixture();
        let batch = [
            DeltaCommand::folder_add("1", ROOT_ID, "A", FolderKind::Generic),
            DeltaCommand::item_add("i1", "1", ItemKind::Email),
        ];
        fx.engine.apply_batch("acct", &batch).unwrap();
        fx.engine.apply_batch("acct", &batch).unwrap();

        assert!(fx.objects.get_folder("acct", "1").unwrap().is_some());
        assert!(fx.objects.get_item("acct", "i1").unwrap().is_some());
    }
}

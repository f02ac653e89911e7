//! Pending ledger: the durable queue of not-yet-confirmed local mutations
//!
//! Every mutation a caller issues lands here first. The ledger owns the
//! per-operation state machine (eligible, blocked, dispatched, deferred,
//! failed, user-blocked), the duplicate check, and the resolve API the
//! transport layer feeds results into. Check-then-write sequences run as one
//! transaction; notifications are emitted only after commit.
//!
//! Contract violations — resolving from a wrong state, duplicate comparison
//! across incompatible families — are panics, not error values.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::graph;
use crate::notify::StatusChannel;
use crate::op::{Capability, Operation};
use crate::status::{StatusResult, Why};
use crate::store::Store;

/// Hard cap on per-operation defers; one more forces a terminal failure.
pub const MAX_DEFER_COUNT: u32 = 5;

/// Lifecycle state of a pending operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    Eligible,
    PredBlocked,
    Dispatched,
    Deferred,
    Failed,
    UserBlocked,
}

impl State {
    pub fn as_str(self) -> &'static str {
        match self {
            State::Eligible => "eligible",
            State::PredBlocked => "pred_blocked",
            State::Dispatched => "dispatched",
            State::Deferred => "deferred",
            State::Failed => "failed",
            State::UserBlocked => "user_blocked",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pred_blocked" => State::PredBlocked,
            "dispatched" => State::Dispatched,
            "deferred" => State::Deferred,
            "failed" => State::Failed,
            "user_blocked" => State::UserBlocked,
            _ => State::Eligible,
        }
    }
}

/// Why a deferred operation is waiting, and for what trigger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeferredReason {
    /// Wait until a wall-clock time (stored in `deferred_until`).
    UntilTime,
    /// Wait until the next generic sync completes for the account.
    UntilSync,
    /// Wait until the next folder-hierarchy sync completes.
    UntilFSync,
    /// Two-stage: folder-hierarchy sync first, then a generic sync.
    UntilFSyncThenSync,
    /// Wait until metadata syncs for one specific folder.
    UntilFMetaData { folder_server_id: String },
}

impl DeferredReason {
    pub(crate) fn tag(&self) -> &'static str {
        match self {
            DeferredReason::UntilTime => "until_time",
            DeferredReason::UntilSync => "until_sync",
            DeferredReason::UntilFSync => "until_fsync",
            DeferredReason::UntilFSyncThenSync => "until_fsync_then_sync",
            DeferredReason::UntilFMetaData { .. } => "until_fmetadata",
        }
    }

    fn folder_id(&self) -> Option<&str> {
        match self {
            DeferredReason::UntilFMetaData { folder_server_id } => Some(folder_server_id),
            _ => None,
        }
    }

    fn from_columns(tag: Option<&str>, folder_id: Option<String>) -> Option<Self> {
        match tag? {
            "until_time" => Some(DeferredReason::UntilTime),
            "until_sync" => Some(DeferredReason::UntilSync),
            "until_fsync" => Some(DeferredReason::UntilFSync),
            "until_fsync_then_sync" => Some(DeferredReason::UntilFSyncThenSync),
            "until_fmetadata" => Some(DeferredReason::UntilFMetaData {
                folder_server_id: folder_id.unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

/// Why an operation is parked waiting for the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    AdminRemediation,
    MustChangeName,
    MustPickNewParent,
}

impl BlockReason {
    fn as_str(self) -> &'static str {
        match self {
            BlockReason::AdminRemediation => "admin_remediation",
            BlockReason::MustChangeName => "must_change_name",
            BlockReason::MustPickNewParent => "must_pick_new_parent",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "admin_remediation" => Some(BlockReason::AdminRemediation),
            "must_change_name" => Some(BlockReason::MustChangeName),
            "must_pick_new_parent" => Some(BlockReason::MustPickNewParent),
            _ => None,
        }
    }
}

/// A mutation to enqueue
#[derive(Debug, Clone)]
pub struct NewPending {
    pub account_id: String,
    pub operation: Operation,
    pub server_id: String,
    pub parent_id: Option<String>,
    pub dest_parent_id: Option<String>,
    pub client_id: Option<String>,
    pub display_name: Option<String>,
    pub item_id: Option<String>,
    pub delay_not_allowed: bool,
}

impl NewPending {
    pub fn new(account_id: &str, operation: Operation, server_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            operation,
            server_id: server_id.to_string(),
            parent_id: None,
            dest_parent_id: None,
            client_id: None,
            display_name: None,
            item_id: None,
            delay_not_allowed: false,
        }
    }

    /// Duplicate comparison against an unresolved existing operation.
    ///
    /// Only meaningful within a dedupable operation family. Calling it
    /// across incompatible families is a caller contract violation and
    /// panics.
    pub fn is_duplicate_of(&self, existing: &PendingRow) -> bool {
        let family = self.operation.family();
        assert!(
            family.is_dedupable() && family == existing.operation.family(),
            "duplicate comparison across incompatible operation families: {} vs {}",
            self.operation.name(),
            existing.operation.name(),
        );
        self.account_id == existing.account_id
            && self.server_id == existing.server_id
            && self.parent_id == existing.parent_id
    }
}

/// A stored pending operation
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub id: i64,
    pub account_id: String,
    pub token: String,
    pub capability: Capability,
    pub operation: Operation,
    pub server_id: String,
    pub parent_id: Option<String>,
    pub dest_parent_id: Option<String>,
    pub client_id: Option<String>,
    pub display_name: Option<String>,
    pub state: State,
    pub deferred_reason: Option<DeferredReason>,
    pub deferred_until: Option<DateTime<Utc>>,
    pub defer_count: u32,
    pub block_reason: Option<BlockReason>,
    pub result: Option<StatusResult>,
    pub delay_not_allowed: bool,
    pub priority_stamp: i64,
    pub item_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of `enqueue`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enqueued {
    Inserted {
        id: i64,
        token: String,
        state: State,
    },
    /// An unresolved duplicate already covers this work; its token is
    /// returned so the caller can correlate with the earlier request.
    Duplicate { existing_token: String },
}

pub(crate) const SELECT_COLS: &str = "id, account_id, token, capability, operation, server_id, \
     parent_id, dest_parent_id, client_id, display_name, state, deferred_reason, deferred_until, \
     deferred_folder_id, defer_count, block_reason, result, delay_not_allowed, priority_stamp, \
     item_id, created_at";

pub(crate) fn map_row(row: &Row<'_>) -> rusqlite::Result<PendingRow> {
    let capability: String = row.get(3)?;
    let op_json: String = row.get(4)?;
    let reason_tag: Option<String> = row.get(11)?;
    let deferred_until: Option<String> = row.get(12)?;
    let deferred_folder: Option<String> = row.get(13)?;
    let block_reason: Option<String> = row.get(15)?;
    let result_json: Option<String> = row.get(16)?;
    let created_at: String = row.get(20)?;

    Ok(PendingRow {
        id: row.get(0)?,
        account_id: row.get(1)?,
        token: row.get(2)?,
        capability: parse_capability(&capability),
        operation: serde_json::from_str(&op_json).unwrap_or(Operation::Sync),
        server_id: row.get(5)?,
        parent_id: row.get(6)?,
        dest_parent_id: row.get(7)?,
        client_id: row.get(8)?,
        display_name: row.get(9)?,
        state: State::parse(&row.get::<_, String>(10)?),
        deferred_reason: DeferredReason::from_columns(reason_tag.as_deref(), deferred_folder),
        deferred_until: deferred_until.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|d| d.with_timezone(&Utc))
        }),
        defer_count: row.get::<_, i64>(14)? as u32,
        block_reason: block_reason.as_deref().and_then(BlockReason::parse),
        result: result_json.and_then(|s| serde_json::from_str(&s).ok()),
        delay_not_allowed: row.get::<_, i64>(17)? != 0,
        priority_stamp: row.get(18)?,
        item_id: row.get(19)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

fn parse_capability(s: &str) -> Capability {
    match s {
        "mail_reader" => Capability::MailReader,
        "cal_writer" => Capability::CalWriter,
        "contact_writer" => Capability::ContactWriter,
        "task_writer" => Capability::TaskWriter,
        _ => Capability::MailWriter,
    }
}

pub(crate) fn get_row_tx(conn: &Connection, id: i64) -> Result<Option<PendingRow>, LedgerError> {
    conn.query_row(
        &format!("SELECT {SELECT_COLS} FROM pendings WHERE id = ?1"),
        params![id],
        map_row,
    )
    .optional()
    .map_err(LedgerError::from)
}

pub(crate) fn load_account_rows_tx(
    conn: &Connection,
    account_id: &str,
) -> Result<Vec<PendingRow>, LedgerError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SELECT_COLS} FROM pendings WHERE account_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map(params![account_id], map_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Delete a pending row and its incoming edges, then release its successors
/// with a proceed outcome. Used for success, cancellation, and
/// superseded-by-server dispositions.
pub(crate) fn delete_row_tx(conn: &Connection, id: i64) -> Result<(), LedgerError> {
    graph::delete_incoming_edges(conn, id)?;
    conn.execute("DELETE FROM pendings WHERE id = ?1", params![id])?;
    let failures = graph::unblock_successors(conn, id, true)?;
    debug_assert!(failures.is_empty());
    Ok(())
}

/// The pending-operation ledger
pub struct PendingLedger {
    store: Store,
    status: StatusChannel,
}

impl PendingLedger {
    pub fn new(store: Store, status: StatusChannel) -> Self {
        Self { store, status }
    }

    /// Queue a mutation. Computes ordering edges against every unresolved
    /// operation for the account and inserts as eligible or blocked.
    pub fn enqueue(&self, new: NewPending) -> Result<Enqueued, LedgerError> {
        assert!(
            !new.server_id.is_empty(),
            "enqueue requires a non-empty server_id"
        );

        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;

        if new.operation.family().is_dedupable() {
            let candidates = load_account_rows_tx(&tx, &new.account_id)?;
            for existing in candidates
                .iter()
                .filter(|row| row.state != State::Failed)
                .filter(|row| row.operation.family() == new.operation.family())
            {
                if new.is_duplicate_of(existing) {
                    debug!(
                        op = new.operation.name(),
                        server_id = %new.server_id,
                        existing_token = %existing.token,
                        "Duplicate pending operation rejected"
                    );
                    return Ok(Enqueued::Duplicate {
                        existing_token: existing.token.clone(),
                    });
                }
            }
        }

        let preds = graph::compute_predecessors(
            &tx,
            &new.account_id,
            &new.operation,
            &new.server_id,
            new.parent_id.as_deref(),
            new.dest_parent_id.as_deref(),
        )?;
        let state = if preds.is_empty() {
            State::Eligible
        } else {
            State::PredBlocked
        };

        let token = Uuid::new_v4().to_string();
        tx.execute(
            "INSERT INTO pendings (account_id, token, capability, op_name, operation, server_id,
                 parent_id, dest_parent_id, client_id, display_name, state, delay_not_allowed,
                 item_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                new.account_id,
                token,
                new.operation.capability().as_str(),
                new.operation.name(),
                serde_json::to_string(&new.operation)?,
                new.server_id,
                new.parent_id,
                new.dest_parent_id,
                new.client_id,
                new.display_name,
                state.as_str(),
                new.delay_not_allowed as i64,
                new.item_id,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = tx.last_insert_rowid();
        graph::insert_edges(&tx, id, &preds)?;
        tx.commit()?;

        debug!(
            id,
            op = new.operation.name(),
            server_id = %new.server_id,
            state = state.as_str(),
            blocked_on = preds.len(),
            "Pending operation enqueued"
        );
        Ok(Enqueued::Inserted { id, token, state })
    }

    /// Hand an eligible operation to the transport. Panics if the operation
    /// is not eligible — dispatching from any other state is a caller bug.
    pub fn mark_dispatched(&self, id: i64) -> Result<(), LedgerError> {
        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let row = require_row(&tx, id);
        assert!(
            row.state == State::Eligible,
            "mark_dispatched on pending {id} in state {:?}",
            row.state
        );
        tx.execute(
            "UPDATE pendings SET state = 'dispatched' WHERE id = ?1",
            params![id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Terminal success: the record is removed, successors proceed, and the
    /// supplied result is reported.
    pub fn resolve_success(&self, id: i64, result: StatusResult) -> Result<(), LedgerError> {
        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let row = require_dispatched(&tx, id, "resolve_success");
        graph::delete_incoming_edges(&tx, id)?;
        tx.execute("DELETE FROM pendings WHERE id = ?1", params![id])?;
        let failures = graph::unblock_successors(&tx, id, true)?;
        debug_assert!(failures.is_empty());
        tx.commit()?;

        info!(id, op = row.operation.name(), "Pending operation succeeded");
        self.status
            .emit(&row.account_id, result, Some(row.token.clone()));
        Ok(())
    }

    /// Terminal failure: the record is kept with its result, blocked
    /// successors fail transitively, and an error notification is emitted.
    pub fn resolve_hard_fail(&self, id: i64, result: StatusResult) -> Result<(), LedgerError> {
        assert!(result.is_error(), "resolve_hard_fail requires an error result");
        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let row = require_dispatched(&tx, id, "resolve_hard_fail");
        let failures = fail_row_tx(&tx, id, result)?;
        tx.commit()?;

        warn!(id, op = row.operation.name(), "Pending operation failed");
        self.status
            .emit(&row.account_id, result, Some(row.token.clone()));
        for failure in failures {
            self.status
                .emit(&failure.account_id, failure.status, Some(failure.token));
        }
        Ok(())
    }

    /// Transient failure: park the operation until the given trigger fires.
    /// Past `MAX_DEFER_COUNT` the operation hard-fails with
    /// `fallback_result` instead of deferring again.
    pub fn resolve_deferred(
        &self,
        id: i64,
        reason: DeferredReason,
        fallback_result: StatusResult,
    ) -> Result<(), LedgerError> {
        self.defer(id, reason, None, fallback_result)
    }

    /// Like `resolve_deferred`, waiting for a wall-clock time.
    pub fn resolve_deferred_until(
        &self,
        id: i64,
        until: DateTime<Utc>,
        fallback_result: StatusResult,
    ) -> Result<(), LedgerError> {
        self.defer(id, DeferredReason::UntilTime, Some(until), fallback_result)
    }

    fn defer(
        &self,
        id: i64,
        reason: DeferredReason,
        until: Option<DateTime<Utc>>,
        fallback_result: StatusResult,
    ) -> Result<(), LedgerError> {
        assert!(
            fallback_result.is_error(),
            "defer fallback must be an error result"
        );
        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let row = require_dispatched(&tx, id, "resolve_deferred");

        let new_count = row.defer_count + 1;
        if new_count > MAX_DEFER_COUNT {
            let failures = fail_row_tx(&tx, id, fallback_result)?;
            tx.commit()?;
            warn!(
                id,
                op = row.operation.name(),
                "Defer limit reached, failing operation"
            );
            self.status
                .emit(&row.account_id, fallback_result, Some(row.token.clone()));
            for failure in failures {
                self.status
                    .emit(&failure.account_id, failure.status, Some(failure.token));
            }
            return Ok(());
        }

        tx.execute(
            "UPDATE pendings SET state = 'deferred', deferred_reason = ?2, deferred_until = ?3,
                 deferred_folder_id = ?4, defer_count = ?5
             WHERE id = ?1",
            params![
                id,
                reason.tag(),
                until.map(|t| t.to_rfc3339()),
                reason.folder_id(),
                new_count as i64,
            ],
        )?;
        tx.commit()?;
        debug!(
            id,
            reason = reason.tag(),
            defer_count = new_count,
            "Pending operation deferred"
        );
        Ok(())
    }

    /// Park the operation waiting on user action. Requires a dispatched
    /// operation; the stored result is always error-class by construction.
    pub fn resolve_user_blocked(
        &self,
        id: i64,
        reason: BlockReason,
        why: Why,
    ) -> Result<(), LedgerError> {
        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let row = require_dispatched(&tx, id, "resolve_user_blocked");
        let result = StatusResult::error(row.operation.failure_sub_kind(), why);
        tx.execute(
            "UPDATE pendings SET state = 'user_blocked', block_reason = ?2, result = ?3
             WHERE id = ?1",
            params![id, reason.as_str(), serde_json::to_string(&result)?],
        )?;
        tx.commit()?;

        info!(id, op = row.operation.name(), "Pending operation blocked on user");
        self.status
            .emit(&row.account_id, result, Some(row.token.clone()));
        Ok(())
    }

    /// Cancel a dispatched operation. With `run_failure_action` the caller's
    /// failure notification fires; without it the removal is silent.
    pub fn resolve_cancelled(&self, id: i64, run_failure_action: bool) -> Result<(), LedgerError> {
        self.cancel(id, run_failure_action, false)
    }

    /// Cancel from any non-terminal state, for callers that know the
    /// operation was never dispatched (user abort, account teardown).
    pub fn resolve_cancelled_from_any(
        &self,
        id: i64,
        run_failure_action: bool,
    ) -> Result<(), LedgerError> {
        self.cancel(id, run_failure_action, true)
    }

    fn cancel(
        &self,
        id: i64,
        run_failure_action: bool,
        ok_if_not_dispatched: bool,
    ) -> Result<(), LedgerError> {
        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let row = require_row(&tx, id);
        assert!(
            ok_if_not_dispatched || row.state == State::Dispatched,
            "resolve_cancelled on pending {id} in state {:?}",
            row.state
        );
        delete_row_tx(&tx, id)?;
        tx.commit()?;

        info!(id, op = row.operation.name(), "Pending operation cancelled");
        if run_failure_action {
            let result = StatusResult::error(row.operation.failure_sub_kind(), Why::Unknown);
            self.status
                .emit(&row.account_id, result, Some(row.token.clone()));
        }
        Ok(())
    }

    /// Move the operation to the front of its account's eligible queue.
    pub fn prioritize(&self, id: i64) -> Result<(), LedgerError> {
        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let row = require_row(&tx, id);
        tx.execute(
            "UPDATE pendings SET priority_stamp =
                 (SELECT COALESCE(MAX(priority_stamp), 0) + 1 FROM pendings WHERE account_id = ?2)
             WHERE id = ?1",
            params![id, row.account_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Fail every interactive (delay-not-allowed) operation for the account.
    /// Used when the account context is invalidated so in-flight interactive
    /// work does not silently hang.
    pub fn resolve_all_delay_not_allowed_as_failed(
        &self,
        account_id: &str,
    ) -> Result<u32, LedgerError> {
        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let rows = load_account_rows_tx(&tx, account_id)?;
        let mut emissions = Vec::new();
        let mut count = 0u32;
        for row in rows
            .iter()
            .filter(|row| row.delay_not_allowed && row.state != State::Failed)
        {
            let result =
                StatusResult::error(row.operation.failure_sub_kind(), Why::AccountInvalidated);
            let failures = fail_row_tx(&tx, row.id, result)?;
            emissions.push((row.account_id.clone(), result, row.token.clone()));
            for failure in failures {
                emissions.push((failure.account_id, failure.status, failure.token));
            }
            count += 1;
        }
        tx.commit()?;

        if count > 0 {
            info!(account_id, count, "Failed delay-not-allowed operations");
        }
        for (account, result, token) in emissions {
            self.status.emit(&account, result, Some(token));
        }
        Ok(count)
    }

    /// Next operation to hand to the transport, ordered by priority then age.
    pub fn next_eligible(&self, account_id: &str) -> Result<Option<PendingRow>, LedgerError> {
        let conn = self.store.connection()?;
        conn.query_row(
            &format!(
                "SELECT {SELECT_COLS} FROM pendings
                 WHERE account_id = ?1 AND state = 'eligible'
                 ORDER BY priority_stamp DESC, id ASC LIMIT 1"
            ),
            params![account_id],
            map_row,
        )
        .optional()
        .map_err(LedgerError::from)
    }

    /// Like `next_eligible`, restricted to one dispatch queue.
    pub fn next_eligible_for_capability(
        &self,
        account_id: &str,
        capability: Capability,
    ) -> Result<Option<PendingRow>, LedgerError> {
        let conn = self.store.connection()?;
        conn.query_row(
            &format!(
                "SELECT {SELECT_COLS} FROM pendings
                 WHERE account_id = ?1 AND state = 'eligible' AND capability = ?2
                 ORDER BY priority_stamp DESC, id ASC LIMIT 1"
            ),
            params![account_id, capability.as_str()],
            map_row,
        )
        .optional()
        .map_err(LedgerError::from)
    }

    pub fn get(&self, id: i64) -> Result<Option<PendingRow>, LedgerError> {
        let conn = self.store.connection()?;
        get_row_tx(&conn, id)
    }

    pub fn get_by_token(&self, account_id: &str, token: &str) -> Result<Option<PendingRow>, LedgerError> {
        let conn = self.store.connection()?;
        conn.query_row(
            &format!("SELECT {SELECT_COLS} FROM pendings WHERE account_id = ?1 AND token = ?2"),
            params![account_id, token],
            map_row,
        )
        .optional()
        .map_err(LedgerError::from)
    }
}

fn require_row(conn: &Connection, id: i64) -> PendingRow {
    match get_row_tx(conn, id) {
        Ok(Some(row)) => row,
        Ok(None) => panic!("pending operation {id} does not exist"),
        Err(err) => panic!("failed loading pending operation {id}: {err}"),
    }
}

fn require_dispatched(conn: &Connection, id: i64, caller: &str) -> PendingRow {
    let row = require_row(conn, id);
    assert!(
        row.state == State::Dispatched,
        "{caller} on pending {id} in state {:?}",
        row.state
    );
    row
}

/// Mark a row failed with the given result and cascade failure to its
/// blocked successors. The row itself is kept for inspection.
pub(crate) fn fail_row_tx(
    conn: &Connection,
    id: i64,
    result: StatusResult,
) -> Result<Vec<graph::CascadeFailure>, LedgerError> {
    graph::delete_incoming_edges(conn, id)?;
    conn.execute(
        "UPDATE pendings SET state = 'failed', result = ?2 WHERE id = ?1",
        params![id, serde_json::to_string(&result)?],
    )?;
    graph::unblock_successors(conn, id, false)
}

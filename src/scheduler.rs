//! Defer triggers: turning parked operations back into eligible ones
//!
//! Each `make_eligible_*` entry point fires one trigger kind and re-arms the
//! matching deferred operations. Firing is idempotent; a trigger with no
//! waiters is a no-op.

use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use crate::error::LedgerError;
use crate::store::Store;

/// Re-arms deferred operations when their trigger fires
pub struct DeferScheduler {
    store: Store,
}

impl DeferScheduler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Wake every time-deferred operation whose deadline has passed.
    pub fn make_eligible_on_time(&self, now: DateTime<Utc>) -> Result<u32, LedgerError> {
        let conn = self.store.connection()?;
        let count = conn.execute(
            "UPDATE pendings SET state = 'eligible', deferred_reason = NULL,
                 deferred_until = NULL, deferred_folder_id = NULL
             WHERE state = 'deferred' AND deferred_reason = 'until_time'
                 AND deferred_until IS NOT NULL AND deferred_until <= ?1",
            params![now.to_rfc3339()],
        )?;
        self.log_fired("until_time", count);
        Ok(count as u32)
    }

    /// A generic sync completed for the account.
    pub fn make_eligible_on_sync(&self, account_id: &str) -> Result<u32, LedgerError> {
        let conn = self.store.connection()?;
        let count = conn.execute(
            "UPDATE pendings SET state = 'eligible', deferred_reason = NULL,
                 deferred_until = NULL, deferred_folder_id = NULL
             WHERE account_id = ?1 AND state = 'deferred' AND deferred_reason = 'until_sync'",
            params![account_id],
        )?;
        self.log_fired("until_sync", count);
        Ok(count as u32)
    }

    /// A folder-hierarchy sync completed. Two-stage waiters advance to the
    /// plain sync trigger instead of waking; their defer count carries over.
    pub fn make_eligible_on_fsync(&self, account_id: &str) -> Result<u32, LedgerError> {
        let mut conn = self.store.connection()?;
        let tx = conn.transaction()?;
        let woken = tx.execute(
            "UPDATE pendings SET state = 'eligible', deferred_reason = NULL,
                 deferred_until = NULL, deferred_folder_id = NULL
             WHERE account_id = ?1 AND state = 'deferred' AND deferred_reason = 'until_fsync'",
            params![account_id],
        )?;
        let advanced = tx.execute(
            "UPDATE pendings SET deferred_reason = 'until_sync'
             WHERE account_id = ?1 AND state = 'deferred'
                 AND deferred_reason = 'until_fsync_then_sync'",
            params![account_id],
        )?;
        tx.commit()?;
        self.log_fired("until_fsync", woken);
        if advanced > 0 {
            debug!(account_id, count = advanced, "Two-stage waiters now waiting on sync");
        }
        Ok(woken as u32)
    }

    /// Metadata synced for one folder; wake only its waiters.
    pub fn make_eligible_on_fmetadata(
        &self,
        account_id: &str,
        folder_server_id: &str,
    ) -> Result<u32, LedgerError> {
        let conn = self.store.connection()?;
        let count = conn.execute(
            "UPDATE pendings SET state = 'eligible', deferred_reason = NULL,
                 deferred_until = NULL, deferred_folder_id = NULL
             WHERE account_id = ?1 AND state = 'deferred' AND deferred_reason = 'until_fmetadata'
                 AND deferred_folder_id = ?2",
            params![account_id, folder_server_id],
        )?;
        self.log_fired("until_fmetadata", count);
        Ok(count as u32)
    }

    fn log_fired(&self, trigger: &str, count: usize) {
        if count > 0 {
            debug!(trigger, count, "Deferred operations re-armed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::ledger::{DeferredReason, Enqueued, NewPending, PendingLedger, State};
    use crate::notify::StatusChannel;
    use crate::op::{ItemKind, Operation};
    use crate::status::{SetKind, StatusResult, SubKind, Why};

    struct Fixture {
        ledger: PendingLedger,
        scheduler: DeferScheduler,
    }

    fn fixture() -> Fixture {
        let store = Store::in_memory().unwrap();
        let (status, _rx) = StatusChannel::new();
        Fixture {
            ledger: PendingLedger::new(store.clone(), status),
            scheduler: DeferScheduler::new(store),
        }
    }

    fn fallback() -> StatusResult {
        StatusResult::error(SubKind::MoveFailed(SetKind::Email), Why::Network)
    }

    fn deferred_op(fx: &Fixture, reason: DeferredReason) -> i64 {
        let new = NewPending::new("acct", Operation::ItemMove(ItemKind::Email), "i1");
        let Enqueued::Inserted { id, .. } = fx.ledger.enqueue(new).unwrap() else {
            panic!("expected insert");
        };
        fx.ledger.mark_dispatched(id).unwrap();
        fx.ledger.resolve_deferred(id, reason, fallback()).unwrap();
        id
    }

    #[test]
    fn time_trigger_only_wakes_past_deadlines() {
        let fx = fixture();
        let new = NewPending::new("acct", Operation::ItemMove(ItemKind::Email), "i1");
        let Enqueued::Inserted { id, .. } = fx.ledger.enqueue(new).unwrap() else {
            panic!("expected insert");
        };
        fx.ledger.mark_dispatched(id).unwrap();
        let deadline = Utc::now() + Duration::minutes(10);
        fx.ledger
            .resolve_deferred_until(id, deadline, fallback())
            .unwrap();

        assert_eq!(fx.scheduler.make_eligible_on_time(Utc::now()).unwrap(), 0);
        assert_eq!(fx.ledger.get(id).unwrap().unwrap().state, State::Deferred);

        let after = deadline + Duration::seconds(1);
        assert_eq!(fx.scheduler.make_eligible_on_time(after).unwrap(), 1);
        let row = fx.ledger.get(id).unwrap().unwrap();
        assert_eq!(row.state, State::Eligible);
        assert!(row.deferred_reason.is_none());
        assert!(row.deferred_until.is_none());
    }

    #[test]
    fn sync_trigger_is_account_scoped() {
        let fx = fixture();
        let id = deferred_op(&fx, DeferredReason::UntilSync);
        assert_eq!(fx.scheduler.make_eligible_on_sync("other").unwrap(), 0);
        assert_eq!(fx.ledger.get(id).unwrap().unwrap().state, State::Deferred);
        assert_eq!(fx.scheduler.make_eligible_on_sync("acct").unwrap(), 1);
        assert_eq!(fx.ledger.get(id).unwrap().unwrap().state, State::Eligible);
    }

    #[test]
    fn two_stage_waiter_advances_then_wakes() {
        let fx = fixture();
        let id = deferred_op(&fx, DeferredReason::UntilFSyncThenSync);

        // First stage: the hierarchy sync only advances it.
        assert_eq!(fx.scheduler.make_eligible_on_fsync("acct").unwrap(), 0);
        let row = fx.ledger.get(id).unwrap().unwrap();
        assert_eq!(row.state, State::Deferred);
        assert_eq!(row.deferred_reason, Some(DeferredReason::UntilSync));
        assert_eq!(row.defer_count, 1);

        // Second stage: the generic sync wakes it.
        assert_eq!(fx.scheduler.make_eligible_on_sync("acct").unwrap(), 1);
        assert_eq!(fx.ledger.get(id).unwrap().unwrap().state, State::Eligible);
    }

    #[test]
    fn fsync_trigger_wakes_plain_fsync_waiters() {
        let fx = fixture();
        let id = deferred_op(&fx, DeferredReason::UntilFSync);
        assert_eq!(fx.scheduler.make_eligible_on_fsync("acct").unwrap(), 1);
        assert_eq!(fx.ledger.get(id).unwrap().unwrap().state, State::Eligible);
    }

    #[test]
    fn fmetadata_trigger_is_folder_scoped() {
        let fx = fixture();
        let id = deferred_op(
            &fx,
            DeferredReason::UntilFMetaData {
                folder_server_id: "f1".into(),
            },
        );
        assert_eq!(
            fx.scheduler.make_eligible_on_fmetadata("acct", "f2").unwrap(),
            0
        );
        assert_eq!(fx.ledger.get(id).unwrap().unwrap().state, State::Deferred);
        assert_eq!(
            fx.scheduler.make_eligible_on_fmetadata("acct", "f1").unwrap(),
            1
        );
        assert_eq!(fx.ledger.get(id).unwrap().unwrap().state, State::Eligible);
    }

    #[test]
    fn firing_with_no_waiters_is_a_no_op() {
        let fx = fixture();
        assert_eq!(fx.scheduler.make_eligible_on_sync("acct").unwrap(), 0);
        assert_eq!(fx.scheduler.make_eligible_on_fsync("acct").unwrap(), 0);
        assert_eq!(fx.scheduler.make_eligible_on_time(Utc::now()).unwrap(), 0);
    }
}

//! Draining eligible operations to a transport
//!
//! The dispatcher owns no protocol knowledge. It pulls eligible operations
//! one at a time, marks them dispatched, awaits the transport's outcome, and
//! feeds that outcome back into the ledger through the matching resolve call.
//! One operation is in flight per drain loop; ordering within an account is
//! the ledger's priority order.

use tracing::debug;

use crate::error::LedgerError;
use crate::ledger::{BlockReason, DeferredReason, PendingLedger, PendingRow};
use crate::status::{StatusResult, Why};

/// What the transport reports back for one dispatched operation
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Success(StatusResult),
    HardFail(StatusResult),
    Defer(DeferredReason, StatusResult),
    UserBlocked(BlockReason, Why),
    Cancelled,
}

/// Boundary to the protocol layer. Implementations perform the actual
/// network exchange for one operation.
pub trait Transport {
    fn execute(
        &self,
        op: &PendingRow,
    ) -> impl std::future::Future<Output = DispatchOutcome> + Send;
}

pub struct Dispatcher {
    ledger: PendingLedger,
}

impl Dispatcher {
    pub fn new(ledger: PendingLedger) -> Self {
        Self { ledger }
    }

    /// Drain the account's eligible queue until it is empty. Returns the
    /// number of operations dispatched.
    pub async fn drain<T: Transport>(
        &self,
        account_id: &str,
        transport: &T,
    ) -> Result<u32, LedgerError> {
        let mut dispatched = 0u32;
        while let Some(row) = self.ledger.next_eligible(account_id)? {
            self.ledger.mark_dispatched(row.id)?;
            debug!(id = row.id, op = row.operation.name(), "Dispatching operation");
            let outcome = transport.execute(&row).await;
            dispatched += 1;
            match outcome {
                DispatchOutcome::Success(result) => {
                    self.ledger.resolve_success(row.id, result)?;
                }
                DispatchOutcome::HardFail(result) => {
                    self.ledger.resolve_hard_fail(row.id, result)?;
                }
                DispatchOutcome::Defer(reason, fallback) => {
                    self.ledger.resolve_deferred(row.id, reason, fallback)?;
                }
                DispatchOutcome::UserBlocked(reason, why) => {
                    self.ledger.resolve_user_blocked(row.id, reason, why)?;
                }
                DispatchOutcome::Cancelled => {
                    self.ledger.resolve_cancelled(row.id, false)?;
                }
            }
        }
        Ok(dispatched)
    }
}

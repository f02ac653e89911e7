//! Sync Ledger - durable pending-operation queue with conflict resolution
//!
//! Core state machine for an offline-capable sync client: local mutations are
//! queued as pending operations, ordered by a dependency graph, drained to a
//! transport, retried or deferred on transient failure, and reconciled
//! against inbound server deltas when the two sides disagree.
//!
//! ## Module Organization
//!
//! - `store`: SQLite-backed durable state (connection pool, schema)
//! - `op`: the closed set of operation kinds and their classification
//! - `ledger`: pending-operation queue and resolution state machine
//! - `graph`: dependency edges and cascading unblock/failure
//! - `scheduler`: defer triggers (time, sync, folder-sync, metadata)
//! - `path_index`: server-confirmed topology for dominance queries
//! - `objects`: local folder/item cache and the lost-and-found
//! - `reconcile`: inbound delta resolution against the ledger
//! - `dispatcher`: draining eligible operations to a transport
//! - `notify`: typed status notifications
//! - `status`, `error`: result vocabulary and error types

mod dispatcher;
mod error;
mod graph;
mod ledger;
mod notify;
mod objects;
mod op;
mod path_index;
mod reconcile;
mod scheduler;
mod status;
mod store;

pub use dispatcher::{DispatchOutcome, Dispatcher, Transport};
pub use error::LedgerError;
pub use ledger::{
    BlockReason, DeferredReason, Enqueued, NewPending, PendingLedger, PendingRow, State,
    MAX_DEFER_COUNT,
};
pub use notify::{Notification, StatusChannel};
pub use objects::{
    FolderKind, FolderRecord, ItemRecord, ObjectStore, LOST_AND_FOUND_ID, ROOT_ID,
};
pub use op::{Capability, ItemKind, OpFamily, Operation};
pub use path_index::PathIndex;
pub use reconcile::{
    DeltaCommand, DeltaKind, DeltaObject, ReconcileEngine, CLIENT_CREATED_SUFFIX,
    CLIENT_MOVED_SUFFIX,
};
pub use scheduler::DeferScheduler;
pub use status::{ResultKind, SetKind, StatusResult, SubKind, Why};
pub use store::Store;

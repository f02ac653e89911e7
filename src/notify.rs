//! Typed notification stream
//!
//! The core performs no rendering or I/O of its own; UI collaborators hold
//! the receiving half of a flume channel and consume `Notification` values
//! as ledger state changes become user-visible.

use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::status::StatusResult;

/// One user-visible signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub account_id: String,
    pub status: StatusResult,
    /// Correlation token of the pending operation that produced this signal,
    /// when there is one. List-level set-changed signals carry none.
    pub token: Option<String>,
}

/// Sending half of the notification stream, shared by every component that
/// emits signals.
#[derive(Clone)]
pub struct StatusChannel {
    tx: Sender<Notification>,
}

impl StatusChannel {
    /// Create a channel pair. The caller keeps the receiver.
    pub fn new() -> (Self, Receiver<Notification>) {
        let (tx, rx) = flume::unbounded();
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, account_id: &str, status: StatusResult, token: Option<String>) {
        let notification = Notification {
            account_id: account_id.to_string(),
            status,
            token,
        };
        if self.tx.send(notification).is_err() {
            // Receiver dropped; the embedding app no longer listens.
            debug!("Notification receiver disconnected, dropping signal");
        }
    }
}

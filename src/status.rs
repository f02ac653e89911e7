//! Status vocabulary shared by resolution results and notifications
//!
//! Every terminal outcome and every user-visible signal is expressed as a
//! `StatusResult`: a kind (info vs error), a sub-kind naming what happened,
//! and an optional reason. The same value is stored as JSON on a failed
//! pending row and delivered over the notification channel.

use serde::{Deserialize, Serialize};

/// Which object list a signal is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SetKind {
    Folder,
    Email,
    Calendar,
    Contact,
    Task,
}

/// Severity of a status signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    Info,
    Error,
}

/// The fixed signal vocabulary: list-level "set changed" plus per-kind
/// single-operation outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", content = "set", rename_all = "snake_case")]
pub enum SubKind {
    SetChanged(SetKind),
    CreateSucceeded(SetKind),
    CreateFailed(SetKind),
    UpdateSucceeded(SetKind),
    UpdateFailed(SetKind),
    DeleteSucceeded(SetKind),
    DeleteFailed(SetKind),
    MoveSucceeded(SetKind),
    MoveFailed(SetKind),
    RespondSucceeded,
    RespondFailed,
    SendSucceeded,
    SendFailed,
    DownloadSucceeded,
    DownloadFailed,
    SyncSucceeded,
    SyncFailed,
}

/// Why a failure happened, for error-class results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Why {
    Unknown,
    AccessDeniedOrBlocked,
    MissingOnServer,
    ServerError,
    Network,
    TooManyRetries,
    PredecessorFailed,
    AccountInvalidated,
}

/// Outcome record attached to resolutions and notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    pub kind: ResultKind,
    pub sub_kind: SubKind,
    pub why: Why,
}

impl StatusResult {
    pub fn info(sub_kind: SubKind) -> Self {
        Self {
            kind: ResultKind::Info,
            sub_kind,
            why: Why::Unknown,
        }
    }

    pub fn error(sub_kind: SubKind, why: Why) -> Self {
        Self {
            kind: ResultKind::Error,
            sub_kind,
            why,
        }
    }

    pub fn is_error(&self) -> bool {
        self.kind == ResultKind::Error
    }
}

//! The closed set of queueable operations
//!
//! Every mutation the client can queue is a variant here. Ordering rules,
//! notification sub-kinds, capability queues, and duplicate-detection
//! families are all exhaustive matches over this enum, so adding a variant
//! forces a decision at every table.

use serde::{Deserialize, Serialize};

use crate::status::{SetKind, SubKind};

/// Item object kinds the remote store synchronizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Email,
    Calendar,
    Contact,
    Task,
}

impl ItemKind {
    pub fn set_kind(self) -> SetKind {
        match self {
            ItemKind::Email => SetKind::Email,
            ItemKind::Calendar => SetKind::Calendar,
            ItemKind::Contact => SetKind::Contact,
            ItemKind::Task => SetKind::Task,
        }
    }
}

/// Which dispatch queue an operation belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    MailWriter,
    MailReader,
    CalWriter,
    ContactWriter,
    TaskWriter,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::MailWriter => "mail_writer",
            Capability::MailReader => "mail_reader",
            Capability::CalWriter => "cal_writer",
            Capability::ContactWriter => "contact_writer",
            Capability::TaskWriter => "task_writer",
        }
    }
}

/// Duplicate-detection family. Only idempotent read-style operations are
/// dedupable; comparing duplicates across families is a caller error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpFamily {
    FolderWrite,
    ItemWrite,
    Send,
    Download,
    Sync,
}

impl OpFamily {
    pub fn is_dedupable(self) -> bool {
        matches!(self, OpFamily::Download | OpFamily::Sync)
    }
}

/// What object an operation addresses, for ordering-rule checks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjKind {
    Folder,
    Item(ItemKind),
}

/// A queueable mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "kind", rename_all = "snake_case")]
pub enum Operation {
    FolderCreate,
    FolderDelete,
    /// Covers both rename (new display name) and move (dest parent set).
    FolderUpdate,
    ItemCreate(ItemKind),
    ItemUpdate(ItemKind),
    ItemDelete(ItemKind),
    ItemMove(ItemKind),
    MeetingRespond,
    EmailSend,
    /// Body or attachment fetch for an already-synced item.
    Download(ItemKind),
    /// Generic "go sync now" poke.
    Sync,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::FolderCreate => "folder_create",
            Operation::FolderDelete => "folder_delete",
            Operation::FolderUpdate => "folder_update",
            Operation::ItemCreate(_) => "item_create",
            Operation::ItemUpdate(_) => "item_update",
            Operation::ItemDelete(_) => "item_delete",
            Operation::ItemMove(_) => "item_move",
            Operation::MeetingRespond => "meeting_respond",
            Operation::EmailSend => "email_send",
            Operation::Download(_) => "download",
            Operation::Sync => "sync",
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            Operation::FolderCreate | Operation::FolderDelete | Operation::FolderUpdate => {
                Capability::MailWriter
            }
            Operation::ItemCreate(kind)
            | Operation::ItemUpdate(kind)
            | Operation::ItemDelete(kind)
            | Operation::ItemMove(kind) => match kind {
                ItemKind::Email => Capability::MailWriter,
                ItemKind::Calendar => Capability::CalWriter,
                ItemKind::Contact => Capability::ContactWriter,
                ItemKind::Task => Capability::TaskWriter,
            },
            Operation::MeetingRespond => Capability::CalWriter,
            Operation::EmailSend => Capability::MailWriter,
            Operation::Download(_) => Capability::MailReader,
            Operation::Sync => Capability::MailReader,
        }
    }

    pub fn family(&self) -> OpFamily {
        match self {
            Operation::FolderCreate | Operation::FolderDelete | Operation::FolderUpdate => {
                OpFamily::FolderWrite
            }
            Operation::ItemCreate(_)
            | Operation::ItemUpdate(_)
            | Operation::ItemDelete(_)
            | Operation::ItemMove(_)
            | Operation::MeetingRespond => OpFamily::ItemWrite,
            Operation::EmailSend => OpFamily::Send,
            Operation::Download(_) => OpFamily::Download,
            Operation::Sync => OpFamily::Sync,
        }
    }

    /// Which list a success/failure of this operation affects.
    pub fn set_kind(&self) -> SetKind {
        match self {
            Operation::FolderCreate | Operation::FolderDelete | Operation::FolderUpdate => {
                SetKind::Folder
            }
            Operation::ItemCreate(kind)
            | Operation::ItemUpdate(kind)
            | Operation::ItemDelete(kind)
            | Operation::ItemMove(kind)
            | Operation::Download(kind) => kind.set_kind(),
            Operation::MeetingRespond => SetKind::Calendar,
            Operation::EmailSend | Operation::Sync => SetKind::Email,
        }
    }

    pub fn success_sub_kind(&self) -> SubKind {
        match self {
            Operation::FolderCreate => SubKind::CreateSucceeded(SetKind::Folder),
            Operation::FolderDelete => SubKind::DeleteSucceeded(SetKind::Folder),
            Operation::FolderUpdate => SubKind::UpdateSucceeded(SetKind::Folder),
            Operation::ItemCreate(kind) => SubKind::CreateSucceeded(kind.set_kind()),
            Operation::ItemUpdate(kind) => SubKind::UpdateSucceeded(kind.set_kind()),
            Operation::ItemDelete(kind) => SubKind::DeleteSucceeded(kind.set_kind()),
            Operation::ItemMove(kind) => SubKind::MoveSucceeded(kind.set_kind()),
            Operation::MeetingRespond => SubKind::RespondSucceeded,
            Operation::EmailSend => SubKind::SendSucceeded,
            Operation::Download(_) => SubKind::DownloadSucceeded,
            Operation::Sync => SubKind::SyncSucceeded,
        }
    }

    pub fn failure_sub_kind(&self) -> SubKind {
        match self {
            Operation::FolderCreate => SubKind::CreateFailed(SetKind::Folder),
            Operation::FolderDelete => SubKind::DeleteFailed(SetKind::Folder),
            Operation::FolderUpdate => SubKind::UpdateFailed(SetKind::Folder),
            Operation::ItemCreate(kind) => SubKind::CreateFailed(kind.set_kind()),
            Operation::ItemUpdate(kind) => SubKind::UpdateFailed(kind.set_kind()),
            Operation::ItemDelete(kind) => SubKind::DeleteFailed(kind.set_kind()),
            Operation::ItemMove(kind) => SubKind::MoveFailed(kind.set_kind()),
            Operation::MeetingRespond => SubKind::RespondFailed,
            Operation::EmailSend => SubKind::SendFailed,
            Operation::Download(_) => SubKind::DownloadFailed,
            Operation::Sync => SubKind::SyncFailed,
        }
    }

    pub(crate) fn object_kind(&self) -> Option<ObjKind> {
        match self {
            Operation::FolderCreate | Operation::FolderDelete | Operation::FolderUpdate => {
                Some(ObjKind::Folder)
            }
            Operation::ItemCreate(kind)
            | Operation::ItemUpdate(kind)
            | Operation::ItemDelete(kind)
            | Operation::ItemMove(kind)
            | Operation::Download(kind) => Some(ObjKind::Item(*kind)),
            Operation::MeetingRespond => Some(ObjKind::Item(ItemKind::Calendar)),
            Operation::EmailSend | Operation::Sync => None,
        }
    }

    pub(crate) fn is_create(&self) -> bool {
        matches!(self, Operation::FolderCreate | Operation::ItemCreate(_))
    }

    pub(crate) fn is_delete(&self) -> bool {
        matches!(self, Operation::FolderDelete | Operation::ItemDelete(_))
    }

    pub(crate) fn is_move(&self) -> bool {
        matches!(self, Operation::FolderUpdate | Operation::ItemMove(_))
    }

    /// Update-class: operations that assume their target already exists on
    /// the server (update, rename, move, respond).
    pub(crate) fn is_update_class(&self) -> bool {
        matches!(
            self,
            Operation::FolderUpdate
                | Operation::ItemUpdate(_)
                | Operation::ItemMove(_)
                | Operation::MeetingRespond
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_round_trips_through_json() {
        for op in [
            Operation::FolderCreate,
            Operation::ItemMove(ItemKind::Calendar),
            Operation::Download(ItemKind::Email),
            Operation::Sync,
        ] {
            let json = serde_json::to_string(&op).unwrap();
            let back: Operation = serde_json::from_str(&json).unwrap();
            assert_eq!(op, back);
        }
    }

    #[test]
    fn only_read_style_families_are_dedupable() {
        assert!(Operation::Download(ItemKind::Email).family().is_dedupable());
        assert!(Operation::Sync.family().is_dedupable());
        assert!(!Operation::FolderCreate.family().is_dedupable());
        assert!(!Operation::EmailSend.family().is_dedupable());
    }
}

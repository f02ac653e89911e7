//! Unified error type for the ledger core
//!
//! Expected failures (storage trouble, serialization trouble) are returned as
//! `LedgerError` values. Caller contract violations — resolving an operation
//! from an invalid state, comparing duplicates across incompatible operation
//! families — are hard assertions, not error values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for all fallible ledger operations
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database pool error: {0}")]
    Pool(String),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Pending operation not found: {0}")]
    NotFound(i64),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for LedgerError {
    fn from(err: r2d2::Error) -> Self {
        LedgerError::Pool(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Serialize(err.to_string())
    }
}

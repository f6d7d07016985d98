use rasid_core::{LedgerError, Reference};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Database stayed busy after {attempts} attempts")]
    Conflict { attempts: u32 },
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn not_found(reference: Reference) -> Self {
        StoreError::Ledger(LedgerError::ReferenceNotFound(reference))
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, StoreError::Database(e) if is_busy(e))
    }
}

/// SQLITE_BUSY, SQLITE_LOCKED, and their extended codes.
pub(crate) fn is_busy(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => matches!(
            db.code().as_deref(),
            Some("5") | Some("6") | Some("261") | Some("262") | Some("517")
        ),
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

use rasid_core::{LedgerError, Reference};
use rasid_storage::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<LedgerError> for PipelineError {
    fn from(e: LedgerError) -> Self {
        PipelineError::Store(StoreError::Ledger(e))
    }
}

impl PipelineError {
    pub fn not_found(reference: Reference) -> Self {
        PipelineError::Store(StoreError::not_found(reference))
    }

    /// The ledger-level cause, when there is one.
    pub fn ledger(&self) -> Option<&LedgerError> {
        match self {
            PipelineError::Store(StoreError::Ledger(e)) => Some(e),
            _ => None,
        }
    }
}

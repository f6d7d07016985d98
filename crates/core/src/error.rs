use thiserror::Error;

use crate::candidate::CandidateStatus;

/// What a stale reference pointed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    Account(i64),
    Category(i64),
    Candidate(i64),
    Transaction(i64),
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reference::Account(id) => write!(f, "account {id}"),
            Reference::Category(id) => write!(f, "category {id}"),
            Reference::Candidate(id) => write!(f, "candidate {id}"),
            Reference::Transaction(id) => write!(f, "transaction {id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    #[error("Cannot move candidate from {from} to {to}")]
    InvalidTransition {
        from: CandidateStatus,
        to: CandidateStatus,
    },
    #[error("Referenced {0} does not exist")]
    ReferenceNotFound(Reference),
    #[error("Amount not representable: {0}")]
    PrecisionOverflow(String),
    #[error("Candidate is missing required field: {0}")]
    Incomplete(&'static str),
    #[error("Transfer needs a destination account different from the source")]
    InvalidTransfer,
}

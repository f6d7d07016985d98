pub mod account;
pub mod candidate;
pub mod confidence;
pub mod config;
pub mod error;
pub mod money;
pub mod transaction;

pub use account::{Account, AccountId, AccountKind, Category, CategoryId, UserId};
pub use candidate::{
    CandidateFields, CandidateStatus, CandidateTransaction, NewCandidate, ReviewAction, SourceKind,
    SourcePattern,
};
pub use confidence::Confidence;
pub use config::{
    AuthConfig, CapabilityConfig, ConfigError, DatabaseConfig, IndexConfig, MissingCategoryPolicy,
    PipelineConfig, RasidConfig, ServerConfig,
};
pub use error::{LedgerError, Reference};
pub use money::Money;
pub use transaction::{
    normalize_payee, CommittedTransaction, LedgerEntry, Posting, TransactionType, UnvalidatedEntry,
    UNKNOWN_PAYEE,
};

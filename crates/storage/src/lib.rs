pub mod candidates;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod ivf;
pub mod ledger;

pub use candidates::{
    delete_candidate, get_candidate, insert_candidate, list_candidates, pending_count,
    reject_candidate, CandidateListing,
};
pub use db::{
    create_account, create_category, create_db, delete_category, delete_user, ensure_user,
    get_account, get_category, get_setting, insert_source_pattern, list_accounts,
    list_categories, list_source_patterns, seed_source_patterns, set_account_active,
    set_category_hidden, set_setting, suggest_account, DbPool, DEFAULT_SOURCE_PATTERNS,
};
pub use embeddings::{PayeeIndex, PayeeMatch, PayeeRecord};
pub use error::StoreError;
pub use ledger::{
    get_transaction, list_transactions, CommitPolicy, CommitRequest, LedgerCommitter,
};

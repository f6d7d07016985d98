use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rasid_core::{
    AccountId, CandidateStatus, CategoryId, CommittedTransaction, LedgerEntry, LedgerError,
    MissingCategoryPolicy, Money, PipelineConfig, Reference, ReviewAction, TransactionType,
    UnvalidatedEntry, UserId, UNKNOWN_PAYEE,
};
use sqlx::{FromRow, SqliteConnection};

use crate::candidates::transition;
use crate::db::DbPool;
use crate::embeddings::PayeeIndex;
use crate::error::StoreError;

#[derive(Debug, Clone, Copy)]
pub struct CommitPolicy {
    pub missing_category: MissingCategoryPolicy,
    /// Extra attempts after the first when the database reports busy.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for CommitPolicy {
    fn default() -> Self {
        Self {
            missing_category: MissingCategoryPolicy::Drop,
            retries: 3,
            backoff: Duration::from_millis(25),
        }
    }
}

impl From<&PipelineConfig> for CommitPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            missing_category: config.missing_category_policy,
            retries: config.commit_retries,
            backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }
}

/// Everything one commit needs.
#[derive(Debug, Clone)]
pub struct CommitRequest<'a> {
    pub entry: UnvalidatedEntry,
    /// The inbox row to flip out of `pending`, and how.
    pub candidate: Option<(i64, ReviewAction)>,
    /// Vector for the payee, if the capability produced one.
    pub embedding: Option<&'a [f32]>,
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    id: i64,
    user_id: i64,
    account_id: i64,
    category_id: Option<i64>,
    payee_name: String,
    amount_cents: i64,
    transaction_type: String,
    date: NaiveDate,
    memo: Option<String>,
    is_cleared: bool,
    raw_text: Option<String>,
    candidate_id: Option<i64>,
    transfer_peer_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for CommittedTransaction {
    type Error = StoreError;

    fn try_from(r: TransactionRow) -> Result<Self, StoreError> {
        Ok(CommittedTransaction {
            id: r.id,
            user_id: UserId(r.user_id),
            account_id: AccountId(r.account_id),
            category_id: r.category_id.map(CategoryId),
            payee_name: r.payee_name,
            amount: Money::from_cents(r.amount_cents),
            transaction_type: TransactionType::from_str(&r.transaction_type)
                .map_err(StoreError::Corrupt)?,
            date: r.date,
            memo: r.memo,
            is_cleared: r.is_cleared,
            raw_text: r.raw_text,
            candidate_id: r.candidate_id,
            transfer_peer_id: r.transfer_peer_id,
            created_at: r.created_at,
        })
    }
}

const TRANSACTION_COLUMNS: &str = "id, user_id, account_id, category_id, payee_name, amount_cents, \
     transaction_type, date, memo, is_cleared, raw_text, candidate_id, transfer_peer_id, created_at";

pub async fn get_transaction(
    pool: &DbPool,
    user: UserId,
    id: i64,
) -> Result<Option<CommittedTransaction>, StoreError> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ? AND user_id = ?"
    ))
    .bind(id)
    .bind(user.0)
    .fetch_optional(pool)
    .await?;
    row.map(CommittedTransaction::try_from).transpose()
}

pub async fn list_transactions(
    pool: &DbPool,
    user: UserId,
) -> Result<Vec<CommittedTransaction>, StoreError> {
    let rows = sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE user_id = ? ORDER BY date DESC, id DESC"
    ))
    .bind(user.0)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(CommittedTransaction::try_from).collect()
}

/// Applies approved entries to the ledger: the transaction row(s), account balances,
/// category activity, the payee index, and the inbox status all land in one database
/// transaction or not at all.
#[derive(Clone)]
pub struct LedgerCommitter {
    pool: DbPool,
    index: PayeeIndex,
    policy: CommitPolicy,
}

impl LedgerCommitter {
    pub fn new(pool: DbPool, index: PayeeIndex, policy: CommitPolicy) -> Self {
        Self { pool, index, policy }
    }

    pub fn index(&self) -> &PayeeIndex {
        &self.index
    }

    /// Returns the source leg. Validation runs before the first write.
    pub async fn commit(
        &self,
        request: CommitRequest<'_>,
    ) -> Result<CommittedTransaction, StoreError> {
        let entry = LedgerEntry::validate(request.entry)?;
        if let Some((_, action)) = request.candidate {
            if !action.target().commits() {
                return Err(LedgerError::InvalidTransition {
                    from: CandidateStatus::Pending,
                    to: action.target(),
                }
                .into());
            }
        }

        let mut attempt = 0;
        let committed = loop {
            attempt += 1;
            match self.commit_once(&entry, request.candidate, request.embedding).await {
                Err(e) if e.is_busy() && attempt <= self.policy.retries => {
                    tracing::warn!(attempt, "ledger busy, retrying commit: {e}");
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                }
                Err(e) if e.is_busy() => return Err(StoreError::Conflict { attempts: attempt }),
                other => break other?,
            }
        };

        tracing::info!(
            transaction_id = committed.id,
            candidate_id = ?request.candidate.map(|(id, _)| id),
            amount = %committed.amount,
            kind = %committed.transaction_type,
            "committed transaction"
        );

        if let Err(e) = self.index.maybe_train().await {
            tracing::warn!("payee index training failed: {e}");
        }
        Ok(committed)
    }

    async fn commit_once(
        &self,
        entry: &LedgerEntry,
        candidate: Option<(i64, ReviewAction)>,
        embedding: Option<&[f32]>,
    ) -> Result<CommittedTransaction, StoreError> {
        let user = entry.user_id;
        let mut tx = self.pool.begin().await?;

        // First statement: claims the inbox row and the write lock together.
        if let Some((id, action)) = candidate {
            transition(&mut tx, user, id, action).await?;
        }

        require_account(&mut tx, user, entry.account_id).await?;
        if let Some(to) = entry.transfer_account_id {
            require_account(&mut tx, user, to).await?;
        }

        let mut entry = entry.clone();
        entry.category_id = match entry.category_id {
            Some(c) if category_exists(&mut tx, user, c).await? => Some(c),
            Some(c) => match self.policy.missing_category {
                MissingCategoryPolicy::Drop => {
                    tracing::warn!(
                        category_id = c.0,
                        "category vanished before commit, dropping it"
                    );
                    None
                }
                MissingCategoryPolicy::Reject => {
                    return Err(StoreError::not_found(Reference::Category(c.0)));
                }
            },
            None => None,
        };

        let now = Utc::now();
        let postings = entry.postings();
        let mut legs = Vec::with_capacity(postings.len());
        for (i, posting) in postings.iter().enumerate() {
            let row = sqlx::query_as::<_, TransactionRow>(&format!(
                r#"
                INSERT INTO transactions
                    (user_id, account_id, category_id, payee_name, amount_cents, transaction_type,
                     date, memo, raw_text, candidate_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING {TRANSACTION_COLUMNS}
                "#
            ))
            .bind(user.0)
            .bind(posting.account_id.0)
            .bind(if i == 0 { entry.category_id.map(|c| c.0) } else { None })
            .bind(&entry.payee_name)
            .bind(posting.amount.try_to_cents()?)
            .bind(entry.transaction_type.to_string())
            .bind(entry.date)
            .bind(&entry.memo)
            .bind(&entry.raw_text)
            .bind(entry.candidate_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;
            legs.push(row);
        }

        if let [source, destination] = legs.as_mut_slice() {
            for (id, peer) in [(source.id, destination.id), (destination.id, source.id)] {
                sqlx::query("UPDATE transactions SET transfer_peer_id = ? WHERE id = ?")
                    .bind(peer)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            source.transfer_peer_id = Some(destination.id);
            destination.transfer_peer_id = Some(source.id);
        }

        for posting in &postings {
            sqlx::query(
                "UPDATE accounts SET balance_cents = balance_cents + ?, last_used_at = ? \
                 WHERE id = ? AND user_id = ?",
            )
            .bind(posting.amount.try_to_cents()?)
            .bind(now)
            .bind(posting.account_id.0)
            .bind(user.0)
            .execute(&mut *tx)
            .await?;
        }

        if let Some((category, amount)) = entry.category_delta() {
            sqlx::query(
                "UPDATE categories SET activity_cents = activity_cents + ? WHERE id = ? AND user_id = ?",
            )
            .bind(amount.try_to_cents()?)
            .bind(category.0)
            .bind(user.0)
            .execute(&mut *tx)
            .await?;
        }

        if entry.payee_name != UNKNOWN_PAYEE {
            self.index
                .upsert_with(&mut tx, user, &entry.payee_name, entry.category_id, embedding)
                .await?;
        }

        let source = legs.swap_remove(0);
        if let Some((candidate_id, _)) = candidate {
            sqlx::query(
                r#"
                UPDATE pending_transactions SET
                    committed_transaction_id = ?, payee = ?, amount_cents = ?, date = ?,
                    transaction_type = ?, suggested_account_id = ?, suggested_category_id = ?
                WHERE id = ? AND user_id = ?
                "#,
            )
            .bind(source.id)
            .bind(&entry.payee_name)
            .bind(entry.amount_cents)
            .bind(entry.date)
            .bind(entry.transaction_type.to_string())
            .bind(entry.account_id.0)
            .bind(entry.category_id.map(|c| c.0))
            .bind(candidate_id)
            .bind(user.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        source.try_into()
    }

    /// Deletes a committed transaction (both legs of a transfer) and applies the exact
    /// inverse of its balance and activity deltas. Returns the removed row ids.
    pub async fn reverse(&self, user: UserId, transaction_id: i64) -> Result<Vec<i64>, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.reverse_once(user, transaction_id).await {
                Err(e) if e.is_busy() && attempt <= self.policy.retries => {
                    tracing::warn!(attempt, "ledger busy, retrying reversal: {e}");
                    tokio::time::sleep(self.policy.backoff * attempt).await;
                }
                Err(e) if e.is_busy() => return Err(StoreError::Conflict { attempts: attempt }),
                Ok(ids) => {
                    tracing::info!(transaction_id, legs = ids.len(), "reversed transaction");
                    return Ok(ids);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reverse_once(
        &self,
        user: UserId,
        transaction_id: i64,
    ) -> Result<Vec<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let first = fetch_row(&mut tx, user, transaction_id)
            .await?
            .ok_or_else(|| StoreError::not_found(Reference::Transaction(transaction_id)))?;
        let mut legs = vec![first];
        if let Some(peer) = legs[0].transfer_peer_id {
            if let Some(row) = fetch_row(&mut tx, user, peer).await? {
                legs.push(row);
            }
        }

        for leg in &legs {
            sqlx::query(
                "UPDATE accounts SET balance_cents = balance_cents - ? WHERE id = ? AND user_id = ?",
            )
            .bind(leg.amount_cents)
            .bind(leg.account_id)
            .bind(user.0)
            .execute(&mut *tx)
            .await?;

            if leg.transaction_type == TransactionType::Expense.to_string() {
                if let Some(category) = leg.category_id {
                    sqlx::query(
                        "UPDATE categories SET activity_cents = activity_cents - ? \
                         WHERE id = ? AND user_id = ?",
                    )
                    .bind(leg.amount_cents.abs())
                    .bind(category)
                    .bind(user.0)
                    .execute(&mut *tx)
                    .await?;
                }
            }
        }

        let ids: Vec<i64> = legs.iter().map(|l| l.id).collect();
        for id in &ids {
            sqlx::query("DELETE FROM transactions WHERE id = ? AND user_id = ?")
                .bind(id)
                .bind(user.0)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(ids)
    }
}

async fn require_account(
    conn: &mut SqliteConnection,
    user: UserId,
    id: AccountId,
) -> Result<(), StoreError> {
    let found = sqlx::query_as::<_, (i64,)>("SELECT id FROM accounts WHERE id = ? AND user_id = ?")
        .bind(id.0)
        .bind(user.0)
        .fetch_optional(&mut *conn)
        .await?;
    match found {
        Some(_) => Ok(()),
        None => Err(StoreError::not_found(Reference::Account(id.0))),
    }
}

async fn category_exists(
    conn: &mut SqliteConnection,
    user: UserId,
    id: CategoryId,
) -> Result<bool, StoreError> {
    let found =
        sqlx::query_as::<_, (i64,)>("SELECT id FROM categories WHERE id = ? AND user_id = ?")
            .bind(id.0)
            .bind(user.0)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(found.is_some())
}

async fn fetch_row(
    conn: &mut SqliteConnection,
    user: UserId,
    id: i64,
) -> Result<Option<TransactionRow>, StoreError> {
    let row = sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ? AND user_id = ?"
    ))
    .bind(id)
    .bind(user.0)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row)
}

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rasid_core::{
    AccountId, CandidateFields, CandidateStatus, CandidateTransaction, CategoryId, Confidence,
    LedgerError, Money, NewCandidate, Reference, ReviewAction, SourceKind, TransactionType, UserId,
};
use serde::Serialize;
use sqlx::{FromRow, SqliteConnection};

use crate::db::DbPool;
use crate::error::StoreError;

#[derive(Debug, FromRow)]
struct CandidateRow {
    id: i64,
    user_id: i64,
    raw_text: String,
    source: String,
    institution: Option<String>,
    payee: Option<String>,
    amount_cents: Option<i64>,
    date: Option<NaiveDate>,
    transaction_type: String,
    suggested_account_id: Option<i64>,
    suggested_category_id: Option<i64>,
    confidence: i64,
    status: String,
    committed_transaction_id: Option<i64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ListingRow {
    #[sqlx(flatten)]
    candidate: CandidateRow,
    account_name: Option<String>,
    category_name: Option<String>,
}

impl TryFrom<CandidateRow> for CandidateTransaction {
    type Error = StoreError;

    fn try_from(r: CandidateRow) -> Result<Self, StoreError> {
        Ok(CandidateTransaction {
            id: r.id,
            user_id: UserId(r.user_id),
            raw_text: r.raw_text,
            source: SourceKind::from_str(&r.source).map_err(StoreError::Corrupt)?,
            institution: r.institution,
            fields: CandidateFields {
                payee: r.payee,
                amount: r.amount_cents.map(Money::from_cents),
                date: r.date,
                transaction_type: TransactionType::from_str(&r.transaction_type)
                    .map_err(StoreError::Corrupt)?,
            },
            suggested_account_id: r.suggested_account_id.map(AccountId),
            suggested_category_id: r.suggested_category_id.map(CategoryId),
            confidence: Confidence::from_hundredths(r.confidence),
            status: CandidateStatus::from_str(&r.status).map_err(StoreError::Corrupt)?,
            committed_transaction_id: r.committed_transaction_id,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

/// A candidate with the display names of its suggestions, for the review list.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateListing {
    #[serde(flatten)]
    pub candidate: CandidateTransaction,
    pub account_name: Option<String>,
    pub category_name: Option<String>,
}

const CANDIDATE_COLUMNS: &str = "p.id, p.user_id, p.raw_text, p.source, p.institution, p.payee, \
     p.amount_cents, p.date, p.transaction_type, p.suggested_account_id, p.suggested_category_id, \
     p.confidence, p.status, p.committed_transaction_id, p.created_at, p.updated_at";

const RETURNING_COLUMNS: &str = "id, user_id, raw_text, source, institution, payee, amount_cents, \
     date, transaction_type, suggested_account_id, suggested_category_id, confidence, status, \
     committed_transaction_id, created_at, updated_at";

/// New rows always start `pending`.
pub async fn insert_candidate(
    pool: &DbPool,
    new: &NewCandidate,
) -> Result<CandidateTransaction, StoreError> {
    let amount_cents = new.fields.amount.map(Money::try_to_cents).transpose()?;
    let now = Utc::now();

    let row = sqlx::query_as::<_, CandidateRow>(&format!(
        r#"
        INSERT INTO pending_transactions
            (user_id, raw_text, source, institution, payee, amount_cents, date, transaction_type,
             suggested_account_id, suggested_category_id, confidence, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?)
        RETURNING {RETURNING_COLUMNS}
        "#
    ))
    .bind(new.user_id.0)
    .bind(&new.raw_text)
    .bind(new.source.to_string())
    .bind(&new.institution)
    .bind(&new.fields.payee)
    .bind(amount_cents)
    .bind(new.fields.date)
    .bind(new.fields.transaction_type.to_string())
    .bind(new.suggested_account_id.map(|a| a.0))
    .bind(new.suggested_category_id.map(|c| c.0))
    .bind(new.confidence.hundredths())
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;

    row.try_into()
}

pub async fn get_candidate(
    pool: &DbPool,
    user: UserId,
    id: i64,
) -> Result<Option<CandidateTransaction>, StoreError> {
    let row = sqlx::query_as::<_, CandidateRow>(&format!(
        "SELECT {CANDIDATE_COLUMNS} FROM pending_transactions p WHERE p.id = ? AND p.user_id = ?"
    ))
    .bind(id)
    .bind(user.0)
    .fetch_optional(pool)
    .await?;
    row.map(CandidateTransaction::try_from).transpose()
}

/// Newest first. `None` lists every status.
pub async fn list_candidates(
    pool: &DbPool,
    user: UserId,
    status: Option<CandidateStatus>,
) -> Result<Vec<CandidateListing>, StoreError> {
    let rows = sqlx::query_as::<_, ListingRow>(&format!(
        r#"
        SELECT {CANDIDATE_COLUMNS}, a.name AS account_name, c.name AS category_name
        FROM pending_transactions p
        LEFT JOIN accounts a ON a.id = p.suggested_account_id AND a.user_id = p.user_id
        LEFT JOIN categories c ON c.id = p.suggested_category_id AND c.user_id = p.user_id
        WHERE p.user_id = ? AND (? IS NULL OR p.status = ?)
        ORDER BY p.created_at DESC, p.id DESC
        "#
    ))
    .bind(user.0)
    .bind(status.map(|s| s.to_string()))
    .bind(status.map(|s| s.to_string()))
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(|r| {
            Ok(CandidateListing {
                candidate: r.candidate.try_into()?,
                account_name: r.account_name,
                category_name: r.category_name,
            })
        })
        .collect()
}

pub async fn pending_count(pool: &DbPool, user: UserId) -> Result<i64, StoreError> {
    let (n,) = sqlx::query_as::<_, (i64,)>(
        "SELECT COUNT(*) FROM pending_transactions WHERE user_id = ? AND status = 'pending'",
    )
    .bind(user.0)
    .fetch_one(pool)
    .await?;
    Ok(n)
}

/// Moves a `pending` row to `action`'s target. The update is conditional on the current
/// status, so of two racing transitions exactly one succeeds.
pub(crate) async fn transition(
    conn: &mut SqliteConnection,
    user: UserId,
    id: i64,
    action: ReviewAction,
) -> Result<(), StoreError> {
    let target = action.target();
    let result = sqlx::query(
        "UPDATE pending_transactions SET status = ?, updated_at = ? \
         WHERE id = ? AND user_id = ? AND status = 'pending'",
    )
    .bind(target.to_string())
    .bind(Utc::now())
    .bind(id)
    .bind(user.0)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let current = sqlx::query_as::<_, (String,)>(
        "SELECT status FROM pending_transactions WHERE id = ? AND user_id = ?",
    )
    .bind(id)
    .bind(user.0)
    .fetch_optional(&mut *conn)
    .await?;

    match current {
        None => Err(StoreError::not_found(Reference::Candidate(id))),
        Some((status,)) => {
            let from = CandidateStatus::from_str(&status).map_err(StoreError::Corrupt)?;
            Err(LedgerError::InvalidTransition { from, to: target }.into())
        }
    }
}

/// `pending → rejected`. No ledger effect; the row is kept.
pub async fn reject_candidate(
    pool: &DbPool,
    user: UserId,
    id: i64,
) -> Result<CandidateTransaction, StoreError> {
    let mut conn = pool.acquire().await?;
    transition(&mut conn, user, id, ReviewAction::Reject).await?;
    drop(conn);
    tracing::info!(candidate_id = id, "candidate rejected");
    get_candidate(pool, user, id)
        .await?
        .ok_or_else(|| StoreError::not_found(Reference::Candidate(id)))
}

pub async fn delete_candidate(pool: &DbPool, user: UserId, id: i64) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM pending_transactions WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user.0)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::account::{AccountId, CategoryId, UserId};
use crate::error::LedgerError;
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    #[default]
    Expense,
    Income,
    Transfer,
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionType::Expense => write!(f, "expense"),
            TransactionType::Income => write!(f, "income"),
            TransactionType::Transfer => write!(f, "transfer"),
        }
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "expense" => Ok(TransactionType::Expense),
            "income" => Ok(TransactionType::Income),
            "transfer" => Ok(TransactionType::Transfer),
            other => Err(format!("Unknown transaction type: '{other}'")),
        }
    }
}

/// A ledger row. `amount` is signed: outflows from `account_id` are negative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedTransaction {
    pub id: i64,
    pub user_id: UserId,
    pub account_id: AccountId,
    pub category_id: Option<CategoryId>,
    pub payee_name: String,
    pub amount: Money,
    pub transaction_type: TransactionType,
    pub date: NaiveDate,
    pub memo: Option<String>,
    pub is_cleared: bool,
    pub raw_text: Option<String>,
    pub candidate_id: Option<i64>,
    pub transfer_peer_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Final fields for a commit, possibly edited by the reviewer.
#[derive(Debug, Clone)]
pub struct UnvalidatedEntry {
    pub user_id: UserId,
    pub candidate_id: Option<i64>,
    pub account_id: Option<AccountId>,
    pub category_id: Option<CategoryId>,
    pub payee_name: Option<String>,
    pub amount: Option<Money>,
    pub transaction_type: TransactionType,
    pub date: Option<NaiveDate>,
    pub memo: Option<String>,
    pub raw_text: Option<String>,
    pub transfer_account_id: Option<AccountId>,
}

/// One balance movement on one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Posting {
    pub account_id: AccountId,
    pub amount: Money,
}

/// An entry that passed every check the committer needs before touching storage.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub user_id: UserId,
    pub candidate_id: Option<i64>,
    pub account_id: AccountId,
    pub category_id: Option<CategoryId>,
    pub payee_name: String,
    /// Non-negative magnitude.
    pub amount: Money,
    pub amount_cents: i64,
    pub transaction_type: TransactionType,
    pub date: NaiveDate,
    pub memo: Option<String>,
    pub raw_text: Option<String>,
    pub transfer_account_id: Option<AccountId>,
}

pub const UNKNOWN_PAYEE: &str = "Unknown";

/// The key payees are stored and compared under: trimmed, inner whitespace collapsed, lowercased.
pub fn normalize_payee(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl LedgerEntry {
    pub fn validate(entry: UnvalidatedEntry) -> Result<LedgerEntry, LedgerError> {
        let account_id = entry.account_id.ok_or(LedgerError::Incomplete("account"))?;
        let amount = entry.amount.ok_or(LedgerError::Incomplete("amount"))?;
        let date = entry.date.ok_or(LedgerError::Incomplete("date"))?;

        if amount.is_negative() {
            return Err(LedgerError::PrecisionOverflow(format!(
                "amount {amount} must not be negative"
            )));
        }
        // Precision and range are checked here so no write starts with an unrepresentable value.
        let amount = Money::try_from_decimal(amount.as_decimal())?;
        let amount_cents = amount.try_to_cents()?;

        let (category_id, transfer_account_id) = match entry.transaction_type {
            TransactionType::Transfer => {
                let to = entry.transfer_account_id.ok_or(LedgerError::InvalidTransfer)?;
                if to == account_id {
                    return Err(LedgerError::InvalidTransfer);
                }
                (None, Some(to))
            }
            _ => (entry.category_id, None),
        };

        let payee_name = entry
            .payee_name
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| UNKNOWN_PAYEE.to_string());

        Ok(LedgerEntry {
            user_id: entry.user_id,
            candidate_id: entry.candidate_id,
            account_id,
            category_id,
            payee_name,
            amount,
            amount_cents,
            transaction_type: entry.transaction_type,
            date,
            memo: entry.memo,
            raw_text: entry.raw_text,
            transfer_account_id,
        })
    }

    /// Balance movements. A transfer yields two postings that sum to zero.
    pub fn postings(&self) -> Vec<Posting> {
        match (self.transaction_type, self.transfer_account_id) {
            (TransactionType::Income, _) => vec![Posting {
                account_id: self.account_id,
                amount: self.amount,
            }],
            (TransactionType::Transfer, Some(to)) => vec![
                Posting {
                    account_id: self.account_id,
                    amount: -self.amount,
                },
                Posting {
                    account_id: to,
                    amount: self.amount,
                },
            ],
            _ => vec![Posting {
                account_id: self.account_id,
                amount: -self.amount,
            }],
        }
    }

    /// Only expenses move category activity.
    pub fn category_delta(&self) -> Option<(CategoryId, Money)> {
        match self.transaction_type {
            TransactionType::Expense => self.category_id.map(|c| (c, self.amount)),
            _ => None,
        }
    }
}

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::account::{AccountId, CategoryId, UserId};
use crate::confidence::Confidence;
use crate::error::LedgerError;
use crate::money::Money;
use crate::transaction::TransactionType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Sms,
    Ocr,
    Clipboard,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Sms => write!(f, "sms"),
            SourceKind::Ocr => write!(f, "ocr"),
            SourceKind::Clipboard => write!(f, "clipboard"),
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sms" => Ok(SourceKind::Sms),
            "ocr" => Ok(SourceKind::Ocr),
            "clipboard" => Ok(SourceKind::Clipboard),
            other => Err(format!("Unknown source kind: '{other}'")),
        }
    }
}

/// Reference rule recognising a sending institution. `id` order is match priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePattern {
    pub id: i64,
    pub institution: String,
    pub pattern: String,
    pub country: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Pending,
    Approved,
    Rejected,
    AutoApproved,
}

/// Who is asking for the move out of `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Approve,
    Reject,
    /// System-only; never exposed to reviewers.
    AutoApprove,
}

impl ReviewAction {
    pub fn target(self) -> CandidateStatus {
        match self {
            ReviewAction::Approve => CandidateStatus::Approved,
            ReviewAction::Reject => CandidateStatus::Rejected,
            ReviewAction::AutoApprove => CandidateStatus::AutoApproved,
        }
    }
}

impl CandidateStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, CandidateStatus::Pending)
    }

    /// Whether reaching this state writes to the ledger.
    pub fn commits(self) -> bool {
        matches!(self, CandidateStatus::Approved | CandidateStatus::AutoApproved)
    }

    pub fn apply(self, action: ReviewAction) -> Result<CandidateStatus, LedgerError> {
        match self {
            CandidateStatus::Pending => Ok(action.target()),
            from => Err(LedgerError::InvalidTransition {
                from,
                to: action.target(),
            }),
        }
    }
}

impl fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateStatus::Pending => write!(f, "pending"),
            CandidateStatus::Approved => write!(f, "approved"),
            CandidateStatus::Rejected => write!(f, "rejected"),
            CandidateStatus::AutoApproved => write!(f, "auto_approved"),
        }
    }
}

impl std::str::FromStr for CandidateStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CandidateStatus::Pending),
            "approved" => Ok(CandidateStatus::Approved),
            "rejected" => Ok(CandidateStatus::Rejected),
            "auto_approved" => Ok(CandidateStatus::AutoApproved),
            other => Err(format!("Unknown candidate status: '{other}'")),
        }
    }
}

/// Fields recovered from raw text. Any subset may be missing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandidateFields {
    pub payee: Option<String>,
    pub amount: Option<Money>,
    pub date: Option<NaiveDate>,
    pub transaction_type: TransactionType,
}

impl CandidateFields {
    /// Amount and date are what a ledger row cannot exist without.
    pub fn is_committable(&self) -> bool {
        self.amount.is_some() && self.date.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.is_committable() && self.payee.is_some()
    }
}

/// An inbox item awaiting (or past) review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateTransaction {
    pub id: i64,
    pub user_id: UserId,
    pub raw_text: String,
    pub source: SourceKind,
    pub institution: Option<String>,
    pub fields: CandidateFields,
    pub suggested_account_id: Option<AccountId>,
    pub suggested_category_id: Option<CategoryId>,
    pub confidence: Confidence,
    pub status: CandidateStatus,
    pub committed_transaction_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to insert a new inbox row.
#[derive(Debug, Clone)]
pub struct NewCandidate {
    pub user_id: UserId,
    pub raw_text: String,
    pub source: SourceKind,
    pub institution: Option<String>,
    pub fields: CandidateFields,
    pub suggested_account_id: Option<AccountId>,
    pub suggested_category_id: Option<CategoryId>,
    pub confidence: Confidence,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    const ALL: [CandidateStatus; 4] = [
        CandidateStatus::Pending,
        CandidateStatus::Approved,
        CandidateStatus::Rejected,
        CandidateStatus::AutoApproved,
    ];
    const ACTIONS: [ReviewAction; 3] =
        [ReviewAction::Approve, ReviewAction::Reject, ReviewAction::AutoApprove];

    #[test]
    fn pending_reaches_every_terminal_state() {
        let reached: Vec<_> = ACTIONS
            .iter()
            .map(|a| CandidateStatus::Pending.apply(*a).unwrap())
            .collect();
        assert_eq!(
            reached,
            vec![
                CandidateStatus::Approved,
                CandidateStatus::Rejected,
                CandidateStatus::AutoApproved
            ]
        );
    }

    #[test]
    fn terminal_states_refuse_every_action() {
        for from in ALL.into_iter().filter(|s| s.is_terminal()) {
            for action in ACTIONS {
                assert_eq!(
                    from.apply(action),
                    Err(LedgerError::InvalidTransition { from, to: action.target() })
                );
            }
        }
    }

    #[test]
    fn only_approvals_commit() {
        assert!(CandidateStatus::Approved.commits());
        assert!(CandidateStatus::AutoApproved.commits());
        assert!(!CandidateStatus::Rejected.commits());
        assert!(!CandidateStatus::Pending.commits());
    }

    #[test]
    fn status_string_roundtrip() {
        for s in ALL {
            assert_eq!(CandidateStatus::from_str(&s.to_string()).unwrap(), s);
        }
        assert_eq!(SourceKind::from_str("clipboard").unwrap(), SourceKind::Clipboard);
    }

    #[test]
    fn completeness() {
        let mut f = CandidateFields {
            amount: Some(Money::from_cents(100)),
            date: NaiveDate::from_ymd_opt(2024, 1, 1),
            ..Default::default()
        };
        assert!(f.is_committable());
        assert!(!f.is_complete());
        f.payee = Some("Jarir".into());
        assert!(f.is_complete());
        f.amount = None;
        assert!(!f.is_committable());
    }
}

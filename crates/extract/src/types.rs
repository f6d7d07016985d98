use chrono::NaiveDate;
use rasid_core::{CandidateFields, Money, TransactionType};
use serde::{Deserialize, Serialize};

/// A single extracted value with an associated confidence score (0.0–1.0).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedField<T> {
    pub value: T,
    pub confidence: f32,
}

impl<T> ExtractedField<T> {
    pub fn new(value: T, confidence: f32) -> Self {
        Self { value, confidence: confidence.clamp(0.0, 1.0) }
    }
}

/// What the matcher learned about the sender, passed to extractors as a hint.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InstitutionHint {
    Known(String),
    #[default]
    Unknown,
}

impl InstitutionHint {
    pub fn name(&self) -> Option<&str> {
        match self {
            InstitutionHint::Known(name) => Some(name),
            InstitutionHint::Unknown => None,
        }
    }
}

impl std::fmt::Display for InstitutionHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name().unwrap_or("unknown"))
    }
}

/// Partial result of reading one piece of evidence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExtractedFields {
    pub payee: Option<ExtractedField<String>>,
    pub amount: Option<ExtractedField<Money>>,
    pub date: Option<ExtractedField<NaiveDate>>,
    pub transaction_type: TransactionType,
    /// Set when `date` was not in the text and fell back to the ingestion date.
    pub date_defaulted: bool,
}

impl ExtractedFields {
    pub fn is_empty(&self) -> bool {
        self.payee.is_none() && self.amount.is_none() && self.date.is_none()
    }

    pub fn into_candidate_fields(self) -> CandidateFields {
        CandidateFields {
            payee: self.payee.map(|f| f.value),
            amount: self.amount.map(|f| f.value),
            date: self.date.map(|f| f.value),
            transaction_type: self.transaction_type,
        }
    }
}

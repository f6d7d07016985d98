use rasid_core::{AccountId, CandidateFields, CategoryId, Confidence, PipelineConfig};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::matcher::MatchResult;

/// One nearest-neighbour row from the payee index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmbeddingHit {
    pub payee_name: String,
    pub category_id: Option<CategoryId>,
    pub similarity: f32,
}

/// What the payee index could tell about this payee.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PayeeEvidence {
    /// Hits above the search threshold, similarity descending.
    Embedding(Vec<EmbeddingHit>),
    /// Found by name because no embedding was available.
    NameMatch {
        payee_name: String,
        category_id: CategoryId,
    },
    #[default]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub account_id: Option<AccountId>,
    pub category_id: Option<CategoryId>,
    pub confidence: Confidence,
    pub auto_approve: bool,
}

/// Scoring weights. Institution strength and completeness apply only without an embedding hit.
#[derive(Debug, Clone, Copy)]
pub struct ClassifierPolicy {
    pub auto_approve_threshold: Confidence,
    pub institution_bonus: Decimal,
    pub institution_strength: Decimal,
    pub complete_weight: Decimal,
    pub payeeless_weight: Decimal,
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self {
            auto_approve_threshold: Confidence::from_hundredths(85),
            institution_bonus: Decimal::new(10, 2),
            institution_strength: Decimal::new(50, 2),
            complete_weight: Decimal::new(30, 2),
            payeeless_weight: Decimal::new(20, 2),
        }
    }
}

impl From<&PipelineConfig> for ClassifierPolicy {
    fn from(config: &PipelineConfig) -> Self {
        let defaults = Self::default();
        Self {
            auto_approve_threshold: Confidence::from_f32(config.auto_approve_threshold),
            institution_bonus: Decimal::from_f32(config.institution_bonus)
                .map(|d| d.round_dp(2))
                .unwrap_or(defaults.institution_bonus),
            ..defaults
        }
    }
}

pub struct Classifier {
    policy: ClassifierPolicy,
}

impl Classifier {
    pub fn new(policy: ClassifierPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ClassifierPolicy {
        &self.policy
    }

    /// `account` is the storage layer's most-recently-used pick for this transaction type.
    pub fn classify(
        &self,
        fields: &CandidateFields,
        matched: &MatchResult,
        evidence: &PayeeEvidence,
        account: Option<AccountId>,
    ) -> Suggestion {
        let p = &self.policy;

        // Uncategorised rows record that a payee was seen, not what it is.
        let hit = match evidence {
            PayeeEvidence::Embedding(hits) => hits.iter().find(|h| h.category_id.is_some()),
            _ => None,
        };

        let (category_id, mut confidence) = match hit {
            Some(h) => {
                let delta =
                    if matched.matched { p.institution_bonus } else { -p.institution_bonus };
                (h.category_id, Confidence::from_f32(h.similarity).saturating_add(delta))
            }
            None => {
                let category_id = match evidence {
                    PayeeEvidence::NameMatch { category_id, .. } => Some(*category_id),
                    _ => None,
                };
                (category_id, self.structural_confidence(fields, matched))
            }
        };

        if !fields.is_committable() {
            confidence = confidence.cap(p.auto_approve_threshold.just_below());
        }

        let auto_approve = confidence >= p.auto_approve_threshold
            && account.is_some()
            && fields.is_committable();

        Suggestion { account_id: account, category_id, confidence, auto_approve }
    }

    fn structural_confidence(&self, fields: &CandidateFields, matched: &MatchResult) -> Confidence {
        let p = &self.policy;
        let institution = if matched.matched { p.institution_strength } else { Decimal::ZERO };
        let completeness = if fields.is_complete() {
            p.complete_weight
        } else if fields.is_committable() {
            p.payeeless_weight
        } else {
            Decimal::ZERO
        };
        Confidence::new(institution + completeness)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(ClassifierPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rasid_core::{Money, TransactionType};

    fn complete() -> CandidateFields {
        CandidateFields {
            payee: Some("Jarir Bookstore".into()),
            amount: Some(Money::from_cents(25_000)),
            date: NaiveDate::from_ymd_opt(2024, 3, 15),
            transaction_type: TransactionType::Expense,
        }
    }

    fn rajhi() -> MatchResult {
        MatchResult { institution: Some("Al Rajhi Bank".into()), matched: true }
    }

    fn hit(similarity: f32, category: Option<i64>) -> PayeeEvidence {
        PayeeEvidence::Embedding(vec![EmbeddingHit {
            payee_name: "Jarir Bookstore".into(),
            category_id: category.map(CategoryId),
            similarity,
        }])
    }

    const ACCOUNT: Option<AccountId> = Some(AccountId(1));

    #[test]
    fn strong_hit_with_known_institution_auto_approves() {
        let s = Classifier::default().classify(&complete(), &rajhi(), &hit(0.92, Some(7)), ACCOUNT);
        assert_eq!(s.category_id, Some(CategoryId(7)));
        assert_eq!(s.confidence, Confidence::ONE);
        assert!(s.auto_approve);
    }

    #[test]
    fn unknown_institution_subtracts_bonus() {
        let s = Classifier::default().classify(
            &complete(),
            &MatchResult::unmatched(),
            &hit(0.92, Some(7)),
            ACCOUNT,
        );
        assert_eq!(s.confidence, Confidence::from_hundredths(82));
        assert!(!s.auto_approve);
    }

    #[test]
    fn no_hit_tops_out_below_threshold() {
        let s =
            Classifier::default().classify(&complete(), &rajhi(), &PayeeEvidence::None, ACCOUNT);
        assert_eq!(s.confidence, Confidence::from_hundredths(80));
        assert_eq!(s.category_id, None);
        assert!(!s.auto_approve);
    }

    #[test]
    fn payeeless_completeness_weight() {
        let mut fields = complete();
        fields.payee = None;
        let s = Classifier::default().classify(&fields, &rajhi(), &PayeeEvidence::None, ACCOUNT);
        assert_eq!(s.confidence, Confidence::from_hundredths(70));
    }

    #[test]
    fn nothing_known_is_zero() {
        let fields = CandidateFields::default();
        let s = Classifier::default().classify(
            &fields,
            &MatchResult::unmatched(),
            &PayeeEvidence::None,
            None,
        );
        assert_eq!(s.confidence, Confidence::ZERO);
        assert_eq!(s.category_id, None);
        assert!(!s.auto_approve);
    }

    #[test]
    fn missing_amount_caps_below_threshold() {
        let mut fields = complete();
        fields.amount = None;
        let s = Classifier::default().classify(&fields, &rajhi(), &hit(0.99, Some(7)), ACCOUNT);
        assert_eq!(s.confidence, Confidence::from_hundredths(84));
        assert!(!s.auto_approve);
    }

    #[test]
    fn no_account_never_auto_approves() {
        let s = Classifier::default().classify(&complete(), &rajhi(), &hit(0.95, Some(7)), None);
        assert!(s.confidence >= Confidence::from_hundredths(85));
        assert!(!s.auto_approve);
    }

    #[test]
    fn uncategorised_hits_are_skipped() {
        let evidence = PayeeEvidence::Embedding(vec![
            EmbeddingHit { payee_name: "jarir".into(), category_id: None, similarity: 0.99 },
            EmbeddingHit {
                payee_name: "jarir books".into(),
                category_id: Some(CategoryId(3)),
                similarity: 0.80,
            },
        ]);
        let s = Classifier::default().classify(&complete(), &rajhi(), &evidence, ACCOUNT);
        assert_eq!(s.category_id, Some(CategoryId(3)));
        assert_eq!(s.confidence, Confidence::from_hundredths(90));
    }

    #[test]
    fn name_match_suggests_category_without_boosting() {
        let evidence = PayeeEvidence::NameMatch {
            payee_name: "Jarir Bookstore".into(),
            category_id: CategoryId(7),
        };
        let s = Classifier::default().classify(&complete(), &rajhi(), &evidence, ACCOUNT);
        assert_eq!(s.category_id, Some(CategoryId(7)));
        assert_eq!(s.confidence, Confidence::from_hundredths(80));
        assert!(!s.auto_approve);
    }

    #[test]
    fn confidence_always_in_unit_range() {
        for sim in [-3.0f32, 0.0, 0.5, 1.0, 7.0, f32::NAN] {
            for matched in [rajhi(), MatchResult::unmatched()] {
                let evidence = hit(sim, Some(1));
                let s = Classifier::default().classify(&complete(), &matched, &evidence, ACCOUNT);
                assert!(s.confidence >= Confidence::ZERO && s.confidence <= Confidence::ONE);
                if s.auto_approve {
                    assert!(s.confidence >= Classifier::default().policy().auto_approve_threshold);
                }
            }
        }
    }

    #[test]
    fn policy_from_config() {
        let config = PipelineConfig { auto_approve_threshold: 0.9, ..PipelineConfig::default() };
        let policy = ClassifierPolicy::from(&config);
        assert_eq!(policy.auto_approve_threshold, Confidence::from_hundredths(90));
        assert_eq!(policy.institution_bonus, Decimal::new(10, 2));
    }
}

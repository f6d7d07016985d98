use chrono::NaiveDate;
use rasid_classify::name_similarity;
use rasid_core::{
    AccountId, CandidateStatus, CandidateTransaction, CategoryId, CommittedTransaction, Money,
    Reference, ReviewAction, TransactionType, UnvalidatedEntry, UserId, UNKNOWN_PAYEE,
};
use rasid_extract::TextUnderstanding;
use rasid_storage::{
    delete_candidate, get_candidate, get_category, list_candidates, pending_count,
    reject_candidate, CandidateListing, CommitRequest,
};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::pipeline::Pipeline;

/// Reviewer edits applied on approval. Unset fields keep the candidate's values.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApproveOverrides {
    pub account_id: Option<AccountId>,
    pub category_id: Option<CategoryId>,
    pub payee_name: Option<String>,
    pub amount: Option<Money>,
    #[serde(alias = "transaction_date")]
    pub date: Option<NaiveDate>,
    pub memo: Option<String>,
    pub transaction_type: Option<TransactionType>,
    pub transfer_account_id: Option<AccountId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub id: i64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySuggestion {
    pub category_id: CategoryId,
    pub category_name: String,
    pub similarity: f32,
}

impl<B: TextUnderstanding> Pipeline<B> {
    /// `None` lists every status.
    pub async fn list(
        &self,
        user: UserId,
        status: Option<CandidateStatus>,
    ) -> Result<Vec<CandidateListing>, PipelineError> {
        Ok(list_candidates(&self.pool, user, status).await?)
    }

    pub async fn get(&self, user: UserId, id: i64) -> Result<CandidateTransaction, PipelineError> {
        get_candidate(&self.pool, user, id)
            .await?
            .ok_or_else(|| PipelineError::not_found(Reference::Candidate(id)))
    }

    pub async fn pending_count(&self, user: UserId) -> Result<i64, PipelineError> {
        Ok(pending_count(&self.pool, user).await?)
    }

    pub async fn approve(
        &self,
        user: UserId,
        id: i64,
        overrides: ApproveOverrides,
    ) -> Result<CommittedTransaction, PipelineError> {
        let candidate = self.get(user, id).await?;
        // Fail fast; the committer re-checks under the write lock.
        candidate.status.apply(ReviewAction::Approve)?;

        let o = overrides;
        let entry = UnvalidatedEntry {
            user_id: user,
            candidate_id: Some(id),
            account_id: o.account_id.or(candidate.suggested_account_id),
            category_id: o.category_id.or(candidate.suggested_category_id),
            payee_name: o.payee_name.or(candidate.fields.payee),
            amount: o.amount.or(candidate.fields.amount),
            transaction_type: o.transaction_type.unwrap_or(candidate.fields.transaction_type),
            date: o
                .date
                .or(candidate.fields.date)
                .or(Some(candidate.created_at.date_naive())),
            memo: o.memo,
            raw_text: Some(candidate.raw_text),
            transfer_account_id: o.transfer_account_id,
        };

        let embedding = match entry.payee_name.as_deref() {
            Some(payee) if !payee.trim().is_empty() && payee != UNKNOWN_PAYEE => {
                self.embed_payee(payee).await
            }
            _ => None,
        };

        let committed = self
            .committer
            .commit(CommitRequest {
                entry,
                candidate: Some((id, ReviewAction::Approve)),
                embedding: embedding.as_deref(),
            })
            .await?;
        Ok(committed)
    }

    /// Approves each id with its suggested values. One failure does not stop the rest.
    pub async fn approve_batch(&self, user: UserId, ids: &[i64]) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for &id in ids {
            let outcome = match self.approve(user, id, ApproveOverrides::default()).await {
                Ok(tx) => {
                    BatchOutcome { id, success: true, transaction_id: Some(tx.id), error: None }
                }
                Err(e) => {
                    tracing::debug!(candidate_id = id, "batch approval skipped: {e}");
                    BatchOutcome {
                        id,
                        success: false,
                        transaction_id: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        let approved = outcomes.iter().filter(|o| o.success).count();
        tracing::info!(requested = ids.len(), approved, "batch approval finished");
        outcomes
    }

    pub async fn reject(
        &self,
        user: UserId,
        id: i64,
    ) -> Result<CandidateTransaction, PipelineError> {
        let candidate = reject_candidate(&self.pool, user, id).await?;
        tracing::info!(candidate_id = id, "rejected candidate");
        Ok(candidate)
    }

    pub async fn delete(&self, user: UserId, id: i64) -> Result<(), PipelineError> {
        if delete_candidate(&self.pool, user, id).await? {
            Ok(())
        } else {
            Err(PipelineError::not_found(Reference::Candidate(id)))
        }
    }

    /// Removes a committed transaction and undoes its effect on balances and activity.
    pub async fn reverse(
        &self,
        user: UserId,
        transaction_id: i64,
    ) -> Result<Vec<i64>, PipelineError> {
        Ok(self.committer.reverse(user, transaction_id).await?)
    }

    /// Categories previously used for payees like this candidate's, best first.
    /// Hidden and deleted categories are left out.
    pub async fn suggest_categories(
        &self,
        user: UserId,
        id: i64,
    ) -> Result<Vec<CategorySuggestion>, PipelineError> {
        let candidate = self.get(user, id).await?;
        let Some(payee) = candidate.fields.payee.filter(|p| p != UNKNOWN_PAYEE) else {
            return Ok(Vec::new());
        };

        let index = self.committer.index();
        let scored: Vec<(CategoryId, f32)> = match self.embed_payee(&payee).await {
            Some(v) => index
                .search(
                    user,
                    &v,
                    self.config.suggestion_threshold,
                    self.config.suggestion_count * 3,
                )
                .await?
                .into_iter()
                .filter_map(|m| m.category_id.map(|c| (c, m.similarity)))
                .collect(),
            None => index
                .lookup_by_name(user, &payee)
                .await?
                .and_then(|r| r.category_id.map(|c| (c, name_similarity(&payee, &r.payee_name))))
                .into_iter()
                .collect(),
        };

        let mut suggestions: Vec<CategorySuggestion> = Vec::new();
        for (category_id, similarity) in scored {
            if suggestions.len() >= self.config.suggestion_count {
                break;
            }
            if suggestions.iter().any(|s| s.category_id == category_id) {
                continue;
            }
            match get_category(&self.pool, user, category_id).await? {
                Some(category) if !category.is_hidden => suggestions.push(CategorySuggestion {
                    category_id,
                    category_name: category.name,
                    similarity,
                }),
                _ => {}
            }
        }
        Ok(suggestions)
    }
}

use chrono::{NaiveDate, Utc};
use rasid_classify::{best_fuzzy_match, EmbeddingHit, MatchResult, PayeeEvidence, Suggestion};
use rasid_core::{
    AccountId, CandidateFields, CandidateTransaction, CategoryId, CommittedTransaction, Confidence,
    NewCandidate, Reference, ReviewAction, SourceKind, TransactionType, UnvalidatedEntry, UserId,
    UNKNOWN_PAYEE,
};
use rasid_extract::{ExtractedFields, TextUnderstanding};
use rasid_storage::{ensure_user, get_candidate, insert_candidate, suggest_account, CommitRequest};
use serde::Serialize;

use crate::error::PipelineError;
use crate::pipeline::Pipeline;

/// One piece of raw evidence to turn into an inbox entry.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub user: UserId,
    pub text: String,
    pub source: SourceKind,
    /// SMS sender id; scanned together with the body for the institution.
    pub sender: Option<String>,
}

impl IngestRequest {
    pub fn new(user: UserId, source: SourceKind, text: impl Into<String>) -> Self {
        Self { user, text: text.into(), source, sender: None }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Ingested {
    #[serde(flatten)]
    pub candidate: CandidateTransaction,
    /// Present when the candidate was auto-approved and committed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<CommittedTransaction>,
}

/// What the pipeline makes of a piece of text, before anything is stored.
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
    pub institution: Option<String>,
    pub fields: CandidateFields,
    pub suggested_account_id: Option<AccountId>,
    pub suggested_category_id: Option<CategoryId>,
    pub confidence: Confidence,
    pub auto_approve: bool,
    #[serde(skip)]
    pub(crate) embedding: Option<Vec<f32>>,
}

impl<B: TextUnderstanding> Pipeline<B> {
    /// Raw text in, inbox entry out. Extraction and classification problems degrade the
    /// candidate; only storing the candidate itself can fail.
    pub async fn ingest(&self, request: IngestRequest) -> Result<Ingested, PipelineError> {
        self.ingest_on(request, Utc::now().date_naive()).await
    }

    /// `today` stands in for dates the text does not carry.
    pub async fn ingest_on(
        &self,
        request: IngestRequest,
        today: NaiveDate,
    ) -> Result<Ingested, PipelineError> {
        let user = request.user;
        ensure_user(&self.pool, user).await?;

        let analysis = self.analyze(&request, today).await;
        let candidate = insert_candidate(
            &self.pool,
            &NewCandidate {
                user_id: user,
                raw_text: request.text,
                source: request.source,
                institution: analysis.institution.clone(),
                fields: analysis.fields.clone(),
                suggested_account_id: analysis.suggested_account_id,
                suggested_category_id: analysis.suggested_category_id,
                confidence: analysis.confidence,
            },
        )
        .await?;

        tracing::info!(
            candidate_id = candidate.id,
            source = %candidate.source,
            institution = candidate.institution.as_deref().unwrap_or("unknown"),
            confidence = %candidate.confidence,
            auto_approve = analysis.auto_approve,
            "ingested candidate"
        );

        let embedding = analysis.embedding.as_deref();
        let committed = if analysis.auto_approve {
            self.auto_approve(&candidate, embedding).await
        } else {
            None
        };

        if committed.is_none() {
            self.record_encounter(&candidate, embedding).await;
        }

        let candidate = match committed {
            Some(_) => get_candidate(&self.pool, user, candidate.id)
                .await?
                .ok_or_else(|| PipelineError::not_found(Reference::Candidate(candidate.id)))?,
            None => candidate,
        };
        Ok(Ingested { candidate, transaction: committed })
    }

    /// Extracts and classifies without writing anything.
    pub async fn preview(&self, request: IngestRequest) -> Analysis {
        self.preview_on(request, Utc::now().date_naive()).await
    }

    pub async fn preview_on(&self, request: IngestRequest, today: NaiveDate) -> Analysis {
        let analysis = self.analyze(&request, today).await;
        tracing::debug!(
            source = %request.source,
            confidence = %analysis.confidence,
            "previewed text"
        );
        analysis
    }

    async fn analyze(&self, request: &IngestRequest, today: NaiveDate) -> Analysis {
        let user = request.user;
        let matched = {
            let scan = match &request.sender {
                Some(sender) => format!("{sender}\n{}", request.text),
                None => request.text.clone(),
            };
            self.matcher.read().await.match_text(&scan)
        };

        let extracted = match self
            .bounded(
                "extraction",
                self.backend.extract(&request.text, request.source, &matched.hint(), today),
            )
            .await
        {
            Ok(fields) => Some(fields),
            Err(e) => {
                tracing::warn!(
                    source = %request.source,
                    backend = self.backend.name(),
                    "extraction unavailable, storing empty candidate: {e}"
                );
                None
            }
        };

        let (fields, suggestion, embedding) = match extracted {
            Some(extracted) => self.classify(user, extracted, &matched).await,
            None => {
                let fields = ExtractedFields::default().into_candidate_fields();
                let account = self.suggested_account(user, fields.transaction_type).await;
                let suggestion = Suggestion {
                    account_id: account,
                    category_id: None,
                    confidence: Confidence::ZERO,
                    auto_approve: false,
                };
                (fields, suggestion, None)
            }
        };

        Analysis {
            institution: matched.institution.clone(),
            fields,
            suggested_account_id: suggestion.account_id,
            suggested_category_id: suggestion.category_id,
            confidence: suggestion.confidence,
            auto_approve: suggestion.auto_approve,
            embedding,
        }
    }

    async fn classify(
        &self,
        user: UserId,
        extracted: ExtractedFields,
        matched: &MatchResult,
    ) -> (CandidateFields, Suggestion, Option<Vec<f32>>) {
        let fields = extracted.into_candidate_fields();

        let payee = fields.payee.as_deref().filter(|p| *p != UNKNOWN_PAYEE);
        let (evidence, embedding) = match payee {
            Some(payee) => match self.embed_payee(payee).await {
                Some(v) => (self.embedding_evidence(user, &v).await, Some(v)),
                None => (self.name_evidence(user, payee).await, None),
            },
            None => (PayeeEvidence::None, None),
        };

        let account = self.suggested_account(user, fields.transaction_type).await;
        let suggestion = self.classifier.classify(&fields, matched, &evidence, account);
        (fields, suggestion, embedding)
    }

    async fn embedding_evidence(&self, user: UserId, vector: &[f32]) -> PayeeEvidence {
        let search = self.committer.index().search(
            user,
            vector,
            self.config.search_threshold,
            self.config.top_k,
        );
        match search.await {
            Ok(hits) => PayeeEvidence::Embedding(
                hits.into_iter()
                    .map(|h| EmbeddingHit {
                        payee_name: h.payee_name,
                        category_id: h.category_id,
                        similarity: h.similarity,
                    })
                    .collect(),
            ),
            Err(e) => {
                tracing::warn!(user = %user, "payee search failed, classifying without it: {e}");
                PayeeEvidence::None
            }
        }
    }

    /// Category evidence from stored payee names when no vector is available.
    async fn name_evidence(&self, user: UserId, payee: &str) -> PayeeEvidence {
        match self.lookup_name(user, payee).await {
            Ok(evidence) => evidence,
            Err(e) => {
                tracing::warn!(user = %user, "payee name lookup failed: {e}");
                PayeeEvidence::None
            }
        }
    }

    async fn lookup_name(&self, user: UserId, payee: &str) -> Result<PayeeEvidence, PipelineError> {
        let index = self.committer.index();
        if let Some(record) = index.lookup_by_name(user, payee).await? {
            if let Some(category_id) = record.category_id {
                return Ok(PayeeEvidence::NameMatch { payee_name: record.payee_name, category_id });
            }
        }

        let names = index.categorized_names(user).await?;
        Ok(match best_fuzzy_match(payee, &names, self.config.fuzzy_name_threshold) {
            Some(((name, category_id), _)) => PayeeEvidence::NameMatch {
                payee_name: name.clone(),
                category_id: *category_id,
            },
            None => PayeeEvidence::None,
        })
    }

    async fn suggested_account(&self, user: UserId, kind: TransactionType) -> Option<AccountId> {
        match suggest_account(&self.pool, user, kind).await {
            Ok(account) => account,
            Err(e) => {
                tracing::warn!(user = %user, "account suggestion failed: {e}");
                None
            }
        }
    }

    /// Commits an auto-approved candidate. Any failure leaves it pending.
    async fn auto_approve(
        &self,
        candidate: &CandidateTransaction,
        embedding: Option<&[f32]>,
    ) -> Option<CommittedTransaction> {
        let entry = UnvalidatedEntry {
            user_id: candidate.user_id,
            candidate_id: Some(candidate.id),
            account_id: candidate.suggested_account_id,
            category_id: candidate.suggested_category_id,
            payee_name: candidate.fields.payee.clone(),
            amount: candidate.fields.amount,
            transaction_type: candidate.fields.transaction_type,
            date: candidate.fields.date,
            memo: None,
            raw_text: Some(candidate.raw_text.clone()),
            transfer_account_id: None,
        };
        let request = CommitRequest {
            entry,
            candidate: Some((candidate.id, ReviewAction::AutoApprove)),
            embedding,
        };
        match self.committer.commit(request).await {
            Ok(tx) => Some(tx),
            Err(e) => {
                tracing::warn!(
                    candidate_id = candidate.id,
                    "auto-approval failed, left pending: {e}"
                );
                None
            }
        }
    }

    /// Notes that the payee was seen, without teaching the index a category.
    async fn record_encounter(&self, candidate: &CandidateTransaction, embedding: Option<&[f32]>) {
        let Some(payee) = candidate.fields.payee.as_deref().filter(|p| *p != UNKNOWN_PAYEE) else {
            return;
        };
        if let Err(e) = self
            .committer
            .index()
            .upsert(candidate.user_id, payee, None, embedding)
            .await
        {
            tracing::warn!(candidate_id = candidate.id, "could not record payee encounter: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{harness, harness_with, test_config, Harness};
    use rasid_core::{CandidateStatus, Money, TransactionType};
    use rasid_extract::{ExtractedField, MockBackend};
    use rasid_storage::{get_account, get_category, list_transactions};

    const RAJHI_JARIR: &str =
        "Al Rajhi Bank\nPOS Purchase\nAmount: SAR 250.00\nAt: Jarir Bookstore\nDate: 2024-03-15";

    /// Cosine 0.92 against [1, 0, 0].
    fn near_jarir() -> Vec<f32> {
        vec![0.92, (1.0f32 - 0.92 * 0.92).sqrt(), 0.0]
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 20).unwrap()
    }

    async fn teach_jarir<B: TextUnderstanding>(h: &Harness<B>) {
        h.pipeline
            .committer()
            .index()
            .upsert(h.user, "Jarir Bookstore", Some(h.shopping.id), Some(&[1.0, 0.0, 0.0]))
            .await
            .unwrap();
    }

    async fn ingest<B: TextUnderstanding>(h: &Harness<B>, text: &str) -> Ingested {
        h.pipeline
            .ingest_on(IngestRequest::new(h.user, SourceKind::Sms, text), today())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn known_payee_from_known_bank_auto_commits() {
        let h = harness(MockBackend::new().with_embedding("Jarir Bookstore", near_jarir())).await;
        teach_jarir(&h).await;

        let out = ingest(&h, RAJHI_JARIR).await;
        let c = &out.candidate;
        assert_eq!(c.institution.as_deref(), Some("Al Rajhi Bank"));
        assert_eq!(c.suggested_category_id, Some(h.shopping.id));
        assert!(c.confidence >= Confidence::from_hundredths(85));
        assert_eq!(c.status, CandidateStatus::AutoApproved);

        let tx = out.transaction.unwrap();
        assert_eq!(c.committed_transaction_id, Some(tx.id));
        assert_eq!(tx.amount, Money::from_cents(-25_000));

        let pool = h.pipeline.pool();
        let account = get_account(pool, h.user, h.checking.id).await.unwrap().unwrap();
        assert_eq!(account.balance, Money::from_cents(75_000));
        let shopping = get_category(pool, h.user, h.shopping.id).await.unwrap().unwrap();
        assert_eq!(shopping.activity, Money::from_cents(25_000));

        let index = h.pipeline.committer().index();
        let payee = index.get(h.user, "jarir bookstore").await.unwrap().unwrap();
        assert_eq!(payee.usage_count, 2);
        assert_eq!(payee.category_id, Some(h.shopping.id));
    }

    #[tokio::test]
    async fn unrecognised_text_stays_pending_at_zero() {
        let h = harness(MockBackend::new()).await;
        let out = ingest(&h, "Your OTP is ready. Do not share it.").await;
        let c = out.candidate;
        assert_eq!(c.status, CandidateStatus::Pending);
        assert_eq!(c.confidence, Confidence::ZERO);
        assert_eq!(c.suggested_category_id, None);
        assert!(c.fields.amount.is_none());
        assert!(c.institution.is_none());
        assert!(out.transaction.is_none());
    }

    #[tokio::test]
    async fn offline_backend_still_creates_an_empty_candidate() {
        let h = harness(MockBackend::offline()).await;
        let out = ingest(&h, RAJHI_JARIR).await;
        let c = out.candidate;
        assert_eq!(c.status, CandidateStatus::Pending);
        assert_eq!(c.confidence, Confidence::ZERO);
        assert!(c.fields.payee.is_none() && c.fields.amount.is_none() && c.fields.date.is_none());
        assert_eq!(c.raw_text, RAJHI_JARIR);
        assert_eq!(c.institution.as_deref(), Some("Al Rajhi Bank"));
    }

    #[tokio::test]
    async fn concurrent_ingestions_of_a_new_payee_share_one_row() {
        let h = harness(MockBackend::new()).await;
        let text = "Purchase at Starbucks SAR 18.00 on 2024-03-01";
        let (a, b) = tokio::join!(
            h.pipeline.ingest_on(IngestRequest::new(h.user, SourceKind::Sms, text), today()),
            h.pipeline.ingest_on(IngestRequest::new(h.user, SourceKind::Sms, text), today()),
        );
        assert_eq!(a.unwrap().candidate.status, CandidateStatus::Pending);
        assert_eq!(b.unwrap().candidate.status, CandidateStatus::Pending);

        let index = h.pipeline.committer().index();
        assert_eq!(index.count(h.user).await.unwrap(), 1);
        let row = index.get(h.user, "starbucks").await.unwrap().unwrap();
        assert_eq!(row.usage_count, 2);
        assert_eq!(row.category_id, None);
    }

    #[tokio::test]
    async fn weak_similarity_from_unknown_sender_needs_review() {
        let h = harness(MockBackend::new().with_embedding("Jarir Bookstore", near_jarir())).await;
        teach_jarir(&h).await;
        let text = "POS Purchase\nAmount: SAR 250.00\nAt: Jarir Bookstore\nDate: 2024-03-15";
        let out = ingest(&h, text).await;
        let c = out.candidate;
        assert_eq!(c.suggested_category_id, Some(h.shopping.id));
        assert_eq!(c.confidence, Confidence::from_hundredths(82));
        assert_eq!(c.status, CandidateStatus::Pending);
        assert!(list_transactions(h.pipeline.pool(), h.user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn name_fallback_suggests_without_auto_approving() {
        let h = harness(MockBackend::new()).await;
        teach_jarir(&h).await;
        let out = ingest(&h, RAJHI_JARIR).await;
        let c = out.candidate;
        assert_eq!(c.suggested_category_id, Some(h.shopping.id));
        assert_eq!(c.confidence, Confidence::from_hundredths(80));
        assert_eq!(c.status, CandidateStatus::Pending);
    }

    #[tokio::test]
    async fn fuzzy_name_fallback_tolerates_typos() {
        let h = harness(MockBackend::new()).await;
        teach_jarir(&h).await;
        let text = "Al Rajhi Bank\nAmount: SAR 20.00\nAt: Jarir Bookstor\nDate: 2024-03-15";
        let out = ingest(&h, text).await;
        assert_eq!(out.candidate.suggested_category_id, Some(h.shopping.id));
    }

    #[tokio::test]
    async fn missing_date_never_auto_approves() {
        let fields = ExtractedFields {
            payee: Some(ExtractedField::new("Jarir Bookstore".to_string(), 0.9)),
            amount: Some(ExtractedField::new(Money::from_cents(25_000), 0.9)),
            date: None,
            transaction_type: TransactionType::Expense,
            date_defaulted: false,
        };
        let backend = MockBackend::new()
            .with_fields(fields)
            .with_embedding("Jarir Bookstore", vec![1.0, 0.0, 0.0]);
        let h = harness(backend).await;
        teach_jarir(&h).await;

        let c = ingest(&h, RAJHI_JARIR).await.candidate;
        assert_eq!(c.confidence, Confidence::from_hundredths(84));
        assert_eq!(c.status, CandidateStatus::Pending);
    }

    #[tokio::test]
    async fn no_account_means_no_auto_approval() {
        let h = harness(MockBackend::new().with_embedding("Jarir Bookstore", near_jarir())).await;
        teach_jarir(&h).await;
        rasid_storage::set_account_active(h.pipeline.pool(), h.user, h.checking.id, false)
            .await
            .unwrap();
        let c = ingest(&h, RAJHI_JARIR).await.candidate;
        assert_eq!(c.suggested_account_id, None);
        assert_eq!(c.status, CandidateStatus::Pending);
    }

    #[tokio::test]
    async fn sender_identifies_the_bank() {
        let h = harness(MockBackend::new()).await;
        let request = IngestRequest::new(h.user, SourceKind::Sms, "Purchase at Panda SAR 10.00")
            .with_sender("AlRajhiBank");
        let c = h.pipeline.ingest_on(request, today()).await.unwrap().candidate;
        assert_eq!(c.institution.as_deref(), Some("Al Rajhi Bank"));
        assert_eq!(c.raw_text, "Purchase at Panda SAR 10.00");
        assert_eq!(c.fields.date, Some(today()));
    }

    #[tokio::test]
    async fn hits_below_search_threshold_are_ignored() {
        let mut config = test_config();
        config.pipeline.search_threshold = 0.95;
        let backend = MockBackend::new().with_embedding("Jarir Bookstore", near_jarir());
        let h = harness_with(backend, config).await;
        teach_jarir(&h).await;
        let c = ingest(&h, RAJHI_JARIR).await.candidate;
        assert_eq!(c.suggested_category_id, None);
        assert_eq!(c.confidence, Confidence::from_hundredths(80));
        assert_eq!(c.status, CandidateStatus::Pending);
    }

    #[tokio::test]
    async fn payee_index_failure_still_files_a_candidate() {
        let backend = MockBackend::new().with_embedding("Jarir Bookstore", near_jarir());
        let h = harness(backend).await;
        sqlx::query("DROP TABLE payee_embeddings")
            .execute(h.pipeline.pool())
            .await
            .unwrap();

        let out = ingest(&h, RAJHI_JARIR).await;
        let c = out.candidate;
        assert_eq!(c.status, CandidateStatus::Pending);
        assert_eq!(c.suggested_category_id, None);
        assert_eq!(c.suggested_account_id, Some(h.checking.id));
        assert_eq!(c.confidence, Confidence::from_hundredths(80));
        assert!(out.transaction.is_none());
        assert_eq!(h.pipeline.pending_count(h.user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn preview_classifies_without_writing() {
        let h = harness(MockBackend::new().with_embedding("Jarir Bookstore", near_jarir())).await;
        teach_jarir(&h).await;

        let request = IngestRequest::new(h.user, SourceKind::Sms, RAJHI_JARIR);
        let analysis = h.pipeline.preview_on(request, today()).await;
        assert_eq!(analysis.institution.as_deref(), Some("Al Rajhi Bank"));
        assert_eq!(analysis.fields.amount, Some(Money::from_cents(25_000)));
        assert_eq!(analysis.suggested_category_id, Some(h.shopping.id));
        assert!(analysis.auto_approve);

        let pool = h.pipeline.pool();
        assert_eq!(h.pipeline.pending_count(h.user).await.unwrap(), 0);
        assert!(list_transactions(pool, h.user).await.unwrap().is_empty());
        let account = get_account(pool, h.user, h.checking.id).await.unwrap().unwrap();
        assert_eq!(account.balance, Money::from_cents(100_000));
        let index = h.pipeline.committer().index();
        let payee = index.get(h.user, "jarir bookstore").await.unwrap().unwrap();
        assert_eq!(payee.usage_count, 1);
    }
}

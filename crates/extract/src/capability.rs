use std::collections::HashMap;
use std::future::Future;

use chrono::NaiveDate;
use rasid_core::SourceKind;
use thiserror::Error;

use crate::rules::RuleExtractor;
use crate::types::{ExtractedFields, InstitutionHint};

#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("No text to read")]
    EmptyInput,
    #[error("Text-understanding service unavailable: {0}")]
    Unavailable(String),
    #[error("Backend does not support {0}")]
    Unsupported(&'static str),
    #[error("Malformed response from text-understanding service: {0}")]
    MalformedResponse(String),
}

/// Abstraction over whatever turns raw evidence into fields and payee names into vectors.
///
/// Callers never know which implementation is active: the rule backend, the HTTP model
/// backend, and [`Fallback`] chains of them are interchangeable.
pub trait TextUnderstanding: Send + Sync {
    /// Short label for health reporting.
    fn name(&self) -> &str;

    /// `today` is used when the text carries no explicit date.
    fn extract(
        &self,
        text: &str,
        source: SourceKind,
        hint: &InstitutionHint,
        today: NaiveDate,
    ) -> impl Future<Output = Result<ExtractedFields, CapabilityError>> + Send;

    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, CapabilityError>> + Send;
}

/// Tries `primary` first and answers from `secondary` when it fails.
pub struct Fallback<P, S> {
    primary: P,
    secondary: S,
    name: String,
}

impl<P: TextUnderstanding, S: TextUnderstanding> Fallback<P, S> {
    pub fn new(primary: P, secondary: S) -> Self {
        let name = format!("{}+{}", primary.name(), secondary.name());
        Self { primary, secondary, name }
    }
}

impl<P: TextUnderstanding, S: TextUnderstanding> TextUnderstanding for Fallback<P, S> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(
        &self,
        text: &str,
        source: SourceKind,
        hint: &InstitutionHint,
        today: NaiveDate,
    ) -> Result<ExtractedFields, CapabilityError> {
        match self.primary.extract(text, source, hint, today).await {
            Ok(fields) => Ok(fields),
            Err(CapabilityError::EmptyInput) => Err(CapabilityError::EmptyInput),
            Err(e) => {
                tracing::warn!(
                    backend = self.primary.name(),
                    "extraction failed, falling back: {e}"
                );
                self.secondary.extract(text, source, hint, today).await
            }
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        match self.primary.embed(text).await {
            Ok(v) => Ok(v),
            Err(e) => {
                tracing::debug!(
                    backend = self.primary.name(),
                    "embedding failed, falling back: {e}"
                );
                self.secondary.embed(text).await
            }
        }
    }
}

// ── Mock backend (always available, used for tests) ───────────────────────────

/// Reads fields with the rule extractor (or returns preset fields) and serves embeddings
/// from an in-memory table keyed by lowercased payee name.
#[derive(Default)]
pub struct MockBackend {
    rules: RuleExtractor,
    preset: Option<ExtractedFields>,
    embeddings: HashMap<String, Vec<f32>>,
    offline: bool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields(mut self, fields: ExtractedFields) -> Self {
        self.preset = Some(fields);
        self
    }

    pub fn with_embedding(mut self, payee: &str, vector: Vec<f32>) -> Self {
        self.embeddings.insert(payee.trim().to_lowercase(), vector);
        self
    }

    /// Every call fails with `Unavailable`.
    pub fn offline() -> Self {
        Self { offline: true, ..Self::default() }
    }
}

impl TextUnderstanding for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn extract(
        &self,
        text: &str,
        source: SourceKind,
        hint: &InstitutionHint,
        today: NaiveDate,
    ) -> Result<ExtractedFields, CapabilityError> {
        if self.offline {
            return Err(CapabilityError::Unavailable("mock is offline".into()));
        }
        match &self.preset {
            Some(fields) => Ok(fields.clone()),
            None => self.rules.extract(text, source, hint, today).await,
        }
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, CapabilityError> {
        if self.offline {
            return Err(CapabilityError::Unavailable("mock is offline".into()));
        }
        self.embeddings
            .get(&text.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| CapabilityError::Unavailable(format!("no embedding for '{text}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ExtractedField;
    use rasid_core::Money;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 20).unwrap()
    }

    #[tokio::test]
    async fn mock_returns_preset_fields() {
        let preset = ExtractedFields {
            amount: Some(ExtractedField::new(Money::from_cents(550), 0.9)),
            ..Default::default()
        };
        let backend = MockBackend::new().with_fields(preset.clone());
        let got = backend
            .extract("anything", SourceKind::Sms, &InstitutionHint::Unknown, today())
            .await
            .unwrap();
        assert_eq!(got, preset);
    }

    #[tokio::test]
    async fn mock_embedding_lookup_is_case_insensitive() {
        let backend = MockBackend::new().with_embedding("Jarir Bookstore", vec![1.0, 0.0]);
        assert_eq!(backend.embed("  JARIR BOOKSTORE ").await.unwrap(), vec![1.0, 0.0]);
        assert!(matches!(
            backend.embed("Panda").await,
            Err(CapabilityError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn fallback_uses_secondary_when_primary_is_down() {
        let backend = Fallback::new(
            MockBackend::offline(),
            MockBackend::new().with_embedding("panda", vec![0.5, 0.5]),
        );
        assert_eq!(backend.name(), "mock+mock");
        let fields = backend
            .extract(
                "Purchase at Panda SAR 12.50",
                SourceKind::Sms,
                &InstitutionHint::Unknown,
                today(),
            )
            .await
            .unwrap();
        assert_eq!(fields.amount.unwrap().value, Money::from_cents(1250));
        assert_eq!(backend.embed("Panda").await.unwrap(), vec![0.5, 0.5]);
    }
}

use std::future::Future;
use std::time::Duration;

use rasid_classify::{Classifier, ClassifierPolicy, PatternMatcher};
use rasid_core::{PipelineConfig, RasidConfig};
use rasid_extract::{CapabilityError, TextUnderstanding};
use rasid_storage::{
    list_source_patterns, CommitPolicy, DbPool, LedgerCommitter, PayeeIndex,
};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::PipelineError;

/// Probe text for the health check's embedding call.
const HEALTH_PROBE: &str = "health check";

#[derive(Debug, Clone, Serialize)]
pub struct Health {
    pub status: &'static str,
    pub extractor: String,
    pub embedding_available: bool,
}

/// Everything one ingestion or review call needs, shared across requests.
pub struct Pipeline<B: TextUnderstanding> {
    pub(crate) pool: DbPool,
    pub(crate) backend: B,
    pub(crate) matcher: RwLock<PatternMatcher>,
    pub(crate) classifier: Classifier,
    pub(crate) committer: LedgerCommitter,
    pub(crate) config: PipelineConfig,
    timeout: Duration,
}

impl<B: TextUnderstanding> Pipeline<B> {
    /// Opens the payee index and compiles the stored source patterns.
    pub async fn open(
        pool: DbPool,
        backend: B,
        config: &RasidConfig,
    ) -> Result<Self, PipelineError> {
        let index = PayeeIndex::open(pool.clone(), config.index.clone()).await?;
        let policy = CommitPolicy::from(&config.pipeline);
        let committer = LedgerCommitter::new(pool.clone(), index, policy);
        let matcher = PatternMatcher::new(
            list_source_patterns(&pool).await?,
            config.pipeline.country.as_deref(),
        );
        tracing::info!(
            patterns = matcher.len(),
            backend = backend.name(),
            "ingestion pipeline ready"
        );

        Ok(Self {
            pool,
            backend,
            matcher: RwLock::new(matcher),
            classifier: Classifier::new(ClassifierPolicy::from(&config.pipeline)),
            committer,
            config: config.pipeline.clone(),
            timeout: Duration::from_millis(config.capability.timeout_ms),
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn committer(&self) -> &LedgerCommitter {
        &self.committer
    }

    /// Recompiles the matcher after source patterns changed. Returns the active rule count.
    pub async fn reload_patterns(&self) -> Result<usize, PipelineError> {
        let matcher = PatternMatcher::new(
            list_source_patterns(&self.pool).await?,
            self.config.country.as_deref(),
        );
        let n = matcher.len();
        *self.matcher.write().await = matcher;
        Ok(n)
    }

    pub async fn health(&self) -> Health {
        let embedding_available =
            self.bounded("embedding", self.backend.embed(HEALTH_PROBE)).await.is_ok();
        Health {
            status: "ok",
            extractor: self.backend.name().to_string(),
            embedding_available,
        }
    }

    /// Runs one capability call under the configured timeout. A timeout reads as unavailable.
    pub(crate) async fn bounded<T>(
        &self,
        what: &'static str,
        call: impl Future<Output = Result<T, CapabilityError>>,
    ) -> Result<T, CapabilityError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Unavailable(format!(
                "{what} timed out after {} ms",
                self.timeout.as_millis()
            ))),
        }
    }

    /// Best-effort embedding for a payee name.
    pub(crate) async fn embed_payee(&self, payee: &str) -> Option<Vec<f32>> {
        match self.bounded("embedding", self.backend.embed(payee)).await {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(backend = self.backend.name(), "payee embedding unavailable: {e}");
                None
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;
    use rasid_extract::MockBackend;
    use rasid_storage::insert_source_pattern;

    #[tokio::test]
    async fn health_reports_backend_and_embedding_check() {
        let h = harness(MockBackend::new().with_embedding(HEALTH_PROBE, vec![1.0, 0.0, 0.0])).await;
        let health = h.pipeline.health().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.extractor, "mock");
        assert!(health.embedding_available);

        let offline = harness(MockBackend::offline()).await;
        assert!(!offline.pipeline.health().await.embedding_available);
    }

    #[tokio::test]
    async fn reload_picks_up_new_patterns() {
        let h = harness(MockBackend::new()).await;
        let before = h.pipeline.reload_patterns().await.unwrap();
        insert_source_pattern(h.pipeline.pool(), "STC Pay", r"stc\s*pay", "SA").await.unwrap();
        assert_eq!(h.pipeline.reload_patterns().await.unwrap(), before + 1);
    }
}

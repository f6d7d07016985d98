use std::sync::Arc;

use rasid_extract::TextUnderstanding;
use rasid_pipeline::Pipeline;

use crate::auth::JwtVerifier;

/// Shared by every handler. Cheap to clone.
pub struct AppState<B: TextUnderstanding> {
    pub pipeline: Arc<Pipeline<B>>,
    pub verifier: Arc<JwtVerifier>,
}

impl<B: TextUnderstanding> AppState<B> {
    pub fn new(pipeline: Pipeline<B>, verifier: JwtVerifier) -> Self {
        Self { pipeline: Arc::new(pipeline), verifier: Arc::new(verifier) }
    }
}

impl<B: TextUnderstanding> Clone for AppState<B> {
    fn clone(&self) -> Self {
        Self { pipeline: Arc::clone(&self.pipeline), verifier: Arc::clone(&self.verifier) }
    }
}

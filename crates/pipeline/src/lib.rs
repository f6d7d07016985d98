//! Ingestion and review orchestration: raw text in, reviewed ledger entries out.

pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod review;

pub use error::PipelineError;
pub use ingest::{Analysis, IngestRequest, Ingested};
pub use pipeline::{Health, Pipeline};
pub use review::{ApproveOverrides, BatchOutcome, CategorySuggestion};

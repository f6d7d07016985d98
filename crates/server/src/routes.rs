use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use rasid_core::{CandidateStatus, CandidateTransaction, CommittedTransaction, SourceKind};
use rasid_extract::TextUnderstanding;
use rasid_pipeline::{
    Analysis, ApproveOverrides, BatchOutcome, CategorySuggestion, Health, IngestRequest, Ingested,
};
use rasid_storage::CandidateListing;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

pub fn router<B: TextUnderstanding + 'static>(state: AppState<B>, body_limit: usize) -> Router {
    Router::new()
        .route("/health", get(health::<B>))
        .route("/ingest/sms", post(ingest_sms::<B>))
        .route("/ingest/ocr", post(ingest_ocr::<B>))
        .route("/ingest/clipboard", post(ingest_clipboard::<B>))
        .route("/analyze", post(analyze::<B>))
        .route("/pending", get(list_pending::<B>))
        .route("/pending/count", get(pending_count::<B>))
        .route("/pending/approve-batch", post(approve_batch::<B>))
        .route("/pending/{id}", get(get_pending::<B>).delete(delete_pending::<B>))
        .route("/pending/{id}/suggestions", get(suggestions::<B>))
        .route("/pending/{id}/approve", post(approve::<B>))
        .route("/pending/{id}/reject", post(reject::<B>))
        .route("/transactions/{id}", delete(reverse_transaction::<B>))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health<B: TextUnderstanding + 'static>(State(state): State<AppState<B>>) -> Json<Health> {
    Json(state.pipeline.health().await)
}

// ── Ingestion ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SmsBody {
    sms_body: String,
    sender: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OcrBody {
    ocr_text: String,
}

#[derive(Debug, Deserialize)]
struct ClipboardBody {
    text: String,
}

async fn ingest<B: TextUnderstanding + 'static>(
    state: &AppState<B>,
    request: IngestRequest,
) -> ApiResult<(StatusCode, Json<Ingested>)> {
    let ingested = state.pipeline.ingest(request).await?;
    Ok((StatusCode::CREATED, Json(ingested)))
}

async fn ingest_sms<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Json(body): Json<SmsBody>,
) -> ApiResult<(StatusCode, Json<Ingested>)> {
    let mut request = IngestRequest::new(user, SourceKind::Sms, body.sms_body);
    if let Some(sender) = body.sender {
        request = request.with_sender(sender);
    }
    ingest(&state, request).await
}

async fn ingest_ocr<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Json(body): Json<OcrBody>,
) -> ApiResult<(StatusCode, Json<Ingested>)> {
    ingest(&state, IngestRequest::new(user, SourceKind::Ocr, body.ocr_text)).await
}

async fn ingest_clipboard<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Json(body): Json<ClipboardBody>,
) -> ApiResult<(StatusCode, Json<Ingested>)> {
    ingest(&state, IngestRequest::new(user, SourceKind::Clipboard, body.text)).await
}

#[derive(Debug, Deserialize)]
struct AnalyzeBody {
    text: String,
    #[serde(default = "default_source")]
    source: SourceKind,
    sender: Option<String>,
}

fn default_source() -> SourceKind {
    SourceKind::Sms
}

/// Dry run: what ingestion would make of the text, with nothing stored.
async fn analyze<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Json(body): Json<AnalyzeBody>,
) -> Json<Analysis> {
    let mut request = IngestRequest::new(user, body.source, body.text);
    if let Some(sender) = body.sender {
        request = request.with_sender(sender);
    }
    Json(state.pipeline.preview(request).await)
}

// ── Review inbox ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
}

/// Missing means `pending`; `all` lifts the filter.
fn status_filter(raw: Option<&str>) -> ApiResult<Option<CandidateStatus>> {
    match raw {
        None | Some("") => Ok(Some(CandidateStatus::Pending)),
        Some("all") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(ApiError::BadRequest),
    }
}

async fn list_pending<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<CandidateListing>>> {
    let status = status_filter(query.status.as_deref())?;
    Ok(Json(state.pipeline.list(user, status).await?))
}

async fn pending_count<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Value>> {
    let count = state.pipeline.pending_count(user).await?;
    Ok(Json(json!({ "count": count })))
}

async fn get_pending<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<CandidateTransaction>> {
    Ok(Json(state.pipeline.get(user, id).await?))
}

async fn delete_pending<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<StatusCode> {
    state.pipeline.delete(user, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn suggestions<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Vec<CategorySuggestion>>> {
    Ok(Json(state.pipeline.suggest_categories(user, id).await?))
}

/// An empty body approves with the candidate's own values.
async fn approve<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<Json<CommittedTransaction>> {
    let overrides = if body.iter().all(u8::is_ascii_whitespace) {
        ApproveOverrides::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    Ok(Json(state.pipeline.approve(user, id, overrides).await?))
}

async fn reject<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    state.pipeline.reject(user, id).await?;
    Ok(Json(json!({ "message": "Transaction rejected" })))
}

#[derive(Debug, Deserialize)]
struct BatchBody {
    transaction_ids: Vec<i64>,
}

#[derive(Debug, Serialize)]
struct BatchResponse {
    approved: usize,
    results: Vec<BatchOutcome>,
}

async fn approve_batch<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Json(body): Json<BatchBody>,
) -> ApiResult<Json<BatchResponse>> {
    let results = state.pipeline.approve_batch(user, &body.transaction_ids).await;
    let approved = results.iter().filter(|r| r.success).count();
    Ok(Json(BatchResponse { approved, results }))
}

// ── Ledger ───────────────────────────────────────────────────────────────────

async fn reverse_transaction<B: TextUnderstanding + 'static>(
    State(state): State<AppState<B>>,
    AuthUser(user): AuthUser,
    Path(id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let removed = state.pipeline.reverse(user, id).await?;
    Ok(Json(json!({ "reversed": removed })))
}

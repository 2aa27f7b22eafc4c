use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response, sse::{Event, KeepAlive, Sse}},
    routing::{get, post},
};
use async_trait::async_trait;
use chrono::Utc;
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::{
    models::{CaseRecord, CaseView, Gender, GenerationRequest, ImagePayload, PredictionResultItem, RunBatchRequest, Scenario, MAX_VARIATIONS, MIN_VARIATIONS},
    pipeline::{BatchSummary, PipelineError, PredictionPipeline, ResultSink},
    prompt::{self, ValidationError},
};

pub type CaseStore = Arc<RwLock<HashMap<Uuid, CaseRecord>>>;

#[derive(Clone)]
pub struct AppState {
    pub cases: CaseStore,
    pub pipeline: Arc<PredictionPipeline>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/options", get(get_options))
        .route("/api/predictions", post(generate_predictions))
        .route("/api/cases", post(create_case))
        .route("/api/cases/:id", get(get_case))
        .route("/api/cases/:id/predictions", post(run_case_batch))
        .route("/api/cases/:id/results/:result_id/image", get(download_result_image))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    PlanGeneration(String),
    #[error("not found")]
    NotFound,
    #[error("a batch is already running for this case")]
    Busy,
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("{0}")]
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Validation(v) => ApiError::Validation(v),
            PipelineError::PlanGeneration(p) => ApiError::PlanGeneration(format!("plan generation failed: {p}")),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::PlanGeneration(_) => StatusCode::BAD_GATEWAY,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Busy => StatusCode::CONFLICT,
            ApiError::InvalidBody(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<PredictionResultItem>,
    pub summary: BatchSummary,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScenarioOption {
    pub key: String,
    pub label: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OptionsResponse {
    pub genders: Vec<Gender>,
    pub scenarios: Vec<ScenarioOption>,
    pub min_variations: u8,
    pub max_variations: u8,
}

pub async fn get_options() -> Json<OptionsResponse> {
    Json(OptionsResponse {
        genders: vec![Gender::Male, Gender::Female, Gender::NonBinary, Gender::Other, Gender::Unspecified],
        scenarios: Scenario::ALL
            .iter()
            .map(|s| ScenarioOption { key: s.key().to_string(), label: s.label().to_string() })
            .collect(),
        min_variations: MIN_VARIATIONS,
        max_variations: MAX_VARIATIONS,
    })
}

// Runs a whole batch and answers once it is done
pub async fn generate_predictions(State(state): State<AppState>, Json(body): Json<GenerationRequest>) -> Result<Json<BatchResponse>, ApiError> {
    tracing::info!("🚀 Running one-shot batch for subject: {}", body.name);
    let mut results = Vec::new();
    let summary = state.pipeline.generate_batch(&body, &mut results).await?;
    Ok(Json(BatchResponse { results, summary }))
}

pub async fn create_case(State(state): State<AppState>, Json(body): Json<GenerationRequest>) -> Result<(StatusCode, Json<CaseView>), ApiError> {
    prompt::validate(&body)?;
    let now = Utc::now();
    let case = CaseRecord {
        id: Uuid::new_v4(),
        request: body,
        results: Vec::new(),
        batches: Vec::new(),
        busy: false,
        created_at: now,
        updated_at: now,
    };
    let view = CaseView::from(&case);
    tracing::info!("🎯 Created case {} for subject: {}", case.id, case.request.name);
    state.cases.write().insert(case.id, case);
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_case(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<CaseView>, ApiError> {
    state.cases.read().get(&id).map(|c| Json(CaseView::from(c))).ok_or(ApiError::NotFound)
}

#[derive(Debug)]
enum BatchEvent {
    Result(PredictionResultItem),
    Complete(BatchSummary),
    Error(String),
}

impl BatchEvent {
    fn into_sse(self) -> Result<Event, axum::Error> {
        match self {
            BatchEvent::Result(item) => Event::default().event("result").json_data(item),
            BatchEvent::Complete(summary) => Event::default().event("complete").json_data(summary),
            BatchEvent::Error(message) => Event::default().event("error").json_data(json!({ "error": message })),
        }
    }
}

/// Clears the case's busy flag however the batch task ends.
struct BusyGuard {
    cases: CaseStore,
    id: Uuid,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        if let Some(case) = self.cases.write().get_mut(&self.id) {
            case.busy = false;
            case.updated_at = Utc::now();
        }
    }
}

/// Keeps every result on the case and forwards it to the open stream, if any.
struct CaseSink {
    cases: CaseStore,
    id: Uuid,
    events: mpsc::Sender<BatchEvent>,
}

#[async_trait]
impl ResultSink for CaseSink {
    async fn deliver(&mut self, item: PredictionResultItem) {
        {
            let mut cases = self.cases.write();
            if let Some(case) = cases.get_mut(&self.id) {
                case.results.push(item.clone());
                case.updated_at = Utc::now();
            }
        }
        if self.events.send(BatchEvent::Result(item)).await.is_err() {
            tracing::debug!(case = %self.id, "Stream closed; result kept on case only");
        }
    }
}

/// An empty body means "use the case as stored"; anything else must be a valid `RunBatchRequest`.
fn parse_run_options(body: &[u8]) -> Result<RunBatchRequest, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RunBatchRequest::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::InvalidBody(e.to_string()))
}

// Appends a new batch of variations to an existing case, streamed as SSE
pub async fn run_case_batch(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let options = parse_run_options(&body)?;
    let request = {
        let mut guard = state.cases.write();
        let case = guard.get_mut(&id).ok_or(ApiError::NotFound)?;
        if case.busy {
            return Err(ApiError::Busy);
        }
        let mut request = case.request.clone();
        if let Some(count) = options.variation_count {
            request.variation_count = count;
        }
        prompt::validate(&request)?;
        case.busy = true;
        request
    };
    let busy = BusyGuard { cases: state.cases.clone(), id };

    tracing::info!("🎯 Starting batch for case {} ({} variations)", id, request.variation_count);
    let (tx, rx) = mpsc::channel::<BatchEvent>(1);
    let pipeline = state.pipeline.clone();
    let cases = state.cases.clone();
    tokio::spawn(async move {
        let mut sink = CaseSink { cases: cases.clone(), id, events: tx.clone() };
        let event = match pipeline.generate_batch(&request, &mut sink).await {
            Ok(summary) => {
                if let Some(case) = cases.write().get_mut(&id) {
                    case.batches.push(summary.clone());
                }
                tracing::info!("✅ Case {} batch delivered {} of {} variations", id, summary.delivered, summary.planned);
                BatchEvent::Complete(summary)
            }
            Err(e) => {
                tracing::error!("❌ Case {} batch aborted: {}", id, e);
                BatchEvent::Error(e.to_string())
            }
        };
        drop(busy);
        let _ = tx.send(event).await;
    });

    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((event.into_sse(), rx))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn filename_part(name: &str) -> String {
    let joined = name.split_whitespace().collect::<Vec<_>>().join("_");
    let cleaned: String = joined.chars().filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')).collect();
    if cleaned.is_empty() { "unknown".to_string() } else { cleaned }
}

pub async fn download_result_image(
    Path((id, result_id)): Path<(Uuid, String)>,
    State(state): State<AppState>,
) -> Result<Response, ApiError> {
    let (name, item) = {
        let guard = state.cases.read();
        let case = guard.get(&id).ok_or(ApiError::NotFound)?;
        let item = case.results.iter().find(|r| r.id == result_id).cloned().ok_or(ApiError::NotFound)?;
        (case.request.name.clone(), item)
    };
    let payload = ImagePayload::from_data_url(&item.image)
        .ok_or_else(|| ApiError::Internal("stored image is not a data URL".into()))?;
    let bytes = payload.decode().map_err(|e| ApiError::Internal(format!("stored image is not valid base64: {e}")))?;

    let filename = format!("Reunite.ai_{}_{}.{}", filename_part(&name), filename_part(&item.id), payload.extension());
    let content_type = header::HeaderValue::from_str(&payload.mime_type)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let disposition = header::HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok((StatusCode::OK, [(header::CONTENT_TYPE, content_type), (header::CONTENT_DISPOSITION, disposition)], bytes).into_response())
}

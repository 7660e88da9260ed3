//! REST API for the documentation assistant
//!
//! Endpoints:
//! - `POST /ingest` — run an ingest job and return its report
//! - `POST /ask` — answer a question synchronously
//! - `POST /ask/stream` — answer as an NDJSON stream of frames
//! - `GET /health` — component health

use crate::config::AssistantConfig;
use crate::conversation::{ConversationMemory, InMemoryConversationStore};
use crate::embedding::{Embedder, HttpEmbedder};
use crate::error::{AssistantError, LlmError, Result};
use crate::ingest::{IngestOptions, IngestReport, IngestionOrchestrator};
use crate::llm::{HttpLlmClient, LlmClient};
use crate::memstat::SystemMemoryProbe;
use crate::orchestrator::{Answer, AnswerOrchestrator};
use crate::registry::UrlValidator;
use crate::retrieval::RetrievalService;
use crate::sources::{
    FetcherRegistry, GitFileFilter, GitTreeFetcher, IssueFetcher, SourceSpec, SourceType,
    WikiFetcher,
};
use crate::store::{SqliteVectorStore, VectorStore};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub answers: Arc<AnswerOrchestrator>,
    pub ingestion: Arc<IngestionOrchestrator>,
    pub store: Arc<dyn VectorStore>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn LlmClient>,
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wire the full component graph from configuration
    pub async fn new(config: AssistantConfig) -> Result<Self> {
        let store: Arc<dyn VectorStore> =
            Arc::new(SqliteVectorStore::connect(config.store.clone()).await?);
        let embedder: Arc<dyn Embedder> =
            Arc::new(HttpEmbedder::new(config.embedding.clone())?);
        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(config.llm.clone())?);

        let mut fetchers = FetcherRegistry::new();
        fetchers.register(Arc::new(GitTreeFetcher::new(
            config.sources.clone(),
            GitFileFilter::Markdown,
        )?));
        fetchers.register(Arc::new(GitTreeFetcher::new(
            config.sources.clone(),
            GitFileFilter::ApiDef,
        )?));
        fetchers.register(Arc::new(WikiFetcher::new(config.sources.clone())?));
        fetchers.register(Arc::new(IssueFetcher::new(config.sources.clone())?));

        let ingestion = Arc::new(IngestionOrchestrator::new(
            fetchers,
            embedder.clone(),
            store.clone(),
            Arc::new(SystemMemoryProbe::new()),
            config.ingestion.clone(),
        ));

        let retrieval = Arc::new(RetrievalService::new(
            embedder.clone(),
            store.clone(),
            config.retrieval.clone(),
        ));
        let memory = Arc::new(ConversationMemory::new(
            Arc::new(InMemoryConversationStore::new()),
            config.conversation.clone(),
        ));
        let validator = Arc::new(UrlValidator::new(&config.registry)?);

        let answers = Arc::new(AnswerOrchestrator::new(
            llm.clone(),
            retrieval,
            memory,
            validator,
        ));

        Ok(Self {
            answers,
            ingestion,
            store,
            embedder,
            llm,
            shutdown: CancellationToken::new(),
        })
    }
}

/// Request to run an ingest job
#[derive(Debug, Deserialize, Serialize)]
pub struct IngestRequest {
    pub source_type: SourceType,
    pub source_spec: SourceSpec,
    #[serde(default)]
    pub options: Option<IngestOptions>,
}

/// Response for an ingest job
#[derive(Debug, Deserialize, Serialize)]
pub struct IngestResponse {
    pub job_id: String,
    pub report: IngestReport,
}

/// Request to answer a question
#[derive(Debug, Deserialize, Serialize)]
pub struct AskRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub question: String,
    #[serde(default)]
    pub top_k: Option<usize>,
}

/// Health check response
#[derive(Debug, Deserialize, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub components: HealthComponents,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct HealthComponents {
    pub store: String,
    pub embedder: String,
    pub llm: String,
}

/// Error payload: short message and a code; detail goes to the logs
#[derive(Debug, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

struct ApiError(AssistantError);

impl From<AssistantError> for ApiError {
    fn from(err: AssistantError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        error!("Request failed ({}): {}", err.category(), err);

        let status = match &err {
            AssistantError::Llm(LlmError::RateLimited { .. })
            | AssistantError::Llm(LlmError::NoCapacity) => StatusCode::SERVICE_UNAVAILABLE,
            AssistantError::Llm(LlmError::ContextTooLong) => StatusCode::UNPROCESSABLE_ENTITY,
            AssistantError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AssistantError::Fetch(_) => StatusCode::BAD_GATEWAY,
            AssistantError::Cancelled => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let retry_after_secs = err
            .advised_delay()
            .map(|delay| delay.as_secs())
            .or_else(|| (status == StatusCode::SERVICE_UNAVAILABLE).then_some(5));

        let body = ErrorResponse {
            error: err.user_message().to_string(),
            code: err.category().to_string(),
            retry_after_secs,
        };

        (status, Json(body)).into_response()
    }
}

/// Build the router over prepared state
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ingest", post(ingest))
        .route("/ask", post(ask))
        .route("/ask/stream", post(ask_stream))
        .route("/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Serve until the shutdown token fires
pub async fn serve(config: AssistantConfig) -> Result<()> {
    let bind = config.server.bind.clone();
    let state = AppState::new(config).await?;
    let shutdown = state.shutdown.clone();

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("Listening on {}", bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

async fn ingest(
    State(state): State<AppState>,
    Json(request): Json<IngestRequest>,
) -> std::result::Result<Json<IngestResponse>, ApiError> {
    let job_id = Uuid::new_v4().to_string();
    info!("Ingest job {} for {}", job_id, request.source_type);

    let report = state
        .ingestion
        .ingest(
            request.source_type,
            &request.source_spec,
            &request.options.unwrap_or_default(),
            &state.shutdown,
        )
        .await?;

    Ok(Json(IngestResponse { job_id, report }))
}

async fn ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> std::result::Result<Json<Answer>, ApiError> {
    let answer = state
        .answers
        .ask(request.conversation_id, &request.question, request.top_k)
        .await?;
    Ok(Json(answer))
}

async fn ask_stream(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Response {
    let rx = state
        .answers
        .ask_stream(request.conversation_id, request.question, request.top_k);

    let body = Body::from_stream(rx.into_stream().map(|frame| {
        let mut line = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        Ok::<_, std::convert::Infallible>(line)
    }));

    ([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response()
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store = component_status(state.store.ping().await);
    let embedder = component_status(state.embedder.ping().await);
    let llm = component_status(state.llm.ping().await);

    let degraded = [&store, &embedder, &llm].iter().any(|s| s.as_str() != "ok");
    let response = HealthResponse {
        status: if degraded { "degraded" } else { "ok" }.to_string(),
        components: HealthComponents {
            store,
            embedder,
            llm,
        },
    };

    // Degraded still answers 200 so probes can read the component detail.
    (StatusCode::OK, Json(response))
}

fn component_status(result: Result<()>) -> String {
    match result {
        Ok(()) => "ok".to_string(),
        Err(err) => {
            error!("Health probe failed: {}", err);
            "unavailable".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingest_request_wire_format() {
        let json = r#"{
            "source_type": "git_markdown",
            "source_spec": {"owner": "wso2", "repository": "docs"},
            "options": {"embed_batch_size": 4}
        }"#;
        let request: IngestRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.source_type, SourceType::GitMarkdown);
        assert_eq!(request.source_spec.owner, "wso2");
        assert_eq!(request.options.unwrap().embed_batch_size, Some(4));
    }

    #[test]
    fn test_ask_request_defaults() {
        let request: AskRequest =
            serde_json::from_str(r#"{"question": "Where does Alpha deploy?"}"#).unwrap();
        assert!(request.conversation_id.is_none());
        assert!(request.top_k.is_none());
    }

    #[test]
    fn test_error_response_skips_absent_retry() {
        let body = ErrorResponse {
            error: "x".to_string(),
            code: "llm".to_string(),
            retry_after_secs: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("retry_after_secs"));
    }
}

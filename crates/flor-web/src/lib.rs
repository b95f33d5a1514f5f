//! Axum JSON API over the reconciler: feed ingestion trigger, enrichment
//! uploads, merged-order reads and the extraction proxy.

mod upload;

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flor_core::{MergedOrder, OrderFilter, Pagination, MAX_PAGE_LIMIT};
use flor_feed::FeedError;
use flor_storage::{ExtractRequest, ExtractionClient, ExtractionError};
use flor_sync::{
    extraction_client, EnrichmentOutcome, FeedIngestRequest, FileRejection, FileStatus,
    IngestSummary, ReconcileError, Reconciler, ReconcilerConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::upload::UploadForm;

pub const CRATE_NAME: &str = "flor-web";

#[derive(Clone)]
pub struct AppState {
    pub reconciler: Arc<Reconciler>,
    pub extraction: Option<ExtractionClient>,
}

impl AppState {
    pub fn new(reconciler: Arc<Reconciler>, extraction: Option<ExtractionClient>) -> Self {
        Self {
            reconciler,
            extraction,
        }
    }
}

/// Error body shared by every route: `{"status": "error", "detail": ...}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn unprocessable(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, detail)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({"status": "error", "detail": self.detail})),
        )
            .into_response()
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        let status = match &err {
            ReconcileError::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ReconcileError::NotFound(_) => StatusCode::NOT_FOUND,
            ReconcileError::Feed(FeedError::InvalidUrl { .. }) => StatusCode::UNPROCESSABLE_ENTITY,
            ReconcileError::Feed(_) => StatusCode::BAD_GATEWAY,
            ReconcileError::Storage(_) | ReconcileError::Repository(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self::new(status, err.to_string())
    }
}

impl From<ExtractionError> for ApiError {
    fn from(err: ExtractionError) -> Self {
        warn!(error = %err, "extraction failed");
        Self::new(StatusCode::BAD_GATEWAY, err.to_string())
    }
}

pub fn app(state: AppState) -> Router {
    let body_limit =
        usize::try_from(state.reconciler.config().max_request_bytes).unwrap_or(usize::MAX);
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/rss/ingest", post(ingest_handler))
        .route("/api/upload", post(upload_handler))
        .route("/api/upload_file", post(upload_handler))
        .route("/api/orders", get(list_orders_handler))
        .route("/api/orders/{id}", get(order_handler))
        .route("/api/parse", post(parse_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(Arc::new(state))
}

pub async fn serve(config: ReconcilerConfig) -> anyhow::Result<()> {
    let port = config.web_port;
    let extraction = extraction_client(&config)?;
    let reconciler = Reconciler::from_config(config).await?;
    let state = AppState::new(Arc::new(reconciler), extraction);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "flor-web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> Json<JsonValue> {
    Json(json!({"status": "ok"}))
}

/// An empty body polls the configured feed with configured filters.
async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<IngestSummary>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        FeedIngestRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|err| ApiError::unprocessable(format!("invalid ingest request: {err}")))?
    };
    let summary = state.reconciler.ingest_feed(&request).await?;
    Ok(Json(summary))
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    status: &'static str,
    mode: &'static str,
    #[serde(flatten)]
    outcome: EnrichmentOutcome,
}

async fn upload_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ApiError> {
    let max_file_bytes = state.reconciler.config().max_upload_bytes;
    let form = UploadForm::from_request(request, &state, max_file_bytes).await?;
    let mode = if form.is_attachment() {
        "attachment"
    } else {
        "metadata"
    };
    let payload = form.into_payload()?;
    let outcome = state.reconciler.apply_enrichment(payload).await?;

    // A lone file that was refused, with nothing else written, fails the request.
    if let [only] = outcome.files.as_slice() {
        if let FileStatus::Rejected { rejection, detail } = &only.status {
            if !outcome.created && !outcome.changed {
                let status = match rejection {
                    FileRejection::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                    FileRejection::Empty => StatusCode::UNPROCESSABLE_ENTITY,
                };
                return Err(ApiError::new(status, detail.clone()));
            }
        }
    }

    Ok(Json(UploadResponse {
        status: "success",
        mode,
        outcome,
    })
    .into_response())
}

#[derive(Debug, Default, Deserialize)]
struct OrdersQuery {
    limit: Option<usize>,
    offset: Option<usize>,
    q: Option<String>,
    has_attachments: Option<bool>,
}

#[derive(Debug, Serialize)]
struct OrdersPage {
    items: Vec<MergedOrder>,
    limit: usize,
    offset: usize,
}

async fn list_orders_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OrdersQuery>,
) -> Result<Json<OrdersPage>, ApiError> {
    if let Some(limit) = query.limit {
        if !(1..=MAX_PAGE_LIMIT).contains(&limit) {
            return Err(ApiError::unprocessable(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
    }
    let page = Pagination::new(query.limit, query.offset);
    let filter = OrderFilter {
        q: query.q,
        has_attachments: query.has_attachments,
    };
    let items = state.reconciler.list_orders(&filter, page).await?;
    Ok(Json(OrdersPage {
        items,
        limit: page.limit,
        offset: page.offset,
    }))
}

async fn order_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<MergedOrder>, ApiError> {
    Ok(Json(state.reconciler.get_merged_order(&id).await?))
}

#[derive(Debug, Deserialize)]
struct ParseRequest {
    url: String,
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default)]
    schema: Option<JsonValue>,
    #[serde(default)]
    options: Option<JsonValue>,
}

async fn parse_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ParseRequest>,
) -> Result<Json<JsonValue>, ApiError> {
    let Some(client) = &state.extraction else {
        return Err(ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "extraction service is not configured",
        ));
    };
    let url = request.url.trim();
    if url.is_empty() {
        return Err(ApiError::unprocessable("url is required"));
    }
    let data = client
        .extract(&ExtractRequest {
            url: url.to_string(),
            instruction: request.instruction,
            schema: request.schema,
            options: request.options,
        })
        .await?;
    Ok(Json(json!({"status": "success", "data": data})))
}

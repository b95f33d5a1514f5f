//! Reconciliation engine: merges feed sightings and enrichment uploads into
//! one canonical order per project id.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use flor_core::{
    Attachment, AttachmentUpload, AttachmentWrite, EnrichmentPayload, FeedStub, MergedOrder,
    OrderFilter, OrderId, OrderPatch, Origin, Pagination, PayloadError,
};
use flor_feed::{FeedError, FeedRequest, FeedSource, HttpFeedPoller, MalformedEntry};
use flor_storage::repository::{
    MemoryOrderRepository, OrderRepository, PgOrderRepository, RepositoryError, UpsertOutcome,
};
use flor_storage::{AttachmentStore, ExtractionClient, HttpClientConfig, HttpFetcher, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "flor-sync";

const BYTES_PER_MB: u64 = 1024 * 1024;
const DEFAULT_FEED_URL: &str = "https://www.fl.ru/rss/all.xml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub database_url: Option<String>,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
    pub max_request_bytes: u64,
    pub rss_feed_url: String,
    pub rss_category: Option<String>,
    pub rss_subcategory: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub extractor_service_url: Option<String>,
    pub web_port: u16,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            upload_dir: PathBuf::from("./uploads"),
            max_upload_bytes: 250 * BYTES_PER_MB,
            max_request_bytes: 4 * 250 * BYTES_PER_MB,
            rss_feed_url: DEFAULT_FEED_URL.to_string(),
            rss_category: None,
            rss_subcategory: None,
            user_agent: "flor-bot/0.1".to_string(),
            http_timeout_secs: 20,
            extractor_service_url: None,
            web_port: 8000,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str| -> Result<Option<u64>> {
            get(key)
                .map(|raw| raw.parse::<u64>().with_context(|| format!("{key} must be an integer, got {raw:?}")))
                .transpose()
        };

        let defaults = Self::default();
        let max_upload_mb = number("MAX_UPLOAD_MB")?.unwrap_or(250);
        if max_upload_mb == 0 {
            bail!("MAX_UPLOAD_MB must be greater than zero");
        }
        let max_request_mb = number("MAX_REQUEST_MB")?.unwrap_or(max_upload_mb.saturating_mul(4));
        if max_request_mb < max_upload_mb {
            bail!("MAX_REQUEST_MB ({max_request_mb}) must not be below MAX_UPLOAD_MB ({max_upload_mb})");
        }
        let web_port = match get("FLOR_WEB_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("FLOR_WEB_PORT must be a port number, got {raw:?}"))?,
            None => defaults.web_port,
        };

        Ok(Self {
            database_url: get("DATABASE_URL"),
            upload_dir: get("UPLOAD_DIR").map(PathBuf::from).unwrap_or(defaults.upload_dir),
            max_upload_bytes: max_upload_mb.saturating_mul(BYTES_PER_MB),
            max_request_bytes: max_request_mb.saturating_mul(BYTES_PER_MB),
            rss_feed_url: get("RSS_FEED_URL").unwrap_or(defaults.rss_feed_url),
            rss_category: get("RSS_CATEGORY"),
            rss_subcategory: get("RSS_SUBCATEGORY"),
            user_agent: get("FLOR_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: number("FLOR_HTTP_TIMEOUT_SECS")?.unwrap_or(defaults.http_timeout_secs),
            extractor_service_url: get("EXTRACTOR_SERVICE_URL"),
            web_port,
        })
    }

    /// Fills the unset parts of an ingestion request from configuration.
    pub fn feed_request(&self, request: &FeedIngestRequest) -> FeedRequest {
        let explicit = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        FeedRequest {
            feed_url: explicit(&request.feed_url).unwrap_or_else(|| self.rss_feed_url.clone()),
            category: explicit(&request.category).or_else(|| self.rss_category.clone()),
            subcategory: explicit(&request.subcategory).or_else(|| self.rss_subcategory.clone()),
            limit: request.limit,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

/// Ingestion trigger input; every field falls back to configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedIngestRequest {
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub feed_url: String,
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub filtered_out: usize,
    pub errored: usize,
    pub skipped_entries: Vec<MalformedEntry>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),
    #[error("order {0} not found")]
    NotFound(String),
    #[error("attachment storage failed: {0:#}")]
    Storage(anyhow::Error),
    #[error("repository failure: {0:#}")]
    Repository(anyhow::Error),
}

impl From<RepositoryError> for ReconcileError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(id) => Self::NotFound(id.to_string()),
            RepositoryError::Backend(err) => Self::Repository(err),
        }
    }
}

/// Why one file of an upload was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileRejection {
    TooLarge { max_bytes: u64 },
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileStatus {
    Stored {
        attachment: Attachment,
        write: AttachmentWrite,
    },
    Rejected {
        rejection: FileRejection,
        detail: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileOutcome {
    pub index: usize,
    pub filename: String,
    pub original_url: String,
    #[serde(flatten)]
    pub status: FileStatus,
}

impl FileOutcome {
    pub fn rejection(&self) -> Option<FileRejection> {
        match &self.status {
            FileStatus::Rejected { rejection, .. } => Some(*rejection),
            FileStatus::Stored { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentOutcome {
    pub order_id: OrderId,
    pub created: bool,
    pub changed: bool,
    pub files: Vec<FileOutcome>,
}

impl EnrichmentOutcome {
    pub fn stored_count(&self) -> usize {
        self.files.iter().filter(|file| file.rejection().is_none()).count()
    }

    pub fn rejected_count(&self) -> usize {
        self.files.len() - self.stored_count()
    }
}

/// Orchestrates both ingestion channels over one repository and one attachment
/// store. Holds no locks of its own; per-id atomicity comes from the repository.
pub struct Reconciler {
    repository: Arc<dyn OrderRepository>,
    attachments: AttachmentStore,
    feed: Arc<dyn FeedSource>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        repository: Arc<dyn OrderRepository>,
        attachments: AttachmentStore,
        feed: Arc<dyn FeedSource>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            repository,
            attachments,
            feed,
            config,
        }
    }

    /// Wires the production collaborators: PostgreSQL when `DATABASE_URL` is
    /// set (migrations applied), the in-memory repository otherwise, and the
    /// HTTP feed poller.
    pub async fn from_config(config: ReconcilerConfig) -> Result<Self> {
        let repository = connect_repository(&config).await?;
        let fetcher = HttpFetcher::new(HttpClientConfig {
            timeout: config.http_timeout(),
            user_agent: Some(config.user_agent.clone()),
        })?;
        let attachments = AttachmentStore::new(config.upload_dir.clone());
        Ok(Self::new(
            repository,
            attachments,
            Arc::new(HttpFeedPoller::new(fetcher)),
            config,
        ))
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Polls the feed once and applies every usable stub. Bad entries and
    /// per-stub write failures are counted, never fatal; only a failed fetch
    /// or an unreadable document fails the call.
    pub async fn ingest_feed(&self, request: &FeedIngestRequest) -> Result<IngestSummary, ReconcileError> {
        let request = self.config.feed_request(request);
        let span = info_span!("ingest_feed", feed_url = %request.feed_url);
        self.ingest_inner(&request).instrument(span).await
    }

    async fn ingest_inner(&self, request: &FeedRequest) -> Result<IngestSummary, ReconcileError> {
        let parsed = match self.feed.fetch_and_parse(request).await {
            Ok(parsed) => parsed,
            Err(err) => {
                if let FeedError::Fetch(fetch) = &err {
                    warn!(error = %fetch, disposition = ?fetch.retry_disposition(), "feed fetch failed");
                }
                return Err(err.into());
            }
        };
        let mut summary = IngestSummary {
            feed_url: parsed.feed_url.clone(),
            skipped: parsed.skipped.len(),
            filtered_out: parsed.filtered_out,
            skipped_entries: parsed.skipped.clone(),
            ..IngestSummary::default()
        };
        for stub in &parsed.stubs {
            match self.apply_feed_stub(stub).await {
                Ok(outcome) if outcome.created => summary.created += 1,
                Ok(outcome) if outcome.changed => summary.updated += 1,
                Ok(_) => summary.unchanged += 1,
                Err(err) => {
                    warn!(order_id = %stub.id, error = %err, "failed to apply feed stub");
                    summary.errored += 1;
                }
            }
        }
        summary.processed = summary.created + summary.updated + summary.unchanged;
        info!(
            processed = summary.processed,
            created = summary.created,
            updated = summary.updated,
            skipped = summary.skipped,
            errored = summary.errored,
            "feed ingestion complete"
        );
        Ok(summary)
    }

    pub async fn apply_feed_stub(&self, stub: &FeedStub) -> Result<UpsertOutcome, ReconcileError> {
        let outcome = self
            .repository
            .upsert_partial(&stub.id, &stub.to_patch())
            .await?;
        debug!(order_id = %stub.id, created = outcome.created, changed = outcome.changed, "feed stub applied");
        Ok(outcome)
    }

    /// Applies one enrichment event. The payload is validated before anything
    /// is written. Files are stored one by one: an oversized or empty file is
    /// rejected on its own while its siblings still land. The order is created
    /// before the first stored file, so a request whose files are all rejected
    /// and that carries no metadata writes nothing.
    pub async fn apply_enrichment(
        &self,
        payload: EnrichmentPayload,
    ) -> Result<EnrichmentOutcome, ReconcileError> {
        let order_id = payload.validate()?;
        let span = info_span!("apply_enrichment", %order_id, files = payload.attachments.len());
        self.apply_validated(order_id, payload).instrument(span).await
    }

    async fn apply_validated(
        &self,
        order_id: OrderId,
        payload: EnrichmentPayload,
    ) -> Result<EnrichmentOutcome, ReconcileError> {
        let mut outcome = EnrichmentOutcome {
            order_id: order_id.clone(),
            created: false,
            changed: false,
            files: Vec::with_capacity(payload.attachments.len()),
        };

        let patch = payload.to_patch();
        let mut order_exists = false;
        if !patch.is_empty() {
            self.upsert_into(&mut outcome, &patch).await?;
            order_exists = true;
        }

        for (index, upload) in payload.attachments.iter().enumerate() {
            let original_url = upload.source_key();
            let stored = self
                .attachments
                .store(
                    &order_id,
                    &original_url,
                    &upload.filename,
                    upload.bytes.as_slice(),
                    self.config.max_upload_bytes,
                )
                .await;
            let stored = match stored {
                Ok(stored) => stored,
                Err(StoreError::Storage(err)) => return Err(ReconcileError::Storage(err)),
                Err(rejected) => {
                    let rejection = match &rejected {
                        StoreError::PayloadTooLarge { max_bytes } => FileRejection::TooLarge {
                            max_bytes: *max_bytes,
                        },
                        _ => FileRejection::Empty,
                    };
                    warn!(%original_url, filename = %upload.filename, reason = %rejected, "attachment rejected");
                    outcome.files.push(FileOutcome {
                        index,
                        filename: upload.filename.clone(),
                        original_url,
                        status: FileStatus::Rejected {
                            rejection,
                            detail: rejected.to_string(),
                        },
                    });
                    continue;
                }
            };

            if !order_exists {
                self.upsert_into(&mut outcome, &OrderPatch::empty(Origin::Enrichment))
                    .await?;
                order_exists = true;
            }

            let attachment = attachment_record(&order_id, original_url.clone(), upload, stored);
            let recorded = self.repository.record_attachment(attachment).await?;
            if recorded.write != AttachmentWrite::Unchanged {
                outcome.changed = true;
            }
            debug!(%original_url, write = ?recorded.write, "attachment recorded");
            outcome.files.push(FileOutcome {
                index,
                filename: upload.filename.clone(),
                original_url,
                status: FileStatus::Stored {
                    attachment: recorded.attachment,
                    write: recorded.write,
                },
            });
        }

        info!(
            created = outcome.created,
            changed = outcome.changed,
            stored = outcome.stored_count(),
            rejected = outcome.rejected_count(),
            "enrichment applied"
        );
        Ok(outcome)
    }

    async fn upsert_into(
        &self,
        outcome: &mut EnrichmentOutcome,
        patch: &OrderPatch,
    ) -> Result<(), ReconcileError> {
        let upserted = self
            .repository
            .upsert_partial(&outcome.order_id, patch)
            .await?;
        outcome.created |= upserted.created;
        outcome.changed |= upserted.changed;
        Ok(())
    }

    /// The merged view of one order. An id that is not well-formed was never
    /// sighted, so it is reported as not found.
    pub async fn get_merged_order(&self, raw_id: &str) -> Result<MergedOrder, ReconcileError> {
        let id = OrderId::parse(raw_id).map_err(|_| ReconcileError::NotFound(raw_id.trim().to_string()))?;
        let order = self.repository.get(&id).await?;
        let attachments = self.repository.attachments_for(&id).await?;
        Ok(MergedOrder::assemble(order, attachments))
    }

    pub async fn list_orders(
        &self,
        filter: &OrderFilter,
        page: Pagination,
    ) -> Result<Vec<MergedOrder>, ReconcileError> {
        let orders = self.repository.list(filter, page).await?;
        let mut merged = Vec::with_capacity(orders.len());
        for order in orders {
            let attachments = self.repository.attachments_for(&order.id).await?;
            merged.push(MergedOrder::assemble(order, attachments));
        }
        Ok(merged)
    }
}

fn attachment_record(
    order_id: &OrderId,
    original_url: String,
    upload: &AttachmentUpload,
    stored: flor_storage::StoredFile,
) -> Attachment {
    Attachment {
        order_id: order_id.clone(),
        original_url,
        page_url: upload.page_url.clone(),
        declared_filename: upload.filename.clone(),
        stored_filename: stored.stored_filename,
        storage_path: stored.relative_path.to_string_lossy().into_owned(),
        size_bytes: stored.byte_size,
        content_type: upload.content_type.clone(),
        sha256: stored.sha256,
        version: 0,
        ingested_at: Utc::now(),
    }
}

/// PostgreSQL when `DATABASE_URL` is configured, otherwise a process-local store.
pub async fn connect_repository(config: &ReconcilerConfig) -> Result<Arc<dyn OrderRepository>> {
    match &config.database_url {
        Some(url) => {
            let repository = PgOrderRepository::connect(url).await?;
            repository.migrate().await?;
            info!("using postgres order repository");
            Ok(Arc::new(repository))
        }
        None => {
            warn!("DATABASE_URL not set; orders are kept in memory only");
            Ok(Arc::new(MemoryOrderRepository::new()))
        }
    }
}

pub async fn run_migrations(config: &ReconcilerConfig) -> Result<()> {
    let Some(url) = &config.database_url else {
        bail!("DATABASE_URL is required to run migrations");
    };
    PgOrderRepository::connect(url).await?.migrate().await?;
    info!("migrations applied");
    Ok(())
}

/// The explicit extraction-service handle, if one is configured.
pub fn extraction_client(config: &ReconcilerConfig) -> Result<Option<ExtractionClient>> {
    config
        .extractor_service_url
        .as_deref()
        .map(|url| ExtractionClient::new(url, config.http_timeout()))
        .transpose()
}

//! Attachment file storage, order repository and HTTP clients for FLOR.

pub mod repository;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use flor_core::{sanitize_filename, OrderId};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "flor-storage";

const COPY_CHUNK_BYTES: usize = 64 * 1024;
const SUFFIX_HASH_CHARS: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    pub stored_filename: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub sha256: String,
    pub byte_size: u64,
    pub deduplicated: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("attachment exceeds the {max_bytes} byte upload limit")]
    PayloadTooLarge { max_bytes: u64 },
    #[error("attachment is empty")]
    EmptyPayload,
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Filesystem store for order attachments.
///
/// Files live under `<root>/project_<order id>/<sanitized filename>`; a name already
/// taken by different bytes gets a `__<hash prefix>` suffix, so identical content
/// always resolves to an existing path and different orders never share a directory.
#[derive(Debug, Clone)]
pub struct AttachmentStore {
    root: PathBuf,
}

impl AttachmentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn order_dir(order_id: &OrderId) -> PathBuf {
        PathBuf::from(format!("project_{order_id}"))
    }

    /// Candidate names in preference order: the plain sanitized name, then
    /// hash-disambiguated variants.
    pub fn candidate_names(filename: &str, content_hash: &str) -> Vec<String> {
        let sanitized = sanitize_filename(filename);
        let (stem, ext) = match sanitized.rfind('.') {
            Some(pos) if pos > 0 => sanitized.split_at(pos),
            _ => (sanitized.as_str(), ""),
        };
        let short = &content_hash[..SUFFIX_HASH_CHARS.min(content_hash.len())];
        vec![
            sanitized.clone(),
            format!("{stem}__{short}{ext}"),
            format!("{stem}__{content_hash}{ext}"),
        ]
    }

    /// Streams `reader` to disk under the order's directory, enforcing `max_size_bytes`.
    ///
    /// Bytes go to a temp file first and are hard-linked into place, so a final
    /// path only ever holds complete content and an existing name is never
    /// overwritten.
    pub async fn store<R>(
        &self,
        order_id: &OrderId,
        original_url: &str,
        filename: &str,
        reader: R,
        max_size_bytes: u64,
    ) -> Result<StoredFile, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let span = info_span!("attachment_store", %order_id, original_url, filename);
        self.store_inner(order_id, filename, reader, max_size_bytes)
            .instrument(span)
            .await
    }

    async fn store_inner<R>(
        &self,
        order_id: &OrderId,
        filename: &str,
        mut reader: R,
        max_size_bytes: u64,
    ) -> Result<StoredFile, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let relative_dir = Self::order_dir(order_id);
        let dir = self.root.join(&relative_dir);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating attachment directory {}", dir.display()))?;

        let temp_path = dir.join(format!(".{}.part", Uuid::new_v4()));
        let written = write_limited(&mut reader, &temp_path, max_size_bytes).await;
        let (content_hash, byte_size) = match written {
            Ok((_, 0)) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(StoreError::EmptyPayload);
            }
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(err);
            }
        };

        let result = self
            .link_into_place(&temp_path, &dir, &relative_dir, filename, &content_hash, byte_size)
            .await;
        let _ = fs::remove_file(&temp_path).await;
        result
    }

    async fn link_into_place(
        &self,
        temp_path: &Path,
        dir: &Path,
        relative_dir: &Path,
        filename: &str,
        content_hash: &str,
        byte_size: u64,
    ) -> Result<StoredFile, StoreError> {
        for candidate in Self::candidate_names(filename, content_hash) {
            let absolute_path = dir.join(&candidate);
            let stored = |deduplicated| StoredFile {
                relative_path: relative_dir.join(&candidate),
                absolute_path: absolute_path.clone(),
                stored_filename: candidate.clone(),
                sha256: content_hash.to_string(),
                byte_size,
                deduplicated,
            };

            match fs::hard_link(temp_path, &absolute_path).await {
                Ok(()) => {
                    debug!(path = %absolute_path.display(), byte_size, "stored attachment");
                    return Ok(stored(false));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if file_sha256(&absolute_path).await? == content_hash {
                        debug!(path = %absolute_path.display(), "attachment content already stored");
                        return Ok(stored(true));
                    }
                }
                Err(err) => {
                    return Err(StoreError::Storage(anyhow::Error::new(err).context(format!(
                        "linking {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    ))));
                }
            }
        }
        Err(StoreError::Storage(anyhow::anyhow!(
            "no free storage name for {filename} in {}",
            dir.display()
        )))
    }
}

async fn write_limited<R>(
    reader: &mut R,
    temp_path: &Path,
    max_size_bytes: u64,
) -> Result<(String, u64), StoreError>
where
    R: AsyncRead + Unpin,
{
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp_path)
        .await
        .with_context(|| format!("opening temp attachment file {}", temp_path.display()))?;

    let mut hasher = Sha256::new();
    let mut total: u64 = 0;
    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .context("reading attachment stream")?;
        if n == 0 {
            break;
        }
        total += n as u64;
        if total > max_size_bytes {
            return Err(StoreError::PayloadTooLarge {
                max_bytes: max_size_bytes,
            });
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])
            .await
            .with_context(|| format!("writing temp attachment file {}", temp_path.display()))?;
    }
    file.flush()
        .await
        .with_context(|| format!("flushing temp attachment file {}", temp_path.display()))?;
    Ok((hex::encode(hasher.finalize()), total))
}

async fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("opening stored attachment {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_CHUNK_BYTES];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("reading stored attachment {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

/// Feed fetch failure. Retrying is left to the caller; `retry_disposition`
/// says whether a retry is worth it.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn retry_disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Single GET; any non-success status is an error.
    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_inner(url).instrument(span).await
    }

    async fn fetch_inner(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.bytes().await?.to_vec();
        debug!(%status, bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<JsonValue>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("could not reach extraction service: {0}")]
    Request(#[source] reqwest::Error),
    #[error("extraction service returned {status}: {body}")]
    Service { status: u16, body: String },
    #[error("extraction service returned invalid json: {0}")]
    InvalidResponse(#[source] reqwest::Error),
}

/// Handle to the external page-extraction service. Built once at startup and
/// shared by reference; it holds the only connection pool to that service.
#[derive(Debug, Clone)]
pub struct ExtractionClient {
    client: reqwest::Client,
    base_url: String,
}

impl ExtractionClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building extraction client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/extract", self.base_url)
    }

    pub async fn extract(&self, request: &ExtractRequest) -> Result<JsonValue, ExtractionError> {
        let span = info_span!("extract", url = %request.url);
        self.extract_inner(request).instrument(span).await
    }

    async fn extract_inner(&self, request: &ExtractRequest) -> Result<JsonValue, ExtractionError> {
        let resp = self
            .client
            .post(self.endpoint())
            .json(request)
            .send()
            .await
            .map_err(ExtractionError::Request)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExtractionError::Service {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<JsonValue>()
            .await
            .map_err(ExtractionError::InvalidResponse)
    }
}

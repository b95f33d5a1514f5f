//! Decoding of the enrichment upload wire formats.
//!
//! Accepted shapes: a JSON body holding project metadata directly or under
//! `projectData` (object or JSON string), a url-encoded form, and multipart
//! forms carrying `projectData` and/or one or more `file` parts.

use axum::body::Bytes;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::Form;
use flor_core::{AttachmentUpload, EnrichmentPayload, FileRef};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::ApiError;

const FALLBACK_FILENAME: &str = "upload.bin";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct UploadedFile {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Every field an upload may carry, whatever the encoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct UploadForm {
    pub project_data: Option<JsonValue>,
    pub kind: Option<String>,
    pub project_id: Option<String>,
    pub page_url: Option<String>,
    pub original_url: Option<String>,
    pub filename: Option<String>,
    pub files: Vec<UploadedFile>,
}

impl UploadForm {
    /// `max_file_bytes` bounds how much of each multipart file is buffered;
    /// a longer file keeps one extra byte so storage still rejects it as too large.
    pub async fn from_request<S>(
        request: Request,
        state: &S,
        max_file_bytes: u64,
    ) -> Result<Self, ApiError>
    where
        S: Send + Sync,
    {
        let content_type = request
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(request, state)
                .await
                .map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text()))?;
            Self::from_multipart(multipart, max_file_bytes).await
        } else if content_type.starts_with("application/json") {
            let body = Bytes::from_request(request, state)
                .await
                .map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text()))?;
            let value: JsonValue = serde_json::from_slice(&body).map_err(|err| {
                ApiError::unprocessable(format!("invalid JSON in request body: {err}"))
            })?;
            Self::from_json(value)
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(pairs) = Form::<Vec<(String, String)>>::from_request(request, state)
                .await
                .map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text()))?;
            let mut form = Self::default();
            for (name, value) in pairs {
                form.set_text(&name, value);
            }
            Ok(form)
        } else {
            Err(ApiError::new(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                format!("unsupported content type {content_type:?}"),
            ))
        }
    }

    async fn from_multipart(mut multipart: Multipart, max_file_bytes: u64) -> Result<Self, ApiError> {
        let cap = usize::try_from(max_file_bytes.saturating_add(1)).unwrap_or(usize::MAX);
        let mut form = Self::default();
        while let Some(mut field) = multipart.next_field().await.map_err(multipart_error)? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                let file_name = field.file_name().map(str::to_string);
                let content_type = field.content_type().map(str::to_string);
                let mut bytes = Vec::new();
                let mut truncated = false;
                while let Some(chunk) = field.chunk().await.map_err(multipart_error)? {
                    truncated |= append_capped(&mut bytes, &chunk, cap);
                }
                if truncated {
                    debug!(file_name = ?file_name, max_file_bytes, "multipart file exceeds upload limit");
                }
                form.files.push(UploadedFile {
                    file_name,
                    content_type,
                    bytes,
                });
            } else {
                let value = field.text().await.map_err(multipart_error)?;
                form.set_text(&name, value);
            }
        }
        Ok(form)
    }

    /// Without a `projectData` key the whole object is the project metadata.
    pub fn from_json(value: JsonValue) -> Result<Self, ApiError> {
        let JsonValue::Object(mut object) = value else {
            return Err(ApiError::unprocessable("request body must be a JSON object"));
        };
        let mut form = Self::default();
        for key in [
            "type",
            "project_id",
            "projectId",
            "page_url",
            "pageUrl",
            "original_url",
            "originalUrl",
            "filename",
        ] {
            if let Some(text) = object.get(key).and_then(scalar_text) {
                form.set_text(key, text);
            }
        }
        form.project_data = Some(
            object
                .remove("projectData")
                .unwrap_or(JsonValue::Object(object)),
        );
        Ok(form)
    }

    /// First non-blank value wins for aliased keys.
    fn set_text(&mut self, name: &str, value: String) {
        let value = value.trim().to_string();
        if value.is_empty() {
            return;
        }
        let slot = match name {
            "projectData" => {
                self.project_data.get_or_insert(JsonValue::String(value));
                return;
            }
            "type" => &mut self.kind,
            "project_id" | "projectId" => &mut self.project_id,
            "page_url" | "pageUrl" => &mut self.page_url,
            "original_url" | "originalUrl" => &mut self.original_url,
            "filename" => &mut self.filename,
            _ => return,
        };
        slot.get_or_insert(value);
    }

    pub fn is_attachment(&self) -> bool {
        !self.files.is_empty()
            || self
                .kind
                .as_deref()
                .is_some_and(|kind| kind.eq_ignore_ascii_case("attachment"))
    }

    /// `filename` and `original_url` describe a lone file; with several files
    /// each keeps its own part name and is keyed by it.
    pub fn into_payload(self) -> Result<EnrichmentPayload, ApiError> {
        let attachment_mode = self.is_attachment();
        let mut payload = match self.project_data {
            Some(raw) => payload_from_project_data(decode_project_data(raw)?)?,
            None if attachment_mode => EnrichmentPayload::default(),
            None => {
                return Err(ApiError::bad_request(
                    "nothing to process: send projectData or a file",
                ))
            }
        };
        if !attachment_mode {
            return Ok(payload);
        }
        if self.files.is_empty() {
            return Err(ApiError::bad_request("attachment file is required"));
        }

        if payload.id.is_none() {
            payload.id = self.project_id;
        }
        let single = self.files.len() == 1;
        for (index, file) in self.files.into_iter().enumerate() {
            let declared = if single { self.filename.clone() } else { None };
            let filename = declared
                .or(file.file_name)
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| fallback_filename(single, index));
            payload.attachments.push(AttachmentUpload {
                original_url: if single { self.original_url.clone() } else { None },
                page_url: self.page_url.clone(),
                filename,
                content_type: file.content_type,
                bytes: file.bytes,
            });
        }
        Ok(payload)
    }
}

/// Unnamed parts of a multi-file upload get distinct names so their upload
/// keys never collide.
fn fallback_filename(single: bool, index: usize) -> String {
    if single {
        FALLBACK_FILENAME.to_string()
    } else {
        format!("upload-{}.bin", index + 1)
    }
}

/// Appends at most `cap - buffer.len()` bytes of `chunk`. Returns whether any
/// bytes were dropped.
fn append_capped(buffer: &mut Vec<u8>, chunk: &[u8], cap: usize) -> bool {
    let room = cap.saturating_sub(buffer.len());
    let take = room.min(chunk.len());
    buffer.extend_from_slice(&chunk[..take]);
    take < chunk.len()
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> ApiError {
    ApiError::new(err.status(), err.body_text())
}

fn decode_project_data(raw: JsonValue) -> Result<JsonValue, ApiError> {
    match raw {
        JsonValue::String(text) => serde_json::from_str(&text)
            .map_err(|err| ApiError::unprocessable(format!("invalid JSON in projectData: {err}"))),
        JsonValue::Object(_) => Ok(raw),
        _ => Err(ApiError::unprocessable(
            "projectData must be an object or a JSON string",
        )),
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        JsonValue::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Maps extension metadata (`id, url, title, description, budget, links,
/// fileUrls, fileNames`) onto an enrichment payload, keeping the whole
/// object as raw enrichment data.
fn payload_from_project_data(value: JsonValue) -> Result<EnrichmentPayload, ApiError> {
    let JsonValue::Object(map) = &value else {
        return Err(ApiError::unprocessable("projectData must be a JSON object"));
    };
    let text = |key: &str| map.get(key).and_then(scalar_text);
    let strings = |key: &str| {
        map.get(key)
            .and_then(JsonValue::as_array)
            .map(|items| items.iter().filter_map(scalar_text).collect::<Vec<_>>())
    };
    let files = strings("fileUrls").map(|urls| {
        let names = strings("fileNames").unwrap_or_default();
        urls.into_iter()
            .enumerate()
            .map(|(index, url)| FileRef {
                url,
                name: names.get(index).cloned(),
            })
            .collect()
    });

    Ok(EnrichmentPayload {
        id: text("id")
            .or_else(|| text("project_id"))
            .or_else(|| text("projectId")),
        url: text("url"),
        title: text("title"),
        description: text("description"),
        budget: text("budget"),
        links: strings("links"),
        files,
        raw: Some(value.clone()),
        attachments: Vec::new(),
    })
}

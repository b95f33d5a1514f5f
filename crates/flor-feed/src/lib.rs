//! Feed poller: fetches the project RSS feed and turns items into order stubs.

mod rss;

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flor_core::{FeedStub, OrderId};
use flor_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{Html, Node, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::rss::RawItem;

pub const CRATE_NAME: &str = "flor-feed";

/// Separator between category and subcategory in an item's `<category>`.
const CATEGORY_SEPARATOR: &str = " / ";
const LINK_TRAILING_PUNCTUATION: &[char] = &['.', ',', '"', ')', '\'', '»'];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    pub feed_url: String,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("invalid feed url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("failed to fetch feed: {0}")]
    Fetch(#[from] FetchError),
    #[error("failed to read feed source: {0:#}")]
    Source(anyhow::Error),
    #[error("failed to parse feed: {0}")]
    Parse(String),
}

/// A feed item that could not become a stub. Skipped, never fatal to the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum MalformedEntry {
    #[error("item #{index} has no link")]
    MissingLink { index: usize },
    #[error("item #{index} has no title")]
    MissingTitle { index: usize },
    #[error("item #{index}: no project id in {link}")]
    UnextractableId { index: usize, link: String },
}

/// Result of one poll: usable stubs in feed order plus what was skipped.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedFeed {
    pub feed_url: String,
    pub stubs: Vec<FeedStub>,
    pub skipped: Vec<MalformedEntry>,
    pub filtered_out: usize,
}

impl ParsedFeed {
    /// Applies the category filters, then truncates to `limit`. Malformed
    /// entries count as skipped regardless of the limit.
    pub fn select(
        feed_url: String,
        entries: Vec<Result<FeedStub, MalformedEntry>>,
        request: &FeedRequest,
    ) -> Self {
        let mut parsed = Self {
            feed_url,
            ..Self::default()
        };
        for entry in entries {
            match entry {
                Ok(stub) if matches_filters(&stub, request) => parsed.stubs.push(stub),
                Ok(_) => parsed.filtered_out += 1,
                Err(skip) => {
                    warn!(feed_url = %parsed.feed_url, reason = %skip, "skipping feed entry");
                    parsed.skipped.push(skip);
                }
            }
        }
        if let Some(limit) = request.limit {
            parsed.stubs.truncate(limit);
        }
        parsed
    }
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch_and_parse(&self, request: &FeedRequest) -> Result<ParsedFeed, FeedError>;
}

/// Polls the feed over HTTP. One request per call; no retries.
#[derive(Debug, Clone)]
pub struct HttpFeedPoller {
    fetcher: HttpFetcher,
}

impl HttpFeedPoller {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl FeedSource for HttpFeedPoller {
    async fn fetch_and_parse(&self, request: &FeedRequest) -> Result<ParsedFeed, FeedError> {
        let url = build_feed_url(request)?;
        info!(feed_url = %url, "fetching feed");
        let response = self.fetcher.fetch_bytes(&url).await?;
        let entries = parse_feed(&response.body)?;
        info!(feed_url = %url, entries = entries.len(), "feed parsed");
        Ok(ParsedFeed::select(url, entries, request))
    }
}

/// Reads a saved feed document from disk; used for offline ingestion.
#[derive(Debug, Clone)]
pub struct FileFeedSource {
    path: PathBuf,
}

impl FileFeedSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl FeedSource for FileFeedSource {
    async fn fetch_and_parse(&self, request: &FeedRequest) -> Result<ParsedFeed, FeedError> {
        let body = std::fs::read(&self.path)
            .with_context(|| format!("reading feed file {}", self.path.display()))
            .map_err(FeedError::Source)?;
        let entries = parse_feed(&body)?;
        Ok(ParsedFeed::select(
            self.path.display().to_string(),
            entries,
            request,
        ))
    }
}

/// Adds `category`/`subcategory` query parameters to the feed url, keeping
/// any other parameters already present.
pub fn build_feed_url(request: &FeedRequest) -> Result<String, FeedError> {
    let mut url = Url::parse(request.feed_url.trim()).map_err(|err| FeedError::InvalidUrl {
        url: request.feed_url.clone(),
        reason: err.to_string(),
    })?;
    let overrides = [
        ("category", request.category.as_deref()),
        ("subcategory", request.subcategory.as_deref()),
    ];
    if overrides.iter().all(|(_, value)| value.is_none()) {
        return Ok(url.to_string());
    }

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    for (key, value) in overrides {
        let Some(value) = value else { continue };
        match pairs.iter_mut().find(|(existing, _)| existing == key) {
            Some(pair) => pair.1 = value.to_string(),
            None => pairs.push((key.to_string(), value.to_string())),
        }
    }
    url.query_pairs_mut().clear().extend_pairs(pairs);
    Ok(url.to_string())
}

/// Parses a feed document. The outer error is a document-level failure; each
/// inner result is one item, in feed order.
pub fn parse_feed(bytes: &[u8]) -> Result<Vec<Result<FeedStub, MalformedEntry>>, FeedError> {
    let items = rss::read_items(bytes).map_err(FeedError::Parse)?;
    Ok(items.iter().map(stub_from_item).collect())
}

fn stub_from_item(item: &RawItem) -> Result<FeedStub, MalformedEntry> {
    let index = item.index;
    let link = item
        .first("link")
        .map(str::trim)
        .ok_or(MalformedEntry::MissingLink { index })?;
    let title = item
        .first("title")
        .map(str::trim)
        .ok_or(MalformedEntry::MissingTitle { index })?;
    let id = OrderId::from_project_url(link)
        .or_else(|| item.first("guid").and_then(OrderId::from_project_url))
        .ok_or_else(|| MalformedEntry::UnextractableId {
            index,
            link: link.to_string(),
        })?;

    let (category, subcategory) = item
        .first("category")
        .map(split_category)
        .unwrap_or((None, None));
    let description = item.first("description");
    let published_at = item
        .first("pubDate")
        .or_else(|| item.first("date"))
        .and_then(parse_pub_date);

    let stub = FeedStub {
        id,
        title: title.to_string(),
        project_url: link.to_string(),
        published_at,
        category,
        subcategory,
        summary: description.and_then(clean_summary),
        links: description.map(extract_links).unwrap_or_default(),
        raw: item.to_json(),
    };
    debug!(order_id = %stub.id, "parsed feed item");
    Ok(stub)
}

fn matches_filters(stub: &FeedStub, request: &FeedRequest) -> bool {
    field_matches(stub.category.as_deref(), request.category.as_deref())
        && field_matches(stub.subcategory.as_deref(), request.subcategory.as_deref())
}

/// Entries without the field are kept. Numeric filters are site category
/// codes that only the server understands, so they never filter locally.
fn field_matches(value: Option<&str>, wanted: Option<&str>) -> bool {
    let (Some(value), Some(wanted)) = (value, wanted.map(str::trim)) else {
        return true;
    };
    if wanted.is_empty() || wanted.chars().all(|ch| ch.is_ascii_digit()) {
        return true;
    }
    value.trim().to_lowercase() == wanted.to_lowercase()
}

pub fn split_category(raw: &str) -> (Option<String>, Option<String>) {
    let non_empty = |part: &str| {
        let part = part.trim();
        (!part.is_empty()).then(|| part.to_string())
    };
    match raw.split_once(CATEGORY_SEPARATOR) {
        Some((category, subcategory)) => (non_empty(category), non_empty(subcategory)),
        None => (non_empty(raw), None),
    }
}

pub fn parse_pub_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
}

/// Plain-text rendition of an item description: markup dropped, `<br>` kept
/// as a newline, carriage returns removed. Never truncated.
pub fn clean_summary(html: &str) -> Option<String> {
    let fragment = Html::parse_fragment(html);
    let mut text = String::with_capacity(html.len());
    for node in fragment.root_element().descendants() {
        match node.value() {
            Node::Text(chunk) => text.push_str(chunk),
            Node::Element(element) if element.name() == "br" => text.push('\n'),
            _ => {}
        }
    }
    let text = text.replace('\r', "");
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Absolute http(s) links found in a description, from anchors first and then
/// from the text, normalized and de-duplicated in first-seen order.
pub fn extract_links(html: &str) -> Vec<String> {
    let fragment = Html::parse_fragment(html);
    let mut candidates: Vec<String> = Vec::new();
    if let Ok(anchors) = Selector::parse("a[href]") {
        candidates.extend(
            fragment
                .select(&anchors)
                .filter_map(|anchor| anchor.value().attr("href"))
                .map(str::to_string),
        );
    }
    let text = fragment.root_element().text().collect::<Vec<_>>().join(" ");
    candidates.extend(urls_in_text(&text));

    let mut links = Vec::new();
    for candidate in candidates {
        if let Some(link) = normalize_link(&candidate) {
            if !links.contains(&link) {
                links.push(link);
            }
        }
    }
    links
}

fn urls_in_text(text: &str) -> Vec<String> {
    let mut found = Vec::new();
    for token in text.split(|ch: char| ch.is_whitespace() || matches!(ch, '<' | '>' | '"')) {
        let start = ["https://", "http://"]
            .iter()
            .filter_map(|scheme| token.to_ascii_lowercase().find(scheme))
            .min();
        if let Some(start) = start {
            found.push(token[start..].to_string());
        }
    }
    found
}

/// Lower-cases scheme and host and strips trailing punctuation. Returns
/// `None` for anything that is not an absolute http(s) link.
pub fn normalize_link(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches(LINK_TRAILING_PUNCTUATION);
    let (scheme, rest) = trimmed.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (host, tail) = rest.split_at(host_end);
    if host.is_empty() {
        return None;
    }
    Some(format!("{scheme}://{}{tail}", host.to_lowercase()))
}

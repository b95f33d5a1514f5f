//! Core domain model and field-ownership merge rules for FLOR.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "flor-core";

const MAX_ORDER_ID_LEN: usize = 20;
pub const DEFAULT_PAGE_LIMIT: usize = 50;
pub const MAX_PAGE_LIMIT: usize = 500;

/// External project identifier: the numeric id the listing site assigns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderId(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid order id {0:?}: expected 1-20 ascii digits")]
pub struct InvalidOrderId(pub String);

impl OrderId {
    pub fn parse(raw: &str) -> Result<Self, InvalidOrderId> {
        let trimmed = raw.trim();
        if trimmed.is_empty()
            || trimmed.len() > MAX_ORDER_ID_LEN
            || !trimmed.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(InvalidOrderId(raw.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Extracts the id from a listing URL: the numeric path segment following `projects`.
    pub fn from_project_url(url: &str) -> Option<Self> {
        let path_end = url.find(['?', '#']).unwrap_or(url.len());
        let mut segments = url[..path_end].split('/');
        while let Some(segment) = segments.next() {
            if segment != "projects" {
                continue;
            }
            if let Some(id) = segments.next().and_then(|candidate| Self::parse(candidate).ok()) {
                return Some(id);
            }
        }
        None
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for OrderId {
    type Error = InvalidOrderId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<OrderId> for String {
    fn from(value: OrderId) -> Self {
        value.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Channel that produced a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Feed,
    Enrichment,
}

/// Stored value plus the channel that last wrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub origin: Option<Origin>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            origin: None,
        }
    }

    pub fn with_value(value: T, origin: Origin) -> Self {
        Self {
            value: Some(value),
            origin: Some(origin),
        }
    }

    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }
}

impl<T: PartialEq> Field<T> {
    /// Applies a write from `writer` to a field owned by `owner`.
    ///
    /// The owner's writes always land. A non-owner may only fill the field while
    /// the owner has never set it. Absent values are not writes. Returns whether
    /// the stored value or origin changed.
    pub fn merge(&mut self, incoming: Option<T>, writer: Origin, owner: Origin) -> bool {
        let Some(value) = incoming else {
            return false;
        };
        if writer != owner && self.origin == Some(owner) {
            return false;
        }
        if self.value.as_ref() == Some(&value) && self.origin == Some(writer) {
            return false;
        }
        self.value = Some(value);
        self.origin = Some(writer);
        true
    }
}

/// Attachment announced by the enrichment channel (URL + display name), bytes not included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub url: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Enriched,
    EnrichedWithAttachments,
}

/// Which channels have sighted an order so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileState {
    Discovered,
    EnrichedOnly,
    Merged,
}

/// Canonical merged record for one project listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    #[serde(default)]
    pub title: Field<String>,
    #[serde(default)]
    pub project_url: Field<String>,
    #[serde(default)]
    pub category: Field<String>,
    #[serde(default)]
    pub subcategory: Field<String>,
    #[serde(default)]
    pub published_at: Field<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Field<String>,
    #[serde(default)]
    pub feed_raw: Field<JsonValue>,
    #[serde(default)]
    pub scraped_title: Field<String>,
    #[serde(default)]
    pub description: Field<String>,
    #[serde(default)]
    pub budget: Field<String>,
    #[serde(default)]
    pub links: Field<Vec<String>>,
    #[serde(default)]
    pub files: Field<Vec<FileRef>>,
    #[serde(default)]
    pub enrichment_raw: JsonValue,
    #[serde(default)]
    pub seen_by_feed: bool,
    #[serde(default)]
    pub seen_by_enrichment: bool,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new(id: OrderId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: Field::empty(),
            project_url: Field::empty(),
            category: Field::empty(),
            subcategory: Field::empty(),
            published_at: Field::empty(),
            summary: Field::empty(),
            feed_raw: Field::empty(),
            scraped_title: Field::empty(),
            description: Field::empty(),
            budget: Field::empty(),
            links: Field::empty(),
            files: Field::empty(),
            enrichment_raw: JsonValue::Null,
            seen_by_feed: false,
            seen_by_enrichment: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Merges the fields present in `patch` under the ownership rules and marks
    /// the patch's channel as having sighted the order. Returns whether anything
    /// observable changed; timestamps are left to the caller.
    pub fn apply(&mut self, patch: &OrderPatch) -> bool {
        use Origin::{Enrichment, Feed};
        let w = patch.origin;
        let mut changed = false;

        changed |= self.title.merge(patch.title.clone(), w, Feed);
        changed |= self.project_url.merge(patch.project_url.clone(), w, Feed);
        changed |= self.category.merge(patch.category.clone(), w, Feed);
        changed |= self.subcategory.merge(patch.subcategory.clone(), w, Feed);
        changed |= self.published_at.merge(patch.published_at, w, Feed);
        changed |= self.summary.merge(patch.summary.clone(), w, Feed);
        changed |= self.feed_raw.merge(patch.feed_raw.clone(), w, Feed);

        changed |= self.scraped_title.merge(patch.scraped_title.clone(), w, Enrichment);
        changed |= self.description.merge(patch.description.clone(), w, Enrichment);
        changed |= self.budget.merge(patch.budget.clone(), w, Enrichment);
        changed |= self.links.merge(patch.links.clone(), w, Enrichment);
        changed |= self.files.merge(patch.files.clone(), w, Enrichment);

        if w == Enrichment {
            if let Some(raw) = &patch.enrichment_raw {
                let before = self.enrichment_raw.clone();
                deep_merge_json(&mut self.enrichment_raw, raw);
                changed |= before != self.enrichment_raw;
            }
        }

        let seen = match w {
            Feed => &mut self.seen_by_feed,
            Enrichment => &mut self.seen_by_enrichment,
        };
        if !*seen {
            *seen = true;
            changed = true;
        }
        changed
    }

    pub fn state(&self) -> ReconcileState {
        match (self.seen_by_feed, self.seen_by_enrichment) {
            (true, true) => ReconcileState::Merged,
            (true, false) => ReconcileState::Discovered,
            _ => ReconcileState::EnrichedOnly,
        }
    }

    pub fn enrichment_status(&self, attachment_count: usize) -> EnrichmentStatus {
        if attachment_count > 0 {
            EnrichmentStatus::EnrichedWithAttachments
        } else if self.seen_by_enrichment {
            EnrichmentStatus::Enriched
        } else {
            EnrichmentStatus::Pending
        }
    }

    /// Record with bookkeeping timestamps zeroed, for convergence comparisons.
    pub fn without_timestamps(&self) -> Self {
        let mut copy = self.clone();
        copy.created_at = DateTime::<Utc>::default();
        copy.updated_at = DateTime::<Utc>::default();
        copy
    }
}

/// Explicit field-presence set: `Some` fields are written, `None` fields are left untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPatch {
    pub origin: Origin,
    pub title: Option<String>,
    pub project_url: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub feed_raw: Option<JsonValue>,
    pub scraped_title: Option<String>,
    pub description: Option<String>,
    pub budget: Option<String>,
    pub links: Option<Vec<String>>,
    pub files: Option<Vec<FileRef>>,
    pub enrichment_raw: Option<JsonValue>,
}

impl OrderPatch {
    pub fn empty(origin: Origin) -> Self {
        Self {
            origin,
            title: None,
            project_url: None,
            category: None,
            subcategory: None,
            published_at: None,
            summary: None,
            feed_raw: None,
            scraped_title: None,
            description: None,
            budget: None,
            links: None,
            files: None,
            enrichment_raw: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::empty(self.origin)
    }
}

/// Recursively merges JSON objects; any other value in `incoming` replaces the base.
pub fn deep_merge_json(base: &mut JsonValue, incoming: &JsonValue) {
    match (base, incoming) {
        (JsonValue::Object(base_map), JsonValue::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge_json(existing, value)
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, incoming) => *base = incoming.clone(),
    }
}

/// Minimal order data extracted from one feed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedStub {
    pub id: OrderId,
    pub title: String,
    pub project_url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub raw: JsonValue,
}

impl FeedStub {
    pub fn to_patch(&self) -> OrderPatch {
        OrderPatch {
            title: Some(self.title.clone()),
            project_url: Some(self.project_url.clone()),
            category: self.category.clone(),
            subcategory: self.subcategory.clone(),
            published_at: self.published_at,
            summary: self.summary.clone(),
            feed_raw: (!self.raw.is_null()).then(|| self.raw.clone()),
            links: (!self.links.is_empty()).then(|| self.links.clone()),
            ..OrderPatch::empty(Origin::Feed)
        }
    }
}

/// One file carried by an enrichment event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AttachmentUpload {
    pub original_url: Option<String>,
    pub page_url: Option<String>,
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl AttachmentUpload {
    /// Identity of the file within its order. Without an original URL the key
    /// is the percent-encoded declared basename, so distinct non-ASCII names
    /// never share a key.
    pub fn source_key(&self) -> String {
        match self.original_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => {
                let name = self.filename.trim();
                let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
                format!("upload://{}", urlencoding::encode(base))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error(transparent)]
    InvalidId(#[from] InvalidOrderId),
    #[error("payload carries no order id and none could be derived from its urls")]
    MissingId,
    #[error("attachment #{index} has an empty filename")]
    EmptyFilename { index: usize },
    #[error("payload carries neither metadata nor attachments")]
    Empty,
}

/// Metadata and/or files submitted out-of-band for one order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnrichmentPayload {
    pub id: Option<String>,
    pub url: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub budget: Option<String>,
    pub links: Option<Vec<String>>,
    pub files: Option<Vec<FileRef>>,
    pub raw: Option<JsonValue>,
    pub attachments: Vec<AttachmentUpload>,
}

impl EnrichmentPayload {
    /// Resolves the target order and checks the payload shape. Nothing is written
    /// for a payload that fails here.
    pub fn validate(&self) -> Result<OrderId, PayloadError> {
        let id = self.resolve_order_id()?;
        if let Some(index) = self
            .attachments
            .iter()
            .position(|a| a.filename.trim().is_empty())
        {
            return Err(PayloadError::EmptyFilename { index });
        }
        if self.to_patch().is_empty() && self.attachments.is_empty() {
            return Err(PayloadError::Empty);
        }
        Ok(id)
    }

    fn resolve_order_id(&self) -> Result<OrderId, PayloadError> {
        if let Some(raw) = self.id.as_deref().filter(|raw| !raw.trim().is_empty()) {
            return Ok(OrderId::parse(raw)?);
        }
        let attachment_urls = self
            .attachments
            .iter()
            .flat_map(|a| [a.page_url.as_deref(), a.original_url.as_deref()]);
        std::iter::once(self.url.as_deref())
            .chain(attachment_urls)
            .flatten()
            .find_map(OrderId::from_project_url)
            .ok_or(PayloadError::MissingId)
    }

    pub fn to_patch(&self) -> OrderPatch {
        let title = non_empty(self.title.as_deref());
        OrderPatch {
            scraped_title: title.clone(),
            title,
            project_url: non_empty(self.url.as_deref()),
            description: non_empty(self.description.as_deref()),
            budget: non_empty(self.budget.as_deref()),
            links: self.links.clone(),
            files: self.files.clone(),
            enrichment_raw: self.raw.clone().filter(|raw| !raw.is_null()),
            ..OrderPatch::empty(Origin::Enrichment)
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Reduces a client-supplied filename to a safe basename of `[A-Za-z0-9._-]`.
pub fn sanitize_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let mut out = String::with_capacity(base.len());
    let mut in_run = false;
    for ch in base.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
            out.push(ch);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    if out.chars().all(|c| c == '.') {
        "file".to_string()
    } else {
        out
    }
}

/// Stored file owned by one order, keyed by `(order_id, original_url)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub order_id: OrderId,
    pub original_url: String,
    pub page_url: Option<String>,
    pub declared_filename: String,
    pub stored_filename: String,
    pub storage_path: String,
    pub size_bytes: u64,
    pub content_type: Option<String>,
    pub sha256: String,
    pub version: u32,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AttachmentWrite {
    Created,
    Unchanged,
    Replaced { previous_version: u32 },
}

impl Attachment {
    /// Decides how `incoming` lands against the record stored under the same key:
    /// identical bytes are a no-op, differing bytes become the next version.
    pub fn reconcile(existing: Option<&Attachment>, mut incoming: Attachment) -> (Attachment, AttachmentWrite) {
        match existing {
            None => {
                incoming.version = 1;
                (incoming, AttachmentWrite::Created)
            }
            Some(current) if current.sha256 == incoming.sha256 => {
                (current.clone(), AttachmentWrite::Unchanged)
            }
            Some(current) => {
                incoming.version = current.version + 1;
                let previous_version = current.version;
                (incoming, AttachmentWrite::Replaced { previous_version })
            }
        }
    }
}

/// Read-side view: the order plus its attachments and derived states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedOrder {
    #[serde(flatten)]
    pub order: Order,
    pub state: ReconcileState,
    pub enrichment_status: EnrichmentStatus,
    pub attachments: Vec<Attachment>,
}

impl MergedOrder {
    pub fn assemble(order: Order, attachments: Vec<Attachment>) -> Self {
        Self {
            state: order.state(),
            enrichment_status: order.enrichment_status(attachments.len()),
            order,
            attachments,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderFilter {
    pub q: Option<String>,
    pub has_attachments: Option<bool>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order, attachment_count: usize) -> bool {
        if let Some(wanted) = self.has_attachments {
            if wanted != (attachment_count > 0) {
                return false;
            }
        }
        match self.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
            None => true,
            Some(q) => {
                let needle = q.to_lowercase();
                [order.title.value(), order.summary.value()]
                    .into_iter()
                    .flatten()
                    .any(|text| text.to_lowercase().contains(&needle))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<usize>, offset: Option<usize>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn id(raw: &str) -> OrderId {
        OrderId::parse(raw).unwrap()
    }

    fn stub() -> FeedStub {
        FeedStub {
            id: id("5468413"),
            title: "3D modelling of a bracket".into(),
            project_url: "https://www.fl.ru/projects/5468413/3d-modelirovanie.html".into(),
            published_at: Some(ts(9)),
            category: Some("3D".into()),
            subcategory: Some("Modelling".into()),
            summary: Some("Need a model, see https://example.com/brief".into()),
            links: vec!["https://example.com/brief".into()],
            raw: json!({"guid": "5468413"}),
        }
    }

    fn enrichment() -> EnrichmentPayload {
        EnrichmentPayload {
            id: Some("5468413".into()),
            url: Some("https://www.fl.ru/projects/5468413/".into()),
            title: Some("3D моделирование".into()),
            description: Some("Full scraped description".into()),
            budget: Some("по договоренности".into()),
            links: Some(vec!["https://example.com".into()]),
            files: Some(vec![FileRef {
                url: "https://st.fl.ru/files/tz.pdf".into(),
                name: Some("ТЗ.pdf".into()),
            }]),
            raw: Some(json!({"id": "5468413", "nested": {"a": 1}})),
            attachments: vec![],
        }
    }

    #[test]
    fn order_id_rejects_non_digits() {
        assert!(OrderId::parse("5468413").is_ok());
        assert_eq!(OrderId::parse(" 42 ").unwrap().as_str(), "42");
        assert!(OrderId::parse("").is_err());
        assert!(OrderId::parse("12a").is_err());
        assert!(OrderId::parse("123456789012345678901").is_err());
    }

    #[test]
    fn order_id_extracts_from_project_url() {
        assert_eq!(
            OrderId::from_project_url("https://www.fl.ru/projects/123456/test.html"),
            Some(id("123456"))
        );
        assert_eq!(
            OrderId::from_project_url("https://www.fl.ru/projects/77?utm=rss"),
            Some(id("77"))
        );
        assert_eq!(OrderId::from_project_url("https://www.fl.ru/users/someone/"), None);
        assert_eq!(OrderId::from_project_url("https://www.fl.ru/projects/abc/"), None);
    }

    #[test]
    fn owner_write_wins_and_non_owner_only_fills() {
        let mut field = Field::empty();
        assert!(field.merge(Some("scraped".to_string()), Origin::Enrichment, Origin::Feed));
        assert!(field.merge(Some("feed".to_string()), Origin::Feed, Origin::Feed));
        assert!(!field.merge(Some("scraped again".to_string()), Origin::Enrichment, Origin::Feed));
        assert_eq!(field.value().map(String::as_str), Some("feed"));
        assert_eq!(field.origin, Some(Origin::Feed));
        assert!(!field.merge(None, Origin::Feed, Origin::Feed));
    }

    #[test]
    fn feed_and_enrichment_commute() {
        let feed_patch = stub().to_patch();
        let enrichment_patch = enrichment().to_patch();

        let mut feed_first = Order::new(id("5468413"), ts(10));
        feed_first.apply(&feed_patch);
        feed_first.apply(&enrichment_patch);

        let mut enrichment_first = Order::new(id("5468413"), ts(11));
        enrichment_first.apply(&enrichment_patch);
        enrichment_first.apply(&feed_patch);

        assert_eq!(feed_first.without_timestamps(), enrichment_first.without_timestamps());
        assert_eq!(feed_first.state(), ReconcileState::Merged);
        assert_eq!(feed_first.title.value().unwrap(), "3D modelling of a bracket");
        assert_eq!(feed_first.scraped_title.value().unwrap(), "3D моделирование");
        assert_eq!(
            feed_first.links.value().unwrap(),
            &vec!["https://example.com".to_string()]
        );
        assert_eq!(feed_first.budget.value().unwrap(), "по договоренности");
    }

    #[test]
    fn replaying_a_patch_is_a_no_op() {
        let mut order = Order::new(id("5468413"), ts(10));
        assert!(order.apply(&stub().to_patch()));
        assert!(order.apply(&enrichment().to_patch()));
        let snapshot = order.clone();
        assert!(!order.apply(&stub().to_patch()));
        assert!(!order.apply(&enrichment().to_patch()));
        assert_eq!(order, snapshot);
    }

    #[test]
    fn enrichment_never_touches_feed_owned_fields_once_set() {
        let mut order = Order::new(id("5468413"), ts(10));
        order.apply(&stub().to_patch());
        let mut hostile = enrichment().to_patch();
        hostile.category = Some("Spam".into());
        hostile.published_at = Some(ts(23));
        hostile.project_url = Some("https://elsewhere.example/".into());
        order.apply(&hostile);
        assert_eq!(order.title.value().unwrap(), "3D modelling of a bracket");
        assert_eq!(order.category.value().unwrap(), "3D");
        assert_eq!(order.published_at.value(), Some(&ts(9)));
        assert_eq!(
            order.project_url.value().unwrap(),
            "https://www.fl.ru/projects/5468413/3d-modelirovanie.html"
        );
    }

    #[test]
    fn feed_never_overwrites_enrichment_owned_fields() {
        let mut order = Order::new(id("5468413"), ts(10));
        order.apply(&enrichment().to_patch());
        let mut later = stub().to_patch();
        later.links = Some(vec!["https://feed.example/other".into()]);
        later.budget = Some("1000 rub".into());
        later.description = Some("feed text".into());
        order.apply(&later);
        assert_eq!(order.links.value().unwrap(), &vec!["https://example.com".to_string()]);
        assert_eq!(order.budget.value().unwrap(), "по договоренности");
        assert_eq!(order.description.value().unwrap(), "Full scraped description");
    }

    #[test]
    fn feed_links_fill_until_enrichment_supplies_its_own() {
        let mut order = Order::new(id("5468413"), ts(10));
        order.apply(&stub().to_patch());
        assert_eq!(order.links.origin, Some(Origin::Feed));
        order.apply(&enrichment().to_patch());
        assert_eq!(order.links.origin, Some(Origin::Enrichment));
        assert_eq!(order.links.value().unwrap(), &vec!["https://example.com".to_string()]);
    }

    #[test]
    fn state_and_status_follow_sightings() {
        let mut order = Order::new(id("1"), ts(10));
        order.apply(&OrderPatch::empty(Origin::Enrichment));
        assert_eq!(order.state(), ReconcileState::EnrichedOnly);
        assert_eq!(order.enrichment_status(0), EnrichmentStatus::Enriched);
        assert_eq!(order.enrichment_status(2), EnrichmentStatus::EnrichedWithAttachments);

        let mut feed_only = Order::new(id("2"), ts(10));
        feed_only.apply(&stub().to_patch());
        assert_eq!(feed_only.state(), ReconcileState::Discovered);
        assert_eq!(feed_only.enrichment_status(0), EnrichmentStatus::Pending);
    }

    #[test]
    fn deep_merge_keeps_untouched_keys() {
        let mut base = json!({"a": 1, "nested": {"x": 1, "y": 2}});
        deep_merge_json(&mut base, &json!({"nested": {"y": 3}, "b": [1]}));
        assert_eq!(base, json!({"a": 1, "b": [1], "nested": {"x": 1, "y": 3}}));

        let mut empty = JsonValue::Null;
        deep_merge_json(&mut empty, &json!({"k": "v"}));
        assert_eq!(empty, json!({"k": "v"}));
    }

    #[test]
    fn payload_validation_resolves_ids() {
        assert_eq!(enrichment().validate().unwrap(), id("5468413"));

        let mut bad = enrichment();
        bad.id = Some("54-68".into());
        assert!(matches!(bad.validate(), Err(PayloadError::InvalidId(_))));

        let derived = EnrichmentPayload {
            url: Some("https://www.fl.ru/projects/42/x.html".into()),
            budget: Some("100".into()),
            ..Default::default()
        };
        assert_eq!(derived.validate().unwrap(), id("42"));

        let from_attachment = EnrichmentPayload {
            attachments: vec![AttachmentUpload {
                page_url: Some("https://www.fl.ru/projects/99/".into()),
                filename: "a.txt".into(),
                bytes: b"x".to_vec(),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert_eq!(from_attachment.validate().unwrap(), id("99"));

        let nothing = EnrichmentPayload {
            id: Some("7".into()),
            ..Default::default()
        };
        assert_eq!(nothing.validate(), Err(PayloadError::Empty));
        assert_eq!(EnrichmentPayload::default().validate(), Err(PayloadError::MissingId));
    }

    #[test]
    fn sanitize_filename_strips_paths_and_unsafe_chars() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("ТЗ.pdf"), "_.pdf");
        assert_eq!(sanitize_filename("my report (final).docx"), "my_report_final_.docx");
        assert_eq!(sanitize_filename(".."), "file");
        assert_eq!(sanitize_filename(""), "file");
    }

    #[test]
    fn source_key_keeps_non_ascii_names_distinct() {
        let upload = |filename: &str| AttachmentUpload {
            filename: filename.into(),
            ..AttachmentUpload::default()
        };
        let sketch = upload("Эскиз.png").source_key();
        let mockup = upload("Макет.png").source_key();
        assert_ne!(sketch, mockup);
        assert_eq!(sketch, "upload://%D0%AD%D1%81%D0%BA%D0%B8%D0%B7.png");
        assert_eq!(upload("dir/brief v2.pdf").source_key(), "upload://brief%20v2.pdf");
        assert_eq!(
            AttachmentUpload {
                original_url: Some(" https://st.fl.ru/a.pdf ".into()),
                ..upload("Эскиз.png")
            }
            .source_key(),
            "https://st.fl.ru/a.pdf"
        );
    }

    #[test]
    fn attachment_reconcile_versions_on_new_content() {
        let base = Attachment {
            order_id: id("1"),
            original_url: "https://st.fl.ru/a.pdf".into(),
            page_url: None,
            declared_filename: "a.pdf".into(),
            stored_filename: "a.pdf".into(),
            storage_path: "project_1/a.pdf".into(),
            size_bytes: 3,
            content_type: None,
            sha256: "aaa".into(),
            version: 0,
            ingested_at: ts(1),
        };
        let (first, write) = Attachment::reconcile(None, base.clone());
        assert_eq!(write, AttachmentWrite::Created);
        assert_eq!(first.version, 1);

        let (same, write) = Attachment::reconcile(Some(&first), base.clone());
        assert_eq!(write, AttachmentWrite::Unchanged);
        assert_eq!(same, first);

        let changed = Attachment {
            sha256: "bbb".into(),
            ..base
        };
        let (second, write) = Attachment::reconcile(Some(&first), changed);
        assert_eq!(write, AttachmentWrite::Replaced { previous_version: 1 });
        assert_eq!(second.version, 2);
    }

    #[test]
    fn order_deserializes_with_missing_newer_fields() {
        let stored = json!({"id": "10", "title": {"value": "t", "origin": "feed"}, "seen_by_feed": true});
        let order: Order = serde_json::from_value(stored).unwrap();
        assert_eq!(order.title.value().unwrap(), "t");
        assert!(order.files.value().is_none());
        assert_eq!(order.state(), ReconcileState::Discovered);
    }

    #[test]
    fn filter_matches_title_and_summary() {
        let mut order = Order::new(id("1"), ts(1));
        order.apply(&stub().to_patch());
        let filter = OrderFilter {
            q: Some("BRACKET".into()),
            has_attachments: None,
        };
        assert!(filter.matches(&order, 0));
        let with_files = OrderFilter {
            q: None,
            has_attachments: Some(true),
        };
        assert!(!with_files.matches(&order, 0));
        assert!(with_files.matches(&order, 1));
        assert_eq!(Pagination::new(Some(0), None).limit, 1);
        assert_eq!(Pagination::new(Some(10_000), Some(5)), Pagination { limit: 500, offset: 5 });
    }
}

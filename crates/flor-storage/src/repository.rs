//! Durable keyed storage for canonical orders and their attachment records.
//!
//! Every write is a read-merge-write of one order performed atomically per id:
//! the in-memory backend holds its lock for the merge, the PostgreSQL backend
//! merges inside a transaction holding the order row lock.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flor_core::{Attachment, AttachmentWrite, Order, OrderFilter, OrderId, OrderPatch, Pagination};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("order {0} not found")]
    NotFound(OrderId),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOutcome {
    pub order: Order,
    pub created: bool,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentOutcome {
    pub attachment: Attachment,
    pub write: AttachmentWrite,
}

#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Creates the order if unseen, then merges only the fields present in `patch`.
    async fn upsert_partial(
        &self,
        id: &OrderId,
        patch: &OrderPatch,
    ) -> Result<UpsertOutcome, RepositoryError>;

    async fn get(&self, id: &OrderId) -> Result<Order, RepositoryError>;

    /// Orders matching `filter`, most recently updated first.
    async fn list(
        &self,
        filter: &OrderFilter,
        page: Pagination,
    ) -> Result<Vec<Order>, RepositoryError>;

    /// Upserts the attachment keyed by `(order_id, original_url)` using
    /// [`Attachment::reconcile`]. The owning order must exist.
    async fn record_attachment(
        &self,
        attachment: Attachment,
    ) -> Result<AttachmentOutcome, RepositoryError>;

    /// Attachments of one order, oldest ingestion first.
    async fn attachments_for(&self, id: &OrderId) -> Result<Vec<Attachment>, RepositoryError>;
}

fn merge_into(order: &mut Order, patch: &OrderPatch, now: DateTime<Utc>) -> bool {
    let changed = order.apply(patch);
    if changed {
        order.updated_at = now;
    }
    changed
}

fn sort_attachments(attachments: &mut [Attachment]) {
    attachments.sort_by(|a, b| {
        a.ingested_at
            .cmp(&b.ingested_at)
            .then_with(|| a.original_url.cmp(&b.original_url))
    });
}

#[derive(Debug, Default)]
struct MemoryState {
    orders: HashMap<OrderId, Order>,
    attachments: HashMap<OrderId, HashMap<String, Attachment>>,
}

/// Process-local repository; used by tests and when no database is configured.
#[derive(Debug, Default)]
pub struct MemoryOrderRepository {
    state: RwLock<MemoryState>,
}

impl MemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderRepository for MemoryOrderRepository {
    async fn upsert_partial(
        &self,
        id: &OrderId,
        patch: &OrderPatch,
    ) -> Result<UpsertOutcome, RepositoryError> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let mut created = false;
        let order = state.orders.entry(id.clone()).or_insert_with(|| {
            created = true;
            Order::new(id.clone(), now)
        });
        let changed = merge_into(order, patch, now);
        debug!(order_id = %id, created, changed, "memory upsert");
        Ok(UpsertOutcome {
            order: order.clone(),
            created,
            changed,
        })
    }

    async fn get(&self, id: &OrderId) -> Result<Order, RepositoryError> {
        let state = self.state.read().await;
        state
            .orders
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))
    }

    async fn list(
        &self,
        filter: &OrderFilter,
        page: Pagination,
    ) -> Result<Vec<Order>, RepositoryError> {
        let state = self.state.read().await;
        let mut matching = state
            .orders
            .values()
            .filter(|order| {
                let count = state.attachments.get(&order.id).map_or(0, HashMap::len);
                filter.matches(order, count)
            })
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn record_attachment(
        &self,
        attachment: Attachment,
    ) -> Result<AttachmentOutcome, RepositoryError> {
        let mut state = self.state.write().await;
        if !state.orders.contains_key(&attachment.order_id) {
            return Err(RepositoryError::NotFound(attachment.order_id));
        }
        let by_url = state
            .attachments
            .entry(attachment.order_id.clone())
            .or_default();
        let key = attachment.original_url.clone();
        let (stored, write) = Attachment::reconcile(by_url.get(&key), attachment);
        if write != AttachmentWrite::Unchanged {
            by_url.insert(key, stored.clone());
        }
        Ok(AttachmentOutcome {
            attachment: stored,
            write,
        })
    }

    async fn attachments_for(&self, id: &OrderId) -> Result<Vec<Attachment>, RepositoryError> {
        let state = self.state.read().await;
        let mut attachments = state
            .attachments
            .get(id)
            .map(|by_url| by_url.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        sort_attachments(&mut attachments);
        Ok(attachments)
    }
}

/// PostgreSQL repository. The order record is stored as JSONB so new fields
/// deserialize with defaults and never require re-ingestion.
#[derive(Debug, Clone)]
pub struct PgOrderRepository {
    pool: PgPool,
}

impl PgOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self::new(pool))
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")
    }
}

fn like_pattern(q: &str) -> String {
    let escaped = q
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{escaped}%")
}

fn attachment_from_row(row: &PgRow) -> anyhow::Result<Attachment> {
    let order_id: String = row.try_get("order_external_id")?;
    let size_bytes: i64 = row.try_get("size_bytes")?;
    let version: i32 = row.try_get("version")?;
    Ok(Attachment {
        order_id: OrderId::parse(&order_id)?,
        original_url: row.try_get("original_url")?,
        page_url: row.try_get("page_url")?,
        declared_filename: row.try_get("declared_filename")?,
        stored_filename: row.try_get("stored_filename")?,
        storage_path: row.try_get("storage_path")?,
        size_bytes: size_bytes.max(0) as u64,
        content_type: row.try_get("content_type")?,
        sha256: row.try_get("sha256")?,
        version: version.max(0) as u32,
        ingested_at: row.try_get("ingested_at")?,
    })
}

const ATTACHMENT_COLUMNS: &str = "order_external_id, original_url, page_url, declared_filename, \
     stored_filename, storage_path, size_bytes, content_type, sha256, version, ingested_at";

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn upsert_partial(
        &self,
        id: &OrderId,
        patch: &OrderPatch,
    ) -> Result<UpsertOutcome, RepositoryError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("beginning upsert")?;

        let created = sqlx::query(
            r#"
            INSERT INTO orders (external_id, data_json, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(id.as_str())
        .bind(Json(Order::new(id.clone(), now)))
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("inserting order stub")?
        .rows_affected()
            == 1;

        let row = sqlx::query("SELECT data_json FROM orders WHERE external_id = $1 FOR UPDATE")
            .bind(id.as_str())
            .fetch_one(&mut *tx)
            .await
            .context("locking order row")?;
        let Json(mut order): Json<Order> = row.try_get("data_json").context("decoding order")?;

        let changed = merge_into(&mut order, patch, now);
        if changed {
            sqlx::query(
                r#"
                UPDATE orders
                   SET title = $2,
                       summary = $3,
                       data_json = $4,
                       updated_at = $5
                 WHERE external_id = $1
                "#,
            )
            .bind(id.as_str())
            .bind(order.title.value.clone())
            .bind(order.summary.value.clone())
            .bind(Json(&order))
            .bind(order.updated_at)
            .execute(&mut *tx)
            .await
            .context("updating order")?;
        }
        tx.commit().await.context("committing upsert")?;

        debug!(order_id = %id, created, changed, "postgres upsert");
        Ok(UpsertOutcome {
            order,
            created,
            changed,
        })
    }

    async fn get(&self, id: &OrderId) -> Result<Order, RepositoryError> {
        let row = sqlx::query("SELECT data_json FROM orders WHERE external_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .context("loading order")?
            .ok_or_else(|| RepositoryError::NotFound(id.clone()))?;
        let Json(order): Json<Order> = row.try_get("data_json").context("decoding order")?;
        Ok(order)
    }

    async fn list(
        &self,
        filter: &OrderFilter,
        page: Pagination,
    ) -> Result<Vec<Order>, RepositoryError> {
        let pattern = filter
            .q
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(like_pattern);
        let rows = sqlx::query(
            r#"
            SELECT o.data_json
              FROM orders o
             WHERE ($1::text IS NULL OR o.title ILIKE $1 OR o.summary ILIKE $1)
               AND ($2::boolean IS NULL
                    OR EXISTS (SELECT 1 FROM attachments a
                                WHERE a.order_external_id = o.external_id) = $2)
             ORDER BY o.updated_at DESC, o.external_id
             LIMIT $3 OFFSET $4
            "#,
        )
        .bind(pattern)
        .bind(filter.has_attachments)
        .bind(page.limit as i64)
        .bind(page.offset as i64)
        .fetch_all(&self.pool)
        .await
        .context("listing orders")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(order): Json<Order> = row.try_get("data_json").context("decoding order")?;
            out.push(order);
        }
        Ok(out)
    }

    async fn record_attachment(
        &self,
        attachment: Attachment,
    ) -> Result<AttachmentOutcome, RepositoryError> {
        let mut tx = self.pool.begin().await.context("beginning attachment write")?;

        let order_exists = sqlx::query("SELECT 1 FROM orders WHERE external_id = $1 FOR UPDATE")
            .bind(attachment.order_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context("locking order row")?
            .is_some();
        if !order_exists {
            return Err(RepositoryError::NotFound(attachment.order_id));
        }

        let existing = sqlx::query(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments \
              WHERE order_external_id = $1 AND original_url = $2"
        ))
        .bind(attachment.order_id.as_str())
        .bind(&attachment.original_url)
        .fetch_optional(&mut *tx)
        .await
        .context("loading attachment")?
        .map(|row| attachment_from_row(&row))
        .transpose()?;

        let (stored, write) = Attachment::reconcile(existing.as_ref(), attachment);
        if write != AttachmentWrite::Unchanged {
            sqlx::query(&format!(
                "INSERT INTO attachments ({ATTACHMENT_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                 ON CONFLICT (order_external_id, original_url) DO UPDATE SET \
                   page_url = EXCLUDED.page_url, \
                   declared_filename = EXCLUDED.declared_filename, \
                   stored_filename = EXCLUDED.stored_filename, \
                   storage_path = EXCLUDED.storage_path, \
                   size_bytes = EXCLUDED.size_bytes, \
                   content_type = EXCLUDED.content_type, \
                   sha256 = EXCLUDED.sha256, \
                   version = EXCLUDED.version, \
                   ingested_at = EXCLUDED.ingested_at"
            ))
            .bind(stored.order_id.as_str())
            .bind(&stored.original_url)
            .bind(&stored.page_url)
            .bind(&stored.declared_filename)
            .bind(&stored.stored_filename)
            .bind(&stored.storage_path)
            .bind(stored.size_bytes as i64)
            .bind(&stored.content_type)
            .bind(&stored.sha256)
            .bind(stored.version as i32)
            .bind(stored.ingested_at)
            .execute(&mut *tx)
            .await
            .context("writing attachment")?;
        }
        tx.commit().await.context("committing attachment write")?;

        Ok(AttachmentOutcome {
            attachment: stored,
            write,
        })
    }

    async fn attachments_for(&self, id: &OrderId) -> Result<Vec<Attachment>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {ATTACHMENT_COLUMNS} FROM attachments \
              WHERE order_external_id = $1 \
              ORDER BY ingested_at, original_url"
        ))
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await
        .context("listing attachments")?;
        let mut out = rows
            .iter()
            .map(attachment_from_row)
            .collect::<anyhow::Result<Vec<_>>>()?;
        sort_attachments(&mut out);
        Ok(out)
    }
}

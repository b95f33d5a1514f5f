use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::RawQuery;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use flor_core::{
    AttachmentUpload, AttachmentWrite, EnrichmentPayload, EnrichmentStatus, FeedStub, FileRef,
    MergedOrder, OrderFilter, Pagination, PayloadError, ReconcileState,
};
use flor_feed::{parse_feed, FeedError, FileFeedSource, HttpFeedPoller};
use flor_storage::repository::MemoryOrderRepository;
use flor_storage::{AttachmentStore, FetchError, HttpClientConfig, HttpFetcher};
use flor_sync::{
    FeedIngestRequest, FileRejection, FileStatus, ReconcileError, Reconciler, ReconcilerConfig,
};
use tempfile::TempDir;

const ORDER: &str = "5468413";

fn fixture_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/feeds/fl_all.xml")
}

fn reconciler(uploads: &TempDir, max_upload_bytes: u64) -> Reconciler {
    Reconciler::new(
        Arc::new(MemoryOrderRepository::new()),
        AttachmentStore::new(uploads.path()),
        Arc::new(FileFeedSource::new(fixture_path())),
        ReconcilerConfig {
            max_upload_bytes,
            ..ReconcilerConfig::default()
        },
    )
}

fn fixture_stub(id: &str) -> FeedStub {
    let body = std::fs::read(fixture_path()).unwrap();
    parse_feed(&body)
        .unwrap()
        .into_iter()
        .flatten()
        .find(|stub| stub.id.as_str() == id)
        .unwrap()
}

fn tz_upload() -> AttachmentUpload {
    AttachmentUpload {
        original_url: Some("https://st.fl.ru/projects/5468413/tz.pdf".into()),
        page_url: Some("https://www.fl.ru/projects/5468413/".into()),
        filename: "ТЗ.pdf".into(),
        content_type: Some("application/pdf".into()),
        bytes: b"%PDF-1.4 technical assignment".to_vec(),
    }
}

fn enrichment() -> EnrichmentPayload {
    EnrichmentPayload {
        id: Some(ORDER.into()),
        title: Some("3D моделирование".into()),
        links: Some(vec!["https://example.com".into()]),
        files: Some(vec![FileRef {
            url: "https://st.fl.ru/projects/5468413/tz.pdf".into(),
            name: Some("ТЗ.pdf".into()),
        }]),
        budget: Some("по договоренности".into()),
        attachments: vec![tz_upload()],
        ..EnrichmentPayload::default()
    }
}

fn comparable(merged: &MergedOrder) -> (flor_core::Order, Vec<(String, String, String, u32)>) {
    let attachments = merged
        .attachments
        .iter()
        .map(|a| (a.original_url.clone(), a.storage_path.clone(), a.sha256.clone(), a.version))
        .collect();
    (merged.order.without_timestamps(), attachments)
}

#[tokio::test]
async fn enrichment_then_feed_returns_both_sides() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 1024);

    let outcome = engine.apply_enrichment(enrichment()).await.unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.stored_count(), 1);
    let early = engine.get_merged_order(ORDER).await.unwrap();
    assert_eq!(early.state, ReconcileState::EnrichedOnly);
    assert_eq!(early.order.title.value().unwrap(), "3D моделирование");

    engine.apply_feed_stub(&fixture_stub(ORDER)).await.unwrap();

    let merged = engine.get_merged_order(ORDER).await.unwrap();
    assert_eq!(merged.state, ReconcileState::Merged);
    assert_eq!(merged.enrichment_status, EnrichmentStatus::EnrichedWithAttachments);
    assert_eq!(merged.order.title.value().unwrap(), "3D моделирование корпуса прибора");
    assert_eq!(merged.order.scraped_title.value().unwrap(), "3D моделирование");
    assert_eq!(merged.order.links.value().unwrap(), &vec!["https://example.com".to_string()]);
    assert_eq!(merged.order.budget.value().unwrap(), "по договоренности");
    assert_eq!(merged.attachments.len(), 1);
    assert_eq!(merged.attachments[0].declared_filename, "ТЗ.pdf");
    assert!(uploads.path().join(&merged.attachments[0].storage_path).is_file());
}

#[tokio::test]
async fn arrival_order_does_not_change_the_result() {
    let (first_dir, second_dir) = (TempDir::new().unwrap(), TempDir::new().unwrap());
    let feed_first = reconciler(&first_dir, 1024);
    let enrichment_first = reconciler(&second_dir, 1024);
    let stub = fixture_stub(ORDER);

    feed_first.apply_feed_stub(&stub).await.unwrap();
    feed_first.apply_enrichment(enrichment()).await.unwrap();
    enrichment_first.apply_enrichment(enrichment()).await.unwrap();
    enrichment_first.apply_feed_stub(&stub).await.unwrap();

    let a = feed_first.get_merged_order(ORDER).await.unwrap();
    let b = enrichment_first.get_merged_order(ORDER).await.unwrap();
    assert_eq!(comparable(&a), comparable(&b));
    assert_eq!(a.state, ReconcileState::Merged);
}

#[tokio::test]
async fn concurrent_channels_converge() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 1024);
    let stub = fixture_stub(ORDER);

    let (feed, enriched) = tokio::join!(engine.apply_feed_stub(&stub), engine.apply_enrichment(enrichment()));
    feed.unwrap();
    enriched.unwrap();

    let merged = engine.get_merged_order(ORDER).await.unwrap();
    assert_eq!(merged.state, ReconcileState::Merged);
    assert_eq!(merged.order.title.value().unwrap(), &stub.title);
    assert_eq!(merged.order.budget.value().unwrap(), "по договоренности");
}

#[tokio::test]
async fn replays_are_no_ops() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 1024);
    let stub = fixture_stub(ORDER);

    engine.apply_feed_stub(&stub).await.unwrap();
    engine.apply_enrichment(enrichment()).await.unwrap();
    let before = engine.get_merged_order(ORDER).await.unwrap();

    let feed_replay = engine.apply_feed_stub(&stub).await.unwrap();
    assert!(!feed_replay.changed);
    let enrichment_replay = engine.apply_enrichment(enrichment()).await.unwrap();
    assert!(!enrichment_replay.changed);
    match &enrichment_replay.files[0].status {
        FileStatus::Stored { write, .. } => assert_eq!(*write, AttachmentWrite::Unchanged),
        other => panic!("unexpected file status {other:?}"),
    }

    let after = engine.get_merged_order(ORDER).await.unwrap();
    assert_eq!(
        serde_json::to_vec(&before).unwrap(),
        serde_json::to_vec(&after).unwrap()
    );
    assert_eq!(after.attachments.len(), 1);
    let stored_files = std::fs::read_dir(uploads.path().join(format!("project_{ORDER}")))
        .unwrap()
        .count();
    assert_eq!(stored_files, 1);
}

#[tokio::test]
async fn owned_fields_are_never_taken_over() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 1024);
    let stub = fixture_stub(ORDER);

    engine.apply_feed_stub(&stub).await.unwrap();
    engine
        .apply_enrichment(EnrichmentPayload {
            id: Some(ORDER.into()),
            title: Some("Other title".into()),
            url: Some("https://www.fl.ru/projects/5468413/other.html".into()),
            description: Some("Full scraped description".into()),
            ..EnrichmentPayload::default()
        })
        .await
        .unwrap();

    let mut newer = stub.clone();
    newer.title = "Renamed in feed".into();
    newer.links = vec!["https://feed.example.com/".into()];
    engine.apply_feed_stub(&newer).await.unwrap();

    let order = engine.get_merged_order(ORDER).await.unwrap().order;
    assert_eq!(order.title.value().unwrap(), "Renamed in feed");
    assert_eq!(order.project_url.value().unwrap(), &stub.project_url);
    assert_eq!(order.category.value(), stub.category.as_ref());
    assert_eq!(order.published_at.value(), stub.published_at.as_ref());
    assert_eq!(order.description.value().unwrap(), "Full scraped description");
}

#[tokio::test]
async fn same_url_with_new_bytes_is_a_new_version() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 1024);
    engine.apply_enrichment(enrichment()).await.unwrap();

    let mut revised = enrichment();
    revised.attachments[0].bytes = b"%PDF-1.4 revised assignment".to_vec();
    let outcome = engine.apply_enrichment(revised).await.unwrap();
    match &outcome.files[0].status {
        FileStatus::Stored { write, attachment } => {
            assert_eq!(*write, AttachmentWrite::Replaced { previous_version: 1 });
            assert_eq!(attachment.version, 2);
        }
        other => panic!("unexpected file status {other:?}"),
    }

    let merged = engine.get_merged_order(ORDER).await.unwrap();
    assert_eq!(merged.attachments.len(), 1);
    let kept_on_disk = std::fs::read_dir(uploads.path().join(format!("project_{ORDER}")))
        .unwrap()
        .count();
    assert_eq!(kept_on_disk, 2);
}

#[tokio::test]
async fn oversized_file_is_rejected_alone() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 64);
    let mut payload = EnrichmentPayload {
        id: Some(ORDER.into()),
        attachments: vec![tz_upload()],
        ..EnrichmentPayload::default()
    };
    payload.attachments.push(AttachmentUpload {
        original_url: Some("https://st.fl.ru/projects/5468413/big.zip".into()),
        filename: "big.zip".into(),
        bytes: vec![7u8; 65],
        ..AttachmentUpload::default()
    });
    payload.attachments.push(AttachmentUpload {
        filename: "empty.txt".into(),
        ..AttachmentUpload::default()
    });

    let outcome = engine.apply_enrichment(payload).await.unwrap();
    assert_eq!(outcome.stored_count(), 1);
    assert_eq!(
        outcome.files[1].rejection(),
        Some(FileRejection::TooLarge { max_bytes: 64 })
    );
    assert_eq!(outcome.files[2].rejection(), Some(FileRejection::Empty));
    assert_eq!(outcome.files[2].original_url, "upload://empty.txt");

    let merged = engine.get_merged_order(ORDER).await.unwrap();
    assert_eq!(merged.attachments.len(), 1);
    assert_eq!(merged.attachments[0].original_url, "https://st.fl.ru/projects/5468413/tz.pdf");
}

#[tokio::test]
async fn unkeyed_uploads_with_cyrillic_names_accumulate() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 1024);
    let unkeyed = |filename: &str, bytes: &[u8]| AttachmentUpload {
        filename: filename.into(),
        content_type: Some("image/png".into()),
        bytes: bytes.to_vec(),
        ..AttachmentUpload::default()
    };

    let outcome = engine
        .apply_enrichment(EnrichmentPayload {
            id: Some(ORDER.into()),
            attachments: vec![unkeyed("Эскиз.png", b"sketch"), unkeyed("Макет.png", b"mockup")],
            ..EnrichmentPayload::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.stored_count(), 2);
    assert_ne!(outcome.files[0].original_url, outcome.files[1].original_url);
    for file in &outcome.files {
        assert!(matches!(
            file.status,
            FileStatus::Stored { write: AttachmentWrite::Created, .. }
        ));
    }

    let merged = engine.get_merged_order(ORDER).await.unwrap();
    assert_eq!(merged.attachments.len(), 2);
    let mut names: Vec<_> = merged
        .attachments
        .iter()
        .map(|a| a.declared_filename.as_str())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["Макет.png", "Эскиз.png"]);
    let mut paths: Vec<_> = merged.attachments.iter().map(|a| a.storage_path.clone()).collect();
    paths.dedup();
    assert_eq!(paths.len(), 2);

    // Same name and bytes again is a no-op.
    let replay = engine
        .apply_enrichment(EnrichmentPayload {
            id: Some(ORDER.into()),
            attachments: vec![unkeyed("Эскиз.png", b"sketch")],
            ..EnrichmentPayload::default()
        })
        .await
        .unwrap();
    assert!(matches!(
        replay.files[0].status,
        FileStatus::Stored { write: AttachmentWrite::Unchanged, .. }
    ));
    assert_eq!(engine.get_merged_order(ORDER).await.unwrap().attachments.len(), 2);
}

#[tokio::test]
async fn fully_rejected_upload_writes_nothing() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 4);
    let outcome = engine
        .apply_enrichment(EnrichmentPayload {
            id: Some(ORDER.into()),
            attachments: vec![tz_upload()],
            ..EnrichmentPayload::default()
        })
        .await
        .unwrap();
    assert!(!outcome.created);
    assert_eq!(outcome.rejected_count(), 1);
    assert!(matches!(
        engine.get_merged_order(ORDER).await,
        Err(ReconcileError::NotFound(_))
    ));
}

#[tokio::test]
async fn invalid_payloads_are_rejected_before_any_write() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 1024);

    let err = engine
        .apply_enrichment(EnrichmentPayload {
            id: Some("54684x3".into()),
            ..enrichment()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidPayload(PayloadError::InvalidId(_))));

    let err = engine
        .apply_enrichment(EnrichmentPayload {
            title: Some("orphan".into()),
            ..EnrichmentPayload::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::InvalidPayload(PayloadError::MissingId)));

    let listed = engine
        .list_orders(&OrderFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert!(listed.is_empty());
    assert!(std::fs::read_dir(uploads.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn id_is_derived_from_urls_when_not_given() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 1024);
    let outcome = engine
        .apply_enrichment(EnrichmentPayload {
            url: Some("https://www.fl.ru/projects/5468420/montazh.html".into()),
            budget: Some("5000".into()),
            ..EnrichmentPayload::default()
        })
        .await
        .unwrap();
    assert_eq!(outcome.order_id.as_str(), "5468420");
}

#[tokio::test]
async fn unknown_orders_are_not_found() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 1024);
    assert!(matches!(
        engine.get_merged_order("999").await,
        Err(ReconcileError::NotFound(ref id)) if id == "999"
    ));
    assert!(matches!(
        engine.get_merged_order("../etc").await,
        Err(ReconcileError::NotFound(_))
    ));
}

#[tokio::test]
async fn feed_batch_skips_bad_entries_and_counts_replays() {
    let uploads = TempDir::new().unwrap();
    let engine = reconciler(&uploads, 1024);

    let first = engine.ingest_feed(&FeedIngestRequest::default()).await.unwrap();
    assert_eq!(first.created, 9);
    assert_eq!(first.processed, 9);
    assert_eq!(first.skipped, 1);
    assert_eq!(first.errored, 0);

    let second = engine.ingest_feed(&FeedIngestRequest::default()).await.unwrap();
    assert_eq!(second.created, 0);
    assert_eq!(second.unchanged, 9);
    assert_eq!(second.skipped, 1);

    let limited = engine
        .ingest_feed(&FeedIngestRequest {
            limit: Some(2),
            ..FeedIngestRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(limited.processed, 2);

    let listed = engine
        .list_orders(
            &OrderFilter {
                q: Some("ЛЕНДИНГ".into()),
                has_attachments: None,
            },
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].order.id.as_str(), "5468414");
    assert_eq!(listed[0].state, ReconcileState::Discovered);
    assert_eq!(listed[0].enrichment_status, EnrichmentStatus::Pending);
}

async fn serve_fixture() -> String {
    let body = std::fs::read(fixture_path()).unwrap();
    let app = Router::new()
        .route(
            "/rss/all.xml",
            get(move |RawQuery(query): RawQuery| {
                let body = body.clone();
                async move {
                    if query.as_deref() == Some("category=5") {
                        (StatusCode::OK, body).into_response()
                    } else {
                        StatusCode::NOT_FOUND.into_response()
                    }
                }
            }),
        )
        .route("/down.xml", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn http_poller_ingests_over_loopback() {
    let base = serve_fixture().await;
    let uploads = TempDir::new().unwrap();
    let fetcher = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    let engine = Reconciler::new(
        Arc::new(MemoryOrderRepository::new()),
        AttachmentStore::new(uploads.path()),
        Arc::new(HttpFeedPoller::new(fetcher)),
        ReconcilerConfig {
            rss_feed_url: format!("{base}/rss/all.xml"),
            rss_category: Some("5".into()),
            ..ReconcilerConfig::default()
        },
    );

    let summary = engine.ingest_feed(&FeedIngestRequest::default()).await.unwrap();
    assert_eq!(summary.feed_url, format!("{base}/rss/all.xml?category=5"));
    assert_eq!(summary.created, 9);
    assert_eq!(summary.skipped, 1);

    let err = engine
        .ingest_feed(&FeedIngestRequest {
            feed_url: Some(format!("{base}/down.xml")),
            ..FeedIngestRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Feed(FeedError::Fetch(FetchError::HttpStatus { status: 503, .. }))
    ));
}

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use folio::application::blobs::{BlobError, BlobStore, BlobUpload, StoredBlob};
use folio::application::files::{FileService, FileUpload};
use folio::application::ids::IdGenerator;
use folio::application::storage::AdminStorage;
use folio::cache::{
    CacheConfig, ListenerError, NotificationBus, RecordCache, RecordListener, StorageEvent,
};
use folio::domain::entities::{PageRecord, ParameterRecord, RecordMeta};
use folio::domain::uploads::BlobRef;
use folio::infra::memory::InMemoryRecordBackend;
use metrics_util::debugging::DebuggingRecorder;
use url::Url;

struct RejectingListener;

#[async_trait]
impl RecordListener<ParameterRecord> for RejectingListener {
    async fn on_event(&self, _event: &StorageEvent<ParameterRecord>) -> Result<(), ListenerError> {
        Err(ListenerError::new("not today"))
    }
}

/// Stores fine, never deletes.
struct StickyBlobStore;

#[async_trait]
impl BlobStore for StickyBlobStore {
    async fn store(&self, upload: BlobUpload) -> Result<StoredBlob, BlobError> {
        Ok(StoredBlob {
            reference: BlobRef::new(format!("sticky/{}", upload.filename)),
            content_type: "image/png".into(),
            hash: "0".repeat(64),
            filename: upload.filename,
            size: 1,
        })
    }

    async fn fetch(&self, reference: &BlobRef) -> Result<bytes::Bytes, BlobError> {
        Err(BlobError::NotFound {
            reference: reference.clone(),
        })
    }

    fn url_for(&self, reference: &BlobRef, _size_hint: Option<u32>) -> Result<Url, BlobError> {
        Err(BlobError::InvalidReference {
            reference: reference.to_string(),
        })
    }

    async fn delete(&self, _reference: &BlobRef) -> Result<(), BlobError> {
        Err(BlobError::Io(std::io::Error::other("read-only volume")))
    }
}

#[tokio::test]
async fn soft_failure_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let backend = Arc::new(InMemoryRecordBackend::new());
    let pages = Arc::new(RecordCache::<PageRecord>::new(
        backend.clone(),
        CacheConfig::default(),
    ));
    let bus = NotificationBus::builder()
        .subscribe::<ParameterRecord>(Arc::new(RejectingListener))
        .subscribe::<PageRecord>(pages.clone())
        .build();
    let storage = AdminStorage::new(
        backend.clone(),
        Arc::new(IdGenerator::new()),
        Arc::new(bus),
    );

    // Listener failure is soft; the record is stored.
    let stored = storage
        .add(ParameterRecord {
            meta: RecordMeta::default(),
            name: "lang".into(),
            value: "en".into(),
            owner_external_key: "page".into(),
        })
        .await
        .expect("mutation succeeds despite the listener");
    assert_eq!(stored.name, "lang");

    // Cache rebuilds, twice for coalescing bookkeeping.
    pages.refresh().await.expect("refresh");
    pages.refresh().await.expect("refresh");

    // Replacing a payload whose old blob cannot be deleted leaks it.
    let files = FileService::new(storage.clone(), Arc::new(StickyBlobStore));
    let first = files
        .upload(FileUpload {
            key: None,
            name: None,
            blob: BlobUpload::from_bytes("a.png", None, "a"),
        })
        .await
        .expect("upload")
        .record;
    let replaced = files
        .upload(FileUpload {
            key: first.meta.key,
            name: None,
            blob: BlobUpload::from_bytes("b.png", None, "b"),
        })
        .await
        .expect("replace");
    assert!(replaced.cleanup.is_soft_failure());

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    for expected in [
        "folio_notification_soft_failure_total",
        "folio_soft_failure_total",
        "folio_cache_refresh_ms",
        "folio_blob_leaked_total",
    ] {
        assert!(names.contains(expected), "missing metric `{expected}`: {names:?}");
    }
}

//! End-to-end lifecycle scenarios over the in-memory backends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use attachs_core::{AttachsConfig, KeyStrategy, Lockable, UNPROCESSED};
use attachs_lifecycle::*;
use bytes::Bytes;
use chrono::{Duration, Utc};
use serde_json::{json, Value};

const JPEG: &[u8] = &[
    0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00, 0x01,
];

/// Memory storage that records every put and delete
#[derive(Default)]
struct RecordingStorage {
    inner: MemoryStorage,
    puts: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
}

impl RecordingStorage {
    fn puts(&self) -> Vec<String> {
        self.puts.lock().unwrap().clone()
    }

    fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    fn reset(&self) {
        self.puts.lock().unwrap().clear();
        self.deletes.lock().unwrap().clear();
    }
}

#[async_trait]
impl StorageBackend for RecordingStorage {
    async fn put(&self, path: &str, data: Bytes, content_type: &str) -> StorageResult<FileMetadata> {
        self.puts.lock().unwrap().push(path.to_string());
        self.inner.put(path, data, content_type).await
    }

    async fn get(&self, path: &str) -> StorageResult<Bytes> {
        self.inner.get(path).await
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        self.deletes.lock().unwrap().push(path.to_string());
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> StorageResult<bool> {
        self.inner.exists(path).await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<StoredObject>> {
        self.inner.list(prefix).await
    }

    fn url(&self, path: &str, options: &UrlOptions) -> String {
        self.inner.url(path, options)
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Fails every non-original style while `failing` is set
#[derive(Default)]
struct FlakyTransformer {
    failing: AtomicBool,
}

#[async_trait]
impl Transformer for FlakyTransformer {
    async fn transform(
        &self,
        source: Bytes,
        style: &StyleSpec,
        _content_type: &str,
    ) -> Result<Bytes, TransformError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransformError::Failed(format!("{} unavailable", style.name)));
        }
        let mut out = source.to_vec();
        out.extend_from_slice(style.config.to_string().as_bytes());
        Ok(Bytes::from(out))
    }
}

struct Harness {
    config: AttachsConfig,
    store: Arc<MemoryAttachmentStore>,
    storage: Arc<RecordingStorage>,
    transformer: Arc<FlakyTransformer>,
}

type Service = AttachmentService<MemoryAttachmentStore, RecordingStorage>;

impl Harness {
    fn new() -> Self {
        Self {
            config: AttachsConfig {
                prefix: Some("uploads".to_string()),
                ..Default::default()
            },
            store: Arc::new(MemoryAttachmentStore::new()),
            storage: Arc::new(RecordingStorage::default()),
            transformer: Arc::new(FlakyTransformer::default()),
        }
    }

    /// Service over the shared store and storage with `thumb` configured as given
    fn service(&self, thumb: Value) -> Arc<Service> {
        let registry = StaticRegistry::new().with_slot(
            "User",
            "avatar",
            SlotOptions::new().style("thumb", thumb),
        );
        let processor = AttachmentProcessor::new(
            self.store.clone(),
            self.storage.clone(),
            self.transformer.clone(),
            KeyDeriver::from_config(&self.config),
            StyleRegistry::new(Arc::new(registry), &self.config),
        );
        Arc::new(AttachmentService::new(Arc::new(processor), &self.config))
    }
}

fn upload() -> NewUpload {
    NewUpload::new("User", "avatar", "photo.jpg", JPEG)
}

#[test]
fn derived_path_is_reproducible() {
    for strategy in [KeyStrategy::ContentHash, KeyStrategy::Obfuscated] {
        let config = AttachsConfig {
            prefix: Some("uploads".to_string()),
            key_strategy: strategy,
            ..Default::default()
        };
        let first = KeyDeriver::from_config(&config).derive(42, &StyleSpec::original(), "jpg");
        let second = KeyDeriver::from_config(&config).derive(42, &StyleSpec::original(), "jpg");

        assert_eq!(first, second);
        assert!(first.starts_with("uploads/42/"));
        assert!(first.ends_with(".jpg"));
    }
}

#[tokio::test]
async fn processed_attachment_has_complete_metadata() {
    let harness = Harness::new();
    let service = harness.service(json!({"width": 100}));

    let attachment = service.upload_and_process(upload()).await.unwrap();

    assert!(attachment.is_processed());
    assert_eq!(attachment.content_type.as_deref(), Some("image/jpeg"));
    assert_eq!(attachment.extension.as_deref(), Some("jpg"));
    assert_eq!(attachment.size_bytes, Some(JPEG.len() as i64));
    assert!(attachment.processed_at.unwrap() > attachment.requested_at);
}

#[tokio::test]
async fn attaching_requires_processing() {
    let harness = Harness::new();
    let service = harness.service(json!({"width": 100}));

    let pending = service.register_upload(upload()).await.unwrap();
    let id = pending.id.unwrap();

    let err = service.attach(id, 9).await.unwrap_err();
    assert!(err.validation_errors().unwrap().has_base(UNPROCESSED));
    assert!(!err.is_retryable());

    service.process(id).await.unwrap();
    let attached = service.attach(id, 9).await.unwrap();
    assert!(attached.is_attached());

    let err = service.reclassify(id, "User", "avatar_old").await.unwrap_err();
    assert!(err.validation_errors().is_some());
}

#[tokio::test]
async fn destroying_processed_deletes_each_path_once() {
    let harness = Harness::new();
    let service = harness.service(json!({"width": 100}));

    let attachment = service.upload_and_process(upload()).await.unwrap();
    let expected = service.stored_paths(&attachment);
    assert_eq!(expected.len(), 2);
    harness.storage.reset();

    service.destroy(attachment.id.unwrap()).await.unwrap();

    let mut deletes = harness.storage.deletes();
    deletes.sort();
    assert_eq!(deletes, expected.into_iter().collect::<Vec<_>>());
    assert!(service.get(attachment.id.unwrap()).await.unwrap().is_none());
}

#[tokio::test]
async fn destroying_unprocessed_deletes_nothing() {
    let harness = Harness::new();
    let service = harness.service(json!({"width": 100}));

    let pending = service.register_upload(upload()).await.unwrap();
    harness.storage.reset();

    service.destroy(pending.id.unwrap()).await.unwrap();
    assert!(harness.storage.deletes().is_empty());
}

#[tokio::test]
async fn reprocessing_moves_only_changed_styles() {
    let harness = Harness::new();
    let before = harness.service(json!({"width": 100}));

    let attachment = before.upload_and_process(upload()).await.unwrap();
    let id = attachment.id.unwrap();
    let old_original = before.url(&attachment, None).unwrap();
    let old_thumb = before.url(&attachment, Some("thumb")).unwrap();
    harness.storage.reset();

    let after = harness.service(json!({"width": 120}));
    let report = after.processor().reprocess(id).await.unwrap();

    assert_eq!(report.written.len(), 1);
    assert_eq!(report.removed.len(), 1);
    assert_eq!(report.unchanged.len(), 1);
    assert_eq!(harness.storage.puts(), report.written);
    assert_eq!(harness.storage.deletes(), report.removed);

    let reloaded = after.get(id).await.unwrap().unwrap();
    assert_eq!(reloaded.applied_styles["thumb"], json!({"width": 120}));
    assert_eq!(after.url(&reloaded, None).unwrap(), old_original);
    let new_thumb = after.url(&reloaded, Some("thumb")).unwrap();
    assert_ne!(new_thumb, old_thumb);
    assert!(old_thumb.ends_with(&report.removed[0]));

    let thumb = after.fetch(&reloaded, Some("thumb")).await.unwrap().unwrap();
    assert!(thumb.ends_with(b"{\"width\":120}"));
}

#[tokio::test]
async fn failed_style_leaves_processing_and_retry_completes() {
    let harness = Harness::new();
    let service = harness.service(json!({"width": 100}));

    let pending = service.register_upload(upload()).await.unwrap();
    let id = pending.id.unwrap();

    harness.transformer.failing.store(true, Ordering::SeqCst);
    let err = service.process(id).await.unwrap_err();
    assert!(matches!(err, AttachmentError::Transform(_)));
    assert!(err.is_retryable());

    let stuck = service.get(id).await.unwrap().unwrap();
    assert!(stuck.is_processing());
    assert!(stuck.processed_at.is_none());
    assert_eq!(service.url(&stuck, None), None);
    // staged upload kept for the retry
    assert!(service.fetch(&stuck, None).await.unwrap().is_some());

    let original_writes = harness.storage.puts();
    harness.storage.reset();
    harness.transformer.failing.store(false, Ordering::SeqCst);

    let processed = service.process(id).await.unwrap();
    assert!(processed.is_processed());

    let paths = service.stored_paths(&processed);
    let rewritten = harness.storage.puts();
    assert_eq!(rewritten.len(), 2);
    for path in &rewritten {
        assert!(paths.contains(path));
    }
    // the original landed on the same path both times
    assert!(original_writes.iter().any(|p| rewritten.contains(p) && paths.contains(p)));
    assert_eq!(
        service.fetch(&processed, None).await.unwrap(),
        Some(Bytes::from_static(JPEG))
    );
    assert_eq!(service.fetch(&processed, None).await.unwrap().unwrap().len(), JPEG.len());
}

#[tokio::test]
async fn stale_writer_cannot_publish() {
    let harness = Harness::new();
    let service = harness.service(json!({"width": 100}));

    let pending = service.register_upload(upload()).await.unwrap();
    let id = pending.id.unwrap();
    let stale = service.get(id).await.unwrap().unwrap();

    let processed = service.process(id).await.unwrap();
    assert!(processed.lock_version() > stale.lock_version());

    let err = harness.store.update(&stale).await.unwrap_err();
    assert!(matches!(err, AttachmentError::Conflict { .. }));
    assert!(service.get(id).await.unwrap().unwrap().is_processed());
}

#[tokio::test]
async fn sweeper_honours_retention_window() {
    let harness = Harness::new();
    let service = harness.service(json!({"width": 100}));
    let sweeper = LifecycleSweeper::new(service.clone(), &harness.config);
    let now = Utc::now();

    let mut old = Attachment::new("User", "avatar");
    old.requested_at = now - Duration::days(2);
    let old_id = harness.store.create(&mut old).await.unwrap();

    let mut recent = Attachment::new("User", "avatar");
    recent.requested_at = now - Duration::hours(1);
    let recent_id = harness.store.create(&mut recent).await.unwrap();

    let report = sweeper.sweep_unattached(now).await.unwrap();
    assert_eq!(report.destroyed, 1);
    assert!(service.get(old_id).await.unwrap().is_none());
    assert!(service.get(recent_id).await.unwrap().is_some());
}

#[tokio::test]
async fn sweeper_reclaims_superseded_styles() {
    let harness = Harness::new();
    let before = harness.service(json!({"width": 100}));
    let attachment = before.upload_and_process(upload()).await.unwrap();
    let id = attachment.id.unwrap();
    before.attach(id, 1).await.unwrap();

    // a crashed reprocess wrote a style the record never published
    let keys = KeyDeriver::from_config(&harness.config);
    let abandoned = keys.derive(id, &StyleSpec::new("thumb", json!({"width": 999})), "jpg");
    harness
        .storage
        .put(&abandoned, Bytes::from_static(JPEG), "image/jpeg")
        .await
        .unwrap();

    let sweeper = LifecycleSweeper::new(before.clone(), &harness.config);
    let report = sweeper.run(Utc::now() + Duration::days(2)).await.unwrap();

    assert_eq!(report.destroyed, 0);
    assert_eq!(report.reclaimed, 1);
    assert!(!harness.storage.exists(&abandoned).await.unwrap());
    for path in before.stored_paths(&attachment) {
        assert!(harness.storage.exists(&path).await.unwrap());
    }
}

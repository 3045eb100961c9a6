//! Attachment Service
//!
//! Front door of the engine: intake, attaching, retrieval and destruction.
//! Processing itself is delegated to the [`AttachmentProcessor`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use attachs_core::{AttachsConfig, Id, ValidationErrors, NOT_POSITIVE};
use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use crate::describe::{Describer, OwnerRecord};
use crate::error::{AttachmentError, AttachmentResult};
use crate::keys::KeyDeriver;
use crate::model::{Attachment, NewUpload};
use crate::processor::{owned_paths, published_paths, AttachmentProcessor};
use crate::storage::{StorageBackend, StorageError, UrlOptions};
use crate::store::AttachmentStore;
use crate::styles::{StyleRegistry, ORIGINAL};

const STAGING_CONTENT_TYPE: &str = "application/octet-stream";

/// Attachment service
pub struct AttachmentService<St: AttachmentStore, S: StorageBackend> {
    processor: Arc<AttachmentProcessor<St, S>>,
    max_upload_bytes: u64,
    url_expiry: Duration,
    describer: Option<Describer>,
}

impl<St: AttachmentStore, S: StorageBackend> AttachmentService<St, S> {
    pub fn new(processor: Arc<AttachmentProcessor<St, S>>, config: &AttachsConfig) -> Self {
        Self {
            processor,
            max_upload_bytes: config.max_upload_bytes,
            url_expiry: config.url_expiry(),
            describer: None,
        }
    }

    pub fn with_describer(mut self, describer: Describer) -> Self {
        self.describer = Some(describer);
        self
    }

    pub fn processor(&self) -> &Arc<AttachmentProcessor<St, S>> {
        &self.processor
    }

    fn store(&self) -> &Arc<St> {
        self.processor.store()
    }

    fn storage(&self) -> &Arc<S> {
        self.processor.storage()
    }

    fn keys(&self) -> &KeyDeriver {
        self.processor.keys()
    }

    fn styles(&self) -> &StyleRegistry {
        self.processor.styles()
    }

    async fn load(&self, id: Id) -> AttachmentResult<Attachment> {
        self.store()
            .get(id)
            .await?
            .ok_or(AttachmentError::NotFound(id))
    }

    /// Record an upload and stage its bytes for processing
    #[instrument(skip(self, upload), fields(owner_type = %upload.owner_type, filename = %upload.filename))]
    pub async fn register_upload(&self, upload: NewUpload) -> AttachmentResult<Attachment> {
        let size = upload.data.len() as u64;
        if size > self.max_upload_bytes {
            return Err(AttachmentError::FileTooLarge {
                size,
                max: self.max_upload_bytes,
            });
        }

        let mut attachment = Attachment::new(&upload.owner_type, &upload.owner_attribute)
            .with_filename(&upload.filename);

        let mut errors = match attachment.validate(self.styles().registry().as_ref()) {
            Ok(()) => ValidationErrors::new(),
            Err(errors) => errors,
        };
        if size == 0 {
            errors.add("size_bytes", NOT_POSITIVE);
        }
        errors.into_result()?;

        let id = self.store().create(&mut attachment).await?;
        let staging = self.keys().staging_path(id);

        if let Err(e) = self
            .storage()
            .put(&staging, upload.data, STAGING_CONTENT_TYPE)
            .await
        {
            if let Err(cleanup) = self.store().delete(id).await {
                warn!(id = id, error = %cleanup, "Failed to remove record of failed upload");
            }
            return Err(e.into());
        }

        info!(id = id, size = size, "Upload registered");
        Ok(attachment)
    }

    /// Register and immediately process an upload
    pub async fn upload_and_process(&self, upload: NewUpload) -> AttachmentResult<Attachment> {
        let attachment = self.register_upload(upload).await?;
        let id = attachment.id.ok_or_else(|| {
            AttachmentError::Database("store returned attachment without id".to_string())
        })?;
        self.processor.process(id).await
    }

    pub async fn process(&self, id: Id) -> AttachmentResult<Attachment> {
        self.processor.process(id).await
    }

    /// Get an attachment by ID
    pub async fn get(&self, id: Id) -> AttachmentResult<Option<Attachment>> {
        self.store().get(id).await
    }

    /// Attach a processed attachment to its owner
    #[instrument(skip(self))]
    pub async fn attach(&self, id: Id, owner_id: Id) -> AttachmentResult<Attachment> {
        let mut attachment = self.load(id).await?;
        attachment.attach_to(owner_id)?;
        attachment.validate(self.styles().registry().as_ref())?;

        let attachment = self.store().update(&attachment).await?;
        self.styles().registry().touch(&attachment.owner());

        info!(
            id = id,
            owner_type = %attachment.owner_type,
            owner_id = owner_id,
            "Attachment attached"
        );
        Ok(attachment)
    }

    /// Move an unattached attachment to another slot
    #[instrument(skip(self))]
    pub async fn reclassify(
        &self,
        id: Id,
        owner_type: &str,
        owner_attribute: &str,
    ) -> AttachmentResult<Attachment> {
        let mut attachment = self.load(id).await?;
        attachment.set_classification(owner_type, owner_attribute)?;
        attachment.validate(self.styles().registry().as_ref())?;

        let attachment = self.store().update(&attachment).await?;
        debug!(id = id, "Attachment reclassified");
        Ok(attachment)
    }

    pub async fn find_for_owner(
        &self,
        owner_type: &str,
        owner_id: Id,
        owner_attribute: Option<&str>,
    ) -> AttachmentResult<Vec<Attachment>> {
        self.store()
            .find_for_owner(owner_type, owner_id, owner_attribute)
            .await
    }

    fn url_options(&self, attachment: &Attachment) -> UrlOptions {
        if self
            .styles()
            .is_private(&attachment.owner_type, &attachment.owner_attribute)
        {
            UrlOptions::expiring(self.url_expiry)
        } else {
            UrlOptions::default()
        }
    }

    /// URL of a style (`original` when `None`)
    ///
    /// Processed attachments resolve against their published styles. Before
    /// that, the slot's default path stands in for every configured style.
    pub fn url(&self, attachment: &Attachment, style: Option<&str>) -> Option<String> {
        let style = style.unwrap_or(ORIGINAL);
        let options = self.url_options(attachment);

        if attachment.is_processed() {
            let paths = published_paths(self.keys(), attachment);
            return paths
                .get(style)
                .map(|path| self.storage().url(path, &options));
        }

        let (owner_type, attribute) = (&attachment.owner_type, &attachment.owner_attribute);
        if !self.styles().resolve(owner_type, attribute).contains(style) {
            return None;
        }
        let template = self.styles().default_path(owner_type, attribute)?;
        let path = self.keys().default_path(&template, style);
        Some(self.storage().url(&path, &options))
    }

    /// URLs of every available style
    pub fn urls(&self, attachment: &Attachment) -> BTreeMap<String, String> {
        let names: Vec<String> = if attachment.is_processed() {
            published_paths(self.keys(), attachment).into_keys().collect()
        } else {
            self.styles()
                .resolve(&attachment.owner_type, &attachment.owner_attribute)
                .names()
                .into_iter()
                .map(str::to_string)
                .collect()
        };

        names
            .into_iter()
            .filter_map(|name| {
                let url = self.url(attachment, Some(&name))?;
                Some((name, url))
            })
            .collect()
    }

    /// Bytes of a style; absent styles and objects yield `None`
    ///
    /// Until processed, only the staged upload is available, as `original`.
    pub async fn fetch(
        &self,
        attachment: &Attachment,
        style: Option<&str>,
    ) -> AttachmentResult<Option<Bytes>> {
        let style = style.unwrap_or(ORIGINAL);

        let path = if attachment.is_processed() {
            published_paths(self.keys(), attachment).remove(style)
        } else {
            attachment
                .id
                .filter(|_| style == ORIGINAL)
                .map(|id| self.keys().staging_path(id))
        };
        let Some(path) = path else {
            return Ok(None);
        };

        match self.storage().get(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every storage path a processed attachment may own
    pub fn stored_paths(&self, attachment: &Attachment) -> BTreeSet<String> {
        if attachment.is_unprocessed() {
            return BTreeSet::new();
        }
        owned_paths(self.keys(), self.styles(), attachment)
    }

    /// Destroy an attachment and, if processed, its stored styles
    #[instrument(skip(self))]
    pub async fn destroy(&self, id: Id) -> AttachmentResult<()> {
        let attachment = self.load(id).await?;
        self.store().delete(id).await?;
        self.release(&attachment).await;
        info!(id = id, state = %attachment.state, "Attachment destroyed");
        Ok(())
    }

    /// Destroy everything an owner holds
    #[instrument(skip(self))]
    pub async fn destroy_for_owner(&self, owner_type: &str, owner_id: Id) -> AttachmentResult<usize> {
        let attachments = self
            .store()
            .find_for_owner(owner_type, owner_id, None)
            .await?;

        let mut destroyed = 0;
        for attachment in attachments {
            let Some(id) = attachment.id else { continue };
            if self.store().delete(id).await? {
                self.release(&attachment).await;
                destroyed += 1;
            }
        }

        info!(count = destroyed, "Owner attachments destroyed");
        Ok(destroyed)
    }

    /// Best-effort cleanup after the record is gone; returns deletes issued
    pub(crate) async fn release(&self, attachment: &Attachment) -> usize {
        let paths = self.stored_paths(attachment);
        for path in &paths {
            if let Err(e) = self.storage().delete(path).await {
                warn!(id = ?attachment.id, path = %path, error = %e, "Failed to delete stored style");
            }
        }
        if attachment.is_attached() {
            self.styles().registry().touch(&attachment.owner());
        }
        paths.len()
    }

    /// Human-readable description, when a describer is configured
    pub fn describe(&self, attachment: &Attachment, owner: &dyn OwnerRecord) -> Option<String> {
        self.describer.as_ref()?.describe(attachment, owner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::describe::{Interpolations, StaticCatalog};
    use crate::storage::MemoryStorage;
    use crate::store::MemoryAttachmentStore;
    use crate::styles::{SlotOptions, StaticRegistry};
    use crate::transform::PassthroughTransformer;
    use attachs_core::{KeyStrategy, ALREADY_ATTACHED, IMMUTABLE, INVALID, UNPROCESSED};
    use serde_json::json;

    type TestService = AttachmentService<MemoryAttachmentStore, MemoryStorage>;

    fn create_service_with(config: AttachsConfig) -> TestService {
        let registry = StaticRegistry::new()
            .with_slot(
                "User",
                "avatar",
                SlotOptions::new()
                    .style("thumb", json!({"width": 100}))
                    .default_path("missing/:style.png"),
            )
            .with_slot("User", "banner", SlotOptions::new())
            .with_slot("Invoice", "scan", SlotOptions::new().private());

        let processor = AttachmentProcessor::new(
            Arc::new(MemoryAttachmentStore::new()),
            Arc::new(MemoryStorage::new()),
            Arc::new(PassthroughTransformer),
            KeyDeriver::from_config(&config),
            StyleRegistry::new(Arc::new(registry), &config),
        );
        AttachmentService::new(Arc::new(processor), &config)
    }

    fn create_service() -> TestService {
        create_service_with(AttachsConfig {
            prefix: Some("uploads".to_string()),
            key_strategy: KeyStrategy::Obfuscated,
            ..Default::default()
        })
    }

    fn upload(attribute: &str, data: &'static [u8]) -> NewUpload {
        NewUpload::new("User", attribute, "notes.txt", data)
    }

    #[tokio::test]
    async fn test_register_upload_stages_bytes() {
        let service = create_service();

        let attachment = service
            .register_upload(upload("avatar", b"hello"))
            .await
            .unwrap();
        let id = attachment.id.unwrap();

        assert!(attachment.is_uploading());
        assert_eq!(attachment.filename.as_deref(), Some("notes.txt"));
        assert_eq!(
            service.storage().paths().await,
            vec![format!("uploads/staging/{}", id)]
        );
        assert_eq!(
            service.fetch(&attachment, None).await.unwrap(),
            Some(Bytes::from("hello"))
        );
        assert_eq!(service.fetch(&attachment, Some("thumb")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_register_upload_validates() {
        let service = create_service();

        let err = service
            .register_upload(NewUpload::new("Project", "logo", "a.txt", &b"x"[..]))
            .await
            .unwrap_err();
        let errors = err.validation_errors().unwrap();
        assert_eq!(errors.get("owner_type").unwrap(), &vec![INVALID.to_string()]);

        let err = service
            .register_upload(upload("avatar", b""))
            .await
            .unwrap_err();
        assert!(err.validation_errors().unwrap().has_error("size_bytes"));

        assert!(service.store().is_empty().await);
    }

    #[tokio::test]
    async fn test_register_upload_too_large() {
        let service = create_service_with(AttachsConfig {
            max_upload_bytes: 4,
            ..Default::default()
        });

        let err = service
            .register_upload(upload("avatar", b"hello"))
            .await
            .unwrap_err();
        assert!(matches!(err, AttachmentError::FileTooLarge { size: 5, max: 4 }));
    }

    #[tokio::test]
    async fn test_upload_and_process_urls() {
        let service = create_service();

        let attachment = service
            .upload_and_process(upload("avatar", b"hello"))
            .await
            .unwrap();
        let id = attachment.id.unwrap();

        assert!(attachment.is_processed());
        assert_eq!(
            service.url(&attachment, None).as_deref(),
            Some(format!("/memory/uploads/{}/s4rmrc8x.txt", id).as_str())
        );
        assert_eq!(
            service.url(&attachment, Some("thumb")).as_deref(),
            Some(format!("/memory/uploads/{}/otbnk.txt", id).as_str())
        );
        assert_eq!(service.url(&attachment, Some("huge")), None);

        let urls = service.urls(&attachment);
        assert_eq!(urls.keys().collect::<Vec<_>>(), vec!["original", "thumb"]);

        assert_eq!(
            service.fetch(&attachment, Some("thumb")).await.unwrap(),
            Some(Bytes::from("hello"))
        );
        assert_eq!(service.fetch(&attachment, Some("huge")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_default_path_before_processing() {
        let service = create_service();

        let attachment = service
            .register_upload(upload("avatar", b"hello"))
            .await
            .unwrap();
        assert_eq!(
            service.url(&attachment, Some("thumb")).as_deref(),
            Some("/memory/uploads/missing/thumb.png")
        );
        assert_eq!(service.url(&attachment, Some("huge")), None);
        assert_eq!(service.urls(&attachment).len(), 2);

        // no default path configured for banners
        let banner = service
            .register_upload(upload("banner", b"hello"))
            .await
            .unwrap();
        assert_eq!(service.url(&banner, None), None);
        assert!(service.urls(&banner).is_empty());
    }

    #[tokio::test]
    async fn test_attach_lifecycle() {
        let service = create_service();

        let pending = service
            .register_upload(upload("avatar", b"hello"))
            .await
            .unwrap();
        let err = service.attach(pending.id.unwrap(), 7).await.unwrap_err();
        assert!(err.validation_errors().unwrap().has_base(UNPROCESSED));

        let processed = service.process(pending.id.unwrap()).await.unwrap();
        let attached = service.attach(processed.id.unwrap(), 7).await.unwrap();
        assert_eq!(attached.owner_id, Some(7));

        let err = service.attach(processed.id.unwrap(), 8).await.unwrap_err();
        assert_eq!(
            err.validation_errors().unwrap().get("owner_id").unwrap(),
            &vec![ALREADY_ATTACHED.to_string()]
        );

        let err = service
            .reclassify(processed.id.unwrap(), "User", "banner")
            .await
            .unwrap_err();
        assert_eq!(
            err.validation_errors().unwrap().get("owner_attribute").unwrap(),
            &vec![IMMUTABLE.to_string()]
        );

        let held = service.find_for_owner("User", 7, Some("avatar")).await.unwrap();
        assert_eq!(held.len(), 1);
    }

    #[tokio::test]
    async fn test_reclassify_unattached() {
        let service = create_service();
        let attachment = service
            .register_upload(upload("avatar", b"hello"))
            .await
            .unwrap();
        let id = attachment.id.unwrap();

        let moved = service.reclassify(id, "User", "banner").await.unwrap();
        assert_eq!(moved.owner_attribute, "banner");

        let err = service.reclassify(id, "User", "nope").await.unwrap_err();
        assert!(err.validation_errors().unwrap().has_error("owner_attribute"));
    }

    #[tokio::test]
    async fn test_destroy_processed_removes_styles() {
        let service = create_service();
        let attachment = service
            .upload_and_process(upload("avatar", b"hello"))
            .await
            .unwrap();
        assert_eq!(service.storage().paths().await.len(), 2);

        service.destroy(attachment.id.unwrap()).await.unwrap();
        assert!(service.storage().paths().await.is_empty());
        assert!(service.get(attachment.id.unwrap()).await.unwrap().is_none());

        let err = service.destroy(attachment.id.unwrap()).await.unwrap_err();
        assert!(matches!(err, AttachmentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_destroy_for_owner() {
        let service = create_service();
        for attribute in ["avatar", "banner"] {
            let attachment = service
                .upload_and_process(upload(attribute, b"hello"))
                .await
                .unwrap();
            service.attach(attachment.id.unwrap(), 3).await.unwrap();
        }
        let other = service
            .upload_and_process(upload("avatar", b"other"))
            .await
            .unwrap();

        assert_eq!(service.destroy_for_owner("User", 3).await.unwrap(), 2);
        assert_eq!(service.store().len().await, 1);
        assert_eq!(service.stored_paths(&other).len(), 2);
        assert_eq!(service.storage().paths().await.len(), 2);
    }

    #[tokio::test]
    async fn test_private_slot_url_options() {
        let service = create_service();
        let attachment = Attachment::new("Invoice", "scan");
        assert_eq!(
            service.url_options(&attachment),
            UrlOptions::expiring(Duration::from_secs(3600))
        );
        assert_eq!(
            service.url_options(&Attachment::new("User", "avatar")),
            UrlOptions::default()
        );
    }

    struct Owner;

    impl OwnerRecord for Owner {
        fn attribute(&self, name: &str) -> Option<String> {
            (name == "name").then(|| "Ada".to_string())
        }
    }

    #[tokio::test]
    async fn test_describe() {
        let describer = Describer::new(
            Arc::new(StaticCatalog::new().with("User", "avatar", "Avatar of %{name}")),
            Interpolations::new(),
        );
        let service = create_service().with_describer(describer);

        let attachment = service
            .upload_and_process(upload("avatar", b"hello"))
            .await
            .unwrap();
        assert_eq!(service.describe(&attachment, &Owner), None);

        let attached = service.attach(attachment.id.unwrap(), 1).await.unwrap();
        assert_eq!(
            service.describe(&attached, &Owner).as_deref(),
            Some("Avatar of Ada")
        );
    }
}

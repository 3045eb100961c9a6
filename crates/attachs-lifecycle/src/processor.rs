//! Attachment Processor
//!
//! Turns a staged upload into a processed attachment. Every style is written
//! before the `processed` state is published, and the publish itself is a
//! compare-and-swap on the record, so a crashed or cancelled run leaves the
//! attachment in `processing` where the next run picks it up.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use attachs_core::{Id, ValidationErrors, UNPROCESSED};
use bytes::Bytes;
use chrono::Utc;
use futures::future::try_join_all;
use tracing::{debug, info, instrument, warn};

use crate::error::{AttachmentError, AttachmentResult};
use crate::hooks::Observers;
use crate::inspect::inspect;
use crate::keys::KeyDeriver;
use crate::model::{Attachment, ProcessedMetadata};
use crate::storage::StorageBackend;
use crate::store::AttachmentStore;
use crate::styles::{StyleRegistry, StyleSet, StyleSpec, ORIGINAL};
use crate::transform::Transformer;

/// Outcome of a reprocess run, as storage paths
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReprocessReport {
    pub written: Vec<String>,
    pub removed: Vec<String>,
    pub unchanged: Vec<String>,
}

impl ReprocessReport {
    pub fn is_noop(&self) -> bool {
        self.written.is_empty() && self.removed.is_empty()
    }
}

/// Outcome of a run over every processed attachment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: Vec<Id>,
}

/// Attachment processor
pub struct AttachmentProcessor<St: AttachmentStore, S: StorageBackend> {
    store: Arc<St>,
    storage: Arc<S>,
    transformer: Arc<dyn Transformer>,
    keys: KeyDeriver,
    styles: StyleRegistry,
    observers: Observers,
}

impl<St: AttachmentStore, S: StorageBackend> AttachmentProcessor<St, S> {
    pub fn new(
        store: Arc<St>,
        storage: Arc<S>,
        transformer: Arc<dyn Transformer>,
        keys: KeyDeriver,
        styles: StyleRegistry,
    ) -> Self {
        Self {
            store,
            storage,
            transformer,
            keys,
            styles,
            observers: Observers::new(),
        }
    }

    pub fn with_observers(mut self, observers: Observers) -> Self {
        self.observers = observers;
        self
    }

    pub fn store(&self) -> &Arc<St> {
        &self.store
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn keys(&self) -> &KeyDeriver {
        &self.keys
    }

    pub fn styles(&self) -> &StyleRegistry {
        &self.styles
    }

    async fn load(&self, id: Id) -> AttachmentResult<Attachment> {
        self.store
            .get(id)
            .await?
            .ok_or(AttachmentError::NotFound(id))
    }

    /// Process a staged upload; already processed attachments are returned as is
    #[instrument(skip(self))]
    pub async fn process(&self, id: Id) -> AttachmentResult<Attachment> {
        let mut attachment = self.load(id).await?;
        if attachment.is_processed() {
            debug!(id = id, "Attachment already processed");
            return Ok(attachment);
        }

        if attachment.is_uploading() {
            attachment.begin_processing()?;
            attachment = self.store.update(&attachment).await?;
        }

        let staging = self.keys.staging_path(id);
        let source = self.storage.get(&staging).await?;
        let metadata = inspect(&source, attachment.filename.as_deref())?;

        let styles = self
            .styles
            .resolve(&attachment.owner_type, &attachment.owner_attribute);

        self.observers.before(&attachment, &source).await;
        let paths = self
            .write_styles(id, &source, &metadata, styles.iter())
            .await?;
        self.observers.after(&attachment, &paths).await;

        attachment.mark_processed(metadata, styles.configs(), Utc::now())?;
        let attachment = self.store.update(&attachment).await?;

        if let Err(e) = self.storage.delete(&staging).await {
            warn!(id = id, path = %staging, error = %e, "Failed to delete staged upload");
        }

        info!(
            id = id,
            styles = paths.len(),
            content_type = attachment.content_type.as_deref().unwrap_or_default(),
            "Attachment processed"
        );

        Ok(attachment)
    }

    /// Rematerialize styles after a configuration change
    ///
    /// Styles whose path and configuration are unchanged are not rewritten.
    /// Paths that only the previous configuration produced are deleted once
    /// the new snapshot is published.
    #[instrument(skip(self))]
    pub async fn reprocess(&self, id: Id) -> AttachmentResult<ReprocessReport> {
        let mut attachment = self.load(id).await?;
        let metadata = processed_metadata(&attachment)?;

        let previous = StyleSet::from_configs(&attachment.applied_styles);
        let current = self
            .styles
            .resolve(&attachment.owner_type, &attachment.owner_attribute);
        let old_paths = self.keys.derive_all(id, &previous, &metadata.extension);
        let new_paths = self.keys.derive_all(id, &current, &metadata.extension);
        let old_set: BTreeSet<&String> = old_paths.values().collect();
        let new_set: BTreeSet<&String> = new_paths.values().collect();

        let (stale, fresh): (Vec<&StyleSpec>, Vec<&StyleSpec>) =
            current.iter().partition(|style| {
                let path = &new_paths[&style.name];
                let config_changed = previous
                    .get(&style.name)
                    .map_or(true, |old| old.config != style.config);
                !old_set.contains(path) || config_changed
            });

        let mut report = ReprocessReport {
            unchanged: fresh.iter().map(|s| new_paths[&s.name].clone()).collect(),
            removed: old_set
                .difference(&new_set)
                .map(|path| path.to_string())
                .collect(),
            ..Default::default()
        };

        let snapshot = current.configs();
        if stale.is_empty() && report.removed.is_empty() && snapshot == attachment.applied_styles {
            debug!(id = id, "Styles up to date");
            return Ok(report);
        }

        if !stale.is_empty() {
            let source = self.read_original(id, &metadata).await?;
            report.written = self
                .write_styles(id, &source, &metadata, stale.into_iter())
                .await?;
        }

        attachment.restyle(snapshot)?;
        let attachment = self.store.update(&attachment).await?;

        for path in &report.removed {
            if let Err(e) = self.storage.delete(path).await {
                warn!(id = id, path = %path, error = %e, "Failed to delete superseded style");
            }
        }

        self.styles.registry().touch(&attachment.owner());
        info!(
            id = id,
            written = report.written.len(),
            removed = report.removed.len(),
            "Attachment reprocessed"
        );

        Ok(report)
    }

    /// Restore styles of the published set whose objects are gone
    #[instrument(skip(self))]
    pub async fn fix_missing(&self, id: Id) -> AttachmentResult<Vec<String>> {
        let attachment = self.load(id).await?;
        let metadata = processed_metadata(&attachment)?;
        let published = StyleSet::from_configs(&attachment.applied_styles);

        let mut missing = Vec::new();
        for style in published.iter().filter(|s| !s.is_original()) {
            let path = self.keys.derive(id, style, &metadata.extension);
            if !self.storage.exists(&path).await? {
                missing.push(style);
            }
        }

        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let source = self.read_original(id, &metadata).await?;
        let written = self
            .write_styles(id, &source, &metadata, missing.into_iter())
            .await?;

        self.styles.registry().touch(&attachment.owner());
        info!(id = id, restored = written.len(), "Missing styles restored");

        Ok(written)
    }

    pub async fn reprocess_all(&self) -> AttachmentResult<BatchReport> {
        let mut report = BatchReport::default();
        for id in self.processed_ids().await? {
            match self.reprocess(id).await {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    warn!(id = id, error = %e, "Reprocess failed");
                    report.failed.push(id);
                }
            }
        }
        Ok(report)
    }

    pub async fn fix_missing_all(&self) -> AttachmentResult<BatchReport> {
        let mut report = BatchReport::default();
        for id in self.processed_ids().await? {
            match self.fix_missing(id).await {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    warn!(id = id, error = %e, "Fixing missing styles failed");
                    report.failed.push(id);
                }
            }
        }
        Ok(report)
    }

    async fn processed_ids(&self) -> AttachmentResult<Vec<Id>> {
        Ok(self
            .store
            .find_processed()
            .await?
            .into_iter()
            .filter_map(|a| a.id)
            .collect())
    }

    async fn read_original(&self, id: Id, metadata: &ProcessedMetadata) -> AttachmentResult<Bytes> {
        let path = self
            .keys
            .derive(id, &StyleSpec::original(), &metadata.extension);
        Ok(self.storage.get(&path).await?)
    }

    /// Write styles concurrently; the first failure aborts the set
    async fn write_styles<'a>(
        &self,
        id: Id,
        source: &Bytes,
        metadata: &ProcessedMetadata,
        styles: impl Iterator<Item = &'a StyleSpec>,
    ) -> AttachmentResult<Vec<String>> {
        try_join_all(styles.map(|style| self.write_style(id, source, metadata, style))).await
    }

    async fn write_style(
        &self,
        id: Id,
        source: &Bytes,
        metadata: &ProcessedMetadata,
        style: &StyleSpec,
    ) -> AttachmentResult<String> {
        let path = self.keys.derive(id, style, &metadata.extension);
        let data = if style.is_original() {
            source.clone()
        } else {
            self.transformer
                .transform(source.clone(), style, &metadata.content_type)
                .await?
        };

        self.storage
            .put(&path, data, &metadata.content_type)
            .await?;
        debug!(id = id, style = %style.name, path = %path, "Style stored");

        Ok(path)
    }
}

fn processed_metadata(attachment: &Attachment) -> AttachmentResult<ProcessedMetadata> {
    attachment
        .metadata()
        .ok_or_else(|| AttachmentError::from(ValidationErrors::base(UNPROCESSED)))
}

/// Every path a processed attachment may own: published snapshot plus current configuration
pub(crate) fn owned_paths(
    keys: &KeyDeriver,
    styles: &StyleRegistry,
    attachment: &Attachment,
) -> BTreeSet<String> {
    let (Some(id), Some(extension)) = (attachment.id, attachment.extension.as_deref()) else {
        return BTreeSet::new();
    };
    let published = StyleSet::from_configs(&attachment.applied_styles);
    let current = styles.resolve(&attachment.owner_type, &attachment.owner_attribute);

    let mut paths: BTreeSet<String> = keys.derive_all(id, &published, extension).into_values().collect();
    paths.extend(keys.derive_all(id, &current, extension).into_values());
    paths
}

/// Published style name to path
pub(crate) fn published_paths(keys: &KeyDeriver, attachment: &Attachment) -> BTreeMap<String, String> {
    match (attachment.id, attachment.extension.as_deref()) {
        (Some(id), Some(extension)) if attachment.is_processed() => keys.derive_all(
            id,
            &StyleSet::from_configs(&attachment.applied_styles),
            extension,
        ),
        _ => BTreeMap::new(),
    }
}

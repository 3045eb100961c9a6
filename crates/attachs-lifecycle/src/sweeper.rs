//! Lifecycle Sweeper
//!
//! Reclaims what normal traffic leaves behind: attachments never attached
//! within the retention window, and stored objects no processed attachment
//! references anymore. The trigger lives outside the engine.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use attachs_core::{AttachsConfig, Id};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::AttachmentResult;
use crate::keys::StoredKey;
use crate::model::Attachment;
use crate::service::AttachmentService;
use crate::storage::{StorageBackend, StoredObject};
use crate::store::AttachmentStore;

/// Outcome of a sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Unattached attachments destroyed
    pub destroyed: usize,
    /// Candidates attached or removed since they were listed
    pub skipped: usize,
    /// Orphaned storage objects deleted
    pub reclaimed: usize,
}

pub struct LifecycleSweeper<St: AttachmentStore, S: StorageBackend> {
    service: Arc<AttachmentService<St, S>>,
    retention: Duration,
}

impl<St: AttachmentStore, S: StorageBackend> LifecycleSweeper<St, S> {
    pub fn new(service: Arc<AttachmentService<St, S>>, config: &AttachsConfig) -> Self {
        Self {
            service,
            retention: config.retention(),
        }
    }

    /// Oldest instant still inside the window; `None` when the window
    /// reaches past the representable range, so nothing is eligible
    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| now.checked_sub_signed(retention))
    }

    fn store(&self) -> &Arc<St> {
        self.service.processor().store()
    }

    fn storage(&self) -> &Arc<S> {
        self.service.processor().storage()
    }

    /// Unattached attachments past the retention window
    pub async fn expired(&self, now: DateTime<Utc>) -> AttachmentResult<Vec<Attachment>> {
        let Some(cutoff) = self.cutoff(now) else {
            debug!(retention = ?self.retention, "Retention window unbounded, nothing expired");
            return Ok(Vec::new());
        };
        self.store().find_unattached_older_than(cutoff).await
    }

    /// Destroy unattached attachments past the retention window
    ///
    /// Each candidate is re-read and deleted only while still unattached, so
    /// an attachment attached after listing survives.
    #[instrument(skip(self))]
    pub async fn sweep_unattached(&self, now: DateTime<Utc>) -> AttachmentResult<SweepReport> {
        let mut report = SweepReport::default();

        for candidate in self.expired(now).await? {
            let Some(id) = candidate.id else { continue };

            let current = match self.store().get(id).await? {
                Some(current) if current.is_unattached() => current,
                _ => {
                    debug!(id = id, "Sweep candidate attached or gone");
                    report.skipped += 1;
                    continue;
                }
            };

            if !self.store().delete_unattached(id).await? {
                report.skipped += 1;
                continue;
            }

            self.service.release(&current).await;
            report.destroyed += 1;
        }

        info!(
            destroyed = report.destroyed,
            skipped = report.skipped,
            "Unattached attachments swept"
        );
        Ok(report)
    }

    /// Stored objects past the retention window that nothing references
    pub async fn orphans(&self, now: DateTime<Utc>) -> AttachmentResult<Vec<StoredObject>> {
        let keys = self.service.processor().keys();
        let Some(cutoff) = self.cutoff(now) else {
            return Ok(Vec::new());
        };
        let objects = self.storage().list(&keys.prefixed("")).await?;

        let mut records: HashMap<Id, Option<Attachment>> = HashMap::new();
        let mut orphans = Vec::new();

        for object in objects {
            if object.last_modified >= cutoff {
                continue;
            }
            // default assets and foreign files
            let Some(key) = keys.parse(&object.path) else {
                continue;
            };

            let id = key.attachment_id();
            if !records.contains_key(&id) {
                let record = self.store().get(id).await?;
                records.insert(id, record);
            }

            let orphaned = match (key, records.get(&id).and_then(Option::as_ref)) {
                (_, None) => true,
                (StoredKey::Staging(_), Some(attachment)) => attachment.is_processed(),
                (StoredKey::Style(_), Some(attachment)) => {
                    attachment.is_processed()
                        && !self.service.stored_paths(attachment).contains(&object.path)
                }
            };
            if orphaned {
                orphans.push(object);
            }
        }

        Ok(orphans)
    }

    /// Delete orphaned storage objects
    #[instrument(skip(self))]
    pub async fn reclaim_orphans(&self, now: DateTime<Utc>) -> AttachmentResult<usize> {
        let mut reclaimed = 0;
        for object in self.orphans(now).await? {
            match self.storage().delete(&object.path).await {
                Ok(()) => reclaimed += 1,
                Err(e) => warn!(path = %object.path, error = %e, "Failed to reclaim orphan"),
            }
        }

        info!(reclaimed = reclaimed, "Orphaned objects reclaimed");
        Ok(reclaimed)
    }

    /// Sweep unattached attachments, then reclaim orphans
    pub async fn run(&self, now: DateTime<Utc>) -> AttachmentResult<SweepReport> {
        let mut report = self.sweep_unattached(now).await?;
        report.reclaimed = self.reclaim_orphans(now).await?;
        Ok(report)
    }
}

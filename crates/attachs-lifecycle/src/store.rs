//! Attachment persistence contract
//!
//! Writes go through optimistic concurrency: `update` succeeds only when the
//! stored `lock_version` equals the one the caller read, and bumps it.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use attachs_core::{Id, Lockable};
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{AttachmentError, AttachmentResult};
use crate::model::Attachment;

/// Attachment store trait
#[async_trait]
pub trait AttachmentStore: Send + Sync {
    /// Insert a new record, assigning its id
    async fn create(&self, attachment: &mut Attachment) -> AttachmentResult<Id>;

    /// Get an attachment by ID
    async fn get(&self, id: Id) -> AttachmentResult<Option<Attachment>>;

    /// Compare-and-swap write; returns the stored record with its new lock version
    async fn update(&self, attachment: &Attachment) -> AttachmentResult<Attachment>;

    /// Delete a record; `false` when it was already gone
    async fn delete(&self, id: Id) -> AttachmentResult<bool>;

    /// Delete only if still unattached; `false` when attached or gone
    async fn delete_unattached(&self, id: Id) -> AttachmentResult<bool>;

    /// Unattached records requested before `cutoff`
    async fn find_unattached_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> AttachmentResult<Vec<Attachment>>;

    /// Every processed record
    async fn find_processed(&self) -> AttachmentResult<Vec<Attachment>>;

    /// Records held by an owner, optionally narrowed to one slot
    async fn find_for_owner(
        &self,
        owner_type: &str,
        owner_id: Id,
        owner_attribute: Option<&str>,
    ) -> AttachmentResult<Vec<Attachment>>;
}

/// In-memory attachment store for testing
pub struct MemoryAttachmentStore {
    attachments: RwLock<Vec<Attachment>>,
    next_id: AtomicI64,
}

impl Default for MemoryAttachmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAttachmentStore {
    pub fn new() -> Self {
        Self {
            attachments: RwLock::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub async fn len(&self) -> usize {
        self.attachments.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.attachments.read().await.is_empty()
    }
}

#[async_trait]
impl AttachmentStore for MemoryAttachmentStore {
    async fn create(&self, attachment: &mut Attachment) -> AttachmentResult<Id> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        attachment.id = Some(id);
        attachment.lock_version = 0;

        let mut attachments = self.attachments.write().await;
        attachments.push(attachment.clone());

        Ok(id)
    }

    async fn get(&self, id: Id) -> AttachmentResult<Option<Attachment>> {
        let attachments = self.attachments.read().await;
        Ok(attachments.iter().find(|a| a.id == Some(id)).cloned())
    }

    async fn update(&self, attachment: &Attachment) -> AttachmentResult<Attachment> {
        let id = attachment
            .id
            .ok_or_else(|| AttachmentError::Database("update of unsaved attachment".to_string()))?;

        let mut attachments = self.attachments.write().await;
        let stored = attachments
            .iter_mut()
            .find(|a| a.id == Some(id))
            .ok_or(AttachmentError::NotFound(id))?;

        if stored.lock_version != attachment.lock_version {
            return Err(AttachmentError::Conflict {
                id,
                lock_version: attachment.lock_version,
            });
        }

        let mut updated = attachment.clone();
        updated.lock_version = attachment.next_lock_version();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn delete(&self, id: Id) -> AttachmentResult<bool> {
        let mut attachments = self.attachments.write().await;
        let before = attachments.len();
        attachments.retain(|a| a.id != Some(id));
        Ok(attachments.len() != before)
    }

    async fn delete_unattached(&self, id: Id) -> AttachmentResult<bool> {
        let mut attachments = self.attachments.write().await;
        let before = attachments.len();
        attachments.retain(|a| a.id != Some(id) || a.is_attached());
        Ok(attachments.len() != before)
    }

    async fn find_unattached_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> AttachmentResult<Vec<Attachment>> {
        let attachments = self.attachments.read().await;
        Ok(attachments
            .iter()
            .filter(|a| a.is_unattached() && a.requested_at < cutoff)
            .cloned()
            .collect())
    }

    async fn find_processed(&self) -> AttachmentResult<Vec<Attachment>> {
        let attachments = self.attachments.read().await;
        Ok(attachments
            .iter()
            .filter(|a| a.is_processed())
            .cloned()
            .collect())
    }

    async fn find_for_owner(
        &self,
        owner_type: &str,
        owner_id: Id,
        owner_attribute: Option<&str>,
    ) -> AttachmentResult<Vec<Attachment>> {
        let attachments = self.attachments.read().await;
        Ok(attachments
            .iter()
            .filter(|a| {
                a.owner_type == owner_type
                    && a.owner_id == Some(owner_id)
                    && owner_attribute.map_or(true, |attr| a.owner_attribute == attr)
            })
            .cloned()
            .collect())
    }
}

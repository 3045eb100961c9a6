//! Processing observers
//!
//! Observers are notified before and after the style write phase. They can
//! neither veto nor fail processing: their errors are logged and dropped.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::warn;

use crate::model::Attachment;

#[async_trait]
pub trait ProcessingObserver: Send + Sync {
    /// Called with the raw upload before any style is written
    async fn before_process(&self, _attachment: &Attachment, _source: &Bytes) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once every style is stored, before the state flip
    async fn after_process(&self, _attachment: &Attachment, _paths: &[String]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ordered observer list
#[derive(Clone, Default)]
pub struct Observers {
    observers: Vec<Arc<dyn ProcessingObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn ProcessingObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub(crate) async fn before(&self, attachment: &Attachment, source: &Bytes) {
        for (index, observer) in self.observers.iter().enumerate() {
            if let Err(e) = observer.before_process(attachment, source).await {
                warn!(id = ?attachment.id, observer = index, error = %e, "before_process observer failed");
            }
        }
    }

    pub(crate) async fn after(&self, attachment: &Attachment, paths: &[String]) {
        for (index, observer) in self.observers.iter().enumerate() {
            if let Err(e) = observer.after_process(attachment, paths).await {
                warn!(id = ?attachment.id, observer = index, error = %e, "after_process observer failed");
            }
        }
    }
}

//! # attachs-lifecycle
//!
//! Attachment lifecycle engine for Attachs RS.
//!
//! ## Features
//!
//! - `uploading -> processing -> processed` state machine
//! - Deterministic storage paths (content hash or obfuscated style names)
//! - Style resolution from an owner registry plus global styles
//! - Storage abstraction (local filesystem, in-memory)
//! - Processing with write-then-publish ordering, reprocessing and repair
//! - Sweeping of unattached attachments and orphaned objects
//!
//! ## Example
//!
//! ```rust,ignore
//! use attachs_lifecycle::*;
//! use std::sync::Arc;
//!
//! let config = attachs_core::AttachsConfig::default();
//! let processor = AttachmentProcessor::new(
//!     Arc::new(MemoryAttachmentStore::new()),
//!     Arc::new(MemoryStorage::new()),
//!     Arc::new(PassthroughTransformer),
//!     KeyDeriver::from_config(&config),
//!     StyleRegistry::new(Arc::new(registry), &config),
//! );
//! let service = AttachmentService::new(Arc::new(processor), &config);
//!
//! let attachment = service
//!     .upload_and_process(NewUpload::new("User", "avatar", "me.png", data))
//!     .await?;
//! let attachment = service.attach(attachment.id.unwrap(), user_id).await?;
//! let thumb_url = service.url(&attachment, Some("thumb"));
//! ```

pub mod describe;
pub mod error;
pub mod hooks;
pub mod inspect;
pub mod keys;
pub mod model;
pub mod processor;
pub mod service;
pub mod storage;
pub mod store;
pub mod styles;
pub mod sweeper;
pub mod transform;

pub use describe::{DescriptionCatalog, Describer, Interpolations, OwnerRecord, StaticCatalog};
pub use error::{AttachmentError, AttachmentResult};
pub use hooks::{Observers, ProcessingObserver};
pub use inspect::inspect;
pub use keys::{KeyDeriver, StoredKey};
pub use model::{Attachment, AttachmentState, NewUpload, ProcessedMetadata};
pub use processor::{AttachmentProcessor, BatchReport, ReprocessReport};
pub use service::AttachmentService;
pub use storage::{
    FileMetadata, LocalStorage, MemoryStorage, StorageBackend, StorageError, StorageResult,
    StoredObject, UrlOptions,
};
pub use store::{AttachmentStore, MemoryAttachmentStore};
pub use styles::{
    AttachableRegistry, OwnerRef, SlotOptions, StaticRegistry, StyleRegistry, StyleSet, StyleSpec,
    ORIGINAL,
};
pub use sweeper::{LifecycleSweeper, SweepReport};
pub use transform::{PassthroughTransformer, TransformError, Transformer};

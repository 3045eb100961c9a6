//! # attachs-db
//!
//! Database layer for Attachs RS.
//!
//! This crate provides PostgreSQL persistence for attachment records using SQLx:
//!
//! - Connection pool management and embedded migrations
//! - `PgAttachmentStore`, an `AttachmentStore` with compare-and-swap updates
//!
//! ## Example
//!
//! ```ignore
//! use attachs_db::{Database, DatabaseConfig, PgAttachmentStore};
//!
//! let db = Database::connect(&DatabaseConfig::from_env()).await?;
//! db.migrate().await?;
//!
//! let store = PgAttachmentStore::new(db.pool().clone());
//! let attachment = store.get(1).await?;
//! ```

pub mod attachments;
pub mod pool;
pub mod repository;

// Re-exports
pub use attachments::{AttachmentRow, PgAttachmentStore};
pub use pool::{Database, DatabaseConfig};
pub use repository::{RepositoryError, RepositoryResult};

//! # attachs-core
//!
//! Core types, traits, and utilities for Attachs RS.
//!
//! This crate provides the foundational building blocks used by the other crates:
//! - Validation errors and the error taxonomy (`ErrorKind`)
//! - Core traits (Identifiable, Lockable)
//! - Process-wide configuration (`AttachsConfig`)

pub mod config;
pub mod error;
pub mod traits;

pub use config::{AttachsConfig, ConfigError, KeyStrategy, StorageSettings};
pub use error::*;
pub use traits::*;

//! Core error types for Attachs RS
//!
//! `ValidationErrors` collects field and base messages the way the owning
//! record layer reports them; `ErrorKind` is the taxonomy every layer maps
//! its own errors onto.

use std::collections::HashMap;

/// Base error raised when an attachment is attached before it is processed
pub const UNPROCESSED: &str = "unprocessed";
/// Field error for classification values the owner registry rejects
pub const INVALID: &str = "invalid";
/// Field error for classification changes after attaching
pub const IMMUTABLE: &str = "immutable";
pub const BLANK: &str = "can't be blank";
pub const NOT_POSITIVE: &str = "must be greater than 0";
pub const ALREADY_ATTACHED: &str = "already attached";

/// Validation errors collection
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ValidationErrors {
    /// Field-specific errors: field_name -> Vec<error_messages>
    pub errors: HashMap<String, Vec<String>>,
    /// Base errors not tied to a specific field
    pub base_errors: Vec<String>,
}

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single base error
    pub fn base(message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add_base(message);
        errors
    }

    /// Single field error
    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = Self::new();
        errors.add(field, message);
        errors
    }

    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors
            .entry(field.into())
            .or_default()
            .push(message.into());
    }

    pub fn add_base(&mut self, message: impl Into<String>) {
        self.base_errors.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty() && self.base_errors.is_empty()
    }

    /// Check if there are errors for a specific field
    pub fn has_error(&self, field: &str) -> bool {
        self.errors.contains_key(field)
    }

    /// Check if a base error with the given message was recorded
    pub fn has_base(&self, message: &str) -> bool {
        self.base_errors.iter().any(|m| m == message)
    }

    /// Get errors for a specific field
    pub fn get(&self, field: &str) -> Option<&Vec<String>> {
        self.errors.get(field)
    }

    pub fn merge(&mut self, other: ValidationErrors) {
        for (field, messages) in other.errors {
            self.errors.entry(field).or_default().extend(messages);
        }
        self.base_errors.extend(other.base_errors);
    }

    pub fn full_messages(&self) -> Vec<String> {
        let mut messages = self.base_errors.clone();
        let mut fields: Vec<_> = self.errors.iter().collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        for (field, field_messages) in fields {
            for msg in field_messages {
                messages.push(format!("{} {}", field, msg));
            }
        }
        messages
    }

    /// `Ok(())` when nothing was recorded
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation errors: {}", self.full_messages().join(", "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Error taxonomy shared across the crates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid classification, unprocessed attach, malformed metadata
    Validation,
    /// Style generation failed
    Transform,
    /// Storage or database unavailable
    Io,
    /// Requested record, style, or path is absent
    NotFound,
    /// Optimistic lock lost to a concurrent writer
    Conflict,
    Config,
    Internal,
}

impl ErrorKind {
    /// Whether the operation may be retried without caller changes
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transform | Self::Io | Self::Conflict)
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation => "validation_failed",
            Self::Transform => "transform_failed",
            Self::Io => "io_error",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Config => "configuration_error",
            Self::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

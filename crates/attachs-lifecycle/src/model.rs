//! Attachment Model
//!
//! The attachment entity and its `uploading -> processing -> processed`
//! state machine. Transitions never skip a state and never move backward.

use std::collections::BTreeMap;

use attachs_core::{
    Id, Identifiable, Lockable, ValidationErrors, ALREADY_ATTACHED, BLANK, IMMUTABLE, INVALID,
    NOT_POSITIVE, UNPROCESSED,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AttachmentError, AttachmentResult};
use crate::styles::{AttachableRegistry, OwnerRef};

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Uploading,
    Processing,
    Processed,
}

impl AttachmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploading => "uploading",
            Self::Processing => "processing",
            Self::Processed => "processed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "uploading" => Some(Self::Uploading),
            "processing" => Some(Self::Processing),
            "processed" => Some(Self::Processed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Metadata derived from the upload by inspection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMetadata {
    pub content_type: String,
    pub extension: String,
    pub size_bytes: i64,
}

impl ProcessedMetadata {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if self.content_type.is_empty() {
            errors.add("content_type", BLANK);
        }
        if self.extension.is_empty() {
            errors.add("extension", BLANK);
        }
        if self.size_bytes <= 0 {
            errors.add("size_bytes", NOT_POSITIVE);
        }
        errors.into_result()
    }
}

/// An attachment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment ID, assigned by the store
    pub id: Option<Id>,
    /// Type name of the record it belongs (or will belong) to
    pub owner_type: String,
    /// Owning record, unset while unattached
    pub owner_id: Option<Id>,
    /// Slot on the owner type
    pub owner_attribute: String,
    pub state: AttachmentState,
    /// Filename declared by the uploader, informational only
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub extension: Option<String>,
    pub size_bytes: Option<i64>,
    pub requested_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    /// Style configuration the stored variants were generated with
    pub applied_styles: BTreeMap<String, Value>,
    /// Free-form metadata
    pub extras: BTreeMap<String, Value>,
    pub lock_version: i32,
}

impl Attachment {
    /// Create a new attachment in the `uploading` state
    pub fn new(owner_type: impl Into<String>, owner_attribute: impl Into<String>) -> Self {
        Self {
            id: None,
            owner_type: owner_type.into(),
            owner_id: None,
            owner_attribute: owner_attribute.into(),
            state: AttachmentState::Uploading,
            filename: None,
            content_type: None,
            extension: None,
            size_bytes: None,
            requested_at: Utc::now(),
            processed_at: None,
            applied_styles: BTreeMap::new(),
            extras: BTreeMap::new(),
            lock_version: 0,
        }
    }

    pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    pub fn is_uploading(&self) -> bool {
        self.state == AttachmentState::Uploading
    }

    pub fn is_processing(&self) -> bool {
        self.state == AttachmentState::Processing
    }

    pub fn is_processed(&self) -> bool {
        self.state == AttachmentState::Processed
    }

    pub fn is_unprocessed(&self) -> bool {
        !self.is_processed()
    }

    /// Bytes have been received
    pub fn is_uploaded(&self) -> bool {
        !self.is_uploading()
    }

    pub fn is_attached(&self) -> bool {
        self.owner_id.is_some()
    }

    pub fn is_unattached(&self) -> bool {
        !self.is_attached()
    }

    pub fn owner(&self) -> OwnerRef {
        OwnerRef {
            owner_type: self.owner_type.clone(),
            owner_id: self.owner_id,
            owner_attribute: self.owner_attribute.clone(),
        }
    }

    /// Derived metadata, authoritative only once processed
    pub fn metadata(&self) -> Option<ProcessedMetadata> {
        if !self.is_processed() {
            return None;
        }
        Some(ProcessedMetadata {
            content_type: self.content_type.clone()?,
            extension: self.extension.clone()?,
            size_bytes: self.size_bytes?,
        })
    }

    /// `uploading -> processing`; a retry from `processing` is a no-op
    pub fn begin_processing(&mut self) -> AttachmentResult<()> {
        match self.state {
            AttachmentState::Uploading => {
                self.state = AttachmentState::Processing;
                Ok(())
            }
            AttachmentState::Processing => Ok(()),
            AttachmentState::Processed => Err(self.invalid_transition(AttachmentState::Processing)),
        }
    }

    /// `processing -> processed`, setting metadata and `processed_at` once
    pub fn mark_processed(
        &mut self,
        metadata: ProcessedMetadata,
        applied_styles: BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> AttachmentResult<()> {
        if self.state != AttachmentState::Processing {
            return Err(self.invalid_transition(AttachmentState::Processed));
        }
        metadata.validate()?;

        // Worker clocks may lag the one that stamped requested_at
        let floor = self.requested_at + Duration::microseconds(1);
        self.processed_at = Some(now.max(floor));
        self.content_type = Some(metadata.content_type);
        self.extension = Some(metadata.extension);
        self.size_bytes = Some(metadata.size_bytes);
        self.applied_styles = applied_styles;
        self.state = AttachmentState::Processed;
        Ok(())
    }

    /// Record the configuration of a reprocessed style set
    pub fn restyle(&mut self, applied_styles: BTreeMap<String, Value>) -> AttachmentResult<()> {
        if !self.is_processed() {
            return Err(self.invalid_transition(AttachmentState::Processed));
        }
        self.applied_styles = applied_styles;
        Ok(())
    }

    /// Bind to an owner; only processed, unattached attachments qualify
    pub fn attach_to(&mut self, owner_id: Id) -> Result<(), ValidationErrors> {
        if self.is_attached() {
            return Err(ValidationErrors::field("owner_id", ALREADY_ATTACHED));
        }
        if !self.is_processed() {
            return Err(ValidationErrors::base(UNPROCESSED));
        }
        self.owner_id = Some(owner_id);
        Ok(())
    }

    /// Change classification; rejected once attached
    pub fn set_classification(
        &mut self,
        owner_type: impl Into<String>,
        owner_attribute: impl Into<String>,
    ) -> Result<(), ValidationErrors> {
        let owner_type = owner_type.into();
        let owner_attribute = owner_attribute.into();

        if self.is_attached() {
            let mut errors = ValidationErrors::new();
            if owner_type != self.owner_type {
                errors.add("owner_type", IMMUTABLE);
            }
            if owner_attribute != self.owner_attribute {
                errors.add("owner_attribute", IMMUTABLE);
            }
            return errors.into_result();
        }

        self.owner_type = owner_type;
        self.owner_attribute = owner_attribute;
        Ok(())
    }

    /// Full record validation against the owner registry
    pub fn validate(&self, registry: &dyn AttachableRegistry) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.owner_type.is_empty() {
            errors.add("owner_type", BLANK);
        } else if !registry.is_attachable(&self.owner_type) {
            errors.add("owner_type", INVALID);
        }

        if self.owner_attribute.is_empty() {
            errors.add("owner_attribute", BLANK);
        } else if !registry.has_slot(&self.owner_type, &self.owner_attribute) {
            errors.add("owner_attribute", INVALID);
        }

        if self.is_attached() && !self.is_processed() {
            errors.add_base(UNPROCESSED);
        }

        if self.is_processed() {
            if self.content_type.as_deref().map_or(true, str::is_empty) {
                errors.add("content_type", BLANK);
            }
            if self.extension.as_deref().map_or(true, str::is_empty) {
                errors.add("extension", BLANK);
            }
            match self.size_bytes {
                None => errors.add("size_bytes", BLANK),
                Some(size) if size <= 0 => errors.add("size_bytes", NOT_POSITIVE),
                Some(_) => {}
            }
            match self.processed_at {
                None => errors.add("processed_at", BLANK),
                Some(at) if at <= self.requested_at => {
                    errors.add("processed_at", "must be after requested_at")
                }
                Some(_) => {}
            }
        }

        errors.into_result()
    }

    /// Look up a free-form metadata entry
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extras.insert(key.into(), value);
    }

    fn invalid_transition(&self, to: AttachmentState) -> AttachmentError {
        AttachmentError::InvalidState {
            id: self.id,
            from: self.state,
            to,
        }
    }
}

impl Identifiable for Attachment {
    fn id(&self) -> Option<Id> {
        self.id
    }
}

impl Lockable for Attachment {
    fn lock_version(&self) -> i32 {
        self.lock_version
    }
}

/// Parameters for registering an upload
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub owner_type: String,
    pub owner_attribute: String,
    pub filename: String,
    pub data: bytes::Bytes,
}

impl NewUpload {
    pub fn new(
        owner_type: impl Into<String>,
        owner_attribute: impl Into<String>,
        filename: impl Into<String>,
        data: impl Into<bytes::Bytes>,
    ) -> Self {
        Self {
            owner_type: owner_type.into(),
            owner_attribute: owner_attribute.into(),
            filename: filename.into(),
            data: data.into(),
        }
    }
}

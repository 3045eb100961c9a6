//! Style configuration
//!
//! Owner types declare attachment slots and per-slot styles through an
//! [`AttachableRegistry`]; the [`StyleRegistry`] merges those with the global
//! style set into the [`StyleSet`] a given attachment is processed with.

use std::collections::BTreeMap;
use std::sync::Arc;

use attachs_core::{AttachsConfig, Id};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Name of the implicit style holding the upload itself
pub const ORIGINAL: &str = "original";

/// A named variant of the upload and its transform parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleSpec {
    pub name: String,
    /// Opaque to the engine, interpreted by the transformer
    pub config: Value,
}

impl StyleSpec {
    pub fn new(name: impl Into<String>, config: Value) -> Self {
        Self {
            name: name.into(),
            config,
        }
    }

    pub fn original() -> Self {
        Self::new(ORIGINAL, Value::Null)
    }

    pub fn is_original(&self) -> bool {
        self.name == ORIGINAL
    }
}

/// Ordered set of styles, `original` always first
#[derive(Debug, Clone, PartialEq)]
pub struct StyleSet {
    styles: Vec<StyleSpec>,
}

impl StyleSet {
    /// Build from configured styles; `original` is added and never overridden
    pub fn from_configs(configs: &BTreeMap<String, Value>) -> Self {
        let mut styles = vec![StyleSpec::original()];
        styles.extend(
            configs
                .iter()
                .filter(|(name, _)| name.as_str() != ORIGINAL)
                .map(|(name, config)| StyleSpec::new(name.clone(), config.clone())),
        );
        Self { styles }
    }

    /// Snapshot of the configuration, without the implicit `original`
    pub fn configs(&self) -> BTreeMap<String, Value> {
        self.styles
            .iter()
            .filter(|s| !s.is_original())
            .map(|s| (s.name.clone(), s.config.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StyleSpec> {
        self.styles.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.styles.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&StyleSpec> {
        self.styles.iter().find(|s| s.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.styles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.styles.is_empty()
    }
}

/// Per-slot options declared by an owner type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotOptions {
    pub styles: BTreeMap<String, Value>,
    pub default_path: Option<String>,
    pub private: bool,
}

impl SlotOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn style(mut self, name: impl Into<String>, config: Value) -> Self {
        self.styles.insert(name.into(), config);
        self
    }

    pub fn default_path(mut self, path: impl Into<String>) -> Self {
        self.default_path = Some(path.into());
        self
    }

    pub fn private(mut self) -> Self {
        self.private = true;
        self
    }
}

/// Polymorphic reference to the record holding an attachment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    pub owner_type: String,
    pub owner_id: Option<Id>,
    pub owner_attribute: String,
}

/// Owning-record collaborator: which types may hold attachments and how
pub trait AttachableRegistry: Send + Sync {
    /// Whether the type declares itself attachable
    fn is_attachable(&self, owner_type: &str) -> bool;

    /// Attachment-bearing attribute names of the type
    fn attachment_slots(&self, owner_type: &str) -> Vec<String>;

    /// Options of one slot, `None` when the slot is not declared
    fn slot_options(&self, owner_type: &str, attribute: &str) -> Option<SlotOptions>;

    fn has_slot(&self, owner_type: &str, attribute: &str) -> bool {
        self.attachment_slots(owner_type)
            .iter()
            .any(|slot| slot == attribute)
    }

    /// Invalidation hook called after an owner's attachment was rewritten
    fn touch(&self, _owner: &OwnerRef) {}
}

/// Registry declared up front, e.g. from a YAML file
///
/// ```yaml
/// User:
///   avatar:
///     styles:
///       thumb: { width: 100, height: 100 }
///     default_path: "missing/:style.png"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticRegistry {
    types: BTreeMap<String, BTreeMap<String, SlotOptions>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a slot (and implicitly its owner type)
    pub fn with_slot(
        mut self,
        owner_type: impl Into<String>,
        attribute: impl Into<String>,
        options: SlotOptions,
    ) -> Self {
        self.types
            .entry(owner_type.into())
            .or_default()
            .insert(attribute.into(), options);
        self
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(raw)
    }
}

impl AttachableRegistry for StaticRegistry {
    fn is_attachable(&self, owner_type: &str) -> bool {
        self.types.contains_key(owner_type)
    }

    fn attachment_slots(&self, owner_type: &str) -> Vec<String> {
        self.types
            .get(owner_type)
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn slot_options(&self, owner_type: &str, attribute: &str) -> Option<SlotOptions> {
        self.types.get(owner_type)?.get(attribute).cloned()
    }

    fn touch(&self, owner: &OwnerRef) {
        debug!(
            owner_type = %owner.owner_type,
            owner_id = ?owner.owner_id,
            "Owner touched"
        );
    }
}

/// Resolves the style set and fallbacks of a slot
#[derive(Clone)]
pub struct StyleRegistry {
    registry: Arc<dyn AttachableRegistry>,
    global_styles: BTreeMap<String, Value>,
    default_path: Option<String>,
}

impl StyleRegistry {
    pub fn new(registry: Arc<dyn AttachableRegistry>, config: &AttachsConfig) -> Self {
        Self {
            registry,
            global_styles: config.global_styles.clone(),
            default_path: config.default_path.clone(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn AttachableRegistry> {
        &self.registry
    }

    /// Global styles merged with the slot's own; the slot wins on name clashes
    pub fn resolve(&self, owner_type: &str, attribute: &str) -> StyleSet {
        let mut configs = self.global_styles.clone();
        if let Some(options) = self.registry.slot_options(owner_type, attribute) {
            configs.extend(options.styles);
        }
        StyleSet::from_configs(&configs)
    }

    /// Slot default path, else the global one
    pub fn default_path(&self, owner_type: &str, attribute: &str) -> Option<String> {
        self.registry
            .slot_options(owner_type, attribute)
            .and_then(|options| options.default_path)
            .or_else(|| self.default_path.clone())
    }

    pub fn is_private(&self, owner_type: &str, attribute: &str) -> bool {
        self.registry
            .slot_options(owner_type, attribute)
            .map(|options| options.private)
            .unwrap_or(false)
    }
}

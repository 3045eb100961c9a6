//! Human-readable attachment descriptions
//!
//! Templates are looked up per `(owner_type, owner_attribute)` and may carry
//! `%{name}` placeholders. Each placeholder is answered by a registered
//! interpolation, else by the owner's attribute of that name, else dropped.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};

use crate::model::Attachment;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"%\{([^}]+)\}").expect("valid placeholder pattern"));

/// The owning record, as far as descriptions need it
pub trait OwnerRecord: Send + Sync {
    fn attribute(&self, name: &str) -> Option<String>;
}

/// Source of description templates
pub trait DescriptionCatalog: Send + Sync {
    fn template(&self, owner_type: &str, owner_attribute: &str) -> Option<String>;
}

/// Catalog held in memory
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    templates: HashMap<(String, String), String>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        owner_type: impl Into<String>,
        owner_attribute: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        self.templates
            .insert((owner_type.into(), owner_attribute.into()), template.into());
        self
    }
}

impl DescriptionCatalog for StaticCatalog {
    fn template(&self, owner_type: &str, owner_attribute: &str) -> Option<String> {
        self.templates
            .get(&(owner_type.to_string(), owner_attribute.to_string()))
            .cloned()
    }
}

pub type Interpolation = Arc<dyn Fn(&dyn OwnerRecord) -> Option<String> + Send + Sync>;

/// Named interpolations
#[derive(Clone, Default)]
pub struct Interpolations {
    entries: HashMap<String, Interpolation>,
}

impl Interpolations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&dyn OwnerRecord) -> Option<String> + Send + Sync + 'static,
    {
        self.entries.insert(name.into(), Arc::new(f));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn resolve(&self, name: &str, owner: &dyn OwnerRecord) -> Option<String> {
        match self.entries.get(name) {
            Some(f) => f(owner),
            None => owner.attribute(name),
        }
    }
}

/// Builds descriptions from a catalog and interpolations
#[derive(Clone)]
pub struct Describer {
    catalog: Arc<dyn DescriptionCatalog>,
    interpolations: Interpolations,
}

impl Describer {
    pub fn new(catalog: Arc<dyn DescriptionCatalog>, interpolations: Interpolations) -> Self {
        Self {
            catalog,
            interpolations,
        }
    }

    /// `None` while unattached or when no template exists
    pub fn describe(&self, attachment: &Attachment, owner: &dyn OwnerRecord) -> Option<String> {
        if attachment.is_unattached() {
            return None;
        }
        let template = self
            .catalog
            .template(&attachment.owner_type, &attachment.owner_attribute)?;

        let rendered = PLACEHOLDER.replace_all(&template, |caps: &Captures| {
            self.interpolations
                .resolve(&caps[1], owner)
                .unwrap_or_default()
        });
        Some(rendered.into_owned())
    }
}

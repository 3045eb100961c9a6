//! Storage key derivation
//!
//! Paths are pure functions of the attachment id, the style and (for the
//! content-hash strategy) the style configuration. Nothing here touches
//! storage or keeps state, so two derivations with the same inputs always
//! agree.
//!
//! Layout under the configured prefix:
//! - `{prefix}/staging/{id}` raw upload awaiting processing
//! - `{prefix}/{id}/{segment}.{extension}` one object per style

use std::collections::BTreeMap;

use attachs_core::{AttachsConfig, Id, KeyStrategy};
use sha2::{Digest, Sha256};

use crate::styles::{StyleSet, StyleSpec};

const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const CIPHER: &[u8; 36] = b"8kluw1mtri2xncsp649obvezgd57qy3fj0ah";

const STAGING_DIR: &str = "staging";

/// Width of a base36-encoded u128
const DIGEST_WIDTH: usize = 25;

/// What a stored path belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredKey {
    /// Raw upload of an attachment
    Staging(Id),
    /// A style variant of an attachment
    Style(Id),
}

impl StoredKey {
    pub fn attachment_id(&self) -> Id {
        match self {
            Self::Staging(id) | Self::Style(id) => *id,
        }
    }
}

/// Computes storage paths for attachments and their styles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDeriver {
    strategy: KeyStrategy,
    prefix: Option<String>,
}

impl KeyDeriver {
    pub fn new(strategy: KeyStrategy, prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
            .map(str::to_string);
        Self { strategy, prefix }
    }

    pub fn from_config(config: &AttachsConfig) -> Self {
        Self::new(config.key_strategy, config.prefix.as_deref())
    }

    pub fn strategy(&self) -> KeyStrategy {
        self.strategy
    }

    /// Namespace a relative path
    pub fn prefixed(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, path),
            None => path.to_string(),
        }
    }

    /// Where the raw upload waits for processing
    pub fn staging_path(&self, id: Id) -> String {
        self.prefixed(&format!("{}/{}", STAGING_DIR, id))
    }

    /// Final path segment (without extension) for a style
    pub fn style_segment(&self, id: Id, style: &StyleSpec) -> String {
        match self.strategy {
            KeyStrategy::Obfuscated => obfuscate(&style.name),
            KeyStrategy::ContentHash => content_digest(id, style),
        }
    }

    /// Path of one style
    pub fn derive(&self, id: Id, style: &StyleSpec, extension: &str) -> String {
        let segment = self.style_segment(id, style);
        let file = if extension.is_empty() {
            segment
        } else {
            format!("{}.{}", segment, extension)
        };
        self.prefixed(&format!("{}/{}", id, file))
    }

    /// Paths of every style in the set, keyed by style name
    pub fn derive_all(&self, id: Id, styles: &StyleSet, extension: &str) -> BTreeMap<String, String> {
        styles
            .iter()
            .map(|style| (style.name.clone(), self.derive(id, style, extension)))
            .collect()
    }

    /// Fallback asset path with `:style` substituted
    pub fn default_path(&self, template: &str, style: &str) -> String {
        self.prefixed(&template.replace(":style", style))
    }

    /// Attribute a stored path to its attachment, `None` for foreign paths
    pub fn parse(&self, path: &str) -> Option<StoredKey> {
        let relative = match &self.prefix {
            Some(prefix) => path.strip_prefix(prefix.as_str())?.strip_prefix('/')?,
            None => path,
        };

        let mut parts = relative.split('/');
        let first = parts.next()?;
        let second = parts.next()?;
        if parts.next().is_some() || second.is_empty() {
            return None;
        }

        if first == STAGING_DIR {
            return second.parse().ok().map(StoredKey::Staging);
        }
        first.parse().ok().map(StoredKey::Style)
    }
}

/// Reversible character substitution over `[a-z0-9]`; other characters pass through
pub fn obfuscate(value: &str) -> String {
    substitute(value, ALPHABET, CIPHER)
}

/// Inverse of [`obfuscate`]
pub fn reveal(value: &str) -> String {
    substitute(value, CIPHER, ALPHABET)
}

fn substitute(value: &str, from: &[u8; 36], to: &[u8; 36]) -> String {
    value
        .chars()
        .map(|c| {
            u8::try_from(c)
                .ok()
                .and_then(|b| from.iter().position(|&f| f == b))
                .map(|i| to[i] as char)
                .unwrap_or(c)
        })
        .collect()
}

/// SHA-256 over (id, style name, canonical config), first 128 bits in base36
pub fn content_digest(id: Id, style: &StyleSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(style.name.as_bytes());
    hasher.update([0u8]);
    // serde_json maps are ordered, so this is canonical
    hasher.update(style.config.to_string().as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 16];
    head.copy_from_slice(&digest[..16]);
    base36(u128::from_be_bytes(head), DIGEST_WIDTH)
}

/// Zero-padded lowercase base36
pub fn base36(mut value: u128, width: usize) -> String {
    let mut out = Vec::with_capacity(width);
    while value > 0 {
        let digit = (value % 36) as usize;
        out.push(ALPHABET[(digit + 26) % 36]);
        value /= 36;
    }
    while out.len() < width {
        out.push(b'0');
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

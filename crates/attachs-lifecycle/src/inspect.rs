//! Upload inspection
//!
//! Derives authoritative metadata from the bytes themselves. The declared
//! filename is only consulted for text formats, which carry no magic bytes.

use attachs_core::{ValidationErrors, NOT_POSITIVE};
use tracing::debug;

use crate::model::ProcessedMetadata;

const OCTET_STREAM: &str = "application/octet-stream";

/// Textual application types that may be named by extension alone
const TEXTUAL_APPLICATION_TYPES: &[&str] = &[
    "application/json",
    "application/xml",
    "application/javascript",
    "application/x-yaml",
    "application/toml",
    "image/svg+xml",
];

/// Preferred extensions where the registry lists several
const CANONICAL_EXTENSIONS: &[(&str, &str)] = &[
    ("image/jpeg", "jpg"),
    ("image/tiff", "tif"),
    ("text/plain", "txt"),
    ("text/markdown", "md"),
    ("text/html", "html"),
    ("text/csv", "csv"),
    ("application/json", "json"),
    ("application/xml", "xml"),
    ("image/svg+xml", "svg"),
    (OCTET_STREAM, "bin"),
];

/// Inspect an upload, rejecting empty data
pub fn inspect(data: &[u8], declared_filename: Option<&str>) -> Result<ProcessedMetadata, ValidationErrors> {
    if data.is_empty() {
        return Err(ValidationErrors::field("size_bytes", NOT_POSITIVE));
    }

    let (content_type, extension) = match infer::get(data) {
        Some(kind) => (kind.mime_type().to_string(), kind.extension().to_string()),
        None => {
            let content_type = textual_type(data, declared_filename);
            let extension = canonical_extension(&content_type);
            (content_type, extension)
        }
    };

    debug!(
        content_type = %content_type,
        extension = %extension,
        size = data.len(),
        "Upload inspected"
    );

    Ok(ProcessedMetadata {
        content_type,
        extension,
        size_bytes: data.len() as i64,
    })
}

/// Content type of data without magic bytes
fn textual_type(data: &[u8], declared_filename: Option<&str>) -> String {
    let guessed = declared_filename
        .and_then(|name| mime_guess::from_path(name).first())
        .map(|mime| mime.essence_str().to_string())
        .filter(|mime| is_textual(mime));

    match guessed {
        Some(mime) if looks_textual(data) => mime,
        _ if looks_textual(data) => "text/plain".to_string(),
        _ => OCTET_STREAM.to_string(),
    }
}

fn is_textual(mime: &str) -> bool {
    mime.starts_with("text/") || TEXTUAL_APPLICATION_TYPES.contains(&mime)
}

fn looks_textual(data: &[u8]) -> bool {
    !data.contains(&0) && std::str::from_utf8(data).is_ok()
}

/// Canonical extension of a content type, `bin` when unknown
pub fn canonical_extension(content_type: &str) -> String {
    if let Some((_, ext)) = CANONICAL_EXTENSIONS
        .iter()
        .find(|(mime, _)| *mime == content_type)
    {
        return ext.to_string();
    }

    mime_guess::get_mime_extensions_str(content_type)
        .and_then(|exts| exts.first())
        .map(|ext| ext.to_string())
        .unwrap_or_else(|| "bin".to_string())
}

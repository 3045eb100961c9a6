//! Style transforms
//!
//! The engine never interprets style configuration itself; a [`Transformer`]
//! turns source bytes plus a style into the bytes stored for that style.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::styles::StyleSpec;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Unsupported transform for {content_type} (style {style})")]
    Unsupported { style: String, content_type: String },
    #[error("Transform failed: {0}")]
    Failed(String),
}

/// Style generation collaborator; treated as a pure function
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(
        &self,
        source: Bytes,
        style: &StyleSpec,
        content_type: &str,
    ) -> Result<Bytes, TransformError>;
}

/// Stores every style as a copy of the source
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughTransformer;

#[async_trait]
impl Transformer for PassthroughTransformer {
    async fn transform(
        &self,
        source: Bytes,
        _style: &StyleSpec,
        _content_type: &str,
    ) -> Result<Bytes, TransformError> {
        Ok(source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_passthrough() {
        let source = Bytes::from_static(b"\x89PNG");
        let out = PassthroughTransformer
            .transform(
                source.clone(),
                &StyleSpec::new("thumb", json!({"width": 10})),
                "image/png",
            )
            .await
            .unwrap();
        assert_eq!(out, source);
    }

    #[test]
    fn test_error_display() {
        let err = TransformError::Unsupported {
            style: "thumb".to_string(),
            content_type: "application/pdf".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported transform for application/pdf (style thumb)"
        );
    }
}

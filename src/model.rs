//! The generative model as seen by the pipeline: one call to plan, one call to render.

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use thiserror::Error;

use crate::models::ImagePayload;
use crate::prompt::PlanningInstruction;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("model returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
}

/// Reference photograph, base64 encoded once per batch and shared by every render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceImage {
    pub mime_type: String,
    pub data: String,
}

impl ReferenceImage {
    pub fn new(mime_type: &str, bytes: &Bytes) -> Self {
        Self {
            mime_type: mime_type.to_string(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest<'a> {
    pub reference: &'a ReferenceImage,
    pub instruction: &'a str,
    pub aspect_ratio: &'a str,
    pub image_size: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentPart {
    Text(String),
    InlineImage(ImagePayload),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderResponse {
    pub parts: Vec<ContentPart>,
}

impl RenderResponse {
    /// Any text the model sent alongside (or instead of) the image.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text(t) => Some(t.as_str()),
                ContentPart::InlineImage(_) => None,
            })
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn first_image(self) -> Option<ImagePayload> {
        self.parts.into_iter().find_map(|p| match p {
            ContentPart::InlineImage(img) => Some(img),
            ContentPart::Text(_) => None,
        })
    }
}

#[async_trait]
pub trait ForensicModel: Send + Sync {
    /// Returns the raw structured plan text, or `None` when the model sent no payload.
    async fn plan_variations(&self, instruction: &PlanningInstruction) -> Result<Option<String>, ModelError>;

    async fn render_image(&self, request: RenderRequest<'_>) -> Result<RenderResponse, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_image_skips_text_parts() {
        let resp = RenderResponse {
            parts: vec![
                ContentPart::Text("here you go".into()),
                ContentPart::InlineImage(ImagePayload { mime_type: "image/png".into(), data: "AAA".into() }),
                ContentPart::InlineImage(ImagePayload { mime_type: "image/jpeg".into(), data: "BBB".into() }),
            ],
        };
        assert_eq!(resp.text(), "here you go");
        assert_eq!(resp.first_image().map(|i| i.data), Some("AAA".to_string()));
        assert!(RenderResponse::default().first_image().is_none());
    }

    #[test]
    fn reference_image_is_encoded_once() {
        let img = ReferenceImage::new("image/png", &Bytes::from_static(b"hello"));
        assert_eq!(img.data, "aGVsbG8=");
        assert_eq!(img.mime_type, "image/png");
    }
}

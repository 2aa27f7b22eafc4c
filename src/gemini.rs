use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use crate::config::AppConfig;
use crate::model::{ContentPart, ForensicModel, ModelError, RenderRequest, RenderResponse};
use crate::models::{ImagePayload, VariationSpec};
use crate::prompt::PlanningInstruction;

const PLAN_REQUEST_TEXT: &str = "Generate the variation profiles.";

// Helper function to truncate base64 data in JSON for cleaner logging
fn truncate_base64_in_json(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if key == "data" {
                    if let Value::String(s) = val {
                        if s.len() > 100 && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=') {
                            *val = Value::String(format!("{}...[truncated {} chars]", &s[..50], s.len() - 50));
                        }
                    }
                } else {
                    truncate_base64_in_json(val);
                }
            }
        }
        Value::Array(arr) => {
            for val in arr.iter_mut() {
                truncate_base64_in_json(val);
            }
        }
        _ => {}
    }
}

fn loggable(value: &Value) -> String {
    let mut copy = value.clone();
    truncate_base64_in_json(&mut copy);
    serde_json::to_string(&copy).unwrap_or_default()
}

fn plan_schema() -> Value {
    json!({
        "type": "ARRAY",
        "items": {
            "type": "OBJECT",
            "properties": {
                "prompt": { "type": "STRING" },
                "reasoning": { "type": "STRING" }
            },
            "required": ["prompt", "reasoning"]
        }
    })
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    base_url: String,
    planner_model: String,
    render_model: String,
}

impl GeminiClient {
    pub fn new(config: &AppConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(config.model_timeout)
            .build()
            .map_err(|e| ModelError::Http(e.to_string()))?;
        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.api_base.clone(),
            planner_model: config.planner_model.clone(),
            render_model: config.render_model.clone(),
        })
    }

    pub fn is_demo(&self) -> bool { self.api_key == crate::config::DEMO_KEY }

    /// reqwest errors carry the request URL, which holds the key.
    fn transport_error(&self, e: reqwest::Error) -> ModelError {
        ModelError::Http(e.without_url().to_string().replace(&self.api_key, "***"))
    }

    async fn generate_content(&self, model: &str, body: &Value) -> Result<GeminiResponse, ModelError> {
        let url = format!("{}/models/{}:generateContent?key={}", self.base_url, model, self.api_key);
        info!("🔗 Making request to: {}", url.replace(&self.api_key, "***"));
        debug!("📤 Request body: {}", loggable(body));

        let response = self.client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        info!("📥 Response status: {}", status);

        let response_text = response.text().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            let body = response_text.replace(&self.api_key, "***");
            error!("❌ API Error response: {}", body);
            return Err(ModelError::Status { status: status.as_u16(), body });
        }

        match serde_json::from_str::<Value>(&response_text) {
            Ok(value) => debug!("📥 Raw Gemini API response: {}", loggable(&value)),
            Err(_) => debug!("📥 Raw Gemini API response ({} bytes, not JSON)", response_text.len()),
        }

        serde_json::from_str(&response_text).map_err(|e| ModelError::InvalidResponse(format!("parse error: {}", e)))
    }

    fn demo_plan(requested: u8) -> String {
        let canned = [
            ("Fine lines around the eyes, slightly receded hairline, current casual clothing.", "Baseline biological aging over the elapsed years with no lifestyle stressors."),
            ("Weathered, sun-darkened skin, unkempt beard, layered worn outdoor clothing.", "Prolonged exposure to the elements leaves visible weathering and neglected grooming."),
            ("Fuller face, double chin, heavier build around the neck and shoulders.", "Metabolic change and reduced activity commonly produce significant weight gain."),
            ("Short practical haircut, plain institutional clothing, pale complexion.", "Long-term indoor living under supervision limits sun exposure and grooming choice."),
            ("Gaunt cheeks, deeper nasolabial folds, greying temples.", "Chronic stress and poor nutrition accelerate visible facial aging."),
        ];
        let specs: Vec<VariationSpec> = canned
            .iter()
            .cycle()
            .take(usize::from(requested))
            .map(|(prompt, reasoning)| VariationSpec { prompt: prompt.to_string(), reasoning: reasoning.to_string() })
            .collect();
        serde_json::to_string(&specs).unwrap_or_else(|_| "[]".into())
    }

    fn placeholder_image(instruction: &str) -> ImagePayload {
        let colors = ["#0E7490", "#1D4ED8", "#6D28D9", "#B45309", "#047857"];
        let color = colors[instruction.len() % colors.len()];
        let svg = format!(r#"<svg width="640" height="360" xmlns="http://www.w3.org/2000/svg">
            <defs>
                <linearGradient id="grad" x1="0%" y1="0%" x2="100%" y2="100%">
                    <stop offset="0%" style="stop-color:{color};stop-opacity:1" />
                    <stop offset="100%" style="stop-color:#000000;stop-opacity:0.8" />
                </linearGradient>
            </defs>
            <rect width="640" height="360" fill="url(#grad)" />
            <text x="320" y="170" font-family="monospace" font-size="26" font-weight="bold"
                  text-anchor="middle" fill="white">AGE PROGRESSION PREVIEW</text>
            <text x="320" y="210" font-family="monospace" font-size="13"
                  text-anchor="middle" fill="white" opacity="0.8">demo mode - no model call made</text>
        </svg>"#);
        ImagePayload {
            mime_type: "image/svg+xml".into(),
            data: base64::engine::general_purpose::STANDARD.encode(svg.as_bytes()),
        }
    }
}

#[async_trait]
impl ForensicModel for GeminiClient {
    async fn plan_variations(&self, instruction: &PlanningInstruction) -> Result<Option<String>, ModelError> {
        if self.is_demo() {
            info!("Using demo mode - returning canned variation plan");
            return Ok(Some(Self::demo_plan(instruction.requested)));
        }

        let body = json!({
            "systemInstruction": { "parts": [{ "text": instruction.text }] },
            "contents": [{ "role": "user", "parts": [{ "text": PLAN_REQUEST_TEXT }] }],
            "generationConfig": {
                "responseMimeType": "application/json",
                "responseSchema": plan_schema()
            }
        });
        let parsed = self.generate_content(&self.planner_model, &body).await?;
        let text = parsed.first_text();
        if text.is_none() {
            info!("⚠️ No text payload found in plan response");
        }
        Ok(text)
    }

    async fn render_image(&self, request: RenderRequest<'_>) -> Result<RenderResponse, ModelError> {
        if self.is_demo() {
            info!("Using demo mode - no real images generated");
            return Ok(RenderResponse {
                parts: vec![ContentPart::InlineImage(Self::placeholder_image(request.instruction))],
            });
        }

        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [
                    { "inlineData": { "mimeType": request.reference.mime_type, "data": request.reference.data } },
                    { "text": request.instruction }
                ]
            }],
            "generationConfig": {
                "responseModalities": ["TEXT", "IMAGE"],
                "imageConfig": {
                    "aspectRatio": request.aspect_ratio,
                    "imageSize": request.image_size
                }
            }
        });
        let parsed = self.generate_content(&self.render_model, &body).await?;
        let response = parsed.into_render_response();
        let images = response.parts.iter().filter(|p| matches!(p, ContentPart::InlineImage(_))).count();
        info!("🖼️ Render response carried {} part(s), {} image(s)", response.parts.len(), images);
        Ok(response)
    }
}

// --- Response Parsing Helpers ---

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate { #[serde(default)] content: Content }

#[derive(Debug, Deserialize, Default)]
struct Content { #[serde(default)] parts: Vec<Part> }

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Part {
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData
    },
    Text { text: String },
    Other(Value)
}

#[derive(Debug, Deserialize)]
struct InlineData {
    data: String,
    #[serde(rename = "mimeType", default = "default_mime")]
    mime_type: String,
}

fn default_mime() -> String { "image/png".into() }

impl GeminiResponse {
    /// Concatenated text of the first candidate.
    fn first_text(&self) -> Option<String> {
        let candidate = self.candidates.first()?;
        let text: String = candidate.content.parts.iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        (!text.trim().is_empty()).then_some(text)
    }

    fn into_render_response(self) -> RenderResponse {
        let parts = self.candidates.into_iter()
            .next()
            .map(|c| c.content.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| match p {
                Part::Inline { inline_data } => Some(ContentPart::InlineImage(ImagePayload {
                    mime_type: inline_data.mime_type,
                    data: inline_data.data,
                })),
                Part::Text { text } => Some(ContentPart::Text(text)),
                Part::Other(_) => None,
            })
            .collect();
        RenderResponse { parts }
    }
}

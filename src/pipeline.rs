use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::model::{ForensicModel, ReferenceImage, RenderRequest};
use crate::models::{GenerationRequest, PredictionResultItem};
use crate::planner::{self, PlanError, RejectedVariation};
use crate::prompt::{self, CompiledPrompt, ValidationError};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),
    #[error("plan generation failed: {0}")]
    PlanGeneration(#[from] PlanError),
}

/// Receives results one at a time, in plan order, as soon as each render succeeds.
#[async_trait]
pub trait ResultSink: Send {
    async fn deliver(&mut self, item: PredictionResultItem);
}

#[async_trait]
impl ResultSink for Vec<PredictionResultItem> {
    async fn deliver(&mut self, item: PredictionResultItem) {
        self.push(item);
    }
}

#[async_trait]
impl ResultSink for mpsc::Sender<PredictionResultItem> {
    async fn deliver(&mut self, item: PredictionResultItem) {
        if let Err(e) = self.send(item).await {
            debug!(id = %e.0.id, "Result receiver dropped; result discarded");
        }
    }
}

/// Adapts a plain closure into a sink.
pub struct CallbackSink<F>(pub F);

#[async_trait]
impl<F> ResultSink for CallbackSink<F>
where
    F: FnMut(PredictionResultItem) + Send,
{
    async fn deliver(&mut self, item: PredictionResultItem) {
        (self.0)(item)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchPhase {
    Idle,
    Compiling,
    Planning,
    PlanFailed,
    Rendering,
    RenderingVariation(usize),
    Done,
}

impl fmt::Display for BatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchPhase::Idle => f.write_str("idle"),
            BatchPhase::Compiling => f.write_str("compiling"),
            BatchPhase::Planning => f.write_str("planning"),
            BatchPhase::PlanFailed => f.write_str("plan_failed"),
            BatchPhase::Rendering => f.write_str("rendering"),
            BatchPhase::RenderingVariation(i) => write!(f, "rendering_variation({i})"),
            BatchPhase::Done => f.write_str("done"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariationFailure {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub planned: usize,
    pub delivered: usize,
    pub rejected: Vec<RejectedVariation>,
    pub failures: Vec<VariationFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    pub aspect_ratio: String,
    pub image_size: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self { aspect_ratio: "16:9".into(), image_size: "1K".into() }
    }
}

/// Unique within a batch: submission millis plus plan position.
pub fn result_id(submitted_at: DateTime<Utc>, index: usize) -> String {
    format!("{}-{}", submitted_at.timestamp_millis(), index)
}

pub struct PredictionPipeline {
    model: Arc<dyn ForensicModel>,
    settings: RenderSettings,
}

impl PredictionPipeline {
    pub fn new(model: Arc<dyn ForensicModel>, settings: RenderSettings) -> Self {
        Self { model, settings }
    }

    /// Plans the variations, then renders them strictly one after another, pushing each
    /// success into `sink` before starting the next. Only validation and plan failures
    /// are returned as errors; render failures are recorded in the summary.
    pub async fn generate_batch<S>(&self, request: &GenerationRequest, sink: &mut S) -> Result<BatchSummary, PipelineError>
    where
        S: ResultSink + ?Sized,
    {
        let batch_id = Uuid::new_v4();
        let submitted_at = Utc::now();
        let mut phase = BatchPhase::Idle;
        debug!(%batch_id, %phase, "Batch created");

        phase = BatchPhase::Compiling;
        debug!(%batch_id, %phase, "Compiling prompts");
        let mime = prompt::validate(request)?;
        let compiled = CompiledPrompt::compile(request, submitted_at.date_naive());
        let reference = ReferenceImage::new(mime, &request.reference_image);

        phase = BatchPhase::Planning;
        if let Some(scenario) = compiled.policy.locked_scenario {
            info!(%batch_id, %phase, scenario = scenario.short_label(), current_age = compiled.profile.current_age, requested = request.variation_count, "🔒 Planning variations for locked scenario");
        } else {
            info!(%batch_id, %phase, current_age = compiled.profile.current_age, requested = request.variation_count, "🎯 Planning variations with scenario auto-detect");
        }
        let plan = match planner::plan(self.model.as_ref(), &compiled.planning).await {
            Ok(plan) => plan,
            Err(e) => {
                phase = BatchPhase::PlanFailed;
                error!(%batch_id, %phase, "❌ {}", e);
                return Err(e.into());
            }
        };

        if plan.is_empty() {
            warn!(%batch_id, "Plan contained no usable variations");
        }
        phase = BatchPhase::Rendering;
        info!(%batch_id, %phase, variations = plan.len(), "🚀 Rendering variations sequentially");

        let mut delivered = 0;
        let mut failures = Vec::new();
        for planned in &plan.variations {
            let index = planned.index;
            phase = BatchPhase::RenderingVariation(index);
            debug!(%batch_id, %phase, "Rendering variation");

            let instruction = compiled.render.fill(&planned.spec.prompt);
            let render = RenderRequest {
                reference: &reference,
                instruction: &instruction,
                aspect_ratio: &self.settings.aspect_ratio,
                image_size: &self.settings.image_size,
            };
            match self.model.render_image(render).await {
                Ok(response) => {
                    let note = response.text();
                    match response.first_image() {
                        Some(image) => {
                            let item = PredictionResultItem {
                                id: result_id(submitted_at, index),
                                image: image.to_data_url(),
                                caption: planned.spec.reasoning.clone(),
                            };
                            info!(%batch_id, index, id = %item.id, mime = %image.mime_type, "✅ Variation rendered");
                            sink.deliver(item).await;
                            delivered += 1;
                        }
                        None => {
                            warn!(%batch_id, index, model_text = %note, "⚠️ No image in render response; skipping variation");
                            failures.push(VariationFailure { index, reason: "no image in response".into() });
                        }
                    }
                }
                Err(e) => {
                    error!(%batch_id, index, "❌ Variation render failed: {}", e);
                    failures.push(VariationFailure { index, reason: e.to_string() });
                }
            }
        }

        phase = BatchPhase::Done;
        info!(%batch_id, %phase, planned = plan.len(), delivered, failed = failures.len(), "Batch complete");
        Ok(BatchSummary {
            batch_id,
            submitted_at,
            planned: plan.len(),
            delivered,
            rejected: plan.rejected,
            failures,
        })
    }
}

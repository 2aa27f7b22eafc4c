//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::model::{ContentPart, ForensicModel, ModelError, RenderRequest, RenderResponse};
use crate::models::{Gender, GenerationRequest, ImagePayload, Scenario, VariationSpec};
use crate::prompt::PlanningInstruction;

pub const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

pub fn sample_request(scenario: Scenario, variation_count: u8) -> GenerationRequest {
    GenerationRequest {
        reference_image: Bytes::from_static(PNG_MAGIC),
        name: "Jane Doe".into(),
        gender: Gender::Male,
        age_at_disappearance: 25,
        years_missing: 5,
        last_known_location: "Leeds, UK".into(),
        scenario,
        scenario_notes: String::new(),
        variation_count,
    }
}

pub fn spec(i: usize) -> VariationSpec {
    VariationSpec { prompt: format!("change {i}"), reasoning: format!("reason {i}") }
}

pub fn two_specs() -> Vec<VariationSpec> {
    vec![spec(0), spec(1)]
}

enum PlanBehavior {
    Raw(Option<String>),
    Error,
}

#[derive(Default)]
struct Calls {
    plans: Vec<PlanningInstruction>,
    renders: Vec<(String, String, String, String)>,
}

/// Scripted model that records every call it receives.
pub struct StubModel {
    plan: PlanBehavior,
    fail_calls: HashSet<usize>,
    imageless_calls: HashSet<usize>,
    calls: Mutex<Calls>,
    delivered: Option<Arc<AtomicUsize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    seen_deliveries: Mutex<Vec<usize>>,
}

impl StubModel {
    pub fn with_plan(specs: Vec<VariationSpec>) -> Self {
        let raw = serde_json::to_string(&specs).ok();
        Self::with_raw_plan(raw)
    }

    pub fn with_raw_plan(raw: Option<String>) -> Self {
        Self {
            plan: PlanBehavior::Raw(raw),
            fail_calls: HashSet::new(),
            imageless_calls: HashSet::new(),
            calls: Mutex::default(),
            delivered: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            seen_deliveries: Mutex::default(),
        }
    }

    /// Samples `delivered` at the start of every render call.
    pub fn watching_deliveries(mut self, delivered: Arc<AtomicUsize>) -> Self {
        self.delivered = Some(delivered);
        self
    }

    /// Value of the watched delivery counter seen by each render call, in call order.
    pub fn deliveries_seen_by_renders(&self) -> Vec<usize> { self.seen_deliveries.lock().clone() }

    pub fn max_renders_in_flight(&self) -> usize { self.max_in_flight.load(Ordering::SeqCst) }

    pub fn plan_error() -> Self {
        Self { plan: PlanBehavior::Error, ..Self::with_raw_plan(None) }
    }

    /// Render calls (0-based call order) that return an error.
    pub fn failing_at(mut self, calls: &[usize]) -> Self {
        self.fail_calls.extend(calls);
        self
    }

    /// Render calls (0-based call order) that succeed with text only.
    pub fn imageless_at(mut self, calls: &[usize]) -> Self {
        self.imageless_calls.extend(calls);
        self
    }

    pub fn plan_calls(&self) -> usize { self.calls.lock().plans.len() }

    pub fn render_calls(&self) -> usize { self.calls.lock().renders.len() }

    pub fn last_plan_instruction(&self) -> Option<PlanningInstruction> {
        self.calls.lock().plans.last().cloned()
    }

    /// The VARIATION line of every render instruction, in call order.
    pub fn rendered_variations(&self) -> Vec<String> {
        self.calls
            .lock()
            .renders
            .iter()
            .filter_map(|(instruction, ..)| {
                instruction
                    .lines()
                    .find_map(|l| l.strip_prefix("VARIATION: "))
                    .map(str::to_string)
            })
            .collect()
    }

    /// (reference mime, aspect ratio, image size) per render call.
    pub fn render_settings(&self) -> Vec<(String, String, String)> {
        self.calls
            .lock()
            .renders
            .iter()
            .map(|(_, mime, ratio, size)| (mime.clone(), ratio.clone(), size.clone()))
            .collect()
    }
}

#[async_trait]
impl ForensicModel for StubModel {
    async fn plan_variations(&self, instruction: &PlanningInstruction) -> Result<Option<String>, ModelError> {
        self.calls.lock().plans.push(instruction.clone());
        match &self.plan {
            PlanBehavior::Raw(raw) => Ok(raw.clone()),
            PlanBehavior::Error => Err(ModelError::Http("connection refused".into())),
        }
    }

    async fn render_image(&self, request: RenderRequest<'_>) -> Result<RenderResponse, ModelError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delivered) = &self.delivered {
            self.seen_deliveries.lock().push(delivered.load(Ordering::SeqCst));
        }
        tokio::task::yield_now().await;
        let result = self.scripted_render(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl StubModel {
    fn scripted_render(&self, request: RenderRequest<'_>) -> Result<RenderResponse, ModelError> {
        let call = {
            let mut calls = self.calls.lock();
            calls.renders.push((
                request.instruction.to_string(),
                request.reference.mime_type.clone(),
                request.aspect_ratio.to_string(),
                request.image_size.to_string(),
            ));
            calls.renders.len() - 1
        };
        if self.fail_calls.contains(&call) {
            return Err(ModelError::Status { status: 500, body: "render exploded".into() });
        }
        let mut parts = vec![ContentPart::Text(format!("render {call}"))];
        if !self.imageless_calls.contains(&call) {
            parts.push(ContentPart::InlineImage(ImagePayload {
                mime_type: "image/png".into(),
                data: "aW1n".into(),
            }));
        }
        Ok(RenderResponse { parts })
    }
}

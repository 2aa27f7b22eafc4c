use chrono::{Datelike, NaiveDate};
use thiserror::Error;

use crate::models::{GenerationRequest, Scenario, MAX_VARIATIONS, MIN_VARIATIONS};

/// Oldest current age we are willing to project to.
pub const MAX_CURRENT_AGE: u32 = 130;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("reference image is required")]
    MissingReferenceImage,
    #[error("reference image is not a recognized image format")]
    UnrecognizedImageFormat,
    #[error("variation count must be between 1 and 5, got {0}")]
    VariationCountOutOfRange(u8),
    #[error("current age {0} exceeds 130; check age and years missing")]
    ImplausibleAge(u64),
}

/// Checks the batch preconditions and returns the sniffed MIME type of the reference image.
pub fn validate(request: &GenerationRequest) -> Result<&'static str, ValidationError> {
    if request.reference_image.is_empty() {
        return Err(ValidationError::MissingReferenceImage);
    }
    let mime = image::guess_format(&request.reference_image)
        .map(|f| f.to_mime_type())
        .map_err(|_| ValidationError::UnrecognizedImageFormat)?;
    if !(MIN_VARIATIONS..=MAX_VARIATIONS).contains(&request.variation_count) {
        return Err(ValidationError::VariationCountOutOfRange(request.variation_count));
    }
    let current_age = u64::from(request.age_at_disappearance) + u64::from(request.years_missing);
    if current_age > u64::from(MAX_CURRENT_AGE) {
        return Err(ValidationError::ImplausibleAge(current_age));
    }
    Ok(mime)
}

/// Values derived from the request and today's date. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemporalProfile {
    pub today: NaiveDate,
    pub age_at_disappearance: u32,
    pub years_missing: u32,
    pub current_age: u32,
    pub approx_disappearance_year: i32,
}

impl TemporalProfile {
    pub fn derive(request: &GenerationRequest, today: NaiveDate) -> Self {
        let years = i32::try_from(request.years_missing).unwrap_or(i32::MAX);
        Self {
            today,
            age_at_disappearance: request.age_at_disappearance,
            years_missing: request.years_missing,
            current_age: request.age_at_disappearance.saturating_add(request.years_missing),
            approx_disappearance_year: today.year().saturating_sub(years),
        }
    }
}

/// Business rules a plan has to satisfy, decided from scenario and requested count alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanPolicy {
    /// `None` means the model picks the most plausible scenarios itself.
    pub locked_scenario: Option<Scenario>,
    pub explore_sub_paths: bool,
    pub force_weight_gain: bool,
    pub requested: u8,
}

impl PlanPolicy {
    pub fn evaluate(scenario: Scenario, requested: u8) -> Self {
        let locked_scenario = (!scenario.is_auto_detect()).then_some(scenario);
        let force_weight_gain = (requested >= 5 || scenario.implies_natural_aging())
            && !scenario.is_starvation_context();
        Self {
            locked_scenario,
            explore_sub_paths: locked_scenario.is_some(),
            force_weight_gain,
            requested,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanningInstruction {
    pub text: String,
    pub requested: u8,
}

/// Shared context every per-variation render instruction is filled with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderTemplate {
    pub target_age: u32,
    pub scenario: String,
    pub location: String,
    pub gender: String,
}

impl RenderTemplate {
    pub fn fill(&self, variation_prompt: &str) -> String {
        format!(
            "task: forensic_age_progression\n\
            \n\
            RULES:\n\
            1. The attached photograph is the identity reference. Keep this person's identity, facial structure and distinguishing features.\n\
            2. Produce a photorealistic image of the same person at {age} years old. Never substitute a different face.\n\
            3. Keep the head pose, camera angle and composition of the reference exactly as they are. No mirroring, no rotation, no reframing.\n\
            4. Change only what the variation below describes.\n\
            \n\
            VARIATION: {variation}\n\
            \n\
            CONTEXT: {scenario}\n\
            LOCATION: {location}\n\
            GENDER: {gender}\n\
            \n\
            Render realistic skin texture and anatomically correct aging while preserving identity.",
            age = self.target_age,
            variation = variation_prompt.trim(),
            scenario = self.scenario,
            location = self.location,
            gender = self.gender,
        )
    }
}

#[derive(Debug, Clone)]
pub struct CompiledPrompt {
    pub profile: TemporalProfile,
    pub policy: PlanPolicy,
    pub planning: PlanningInstruction,
    pub render: RenderTemplate,
}

impl CompiledPrompt {
    pub fn compile(request: &GenerationRequest, today: NaiveDate) -> Self {
        let profile = TemporalProfile::derive(request, today);
        let policy = PlanPolicy::evaluate(request.scenario, request.variation_count);
        let planning = PlanningInstruction {
            text: planning_text(request, &profile, &policy),
            requested: request.variation_count,
        };
        let render = RenderTemplate {
            target_age: profile.current_age,
            scenario: request.scenario.label().to_string(),
            location: or_unknown(&request.last_known_location).to_string(),
            gender: request.gender.label().to_string(),
        };
        Self { profile, policy, planning, render }
    }
}

fn or_unknown(s: &str) -> &str {
    let s = s.trim();
    if s.is_empty() { "unknown" } else { s }
}

fn planning_text(request: &GenerationRequest, profile: &TemporalProfile, policy: &PlanPolicy) -> String {
    let location = or_unknown(&request.last_known_location);
    let gender = request.gender.label();
    let scenario_block = match policy.locked_scenario {
        Some(scenario) => format!(
            "BASE SCENARIO (locked): \"{}\". Every variation must stay inside this scenario.",
            scenario.label()
        ),
        None => "No scenario is locked. Infer the statistically most plausible scenarios for this person from the location and case notes.".to_string(),
    };

    let mut rules = Vec::new();
    if let Some(scenario) = policy.locked_scenario {
        rules.push(format!(
            "Ground every variation in the base scenario \"{}\". Do not fall back to generic aging unless the scenario calls for it.",
            scenario.short_label()
        ));
    }
    if policy.explore_sub_paths {
        rules.push(format!(
            "Make the variations distinct lifestyle paths within the base scenario as they would appear in {location}."
        ));
    }
    rules.push(format!(
        "Apply {gender}-appropriate biological aging from age {} to age {}.",
        profile.age_at_disappearance, profile.current_age
    ));
    rules.push(format!(
        "Use weathering, clothing and grooming typical of {location} in {}.",
        profile.today.year()
    ));
    if policy.force_weight_gain {
        rules.push(
            "Exactly one variation must show significant weight gain (fuller face, double chin, heavier build) to cover metabolic change."
                .to_string(),
        );
    }
    let rules = rules
        .iter()
        .enumerate()
        .map(|(i, r)| format!("{}. {}", i + 1, r))
        .collect::<Vec<_>>()
        .join("\n");

    let notes = request.scenario_notes.trim();
    let name = request.name.trim();
    format!(
        "You are a forensic age progression analyst.\n\
        Current date: {today}.\n\
        \n\
        SUBJECT DOSSIER\n\
        - Name: {name}\n\
        - Gender: {gender}\n\
        - Age at disappearance: {age_lost}\n\
        - Years missing: {years} (since approximately {year_lost})\n\
        - Current age: {current_age}\n\
        - Last known location: {location}\n\
        - Case notes: {notes}\n\
        \n\
        {scenario_block}\n\
        \n\
        TASK: produce {count} distinct variation profiles.\n\
        \n\
        RULES\n\
        {rules}\n\
        \n\
        OUTPUT: a JSON array of objects with exactly two string fields.\n\
        - \"prompt\": the visual changes (aging, styling, weathering, clothing) to apply to the reference photograph. Describe changes only, never the person's existing features, and never ask for a different pose, head angle or framing.\n\
        - \"reasoning\": the forensic justification linking the scenario to those visual traits.",
        today = profile.today.format("%Y-%m-%d"),
        name = if name.is_empty() { "unknown" } else { name },
        age_lost = profile.age_at_disappearance,
        years = profile.years_missing,
        year_lost = profile.approx_disappearance_year,
        current_age = profile.current_age,
        notes = if notes.is_empty() { "none" } else { notes },
        count = policy.requested,
    )
}

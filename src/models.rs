use std::fmt;
use std::str::FromStr;

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use uuid::Uuid;

use crate::pipeline::BatchSummary;

pub const MIN_VARIATIONS: u8 = 1;
pub const MAX_VARIATIONS: u8 = 5;

fn default_variation_count() -> u8 { 2 }

/// Case data for one batch. Immutable while the batch runs.
#[serde_as]
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GenerationRequest {
    #[serde_as(as = "Base64")]
    pub reference_image: Bytes,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub gender: Gender,
    pub age_at_disappearance: u32,
    pub years_missing: u32,
    #[serde(default)]
    pub last_known_location: String,
    #[serde(default)]
    pub scenario: Scenario,
    #[serde(default)]
    pub scenario_notes: String,
    #[serde(default = "default_variation_count")]
    pub variation_count: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Gender {
    Male,
    Female,
    NonBinary,
    Other,
    #[default]
    Unspecified,
    Custom(String),
}

impl Gender {
    pub fn label(&self) -> &str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
            Gender::NonBinary => "Non-Binary",
            Gender::Other => "Other",
            Gender::Unspecified => "Unspecified",
            Gender::Custom(s) => s,
        }
    }
}

impl From<String> for Gender {
    fn from(value: String) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "male" => Gender::Male,
            "female" => Gender::Female,
            "non-binary" | "nonbinary" | "non_binary" => Gender::NonBinary,
            "other" => Gender::Other,
            "unspecified" | "" => Gender::Unspecified,
            _ => Gender::Custom(value.trim().to_string()),
        }
    }
}

impl From<Gender> for String {
    fn from(value: Gender) -> Self { value.label().to_string() }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.label()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Scenario {
    #[default]
    AutoDetect,
    Homelessness,
    MemoryLoss,
    Trafficking,
    VoluntaryDisappearance,
    Fugitive,
    MentalHealthCrisis,
    OffGrid,
    Wilderness,
    Abduction,
    SubstanceAbuse,
    Institutionalized,
    CultAffiliation,
    NaturalAging,
    MetabolicChange,
    Famine,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown scenario: {0}")]
pub struct UnknownScenario(pub String);

impl Scenario {
    pub const ALL: [Scenario; 16] = [
        Scenario::AutoDetect,
        Scenario::Homelessness,
        Scenario::MemoryLoss,
        Scenario::Trafficking,
        Scenario::VoluntaryDisappearance,
        Scenario::Fugitive,
        Scenario::MentalHealthCrisis,
        Scenario::OffGrid,
        Scenario::Wilderness,
        Scenario::Abduction,
        Scenario::SubstanceAbuse,
        Scenario::Institutionalized,
        Scenario::CultAffiliation,
        Scenario::NaturalAging,
        Scenario::MetabolicChange,
        Scenario::Famine,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Scenario::AutoDetect => "AI Optimized Analysis (Auto-Detect Best Fit)",
            Scenario::Homelessness => "Homelessness / Urban Survival (Rough Sleeper)",
            Scenario::MemoryLoss => "Severe Memory Loss / Amnesia (Unaware of Past)",
            Scenario::Trafficking => "Human Trafficking / Forced Labor Context",
            Scenario::VoluntaryDisappearance => "Voluntary Disappearance / New Identity (Pseudocide)",
            Scenario::Fugitive => "Fugitive / Evasion of Justice",
            Scenario::MentalHealthCrisis => "Mental Health Crisis / Wandering / Untreated",
            Scenario::OffGrid => "Rural / Off-grid Living (Exposure to elements)",
            Scenario::Wilderness => "Lost / Wilderness Survival (Disoriented)",
            Scenario::Abduction => "Long-term Abduction / Captivity",
            Scenario::SubstanceAbuse => "Substance Abuse Impact / Physical Deterioration",
            Scenario::Institutionalized => "Institutionalized (State Care / Hospital / Prison)",
            Scenario::CultAffiliation => "Cult / Sect Affiliation (Specific grooming/attire)",
            Scenario::NaturalAging => "Natural Aging (Standard Control Group)",
            Scenario::MetabolicChange => "Natural Aging / Metabolic Change (Weight Gain)",
            Scenario::Famine => "Starvation / Famine (Prolonged Malnutrition)",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Scenario::AutoDetect => "auto-detect",
            Scenario::Homelessness => "homelessness",
            Scenario::MemoryLoss => "memory-loss",
            Scenario::Trafficking => "trafficking",
            Scenario::VoluntaryDisappearance => "voluntary-disappearance",
            Scenario::Fugitive => "fugitive",
            Scenario::MentalHealthCrisis => "mental-health-crisis",
            Scenario::OffGrid => "off-grid",
            Scenario::Wilderness => "wilderness",
            Scenario::Abduction => "abduction",
            Scenario::SubstanceAbuse => "substance-abuse",
            Scenario::Institutionalized => "institutionalized",
            Scenario::CultAffiliation => "cult-affiliation",
            Scenario::NaturalAging => "natural-aging",
            Scenario::MetabolicChange => "metabolic-change",
            Scenario::Famine => "famine",
        }
    }

    /// Label without the parenthesised qualifier, e.g. "Natural Aging".
    pub fn short_label(self) -> &'static str {
        let label = self.label();
        label.split('(').next().unwrap_or(label).trim()
    }

    pub fn is_auto_detect(self) -> bool { self == Scenario::AutoDetect }

    pub fn implies_natural_aging(self) -> bool {
        matches!(self, Scenario::NaturalAging | Scenario::MetabolicChange)
    }

    pub fn is_starvation_context(self) -> bool { self == Scenario::Famine }
}

impl FromStr for Scenario {
    type Err = UnknownScenario;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        Scenario::ALL
            .into_iter()
            .find(|sc| sc.label().eq_ignore_ascii_case(needle) || sc.key().eq_ignore_ascii_case(needle))
            .ok_or_else(|| UnknownScenario(needle.to_string()))
    }
}

impl TryFrom<String> for Scenario {
    type Error = UnknownScenario;
    fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

impl From<Scenario> for String {
    fn from(value: Scenario) -> Self { value.label().to_string() }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.label()) }
}

/// One planned variation: what to change and why.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct VariationSpec {
    pub prompt: String,
    pub reasoning: String,
}

/// Base64 image bytes plus the MIME type they were produced with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: String,
}

impl ImagePayload {
    pub fn to_data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }

    pub fn from_data_url(url: &str) -> Option<Self> {
        let rest = url.strip_prefix("data:")?;
        let (mime_type, data) = rest.split_once(";base64,")?;
        Some(Self { mime_type: mime_type.to_string(), data: data.to_string() })
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(self.data.as_bytes())
    }

    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "image/png" => "png",
            "image/jpeg" | "image/jpg" => "jpg",
            "image/webp" => "webp",
            "image/gif" => "gif",
            "image/svg+xml" => "svg",
            _ => "bin",
        }
    }
}

/// One rendered variation as handed to the sink.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PredictionResultItem {
    pub id: String,
    pub image: String,
    pub caption: String,
}

#[derive(Debug, Clone)]
pub struct CaseRecord {
    pub id: Uuid,
    pub request: GenerationRequest,
    pub results: Vec<PredictionResultItem>,
    pub batches: Vec<BatchSummary>,
    pub busy: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Case as returned over HTTP; the reference image stays server side.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaseView {
    pub id: Uuid,
    pub name: String,
    pub gender: Gender,
    pub scenario: Scenario,
    pub age_at_disappearance: u32,
    pub years_missing: u32,
    pub current_age: u32,
    pub last_known_location: String,
    pub variation_count: u8,
    pub busy: bool,
    pub results: Vec<PredictionResultItem>,
    pub batches: Vec<BatchSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&CaseRecord> for CaseView {
    fn from(case: &CaseRecord) -> Self {
        let req = &case.request;
        Self {
            id: case.id,
            name: req.name.clone(),
            gender: req.gender.clone(),
            scenario: req.scenario,
            age_at_disappearance: req.age_at_disappearance,
            years_missing: req.years_missing,
            current_age: req.age_at_disappearance.saturating_add(req.years_missing),
            last_known_location: req.last_known_location.clone(),
            variation_count: req.variation_count,
            busy: case.busy,
            results: case.results.clone(),
            batches: case.batches.clone(),
            created_at: case.created_at,
            updated_at: case.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct RunBatchRequest {
    #[serde(default)]
    pub variation_count: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn scenario_parses_from_label_or_key() {
        assert_eq!("Natural Aging (Standard Control Group)".parse::<Scenario>().unwrap(), Scenario::NaturalAging);
        assert_eq!("famine".parse::<Scenario>().unwrap(), Scenario::Famine);
        assert_eq!("AUTO-DETECT".parse::<Scenario>().unwrap(), Scenario::AutoDetect);
        assert!("Time Travel".parse::<Scenario>().is_err());
    }

    #[test]
    fn scenario_short_label_drops_qualifier() {
        assert_eq!(Scenario::NaturalAging.short_label(), "Natural Aging");
        assert_eq!(Scenario::Fugitive.short_label(), "Fugitive / Evasion of Justice");
    }

    #[test]
    fn gender_keeps_unknown_categories() {
        assert_eq!(Gender::from("non-binary".to_string()), Gender::NonBinary);
        assert_eq!(Gender::from("Two-Spirit".to_string()), Gender::Custom("Two-Spirit".into()));
        assert_eq!(String::from(Gender::NonBinary), "Non-Binary");
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let body = json!({
            "reference_image": "iVBORw0KGgo=",
            "age_at_disappearance": 25,
            "years_missing": 5,
            "scenario": "natural-aging"
        });
        let req: GenerationRequest = serde_json::from_value(body).unwrap();
        assert_eq!(&req.reference_image[..4], b"\x89PNG");
        assert_eq!(req.scenario, Scenario::NaturalAging);
        assert_eq!(req.gender, Gender::Unspecified);
        assert_eq!(req.variation_count, 2);
    }

    #[test]
    fn request_rejects_negative_age() {
        let body = json!({
            "reference_image": "iVBORw0KGgo=",
            "age_at_disappearance": -3,
            "years_missing": 5
        });
        assert!(serde_json::from_value::<GenerationRequest>(body).is_err());
    }

    #[test]
    fn image_payload_data_url() {
        let payload = ImagePayload { mime_type: "image/png".into(), data: "aGVsbG8=".into() };
        let url = payload.to_data_url();
        assert_eq!(url, "data:image/png;base64,aGVsbG8=");
        let parsed = ImagePayload::from_data_url(&url).unwrap();
        assert_eq!(parsed.decode().unwrap(), b"hello");
        assert_eq!(parsed.extension(), "png");
        assert!(ImagePayload::from_data_url("https://example.com/x.png").is_none());
    }
}

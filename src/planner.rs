use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::model::{ForensicModel, ModelError};
use crate::models::VariationSpec;
use crate::prompt::PlanningInstruction;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("planning call failed: {0}")]
    Model(#[from] ModelError),
    #[error("model returned no plan payload")]
    MissingPayload,
    #[error("plan is not a JSON array: {0}")]
    Malformed(String),
}

/// A well-formed plan element, keeping its position in the model's array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedVariation {
    pub index: usize,
    pub spec: VariationSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct RejectedVariation {
    pub index: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariationPlan {
    pub variations: Vec<PlannedVariation>,
    pub rejected: Vec<RejectedVariation>,
}

impl VariationPlan {
    pub fn len(&self) -> usize { self.variations.len() }
    pub fn is_empty(&self) -> bool { self.variations.is_empty() }
}

pub async fn plan(model: &dyn ForensicModel, instruction: &PlanningInstruction) -> Result<VariationPlan, PlanError> {
    let payload = model.plan_variations(instruction).await?;
    let plan = parse_plan(payload.as_deref())?;
    let returned = plan.variations.len() + plan.rejected.len();
    if returned != usize::from(instruction.requested) {
        warn!(requested = instruction.requested, returned, "Planner returned a different number of variations than requested");
    }
    info!(usable = plan.len(), rejected = plan.rejected.len(), "Variation plan ready");
    Ok(plan)
}

/// The payload must be a JSON array; each element is then checked on its own.
pub fn parse_plan(payload: Option<&str>) -> Result<VariationPlan, PlanError> {
    let text = payload.map(str::trim).filter(|t| !t.is_empty()).ok_or(PlanError::MissingPayload)?;
    let elements: Vec<Value> = serde_json::from_str(text).map_err(|e| PlanError::Malformed(e.to_string()))?;

    let mut plan = VariationPlan::default();
    for (index, element) in elements.into_iter().enumerate() {
        match check_element(element) {
            Ok(spec) => plan.variations.push(PlannedVariation { index, spec }),
            Err(reason) => {
                warn!(index, %reason, "Dropping malformed plan element");
                plan.rejected.push(RejectedVariation { index, reason });
            }
        }
    }
    Ok(plan)
}

fn check_element(element: Value) -> Result<VariationSpec, String> {
    let spec: VariationSpec = serde_json::from_value(element).map_err(|e| e.to_string())?;
    if spec.prompt.trim().is_empty() {
        return Err("empty prompt".into());
    }
    if spec.reasoning.trim().is_empty() {
        return Err("empty reasoning".into());
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_well_formed_plan_in_order() {
        let plan = parse_plan(Some(r#"[
            {"prompt": "weathered skin", "reasoning": "rough sleeping"},
            {"prompt": "shaved head", "reasoning": "shelter rules"}
        ]"#)).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.variations[0].index, 0);
        assert_eq!(plan.variations[1].spec.prompt, "shaved head");
        assert!(plan.rejected.is_empty());
    }

    #[test]
    fn malformed_elements_are_rejected_individually() {
        let plan = parse_plan(Some(r#"[
            {"prompt": "", "reasoning": "x"},
            {"prompt": "beard", "reasoning": "isolation"},
            {"prompt": "glasses"},
            42
        ]"#)).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.variations[0].index, 1);
        assert_eq!(plan.rejected.iter().map(|r| r.index).collect::<Vec<_>>(), vec![0, 2, 3]);
    }

    #[test]
    fn empty_array_is_a_valid_plan() {
        let plan = parse_plan(Some("[]")).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn absent_or_unparsable_payload_fails() {
        assert!(matches!(parse_plan(None), Err(PlanError::MissingPayload)));
        assert!(matches!(parse_plan(Some("  ")), Err(PlanError::MissingPayload)));
        assert!(matches!(parse_plan(Some("not json")), Err(PlanError::Malformed(_))));
        assert!(matches!(parse_plan(Some(r#"{"prompt":"a","reasoning":"b"}"#)), Err(PlanError::Malformed(_))));
    }
}

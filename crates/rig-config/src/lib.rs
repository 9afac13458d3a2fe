//! Document models and YAML loaders for flows, margin profiles, safety
//! policies, and adapter manifests. All plan-time validation of input
//! documents lives here; the runner consumes only typed values.

mod doc;
pub mod flow;
pub mod manifest;
pub mod margin;
pub mod policy;

pub use flow::{load_flow, FailurePolicy, FlowDefinition, FlowMetadata, FlowStep};
pub use manifest::{
    load_adapter_manifest, AdapterManifest, AdapterRegistry, ManifestParam, ParamKind,
};
pub use margin::{
    load_margin_profile, AxisSpec, JitterSpec, MarginProfile, ProfileMetadata, TargetSpec,
};
pub use policy::{
    load_policy_document, load_safety_policy, load_safety_profiles, Bound, MatchRule,
    SafetyPolicy, SafetyProfile,
};

use serde::{Deserialize, Serialize};

/// Closed value set for step parameters. Anything else in a flow document is
/// a validation error, so rendering and bound checking are exhaustive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl ParamValue {
    pub fn from_yaml(value: &serde_yaml::Value) -> Option<ParamValue> {
        match value {
            serde_yaml::Value::Bool(b) => Some(ParamValue::Flag(*b)),
            serde_yaml::Value::Number(n) => n.as_f64().map(ParamValue::Number),
            serde_yaml::Value::String(s) => Some(ParamValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Rendering used for both argv values and `RIG_PARAM_*` environment
    /// values. f64 display already trims trailing zeros, so `950.0` renders
    /// as `950`.
    pub fn render(&self) -> String {
        match self {
            ParamValue::Flag(b) => b.to_string(),
            ParamValue::Number(n) => n.to_string(),
            ParamValue::Text(s) => s.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_value_renders_integers_without_fraction() {
        assert_eq!(ParamValue::Number(950.0).render(), "950");
        assert_eq!(ParamValue::Number(0.25).render(), "0.25");
        assert_eq!(ParamValue::Text("walk".into()).render(), "walk");
        assert_eq!(ParamValue::Flag(true).render(), "true");
    }
}

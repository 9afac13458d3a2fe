//! Flow documents: the ordered step list a run executes.

use crate::doc;
use crate::ParamValue;
use rig_core::{Result, RigError};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;

/// What a plain diagnostic failure (non-zero exit, no safety involvement)
/// does to the rest of the current sub-run. Safety violations and execution
/// errors ignore this and always halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    Halt,
    Continue,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Halt
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowMetadata {
    pub name: String,
    pub description: Option<String>,
    pub on_failure: FailurePolicy,
    pub step_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStep {
    pub name: String,
    pub adapter: String,
    /// Fixed parameters in declaration order.
    pub parameters: Vec<(String, ParamValue)>,
    /// Sweep parameters in declaration order; each expands to one axis of
    /// the invocation cross product.
    pub sweeps: Vec<(String, Vec<ParamValue>)>,
    pub timeout_secs: Option<u64>,
}

impl FlowStep {
    /// Expands the step into its concrete invocations: the Cartesian product
    /// of all sweep lists, rightmost sweep varying fastest, fixed parameters
    /// carried into every invocation. Invocation index is the stable
    /// identity of each combination.
    pub fn expanded_parameters(&self) -> Vec<Vec<(String, ParamValue)>> {
        if self.sweeps.is_empty() {
            return vec![self.parameters.clone()];
        }
        let total: usize = self.sweeps.iter().map(|(_, values)| values.len()).product();
        let mut out = Vec::with_capacity(total);
        for combo in 0..total {
            let mut rem = combo;
            let mut chosen: Vec<(String, ParamValue)> = Vec::with_capacity(self.sweeps.len());
            for (name, values) in self.sweeps.iter().rev() {
                let pick = rem % values.len();
                rem /= values.len();
                chosen.push((name.clone(), values[pick].clone()));
            }
            chosen.reverse();
            let mut params = self.parameters.clone();
            for (name, value) in chosen {
                match params.iter_mut().find(|(existing, _)| *existing == name) {
                    Some(slot) => slot.1 = value,
                    None => params.push((name, value)),
                }
            }
            out.push(params);
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub metadata: FlowMetadata,
    pub steps: Vec<FlowStep>,
}

pub fn load_flow(path: &Path) -> Result<FlowDefinition> {
    let context = path.display().to_string();
    let value = doc::load_yaml(path)?;
    let root = doc::as_mapping(&value, &context)?;

    let metadata = parse_metadata(root, path, &context)?;

    let steps_raw = doc::require(root, "steps", &context)?
        .as_sequence()
        .ok_or_else(|| RigError::Validation(format!("{}: 'steps' must be a list", context)))?;
    if steps_raw.is_empty() {
        return Err(RigError::Validation(format!(
            "{}: flow must declare at least one step",
            context
        )));
    }

    let mut steps = Vec::with_capacity(steps_raw.len());
    for (idx, entry) in steps_raw.iter().enumerate() {
        let step_context = format!("{} step[{}]", context, idx);
        steps.push(parse_step(entry, &step_context)?);
    }

    Ok(FlowDefinition { metadata, steps })
}

fn parse_metadata(
    root: &serde_yaml::Mapping,
    path: &Path,
    context: &str,
) -> Result<FlowMetadata> {
    let meta_value = doc::require(root, "metadata", context)?;
    let meta = doc::as_mapping(meta_value, &format!("{} metadata", context))?;
    let default_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("flow")
        .to_string();
    let name = doc::get_str(meta, "name", context)?.unwrap_or(default_name);
    let description = doc::get_str(meta, "description", context)?;
    let on_failure = match doc::get_str(meta, "on_failure", context)?.as_deref() {
        None => FailurePolicy::default(),
        Some("halt") => FailurePolicy::Halt,
        Some("continue") => FailurePolicy::Continue,
        Some(other) => {
            return Err(RigError::Validation(format!(
                "{}: on_failure must be 'halt' or 'continue', got '{}'",
                context, other
            )))
        }
    };
    let step_timeout_secs = doc::get_u64(meta, "step_timeout_secs", context)?;
    Ok(FlowMetadata {
        name,
        description,
        on_failure,
        step_timeout_secs,
    })
}

fn parse_step(entry: &Value, context: &str) -> Result<FlowStep> {
    let map = doc::as_mapping(entry, context)?;
    let name = doc::require_str(map, "name", context)?;
    let adapter = doc::require_str(map, "adapter", context)?;
    let timeout_secs = doc::get_u64(map, "timeout_secs", context)?;

    let mut parameters = Vec::new();
    if let Some(params_value) = doc::get(map, "parameters") {
        let params = doc::as_mapping(params_value, &format!("{} parameters", context))?;
        for (key, value) in params {
            let param_name = doc::key_str(key, context)?.to_string();
            let parsed = ParamValue::from_yaml(value).ok_or_else(|| {
                RigError::Validation(format!(
                    "{}: parameter '{}' must be a number, string, or flag",
                    context, param_name
                ))
            })?;
            parameters.push((param_name, parsed));
        }
    }

    let mut sweeps = Vec::new();
    if let Some(sweeps_value) = doc::get(map, "sweeps") {
        let sweep_map = doc::as_mapping(sweeps_value, &format!("{} sweeps", context))?;
        for (key, value) in sweep_map {
            let sweep_name = doc::key_str(key, context)?.to_string();
            let items = value.as_sequence().ok_or_else(|| {
                RigError::Validation(format!(
                    "{}: sweep '{}' must be a list of values",
                    context, sweep_name
                ))
            })?;
            if items.is_empty() {
                return Err(RigError::Validation(format!(
                    "{}: sweep '{}' must not be empty",
                    context, sweep_name
                )));
            }
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                let parsed = ParamValue::from_yaml(item).ok_or_else(|| {
                    RigError::Validation(format!(
                        "{}: sweep '{}' values must be numbers, strings, or flags",
                        context, sweep_name
                    ))
                })?;
                values.push(parsed);
            }
            sweeps.push((sweep_name, values));
        }
    }

    Ok(FlowStep {
        name,
        adapter,
        parameters,
        sweeps,
        timeout_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rig_flow_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn load_flow_parses_steps_and_sweeps() {
        let dir = temp_dir("parse");
        let path = dir.join("flow.yaml");
        fs::write(
            &path,
            "metadata:\n  name: demo\nsteps:\n  - name: step-one\n    adapter: adapter-one\n    parameters:\n      foo: 1\n    sweeps:\n      bar: [1, 2]\n",
        )
        .expect("write flow");
        let flow = load_flow(&path).expect("load");
        assert_eq!(flow.metadata.name, "demo");
        assert_eq!(flow.metadata.on_failure, FailurePolicy::Halt);
        assert_eq!(flow.steps[0].name, "step-one");
        let expanded = flow.steps[0].expanded_parameters();
        assert_eq!(expanded.len(), 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_flow_rejects_empty_step_list() {
        let dir = temp_dir("empty");
        let path = dir.join("flow.yaml");
        fs::write(&path, "metadata: {}\nsteps: []\n").expect("write flow");
        let err = load_flow(&path).expect_err("empty flow must fail");
        assert!(err.to_string().contains("at least one step"), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn sweep_expansion_is_rightmost_fastest() {
        let step = FlowStep {
            name: "s".into(),
            adapter: "a".into(),
            parameters: vec![("mode".into(), ParamValue::Text("quick".into()))],
            sweeps: vec![
                (
                    "volt".into(),
                    vec![ParamValue::Number(900.0), ParamValue::Number(950.0)],
                ),
                (
                    "freq".into(),
                    vec![ParamValue::Number(1800.0), ParamValue::Number(2000.0)],
                ),
            ],
            timeout_secs: None,
        };
        let expanded = step.expanded_parameters();
        assert_eq!(expanded.len(), 4);
        // (900,1800), (900,2000), (950,1800), (950,2000)
        assert_eq!(expanded[0][1].1, ParamValue::Number(900.0));
        assert_eq!(expanded[0][2].1, ParamValue::Number(1800.0));
        assert_eq!(expanded[1][2].1, ParamValue::Number(2000.0));
        assert_eq!(expanded[2][1].1, ParamValue::Number(950.0));
        for invocation in &expanded {
            assert_eq!(invocation[0].1, ParamValue::Text("quick".into()));
        }
    }

    #[test]
    fn on_failure_continue_is_parsed() {
        let dir = temp_dir("policy");
        let path = dir.join("flow.yaml");
        fs::write(
            &path,
            "metadata:\n  name: demo\n  on_failure: continue\nsteps:\n  - name: s\n    adapter: a\n",
        )
        .expect("write flow");
        let flow = load_flow(&path).expect("load");
        assert_eq!(flow.metadata.on_failure, FailurePolicy::Continue);
        let _ = fs::remove_dir_all(dir);
    }
}

//! Safety policy documents and auto-selection profiles.

use crate::doc;
use rig_core::{Result, RigError};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Inclusive numeric bound for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bound {
    pub fn contains(&self, value: f64) -> bool {
        if let Some(min) = self.min {
            if value < min {
                return false;
            }
        }
        if let Some(max) = self.max {
            if value > max {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyPolicy {
    pub name: String,
    pub description: Option<String>,
    /// Bounds keyed by parameter name; the document form is an ordered list
    /// of `{parameter, min, max}` entries, rejected on duplicates.
    pub bounds: BTreeMap<String, Bound>,
}

impl SafetyPolicy {
    pub fn bound(&self, parameter: &str) -> Option<&Bound> {
        self.bounds.get(parameter)
    }
}

/// Match predicates for auto-selection, evaluated against the host-fact
/// table. Every present predicate must hold for the profile to match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchRule {
    pub cpu_model_contains: Vec<String>,
    pub architecture_contains: Vec<String>,
    pub min_cores: Option<u64>,
    pub max_cores: Option<u64>,
}

impl MatchRule {
    /// Number of declared predicates, used as the specificity tie-break.
    pub fn predicate_count(&self) -> usize {
        let mut count = 0;
        if !self.cpu_model_contains.is_empty() {
            count += 1;
        }
        if !self.architecture_contains.is_empty() {
            count += 1;
        }
        if self.min_cores.is_some() {
            count += 1;
        }
        if self.max_cores.is_some() {
            count += 1;
        }
        count
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyProfile {
    pub name: String,
    pub description: Option<String>,
    pub priority: i64,
    pub match_rule: MatchRule,
    pub policy: SafetyPolicy,
    pub source: PathBuf,
}

/// Loads a plain safety-policy document (`policy/safety.yaml` shape).
pub fn load_safety_policy(path: &Path) -> Result<SafetyPolicy> {
    let context = path.display().to_string();
    let value = doc::load_yaml(path)?;
    let root = doc::as_mapping(&value, &context)?;
    parse_policy(root, path, &context)
}

/// Loads a policy from either a plain policy document or a profile document
/// carrying a `policy:` section, so a recorded profile source can be
/// replayed directly.
pub fn load_policy_document(path: &Path) -> Result<SafetyPolicy> {
    let context = path.display().to_string();
    let value = doc::load_yaml(path)?;
    let root = doc::as_mapping(&value, &context)?;
    match doc::get(root, "policy") {
        Some(policy_value) => {
            let policy_map = doc::as_mapping(policy_value, &format!("{} policy", context))?;
            parse_policy(policy_map, path, &format!("{} policy", context))
        }
        None => parse_policy(root, path, &context),
    }
}

/// Loads every auto-selection profile under `dir`, in sorted filename order
/// so candidate ranking never depends on filesystem enumeration order.
pub fn load_safety_profiles(dir: &Path) -> Result<Vec<SafetyProfile>> {
    let mut paths: Vec<PathBuf> = Vec::new();
    if dir.exists() {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
            if path.is_file() && matches!(ext, "yaml" | "yml") {
                paths.push(path);
            }
        }
    }
    paths.sort();

    let mut profiles = Vec::with_capacity(paths.len());
    for path in paths {
        profiles.push(load_safety_profile(&path)?);
    }
    Ok(profiles)
}

fn load_safety_profile(path: &Path) -> Result<SafetyProfile> {
    let context = path.display().to_string();
    let value = doc::load_yaml(path)?;
    let root = doc::as_mapping(&value, &context)?;

    let default_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("profile")
        .to_string();
    let (name, description, priority) = match doc::get(root, "profile") {
        None => (default_name, None, 0),
        Some(meta_value) => {
            let meta = doc::as_mapping(meta_value, &format!("{} profile", context))?;
            (
                doc::get_str(meta, "name", &context)?.unwrap_or(default_name),
                doc::get_str(meta, "description", &context)?,
                doc::get_u64(meta, "priority", &context)?.unwrap_or(0) as i64,
            )
        }
    };

    let match_rule = match doc::get(root, "match") {
        None => MatchRule::default(),
        Some(match_value) => parse_match(match_value, &format!("{} match", context))?,
    };

    let policy_value = doc::require(root, "policy", &context)?;
    let policy_map = doc::as_mapping(policy_value, &format!("{} policy", context))?;
    let policy = parse_policy(policy_map, path, &format!("{} policy", context))?;

    Ok(SafetyProfile {
        name,
        description,
        priority,
        match_rule,
        policy,
        source: path.to_path_buf(),
    })
}

fn parse_match(value: &Value, context: &str) -> Result<MatchRule> {
    let map = doc::as_mapping(value, context)?;
    for (key, _) in map {
        let name = doc::key_str(key, context)?;
        if !matches!(
            name,
            "cpu_model_contains" | "architecture_contains" | "min_cores" | "max_cores"
        ) {
            return Err(RigError::Validation(format!(
                "{}: unknown match predicate '{}'",
                context, name
            )));
        }
    }
    let cpu_model_contains = match doc::get(map, "cpu_model_contains") {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => doc::string_list(v, &format!("{} cpu_model_contains", context))?,
    };
    let architecture_contains = match doc::get(map, "architecture_contains") {
        None | Some(Value::Null) => Vec::new(),
        Some(v) => doc::string_list(v, &format!("{} architecture_contains", context))?,
    };
    Ok(MatchRule {
        cpu_model_contains,
        architecture_contains,
        min_cores: doc::get_u64(map, "min_cores", context)?,
        max_cores: doc::get_u64(map, "max_cores", context)?,
    })
}

fn parse_policy(map: &serde_yaml::Mapping, path: &Path, context: &str) -> Result<SafetyPolicy> {
    let default_name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("policy")
        .to_string();
    let (name, description) = match doc::get(map, "metadata") {
        None => (default_name, None),
        Some(meta_value) => {
            let meta = doc::as_mapping(meta_value, &format!("{} metadata", context))?;
            (
                doc::get_str(meta, "name", context)?.unwrap_or(default_name),
                doc::get_str(meta, "description", context)?,
            )
        }
    };

    let bounds_value = doc::require(map, "bounds", context)?;
    let entries = bounds_value.as_sequence().ok_or_else(|| {
        RigError::Validation(format!(
            "{}: 'bounds' must be a list of {{parameter, min, max}} entries",
            context
        ))
    })?;

    let mut bounds = BTreeMap::new();
    for (idx, entry) in entries.iter().enumerate() {
        let entry_context = format!("{} bounds[{}]", context, idx);
        let entry_map = doc::as_mapping(entry, &entry_context)?;
        let parameter = doc::require_str(entry_map, "parameter", &entry_context)?;
        let min = doc::get_f64(entry_map, "min", &entry_context)?;
        let max = doc::get_f64(entry_map, "max", &entry_context)?;
        if min.is_none() && max.is_none() {
            return Err(RigError::Validation(format!(
                "{}: bound '{}' must declare min or max",
                entry_context, parameter
            )));
        }
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo > hi {
                return Err(RigError::Validation(format!(
                    "{}: bound '{}' has min {} above max {}",
                    entry_context, parameter, lo, hi
                )));
            }
        }
        if bounds.insert(parameter.clone(), Bound { min, max }).is_some() {
            return Err(RigError::Validation(format!(
                "{}: duplicate bound for parameter '{}'",
                entry_context, parameter
            )));
        }
    }

    Ok(SafetyPolicy {
        name,
        description,
        bounds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rig_policy_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    #[test]
    fn bound_is_inclusive() {
        let bound = Bound {
            min: Some(900.0),
            max: Some(1000.0),
        };
        assert!(bound.contains(900.0));
        assert!(bound.contains(1000.0));
        assert!(!bound.contains(899.9));
        assert!(!bound.contains(1000.1));
    }

    #[test]
    fn load_safety_policy_parses_bound_list() {
        let dir = temp_dir("plain");
        let path = dir.join("safety.yaml");
        fs::write(
            &path,
            "metadata:\n  name: default\nbounds:\n  - parameter: voltage_mv\n    min: 900\n    max: 1000\n",
        )
        .expect("write policy");
        let policy = load_safety_policy(&path).expect("load");
        assert_eq!(policy.name, "default");
        let bound = policy.bound("voltage_mv").expect("bound");
        assert_eq!(bound.max, Some(1000.0));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn load_policy_document_unwraps_profile_shape() {
        let dir = temp_dir("wrapped");
        let path = dir.join("genoa.yaml");
        fs::write(
            &path,
            "profile:\n  name: genoa\n  priority: 10\nmatch:\n  cpu_model_contains: [EPYC]\n  min_cores: 8\npolicy:\n  bounds:\n    - parameter: voltage_mv\n      min: 900\n      max: 1050\n",
        )
        .expect("write profile");
        let policy = load_policy_document(&path).expect("load");
        assert_eq!(policy.bound("voltage_mv").expect("bound").max, Some(1050.0));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn profiles_load_in_filename_order() {
        let dir = temp_dir("order");
        let body = "policy:\n  bounds:\n    - parameter: voltage_mv\n      max: 1000\n";
        fs::write(dir.join("b-second.yaml"), body).expect("write");
        fs::write(dir.join("a-first.yaml"), format!("profile:\n  priority: 5\n{}", body))
            .expect("write");
        let profiles = load_safety_profiles(&dir).expect("load");
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].name, "a-first");
        assert_eq!(profiles[0].priority, 5);
        assert_eq!(profiles[1].name, "b-second");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn duplicate_bound_parameter_is_rejected() {
        let dir = temp_dir("dup");
        let path = dir.join("safety.yaml");
        fs::write(
            &path,
            "bounds:\n  - parameter: voltage_mv\n    max: 1000\n  - parameter: voltage_mv\n    max: 1100\n",
        )
        .expect("write policy");
        let err = load_safety_policy(&path).expect_err("must reject duplicate");
        assert!(err.to_string().contains("duplicate bound"), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn inverted_bound_is_rejected() {
        let dir = temp_dir("inverted");
        let path = dir.join("safety.yaml");
        fs::write(
            &path,
            "bounds:\n  - parameter: voltage_mv\n    min: 1100\n    max: 1000\n",
        )
        .expect("write policy");
        assert!(load_safety_policy(&path).is_err());
        let _ = fs::remove_dir_all(dir);
    }
}

//! Margin profile documents: per-target voltage/frequency settings, fixed or
//! swept, with optional seeded jitter.

use crate::doc;
use rig_core::{Result, RigError};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::Path;

/// One axis of a target setting: a single value or an ordered sweep list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AxisSpec {
    Fixed(f64),
    Sweep(Vec<f64>),
}

impl AxisSpec {
    pub fn values(&self) -> Vec<f64> {
        match self {
            AxisSpec::Fixed(v) => vec![*v],
            AxisSpec::Sweep(values) => values.clone(),
        }
    }

    pub fn is_sweep(&self) -> bool {
        matches!(self, AxisSpec::Sweep(_))
    }
}

/// Jitter amplitudes for a target. Offsets are sampled per point from the
/// point's derived seed, uniformly in `[-amplitude, +amplitude]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JitterSpec {
    pub amplitude_mv: f64,
    pub amplitude_mhz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub voltage_mv: AxisSpec,
    pub freq_mhz: AxisSpec,
    pub jitter: Option<JitterSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileMetadata {
    pub name: Option<String>,
    pub description: Option<String>,
}

/// Target names are either `default` (applies to every step) or an adapter
/// name (overrides `default` for that adapter's steps). Declaration order is
/// preserved because it fixes the point expansion order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginProfile {
    pub metadata: ProfileMetadata,
    pub global_seed: Option<u64>,
    pub targets: Vec<(String, TargetSpec)>,
}

impl MarginProfile {
    /// Profile used when a run is started without a margin document: no
    /// targets, so expansion yields a single empty point and the parent run
    /// is the only run.
    pub fn default_profile() -> Self {
        MarginProfile {
            metadata: ProfileMetadata::default(),
            global_seed: None,
            targets: Vec::new(),
        }
    }

    pub fn target(&self, name: &str) -> Option<&TargetSpec> {
        self.targets
            .iter()
            .find(|(target, _)| target == name)
            .map(|(_, spec)| spec)
    }

    pub fn has_sweeps(&self) -> bool {
        self.targets
            .iter()
            .any(|(_, spec)| spec.voltage_mv.is_sweep() || spec.freq_mhz.is_sweep())
    }
}

pub fn load_margin_profile(path: &Path) -> Result<MarginProfile> {
    let context = path.display().to_string();
    let value = doc::load_yaml(path)?;
    let root = doc::as_mapping(&value, &context)?;

    let metadata = match doc::get(root, "metadata") {
        None => ProfileMetadata::default(),
        Some(meta_value) => {
            let meta = doc::as_mapping(meta_value, &format!("{} metadata", context))?;
            ProfileMetadata {
                name: doc::get_str(meta, "name", &context)?,
                description: doc::get_str(meta, "description", &context)?,
            }
        }
    };

    let global_seed = doc::get_u64(root, "global_seed", &context)?;

    let targets_value = doc::require(root, "targets", &context)?;
    let targets_map = doc::as_mapping(targets_value, &format!("{} targets", context))?;
    let mut targets = Vec::with_capacity(targets_map.len());
    for (key, target_value) in targets_map {
        let target_name = doc::key_str(key, &context)?.to_string();
        let target_context = format!("{} target '{}'", context, target_name);
        targets.push((target_name, parse_target(target_value, &target_context)?));
    }

    Ok(MarginProfile {
        metadata,
        global_seed,
        targets,
    })
}

fn parse_target(value: &Value, context: &str) -> Result<TargetSpec> {
    let map = doc::as_mapping(value, context)?;
    for (key, _) in map {
        let name = doc::key_str(key, context)?;
        if !matches!(name, "voltage_mv" | "freq_mhz" | "jitter") {
            return Err(RigError::Validation(format!(
                "{}: unknown key '{}' (expected voltage_mv, freq_mhz, jitter)",
                context, name
            )));
        }
    }
    let voltage_mv = parse_axis(doc::require(map, "voltage_mv", context)?, context, "voltage_mv")?;
    let freq_mhz = parse_axis(doc::require(map, "freq_mhz", context)?, context, "freq_mhz")?;
    let jitter = match doc::get(map, "jitter") {
        None | Some(Value::Null) => None,
        Some(jitter_value) => {
            let jitter_map = doc::as_mapping(jitter_value, &format!("{} jitter", context))?;
            let amplitude_mv =
                doc::get_f64(jitter_map, "amplitude_mv", context)?.unwrap_or(0.0);
            let amplitude_mhz =
                doc::get_f64(jitter_map, "amplitude_mhz", context)?.unwrap_or(0.0);
            if amplitude_mv < 0.0 || amplitude_mhz < 0.0 {
                return Err(RigError::Validation(format!(
                    "{}: jitter amplitudes must be non-negative",
                    context
                )));
            }
            Some(JitterSpec {
                amplitude_mv,
                amplitude_mhz,
            })
        }
    };
    Ok(TargetSpec {
        voltage_mv,
        freq_mhz,
        jitter,
    })
}

fn parse_axis(value: &Value, context: &str, axis: &str) -> Result<AxisSpec> {
    match value {
        Value::Number(_) => Ok(AxisSpec::Fixed(doc::numeric(
            value,
            &format!("{} {}", context, axis),
        )?)),
        Value::Mapping(map) => {
            let sweep = doc::get(map, "sweep").ok_or_else(|| {
                RigError::Validation(format!(
                    "{}: {} mapping must contain a 'sweep' list",
                    context, axis
                ))
            })?;
            let items = sweep.as_sequence().ok_or_else(|| {
                RigError::Validation(format!("{}: {} sweep must be a list", context, axis))
            })?;
            if items.is_empty() {
                return Err(RigError::Validation(format!(
                    "{}: {} sweep must not be empty",
                    context, axis
                )));
            }
            let mut values = Vec::with_capacity(items.len());
            for item in items {
                values.push(doc::numeric(item, &format!("{} {} sweep", context, axis))?);
            }
            Ok(AxisSpec::Sweep(values))
        }
        _ => Err(RigError::Validation(format!(
            "{}: {} must be a number or a {{sweep: [...]}} mapping",
            context, axis
        ))),
    }
}

//! Small helpers for walking YAML documents while keeping error messages
//! anchored to the file and key that failed.

use rig_core::{Result, RigError};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;

pub(crate) fn load_yaml(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).map_err(|e| {
        RigError::Validation(format!("{}: cannot read document: {}", path.display(), e))
    })?;
    let value: Value = serde_yaml::from_str(&raw)?;
    Ok(value)
}

pub(crate) fn as_mapping<'a>(value: &'a Value, context: &str) -> Result<&'a Mapping> {
    value
        .as_mapping()
        .ok_or_else(|| RigError::Validation(format!("{}: expected mapping", context)))
}

pub(crate) fn get<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(&Value::String(key.to_string()))
}

pub(crate) fn require<'a>(map: &'a Mapping, key: &str, context: &str) -> Result<&'a Value> {
    get(map, key)
        .ok_or_else(|| RigError::Validation(format!("{}: missing required key '{}'", context, key)))
}

pub(crate) fn get_str(map: &Mapping, key: &str, context: &str) -> Result<Option<String>> {
    match get(map, key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(RigError::Validation(format!(
            "{}: '{}' must be a string",
            context, key
        ))),
    }
}

pub(crate) fn require_str(map: &Mapping, key: &str, context: &str) -> Result<String> {
    get_str(map, key, context)?
        .ok_or_else(|| RigError::Validation(format!("{}: missing required key '{}'", context, key)))
}

pub(crate) fn get_u64(map: &Mapping, key: &str, context: &str) -> Result<Option<u64>> {
    match get(map, key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            RigError::Validation(format!(
                "{}: '{}' must be a non-negative integer",
                context, key
            ))
        }),
        Some(_) => Err(RigError::Validation(format!(
            "{}: '{}' must be an integer",
            context, key
        ))),
    }
}

pub(crate) fn get_f64(map: &Mapping, key: &str, context: &str) -> Result<Option<f64>> {
    match get(map, key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            let v = n.as_f64().ok_or_else(|| {
                RigError::Validation(format!("{}: '{}' must be numeric", context, key))
            })?;
            if !v.is_finite() {
                return Err(RigError::Validation(format!(
                    "{}: '{}' must be finite",
                    context, key
                )));
            }
            Ok(Some(v))
        }
        Some(_) => Err(RigError::Validation(format!(
            "{}: '{}' must be numeric",
            context, key
        ))),
    }
}

pub(crate) fn numeric(value: &Value, context: &str) -> Result<f64> {
    let v = value
        .as_f64()
        .ok_or_else(|| RigError::Validation(format!("{}: expected numeric value", context)))?;
    if !v.is_finite() {
        return Err(RigError::Validation(format!(
            "{}: expected finite numeric value",
            context
        )));
    }
    Ok(v)
}

pub(crate) fn key_str<'a>(key: &'a Value, context: &str) -> Result<&'a str> {
    key.as_str()
        .ok_or_else(|| RigError::Validation(format!("{}: mapping keys must be strings", context)))
}

pub(crate) fn string_list(value: &Value, context: &str) -> Result<Vec<String>> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Sequence(items) => items
            .iter()
            .map(|item| {
                item.as_str().map(|s| s.to_string()).ok_or_else(|| {
                    RigError::Validation(format!("{}: expected list of strings", context))
                })
            })
            .collect(),
        _ => Err(RigError::Validation(format!(
            "{}: expected string or list of strings",
            context
        ))),
    }
}

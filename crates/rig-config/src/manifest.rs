//! Adapter manifests: how an external diagnostic executable is invoked and
//! which parameters it accepts.

use crate::doc;
use crate::ParamValue;
use rig_core::{Result, RigError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Closed parameter-type set. Validation is exhaustive by `match`, never
/// duck-typed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamKind {
    Number {
        min: Option<f64>,
        max: Option<f64>,
    },
    Enum {
        allowed: Vec<String>,
    },
    Flag,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestParam {
    pub name: String,
    pub kind: ParamKind,
}

impl ManifestParam {
    /// Type and bound-hint check for one supplied value. Returns a
    /// validation error; safety-policy bounds are enforced separately.
    pub fn validate(&self, value: &ParamValue) -> Result<()> {
        match (&self.kind, value) {
            (ParamKind::Number { min, max }, ParamValue::Number(v)) => {
                if let Some(lo) = min {
                    if v < lo {
                        return Err(RigError::Validation(format!(
                            "parameter '{}': value {} below manifest minimum {}",
                            self.name, v, lo
                        )));
                    }
                }
                if let Some(hi) = max {
                    if v > hi {
                        return Err(RigError::Validation(format!(
                            "parameter '{}': value {} above manifest maximum {}",
                            self.name, v, hi
                        )));
                    }
                }
                Ok(())
            }
            (ParamKind::Enum { allowed }, ParamValue::Text(s)) => {
                if allowed.iter().any(|a| a == s) {
                    Ok(())
                } else {
                    Err(RigError::Validation(format!(
                        "parameter '{}': value '{}' not in allowed set [{}]",
                        self.name,
                        s,
                        allowed.join(", ")
                    )))
                }
            }
            (ParamKind::Flag, ParamValue::Flag(_)) => Ok(()),
            (kind, value) => Err(RigError::Validation(format!(
                "parameter '{}': expected {} value, got {}",
                self.name,
                kind_name(kind),
                value_name(value)
            ))),
        }
    }
}

fn kind_name(kind: &ParamKind) -> &'static str {
    match kind {
        ParamKind::Number { .. } => "number",
        ParamKind::Enum { .. } => "enum",
        ParamKind::Flag => "flag",
    }
}

fn value_name(value: &ParamValue) -> &'static str {
    match value {
        ParamValue::Number(_) => "number",
        ParamValue::Text(_) => "string",
        ParamValue::Flag(_) => "flag",
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterManifest {
    pub name: String,
    pub description: Option<String>,
    pub executable: PathBuf,
    /// Fixed argument prelude, rendered before any parameters.
    pub args: Vec<String>,
    /// Declared parameters in manifest order; argv rendering follows this
    /// order, never map order, so command lines diff cleanly across runs.
    pub parameters: Vec<ManifestParam>,
}

impl AdapterManifest {
    pub fn parameter(&self, name: &str) -> Option<&ManifestParam> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

pub fn load_adapter_manifest(path: &Path) -> Result<AdapterManifest> {
    let context = path.display().to_string();
    let value = doc::load_yaml(path)?;
    let root = doc::as_mapping(&value, &context)?;

    let name = doc::require_str(root, "name", &context)?;
    let description = doc::get_str(root, "description", &context)?;
    let executable = PathBuf::from(doc::require_str(root, "executable", &context)?);

    let args = match doc::get(root, "args") {
        None | Some(serde_yaml::Value::Null) => Vec::new(),
        Some(v) => doc::string_list(v, &format!("{} args", context))?,
    };

    let mut parameters = Vec::new();
    if let Some(params_value) = doc::get(root, "parameters") {
        let entries = params_value.as_sequence().ok_or_else(|| {
            RigError::Validation(format!("{}: 'parameters' must be a list", context))
        })?;
        for (idx, entry) in entries.iter().enumerate() {
            let entry_context = format!("{} parameters[{}]", context, idx);
            let entry_map = doc::as_mapping(entry, &entry_context)?;
            let param_name = doc::require_str(entry_map, "name", &entry_context)?;
            let kind = match doc::require_str(entry_map, "type", &entry_context)?.as_str() {
                "number" => ParamKind::Number {
                    min: doc::get_f64(entry_map, "min", &entry_context)?,
                    max: doc::get_f64(entry_map, "max", &entry_context)?,
                },
                "enum" => {
                    let allowed_value = doc::require(entry_map, "allowed", &entry_context)?;
                    let allowed =
                        doc::string_list(allowed_value, &format!("{} allowed", entry_context))?;
                    if allowed.is_empty() {
                        return Err(RigError::Validation(format!(
                            "{}: enum parameter '{}' needs a non-empty allowed list",
                            entry_context, param_name
                        )));
                    }
                    ParamKind::Enum { allowed }
                }
                "flag" => ParamKind::Flag,
                other => {
                    return Err(RigError::Validation(format!(
                        "{}: unknown parameter type '{}' (expected number, enum, flag)",
                        entry_context, other
                    )))
                }
            };
            if parameters.iter().any(|p: &ManifestParam| p.name == param_name) {
                return Err(RigError::Validation(format!(
                    "{}: duplicate parameter '{}'",
                    entry_context, param_name
                )));
            }
            parameters.push(ManifestParam {
                name: param_name,
                kind,
            });
        }
    }

    Ok(AdapterManifest {
        name,
        description,
        executable,
        args,
        parameters,
    })
}

/// All adapter manifests under a directory, loaded eagerly so unknown
/// adapter references fail at plan time.
#[derive(Debug, Clone, Default)]
pub struct AdapterRegistry {
    manifests: BTreeMap<String, AdapterManifest>,
}

impl AdapterRegistry {
    pub fn load(dir: &Path) -> Result<Self> {
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

        let mut manifests = BTreeMap::new();
        for path in paths {
            let manifest = load_adapter_manifest(&path)?;
            if manifests.contains_key(&manifest.name) {
                return Err(RigError::Validation(format!(
                    "{}: duplicate adapter name '{}'",
                    path.display(),
                    manifest.name
                )));
            }
            manifests.insert(manifest.name.clone(), manifest);
        }
        Ok(AdapterRegistry { manifests })
    }

    pub fn get(&self, name: &str) -> Result<&AdapterManifest> {
        self.manifests
            .get(name)
            .ok_or_else(|| RigError::Validation(format!("unknown adapter '{}'", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        self.manifests.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rig_manifest_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        dir
    }

    const MANIFEST: &str = "name: cpu-smoke\nexecutable: ./diags/cpu_smoke.sh\nargs: [--mode, quick]\nparameters:\n  - name: duration\n    type: number\n    min: 0\n    max: 600\n  - name: pattern\n    type: enum\n    allowed: [walk, march]\n  - name: verbose\n    type: flag\n";

    #[test]
    fn load_manifest_parses_closed_parameter_types() {
        let dir = temp_dir("parse");
        let path = dir.join("cpu-smoke.yaml");
        fs::write(&path, MANIFEST).expect("write manifest");
        let manifest = load_adapter_manifest(&path).expect("load");
        assert_eq!(manifest.name, "cpu-smoke");
        assert_eq!(manifest.args, vec!["--mode", "quick"]);
        assert_eq!(manifest.parameters.len(), 3);
        assert_eq!(
            manifest.parameters[1].kind,
            ParamKind::Enum {
                allowed: vec!["walk".into(), "march".into()]
            }
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn manifest_param_validation_checks_types_and_hints() {
        let param = ManifestParam {
            name: "duration".into(),
            kind: ParamKind::Number {
                min: Some(0.0),
                max: Some(600.0),
            },
        };
        assert!(param.validate(&ParamValue::Number(10.0)).is_ok());
        assert!(param.validate(&ParamValue::Number(601.0)).is_err());
        assert!(param.validate(&ParamValue::Text("10".into())).is_err());

        let flag = ManifestParam {
            name: "verbose".into(),
            kind: ParamKind::Flag,
        };
        assert!(flag.validate(&ParamValue::Flag(true)).is_ok());
        assert!(flag.validate(&ParamValue::Number(1.0)).is_err());
    }

    #[test]
    fn registry_rejects_duplicate_adapter_names() {
        let dir = temp_dir("dup");
        fs::write(dir.join("a.yaml"), MANIFEST).expect("write");
        fs::write(dir.join("b.yaml"), MANIFEST).expect("write");
        let err = AdapterRegistry::load(&dir).expect_err("duplicate must fail");
        assert!(err.to_string().contains("duplicate adapter name"), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn registry_reports_unknown_adapter() {
        let registry = AdapterRegistry::default();
        let err = registry.get("missing").expect_err("unknown adapter");
        assert!(err.to_string().contains("unknown adapter 'missing'"));
    }

    #[test]
    fn unknown_parameter_type_is_rejected() {
        let dir = temp_dir("badtype");
        let path = dir.join("bad.yaml");
        fs::write(
            &path,
            "name: bad\nexecutable: ./x\nparameters:\n  - name: p\n    type: matrix\n",
        )
        .expect("write manifest");
        assert!(load_adapter_manifest(&path).is_err());
        let _ = fs::remove_dir_all(dir);
    }
}

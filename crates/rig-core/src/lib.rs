//! Shared foundation for the rig workspace: error taxonomy, atomic file
//! writes, digests, and deterministic seed derivation.

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Canonical error type for the engine crates.
///
/// `Validation` and `Safety` always abort forward progress of the affected
/// run; `Execution` is recorded against the step that raised it. Diagnostic
/// failures (adapter ran, exited non-zero) are not errors at this level —
/// they travel through step records and the summary verdict.
#[derive(Debug, Error)]
pub enum RigError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("safety violation: {0}")]
    Safety(String),
    #[error("execution error: {0}")]
    Execution(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RigError>;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

/// Writes bytes through a temp file + rename so readers never observe a
/// partially written artifact. The parent directory is fsynced afterwards.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn read_json_file(path: &Path) -> Result<Value> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(sha256_bytes(&bytes))
}

/// Digest of a JSON value with object keys sorted recursively, so logically
/// equal documents hash identically regardless of key order.
pub fn canonical_json_digest(value: &Value) -> String {
    let canonical = sort_json(value);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    sha256_bytes(&bytes)
}

fn sort_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let mut sorted = serde_json::Map::new();
            for (key, inner) in entries {
                sorted.insert(key.clone(), sort_json(inner));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_json).collect()),
        other => other.clone(),
    }
}

/// Short hex identifier over the given parts, used as a run-id suffix.
pub fn short_digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join(":").as_bytes());
    hex::encode(hasher.finalize())[..10].to_string()
}

/// Deterministic per-point seed: SHA-256 over `(global_seed, index)`,
/// truncated to 64 bits. Never touches a process-wide RNG, so two engine
/// instances cannot interfere and replay is exact.
pub fn derive_point_seed(global_seed: u64, index: u64) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(global_seed.to_le_bytes());
    hasher.update(index.to_le_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339()
}

/// Collapses anything outside `[A-Za-z0-9_.-]` into single dashes and
/// lowercases, for file-system friendly step/run names.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn derive_point_seed_is_stable_and_index_sensitive() {
        let a = derive_point_seed(1337, 0);
        let b = derive_point_seed(1337, 0);
        let c = derive_point_seed(1337, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(derive_point_seed(1336, 0), a);
    }

    #[test]
    fn canonical_digest_ignores_key_order() {
        let left = json!({"b": 1, "a": {"y": 2, "x": 3}});
        let right = json!({"a": {"x": 3, "y": 2}, "b": 1});
        assert_eq!(canonical_json_digest(&left), canonical_json_digest(&right));
    }

    #[test]
    fn sanitize_collapses_and_lowercases() {
        assert_eq!(sanitize("CPU Smoke / quick!"), "cpu-smoke-quick");
        assert_eq!(sanitize("  step_one.v2  "), "step_one.v2");
        assert_eq!(sanitize("***"), "");
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = std::env::temp_dir().join(format!(
            "rig_core_write_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        let path = dir.join("artifact.json");
        atomic_write_bytes(&path, b"first").expect("first write");
        atomic_write_bytes(&path, b"second").expect("second write");
        assert_eq!(fs::read(&path).expect("read"), b"second");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn short_digest_is_ten_hex_chars() {
        let digest = short_digest(&["flows/sample.yaml", "42"]);
        assert_eq!(digest.len(), 10);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

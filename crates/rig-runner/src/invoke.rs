//! Adapter invocation: plan-time validation, reproducible argv rendering,
//! and bounded-lifetime subprocess execution.

use crate::artifacts::{ErrorKind, StepStatus};
use rig_config::{AdapterManifest, FlowStep, ParamValue};
use rig_core::{ensure_dir, Result, RigError};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use tracing::warn;

const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Rejects unknown parameter names, type mismatches, and manifest bound-hint
/// violations before any process is started. Sweep lists are validated
/// element-wise so a bad sweep value fails the whole plan.
pub fn validate_step(step: &FlowStep, manifest: &AdapterManifest) -> Result<()> {
    for (name, value) in &step.parameters {
        let param = manifest.parameter(name).ok_or_else(|| {
            RigError::Validation(format!(
                "step '{}': parameter '{}' not declared by adapter '{}'",
                step.name, name, manifest.name
            ))
        })?;
        param.validate(value)?;
    }
    for (name, values) in &step.sweeps {
        let param = manifest.parameter(name).ok_or_else(|| {
            RigError::Validation(format!(
                "step '{}': sweep parameter '{}' not declared by adapter '{}'",
                step.name, name, manifest.name
            ))
        })?;
        for value in values {
            param.validate(value)?;
        }
    }
    Ok(())
}

/// Relative executables with a path component resolve against the project
/// root; bare names go through `PATH` at spawn time.
pub fn resolve_executable(manifest: &AdapterManifest, root: &Path) -> PathBuf {
    let exe = &manifest.executable;
    if exe.is_absolute() || exe.components().count() == 1 {
        exe.clone()
    } else {
        root.join(exe)
    }
}

/// Builds the argument vector: executable, fixed prelude, then declared
/// parameters in manifest order as `--kebab-name value` (`--flag` alone for
/// true flags, omitted for false). Supplied parameters must already have
/// passed `validate_step`, so unknown names cannot reach this point.
pub fn build_command(
    manifest: &AdapterManifest,
    executable: &Path,
    params: &[(String, ParamValue)],
) -> Vec<String> {
    let mut argv = Vec::with_capacity(2 + manifest.args.len() + params.len() * 2);
    argv.push(executable.to_string_lossy().to_string());
    argv.extend(manifest.args.iter().cloned());
    for declared in &manifest.parameters {
        let Some((_, value)) = params.iter().find(|(name, _)| *name == declared.name) else {
            continue;
        };
        let flag = format!("--{}", declared.name.replace('_', "-"));
        match value {
            ParamValue::Flag(true) => argv.push(flag),
            ParamValue::Flag(false) => {}
            other => {
                argv.push(flag);
                argv.push(other.render());
            }
        }
    }
    argv
}

/// Outcome of one invocation attempt. Spawn failures and timeouts are
/// reported here as `error` outcomes, never conflated with a diagnostic
/// failure (`failed` = the adapter ran and exited non-zero).
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationOutcome {
    pub status: StepStatus,
    pub error_kind: Option<ErrorKind>,
    pub exit_code: Option<i32>,
    pub detail: Option<String>,
}

impl InvocationOutcome {
    fn error(detail: String) -> Self {
        InvocationOutcome {
            status: StepStatus::Error,
            error_kind: Some(ErrorKind::Execution),
            exit_code: None,
            detail: Some(detail),
        }
    }
}

/// Runs the argv with stdout/stderr captured to files, blocking until exit
/// or timeout. On timeout the process is killed before the outcome is
/// returned. This is the engine's only blocking point.
pub fn invoke(
    argv: &[String],
    stdout_path: &Path,
    stderr_path: &Path,
    env: &[(String, String)],
    timeout: Duration,
) -> Result<InvocationOutcome> {
    if argv.is_empty() {
        return Err(RigError::Execution("empty argument vector".to_string()));
    }
    if let Some(parent) = stdout_path.parent() {
        ensure_dir(parent)?;
    }
    if let Some(parent) = stderr_path.parent() {
        ensure_dir(parent)?;
    }
    let stdout_file = fs::File::create(stdout_path)?;
    let stderr_file = fs::File::create(stderr_path)?;

    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(stdout_file));
    cmd.stderr(Stdio::from(stderr_file));
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(InvocationOutcome::error(format!(
                "executable not found: {}",
                argv[0]
            )));
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Ok(InvocationOutcome::error(format!(
                "executable not permitted: {}",
                argv[0]
            )));
        }
        Err(e) => {
            return Ok(InvocationOutcome::error(format!(
                "failed to launch {}: {}",
                argv[0], e
            )));
        }
    };

    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) => {
                return Ok(match status.code() {
                    Some(0) => InvocationOutcome {
                        status: StepStatus::Passed,
                        error_kind: None,
                        exit_code: Some(0),
                        detail: None,
                    },
                    Some(code) => InvocationOutcome {
                        status: StepStatus::Failed,
                        error_kind: None,
                        exit_code: Some(code),
                        detail: Some(format!("adapter exited with code {}", code)),
                    },
                    None => InvocationOutcome {
                        status: StepStatus::Error,
                        error_kind: Some(ErrorKind::Execution),
                        exit_code: None,
                        detail: Some("adapter terminated by signal".to_string()),
                    },
                });
            }
            None => {
                if Instant::now() >= deadline {
                    warn!(argv = %argv.join(" "), "adapter timed out, killing");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Ok(InvocationOutcome::error(format!(
                        "adapter timed out after {}s",
                        timeout.as_secs()
                    )));
                }
                std::thread::sleep(KILL_POLL_INTERVAL);
            }
        }
    }
}

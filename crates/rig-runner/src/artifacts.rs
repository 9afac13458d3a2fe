//! Run artifacts: directory layout, the append-only step log, and the
//! roll-up derived from it. This module is the only writer of persisted
//! step and summary records.

use crate::expand::MarginPoint;
use rig_core::{atomic_write_json_pretty, ensure_dir, sanitize, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Passed => "passed",
            StepStatus::Failed => "failed",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
        }
    }
}

/// Why a step was marked `error`: a safety gate stopped it, or the process
/// could not run to completion. The distinction drives the run verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Safety,
    Execution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Pass,
    Fail,
    SafetyAbort,
    InfraError,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
            Verdict::SafetyAbort => "safety-abort",
            Verdict::InfraError => "infra-error",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Pass => 0,
            Verdict::Fail => 1,
            Verdict::SafetyAbort => 2,
            Verdict::InfraError => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepArtifacts {
    pub stdout: String,
    pub stderr: String,
}

/// One recorded step invocation. Append-only once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub adapter: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub started_at: String,
    pub completed_at: String,
    pub duration_s: f64,
    pub exit_code: Option<i32>,
    pub parameters: BTreeMap<String, String>,
    pub margin: BTreeMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<StepArtifacts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubRunReport {
    pub run_id: String,
    pub point: MarginPoint,
    pub status: StepStatus,
    pub started_at: String,
    pub completed_at: String,
    pub duration_s: f64,
    pub steps: Vec<StepResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Planned,
    Running,
    Completed,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocRef {
    pub path: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRef {
    pub source: String,
    pub name: String,
}

/// The parent-run summary persisted as `summary.json`. Rewritten atomically
/// after every sub-run so a crash mid-run leaves the latest truthful state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub schema_version: String,
    pub run_id: String,
    pub created_at: String,
    pub unit: Option<String>,
    pub seed: u64,
    pub dry_run: bool,
    pub state: RunState,
    pub verdict: Verdict,
    pub flow: DocRef,
    pub margin: DocRef,
    pub safety_policy: PolicyRef,
    pub plan_digest: String,
    pub counts: BTreeMap<String, usize>,
    pub total_duration_s: f64,
    pub subruns: Vec<SubRunReport>,
}

pub const RUN_SUMMARY_SCHEMA: &str = "run_summary_v1";
pub const STEP_RECORD_SCHEMA: &str = "step_record_v1";

/// Status counts, verdict, and total duration derived purely from step
/// records. Recomputing over the same records yields the same rollup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRollup {
    pub counts: BTreeMap<String, usize>,
    pub verdict: Verdict,
    pub total_duration_s: f64,
}

pub fn summarize_steps<'a, I>(steps: I) -> StepRollup
where
    I: IntoIterator<Item = &'a StepResult>,
{
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total_duration_s = 0.0;
    let mut saw_safety = false;
    let mut saw_execution = false;
    let mut saw_failed = false;
    for step in steps {
        *counts.entry(step.status.as_str().to_string()).or_default() += 1;
        total_duration_s += step.duration_s;
        match (step.status, step.error_kind) {
            (StepStatus::Error, Some(ErrorKind::Safety)) => saw_safety = true,
            (StepStatus::Error, _) => saw_execution = true,
            (StepStatus::Failed, _) => saw_failed = true,
            _ => {}
        }
    }
    let verdict = if saw_safety {
        Verdict::SafetyAbort
    } else if saw_execution {
        Verdict::InfraError
    } else if saw_failed {
        Verdict::Fail
    } else {
        Verdict::Pass
    };
    StepRollup {
        counts,
        verdict,
        total_duration_s,
    }
}

pub fn rollup_run(subruns: &[SubRunReport]) -> StepRollup {
    summarize_steps(subruns.iter().flat_map(|sub| sub.steps.iter()))
}

/// Sub-run status derived from its step records.
pub fn subrun_status(steps: &[StepResult]) -> StepStatus {
    if steps.iter().any(|s| s.status == StepStatus::Error) {
        StepStatus::Error
    } else if steps.iter().any(|s| s.status == StepStatus::Failed) {
        StepStatus::Failed
    } else if steps.iter().all(|s| s.status == StepStatus::Skipped) && !steps.is_empty() {
        StepStatus::Skipped
    } else {
        StepStatus::Passed
    }
}

/// File layout of a parent run directory.
#[derive(Debug, Clone)]
pub struct RunPaths {
    pub parent_id: String,
    pub base_dir: PathBuf,
}

impl RunPaths {
    pub fn new(parent_id: impl Into<String>, base_dir: impl Into<PathBuf>) -> Self {
        RunPaths {
            parent_id: parent_id.into(),
            base_dir: base_dir.into(),
        }
    }

    pub fn parent_dir(&self) -> PathBuf {
        self.base_dir.join(&self.parent_id)
    }

    pub fn plan_path(&self) -> PathBuf {
        self.parent_dir().join("plan.json")
    }

    pub fn summary_path(&self) -> PathBuf {
        self.parent_dir().join("summary.json")
    }

    pub fn facts_path(&self) -> PathBuf {
        self.parent_dir().join("facts.json")
    }

    pub fn safety_policy_path(&self) -> PathBuf {
        self.parent_dir().join("safety_policy.json")
    }

    pub fn markdown_report_path(&self) -> PathBuf {
        self.parent_dir().join("report.md")
    }

    pub fn html_report_path(&self) -> PathBuf {
        self.parent_dir().join("report.html")
    }

    pub fn subrun_dir(&self, subrun_id: &str) -> PathBuf {
        self.parent_dir().join("subruns").join(subrun_id)
    }

    pub fn subrun_summary(&self, subrun_id: &str) -> PathBuf {
        self.subrun_dir(subrun_id).join("summary.json")
    }

    pub fn subrun_ldjson(&self, subrun_id: &str) -> PathBuf {
        self.subrun_dir(subrun_id).join("steps.ldjson")
    }

    fn step_file(step_name: &str, index: usize, invocation: usize) -> String {
        let mut suffix = format!("{:02}_{}", index, sanitize(step_name));
        if invocation > 0 {
            suffix.push_str(&format!("_{:02}", invocation));
        }
        suffix
    }

    pub fn step_stdout(
        &self,
        subrun_id: &str,
        step_name: &str,
        index: usize,
        invocation: usize,
    ) -> PathBuf {
        self.subrun_dir(subrun_id)
            .join("stdout")
            .join(format!("{}.log", Self::step_file(step_name, index, invocation)))
    }

    pub fn step_stderr(
        &self,
        subrun_id: &str,
        step_name: &str,
        index: usize,
        invocation: usize,
    ) -> PathBuf {
        self.subrun_dir(subrun_id)
            .join("stderr")
            .join(format!("{}.log", Self::step_file(step_name, index, invocation)))
    }
}

/// Append-only line-delimited JSON step log. Each append opens, writes one
/// line, and closes, so a crash mid-run leaves every completed record
/// intact and readable.
#[derive(Debug)]
pub struct StepLogger {
    path: PathBuf,
}

impl StepLogger {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        Ok(StepLogger { path })
    }

    pub fn append(&self, record: &Value) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

pub fn read_step_log(path: &Path) -> Result<Vec<Value>> {
    let data = fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in data.lines() {
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}

pub fn write_summary(path: &Path, report: &RunReport) -> Result<()> {
    atomic_write_json_pretty(path, &serde_json::to_value(report)?)
}

pub fn write_subrun_summary(path: &Path, report: &SubRunReport) -> Result<()> {
    atomic_write_json_pretty(path, &serde_json::to_value(report)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn step(name: &str, status: StepStatus, error_kind: Option<ErrorKind>, duration: f64) -> StepResult {
        StepResult {
            name: name.into(),
            adapter: "echo".into(),
            status,
            error_kind,
            started_at: "t0".into(),
            completed_at: "t1".into(),
            duration_s: duration,
            exit_code: None,
            parameters: BTreeMap::new(),
            margin: BTreeMap::new(),
            artifacts: None,
            error: None,
        }
    }

    #[test]
    fn summarize_is_idempotent() {
        let steps = vec![
            step("a", StepStatus::Passed, None, 1.0),
            step("b", StepStatus::Failed, None, 2.0),
            step("c", StepStatus::Skipped, None, 0.0),
        ];
        let first = summarize_steps(&steps);
        let second = summarize_steps(&steps);
        assert_eq!(first, second);
        assert_eq!(first.counts.get("passed"), Some(&1));
        assert_eq!(first.counts.get("failed"), Some(&1));
        assert_eq!(first.verdict, Verdict::Fail);
        assert_eq!(first.total_duration_s, 3.0);
    }

    #[test]
    fn verdict_precedence_safety_over_execution_over_failure() {
        let mixed = vec![
            step("a", StepStatus::Failed, None, 0.0),
            step("b", StepStatus::Error, Some(ErrorKind::Execution), 0.0),
            step("c", StepStatus::Error, Some(ErrorKind::Safety), 0.0),
        ];
        assert_eq!(summarize_steps(&mixed).verdict, Verdict::SafetyAbort);

        let infra = vec![
            step("a", StepStatus::Failed, None, 0.0),
            step("b", StepStatus::Error, Some(ErrorKind::Execution), 0.0),
        ];
        assert_eq!(summarize_steps(&infra).verdict, Verdict::InfraError);

        let all_skipped = vec![step("a", StepStatus::Skipped, None, 0.0)];
        assert_eq!(summarize_steps(&all_skipped).verdict, Verdict::Pass);
    }

    #[test]
    fn verdict_exit_codes_are_stable() {
        assert_eq!(Verdict::Pass.exit_code(), 0);
        assert_eq!(Verdict::Fail.exit_code(), 1);
        assert_eq!(Verdict::SafetyAbort.exit_code(), 2);
        assert_eq!(Verdict::InfraError.exit_code(), 3);
    }

    #[test]
    fn step_logger_appends_without_rewriting() {
        let dir = std::env::temp_dir().join(format!(
            "rig_ldjson_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        let path = dir.join("steps.ldjson");
        let logger = StepLogger::new(&path).expect("logger");
        logger
            .append(&serde_json::json!({"event": "step", "seq": 1}))
            .expect("append");
        logger
            .append(&serde_json::json!({"event": "step", "seq": 2}))
            .expect("append");
        let records = read_step_log(&path).expect("read");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["seq"], 1);
        assert_eq!(records[1]["seq"], 2);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn subrun_status_derivation() {
        assert_eq!(
            subrun_status(&[step("a", StepStatus::Passed, None, 0.0)]),
            StepStatus::Passed
        );
        assert_eq!(
            subrun_status(&[
                step("a", StepStatus::Passed, None, 0.0),
                step("b", StepStatus::Failed, None, 0.0)
            ]),
            StepStatus::Failed
        );
        assert_eq!(
            subrun_status(&[step("a", StepStatus::Error, Some(ErrorKind::Safety), 0.0)]),
            StepStatus::Error
        );
        assert_eq!(
            subrun_status(&[step("a", StepStatus::Skipped, None, 0.0)]),
            StepStatus::Skipped
        );
    }

    #[test]
    fn step_file_names_include_invocation_index() {
        let paths = RunPaths::new("rig-x", "/tmp/runs");
        let first = paths.step_stdout("rig-x-s00", "CPU Smoke", 0, 0);
        let second = paths.step_stdout("rig-x-s00", "CPU Smoke", 0, 2);
        assert!(first.to_string_lossy().ends_with("stdout/00_cpu-smoke.log"));
        assert!(second.to_string_lossy().ends_with("stdout/00_cpu-smoke_02.log"));
    }
}

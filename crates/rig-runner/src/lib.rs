//! Run planning and execution engine.
//!
//! `plan` turns documents into a fully-resolved, deterministic run plan;
//! `execute` drives it: one sub-run per margin point, steps strictly
//! sequential, the safety gate re-checked before every invocation, every
//! outcome recorded through the artifact layer before the next step starts.

pub mod artifacts;
pub mod expand;
pub mod export;
pub mod facts;
pub mod invoke;
pub mod paths;
pub mod report;
pub mod safety;

use crate::artifacts::{
    rollup_run, subrun_status, write_subrun_summary, write_summary, DocRef, ErrorKind, PolicyRef,
    RunPaths, RunReport, RunState, StepLogger, StepResult, StepStatus, SubRunReport, Verdict,
    RUN_SUMMARY_SCHEMA, STEP_RECORD_SCHEMA,
};
use crate::expand::{expand_points, MarginPoint};
use crate::invoke::{build_command, resolve_executable, validate_step, InvocationOutcome};
use crate::paths::ProjectPaths;
use crate::safety::{check, describe_violations, Violation};
use chrono::Utc;
use rig_config::{
    load_flow, load_margin_profile, load_safety_policy, AdapterRegistry, FailurePolicy,
    FlowDefinition, FlowStep, MarginProfile, ParamValue, SafetyPolicy,
};
use rig_core::{
    atomic_write_json_pretty, canonical_json_digest, ensure_dir, short_digest, timestamp_now,
    Result, RigError,
};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 3600;

/// One concrete adapter invocation with its resolved argument vector, fixed
/// at plan time so dry runs and real runs share identical command lines.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedInvocation {
    pub index: usize,
    pub parameters: Vec<(String, ParamValue)>,
    pub argv: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepPlan {
    pub step: FlowStep,
    /// Margin values applied while this step runs, by parameter name.
    pub margin: Vec<(String, f64)>,
    pub invocations: Vec<PlannedInvocation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubRunPlan {
    pub id: String,
    pub point: MarginPoint,
    pub steps: Vec<StepPlan>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunPlan {
    pub parent_id: String,
    pub flow_path: PathBuf,
    pub margin_path: Option<PathBuf>,
    pub safety_source: String,
    pub flow: FlowDefinition,
    pub profile: MarginProfile,
    pub policy: SafetyPolicy,
    pub seed: u64,
    pub subruns: Vec<SubRunPlan>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub unit: Option<String>,
    pub dry_run: bool,
    pub facts: BTreeMap<String, String>,
}

pub struct Engine {
    project_root: PathBuf,
    adapters_dir: PathBuf,
    runs_dir: PathBuf,
    policy_path: PathBuf,
}

impl Engine {
    pub fn new(paths: &ProjectPaths) -> Self {
        Engine {
            project_root: paths.root().to_path_buf(),
            adapters_dir: paths.adapters_dir(),
            runs_dir: paths.runs_dir(),
            policy_path: paths.policy_file(),
        }
    }

    pub fn with_dirs(
        project_root: impl Into<PathBuf>,
        adapters_dir: impl Into<PathBuf>,
        runs_dir: impl Into<PathBuf>,
        policy_path: impl Into<PathBuf>,
    ) -> Self {
        Engine {
            project_root: project_root.into(),
            adapters_dir: adapters_dir.into(),
            runs_dir: runs_dir.into(),
            policy_path: policy_path.into(),
        }
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Loads and validates every document, resolves the seed, and expands
    /// the full sub-run/step/invocation plan. Structural problems (unknown
    /// adapters, undeclared parameters, unknown margin targets) fail here,
    /// before any run directory exists.
    pub fn plan(
        &self,
        flow_path: &Path,
        margin_path: Option<&Path>,
        safety_policy: Option<(SafetyPolicy, String)>,
    ) -> Result<RunPlan> {
        let flow = load_flow(flow_path)?;
        let registry = AdapterRegistry::load(&self.adapters_dir)?;

        let profile = match margin_path {
            Some(path) => load_margin_profile(path)?,
            None => MarginProfile::default_profile(),
        };

        for (target, _) in &profile.targets {
            if target != "default" && !flow.steps.iter().any(|s| s.adapter == *target) {
                return Err(RigError::Validation(format!(
                    "margin target '{}' matches no adapter in flow '{}'",
                    target, flow.metadata.name
                )));
            }
        }

        let mut manifests: BTreeMap<String, rig_config::AdapterManifest> = BTreeMap::new();
        for step in &flow.steps {
            let manifest = registry.get(&step.adapter)?;
            validate_step(step, manifest)?;
            manifests.insert(step.adapter.clone(), manifest.clone());
        }

        let (policy, safety_source) = match safety_policy {
            Some((policy, source)) => (policy, source),
            None => (
                load_safety_policy(&self.policy_path)?,
                self.policy_path.display().to_string(),
            ),
        };

        let seed = profile
            .global_seed
            .unwrap_or_else(|| Utc::now().timestamp_micros() as u64);
        let points = expand_points(&profile, seed);

        let now = Utc::now();
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let parent_id = format!(
            "rig-{}-{}",
            timestamp,
            short_digest(&[
                &flow_path.display().to_string(),
                &seed.to_string(),
                &now.timestamp_micros().to_string()
            ])
        );

        let mut subruns = Vec::with_capacity(points.len());
        for point in points {
            let id = format!("{}-s{:02}", parent_id, point.index);
            let mut steps = Vec::with_capacity(flow.steps.len());
            for step in &flow.steps {
                let manifest = &manifests[&step.adapter];
                let executable = resolve_executable(manifest, &self.project_root);
                let margin = point.margin_for_adapter(&step.adapter);
                let invocations = step
                    .expanded_parameters()
                    .into_iter()
                    .enumerate()
                    .map(|(index, parameters)| {
                        let argv = build_command(manifest, &executable, &parameters);
                        PlannedInvocation {
                            index,
                            parameters,
                            argv,
                        }
                    })
                    .collect();
                steps.push(StepPlan {
                    step: step.clone(),
                    margin,
                    invocations,
                });
            }
            subruns.push(SubRunPlan { id, point, steps });
        }

        Ok(RunPlan {
            parent_id,
            flow_path: flow_path.to_path_buf(),
            margin_path: margin_path.map(Path::to_path_buf),
            safety_source,
            flow,
            profile,
            policy,
            seed,
            subruns,
        })
    }

    /// Executes (or dry-runs) a plan. The safety gate runs before every
    /// invocation; a violation records the offending step as `error`, skips
    /// everything not yet started, and aborts the whole run fail-closed.
    /// The returned report has already been persisted and rendered.
    pub fn execute(&self, plan: &RunPlan, options: &ExecuteOptions) -> Result<RunReport> {
        let run_paths = RunPaths::new(plan.parent_id.clone(), self.runs_dir.clone());
        ensure_dir(&run_paths.parent_dir())?;

        let plan_value = serde_json::to_value(plan)?;
        atomic_write_json_pretty(&run_paths.plan_path(), &plan_value)?;
        let plan_digest = canonical_json_digest(&plan_value);

        atomic_write_json_pretty(&run_paths.facts_path(), &serde_json::to_value(&options.facts)?)?;
        atomic_write_json_pretty(
            &run_paths.safety_policy_path(),
            &json!({
                "source": plan.safety_source,
                "policy": serde_json::to_value(&plan.policy)?,
            }),
        )?;

        let mut report = RunReport {
            schema_version: RUN_SUMMARY_SCHEMA.to_string(),
            run_id: plan.parent_id.clone(),
            created_at: timestamp_now(),
            unit: options.unit.clone(),
            seed: plan.seed,
            dry_run: options.dry_run,
            state: RunState::Running,
            verdict: Verdict::Pass,
            flow: DocRef {
                path: Some(plan.flow_path.display().to_string()),
                name: Some(plan.flow.metadata.name.clone()),
            },
            margin: DocRef {
                path: plan.margin_path.as_ref().map(|p| p.display().to_string()),
                name: plan.profile.metadata.name.clone(),
            },
            safety_policy: PolicyRef {
                source: plan.safety_source.clone(),
                name: plan.policy.name.clone(),
            },
            plan_digest,
            counts: BTreeMap::new(),
            total_duration_s: 0.0,
            subruns: Vec::new(),
        };
        write_summary(&run_paths.summary_path(), &report)?;

        info!(
            run_id = %plan.parent_id,
            subruns = plan.subruns.len(),
            dry_run = options.dry_run,
            "run starting"
        );

        let mut safety_abort = false;
        for subplan in &plan.subruns {
            let skip_entirely = safety_abort;
            let sub_report =
                self.execute_subrun(plan, subplan, &run_paths, options, skip_entirely, &mut safety_abort)?;
            report.subruns.push(sub_report);

            let rollup = rollup_run(&report.subruns);
            report.counts = rollup.counts;
            report.verdict = rollup.verdict;
            report.total_duration_s = rollup.total_duration_s;
            write_summary(&run_paths.summary_path(), &report)?;
        }

        let rollup = rollup_run(&report.subruns);
        report.counts = rollup.counts;
        report.verdict = rollup.verdict;
        report.total_duration_s = rollup.total_duration_s;
        report.state = if safety_abort {
            RunState::Aborted
        } else if report.verdict == Verdict::InfraError {
            RunState::Failed
        } else {
            RunState::Completed
        };
        write_summary(&run_paths.summary_path(), &report)?;
        report::write_reports(&report, &run_paths)?;

        info!(
            run_id = %plan.parent_id,
            verdict = report.verdict.as_str(),
            "run finished"
        );
        Ok(report)
    }

    fn execute_subrun(
        &self,
        plan: &RunPlan,
        subplan: &SubRunPlan,
        run_paths: &RunPaths,
        options: &ExecuteOptions,
        skip_entirely: bool,
        safety_abort: &mut bool,
    ) -> Result<SubRunReport> {
        let sub_started = Instant::now();
        let started_at = timestamp_now();
        ensure_dir(&run_paths.subrun_dir(&subplan.id))?;
        let logger = StepLogger::new(run_paths.subrun_ldjson(&subplan.id))?;

        info!(sub_run_id = %subplan.id, point = %subplan.point.id, "sub-run starting");

        let mut results: Vec<StepResult> = Vec::new();
        let mut sub_halt = skip_entirely;
        for (step_index, step_plan) in subplan.steps.iter().enumerate() {
            let multi = step_plan.invocations.len() > 1;
            for invocation in &step_plan.invocations {
                let label = if multi {
                    format!("{}[{}]", step_plan.step.name, invocation.index)
                } else {
                    step_plan.step.name.clone()
                };
                let result = self.execute_invocation(
                    plan,
                    subplan,
                    step_plan,
                    invocation,
                    &label,
                    step_index,
                    run_paths,
                    options,
                    &logger,
                    sub_halt,
                )?;

                match (result.status, result.error_kind) {
                    (StepStatus::Error, Some(ErrorKind::Safety)) => {
                        *safety_abort = true;
                        sub_halt = true;
                    }
                    (StepStatus::Error, _) => sub_halt = true,
                    (StepStatus::Failed, _) => {
                        if plan.flow.metadata.on_failure == FailurePolicy::Halt {
                            sub_halt = true;
                        }
                    }
                    _ => {}
                }
                results.push(result);
            }
        }

        let status = subrun_status(&results);
        let sub_report = SubRunReport {
            run_id: subplan.id.clone(),
            point: subplan.point.clone(),
            status,
            started_at,
            completed_at: timestamp_now(),
            duration_s: sub_started.elapsed().as_secs_f64(),
            steps: results,
        };
        write_subrun_summary(&run_paths.subrun_summary(&subplan.id), &sub_report)?;
        Ok(sub_report)
    }

    #[allow(clippy::too_many_arguments)]
    fn execute_invocation(
        &self,
        plan: &RunPlan,
        subplan: &SubRunPlan,
        step_plan: &StepPlan,
        invocation: &PlannedInvocation,
        label: &str,
        step_index: usize,
        run_paths: &RunPaths,
        options: &ExecuteOptions,
        logger: &StepLogger,
        skipped: bool,
    ) -> Result<StepResult> {
        let parameters: BTreeMap<String, String> = invocation
            .parameters
            .iter()
            .map(|(name, value)| (name.clone(), value.render()))
            .collect();
        let margin: BTreeMap<String, f64> = step_plan.margin.iter().cloned().collect();

        let started_at = timestamp_now();
        logger.append(&json!({
            "schema_version": STEP_RECORD_SCHEMA,
            "event": "step",
            "action": "start",
            "run_id": subplan.id,
            "step": label,
            "adapter": step_plan.step.adapter,
            "parameters": parameters,
            "margin": margin,
            "timestamp": started_at,
        }))?;

        let step_started = Instant::now();
        let mut result = StepResult {
            name: label.to_string(),
            adapter: step_plan.step.adapter.clone(),
            status: StepStatus::Skipped,
            error_kind: None,
            started_at: started_at.clone(),
            completed_at: started_at.clone(),
            duration_s: 0.0,
            exit_code: None,
            parameters,
            margin,
            artifacts: None,
            error: None,
        };

        if !skipped {
            let values = gate_values(step_plan, invocation);
            let violations = check(&values, &plan.policy, label);
            if !violations.is_empty() {
                let detail = describe_violations(&violations);
                warn!(sub_run_id = %subplan.id, step = label, %detail, "safety violation, aborting run");
                result.status = StepStatus::Error;
                result.error_kind = Some(ErrorKind::Safety);
                result.error = Some(format!("safety violation: {}", detail));
            } else if options.dry_run {
                result.status = StepStatus::Skipped;
            } else {
                let stdout_path = run_paths.step_stdout(
                    &subplan.id,
                    &step_plan.step.name,
                    step_index,
                    invocation.index,
                );
                let stderr_path = run_paths.step_stderr(
                    &subplan.id,
                    &step_plan.step.name,
                    step_index,
                    invocation.index,
                );
                let env = build_step_env(plan, subplan, step_plan, invocation);
                let timeout = Duration::from_secs(
                    step_plan
                        .step
                        .timeout_secs
                        .or(plan.flow.metadata.step_timeout_secs)
                        .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS),
                );
                let outcome: InvocationOutcome =
                    invoke::invoke(&invocation.argv, &stdout_path, &stderr_path, &env, timeout)?;
                result.status = outcome.status;
                result.error_kind = outcome.error_kind;
                result.exit_code = outcome.exit_code;
                result.error = outcome.detail;
                let parent = run_paths.parent_dir();
                result.artifacts = Some(artifacts::StepArtifacts {
                    stdout: relative_display(&stdout_path, &parent),
                    stderr: relative_display(&stderr_path, &parent),
                });
                if result.status == StepStatus::Failed {
                    warn!(sub_run_id = %subplan.id, step = label, exit_code = ?result.exit_code, "step failed");
                }
            }
        }

        result.duration_s = step_started.elapsed().as_secs_f64();
        result.completed_at = timestamp_now();
        logger.append(&json!({
            "schema_version": STEP_RECORD_SCHEMA,
            "event": "step",
            "action": "end",
            "run_id": subplan.id,
            "step": label,
            "adapter": step_plan.step.adapter,
            "status": result.status.as_str(),
            "duration_s": result.duration_s,
            "exit_code": result.exit_code,
            "error": result.error,
            "timestamp": result.completed_at,
        }))?;
        Ok(result)
    }
}

/// Values the safety gate inspects for one invocation: the step's margin
/// settings plus every numeric parameter.
fn gate_values(step_plan: &StepPlan, invocation: &PlannedInvocation) -> Vec<(String, f64)> {
    let mut values = step_plan.margin.clone();
    for (name, value) in &invocation.parameters {
        if let Some(v) = value.as_f64() {
            values.push((name.clone(), v));
        }
    }
    values
}

fn relative_display(path: &Path, base: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .to_string_lossy()
        .to_string()
}

fn env_key(prefix: &str, name: &str) -> String {
    let mut key = String::with_capacity(prefix.len() + name.len());
    key.push_str(prefix);
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            key.push(ch.to_ascii_uppercase());
        } else {
            key.push('_');
        }
    }
    key
}

fn build_step_env(
    plan: &RunPlan,
    subplan: &SubRunPlan,
    step_plan: &StepPlan,
    invocation: &PlannedInvocation,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("RIG_RUN_ID".to_string(), plan.parent_id.clone()),
        ("RIG_SUB_RUN_ID".to_string(), subplan.id.clone()),
        ("RIG_STEP_NAME".to_string(), step_plan.step.name.clone()),
        ("RIG_STEP_ADAPTER".to_string(), step_plan.step.adapter.clone()),
        ("RIG_MARGIN_POINT".to_string(), subplan.point.id.clone()),
        ("RIG_GLOBAL_SEED".to_string(), plan.seed.to_string()),
        ("RIG_POINT_SEED".to_string(), subplan.point.seed.to_string()),
    ];
    for (name, value) in &invocation.parameters {
        env.push((env_key("RIG_PARAM_", name), value.render()));
    }
    for (name, value) in &step_plan.margin {
        env.push((env_key("RIG_MARGIN_", name), value.to_string()));
    }
    env
}

/// Expands a margin profile and checks every point against a policy without
/// touching the filesystem. Used by `margins validate` and pre-flight
/// tooling; the run-time gate performs the same check per step.
pub fn validate_margin_against_policy(
    profile: &MarginProfile,
    policy: &SafetyPolicy,
) -> Vec<Violation> {
    let seed = profile.global_seed.unwrap_or(0);
    let mut violations = Vec::new();
    for point in expand_points(profile, seed) {
        for (target, setting) in &point.settings {
            let values = vec![
                ("voltage_mv".to_string(), setting.voltage_mv),
                ("freq_mhz".to_string(), setting.freq_mhz),
            ];
            let scope = format!("{}/{}", point.id, target);
            violations.extend(check(&values, policy, &scope));
        }
    }
    violations
}

/// Most recently written run directory under `runs_dir`, by summary mtime.
pub fn find_latest_run(runs_dir: &Path) -> Result<Option<PathBuf>> {
    let mut latest: Option<(std::time::SystemTime, PathBuf)> = None;
    if !runs_dir.exists() {
        return Ok(None);
    }
    for entry in fs::read_dir(runs_dir)? {
        let path = entry?.path();
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
        if !path.is_dir() || !name.starts_with("rig-") {
            continue;
        }
        let summary = path.join("summary.json");
        let Ok(meta) = fs::metadata(&summary) else { continue };
        let Ok(mtime) = meta.modified() else { continue };
        match &latest {
            Some((best, _)) if *best >= mtime => {}
            _ => latest = Some((mtime, path)),
        }
    }
    Ok(latest.map(|(_, path)| path))
}

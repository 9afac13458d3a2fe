use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use rig_config::{load_margin_profile, load_policy_document, load_safety_policy, SafetyPolicy};
use rig_runner::artifacts::{RunPaths, RunReport, Verdict};
use rig_runner::facts::collect_facts;
use rig_runner::paths::ProjectPaths;
use rig_runner::safety::{select_profile, HostFingerprint};
use rig_runner::{find_latest_run, validate_margin_against_policy, Engine, ExecuteOptions};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rig", version, about = "Margin test planning and execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a flow with an optional margin profile.
    Run {
        #[arg(long)]
        flow: PathBuf,
        /// Unit-under-test identifier recorded in the summary.
        #[arg(long)]
        unit: Option<String>,
        #[arg(long)]
        margin: Option<PathBuf>,
        /// Plan and safety-check everything, launch nothing.
        #[arg(long)]
        dry_run: bool,
        /// Accept an auto-selected safety profile without prompting.
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
    /// Preview the expanded plan without executing.
    Plan {
        #[arg(long)]
        flow: PathBuf,
        #[arg(long)]
        margin: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List available flow documents.
    ListFlows,
    /// Margin profile utilities.
    Margins {
        #[command(subcommand)]
        command: MarginCommands,
    },
    /// Regenerate reports for a recorded run.
    Report {
        #[arg(long)]
        run_id: String,
    },
    /// Export a run's step records.
    Export {
        #[arg(long)]
        run: String,
        #[arg(long, default_value = "csv")]
        format: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Remove finalized runs older than N days.
    Clean {
        #[arg(long)]
        older_than: u32,
    },
    /// Re-plan and re-execute the most recent run.
    RerunLast {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum MarginCommands {
    /// List available margin profiles.
    List,
    /// Check a margin profile against the current safety policy.
    Validate {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("RIG_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json!({
                    "ok": false,
                    "error": { "code": "command_failed", "message": err.to_string() }
                }));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Plan { json, .. }
        | Commands::RerunLast { json, .. } => *json,
        Commands::Margins {
            command: MarginCommands::Validate { json, .. },
        } => *json,
        _ => false,
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    let paths = ProjectPaths::from_env();
    match command {
        Commands::Run {
            flow,
            unit,
            margin,
            dry_run,
            yes,
            json,
        } => {
            let facts = collect_facts();
            let policy = resolve_policy(&paths, &facts, yes || json)?;
            let engine = Engine::new(&paths);
            let plan = engine.plan(&flow, margin.as_deref(), policy)?;
            let report = engine.execute(
                &plan,
                &ExecuteOptions {
                    unit,
                    dry_run,
                    facts,
                },
            )?;
            finish_run(&paths, &report, json)
        }
        Commands::Plan { flow, margin, json } => {
            let engine = Engine::new(&paths);
            let plan = engine.plan(&flow, margin.as_deref(), None)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "plan",
                    "plan": serde_json::to_value(&plan)?,
                })));
            }
            println!("plan: {}", plan.parent_id);
            println!("seed: {}", plan.seed);
            println!("safety_policy: {}", plan.safety_source);
            for sub in &plan.subruns {
                let details: Vec<String> = sub
                    .steps
                    .iter()
                    .map(|s| {
                        format!(
                            "{} ({}) x{}",
                            s.step.name,
                            s.step.adapter,
                            s.invocations.len()
                        )
                    })
                    .collect();
                println!("  {} [{}]: {}", sub.id, sub.point.id, details.join(", "));
            }
            Ok(None)
        }
        Commands::ListFlows => {
            list_documents(&paths.flows_dir(), "flows")?;
            Ok(None)
        }
        Commands::Margins { command } => match command {
            MarginCommands::List => {
                list_documents(&paths.margins_dir(), "margin profiles")?;
                Ok(None)
            }
            MarginCommands::Validate { file, json } => {
                let policy = load_safety_policy(&paths.policy_file())?;
                let profile = load_margin_profile(&file)?;
                let violations = validate_margin_against_policy(&profile, &policy);
                if json {
                    return Ok(Some(json!({
                        "ok": violations.is_empty(),
                        "command": "margins-validate",
                        "file": file.display().to_string(),
                        "violations": serde_json::to_value(&violations)?,
                    })));
                }
                if violations.is_empty() {
                    println!("{} is valid against policy '{}'", file.display(), policy.name);
                    Ok(None)
                } else {
                    for violation in &violations {
                        eprintln!("violation: {}", violation);
                    }
                    std::process::exit(1);
                }
            }
        },
        Commands::Report { run_id } => {
            let run_paths = RunPaths::new(run_id.clone(), paths.runs_dir());
            let summary_path = run_paths.summary_path();
            if !summary_path.exists() {
                return Err(anyhow!("summary not found for run {}", run_id));
            }
            let report: RunReport =
                serde_json::from_value(rig_core::read_json_file(&summary_path)?)?;
            rig_runner::report::write_reports(&report, &run_paths)?;
            println!("regenerated reports for {}", run_id);
            println!("  {}", run_paths.markdown_report_path().display());
            println!("  {}", run_paths.html_report_path().display());
            Ok(None)
        }
        Commands::Export { run, format, out } => {
            if format.to_lowercase() != "csv" {
                return Err(anyhow!("only csv export is supported"));
            }
            let run_dir = paths.runs_dir().join(&run);
            if !run_dir.exists() {
                return Err(anyhow!("run directory {} not found", run_dir.display()));
            }
            let destination = rig_runner::export::export_csv(&run_dir, out.as_deref())?;
            println!("exported csv to {}", destination.display());
            Ok(None)
        }
        Commands::Clean { older_than } => {
            let cutoff = Utc::now() - Duration::days(i64::from(older_than));
            let mut removed = 0usize;
            let runs_dir = paths.runs_dir();
            if runs_dir.exists() {
                for entry in std::fs::read_dir(&runs_dir)? {
                    let path = entry?.path();
                    let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("");
                    if !path.is_dir() || !name.starts_with("rig-") {
                        continue;
                    }
                    let summary = path.join("summary.json");
                    let Ok(meta) = std::fs::metadata(&summary) else { continue };
                    let Ok(modified) = meta.modified() else { continue };
                    if DateTime::<Utc>::from(modified) < cutoff {
                        std::fs::remove_dir_all(&path)?;
                        removed += 1;
                    }
                }
            }
            println!("removed {} runs older than {} days", removed, older_than);
            Ok(None)
        }
        Commands::RerunLast { json } => {
            let run_dir = find_latest_run(&paths.runs_dir())?
                .ok_or_else(|| anyhow!("no previous runs found"))?;
            let previous: RunReport =
                serde_json::from_value(rig_core::read_json_file(&run_dir.join("summary.json"))?)?;
            let flow_path = previous
                .flow
                .path
                .as_deref()
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("previous run has no recorded flow path"))?;
            if !flow_path.exists() {
                return Err(anyhow!("flow path {} not found", flow_path.display()));
            }
            let margin_path = previous
                .margin
                .path
                .as_deref()
                .map(PathBuf::from)
                .filter(|p| p.exists());

            let policy_source = Path::new(&previous.safety_policy.source);
            let policy = if policy_source.exists() {
                match load_policy_document(policy_source) {
                    Ok(policy) => Some((policy, previous.safety_policy.source.clone())),
                    Err(e) => {
                        eprintln!(
                            "failed to load recorded safety policy {}: {}; using default policy",
                            previous.safety_policy.source, e
                        );
                        None
                    }
                }
            } else {
                eprintln!(
                    "recorded safety policy {} missing; using default policy",
                    previous.safety_policy.source
                );
                None
            };

            let engine = Engine::new(&paths);
            let plan = engine.plan(&flow_path, margin_path.as_deref(), policy)?;
            let report = engine.execute(
                &plan,
                &ExecuteOptions {
                    unit: previous.unit.clone(),
                    dry_run: false,
                    facts: collect_facts(),
                },
            )?;
            finish_run(&paths, &report, json)
        }
    }
}

/// Auto-selects a safety profile for this host, falling back to
/// `policy/safety.yaml` when nothing matches. Returns the policy plus its
/// source identity, or `None` to let the engine load the default.
fn resolve_policy(
    paths: &ProjectPaths,
    facts: &std::collections::BTreeMap<String, String>,
    assume_yes: bool,
) -> Result<Option<(SafetyPolicy, String)>> {
    let profiles = rig_config::load_safety_profiles(&paths.policy_profiles_dir())?;
    let fingerprint = HostFingerprint::from_facts(facts);
    let Some(profile) = select_profile(&profiles, facts) else {
        eprintln!(
            "no safety profile matched this host ({}); falling back to {}",
            fingerprint.label(),
            paths.policy_file().display()
        );
        return Ok(None);
    };

    eprintln!("detected: {}", fingerprint.label());
    eprintln!(
        "auto-selected safety profile: {} (source: {})",
        profile.name,
        profile.source.display()
    );
    if let Some(description) = &profile.description {
        eprintln!("{}", description);
    }
    for (parameter, bound) in &profile.policy.bounds {
        eprintln!(
            "  {}: [{}, {}]",
            parameter,
            bound.min.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
            bound.max.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
        );
    }
    if !assume_yes && !confirm(&format!("use safety profile '{}'?", profile.name))? {
        return Err(anyhow!("run cancelled by user"));
    }
    Ok(Some((
        profile.policy.clone(),
        profile.source.display().to_string(),
    )))
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [Y/n]: ", prompt);
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    let answer = line.trim().to_lowercase();
    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}

fn list_documents(dir: &Path, what: &str) -> Result<()> {
    let mut files: Vec<String> = Vec::new();
    if dir.exists() {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
            if path.is_file() && matches!(ext, "yaml" | "yml") {
                if let Some(name) = path.file_name().and_then(|s| s.to_str()) {
                    files.push(name.to_string());
                }
            }
        }
    }
    files.sort();
    if files.is_empty() {
        println!("no {} found under {}", what, dir.display());
    } else {
        for file in files {
            println!("{}", file);
        }
    }
    Ok(())
}

/// Prints (or emits) the run outcome and exits with the verdict code when
/// it is non-zero: 0 pass, 1 fail, 2 safety-abort, 3 infra-error.
fn finish_run(paths: &ProjectPaths, report: &RunReport, json: bool) -> Result<Option<Value>> {
    let run_dir = paths.runs_dir().join(&report.run_id);
    let exit_code = report.verdict.exit_code();
    if json {
        let payload = json!({
            "ok": report.verdict == Verdict::Pass,
            "command": "run",
            "run": {
                "run_id": report.run_id,
                "run_dir": run_dir.display().to_string(),
                "verdict": report.verdict.as_str(),
                "state": report.state,
                "seed": report.seed,
                "dry_run": report.dry_run,
                "counts": report.counts,
            }
        });
        if exit_code != 0 {
            emit_json(&payload);
            std::process::exit(exit_code);
        }
        return Ok(Some(payload));
    }
    println!("run_id: {}", report.run_id);
    println!("run_dir: {}", run_dir.display());
    println!("verdict: {}", report.verdict.as_str());
    if report.dry_run {
        println!("dry run: no adapters executed");
    } else {
        println!("report: {}", run_dir.join("report.md").display());
    }
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(None)
}

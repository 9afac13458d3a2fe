//! CSV export: one row per recorded step, flattened from a run's summary.

use crate::artifacts::RunReport;
use rig_core::{read_json_file, Result, RigError};
use std::path::{Path, PathBuf};

const HEADER: [&str; 8] = [
    "parent_run_id",
    "sub_run_id",
    "margin_point",
    "step_name",
    "adapter",
    "status",
    "exit_code",
    "duration_s",
];

pub fn export_csv(run_dir: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let summary_path = run_dir.join("summary.json");
    if !summary_path.exists() {
        return Err(RigError::Validation(format!(
            "no summary.json under {}",
            run_dir.display()
        )));
    }
    let report: RunReport = serde_json::from_value(read_json_file(&summary_path)?)?;

    let run_name = run_dir
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("run");
    let destination = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| run_dir.join(format!("{}_export.csv", run_name)));
    if let Some(parent) = destination.parent() {
        rig_core::ensure_dir(parent)?;
    }

    let mut writer = csv::Writer::from_path(&destination)
        .map_err(|e| RigError::Execution(format!("csv export failed: {}", e)))?;
    writer
        .write_record(HEADER)
        .map_err(|e| RigError::Execution(format!("csv export failed: {}", e)))?;
    for sub in &report.subruns {
        for step in &sub.steps {
            let exit_code = step.exit_code.map(|c| c.to_string()).unwrap_or_default();
            let duration = format!("{:.3}", step.duration_s);
            writer
                .write_record([
                    report.run_id.as_str(),
                    sub.run_id.as_str(),
                    sub.point.id.as_str(),
                    step.name.as_str(),
                    step.adapter.as_str(),
                    step.status.as_str(),
                    exit_code.as_str(),
                    duration.as_str(),
                ])
                .map_err(|e| RigError::Execution(format!("csv export failed: {}", e)))?;
        }
    }
    writer
        .flush()
        .map_err(|e| RigError::Execution(format!("csv export failed: {}", e)))?;
    Ok(destination)
}

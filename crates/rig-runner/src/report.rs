//! Markdown and HTML report rendering. Reports are derived views over the
//! recorded summary: regenerating them reads step data but never mutates it.

use crate::artifacts::{RunPaths, RunReport};
use rig_core::{atomic_write_bytes, Result};

pub fn render_markdown(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Run {}\n\n", report.run_id));
    out.push_str(&format!("- verdict: **{}**\n", report.verdict.as_str()));
    out.push_str(&format!("- created: {}\n", report.created_at));
    if let Some(unit) = &report.unit {
        out.push_str(&format!("- unit: {}\n", unit));
    }
    out.push_str(&format!("- seed: {}\n", report.seed));
    out.push_str(&format!(
        "- safety policy: {} ({})\n",
        report.safety_policy.name, report.safety_policy.source
    ));
    if report.dry_run {
        out.push_str("- dry run: no adapters were executed\n");
    }
    out.push_str(&format!(
        "- total duration: {:.3} s\n\n",
        report.total_duration_s
    ));

    if !report.counts.is_empty() {
        out.push_str("## Step counts\n\n");
        out.push_str("| Status | Count |\n|---|---|\n");
        for (status, count) in &report.counts {
            out.push_str(&format!("| {} | {} |\n", status, count));
        }
        out.push('\n');
    }

    out.push_str("## Sub-runs\n\n");
    for sub in &report.subruns {
        out.push_str(&format!(
            "### {} ({}, {})\n\n",
            sub.run_id,
            sub.point.id,
            sub.status.as_str()
        ));
        if !sub.point.settings.is_empty() {
            out.push_str("| Target | Voltage (mV) | Frequency (MHz) |\n|---|---|---|\n");
            for (target, setting) in &sub.point.settings {
                out.push_str(&format!(
                    "| {} | {} | {} |\n",
                    target, setting.voltage_mv, setting.freq_mhz
                ));
            }
            out.push('\n');
        }
        out.push_str("| Step | Adapter | Status | Exit | Duration (s) |\n|---|---|---|---|---|\n");
        for step in &sub.steps {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {:.3} |\n",
                step.name,
                step.adapter,
                step.status.as_str(),
                step.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                step.duration_s
            ));
        }
        out.push('\n');
        for step in &sub.steps {
            if let Some(error) = &step.error {
                out.push_str(&format!("- `{}`: {}\n", step.name, error));
            }
        }
        out.push('\n');
    }
    out
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn render_html(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str("<!DOCTYPE html>\n<html>\n<head>\n");
    out.push_str(&format!("<title>Run {}</title>\n", escape(&report.run_id)));
    out.push_str("<style>body{font-family:sans-serif;margin:2em}table{border-collapse:collapse}td,th{border:1px solid #999;padding:4px 8px}</style>\n");
    out.push_str("</head>\n<body>\n");
    out.push_str(&format!("<h1>Run {}</h1>\n", escape(&report.run_id)));
    out.push_str(&format!(
        "<p>verdict: <strong>{}</strong> | seed: {} | duration: {:.3} s</p>\n",
        report.verdict.as_str(),
        report.seed,
        report.total_duration_s
    ));
    out.push_str(&format!(
        "<p>safety policy: {} ({})</p>\n",
        escape(&report.safety_policy.name),
        escape(&report.safety_policy.source)
    ));
    for sub in &report.subruns {
        out.push_str(&format!(
            "<h2>{} ({}, {})</h2>\n",
            escape(&sub.run_id),
            escape(&sub.point.id),
            sub.status.as_str()
        ));
        out.push_str("<table>\n<tr><th>Step</th><th>Adapter</th><th>Status</th><th>Exit</th><th>Duration (s)</th><th>Error</th></tr>\n");
        for step in &sub.steps {
            out.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{:.3}</td><td>{}</td></tr>\n",
                escape(&step.name),
                escape(&step.adapter),
                step.status.as_str(),
                step.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                step.duration_s,
                escape(step.error.as_deref().unwrap_or("")),
            ));
        }
        out.push_str("</table>\n");
    }
    out.push_str("</body>\n</html>\n");
    out
}

pub fn write_reports(report: &RunReport, run_paths: &RunPaths) -> Result<()> {
    atomic_write_bytes(
        &run_paths.markdown_report_path(),
        render_markdown(report).as_bytes(),
    )?;
    atomic_write_bytes(
        &run_paths.html_report_path(),
        render_html(report).as_bytes(),
    )?;
    Ok(())
}

//! Host-fact collection. Produces the flat fact table the safety resolver
//! consumes; the engine itself only ever reads the map, so callers may
//! substitute a canned table (tests, replays, remote units).

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;

fn run_command(program: &str, args: &[&str]) -> String {
    match Command::new(program).args(args).output() {
        Err(_) => "command-not-found".to_string(),
        Ok(output) => {
            if output.status.success() {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            } else {
                format!(
                    "error({}): {}",
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                )
            }
        }
    }
}

fn read_optional(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            "permission-denied".to_string()
        }
        Err(_) => "file-not-found".to_string(),
    }
}

fn parse_lscpu(output: &str) -> BTreeMap<String, String> {
    let mut parsed = BTreeMap::new();
    for line in output.lines() {
        if let Some((key, value)) = line.split_once(':') {
            parsed.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    parsed
}

/// Collects the fact table from the local host. Raw captures are kept
/// alongside the parsed attributes so the recorded `facts.json` stays
/// useful for postmortems on a different machine.
pub fn collect_facts() -> BTreeMap<String, String> {
    let mut facts = BTreeMap::new();

    let uname = run_command("uname", &["-a"]);
    let lscpu = run_command("lscpu", &[]);
    let parsed = parse_lscpu(&lscpu);

    if let Some(model) = parsed.get("model name") {
        facts.insert("cpu_model".to_string(), model.clone());
    }
    let architecture = parsed
        .get("architecture")
        .cloned()
        .unwrap_or_else(|| uname.clone());
    facts.insert("architecture".to_string(), architecture);
    if let Some(count) = parsed.get("cpu(s)") {
        if let Some(first) = count.split_whitespace().next() {
            if first.parse::<u64>().is_ok() {
                facts.insert("total_cores".to_string(), first.to_string());
            }
        }
    }

    facts.insert("kernel".to_string(), run_command("uname", &["-r"]));
    facts.insert("uname".to_string(), uname);
    facts.insert("lscpu".to_string(), lscpu);
    facts.insert("meminfo".to_string(), read_optional(Path::new("/proc/meminfo")));
    facts.insert("cpuinfo".to_string(), read_optional(Path::new("/proc/cpuinfo")));
    facts
}

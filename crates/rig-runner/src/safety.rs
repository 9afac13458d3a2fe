//! Safety policy resolution and bound checking.
//!
//! Selection is a ranked-candidate evaluation over the loaded profiles:
//! priority first, then predicate specificity, then source filename. The
//! check side returns every violation, not just the first, so operators see
//! the whole problem at once.

use rig_config::{MatchRule, SafetyPolicy, SafetyProfile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Parsed view of the host-fact table used for profile matching.
#[derive(Debug, Clone, Default)]
pub struct HostFingerprint {
    pub cpu_model: String,
    pub architecture: String,
    pub total_cores: Option<u64>,
}

impl HostFingerprint {
    pub fn from_facts(facts: &BTreeMap<String, String>) -> Self {
        HostFingerprint {
            cpu_model: facts.get("cpu_model").cloned().unwrap_or_default(),
            architecture: facts.get("architecture").cloned().unwrap_or_default(),
            total_cores: facts
                .get("total_cores")
                .and_then(|v| v.parse::<u64>().ok()),
        }
    }

    pub fn label(&self) -> String {
        if !self.cpu_model.is_empty() {
            self.cpu_model.clone()
        } else if !self.architecture.is_empty() {
            self.architecture.clone()
        } else {
            "unknown CPU".to_string()
        }
    }
}

fn rule_matches(rule: &MatchRule, fingerprint: &HostFingerprint) -> bool {
    let cpu_model = fingerprint.cpu_model.to_lowercase();
    let architecture = fingerprint.architecture.to_lowercase();

    if !rule.cpu_model_contains.is_empty()
        && !rule
            .cpu_model_contains
            .iter()
            .any(|s| cpu_model.contains(&s.to_lowercase()))
    {
        return false;
    }
    if !rule.architecture_contains.is_empty()
        && !rule
            .architecture_contains
            .iter()
            .any(|s| architecture.contains(&s.to_lowercase()))
    {
        return false;
    }
    // Core-count predicates only apply when the fact table actually knows
    // the count; an unknown count never disqualifies a profile.
    if let (Some(min), Some(cores)) = (rule.min_cores, fingerprint.total_cores) {
        if cores < min {
            return false;
        }
    }
    if let (Some(max), Some(cores)) = (rule.max_cores, fingerprint.total_cores) {
        if cores > max {
            return false;
        }
    }
    true
}

/// Selects the authoritative profile for this host, or `None` when nothing
/// matches. `profiles` must already be in sorted filename order (the loader
/// guarantees this), which serves as the final tie-break.
pub fn select_profile<'a>(
    profiles: &'a [SafetyProfile],
    facts: &BTreeMap<String, String>,
) -> Option<&'a SafetyProfile> {
    let fingerprint = HostFingerprint::from_facts(facts);
    let mut matches: Vec<&SafetyProfile> = profiles
        .iter()
        .filter(|profile| rule_matches(&profile.match_rule, &fingerprint))
        .collect();
    // Stable sort: filename order survives as the last tie-break.
    matches.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.match_rule.predicate_count().cmp(&a.match_rule.predicate_count()))
    });
    matches.into_iter().next()
}

/// One out-of-bounds parameter. `scope` names where the value came from
/// (target, step, or sweep) for the operator-facing message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub scope: String,
    pub parameter: String,
    pub value: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}={} outside [{}, {}]",
            self.scope,
            self.parameter,
            self.value,
            self.min.map(|v| v.to_string()).unwrap_or_else(|| "-inf".into()),
            self.max.map(|v| v.to_string()).unwrap_or_else(|| "+inf".into()),
        )
    }
}

pub fn describe_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(Violation::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Checks every named value against the policy bounds (inclusive) and
/// returns the complete violation list. Parameters without a declared bound
/// pass; the policy constrains only what it names.
pub fn check(values: &[(String, f64)], policy: &SafetyPolicy, scope: &str) -> Vec<Violation> {
    let mut violations = Vec::new();
    for (parameter, value) in values {
        if let Some(bound) = policy.bound(parameter) {
            if !bound.contains(*value) {
                violations.push(Violation {
                    scope: scope.to_string(),
                    parameter: parameter.clone(),
                    value: *value,
                    min: bound.min,
                    max: bound.max,
                });
            }
        }
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_config::Bound;
    use std::path::PathBuf;

    fn policy(bounds: &[(&str, Option<f64>, Option<f64>)]) -> SafetyPolicy {
        SafetyPolicy {
            name: "test".into(),
            description: None,
            bounds: bounds
                .iter()
                .map(|(name, min, max)| {
                    (name.to_string(), Bound {
                        min: *min,
                        max: *max,
                    })
                })
                .collect(),
        }
    }

    fn profile(name: &str, priority: i64, rule: MatchRule) -> SafetyProfile {
        SafetyProfile {
            name: name.into(),
            description: None,
            priority,
            match_rule: rule,
            policy: policy(&[("voltage_mv", Some(900.0), Some(1000.0))]),
            source: PathBuf::from(format!("{}.yaml", name)),
        }
    }

    fn epyc_facts() -> BTreeMap<String, String> {
        let mut facts = BTreeMap::new();
        facts.insert("cpu_model".into(), "AMD EPYC 9274F".into());
        facts.insert("architecture".into(), "x86_64".into());
        facts.insert("total_cores".into(), "16".into());
        facts
    }

    #[test]
    fn check_reports_every_violation_not_just_first() {
        let policy = policy(&[
            ("voltage_mv", Some(900.0), Some(1350.0)),
            ("freq_mhz", Some(1000.0), Some(2400.0)),
        ]);
        let values = vec![
            ("voltage_mv".to_string(), 1450.0),
            ("freq_mhz".to_string(), 800.0),
        ];
        let violations = check(&values, &policy, "point-0/core0");
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].parameter, "voltage_mv");
        assert_eq!(violations[0].max, Some(1350.0));
        assert_eq!(violations[1].parameter, "freq_mhz");
    }

    #[test]
    fn check_is_empty_iff_within_inclusive_bounds() {
        let policy = policy(&[("voltage_mv", Some(900.0), Some(1000.0))]);
        assert!(check(&[("voltage_mv".into(), 1000.0)], &policy, "s").is_empty());
        assert!(check(&[("voltage_mv".into(), 900.0)], &policy, "s").is_empty());
        assert!(!check(&[("voltage_mv".into(), 1000.01)], &policy, "s").is_empty());
        // Unbounded parameters pass.
        assert!(check(&[("soc_mv".into(), 9999.0)], &policy, "s").is_empty());
    }

    #[test]
    fn select_prefers_higher_priority() {
        let profiles = vec![
            profile(
                "a-generic",
                0,
                MatchRule {
                    cpu_model_contains: vec!["EPYC".into()],
                    ..MatchRule::default()
                },
            ),
            profile(
                "b-genoa",
                10,
                MatchRule {
                    cpu_model_contains: vec!["EPYC".into()],
                    ..MatchRule::default()
                },
            ),
        ];
        let selected = select_profile(&profiles, &epyc_facts()).expect("match");
        assert_eq!(selected.name, "b-genoa");
    }

    #[test]
    fn select_breaks_priority_ties_by_specificity_then_filename() {
        let profiles = vec![
            profile(
                "a-broad",
                5,
                MatchRule {
                    cpu_model_contains: vec!["EPYC".into()],
                    ..MatchRule::default()
                },
            ),
            profile(
                "b-specific",
                5,
                MatchRule {
                    cpu_model_contains: vec!["EPYC".into()],
                    min_cores: Some(8),
                    ..MatchRule::default()
                },
            ),
            profile(
                "c-specific-too",
                5,
                MatchRule {
                    cpu_model_contains: vec!["EPYC".into()],
                    min_cores: Some(4),
                    ..MatchRule::default()
                },
            ),
        ];
        let selected = select_profile(&profiles, &epyc_facts()).expect("match");
        // b and c tie on priority and predicate count; filename order wins.
        assert_eq!(selected.name, "b-specific");
    }

    #[test]
    fn select_skips_non_matching_profiles() {
        let profiles = vec![
            profile(
                "xeon-only",
                100,
                MatchRule {
                    cpu_model_contains: vec!["Xeon".into()],
                    ..MatchRule::default()
                },
            ),
            profile(
                "big-iron",
                0,
                MatchRule {
                    min_cores: Some(128),
                    ..MatchRule::default()
                },
            ),
        ];
        assert!(select_profile(&profiles, &epyc_facts()).is_none());
    }

    #[test]
    fn unknown_core_count_does_not_disqualify() {
        let profiles = vec![profile(
            "cores",
            0,
            MatchRule {
                min_cores: Some(8),
                ..MatchRule::default()
            },
        )];
        let mut facts = epyc_facts();
        facts.remove("total_cores");
        assert!(select_profile(&profiles, &facts).is_some());
    }
}

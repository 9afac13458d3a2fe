//! Margin point expansion: profile + seed in, deterministic ordered point
//! list out. No state, no ambient randomness — the only RNG is seeded from
//! the point's derived seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rig_config::MarginProfile;
use rig_core::derive_point_seed;
use serde::{Deserialize, Serialize};

/// Resolved margin values for one target at one point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarginSetting {
    pub voltage_mv: f64,
    pub freq_mhz: f64,
}

/// One fully-resolved combination of target settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarginPoint {
    pub id: String,
    pub index: usize,
    pub seed: u64,
    /// Settings per target in profile declaration order.
    pub settings: Vec<(String, MarginSetting)>,
}

impl MarginPoint {
    pub fn setting(&self, target: &str) -> Option<&MarginSetting> {
        self.settings
            .iter()
            .find(|(name, _)| name == target)
            .map(|(_, setting)| setting)
    }

    /// Margin values a step under `adapter` runs with: the adapter-named
    /// target if declared, else `default`, else nothing.
    pub fn margin_for_adapter(&self, adapter: &str) -> Vec<(String, f64)> {
        let setting = self
            .setting(adapter)
            .or_else(|| self.setting("default"));
        match setting {
            Some(s) => vec![
                ("voltage_mv".to_string(), s.voltage_mv),
                ("freq_mhz".to_string(), s.freq_mhz),
            ],
            None => Vec::new(),
        }
    }
}

struct Axis {
    target_index: usize,
    voltage: bool,
    values: Vec<f64>,
}

/// Expands a profile into its ordered point list. Axis order is target
/// declaration order with voltage before frequency; the rightmost axis
/// varies fastest, so the sequence is identical for identical inputs.
/// Jitter offsets come from `StdRng` seeded with the point's derived seed.
pub fn expand_points(profile: &MarginProfile, global_seed: u64) -> Vec<MarginPoint> {
    let mut axes: Vec<Axis> = Vec::new();
    for (target_index, (_, spec)) in profile.targets.iter().enumerate() {
        axes.push(Axis {
            target_index,
            voltage: true,
            values: spec.voltage_mv.values(),
        });
        axes.push(Axis {
            target_index,
            voltage: false,
            values: spec.freq_mhz.values(),
        });
    }

    let total: usize = axes.iter().map(|axis| axis.values.len()).product::<usize>().max(1);
    let mut points = Vec::with_capacity(total);
    for index in 0..total {
        let seed = derive_point_seed(global_seed, index as u64);

        let mut settings: Vec<(String, MarginSetting)> = profile
            .targets
            .iter()
            .map(|(name, _)| {
                (
                    name.clone(),
                    MarginSetting {
                        voltage_mv: 0.0,
                        freq_mhz: 0.0,
                    },
                )
            })
            .collect();

        let mut rem = index;
        for axis in axes.iter().rev() {
            let pick = rem % axis.values.len();
            rem /= axis.values.len();
            let slot = &mut settings[axis.target_index].1;
            if axis.voltage {
                slot.voltage_mv = axis.values[pick];
            } else {
                slot.freq_mhz = axis.values[pick];
            }
        }

        apply_jitter(profile, &mut settings, seed);

        points.push(MarginPoint {
            id: format!("point-{}", index),
            index,
            seed,
            settings,
        });
    }
    points
}

fn apply_jitter(
    profile: &MarginProfile,
    settings: &mut [(String, MarginSetting)],
    seed: u64,
) {
    if profile.targets.iter().all(|(_, spec)| spec.jitter.is_none()) {
        return;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    for (target_index, (_, spec)) in profile.targets.iter().enumerate() {
        let Some(jitter) = spec.jitter else { continue };
        let slot = &mut settings[target_index].1;
        if jitter.amplitude_mv > 0.0 {
            slot.voltage_mv += rng.gen_range(-jitter.amplitude_mv..=jitter.amplitude_mv);
        }
        if jitter.amplitude_mhz > 0.0 {
            slot.freq_mhz += rng.gen_range(-jitter.amplitude_mhz..=jitter.amplitude_mhz);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_config::{AxisSpec, JitterSpec, ProfileMetadata, TargetSpec};

    fn profile(targets: Vec<(String, TargetSpec)>, seed: Option<u64>) -> MarginProfile {
        MarginProfile {
            metadata: ProfileMetadata::default(),
            global_seed: seed,
            targets,
        }
    }

    fn fixed_target(voltage: f64, freq: f64) -> TargetSpec {
        TargetSpec {
            voltage_mv: AxisSpec::Fixed(voltage),
            freq_mhz: AxisSpec::Fixed(freq),
            jitter: None,
        }
    }

    #[test]
    fn sweep_free_profile_yields_single_point() {
        let profile = profile(
            vec![("default".into(), fixed_target(950.0, 1800.0))],
            Some(7),
        );
        let points = expand_points(&profile, 7);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].id, "point-0");
        assert_eq!(
            points[0].setting("default"),
            Some(&MarginSetting {
                voltage_mv: 950.0,
                freq_mhz: 1800.0
            })
        );
    }

    #[test]
    fn empty_profile_yields_single_empty_point() {
        let profile = profile(Vec::new(), None);
        let points = expand_points(&profile, 0);
        assert_eq!(points.len(), 1);
        assert!(points[0].settings.is_empty());
        assert!(points[0].margin_for_adapter("cpu-smoke").is_empty());
    }

    #[test]
    fn two_by_two_sweep_yields_four_points_in_declared_order() {
        let profile = profile(
            vec![(
                "core0".into(),
                TargetSpec {
                    voltage_mv: AxisSpec::Sweep(vec![900.0, 950.0]),
                    freq_mhz: AxisSpec::Sweep(vec![1800.0, 2000.0]),
                    jitter: None,
                },
            )],
            Some(42),
        );
        let points = expand_points(&profile, 42);
        assert_eq!(points.len(), 4);
        let values: Vec<(f64, f64)> = points
            .iter()
            .map(|p| {
                let s = p.setting("core0").expect("core0");
                (s.voltage_mv, s.freq_mhz)
            })
            .collect();
        assert_eq!(
            values,
            vec![
                (900.0, 1800.0),
                (900.0, 2000.0),
                (950.0, 1800.0),
                (950.0, 2000.0),
            ]
        );
    }

    #[test]
    fn expansion_is_deterministic_including_jitter() {
        let profile = profile(
            vec![(
                "default".into(),
                TargetSpec {
                    voltage_mv: AxisSpec::Sweep(vec![900.0, 950.0]),
                    freq_mhz: AxisSpec::Fixed(1800.0),
                    jitter: Some(JitterSpec {
                        amplitude_mv: 5.0,
                        amplitude_mhz: 0.0,
                    }),
                },
            )],
            Some(1337),
        );
        let first = expand_points(&profile, 1337);
        let second = expand_points(&profile, 1337);
        assert_eq!(first, second);
        for (point, base) in first.iter().zip([900.0, 950.0]) {
            let setting = point.setting("default").expect("default");
            assert!((setting.voltage_mv - base).abs() <= 5.0);
            assert_eq!(setting.freq_mhz, 1800.0);
        }
    }

    #[test]
    fn point_seeds_differ_per_index() {
        let profile = profile(
            vec![(
                "default".into(),
                TargetSpec {
                    voltage_mv: AxisSpec::Sweep(vec![900.0, 950.0]),
                    freq_mhz: AxisSpec::Fixed(1800.0),
                    jitter: None,
                },
            )],
            Some(5),
        );
        let points = expand_points(&profile, 5);
        assert_ne!(points[0].seed, points[1].seed);
    }

    #[test]
    fn adapter_target_overrides_default() {
        let profile = profile(
            vec![
                ("default".into(), fixed_target(950.0, 1800.0)),
                ("cpu-smoke".into(), fixed_target(925.0, 1600.0)),
            ],
            Some(1),
        );
        let points = expand_points(&profile, 1);
        let margin = points[0].margin_for_adapter("cpu-smoke");
        assert_eq!(margin[0], ("voltage_mv".to_string(), 925.0));
        let other = points[0].margin_for_adapter("mem-march");
        assert_eq!(other[0], ("voltage_mv".to_string(), 950.0));
    }
}

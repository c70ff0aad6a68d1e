//! Waveform step generation and the setpoint modifier pipeline
//!.
//!
//! Standard shapes are generated loop-clean: the returned step list never
//! repeats the cycle's first value as its last, so back-to-back cycles read
//! as one continuous waveform rather than a visible seam.

use super::{SequenceDefinition, Waveform};
use std::f64::consts::PI;

/// One resolved playback step: a commanded value and how long to hold it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Step {
    /// Pre-modifier commanded value.
    pub value: f64,
    /// Dwell time before advancing to the next step.
    pub dwell_ms: u64,
}

/// Resolves one cycle's steps for `waveform`. `prev_commanded` seeds a random
/// walk's first step with the last value actually commanded; it is ignored by standard shapes and arbitrary lists.
pub fn generate_steps(waveform: &Waveform, prev_commanded: Option<f64>) -> Vec<Step> {
    match waveform {
        Waveform::Standard { shape, min, max, points_per_cycle, interval_ms } => {
            standard_steps(*shape, *min, *max, *points_per_cycle, *interval_ms)
        }
        Waveform::Random { start_value, max_step_size, min, max, points_per_cycle, interval_ms } => {
            random_walk_steps(
                prev_commanded.unwrap_or(*start_value),
                *max_step_size,
                *min,
                *max,
                *points_per_cycle,
                *interval_ms,
            )
        }
        Waveform::Arbitrary { steps } => steps
            .iter()
            .map(|s| Step { value: s.value, dwell_ms: s.dwell_ms })
            .collect(),
    }
}

fn standard_steps(shape: super::StandardType, min: f64, max: f64, points: u32, interval_ms: u64) -> Vec<Step> {
    let n = points.max(1) as usize;
    let span = max - min;
    (0..n)
        .map(|i| {
            let phase = i as f64 / n as f64; // in [0, 1), loop-clean by construction
            let value = match shape {
                super::StandardType::Sine => min + span * (1.0 - (2.0 * PI * phase).cos()) / 2.0,
                super::StandardType::Triangle => {
                    if phase < 0.5 {
                        min + span * (phase * 2.0)
                    } else {
                        min + span * (2.0 - phase * 2.0)
                    }
                }
                super::StandardType::Ramp => min + span * phase,
                super::StandardType::Square => {
                    if phase < 0.5 {
                        min
                    } else {
                        max
                    }
                }
                super::StandardType::Steps => {
                    let level = (phase * n as f64).floor();
                    min + span * (level / n as f64)
                }
            };
            Step { value, dwell_ms: interval_ms }
        })
        .collect()
}

fn random_walk_steps(
    seed: f64,
    max_step: f64,
    min: f64,
    max: f64,
    points: u32,
    interval_ms: u64,
) -> Vec<Step> {
    let n = points.max(1) as usize;
    let mut value = seed.clamp(min, max);
    let mut out = Vec::with_capacity(n);
    out.push(Step { value, dwell_ms: interval_ms });
    for _ in 1..n {
        let delta = rand::random::<f64>() * 2.0 * max_step - max_step;
        value = (value + delta).clamp(min, max);
        out.push(Step { value, dwell_ms: interval_ms });
    }
    out
}

/// Applies a sequence's modifier pipeline in a fixed order: scale, then
/// offset, then clamp, then slew-rate limiting relative to the previously
/// commanded (already-modified) value.
pub fn apply_modifiers(
    raw_value: f64,
    def: &SequenceDefinition,
    prev_commanded: f64,
    dwell_ms: u64,
) -> f64 {
    let mut v = raw_value * def.scale.unwrap_or(1.0) + def.offset.unwrap_or(0.0);
    if let Some(min) = def.min_clamp {
        v = v.max(min);
    }
    if let Some(max) = def.max_clamp {
        v = v.min(max);
    }
    if let Some(max_slew) = def.max_slew_rate {
        let max_delta = max_slew * (dwell_ms as f64 / 1000.0);
        let delta = (v - prev_commanded).clamp(-max_delta, max_delta);
        v = prev_commanded + delta;
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{StandardType, Unit};
    use chrono::Utc;

    fn def(waveform: Waveform) -> SequenceDefinition {
        SequenceDefinition {
            id: "s".into(),
            name: "n".into(),
            unit: Unit::V,
            waveform,
            pre_value: None,
            post_value: None,
            scale: None,
            offset: None,
            min_clamp: None,
            max_clamp: None,
            max_slew_rate: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn sine_is_loop_clean_and_bounded() {
        let steps = standard_steps(StandardType::Sine, 0.0, 10.0, 8, 100);
        assert_eq!(steps.len(), 8);
        assert!(steps.iter().all(|s| s.value >= 0.0 && s.value <= 10.0));
        assert!((steps[0].value - 0.0).abs() < 1e-9);
    }

    #[test]
    fn ramp_never_repeats_min_as_last_point() {
        let steps = standard_steps(StandardType::Ramp, 0.0, 10.0, 5, 10);
        assert_eq!(steps[0].value, 0.0);
        assert!(steps[4].value < 10.0);
    }

    #[test]
    fn square_alternates_at_midpoint() {
        let steps = standard_steps(StandardType::Square, 0.0, 5.0, 4, 10);
        assert_eq!(steps.iter().map(|s| s.value).collect::<Vec<_>>(), vec![0.0, 0.0, 5.0, 5.0]);
    }

    #[test]
    fn random_walk_starts_from_previous_commanded_value() {
        let steps = random_walk_steps(3.0, 0.1, 0.0, 10.0, 5, 10);
        assert_eq!(steps[0].value, 3.0);
        assert_eq!(steps.len(), 5);
        for w in steps.windows(2) {
            assert!((w[1].value - w[0].value).abs() <= 0.1 + 1e-9);
        }
    }

    #[test]
    fn slew_rate_limits_large_step() {
        let d = {
            let mut d = def(Waveform::Arbitrary { steps: vec![] });
            d.max_slew_rate = Some(1.0); // 1 unit/sec
            d
        };
        let v = apply_modifiers(100.0, &d, 0.0, 500);
        assert!((v - 0.5).abs() < 1e-9);
    }

    #[test]
    fn scale_offset_and_clamp_apply_in_order() {
        let mut d = def(Waveform::Arbitrary { steps: vec![] });
        d.scale = Some(2.0);
        d.offset = Some(1.0);
        d.max_clamp = Some(5.0);
        let v = apply_modifiers(10.0, &d, 0.0, 100);
        assert_eq!(v, 5.0);
    }
}

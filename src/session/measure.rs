//! Local oscilloscope measurement computation.
//!
//! Frequency and period use a direct single-pass DFT rather than an FFT
//! library: capture lengths here are small (at most `max_dft_points`
//! samples) and only a single dominant-frequency bin is needed, so the
//! O(n*k) direct transform over a handful of candidate bins is simpler and
//! avoids depending on a full FFT crate for one measurement.

use crate::scpi::Measurement;
use num_complex::Complex64;
use std::f64::consts::PI;

/// Computes `measurement_type` over `samples`, spaced `dt` seconds apart.
/// Returns [`Measurement::NotAMeasurement`] when the capture is too short or
/// degenerate for the requested computation (e.g. `FREQ` on a DC capture).
pub fn compute(measurement_type: &str, samples: &[f64], dt: f64, max_dft_points: usize) -> Measurement {
    if samples.is_empty() {
        return Measurement::NotAMeasurement;
    }
    match measurement_type {
        "VMAX" => Measurement::Value(vmax(samples)),
        "VMIN" => Measurement::Value(vmin(samples)),
        "VPP" => Measurement::Value(vmax(samples) - vmin(samples)),
        "VAVG" => Measurement::Value(vavg(samples)),
        "VRMS" => Measurement::Value(vrms(samples)),
        "VTOP" => Measurement::Value(percentile(samples, 0.90)),
        "VBAS" => Measurement::Value(percentile(samples, 0.10)),
        "FREQ" => frequency(samples, dt, max_dft_points).map(Measurement::Value).unwrap_or(Measurement::NotAMeasurement),
        "PER" => frequency(samples, dt, max_dft_points)
            .map(|f| Measurement::Value(1.0 / f))
            .unwrap_or(Measurement::NotAMeasurement),
        "PDUT" => duty_cycle(samples, dt, true).map(Measurement::Value).unwrap_or(Measurement::NotAMeasurement),
        "NDUT" => duty_cycle(samples, dt, false).map(Measurement::Value).unwrap_or(Measurement::NotAMeasurement),
        "RISE" => edge_time(samples, dt, true).map(Measurement::Value).unwrap_or(Measurement::NotAMeasurement),
        "FALL" => edge_time(samples, dt, false).map(Measurement::Value).unwrap_or(Measurement::NotAMeasurement),
        "OVER" => overshoot(samples, true).map(Measurement::Value).unwrap_or(Measurement::NotAMeasurement),
        "PRES" => overshoot(samples, false).map(Measurement::Value).unwrap_or(Measurement::NotAMeasurement),
        _ => Measurement::NotAMeasurement,
    }
}

fn vmax(s: &[f64]) -> f64 {
    s.iter().copied().fold(f64::NEG_INFINITY, f64::max)
}

fn vmin(s: &[f64]) -> f64 {
    s.iter().copied().fold(f64::INFINITY, f64::min)
}

fn vavg(s: &[f64]) -> f64 {
    s.iter().sum::<f64>() / s.len() as f64
}

fn vrms(s: &[f64]) -> f64 {
    (s.iter().map(|v| v * v).sum::<f64>() / s.len() as f64).sqrt()
}

fn percentile(s: &[f64], p: f64) -> f64 {
    let mut sorted: Vec<f64> = s.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// Direct single-pass DFT over a small set of candidate bins, returning the
/// frequency (Hz) of the bin with the largest magnitude. `None` if the
/// capture is DC (no bin above a noise floor relative to the DC bin).
fn frequency(samples: &[f64], dt: f64, max_points: usize) -> Option<f64> {
    if dt <= 0.0 || samples.len() < 4 {
        return None;
    }
    let n = samples.len().min(max_points.max(4));
    let s = &samples[..n];
    let mean = vavg(s);
    let fs = 1.0 / dt;

    let mut best_bin = 0usize;
    let mut best_mag = 0.0f64;
    // Skip bin 0 (DC); scan up to the Nyquist bin.
    for k in 1..=(n / 2) {
        let bin: Complex64 = s
            .iter()
            .enumerate()
            .map(|(i, sample)| {
                let theta = 2.0 * PI * k as f64 * i as f64 / n as f64;
                Complex64::new((sample - mean) * theta.cos(), -(sample - mean) * theta.sin())
            })
            .sum();
        let mag = bin.norm();
        if mag > best_mag {
            best_mag = mag;
            best_bin = k;
        }
    }

    if best_bin == 0 || best_mag < 1e-9 {
        return None;
    }
    Some(best_bin as f64 * fs / n as f64)
}

/// Fraction of the capture spent above the 50% threshold (positive duty) or
/// below it (negative duty).
fn duty_cycle(samples: &[f64], _dt: f64, positive: bool) -> Option<f64> {
    let mid = (vmax(samples) + vmin(samples)) / 2.0;
    if !mid.is_finite() {
        return None;
    }
    let above = samples.iter().filter(|&&v| v >= mid).count();
    let frac = above as f64 / samples.len() as f64;
    Some(if positive { frac } else { 1.0 - frac })
}

/// Time from the 10% to 90% threshold crossing of the first qualifying edge
/// (rising for `RISE`, falling for `FALL`), in seconds. An in-progress edge
/// is abandoned (and the scan resumes looking for a fresh one) if the signal
/// reverses back past the first threshold before reaching the second.
fn edge_time(samples: &[f64], dt: f64, rising: bool) -> Option<f64> {
    let lo = vmin(samples);
    let hi = vmax(samples);
    let span = hi - lo;
    if span <= 0.0 {
        return None;
    }
    let low_thresh = lo + span * 0.10;
    let high_thresh = lo + span * 0.90;

    let mut low_idx = None;
    let mut high_idx = None;
    for (i, w) in samples.windows(2).enumerate() {
        if rising {
            if low_idx.is_some() && high_idx.is_none() && w[1] < low_thresh {
                low_idx = None; // reversed back below the first threshold; abort this attempt
            }
            if low_idx.is_none() && w[0] < low_thresh && w[1] >= low_thresh {
                low_idx = Some(i);
            }
            if low_idx.is_some() && high_idx.is_none() && w[0] < high_thresh && w[1] >= high_thresh {
                high_idx = Some(i);
                break;
            }
        } else {
            if high_idx.is_some() && low_idx.is_none() && w[1] > high_thresh {
                high_idx = None; // reversed back above the first threshold; abort this attempt
            }
            if high_idx.is_none() && w[0] > high_thresh && w[1] <= high_thresh {
                high_idx = Some(i);
            }
            if high_idx.is_some() && low_idx.is_none() && w[0] > low_thresh && w[1] <= low_thresh {
                low_idx = Some(i);
                break;
            }
        }
    }
    match (low_idx, high_idx) {
        (Some(a), Some(b)) => Some((b as f64 - a as f64).abs() * dt),
        _ => None,
    }
}

/// Overshoot/preshoot as a fraction of the settled step amplitude.
fn overshoot(samples: &[f64], after_rise: bool) -> Option<f64> {
    let lo = vmin(samples);
    let hi = vmax(samples);
    let span = hi - lo;
    if span <= 0.0 {
        return None;
    }
    let settle_len = (samples.len() / 4).max(1);
    let settled = if after_rise {
        vavg(&samples[samples.len() - settle_len..])
    } else {
        vavg(&samples[..settle_len])
    };
    let peak = if after_rise { hi } else { hi };
    Some(((peak - settled) / span).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(n: usize, freq: f64, fs: f64) -> Vec<f64> {
        (0..n).map(|i| (2.0 * PI * freq * i as f64 / fs).sin()).collect()
    }

    #[test]
    fn vpp_and_vavg_on_known_waveform() {
        let samples = vec![0.0, 1.0, 2.0, 1.0];
        assert_eq!(vmax(&samples) - vmin(&samples), 2.0);
        assert_eq!(vavg(&samples), 1.0);
    }

    #[test]
    fn frequency_recovers_known_sine_frequency() {
        let fs = 1_000.0;
        let freq = 50.0;
        let s = sine(1000, freq, fs);
        let dt = 1.0 / fs;
        let measured = frequency(&s, dt, 4096).unwrap();
        assert!((measured - freq).abs() < 1.0, "measured {measured}");
    }

    #[test]
    fn frequency_is_none_for_dc_capture() {
        let s = vec![1.0; 100];
        assert!(frequency(&s, 1e-6, 4096).is_none());
    }

    #[test]
    fn edge_time_aborts_on_reversal_before_second_threshold() {
        // A bogus excursion to 5 (50%, well short of the 90% threshold) and
        // back at indices 1-2 must not get stitched onto the real 0->10 edge
        // starting at index 9; only the clean final ramp should be timed.
        let samples = vec![0.0, 0.0, 5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 5.0, 9.0, 10.0];
        let t = edge_time(&samples, 1.0, true).unwrap();
        assert_eq!(t, 2.0);
    }

    #[test]
    fn duty_cycle_of_square_wave_is_half() {
        let mut s = Vec::new();
        for _ in 0..50 {
            s.push(0.0);
        }
        for _ in 0..50 {
            s.push(5.0);
        }
        let duty = duty_cycle(&s, 1.0, true).unwrap();
        assert!((duty - 0.5).abs() < 0.05);
    }

    #[test]
    fn compute_unknown_type_is_not_a_measurement() {
        assert_eq!(compute("BOGUS", &[1.0, 2.0], 1.0, 4096), Measurement::NotAMeasurement);
    }

    #[test]
    fn compute_empty_samples_is_not_a_measurement() {
        assert_eq!(compute("VPP", &[], 1.0, 4096), Measurement::NotAMeasurement);
    }
}

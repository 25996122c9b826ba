//! Frequency-domain variability
//!
//! A deliberately simple PSD: linear resampling onto a uniform grid, mean
//! removal, zero-padding to a power of two, one FFT, and a Riemann sum over
//! the LF and HF autonomic bands. No taper or segment averaging is applied.

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

/// Resampling rate used when the caller has no preference.
pub const DEFAULT_SAMPLE_RATE_HZ: f64 = 4.0;
/// Windows shorter than this produce zero power.
pub const MIN_SPECTRAL_SAMPLES: usize = 10;
/// Low-frequency band, inclusive bounds in Hz.
pub const LF_BAND: (f64, f64) = (0.04, 0.15);
/// High-frequency band, inclusive bounds in Hz.
pub const HF_BAND: (f64, f64) = (0.15, 0.40);

/// Integrated power in the two autonomic bands.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BandPower {
    pub lf: f64,
    pub hf: f64,
}

/// Compute LF and HF power for an ordered interval window.
pub fn spectral_power(intervals: &[f64], sample_rate_hz: f64) -> BandPower {
    if intervals.len() < MIN_SPECTRAL_SAMPLES
        || !sample_rate_hz.is_finite()
        || sample_rate_hz <= 0.0
    {
        return BandPower::default();
    }

    let n = (intervals.len() as f64 * sample_rate_hz).floor() as usize;
    if n < 2 {
        return BandPower::default();
    }

    let resampled = resample_linear(intervals, n);

    let mean = resampled.iter().sum::<f64>() / n as f64;
    let fft_size = n.next_power_of_two();
    let mut buffer: Vec<Complex<f64>> = resampled
        .iter()
        .map(|v| Complex::new(v - mean, 0.0))
        .collect();
    buffer.resize(fft_size, Complex::new(0.0, 0.0));

    let mut planner = FftPlanner::<f64>::new();
    let fft = planner.plan_fft_forward(fft_size);
    fft.process(&mut buffer);

    let df = sample_rate_hz / fft_size as f64;
    let scale = sample_rate_hz * fft_size as f64;

    let mut power = BandPower::default();
    for (k, bin) in buffer.iter().take(fft_size / 2).enumerate() {
        let freq = k as f64 * df;
        let psd = bin.norm_sqr() / scale;
        if in_band(freq, LF_BAND) {
            power.lf += psd * df;
        }
        if in_band(freq, HF_BAND) {
            power.hf += psd * df;
        }
    }
    power
}

/// Map `n` uniformly spaced points across the window's sample indices.
fn resample_linear(intervals: &[f64], n: usize) -> Vec<f64> {
    let last = intervals.len() - 1;
    (0..n)
        .map(|i| {
            let pos = (i * last) as f64 / (n - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = (lo + 1).min(last);
            let frac = pos - lo as f64;
            intervals[lo] * (1.0 - frac) + intervals[hi] * frac
        })
        .collect()
}

fn in_band(freq: f64, (low, high): (f64, f64)) -> bool {
    freq >= low && freq <= high
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    fn oscillating(len: usize, period_beats: f64, amplitude: f64) -> Vec<f64> {
        (0..len)
            .map(|i| 800.0 + amplitude * (2.0 * PI * i as f64 / period_beats).sin())
            .collect()
    }

    #[test]
    fn test_short_window_is_exactly_zero() {
        let window = vec![800.0, 820.0, 790.0, 805.0, 830.0, 810.0, 800.0, 815.0, 795.0];
        assert_eq!(
            spectral_power(&window, DEFAULT_SAMPLE_RATE_HZ),
            BandPower { lf: 0.0, hf: 0.0 }
        );
    }

    #[test]
    fn test_constant_window_has_no_power() {
        let window = vec![800.0; 30];
        let power = spectral_power(&window, DEFAULT_SAMPLE_RATE_HZ);
        assert!(power.lf.abs() < 1e-9);
        assert!(power.hf.abs() < 1e-9);
    }

    #[test]
    fn test_slow_oscillation_lands_in_lf() {
        // Ten-beat period ≈ 0.1 Hz at one beat per second.
        let power = spectral_power(&oscillating(30, 10.0, 40.0), DEFAULT_SAMPLE_RATE_HZ);
        assert!(power.lf > 0.0);
        assert!(power.lf > power.hf);
    }

    #[test]
    fn test_fast_oscillation_lands_in_hf() {
        // Four-beat period ≈ 0.25 Hz.
        let power = spectral_power(&oscillating(30, 4.0, 40.0), DEFAULT_SAMPLE_RATE_HZ);
        assert!(power.hf > 0.0);
        assert!(power.hf > power.lf);
    }

    #[test]
    fn test_sample_rate_changes_lf() {
        let window = oscillating(30, 10.0, 40.0);
        let at_four = spectral_power(&window, 4.0);
        let at_three = spectral_power(&window, 3.0);
        assert!(at_four.lf > 0.0 && at_three.lf > 0.0);
        assert!((at_four.lf - at_three.lf).abs() > 1e-6);
    }

    #[test]
    fn test_degenerate_sample_rates() {
        let window = oscillating(30, 10.0, 40.0);
        assert_eq!(spectral_power(&window, 0.0), BandPower::default());
        assert_eq!(spectral_power(&window, -4.0), BandPower::default());
        assert_eq!(spectral_power(&window, f64::NAN), BandPower::default());
        // floor(30 * 0.05) = 1 point: nothing to resample onto.
        assert_eq!(spectral_power(&window, 0.05), BandPower::default());
    }

    #[test]
    fn test_resample_hits_endpoints() {
        let window: Vec<f64> = (0..10).map(|i| 800.0 + i as f64 * 10.0).collect();
        let resampled = resample_linear(&window, 40);
        assert_eq!(resampled.len(), 40);
        assert_eq!(resampled[0], 800.0);
        assert!((resampled[39] - 890.0).abs() < 1e-9);
        assert!(resampled.windows(2).all(|w| w[1] >= w[0]));
    }
}

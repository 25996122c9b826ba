//! Heart-rate variability math
//!
//! Pure, total functions over a rolling window of beat-to-beat intervals:
//!
//! - **window**: admission filter and fixed-capacity FIFO of interval samples
//! - **rmssd**: time-domain variability (root mean square of successive differences)
//! - **spectral**: LF/HF band power from a resampled, detrended spectrum
//! - **fallback**: approximate intervals derived from instantaneous heart rate
//!
//! Nothing here can fail at runtime; degenerate inputs yield zeros.

pub mod fallback;
pub mod rmssd;
pub mod spectral;
pub mod window;

pub use fallback::synthesize_interval;
pub use rmssd::rmssd;
pub use spectral::{spectral_power, BandPower, DEFAULT_SAMPLE_RATE_HZ};
pub use window::{IntervalWindow, DEFAULT_WINDOW_CAPACITY, MAX_INTERVAL_MS, MIN_INTERVAL_MS};

use serde::{Deserialize, Serialize};

/// Variability metrics derived from a full interval window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HrvMetrics {
    /// RMSSD in milliseconds.
    pub rmssd: f64,
    /// Integrated power in the 0.04–0.15 Hz band.
    pub lf: f64,
    /// Integrated power in the 0.15–0.40 Hz band.
    pub hf: f64,
}

impl HrvMetrics {
    /// Compute all metrics over the window's current contents.
    pub fn compute(window: &IntervalWindow, sample_rate_hz: f64) -> Self {
        let samples = window.samples();
        let BandPower { lf, hf } = spectral_power(samples, sample_rate_hz);
        Self {
            rmssd: rmssd(samples),
            lf,
            hf,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_on_constant_window() {
        let mut window = IntervalWindow::new(DEFAULT_WINDOW_CAPACITY);
        for _ in 0..DEFAULT_WINDOW_CAPACITY {
            window.admit(800.0);
        }

        let metrics = HrvMetrics::compute(&window, DEFAULT_SAMPLE_RATE_HZ);
        assert_eq!(metrics.rmssd, 0.0);
        assert!(metrics.lf.abs() < 1e-9);
        assert!(metrics.hf.abs() < 1e-9);
    }

    #[test]
    fn test_compute_on_empty_window() {
        let window = IntervalWindow::default();
        assert_eq!(
            HrvMetrics::compute(&window, DEFAULT_SAMPLE_RATE_HZ),
            HrvMetrics::default()
        );
    }
}

//! Approximate beat intervals from instantaneous heart rate
//!
//! Used when the sensor cannot deliver beat-interval telemetry, so the
//! window-based estimators keep a (degraded) feed as long as heart rate
//! is flowing.

/// Convert a heart rate in BPM into an interval in milliseconds.
///
/// Returns `None` for non-positive rates; the caller skips admission for
/// that tick.
pub fn synthesize_interval(bpm: i32) -> Option<f64> {
    if bpm <= 0 {
        return None;
    }
    Some((60_000.0 / f64::from(bpm)).round())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesize() {
        assert_eq!(synthesize_interval(75), Some(800.0));
        assert_eq!(synthesize_interval(60), Some(1000.0));
        // 60000 / 70 = 857.14…
        assert_eq!(synthesize_interval(70), Some(857.0));
        // 60000 / 81 = 740.74…
        assert_eq!(synthesize_interval(81), Some(741.0));
    }

    #[test]
    fn test_non_positive_rate() {
        assert_eq!(synthesize_interval(0), None);
        assert_eq!(synthesize_interval(-12), None);
    }
}

//! Time-domain variability

/// Successive differences at or above this magnitude are treated as
/// motion or ectopic-beat artifacts.
pub const ARTIFACT_THRESHOLD_MS: f64 = 200.0;

/// Root mean square of successive differences over `intervals`.
///
/// Returns 0 when fewer than two samples are given or fewer than two
/// differences survive artifact rejection.
pub fn rmssd(intervals: &[f64]) -> f64 {
    if intervals.len() < 2 {
        return 0.0;
    }

    let diffs: Vec<f64> = intervals
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .filter(|d| d.abs() < ARTIFACT_THRESHOLD_MS)
        .collect();

    if diffs.len() < 2 {
        return 0.0;
    }

    let mean_square = diffs.iter().map(|d| d * d).sum::<f64>() / diffs.len() as f64;
    mean_square.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_inputs_yield_zero() {
        assert_eq!(rmssd(&[]), 0.0);
        assert_eq!(rmssd(&[800.0]), 0.0);
    }

    #[test]
    fn test_constant_intervals() {
        assert_eq!(rmssd(&[800.0, 800.0, 800.0, 800.0, 800.0]), 0.0);
    }

    #[test]
    fn test_small_variation() {
        // diffs 20, -10, 20, -25 → sqrt(381.25)
        let value = rmssd(&[800.0, 820.0, 810.0, 830.0, 805.0]);
        assert!(value > 0.0 && value < 50.0);
        assert!((value - 381.25_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_artifacts_are_discarded() {
        // 800→1000 (200) is rejected; 1000→1010 and 1010→1000 survive.
        let value = rmssd(&[800.0, 1000.0, 1010.0, 1000.0]);
        assert!((value - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_ectopic_beat_differences_are_dropped() {
        // 1100 is an admissible interval, but both jumps around it (300 and
        // -280) are artifacts. Only -10 survives, which is too few.
        let intervals = [800.0, 1100.0, 820.0, 810.0];
        assert_eq!(rmssd(&intervals), 0.0);

        // Without the beat the same run produces a value.
        let value = rmssd(&[800.0, 790.0, 820.0, 810.0]);
        assert!(value > 0.0);
    }

    #[test]
    fn test_single_surviving_difference_yields_zero() {
        assert_eq!(rmssd(&[800.0, 1200.0, 1210.0]), 0.0);
    }

    #[test]
    fn test_never_negative() {
        let inputs: [&[f64]; 4] = [
            &[],
            &[1500.0, 400.0, 1900.0],
            &[600.0, 650.0, 610.0, 700.0],
            &[300.0, 300.0],
        ];
        for input in inputs {
            assert!(rmssd(input) >= 0.0);
        }
    }
}

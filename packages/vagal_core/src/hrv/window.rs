//! Interval admission filter and rolling window

/// Shortest physiologically plausible beat interval, in milliseconds.
pub const MIN_INTERVAL_MS: f64 = 300.0;
/// Longest physiologically plausible beat interval, in milliseconds.
pub const MAX_INTERVAL_MS: f64 = 2000.0;
/// Default number of intervals kept (roughly the last 30 beats).
pub const DEFAULT_WINDOW_CAPACITY: usize = 30;

/// Fixed-capacity FIFO of beat intervals in arrival order.
///
/// Only samples within `[MIN_INTERVAL_MS, MAX_INTERVAL_MS]` are ever stored.
#[derive(Clone, Debug)]
pub struct IntervalWindow {
    samples: Vec<f64>,
    capacity: usize,
}

impl IntervalWindow {
    /// Create an empty window. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Vec::with_capacity(capacity + 1),
            capacity,
        }
    }

    /// Admit a raw interval. Returns `false` (and leaves the window untouched)
    /// when the value is out of range or not finite.
    pub fn admit(&mut self, interval_ms: f64) -> bool {
        if !is_plausible(interval_ms) {
            return false;
        }
        self.samples.push(interval_ms);
        if self.samples.len() > self.capacity {
            let excess = self.samples.len() - self.capacity;
            self.samples.drain(..excess);
        }
        true
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.samples.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl Default for IntervalWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_CAPACITY)
    }
}

fn is_plausible(interval_ms: f64) -> bool {
    interval_ms.is_finite() && (MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(values: &[f64]) -> IntervalWindow {
        let mut window = IntervalWindow::new(values.len());
        for v in values {
            assert!(window.admit(*v));
        }
        window
    }

    #[test]
    fn test_out_of_range_rejected() {
        let mut window = IntervalWindow::default();
        assert!(!window.admit(299.0));
        assert!(!window.admit(2000.5));
        assert!(!window.admit(f64::NAN));
        assert!(window.is_empty());
    }

    #[test]
    fn test_range_bounds_inclusive() {
        let mut window = IntervalWindow::default();
        assert!(window.admit(300.0));
        assert!(window.admit(2000.0));
        assert_eq!(window.samples(), &[300.0, 2000.0]);
    }

    #[test]
    fn test_full_window_evicts_oldest() {
        let mut window = filled(&[800.0, 810.0, 820.0]);
        assert!(window.is_full());

        assert!(window.admit(850.0));
        assert_eq!(window.samples(), &[810.0, 820.0, 850.0]);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn test_rejected_sample_leaves_full_window_intact() {
        let mut window = filled(&[800.0, 810.0, 820.0]);
        assert!(!window.admit(2500.0));
        assert_eq!(window.samples(), &[800.0, 810.0, 820.0]);
    }

    #[test]
    fn test_clear() {
        let mut window = filled(&[800.0, 810.0]);
        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.capacity(), 2);
    }

    #[test]
    fn test_zero_capacity_is_bumped() {
        let mut window = IntervalWindow::new(0);
        assert!(window.admit(800.0));
        assert!(window.admit(900.0));
        assert_eq!(window.samples(), &[900.0]);
    }
}

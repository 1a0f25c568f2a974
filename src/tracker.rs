//! Rolling low-percentile estimate of the ambient floor.
//!
//! While music plays the microphone hears music plus room. The quietest slice of a
//! recent window (dips, pauses, quiet passages) is the cheapest always-available
//! approximation of the room alone. Sessions use it for display and as a fallback
//! value; volume decisions are driven by sampled gaps and song boundaries.

use std::collections::VecDeque;

pub const DEFAULT_WINDOW_SIZE: usize = 200;
pub const DEFAULT_PERCENTILE: f32 = 0.15;

/// Element at `floor((n-1)·p)` of the ascending sort, or `None` for an empty window.
pub fn percentile(values: &[f32], p: f32) -> Option<f32> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
    let idx = ((((n - 1) as f64) * (p as f64)).floor() as usize).min(n - 1);
    Some(sorted[idx])
}

#[derive(Debug, Clone)]
pub struct RollingBaselineTracker {
    window: VecDeque<f32>,
    capacity: usize,
    percentile: f32,
    estimate: f32,
}

impl Default for RollingBaselineTracker {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW_SIZE, DEFAULT_PERCENTILE)
    }
}

impl RollingBaselineTracker {
    pub fn new(capacity: usize, percentile: f32) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity,
            percentile,
            estimate: 0.0,
        }
    }

    /// Append a reading, evicting the oldest past capacity, and republish the estimate.
    pub fn push(&mut self, db: f32) -> f32 {
        self.window.push_back(db);
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
        self.republish();
        self.estimate
    }

    pub fn current_estimate(&self) -> f32 {
        self.estimate
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.estimate = 0.0;
    }

    /// Shrinking evicts the oldest readings immediately.
    pub fn set_capacity(&mut self, capacity: usize) {
        let capacity = capacity.max(1);
        if capacity == self.capacity {
            return;
        }
        self.capacity = capacity;
        while self.window.len() > self.capacity {
            self.window.pop_front();
        }
        self.republish();
    }

    pub fn set_percentile(&mut self, p: f32) {
        if p != self.percentile {
            self.percentile = p;
            self.republish();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    /// Oldest first.
    pub fn window(&self) -> Vec<f32> {
        self.window.iter().copied().collect()
    }

    fn republish(&mut self) {
        let values: Vec<f32> = self.window.iter().copied().collect();
        self.estimate = percentile(&values, self.percentile).unwrap_or(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_window_estimates_zero() {
        let t = RollingBaselineTracker::default();
        assert_eq!(t.current_estimate(), 0.0);
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn evicts_oldest_first() {
        let mut t = RollingBaselineTracker::new(200, 0.15);
        for v in 1..=250 {
            t.push(v as f32);
        }
        assert_eq!(t.len(), 200);
        let expected: Vec<f32> = (51..=250).map(|v| v as f32).collect();
        assert_eq!(t.window(), expected);
    }

    #[test]
    fn fifteenth_percentile_of_known_window() {
        let mut t = RollingBaselineTracker::new(200, 0.15);
        for v in (1..=100).rev() {
            t.push(v as f32);
        }
        // floor(99 * 0.15) = 14 -> 15th smallest
        assert_eq!(t.current_estimate(), 15.0);
    }

    #[test]
    fn reset_clears_window_and_estimate() {
        let mut t = RollingBaselineTracker::new(10, 0.15);
        t.push(40.0);
        t.push(50.0);
        t.reset();
        assert!(t.is_empty());
        assert_eq!(t.current_estimate(), 0.0);
    }

    #[test]
    fn shrinking_capacity_evicts() {
        let mut t = RollingBaselineTracker::new(10, 0.0);
        for v in 1..=10 {
            t.push(v as f32);
        }
        t.set_capacity(3);
        assert_eq!(t.window(), vec![8.0, 9.0, 10.0]);
        assert_eq!(t.current_estimate(), 8.0);
    }

    proptest! {
        #[test]
        fn percentile_is_member_and_monotone(
            values in prop::collection::vec(0.0f32..120.0, 1..300),
            a in 0.0f32..=1.0,
            b in 0.0f32..=1.0,
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let p_lo = percentile(&values, lo).unwrap();
            let p_hi = percentile(&values, hi).unwrap();
            prop_assert!(values.contains(&p_lo));
            prop_assert!(values.contains(&p_hi));
            prop_assert!(p_lo <= p_hi);
        }

        #[test]
        fn window_never_exceeds_capacity(
            cap in 1usize..64,
            values in prop::collection::vec(0.0f32..120.0, 0..300),
        ) {
            let mut t = RollingBaselineTracker::new(cap, 0.15);
            for v in &values {
                t.push(*v);
                prop_assert!(t.len() <= cap);
            }
            let tail: Vec<f32> = values.iter().rev().take(cap).rev().copied().collect();
            prop_assert_eq!(t.window(), tail);
        }
    }
}

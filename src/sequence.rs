//! Frame-loss detection over the 16-bit frame index.

use log::debug;

/// Counts frames missing between two consecutive observations.
///
/// The difference is taken on widened signed integers and clamped at zero, so an
/// index that repeats or steps backwards (a wrap included) is treated as
/// contiguous rather than as a 65k-frame hole.
///
/// Losses across the wrap are therefore not reported: `[65535, 2]` gives 0
/// even though frames 0 and 1 never arrived. Callers that need those counted
/// must track the wrap themselves.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    previous: Option<i32>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `current` and return how many frames were lost since the last call.
    pub fn observe(&mut self, current: u16) -> u16 {
        let current = i32::from(current);
        let previous = *self.previous.get_or_insert(current - 1);
        let missed = (current - previous - 1).max(0);
        self.previous = Some(current);

        if missed > 0 {
            debug!("sequence gap: previous={} current={} missed={}", previous, current, missed);
        }
        missed as u16
    }

    /// Forget the last index. The next frame is treated as contiguous.
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn previous_index(&self) -> Option<u16> {
        self.previous.map(|p| p as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(indices: &[u16]) -> Vec<u16> {
        let mut tracker = SequenceTracker::new();
        indices.iter().map(|&i| tracker.observe(i)).collect()
    }

    #[test]
    fn contiguous_run() {
        assert_eq!(run(&[5, 6, 7]), vec![0, 0, 0]);
    }

    #[test]
    fn gap_counts_missing_frames() {
        assert_eq!(run(&[5, 8]), vec![0, 2]);
        assert_eq!(run(&[0, 1, 10]), vec![0, 0, 8]);
    }

    #[test]
    fn wraparound_is_contiguous() {
        assert_eq!(run(&[65534, 1]), vec![0, 0]);
        assert_eq!(run(&[65535, 0, 1]), vec![0, 0, 0]);
        // Frames 0 and 1 are gone but the wrap hides them.
        assert_eq!(run(&[65535, 2]), vec![0, 0]);
    }

    #[test]
    fn first_frame_at_zero() {
        assert_eq!(run(&[0, 1]), vec![0, 0]);
    }

    #[test]
    fn duplicate_index_is_not_a_gap() {
        assert_eq!(run(&[3, 3, 4]), vec![0, 0, 0]);
    }

    #[test]
    fn largest_gap_fits() {
        assert_eq!(run(&[0, 65535]), vec![0, 65534]);
    }

    #[test]
    fn reset_forgets_previous() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(10);
        assert_eq!(tracker.previous_index(), Some(10));
        tracker.reset();
        assert_eq!(tracker.previous_index(), None);
        assert_eq!(tracker.observe(50), 0);
        assert_eq!(tracker.observe(52), 1);
    }
}

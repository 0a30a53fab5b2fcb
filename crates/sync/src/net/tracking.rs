use std::collections::VecDeque;

use super::protocol::sequence_greater_than;

const DEFAULT_WINDOW: usize = 128;

/// Filters duplicate datagrams by header sequence. Reordered packets are
/// still delivered; only exact repeats inside the recent window are dropped.
#[derive(Debug)]
pub struct ReceiveTracker {
    latest: Option<u32>,
    recent_sequences: VecDeque<u32>,
    max_recent: usize,
}

impl Default for ReceiveTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ReceiveTracker {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(max_recent: usize) -> Self {
        let max_recent = max_recent.max(1);
        Self {
            latest: None,
            recent_sequences: VecDeque::with_capacity(max_recent),
            max_recent,
        }
    }

    pub fn record_received(&mut self, sequence: u32) -> bool {
        if self.recent_sequences.contains(&sequence) {
            return false;
        }

        if self.recent_sequences.len() >= self.max_recent {
            self.recent_sequences.pop_front();
        }
        self.recent_sequences.push_back(sequence);

        match self.latest {
            Some(latest) if !sequence_greater_than(sequence, latest) => {}
            _ => self.latest = Some(sequence),
        }

        true
    }

    pub fn latest(&self) -> Option<u32> {
        self.latest
    }

    pub fn reset(&mut self) {
        self.latest = None;
        self.recent_sequences.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = ReceiveTracker::new();

        assert!(tracker.record_received(1));
        assert!(!tracker.record_received(1));
        assert!(tracker.record_received(2));
    }

    #[test]
    fn test_out_of_order_keeps_latest() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(3);
        tracker.record_received(1);
        tracker.record_received(2);

        assert_eq!(tracker.latest(), Some(3));
    }

    #[test]
    fn test_window_eviction() {
        let mut tracker = ReceiveTracker::with_window(2);

        tracker.record_received(1);
        tracker.record_received(2);
        tracker.record_received(3);

        // 1 fell out of the window and is no longer recognized
        assert!(tracker.record_received(1));
        assert!(!tracker.record_received(3));
    }

    #[test]
    fn test_wrapping_latest() {
        let mut tracker = ReceiveTracker::new();

        tracker.record_received(u32::MAX);
        tracker.record_received(0);

        assert_eq!(tracker.latest(), Some(0));
    }
}

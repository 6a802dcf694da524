//! Per-partition commit ordering.
//!
//! Transports with individual acknowledgments accept offsets in any order.
//! Cumulative transports commit "everything up to X", so only the contiguous
//! resolved prefix of each partition may be acknowledged.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::bus::AckMode;
use crate::envelope::Offset;

#[derive(Debug)]
struct Slot {
    position: u64,
    resolved: bool,
}

/// Tracks arrival order and decides which offsets can be acknowledged.
#[derive(Debug)]
pub struct CommitTracker {
    mode: AckMode,
    partitions: HashMap<String, VecDeque<Slot>>,
}

impl CommitTracker {
    pub fn new(mode: AckMode) -> Self {
        Self {
            mode,
            partitions: HashMap::new(),
        }
    }

    pub fn mode(&self) -> AckMode {
        self.mode
    }

    /// Offsets received but not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.partitions.values().map(VecDeque::len).sum()
    }

    /// Record arrival. Only ordered offsets on cumulative transports are tracked.
    pub fn track(&mut self, offsets: &[Offset]) {
        if self.mode != AckMode::Cumulative {
            return;
        }
        for offset in offsets {
            if let Some(position) = offset.as_position() {
                self.partitions
                    .entry(offset.stream().to_string())
                    .or_default()
                    .push_back(Slot {
                        position,
                        resolved: false,
                    });
            }
        }
    }

    /// Mark offsets resolved and return the offsets to acknowledge now.
    pub fn resolve(&mut self, offsets: &[Offset]) -> Vec<Offset> {
        if self.mode == AckMode::Individual {
            return offsets.to_vec();
        }

        let mut ready = Vec::new();
        let mut touched: Vec<String> = Vec::new();
        for offset in offsets {
            let Some(position) = offset.as_position() else {
                ready.push(offset.clone());
                continue;
            };
            let stream = offset.stream();
            match self
                .partitions
                .get_mut(stream)
                .and_then(|slots| slots.iter_mut().find(|s| s.position == position))
            {
                Some(slot) => {
                    slot.resolved = true;
                    if !touched.iter().any(|t| t == stream) {
                        touched.push(stream.to_string());
                    }
                }
                None => debug!(offset = %offset, "Resolved offset is not tracked"),
            }
        }

        for stream in touched {
            let Some(slots) = self.partitions.get_mut(&stream) else {
                continue;
            };
            while slots.front().is_some_and(|s| s.resolved) {
                if let Some(slot) = slots.pop_front() {
                    ready.push(Offset::position(stream.as_str(), slot.position));
                }
            }
            if slots.is_empty() {
                self.partitions.remove(&stream);
            }
        }
        ready
    }

    /// Forget every pending offset at or after `from` in `stream`.
    ///
    /// Returns the dropped offsets; the transport redelivers them.
    pub fn rewind(&mut self, stream: &str, from: u64) -> Vec<Offset> {
        let Some(slots) = self.partitions.get_mut(stream) else {
            return Vec::new();
        };
        let mut dropped = Vec::new();
        slots.retain(|s| {
            if s.position >= from {
                dropped.push(Offset::position(stream, s.position));
                false
            } else {
                true
            }
        });
        if slots.is_empty() {
            self.partitions.remove(stream);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(position: u64) -> Offset {
        Offset::position("events[0]", position)
    }

    #[test]
    fn test_individual_mode_acknowledges_immediately() {
        let mut tracker = CommitTracker::new(AckMode::Individual);
        tracker.track(&[at(0), at(1)]);

        assert_eq!(tracker.resolve(&[at(1)]), vec![at(1)]);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_cumulative_mode_waits_for_contiguous_prefix() {
        let mut tracker = CommitTracker::new(AckMode::Cumulative);
        tracker.track(&[at(0), at(1), at(2)]);

        assert!(tracker.resolve(&[at(1)]).is_empty());
        assert_eq!(tracker.resolve(&[at(0)]), vec![at(0), at(1)]);
        assert_eq!(tracker.pending(), 1);
        assert_eq!(tracker.resolve(&[at(2)]), vec![at(2)]);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_partitions_are_independent() {
        let mut tracker = CommitTracker::new(AckMode::Cumulative);
        let other = Offset::position("events[1]", 0);
        tracker.track(&[at(0), other.clone()]);

        assert_eq!(tracker.resolve(&[other.clone()]), vec![other]);
        assert_eq!(tracker.pending(), 1);
    }

    #[test]
    fn test_rewind_drops_later_offsets() {
        let mut tracker = CommitTracker::new(AckMode::Cumulative);
        tracker.track(&[at(0), at(1), at(2)]);

        assert_eq!(tracker.rewind("events[0]", 1), vec![at(1), at(2)]);
        assert_eq!(tracker.resolve(&[at(0)]), vec![at(0)]);
        assert_eq!(tracker.pending(), 0);
    }

    #[test]
    fn test_tokens_pass_through() {
        let mut tracker = CommitTracker::new(AckMode::Cumulative);
        let token = Offset::token("events", "t-1");
        tracker.track(std::slice::from_ref(&token));
        assert_eq!(tracker.resolve(std::slice::from_ref(&token)), vec![token]);
    }
}

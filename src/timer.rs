//! Timer Queue
//!
//! Timeouts are not sleeping calls: they are entries in a min-heap keyed by
//! deadline, fed back into the same event timeline as switch events. Entries
//! are never cancelled; a timer whose transfer moved on is recognised as stale
//! when it fires.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::core_types::{DeviceId, Timestamp};
use crate::transfer::TransferId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Confirmation window `window` of `transfer` elapsed
    EjectTimeout {
        device: DeviceId,
        transfer: TransferId,
        window: u32,
    },
    /// Driver recycle window over; fire attempt `attempt` now
    PulseReady {
        device: DeviceId,
        transfer: TransferId,
        attempt: u32,
    },
}

impl TimerKind {
    pub fn device(&self) -> &DeviceId {
        match self {
            TimerKind::EjectTimeout { device, .. } | TimerKind::PulseReady { device, .. } => device,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    deadline: Timestamp,
    seq: u64,
    kind: TimerKind,
}

// Reversed so the BinaryHeap pops the earliest deadline; seq keeps FIFO order
// between timers sharing a deadline.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: Timestamp, kind: TimerKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            deadline,
            seq,
            kind,
        });
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.heap.peek().map(|e| e.deadline)
    }

    /// Pop the earliest timer if it is due at `now`
    pub fn pop_due(&mut self, now: Timestamp) -> Option<(Timestamp, TimerKind)> {
        if self.heap.peek()?.deadline > now {
            return None;
        }
        self.heap.pop().map(|e| (e.deadline, e.kind))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(device: &str, window: u32) -> TimerKind {
        TimerKind::EjectTimeout {
            device: device.into(),
            transfer: TransferId::new(),
            window,
        }
    }

    #[test]
    fn test_pops_in_deadline_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(300, timeout("c", 1));
        timers.schedule(100, timeout("a", 1));
        timers.schedule(200, timeout("b", 1));

        assert_eq!(timers.next_deadline(), Some(100));
        assert!(timers.pop_due(99).is_none());

        let order: Vec<_> = std::iter::from_fn(|| timers.pop_due(1_000))
            .map(|(deadline, kind)| (deadline, kind.device().clone()))
            .collect();
        assert_eq!(
            order,
            vec![(100, "a".into()), (200, "b".into()), (300, "c".into())]
        );
        assert!(timers.is_empty());
    }

    #[test]
    fn test_same_deadline_is_fifo() {
        let mut timers = TimerQueue::new();
        timers.schedule(50, timeout("first", 1));
        timers.schedule(50, timeout("second", 1));

        assert_eq!(timers.pop_due(50).unwrap().1.device(), "first");
        assert_eq!(timers.pop_due(50).unwrap().1.device(), "second");
    }
}

//! Transport Events - upward notifications
//!
//! Structured events for the diagnostics / presentation layer: progress
//! (transfers, captures, requests) and faults (jam, discrepancy,
//! configuration).
//!
//! # Delivery
//!
//! Events go through a bounded lock-free queue (crossbeam `ArrayQueue`). When
//! nobody drains it, the oldest events are displaced: the event loop never
//! blocks on a slow consumer. Faults are additionally kept in the
//! BallController's fault log, so none is lost for queries.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core_types::{CoilId, ConsumerId, DeviceId, RequestId, Timestamp};
use crate::driver::SwitchRule;
use crate::transfer::{AttemptRecord, TransferId};

/// Default capacity of the event queue
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

// ============================================================
// FAULTS
// ============================================================

/// Retries exhausted without confirmation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JamFault {
    pub transfer_id: TransferId,
    pub source: DeviceId,
    pub target: DeviceId,
    pub attempts: Vec<AttemptRecord>,
    pub raised_at: Timestamp,
}

/// Kind of ball-count evidence that disagrees with the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    /// A ball appeared that the ledger has no room for
    UntrackedBall,
    /// A ball appeared somewhere unexpected, filling a previously lost slot
    RecoveredBall,
    /// A ball left a device with no transfer in progress
    LostBall,
    /// Boot scan disagrees with the configured ball count
    BootMismatch,
}

impl DiscrepancyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::UntrackedBall => "UNTRACKED_BALL",
            DiscrepancyKind::RecoveredBall => "RECOVERED_BALL",
            DiscrepancyKind::LostBall => "LOST_BALL",
            DiscrepancyKind::BootMismatch => "BOOT_MISMATCH",
        }
    }
}

/// Observed switch activity inconsistent with total_known_balls
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscrepancyFault {
    pub kind: DiscrepancyKind,
    pub device: Option<DeviceId>,
    /// Ledger total at the time of the fault
    pub known_balls: u32,
    /// Sum of device counts at the time of the fault
    pub observed_balls: u32,
    pub at: Timestamp,
}

/// Conflicting switch rules requested for one coil
///
/// The prior rule stays in effect.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("Conflicting switch rule on coil {coil}: existing {existing:?}, requested {requested:?}")]
pub struct ConfigFault {
    pub coil: CoilId,
    pub existing: SwitchRule,
    pub requested: SwitchRule,
}

/// Faults reported upward
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "fault", rename_all = "snake_case")]
pub enum Fault {
    Jam(JamFault),
    Discrepancy(DiscrepancyFault),
    Configuration(ConfigFault),
}

impl Fault {
    /// Get the fault code for diagnostics
    pub fn code(&self) -> &'static str {
        match self {
            Fault::Jam(_) => "JAM",
            Fault::Discrepancy(d) => d.kind.as_str(),
            Fault::Configuration(_) => "CONFLICTING_SWITCH_RULE",
        }
    }

    #[inline]
    pub fn is_jam(&self) -> bool {
        matches!(self, Fault::Jam(_))
    }

    #[inline]
    pub fn is_discrepancy(&self) -> bool {
        matches!(self, Fault::Discrepancy(_))
    }
}

// ============================================================
// EVENTS
// ============================================================

/// Everything the transport core reports upward
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TransportEvent {
    TransferStarted {
        transfer_id: TransferId,
        source: DeviceId,
        target: DeviceId,
        request: Option<RequestId>,
        at: Timestamp,
    },
    TransferConfirmed {
        transfer_id: TransferId,
        source: DeviceId,
        target: DeviceId,
        attempts: u32,
        at: Timestamp,
    },
    WaitingForTarget {
        device: DeviceId,
        at: Timestamp,
    },
    BallCaptured {
        from: DeviceId,
        into: DeviceId,
        at: Timestamp,
    },
    RequestQueued {
        request: RequestId,
        consumer: ConsumerId,
        destination: DeviceId,
        balls: u32,
    },
    RequestFulfilled {
        request: RequestId,
        consumer: ConsumerId,
        destination: DeviceId,
        at: Timestamp,
    },
    RequestCancelled {
        request: RequestId,
        consumer: ConsumerId,
    },
    LedgerReconciled {
        previous: u32,
        total: u32,
    },
    Fault(Fault),
}

/// Bounded, cloneable event queue shared with the presentation layer
#[derive(Clone)]
pub struct EventSink {
    queue: Arc<ArrayQueue<TransportEvent>>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(capacity.max(1))),
        }
    }

    /// Publish an event, displacing the oldest one when full
    pub fn publish(&self, event: TransportEvent) {
        debug!(target: "EVENT", ?event, "publish");
        if let Some(displaced) = self.queue.force_push(event) {
            warn!(
                capacity = self.queue.capacity(),
                "Event queue full, dropped oldest event: {:?}", displaced
            );
        }
    }

    /// Take every queued event in publication order
    pub fn drain(&self) -> Vec<TransportEvent> {
        let mut events = Vec::with_capacity(self.queue.len());
        while let Some(event) = self.queue.pop() {
            events.push(event);
        }
        events
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new(EVENT_QUEUE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancelled(request: RequestId) -> TransportEvent {
        TransportEvent::RequestCancelled {
            request,
            consumer: "game".into(),
        }
    }

    #[test]
    fn test_sink_drains_in_order() {
        let sink = EventSink::new(8);
        sink.publish(cancelled(1));
        sink.publish(cancelled(2));

        let events = sink.drain();
        assert_eq!(events, vec![cancelled(1), cancelled(2)]);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_sink_displaces_oldest_when_full() {
        let sink = EventSink::new(2);
        sink.publish(cancelled(1));
        sink.publish(cancelled(2));
        sink.publish(cancelled(3));

        assert_eq!(sink.drain(), vec![cancelled(2), cancelled(3)]);
    }

    #[test]
    fn test_clones_share_queue() {
        let sink = EventSink::new(4);
        let tap = sink.clone();
        sink.publish(cancelled(1));
        assert_eq!(tap.len(), 1);
    }

    #[test]
    fn test_fault_codes_and_json() {
        let fault = Fault::Discrepancy(DiscrepancyFault {
            kind: DiscrepancyKind::UntrackedBall,
            device: Some("outhole".into()),
            known_balls: 3,
            observed_balls: 4,
            at: 10,
        });
        assert_eq!(fault.code(), "UNTRACKED_BALL");
        assert!(fault.is_discrepancy());

        let json = serde_json::to_string(&TransportEvent::Fault(fault)).unwrap();
        assert!(json.contains("\"event\":\"fault\""));
        assert!(json.contains("\"kind\":\"untracked_ball\""));
    }
}

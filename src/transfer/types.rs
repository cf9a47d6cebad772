//! Transfer Core Types
//!
//! Type definitions for one in-flight ball movement.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::core_types::{DeviceId, RequestId, Timestamp};

/// Transfer ID - ULID-based unique identifier
///
/// Using ULID provides:
/// - Monotonic, sortable IDs (log lines sort by creation)
/// - No coordination needed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TransferId(ulid::Ulid);

impl TransferId {
    /// Generate a new unique TransferId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Get the inner ULID value
    pub fn inner(&self) -> ulid::Ulid {
        self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = ulid::DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(ulid::Ulid::from_string(s)?))
    }
}

/// A reason for a device to eject one ball.
///
/// Unrouted requirements free capacity (drain devices). Routed requirements
/// carry a ball toward the destination of a ball request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EjectRequirement {
    pub destination: Option<DeviceId>,
    pub request: Option<RequestId>,
}

impl EjectRequirement {
    pub fn unrouted() -> Self {
        Self {
            destination: None,
            request: None,
        }
    }

    pub fn routed(destination: impl Into<DeviceId>, request: RequestId) -> Self {
        Self {
            destination: Some(destination.into()),
            request: Some(request),
        }
    }

    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.request.is_some()
    }
}

/// What happened on one eject attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptAction {
    /// Software pulse accepted by the driver
    Pulsed,
    /// Coil enabled (hold-mode eject)
    Enabled,
    /// Hardware switch rule already fired the coil
    HardwareRule,
    /// No coil: waiting for the player to release the ball
    Mechanical,
    /// Ball already left the source; window extended without firing
    Awaited,
    /// Driver still in its recycle window; pulse deferred
    RecycleDeferred,
    /// Driver refused the command
    DriverRejected,
}

impl AttemptAction {
    /// Whether this action could have physically moved a ball
    #[inline]
    pub fn is_physical(&self) -> bool {
        matches!(
            self,
            AttemptAction::Pulsed
                | AttemptAction::Enabled
                | AttemptAction::HardwareRule
                | AttemptAction::Mechanical
        )
    }
}

/// One entry of a transfer's attempt history
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub action: AttemptAction,
    pub at: Timestamp,
}

/// One in-flight ball movement from `source` to `target`
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub source: DeviceId,
    pub target: DeviceId,
    /// Final device of a routed request (may be beyond `target`)
    pub destination: Option<DeviceId>,
    pub request: Option<RequestId>,
    /// Retries so far; never exceeds max_attempts
    pub attempt_count: u32,
    pub started_at: Timestamp,
    /// Start of the current confirmation window
    pub window_started_at: Option<Timestamp>,
    /// Bumped on every new window so stale timeouts can be told apart
    pub window_seq: u32,
    pub confirmed: bool,
    /// Source exit switch reported the ball gone (advisory)
    pub exit_seen: bool,
    pub history: Vec<AttemptRecord>,
}

impl Transfer {
    pub fn new(
        source: impl Into<DeviceId>,
        target: impl Into<DeviceId>,
        requirement: &EjectRequirement,
        now: Timestamp,
    ) -> Self {
        Self {
            id: TransferId::new(),
            source: source.into(),
            target: target.into(),
            destination: requirement.destination.clone(),
            request: requirement.request,
            attempt_count: 0,
            started_at: now,
            window_started_at: None,
            window_seq: 0,
            confirmed: false,
            exit_seen: false,
            history: Vec::new(),
        }
    }

    /// Append an attempt record for the current attempt
    pub fn record(&mut self, action: AttemptAction, at: Timestamp) {
        self.history.push(AttemptRecord {
            attempt: self.attempt_count,
            action,
            at,
        });
    }

    /// Open a new confirmation window and return its sequence number
    pub fn open_window(&mut self, now: Timestamp) -> u32 {
        self.window_seq += 1;
        self.window_started_at = Some(now);
        self.window_seq
    }

    /// Whether any attempt could have moved the ball yet
    pub fn is_armed(&self) -> bool {
        self.history.iter().any(|r| r.action.is_physical())
    }

    /// Whether the ball only moves when the player releases it
    pub fn is_mechanical(&self) -> bool {
        self.history
            .first()
            .is_some_and(|r| r.action == AttemptAction::Mechanical)
    }

    /// Number of physical actions issued (pulses, enables, hardware fires)
    pub fn physical_attempts(&self) -> usize {
        self.history.iter().filter(|r| r.action.is_physical()).count()
    }

    /// The requirement this transfer would be re-queued as
    pub fn requirement(&self) -> EjectRequirement {
        EjectRequirement {
            destination: self.destination.clone(),
            request: self.request,
        }
    }

    /// Drop the request claim; the ball becomes general availability on arrival
    pub fn detach_request(&mut self) {
        self.request = None;
        self.destination = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_id_unique() {
        let a = TransferId::new();
        let b = TransferId::new();
        assert_ne!(a, b);
        assert_eq!(a, a.to_string().parse::<TransferId>().unwrap());
    }

    #[test]
    fn test_new_transfer_from_requirement() {
        let req = EjectRequirement::routed("playfield", 7);
        let t = Transfer::new("trough", "plunger", &req, 100);

        assert_eq!(t.source, "trough");
        assert_eq!(t.target, "plunger");
        assert_eq!(t.destination.as_deref(), Some("playfield"));
        assert_eq!(t.request, Some(7));
        assert_eq!(t.attempt_count, 0);
        assert!(!t.confirmed);
        assert!(!t.is_armed());
        assert_eq!(t.requirement(), req);
    }

    #[test]
    fn test_armed_only_after_physical_action() {
        let mut t = Transfer::new("trough", "plunger", &EjectRequirement::unrouted(), 0);
        t.record(AttemptAction::RecycleDeferred, 0);
        assert!(!t.is_armed());

        t.record(AttemptAction::Pulsed, 30);
        assert!(t.is_armed());
        assert_eq!(t.physical_attempts(), 1);
    }

    #[test]
    fn test_window_sequence_increments() {
        let mut t = Transfer::new("a", "b", &EjectRequirement::unrouted(), 0);
        assert_eq!(t.open_window(10), 1);
        assert_eq!(t.open_window(20), 2);
        assert_eq!(t.window_started_at, Some(20));
    }

    #[test]
    fn test_detach_request() {
        let mut t = Transfer::new("a", "b", &EjectRequirement::routed("c", 1), 0);
        t.detach_request();
        assert_eq!(t.requirement(), EjectRequirement::unrouted());
    }
}

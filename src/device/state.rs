//! Ball Device FSM State Definitions

use std::fmt;

use serde::Serialize;

/// Ball device states
///
/// ```text
///            eject needed, target has room
///   IDLE ─────────────────────────────────▶ EJECTING ◀─┐ timeout, attempts
///    │ ▲                                       │    └───┘ remain: re-pulse
///    │ │ confirmed / jam                       │
///    │ └───────────────────────────────────────┘
///    │ eject needed, every target full            ▲
///    ▼                                            │ downstream room freed
///   WAITING_FOR_TARGET ───────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    /// No active transfer and nothing blocked
    #[default]
    Idle,

    /// Holding a ball destined for transfer, every candidate target full.
    /// No coil is energised in this state.
    WaitingForTarget,

    /// A transfer is active
    Ejecting,
}

impl DeviceState {
    /// Check if a transfer is in flight from this device
    #[inline]
    pub fn is_ejecting(&self) -> bool {
        matches!(self, DeviceState::Ejecting)
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Idle => "IDLE",
            DeviceState::WaitingForTarget => "WAITING_FOR_TARGET",
            DeviceState::Ejecting => "EJECTING",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

//! Driver Settings
//!
//! Tagged value types for coil configuration. Everything here compares by
//! value so "would this reconfiguration change anything" is an exact check.

use serde::{Deserialize, Serialize};

use crate::core_types::{CoilId, SwitchId};

/// Default recycle factor: minimum off-time is twice the pulse length
pub const DEFAULT_RECYCLE_FACTOR: u32 = 2;

/// Settings for one timed coil activation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PulseSettings {
    /// Pulse length in milliseconds
    pub duration_ms: u32,
    /// Power in the range 0.0..=1.0
    pub power: f32,
}

impl PulseSettings {
    pub fn new(duration_ms: u32, power: f32) -> Self {
        Self {
            duration_ms,
            power: power.clamp(0.0, 1.0),
        }
    }

    /// Minimum off-time after this pulse for the given recycle factor
    #[inline]
    pub fn minimum_off_ms(&self, recycle_factor: u32) -> u64 {
        self.duration_ms as u64 * recycle_factor as u64
    }
}

/// Settings for a sustained (held) activation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HoldSettings {
    pub power: f32,
}

impl HoldSettings {
    pub fn new(power: f32) -> Self {
        Self {
            power: power.clamp(0.0, 1.0),
        }
    }
}

/// Hardware-autonomous reflex: fire `coil` when `switch` activates.
///
/// Two rules are the same rule only if every field matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchRule {
    pub switch: SwitchId,
    pub pulse: PulseSettings,
    #[serde(default)]
    pub hold: Option<HoldSettings>,
    #[serde(default)]
    pub recycle: bool,
}

/// How a device's coil expels a ball
#[derive(Debug, Clone, PartialEq)]
pub enum CoilAction {
    /// Single timed pulse
    Pulse(PulseSettings),
    /// Enable until the ball leaves, then disable
    Hold {
        pulse: PulseSettings,
        hold: HoldSettings,
    },
}

/// The coil a device ejects with, plus how it fires it
#[derive(Debug, Clone, PartialEq)]
pub struct EjectCoil {
    pub coil: CoilId,
    pub action: CoilAction,
}

impl EjectCoil {
    pub fn pulse(coil: impl Into<CoilId>, settings: PulseSettings) -> Self {
        Self {
            coil: coil.into(),
            action: CoilAction::Pulse(settings),
        }
    }

    pub fn hold(coil: impl Into<CoilId>, pulse: PulseSettings, hold: HoldSettings) -> Self {
        Self {
            coil: coil.into(),
            action: CoilAction::Hold { pulse, hold },
        }
    }

    #[inline]
    pub fn is_hold(&self) -> bool {
        matches!(self.action, CoilAction::Hold { .. })
    }
}

/// Configuration last written to a driver.
///
/// Drivers compare the next state with this one and skip the write when
/// nothing changed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DriverConfigState {
    pub pulse: PulseSettings,
    pub hold: Option<HoldSettings>,
    pub recycle: bool,
    pub has_rule: bool,
}

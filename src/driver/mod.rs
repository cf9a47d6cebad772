//! Driver Capability
//!
//! The coil-side collaborator of the transport core. Concrete hardware
//! platforms implement [`DriverCapability`]; the core only ever talks to this
//! trait, and the variant is selected by configuration.
//!
//! All commands are fire-and-forget: `Ok(())` means "command accepted", never
//! "ball moved". Confirmation always comes back through switches.

pub mod rules;
pub mod settings;
pub mod virtual_driver;

pub use rules::{RuleChange, SwitchRuleRegistry};
pub use settings::{
    CoilAction, DEFAULT_RECYCLE_FACTOR, DriverConfigState, EjectCoil, HoldSettings, PulseSettings,
    SwitchRule,
};
pub use virtual_driver::{LoggingDriver, VirtualDriver};

use std::sync::Arc;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::config::{CoilConfig, DriverKind};
use crate::core_types::{CoilId, Timestamp};

/// Driver error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Minimum off-time after the previous activation has not elapsed
    #[error("Coil recycling until {ready_at}ms")]
    Recycling { ready_at: Timestamp },

    #[error("Command rejected: {0}")]
    Rejected(String),

    #[error("A different switch rule is already installed on coil {0}")]
    ConflictingRule(CoilId),

    #[error("Driver unavailable: {0}")]
    Unavailable(String),
}

impl DriverError {
    pub fn code(&self) -> &'static str {
        match self {
            DriverError::Recycling { .. } => "RECYCLING",
            DriverError::Rejected(_) => "REJECTED",
            DriverError::ConflictingRule(_) => "CONFLICTING_RULE",
            DriverError::Unavailable(_) => "UNAVAILABLE",
        }
    }
}

/// Capability interface for one physical coil
///
/// The driver, not the core, enforces recycle / minimum off-time: a pulse
/// inside the recycle window is refused with [`DriverError::Recycling`].
pub trait DriverCapability: Send + Sync {
    /// Get driver name for logging
    fn name(&self) -> &str;

    /// Timed activation
    fn pulse(&self, settings: PulseSettings, now: Timestamp) -> Result<(), DriverError>;

    /// Sustained activation: initial pulse then hold power
    fn enable(
        &self,
        pulse: PulseSettings,
        hold: HoldSettings,
        now: Timestamp,
    ) -> Result<(), DriverError>;

    /// End a sustained activation
    fn disable(&self, now: Timestamp) -> Result<(), DriverError>;

    /// Install a hardware-autonomous reflex rule
    fn set_switch_rule(&self, rule: &SwitchRule) -> Result<(), DriverError>;

    /// Remove the installed rule, if any
    fn remove_switch_rule(&self) -> Result<(), DriverError>;
}

/// Drivers by coil id
pub type DriverSet = FxHashMap<CoilId, Arc<dyn DriverCapability>>;

/// Build one driver per configured coil, choosing the variant from config
pub fn build_drivers(coils: &[CoilConfig]) -> DriverSet {
    coils
        .iter()
        .map(|coil| {
            let driver: Arc<dyn DriverCapability> = match coil.driver {
                DriverKind::Virtual => Arc::new(VirtualDriver::new(
                    coil.id.clone(),
                    coil.recycle_factor.unwrap_or(DEFAULT_RECYCLE_FACTOR),
                )),
                DriverKind::Logging => Arc::new(LoggingDriver::new(coil.id.clone())),
            };
            (coil.id.clone(), driver)
        })
        .collect()
}


#[cfg(test)]
pub use mock::MockDriver;

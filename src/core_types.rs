//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// Device ID - the configured name of a ball device ("trough", "plunger").
///
/// # Constraints:
/// - **Unique**: validated at config load
/// - **Stable**: used as the key of the topology map for the whole run
pub type DeviceId = String;

/// Switch ID - the configured name of a debounced switch.
pub type SwitchId = String;

/// Coil ID - the configured name of a driver (solenoid).
pub type CoilId = String;

/// Consumer ID - whoever asked for balls (game, mode, service menu).
pub type ConsumerId = String;

/// Ball request ID - assigned sequentially by the BallController
pub type RequestId = u64;

/// Machine time in milliseconds since boot.
///
/// All timestamps on the single event timeline use this unit.
pub type Timestamp = u64;

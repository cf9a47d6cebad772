//! Ball Devices
//!
//! Per-mechanism state machines. Each device tracks how many balls it holds
//! and owns at most one outbound [`Transfer`](crate::transfer::Transfer).

pub mod ball_device;
pub mod mechanism;
pub mod state;

pub use ball_device::{BallDevice, DEFAULT_EJECT_TIMEOUT_MS, DeviceSnapshot, SwitchOutcome};
pub use mechanism::{Mechanism, MechanismKind};
pub use state::DeviceState;

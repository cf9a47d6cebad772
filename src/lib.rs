//! Pinball Ball Transport
//!
//! Coordination core that tracks where every physical ball is and moves balls
//! between devices on request, using only switches (debounced on/off sensors)
//! and coils (solenoids driven by pulses or sustained enable).
//!
//! # Modules
//!
//! - [`core_types`] - Core type definitions (DeviceId, SwitchId, etc.)
//! - [`config`] - YAML machine description and startup validation
//! - [`device`] - Per-device ball counting FSM
//! - [`transfer`] - Eject / confirm / retry protocol
//! - [`ball_controller`] - Global ball ledger and request dispatch
//! - [`driver`] - Coil capability, switch rules, virtual drivers
//! - [`switch_feed`] - Switch event sources
//! - [`timer`] - Deadline queue on the machine timeline
//! - [`topology`] - Device graph and routing queries
//! - [`machine`] - Single-timeline event loop tying it together
//! - [`runner`] - Async task owning the machine
//! - [`events`] - Transport events and faults published upward
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌────────────┐    ┌──────────┐
//! │ Switches │───▶│ Devices  │───▶│ Transfers  │───▶│  Coils   │
//! │  (feed)  │    │  (FSM)   │    │(eject/conf)│    │ (driver) │
//! └──────────┘    └────┬─────┘    └─────▲──────┘    └──────────┘
//!                      │                │
//!                      ▼                │
//!                ┌────────────────┐     │
//!                │ BallController │─────┘
//!                │(ledger+request)│───▶ events / faults
//!                └────────────────┘
//! ```

// Core types - must be first!
pub mod core_types;

pub mod ball_controller;
pub mod config;
pub mod device;
pub mod driver;
pub mod events;
pub mod logging;
pub mod machine;
pub mod runner;
pub mod switch_feed;
pub mod timer;
pub mod topology;
pub mod transfer;

// Convenient re-exports at crate root
pub use ball_controller::{BallController, BallRequest, ControllerError};
pub use config::{AppConfig, ConfigError, MachineConfig};
pub use core_types::{CoilId, ConsumerId, DeviceId, RequestId, SwitchId, Timestamp};
pub use device::{BallDevice, DeviceSnapshot, DeviceState, Mechanism, MechanismKind};
pub use driver::{DriverCapability, DriverError, DriverSet, SwitchRule, build_drivers};
pub use events::{ConfigFault, EventSink, Fault, TransportEvent};
pub use machine::{Machine, MachineSnapshot};
pub use runner::{MachineHandle, MachineRunner, RunnerError, command_channel};
pub use switch_feed::{SwitchEvent, SwitchFeed, SwitchFeedError};
pub use topology::MachineTopology;
pub use transfer::{Transfer, TransferCoordinator, TransferError};

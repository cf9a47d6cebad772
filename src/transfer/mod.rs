//! Ball Transfers
//!
//! One ball moving from a source device to a target device, driven by the
//! eject / confirm / retry protocol.
//!
//! # Protocol
//!
//! ```text
//!  start ──▶ attempt 0 ──timeout──▶ attempt 1 ──timeout──▶ … ──▶ JAM (fault)
//!              │  pulse / enable /      │  re-pulse, or wait longer
//!              │  hardware rule /       │  if the ball visibly left
//!              │  mechanical            │
//!              └────────── target switch ──────────▶ CONFIRMED
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Decrement on confirmation only**: the source keeps counting the ball
//!    until the target's own switch reports it
//! 2. **At most one transfer per source**
//! 3. **Bounded retries**: `attempt_count` never exceeds `max_attempts`; the
//!    jam fault is raised once
//! 4. **Stale timers are harmless**: timeouts carry the transfer id and window
//!    sequence, so late events never resurrect a retired transfer

pub mod coordinator;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use coordinator::{DEFAULT_MAX_ATTEMPTS, JamReport, TimerOutcome, TransferCoordinator};
pub use error::TransferError;
pub use types::{AttemptAction, AttemptRecord, EjectRequirement, Transfer, TransferId};

//! Transfer Error Types
//!
//! Errors raised by the eject/confirm protocol. Jams are not errors: they are
//! faults reported through the event queue.

use thiserror::Error;

/// Transfer error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Device {0} already has an active transfer")]
    AlreadyEjecting(String),

    #[error("Device {0} has no eject targets")]
    NoEjectTargets(String),

    #[error("Device {0} is not jammed")]
    NotJammed(String),
}

impl TransferError {
    /// Get the error code for diagnostics
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::UnknownDevice(_) => "UNKNOWN_DEVICE",
            TransferError::AlreadyEjecting(_) => "ALREADY_EJECTING",
            TransferError::NoEjectTargets(_) => "NO_EJECT_TARGETS",
            TransferError::NotJammed(_) => "NOT_JAMMED",
        }
    }
}

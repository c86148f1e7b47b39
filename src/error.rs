//! Custom error types for the test station core.
//!
//! This module defines the primary error type, `StationError`, shared by every
//! component of the station. It is built with `thiserror` and mirrors the fault
//! taxonomy of the station:
//!
//! - **`Configuration`** / **`ConfigLoad`**: malformed settings blocks or station
//!   configuration that failed to load or validate.
//! - **`UnknownDevice`**: no capability is registered for a device id. This is the
//!   only hard failure at `submit()`/`start()` call sites.
//! - **`DeviceNotConnected`** / **`DeviceBusy`**: command submission rejected before a
//!   record was created.
//! - **`ExecutionFault`** / **`Timeout`**: a capability call failed or exceeded its
//!   budget. These normally end up as text in `CommandRecord::error_message` rather
//!   than being returned to callers.
//! - **`AcquisitionFault`**: a poll read raised a fault; the pipeline stops.
//! - **`Validation`**: a sample violated its channel limits. Soft: it yields
//!   `Quality::Bad` and the pipeline continues.
//!
//! Capability implementations return `anyhow::Result`; the conversion into
//! `StationError` happens at the dispatcher and pipeline boundaries.

use thiserror::Error;

/// Convenience alias for results using the station error type.
pub type StationResult<T> = std::result::Result<T, StationError>;

/// Errors raised by the test station core.
#[derive(Error, Debug)]
pub enum StationError {
    /// Semantic configuration error (invalid settings block, failed validation).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Configuration sources could not be loaded or extracted.
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] Box<figment::Error>),

    /// No capability is registered under this device id.
    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    /// Target device is not connected; the command was rejected.
    #[error("Device '{0}' is not connected")]
    DeviceNotConnected(String),

    /// Target device queue is saturated; the command was rejected.
    #[error("Device '{0}' is busy (command queue full)")]
    DeviceBusy(String),

    /// The capability raised a fault while executing.
    #[error("Execution fault: {0}")]
    ExecutionFault(String),

    /// The operation exceeded its timeout budget.
    #[error("Timed out after {timeout_ms} ms: {operation}")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Budget that was exceeded.
        timeout_ms: u64,
    },

    /// A poll read raised a fault and the acquisition pipeline stopped.
    #[error("Acquisition fault on '{device_id}': {message}")]
    AcquisitionFault {
        /// Device the pipeline was polling.
        device_id: String,
        /// Fault text reported by the sample source.
        message: String,
    },

    /// A sample failed validation.
    #[error("Validation fault: {0}")]
    Validation(String),

    /// The acquisition pipeline is already collecting.
    #[error("Acquisition already running for '{0}'")]
    AlreadyCollecting(String),

    /// The acquisition pipeline was disposed and cannot be restarted.
    #[error("Acquisition pipeline for '{0}' has been disposed")]
    PipelineDisposed(String),

    /// The signal is not part of the device's catalogue.
    #[error("Signal '{signal}' is not supported by device '{device_id}'")]
    UnsupportedSignal {
        /// Device that was addressed.
        device_id: String,
        /// Signal that was requested.
        signal: String,
    },

    /// A command parameter is missing or has the wrong type.
    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The command dispatch table does not cover every command type.
    #[error("Dispatch table incomplete: no handler for {0}")]
    DispatchTable(String),

    /// The component has been shut down.
    #[error("Shutdown: {0}")]
    Shutdown(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for StationError {
    fn from(err: figment::Error) -> Self {
        StationError::ConfigLoad(Box::new(err))
    }
}

impl StationError {
    /// Returns true for faults that are recovered into status fields instead of
    /// being raised to the caller.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            StationError::ExecutionFault(_)
                | StationError::Timeout { .. }
                | StationError::Validation(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StationError::DeviceNotConnected("loadcell".to_string());
        assert_eq!(err.to_string(), "Device 'loadcell' is not connected");

        let err = StationError::Timeout {
            operation: "ReadSignal".into(),
            timeout_ms: 250,
        };
        assert_eq!(err.to_string(), "Timed out after 250 ms: ReadSignal");
    }

    #[test]
    fn test_soft_faults() {
        assert!(StationError::Validation("over range".into()).is_soft());
        assert!(StationError::ExecutionFault("nak".into()).is_soft());
        assert!(!StationError::UnknownDevice("x".into()).is_soft());
        assert!(!StationError::DeviceBusy("x".into()).is_soft());
    }
}

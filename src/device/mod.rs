//! Signal and device capability model.
//!
//! Every hardware integration (load cell amplifier, servo drive, PLC gateway, ...)
//! implements [`DeviceCapability`]. The rest of the station only talks to devices
//! through this contract:
//!
//! - lifecycle: `connect`, `disconnect`, `test_connection`
//! - signal I/O: `read_signal`, `write_signal`, `configure_signal`
//! - channel maintenance: `calibrate_channel`, `zero_channel`
//! - notifications: `events()` yields [`DeviceEvent`]s
//! - static catalogue: `supported_signals`, `signal`, `is_signal_available`
//!
//! All I/O methods may block on the physical transport for a long time. The model
//! itself does no per-device locking; the command dispatcher serializes access to
//! a device.

pub mod registry;
pub mod signal;
pub mod simulated;

use crate::core::ParameterValue;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

pub use registry::{DeviceEntry, DeviceRegistry};
pub use signal::{SignalChannel, SignalConfig, SignalDirection, ValueRange};
pub use simulated::{SimulatedDevice, SimulatedProvider};

/// Device category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Measuring device (load cell, extensometer, thermocouple).
    Sensor,
    /// Moving or forcing device (servo axis, hydraulic cylinder).
    Actuator,
    /// Closed-loop controller owning several channels.
    Controller,
    /// Protocol gateway in front of other devices.
    Gateway,
    /// Operator display.
    Display,
    /// Anything else.
    #[default]
    Other,
}

/// Connection state of a device.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionStatus {
    /// Connected and idle.
    Connected,
    /// Connected and executing a command.
    Busy,
    /// Not connected.
    #[default]
    Disconnected,
    /// Connection failed or was lost.
    Error,
}

impl ConnectionStatus {
    /// True when commands may be submitted (executed now or queued).
    pub fn accepts_commands(self) -> bool {
        matches!(self, ConnectionStatus::Connected | ConnectionStatus::Busy)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Busy => "busy",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(text)
    }
}

/// Descriptor of a registered device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Unique device identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Device category.
    pub kind: DeviceKind,
    /// Current connection status.
    pub status: ConnectionStatus,
}

impl Device {
    /// New disconnected device descriptor.
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind,
            status: ConnectionStatus::Disconnected,
        }
    }
}

/// Notifications raised by a device integration.
#[derive(Clone, Debug)]
pub enum DeviceEvent {
    /// The integration observed a connection status change.
    StatusChanged {
        /// Device identifier.
        device_id: String,
        /// New status.
        status: ConnectionStatus,
    },
    /// A channel produced data outside of an explicit read.
    ChannelData {
        /// Device identifier.
        device_id: String,
        /// Signal identifier.
        signal: String,
        /// Value produced.
        value: ParameterValue,
        /// Acquisition time.
        timestamp: DateTime<Utc>,
    },
    /// A channel reported an error.
    ChannelError {
        /// Device identifier.
        device_id: String,
        /// Signal identifier.
        signal: String,
        /// Error text.
        message: String,
    },
}

/// Capability contract every device integration implements.
#[async_trait]
pub trait DeviceCapability: Send + Sync {
    /// Identifier of the device behind this capability.
    fn device_id(&self) -> &str;

    /// Open the transport and bring the device online.
    async fn connect(&self) -> Result<()>;

    /// Release the transport.
    async fn disconnect(&self) -> Result<()>;

    /// Round-trip check of the transport; `Ok(false)` means reachable but not
    /// healthy.
    async fn test_connection(&self) -> Result<bool>;

    /// Read the current value of a signal.
    async fn read_signal(&self, signal: &str) -> Result<ParameterValue>;

    /// Write a value to an output signal.
    async fn write_signal(&self, signal: &str, value: ParameterValue) -> Result<()>;

    /// Apply runtime settings (range, sample rate, buffer) to a signal. The
    /// physical address in `config` must match the catalogue.
    async fn configure_signal(&self, signal: &str, config: SignalConfig) -> Result<()>;

    /// Calibrate a channel against a known reference value.
    async fn calibrate_channel(&self, signal: &str, reference: f64) -> Result<()>;

    /// Tare a channel so its current reading becomes zero.
    async fn zero_channel(&self, signal: &str) -> Result<()>;

    /// Static signal catalogue.
    fn supported_signals(&self) -> &[SignalChannel];

    /// Look up one signal in the catalogue.
    fn signal(&self, id: &str) -> Option<&SignalChannel> {
        self.supported_signals().iter().find(|s| s.id() == id)
    }

    /// True if the catalogue contains `id`.
    fn is_signal_available(&self, id: &str) -> bool {
        self.signal(id).is_some()
    }

    /// Subscribe to the device's notifications.
    fn events(&self) -> broadcast::Receiver<DeviceEvent>;
}

/// Supplies capability implementations for configured devices.
pub trait DeviceProvider: Send + Sync {
    /// Build the capability for `device` with its signal catalogue.
    fn create(&self, device: &Device, signals: &[SignalConfig]) -> Result<Arc<dyn DeviceCapability>>;
}

//! Command dispatch and tracking.
//!
//! Commands are immutable requests addressed to one device. The
//! [`CommandDispatcher`] validates the target, records the command as a
//! [`CommandRecord`], runs it on the device's FIFO worker and resolves the
//! caller's [`CommandHandle`] with exactly one [`Response`].
//!
//! ```text
//! submit(Command) ──> CommandRecord(NoExecute) ──> per-device FIFO
//!                                                     │
//!                           worker: Executing ──> DispatchTable handler
//!                                                     │
//!               Completed | Error ──> bus: CommandStatusChanged ──> Response
//! ```

pub mod dispatcher;
pub mod record;
pub mod table;

use crate::core::{ParameterMap, ParameterValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub use dispatcher::{CommandDispatcher, CommandHandle, DispatcherSettings};
pub use record::{CommandRecord, CommandStatus, TrackedCommand};
pub use table::{CommandHandler, DispatchTable};

/// Default command timeout budget.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Closed set of operations a command can request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Transport round trip.
    TestConnection,
    /// Read one signal. Parameter `signal`.
    ReadSignal,
    /// Write one signal. Parameters `signal`, `value`.
    WriteSignal,
    /// Reconfigure one signal. Parameter `signal` plus any of `min`, `max`,
    /// `sample_rate_hz`, `buffer_size`.
    ConfigureSignal,
    /// Calibrate a channel. Parameters `signal`, `reference`.
    CalibrateChannel,
    /// Tare a channel. Parameter `signal`.
    ZeroChannel,
}

impl CommandType {
    /// Every command type, used to validate dispatch tables.
    pub const ALL: [CommandType; 6] = [
        CommandType::TestConnection,
        CommandType::ReadSignal,
        CommandType::WriteSignal,
        CommandType::ConfigureSignal,
        CommandType::CalibrateChannel,
        CommandType::ZeroChannel,
    ];
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandType::TestConnection => "test_connection",
            CommandType::ReadSignal => "read_signal",
            CommandType::WriteSignal => "write_signal",
            CommandType::ConfigureSignal => "configure_signal",
            CommandType::CalibrateChannel => "calibrate_channel",
            CommandType::ZeroChannel => "zero_channel",
        };
        f.write_str(name)
    }
}

/// An immutable request to one device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Command {
    id: Uuid,
    device_id: String,
    command_type: CommandType,
    parameters: ParameterMap,
    issued_at: DateTime<Utc>,
    timeout_ms: u64,
}

impl Command {
    /// New command with a fresh id and the default timeout.
    pub fn new(device_id: impl Into<String>, command_type: CommandType) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: device_id.into(),
            command_type,
            parameters: ParameterMap::new(),
            issued_at: Utc::now(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Adds a parameter.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<ParameterValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Overrides the timeout budget.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// `TestConnection` command.
    pub fn test_connection(device_id: impl Into<String>) -> Self {
        Self::new(device_id, CommandType::TestConnection)
    }

    /// `ReadSignal` command.
    pub fn read_signal(device_id: impl Into<String>, signal: &str) -> Self {
        Self::new(device_id, CommandType::ReadSignal).with_param("signal", signal)
    }

    /// `WriteSignal` command.
    pub fn write_signal(
        device_id: impl Into<String>,
        signal: &str,
        value: impl Into<ParameterValue>,
    ) -> Self {
        Self::new(device_id, CommandType::WriteSignal)
            .with_param("signal", signal)
            .with_param("value", value)
    }

    /// `CalibrateChannel` command.
    pub fn calibrate_channel(device_id: impl Into<String>, signal: &str, reference: f64) -> Self {
        Self::new(device_id, CommandType::CalibrateChannel)
            .with_param("signal", signal)
            .with_param("reference", reference)
    }

    /// `ZeroChannel` command.
    pub fn zero_channel(device_id: impl Into<String>, signal: &str) -> Self {
        Self::new(device_id, CommandType::ZeroChannel).with_param("signal", signal)
    }

    /// Command id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Target device.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Requested operation.
    pub fn command_type(&self) -> CommandType {
        self.command_type
    }

    /// All parameters.
    pub fn parameters(&self) -> &ParameterMap {
        &self.parameters
    }

    /// One parameter.
    pub fn param(&self, name: &str) -> Option<&ParameterValue> {
        self.parameters.get(name)
    }

    /// When the command was issued.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Timeout budget in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }
}

/// The single outcome of a command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Command this answers.
    pub command_id: Uuid,
    /// Device that executed it.
    pub device_id: String,
    /// True when the command completed.
    pub success: bool,
    /// Result payload (`Null` on failure or for commands without a result).
    pub result: ParameterValue,
    /// Failure text.
    pub error_message: Option<String>,
    /// Time spent executing.
    pub execution_duration_ms: Option<u64>,
    /// When the response was produced.
    pub timestamp: DateTime<Utc>,
}

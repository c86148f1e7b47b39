//! Dispatch table mapping command types to capability calls.

use super::{Command, CommandType};
use crate::core::ParameterValue;
use crate::device::{DeviceCapability, SignalConfig, ValueRange};
use crate::error::{StationError, StationResult};
use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;

/// Handler invoked for one command type.
pub type CommandHandler = Arc<
    dyn Fn(Arc<dyn DeviceCapability>, Arc<Command>) -> BoxFuture<'static, Result<ParameterValue>>
        + Send
        + Sync,
>;

/// `CommandType -> handler` map, built once at startup.
#[derive(Clone, Default)]
pub struct DispatchTable {
    handlers: HashMap<CommandType, CommandHandler>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.handlers.keys().map(|t| t.to_string()).collect();
        types.sort();
        f.debug_struct("DispatchTable").field("types", &types).finish()
    }
}

fn signal_param(command: &Command) -> Result<String> {
    command
        .param("signal")
        .and_then(ParameterValue::as_string)
        .ok_or_else(|| anyhow!("missing parameter 'signal'"))
}

fn f64_param(command: &Command, name: &str) -> Result<f64> {
    command
        .param(name)
        .and_then(ParameterValue::as_f64)
        .ok_or_else(|| anyhow!("missing or non-numeric parameter '{name}'"))
}

fn checked_signal(device: &dyn DeviceCapability, command: &Command) -> Result<String> {
    let signal = signal_param(command)?;
    if !device.is_signal_available(&signal) {
        return Err(anyhow!(
            "device '{}' has no signal '{signal}'",
            device.device_id()
        ));
    }
    Ok(signal)
}

/// Merges the runtime overrides carried by a configure command into the
/// catalogue config. The address always comes from the catalogue.
fn configured_signal(device: &dyn DeviceCapability, command: &Command) -> Result<(String, SignalConfig)> {
    let signal = checked_signal(device, command)?;
    let mut config = device
        .signal(&signal)
        .map(|channel| channel.config().clone())
        .ok_or_else(|| anyhow!("device '{}' has no signal '{signal}'", device.device_id()))?;

    let min = command.param("min").and_then(ParameterValue::as_f64);
    let max = command.param("max").and_then(ParameterValue::as_f64);
    if min.is_some() || max.is_some() {
        config.range = ValueRange::new(
            min.unwrap_or(config.range.min),
            max.unwrap_or(config.range.max),
        );
    }
    if let Some(rate) = command.param("sample_rate_hz").and_then(ParameterValue::as_f64) {
        config.sample_rate_hz = rate;
    }
    if let Some(size) = command.param("buffer_size").and_then(ParameterValue::as_i64) {
        config.buffer_size = usize::try_from(size).map_err(|_| anyhow!("buffer_size must be >= 0"))?;
    }
    config.validate()?;
    Ok((signal, config))
}

impl DispatchTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table routing every [`CommandType`] to the matching capability method.
    pub fn standard() -> Self {
        let mut table = Self::new();
        table.register(CommandType::TestConnection, |device, _command| {
            async move { Ok(ParameterValue::Bool(device.test_connection().await?)) }.boxed()
        });
        table.register(CommandType::ReadSignal, |device, command| {
            async move {
                let signal = checked_signal(device.as_ref(), &command)?;
                device.read_signal(&signal).await
            }
            .boxed()
        });
        table.register(CommandType::WriteSignal, |device, command| {
            async move {
                let signal = checked_signal(device.as_ref(), &command)?;
                let value = command
                    .param("value")
                    .cloned()
                    .ok_or_else(|| anyhow!("missing parameter 'value'"))?;
                device.write_signal(&signal, value).await?;
                Ok(ParameterValue::Null)
            }
            .boxed()
        });
        table.register(CommandType::ConfigureSignal, |device, command| {
            async move {
                let (signal, config) = configured_signal(device.as_ref(), &command)?;
                device.configure_signal(&signal, config).await?;
                Ok(ParameterValue::Null)
            }
            .boxed()
        });
        table.register(CommandType::CalibrateChannel, |device, command| {
            async move {
                let signal = checked_signal(device.as_ref(), &command)?;
                let reference = f64_param(&command, "reference")?;
                device.calibrate_channel(&signal, reference).await?;
                Ok(ParameterValue::Null)
            }
            .boxed()
        });
        table.register(CommandType::ZeroChannel, |device, command| {
            async move {
                let signal = checked_signal(device.as_ref(), &command)?;
                device.zero_channel(&signal).await?;
                Ok(ParameterValue::Null)
            }
            .boxed()
        });
        table
    }

    /// Installs or replaces the handler for `command_type`.
    pub fn register<F>(&mut self, command_type: CommandType, handler: F) -> &mut Self
    where
        F: Fn(Arc<dyn DeviceCapability>, Arc<Command>) -> BoxFuture<'static, Result<ParameterValue>>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(command_type, Arc::new(handler));
        self
    }

    /// Checks every command type has a handler.
    pub fn validate(&self) -> StationResult<()> {
        let missing: Vec<String> = CommandType::ALL
            .iter()
            .filter(|t| !self.handlers.contains_key(*t))
            .map(|t| t.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(StationError::DispatchTable(format!(
                "no handler for: {}",
                missing.join(", ")
            )))
        }
    }

    /// Handler for `command_type`.
    pub fn handler(&self, command_type: CommandType) -> Option<CommandHandler> {
        self.handlers.get(&command_type).cloned()
    }
}

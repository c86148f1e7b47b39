//! Signal channel definitions.

use super::DeviceCapability;
use crate::error::{StationError, StationResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};

/// Data direction of a signal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalDirection {
    /// Read only.
    Input,
    /// Write only.
    Output,
    /// Read and write.
    Bidirectional,
}

impl SignalDirection {
    /// True for `Input` and `Bidirectional`.
    pub fn is_readable(self) -> bool {
        matches!(self, SignalDirection::Input | SignalDirection::Bidirectional)
    }

    /// True for `Output` and `Bidirectional`.
    pub fn is_writable(self) -> bool {
        matches!(self, SignalDirection::Output | SignalDirection::Bidirectional)
    }
}

/// Closed engineering-unit range.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl ValueRange {
    /// New range.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// True if `value` lies within `[min, max]`.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// True when both bounds are finite and `min < max`.
    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min < self.max
    }
}

/// Plain configuration record for a signal, as loaded at startup.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Signal identifier, unique per device.
    pub id: String,
    /// Physical address on the owning controller (register, channel index, tag).
    pub address: String,
    /// Data direction.
    pub direction: SignalDirection,
    /// Engineering-unit range.
    pub range: ValueRange,
    /// Sampling rate in Hz.
    #[serde(default = "default_sample_rate")]
    pub sample_rate_hz: f64,
    /// Transport buffer depth in samples.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Controller owning the physical channel.
    #[serde(default)]
    pub controller_id: String,
    /// Engineering unit.
    #[serde(default)]
    pub unit: Option<String>,
}

fn default_sample_rate() -> f64 {
    100.0
}

fn default_buffer_size() -> usize {
    1024
}

impl SignalConfig {
    /// Minimal input signal config, mostly for tests and demos.
    pub fn input(id: impl Into<String>, address: impl Into<String>, range: ValueRange) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            direction: SignalDirection::Input,
            range,
            sample_rate_hz: default_sample_rate(),
            buffer_size: default_buffer_size(),
            controller_id: String::new(),
            unit: None,
        }
    }

    /// Same as [`SignalConfig::input`] with a different direction.
    pub fn with_direction(mut self, direction: SignalDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Sets the engineering unit.
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Checks the record is usable.
    pub fn validate(&self) -> StationResult<()> {
        if self.id.trim().is_empty() {
            return Err(StationError::Configuration("signal id cannot be empty".into()));
        }
        if self.address.trim().is_empty() {
            return Err(StationError::Configuration(format!(
                "signal '{}': address cannot be empty",
                self.id
            )));
        }
        if !self.range.is_valid() {
            return Err(StationError::Configuration(format!(
                "signal '{}': invalid range [{}, {}]",
                self.id, self.range.min, self.range.max
            )));
        }
        if !(self.sample_rate_hz.is_finite() && self.sample_rate_hz > 0.0) {
            return Err(StationError::Configuration(format!(
                "signal '{}': sample_rate_hz must be > 0",
                self.id
            )));
        }
        if self.buffer_size == 0 {
            return Err(StationError::Configuration(format!(
                "signal '{}': buffer_size must be > 0",
                self.id
            )));
        }
        Ok(())
    }
}

/// Immutable signal channel built from a [`SignalConfig`].
///
/// The physical address cannot change once the channel exists. A channel can be
/// attached to the device that serves it; the link is weak so channels never keep
/// a removed device alive.
#[derive(Clone)]
pub struct SignalChannel {
    config: SignalConfig,
    device: Option<Weak<dyn DeviceCapability>>,
}

impl fmt::Debug for SignalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalChannel")
            .field("id", &self.config.id)
            .field("address", &self.config.address)
            .field("direction", &self.config.direction)
            .field("attached", &self.connected_device().is_some())
            .finish()
    }
}

impl SignalChannel {
    /// Validates the config and builds the channel.
    pub fn from_config(config: SignalConfig) -> StationResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            device: None,
        })
    }

    /// Returns a copy linked to `device`.
    pub fn attach(&self, device: &Arc<dyn DeviceCapability>) -> Self {
        Self {
            config: self.config.clone(),
            device: Some(Arc::downgrade(device)),
        }
    }

    /// The device serving this channel, if attached and still alive.
    pub fn connected_device(&self) -> Option<Arc<dyn DeviceCapability>> {
        self.device.as_ref().and_then(Weak::upgrade)
    }

    /// Signal identifier.
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Physical address.
    pub fn address(&self) -> &str {
        &self.config.address
    }

    /// Data direction.
    pub fn direction(&self) -> SignalDirection {
        self.config.direction
    }

    /// Engineering-unit range.
    pub fn range(&self) -> ValueRange {
        self.config.range
    }

    /// Sampling rate in Hz.
    pub fn sample_rate_hz(&self) -> f64 {
        self.config.sample_rate_hz
    }

    /// Transport buffer depth.
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Owning controller.
    pub fn controller_id(&self) -> &str {
        &self.config.controller_id
    }

    /// Engineering unit.
    pub fn unit(&self) -> Option<&str> {
        self.config.unit.as_deref()
    }

    /// The configuration record this channel was built from.
    pub fn config(&self) -> &SignalConfig {
        &self.config
    }
}

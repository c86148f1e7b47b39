//! Station configuration using Figment.
//!
//! Configuration is loaded from a TOML file and then overridden by environment
//! variables prefixed with `TESTSTATION_`. Nested keys are separated by a double
//! underscore:
//!
//! ```text
//! TESTSTATION_APPLICATION__LOG_LEVEL=debug
//! TESTSTATION_ACQUISITION__POLL_INTERVAL_MS=5
//! TESTSTATION_DISPATCHER__QUEUE_CAPACITY=16
//! ```
//!
//! Every section has defaults, so an empty file yields a usable (if deviceless)
//! station.
//!
//! ```no_run
//! use test_station::config::StationConfig;
//!
//! let config = StationConfig::load_from("config/station.toml")?;
//! println!("{} device(s)", config.devices.len());
//! # Ok::<(), test_station::error::StationError>(())
//! ```

use crate::acquisition::PipelineSettings;
use crate::command::DispatcherSettings;
use crate::command::DEFAULT_TIMEOUT_MS;
use crate::device::{Device, DeviceKind, SignalConfig, SignalDirection, ValueRange};
use crate::error::{StationError, StationResult};
use crate::error_recovery::RetryPolicy;
use crate::logging::{parse_log_level, LogFormat, LoggingConfig};
use crate::processing::{ChannelLimits, MetricSource, SampleValidator, DEFAULT_WINDOW};
use crate::settings::ControllerSettings;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level station configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StationConfig {
    /// Application settings.
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Notification bus settings.
    #[serde(default)]
    pub bus: BusConfig,
    /// Command dispatch settings.
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    /// Acquisition settings.
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Validation and aggregation settings.
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Connect retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Device definitions.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    /// Optional controller settings block (`key=value` text file).
    #[serde(default)]
    pub controller_settings: Option<PathBuf>,
}

/// Application-level configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Station name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl ApplicationConfig {
    /// Logging options for this application.
    pub fn logging(&self) -> LoggingConfig {
        LoggingConfig::new(self.log_level.clone()).with_format(self.log_format)
    }
}

/// Notification bus configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Events buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
        }
    }
}

/// Command dispatch configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Timeout applied to commands built by the station.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Commands that may wait per device.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Finished records kept for inspection.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            queue_capacity: default_queue_capacity(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl DispatcherConfig {
    /// Dispatcher tuning derived from this section.
    pub fn settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            queue_capacity: self.queue_capacity,
            history_capacity: self.history_capacity,
        }
    }
}

/// Acquisition configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Reads allowed to run concurrently per pipeline.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Events buffered per subscriber.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Budget for one poll read; a read that exceeds it faults the pipeline.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_in_flight: default_max_in_flight(),
            channel_capacity: default_channel_capacity(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl AcquisitionConfig {
    /// Poll interval as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Pipeline tuning derived from this section.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            max_in_flight: self.max_in_flight,
            channel_capacity: self.channel_capacity,
            read_timeout_ms: self.read_timeout_ms,
        }
    }
}

/// Validation and aggregation configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Trailing window length in samples.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Quantity fed into the window.
    #[serde(default)]
    pub metric_source: MetricSource,
    /// Per-channel limits.
    #[serde(default)]
    pub channel_limits: Vec<ChannelLimits>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            metric_source: MetricSource::default(),
            channel_limits: Vec::new(),
        }
    }
}

/// One configured device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Unique device identifier.
    pub id: String,
    /// Display name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Device category.
    #[serde(default)]
    pub kind: DeviceKind,
    /// Signal catalogue.
    #[serde(default)]
    pub signals: Vec<SignalConfig>,
}

impl DeviceConfig {
    /// Disconnected descriptor for the registry.
    pub fn descriptor(&self) -> Device {
        let name = self.name.clone().unwrap_or_else(|| self.id.clone());
        Device::new(self.id.clone(), name, self.kind)
    }
}

fn default_name() -> String {
    "test-station".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_bus_capacity() -> usize {
    256
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_queue_capacity() -> usize {
    DispatcherSettings::default().queue_capacity
}

fn default_history_capacity() -> usize {
    DispatcherSettings::default().history_capacity
}

fn default_poll_interval_ms() -> u64 {
    10
}

fn default_max_in_flight() -> usize {
    PipelineSettings::default().max_in_flight
}

fn default_channel_capacity() -> usize {
    PipelineSettings::default().channel_capacity
}

fn default_read_timeout_ms() -> u64 {
    PipelineSettings::default().read_timeout_ms
}

fn default_window_size() -> usize {
    DEFAULT_WINDOW
}

fn invalid(message: String) -> StationError {
    StationError::Configuration(message)
}

impl StationConfig {
    /// Loads `path` merged with `TESTSTATION_` environment overrides, then
    /// validates the result. A missing file leaves only defaults and overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> StationResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("TESTSTATION_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses TOML text without environment overrides.
    pub fn from_toml_str(text: &str) -> StationResult<Self> {
        let config: Self = Figment::new().merge(Toml::string(text)).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    ///
    /// - log level is one of trace, debug, info, warn, error
    /// - intervals, capacities and the aggregation window are non-zero
    /// - device ids are unique and non-empty, signal ids unique per device
    /// - every signal range has `min < max`
    /// - channel limits reference existing analog slots with `min < max`
    pub fn validate(&self) -> StationResult<()> {
        parse_log_level(&self.application.log_level)?;

        if self.bus.capacity == 0 {
            return Err(invalid("bus.capacity must be > 0".into()));
        }
        if self.dispatcher.default_timeout_ms == 0 {
            return Err(invalid("dispatcher.default_timeout_ms must be > 0".into()));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(invalid("dispatcher.queue_capacity must be > 0".into()));
        }
        if self.acquisition.poll_interval_ms == 0 {
            return Err(invalid("acquisition.poll_interval_ms must be > 0".into()));
        }
        if self.acquisition.max_in_flight == 0 || self.acquisition.channel_capacity == 0 {
            return Err(invalid(
                "acquisition.max_in_flight and acquisition.channel_capacity must be > 0".into(),
            ));
        }
        if self.acquisition.read_timeout_ms == 0 {
            return Err(invalid("acquisition.read_timeout_ms must be > 0".into()));
        }
        if self.processing.window_size == 0 {
            return Err(invalid("processing.window_size must be > 0".into()));
        }
        self.processing.metric_source.validate()?;
        SampleValidator::new(self.processing.channel_limits.clone())?;
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be >= 1".into()));
        }

        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(invalid("device id must not be empty".into()));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(invalid(format!("duplicate device id '{}'", device.id)));
            }
            let mut signals = HashSet::new();
            for signal in &device.signals {
                signal
                    .validate()
                    .map_err(|e| invalid(format!("device '{}': {e}", device.id)))?;
                if !signals.insert(signal.id.as_str()) {
                    return Err(invalid(format!(
                        "device '{}': duplicate signal id '{}'",
                        device.id, signal.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Reads and parses the controller settings block, if one is configured.
    pub fn load_controller_settings(&self) -> StationResult<Option<ControllerSettings>> {
        match &self.controller_settings {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                ControllerSettings::parse(&text).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Small station with one simulated press controller, used when no
    /// configuration file is given.
    pub fn demo() -> Self {
        let signals = vec![
            SignalConfig::input("force", "AI0", ValueRange::new(0.0, 100.0)).with_unit("kN"),
            SignalConfig::input("position", "AI1", ValueRange::new(0.0, 500.0)).with_unit("mm"),
            SignalConfig::input("temperature", "AI2", ValueRange::new(0.0, 150.0)).with_unit("degC"),
            SignalConfig::input("setpoint", "AO0", ValueRange::new(0.0, 100.0))
                .with_direction(SignalDirection::Output)
                .with_unit("kN"),
        ];
        Self {
            devices: vec![DeviceConfig {
                id: "press-1".into(),
                name: Some("Hydraulic press".into()),
                kind: DeviceKind::Controller,
                signals,
            }],
            processing: ProcessingConfig {
                channel_limits: vec![ChannelLimits::new(0, 0.0, 120.0)],
                ..ProcessingConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [application]
        name = "bench"
        log_level = "debug"
        log_format = "json"

        [dispatcher]
        queue_capacity = 8

        [processing]
        window_size = 50
        metric_source = "position"

        [[processing.channel_limits]]
        channel = 1
        min = -5.0
        max = 5.0
        required = true

        [[devices]]
        id = "load-frame"
        kind = "actuator"

        [[devices.signals]]
        id = "force"
        address = "AI0"
        direction = "input"
        range = { min = -10.0, max = 10.0 }
    "#;

    #[test]
    fn test_parse_sections_and_defaults() {
        let config = StationConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.dispatcher.queue_capacity, 8);
        assert_eq!(config.dispatcher.default_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.processing.metric_source, MetricSource::Position);
        assert!(config.processing.channel_limits[0].required);
        assert_eq!(config.acquisition.poll_interval_ms, 10);

        let device = &config.devices[0];
        assert_eq!(device.descriptor().name, "load-frame");
        assert_eq!(device.kind, DeviceKind::Actuator);
        assert_eq!(device.signals[0].sample_rate_hz, 100.0);
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = StationConfig::from_toml_str("").unwrap();
        assert!(config.devices.is_empty());
        assert_eq!(config.processing.window_size, DEFAULT_WINDOW);
    }

    #[test]
    fn test_demo_is_valid() {
        StationConfig::demo().validate().unwrap();
    }

    #[test]
    fn test_validation_failures() {
        let mut config = StationConfig::demo();
        config.application.log_level = "chatty".into();
        assert!(config.validate().is_err());

        let mut config = StationConfig::demo();
        config.devices.push(config.devices[0].clone());
        assert!(config.validate().is_err());

        let mut config = StationConfig::demo();
        config.devices[0].signals[0].range = ValueRange::new(5.0, 5.0);
        assert!(config.validate().is_err());

        let mut config = StationConfig::demo();
        config.processing.window_size = 0;
        assert!(config.validate().is_err());

        let mut config = StationConfig::demo();
        config.acquisition.poll_interval_ms = 0;
        assert!(config.validate().is_err());

        let mut config = StationConfig::demo();
        config.acquisition.read_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = StationConfig::demo();
        config.processing.channel_limits = vec![ChannelLimits::new(9, 0.0, 1.0)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_controller_settings_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.txt");
        std::fs::write(&path, "maxchan=8\r\nipaddr_0=10.0.0.1\r\n").unwrap();

        let config = StationConfig {
            controller_settings: Some(path),
            ..StationConfig::default()
        };
        let settings = config.load_controller_settings().unwrap().unwrap();
        assert_eq!(settings.max_channels, Some(8));
        assert_eq!(settings.ip_addrs, vec!["10.0.0.1"]);
        assert!(StationConfig::default().load_controller_settings().unwrap().is_none());
    }
}

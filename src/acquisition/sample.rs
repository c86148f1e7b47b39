//! Raw acquisition samples and the sources that produce them.

use crate::core::ParameterValue;
use crate::device::{DeviceEntry, SignalChannel};
use anyhow::Result;
use async_trait::async_trait;
use bitflags::bitflags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Number of analog slots in a [`RawSample`].
pub const ANALOG_CHANNELS: usize = 8;

bitflags! {
    /// Controller status word carried by every sample.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct StatusFlags: u32 {
        /// Force limit exceeded.
        const OVER_FORCE = 1 << 0;
        /// Travel limit exceeded.
        const OVER_TRAVEL = 1 << 1;
        /// Temperature limit exceeded.
        const OVER_TEMPERATURE = 1 << 2;
        /// Emergency stop engaged.
        const EMERGENCY_STOP = 1 << 3;
        /// Drive reports a fault.
        const DRIVE_FAULT = 1 << 4;
        /// Test running on the controller.
        const RUNNING = 1 << 8;
        /// Controller in remote mode.
        const REMOTE = 1 << 9;
    }
}

impl StatusFlags {
    /// Flags that indicate a protection trip.
    pub const PROTECTION: StatusFlags = StatusFlags::OVER_FORCE
        .union(StatusFlags::OVER_TRAVEL)
        .union(StatusFlags::OVER_TEMPERATURE)
        .union(StatusFlags::EMERGENCY_STOP)
        .union(StatusFlags::DRIVE_FAULT);

    /// True if any protection flag is set.
    pub fn has_protection_error(self) -> bool {
        self.intersects(Self::PROTECTION)
    }
}

/// One poll of a device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawSample {
    /// Device that produced the sample.
    pub device_id: String,
    /// Acquisition time.
    pub timestamp: DateTime<Utc>,
    /// Poller tick that requested the sample.
    pub sequence: u64,
    /// Analog inputs; `None` where the slot is not wired or not read.
    pub analog: [Option<f64>; ANALOG_CHANNELS],
    /// Actuator position.
    pub position: Option<f64>,
    /// Measured force.
    pub force: Option<f64>,
    /// Controller status word.
    pub status: StatusFlags,
    /// Digital input word.
    pub digital_inputs: u32,
    /// Digital output word.
    pub digital_outputs: u32,
    /// Test cycle counter.
    pub cycle: u64,
}

impl RawSample {
    /// Empty sample stamped now.
    pub fn new(device_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            device_id: device_id.into(),
            timestamp: Utc::now(),
            sequence,
            analog: [None; ANALOG_CHANNELS],
            position: None,
            force: None,
            status: StatusFlags::empty(),
            digital_inputs: 0,
            digital_outputs: 0,
            cycle: 0,
        }
    }

    /// True when every present value is finite.
    pub fn is_well_formed(&self) -> bool {
        self.analog
            .iter()
            .flatten()
            .chain(self.position.iter())
            .chain(self.force.iter())
            .all(|v| v.is_finite())
    }

    /// True if a protection flag is set.
    pub fn has_protection_error(&self) -> bool {
        self.status.has_protection_error()
    }
}

/// Anything the acquisition pipeline can poll.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Device the samples belong to.
    fn device_id(&self) -> &str;

    /// Reads one sample for tick `sequence`. `Ok(None)` means nothing was
    /// available this tick.
    async fn read_sample(&self, sequence: u64) -> Result<Option<RawSample>>;

    /// False once the source can no longer be polled.
    fn is_available(&self) -> bool {
        true
    }
}

/// Field of a [`RawSample`] a signal feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSlot {
    /// Analog slot `0..ANALOG_CHANNELS`.
    Analog(usize),
    /// Actuator position.
    Position,
    /// Measured force.
    Force,
    /// Controller status word.
    Status,
    /// Digital input word.
    DigitalIn,
    /// Digital output word.
    DigitalOut,
    /// Cycle counter.
    Cycle,
}

/// Which signal feeds which sample slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Wiring {
    slots: Vec<(SampleSlot, String)>,
}

impl Wiring {
    /// Empty wiring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wires `signal` into `slot`, replacing an earlier wire for that slot.
    pub fn wire(mut self, slot: SampleSlot, signal: impl Into<String>) -> Self {
        self.slots.retain(|(s, _)| *s != slot);
        self.slots.push((slot, signal.into()));
        self
    }

    /// Wiring derived from signal names: `force`, `position`, `status`,
    /// `digital_in`, `digital_out` and `cycle` go to their named slots; the
    /// remaining readable signals fill the analog slots in catalogue order.
    pub fn from_catalogue(channels: &[SignalChannel]) -> Self {
        let mut wiring = Self::new();
        let mut analog = 0;
        for channel in channels.iter().filter(|c| c.direction().is_readable()) {
            let slot = match channel.id().to_ascii_lowercase().as_str() {
                "force" => SampleSlot::Force,
                "position" => SampleSlot::Position,
                "status" => SampleSlot::Status,
                "digital_in" => SampleSlot::DigitalIn,
                "digital_out" => SampleSlot::DigitalOut,
                "cycle" => SampleSlot::Cycle,
                _ if analog < ANALOG_CHANNELS => {
                    analog += 1;
                    SampleSlot::Analog(analog - 1)
                }
                _ => continue,
            };
            wiring = wiring.wire(slot, channel.id());
        }
        wiring
    }

    /// Wired `(slot, signal)` pairs.
    pub fn slots(&self) -> &[(SampleSlot, String)] {
        &self.slots
    }

    /// Signal wired to `slot`.
    pub fn signal_for(&self, slot: SampleSlot) -> Option<&str> {
        self.slots
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, signal)| signal.as_str())
    }
}

fn as_word(value: &ParameterValue) -> u32 {
    value
        .as_i64()
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

fn apply(sample: &mut RawSample, slot: SampleSlot, value: &ParameterValue) {
    match slot {
        SampleSlot::Analog(i) if i < ANALOG_CHANNELS => sample.analog[i] = value.as_f64(),
        SampleSlot::Analog(_) => {}
        SampleSlot::Position => sample.position = value.as_f64(),
        SampleSlot::Force => sample.force = value.as_f64(),
        SampleSlot::Status => sample.status = StatusFlags::from_bits_truncate(as_word(value)),
        SampleSlot::DigitalIn => sample.digital_inputs = as_word(value),
        SampleSlot::DigitalOut => sample.digital_outputs = as_word(value),
        SampleSlot::Cycle => {
            sample.cycle = value.as_i64().and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
        }
    }
}

/// [`SampleSource`] reading wired signals of a registered device.
///
/// Each read takes the device's operation lock, so polls interleave with
/// commands instead of overlapping them. The pipeline drops a read that
/// outlives its budget, which releases the lock.
pub struct ChannelSampler {
    device_id: String,
    entry: Arc<DeviceEntry>,
    wiring: Wiring,
}

impl std::fmt::Debug for ChannelSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSampler")
            .field("device_id", &self.device_id)
            .field("wiring", &self.wiring)
            .finish()
    }
}

impl ChannelSampler {
    /// Sampler over `entry` using `wiring`.
    pub fn new(entry: Arc<DeviceEntry>, wiring: Wiring) -> Self {
        Self {
            device_id: entry.id(),
            entry,
            wiring,
        }
    }

    /// Sampler wired from the device's catalogue.
    pub fn from_catalogue(entry: Arc<DeviceEntry>) -> Self {
        let wiring = Wiring::from_catalogue(entry.channels());
        Self::new(entry, wiring)
    }

    /// Current wiring.
    pub fn wiring(&self) -> &Wiring {
        &self.wiring
    }
}

#[async_trait]
impl SampleSource for ChannelSampler {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn read_sample(&self, sequence: u64) -> Result<Option<RawSample>> {
        if self.wiring.slots().is_empty() {
            return Ok(None);
        }
        let capability = self.entry.capability();
        let _operation = self.entry.lock_operation().await;
        if !self.is_available() {
            return Ok(None);
        }
        let mut sample = RawSample::new(self.device_id.as_str(), sequence);
        for (slot, signal) in self.wiring.slots() {
            let value = capability.read_signal(signal).await?;
            apply(&mut sample, *slot, &value);
        }
        sample.timestamp = Utc::now();
        Ok(Some(sample))
    }

    fn is_available(&self) -> bool {
        !self.entry.is_retired() && self.entry.status().accepts_commands()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{SignalConfig, SignalDirection, ValueRange};

    fn channel(id: &str, direction: SignalDirection) -> SignalChannel {
        SignalChannel::from_config(
            SignalConfig::input(id, format!("ADDR_{id}"), ValueRange::new(0.0, 1.0))
                .with_direction(direction),
        )
        .unwrap()
    }

    #[test]
    fn test_protection_mask() {
        assert!(StatusFlags::EMERGENCY_STOP.has_protection_error());
        assert!((StatusFlags::RUNNING | StatusFlags::OVER_FORCE).has_protection_error());
        assert!(!(StatusFlags::RUNNING | StatusFlags::REMOTE).has_protection_error());
    }

    #[test]
    fn test_non_finite_values_are_malformed() {
        let mut sample = RawSample::new("dev", 1);
        sample.analog[3] = Some(1.5);
        sample.force = Some(2.0);
        assert!(sample.is_well_formed());
        sample.analog[7] = Some(f64::NAN);
        assert!(!sample.is_well_formed());
        sample.analog[7] = None;
        sample.position = Some(f64::INFINITY);
        assert!(!sample.is_well_formed());
    }

    #[test]
    fn test_wiring_from_catalogue() {
        let channels = vec![
            channel("force", SignalDirection::Input),
            channel("strain_a", SignalDirection::Input),
            channel("valve", SignalDirection::Output),
            channel("Position", SignalDirection::Bidirectional),
            channel("strain_b", SignalDirection::Input),
        ];
        let wiring = Wiring::from_catalogue(&channels);
        assert_eq!(wiring.signal_for(SampleSlot::Force), Some("force"));
        assert_eq!(wiring.signal_for(SampleSlot::Position), Some("Position"));
        assert_eq!(wiring.signal_for(SampleSlot::Analog(0)), Some("strain_a"));
        assert_eq!(wiring.signal_for(SampleSlot::Analog(1)), Some("strain_b"));
        assert_eq!(wiring.slots().len(), 4);
    }

    #[test]
    fn test_apply_status_word() {
        let mut sample = RawSample::new("dev", 1);
        apply(&mut sample, SampleSlot::Status, &ParameterValue::Int(0b1_0000_1000));
        assert!(sample.status.contains(StatusFlags::EMERGENCY_STOP));
        assert!(sample.status.contains(StatusFlags::RUNNING));
        apply(&mut sample, SampleSlot::Analog(9), &ParameterValue::Float(1.0));
        assert!(sample.analog.iter().all(Option::is_none));
    }
}

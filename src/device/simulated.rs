//! Simulated Devices
//!
//! In-memory [`DeviceCapability`] implementation for tests and the demo binary.
//! All delays use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Behaviour
//!
//! - Input channels produce `offset + amplitude * sin(2πft)` plus uniform noise
//!   unless a fixed value was set or written.
//! - `zero_channel` tares the current reading, `calibrate_channel` scales the
//!   tared reading onto a reference value.
//! - Latency, connect failures, I/O failures and hangs can be injected.
//! - The largest number of overlapping I/O calls is tracked so callers can check
//!   that access is serialized.

use super::{
    ConnectionStatus, Device, DeviceCapability, DeviceEvent, DeviceProvider, SignalChannel,
    SignalConfig,
};
use crate::core::ParameterValue;
use crate::error::StationResult;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, trace};

const HANG_POLL: Duration = Duration::from_millis(2);

/// Waveform produced by a simulated input channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Waveform {
    /// DC offset.
    pub offset: f64,
    /// Sine amplitude.
    pub amplitude: f64,
    /// Sine frequency in Hz.
    pub frequency_hz: f64,
    /// Half-width of the uniform noise band.
    pub noise: f64,
}

impl Waveform {
    /// Constant signal.
    pub fn constant(value: f64) -> Self {
        Self {
            offset: value,
            amplitude: 0.0,
            frequency_hz: 0.0,
            noise: 0.0,
        }
    }

    /// Sine around the middle of `[min, max]` using a quarter of the span.
    pub fn for_range(min: f64, max: f64) -> Self {
        let span = max - min;
        Self {
            offset: min + span / 2.0,
            amplitude: span / 4.0,
            frequency_hz: 0.5,
            noise: span / 1000.0,
        }
    }

    fn sample(&self, t: f64) -> f64 {
        let mut value = self.offset + self.amplitude * (TAU * self.frequency_hz * t).sin();
        if self.noise > 0.0 {
            value += rand::thread_rng().gen_range(-self.noise..=self.noise);
        }
        value
    }
}

#[derive(Debug)]
struct ChannelState {
    waveform: Waveform,
    fixed: Option<ParameterValue>,
    zero: f64,
    gain: f64,
    runtime: SignalConfig,
}

struct CallGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Simulated device with a static signal catalogue.
pub struct SimulatedDevice {
    id: String,
    signals: Vec<SignalChannel>,
    channels: Mutex<HashMap<String, ChannelState>>,
    connected: AtomicBool,
    latency: Mutex<Duration>,
    hang: AtomicBool,
    fail_io: AtomicBool,
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    active_calls: AtomicUsize,
    max_concurrent_calls: AtomicUsize,
    calls: AtomicUsize,
    epoch: Instant,
    events: broadcast::Sender<DeviceEvent>,
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("id", &self.id)
            .field("signals", &self.signals.len())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl SimulatedDevice {
    /// Creates a disconnected device serving `signals`.
    pub fn new(id: impl Into<String>, signals: &[SignalConfig]) -> StationResult<Self> {
        let mut catalogue = Vec::with_capacity(signals.len());
        let mut channels = HashMap::with_capacity(signals.len());
        for config in signals {
            catalogue.push(SignalChannel::from_config(config.clone())?);
            channels.insert(
                config.id.clone(),
                ChannelState {
                    waveform: Waveform::for_range(config.range.min, config.range.max),
                    fixed: None,
                    zero: 0.0,
                    gain: 1.0,
                    runtime: config.clone(),
                },
            );
        }
        let (events, _) = broadcast::channel(256);
        Ok(Self {
            id: id.into(),
            signals: catalogue,
            channels: Mutex::new(channels),
            connected: AtomicBool::new(false),
            latency: Mutex::new(Duration::ZERO),
            hang: AtomicBool::new(false),
            fail_io: AtomicBool::new(false),
            connect_failures: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            active_calls: AtomicUsize::new(0),
            max_concurrent_calls: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            epoch: Instant::now(),
            events,
        })
    }

    /// Delay applied to every I/O call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// When set, I/O calls stall until it is cleared again.
    pub fn set_hang(&self, hang: bool) {
        self.hang.store(hang, Ordering::SeqCst);
    }

    /// When set, I/O calls fail.
    pub fn set_fail_io(&self, fail: bool) {
        self.fail_io.store(fail, Ordering::SeqCst);
    }

    /// The next `count` connect attempts fail.
    pub fn fail_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Replaces the waveform of a channel.
    pub fn set_waveform(&self, signal: &str, waveform: Waveform) -> Result<()> {
        let mut channels = self.channels.lock();
        let state = channels
            .get_mut(signal)
            .ok_or_else(|| anyhow!("unknown signal '{signal}'"))?;
        state.waveform = waveform;
        state.fixed = None;
        Ok(())
    }

    /// Pins a channel to a fixed raw value.
    pub fn set_value(&self, signal: &str, value: impl Into<ParameterValue>) -> Result<()> {
        let mut channels = self.channels.lock();
        let state = channels
            .get_mut(signal)
            .ok_or_else(|| anyhow!("unknown signal '{signal}'"))?;
        state.fixed = Some(value.into());
        Ok(())
    }

    /// Runtime configuration last applied to a channel.
    pub fn runtime_config(&self, signal: &str) -> Option<SignalConfig> {
        self.channels.lock().get(signal).map(|s| s.runtime.clone())
    }

    /// Connect attempts seen so far.
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Largest number of I/O calls that overlapped.
    pub fn max_concurrent_calls(&self) -> usize {
        self.max_concurrent_calls.load(Ordering::SeqCst)
    }

    /// Total I/O calls started.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// True while connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn begin_io(&self) -> Result<CallGuard<'_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.active_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_calls.fetch_max(active, Ordering::SeqCst);
        let guard = CallGuard {
            active: &self.active_calls,
        };

        let latency = *self.latency.lock();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        while self.hang.load(Ordering::SeqCst) {
            sleep(HANG_POLL).await;
        }
        if self.fail_io.load(Ordering::SeqCst) {
            bail!("{}: simulated I/O failure", self.id);
        }
        if !self.is_connected() {
            bail!("{}: not connected", self.id);
        }
        Ok(guard)
    }

    fn require_signal(&self, signal: &str) -> Result<&SignalChannel> {
        self.signal(signal)
            .ok_or_else(|| anyhow!("{}: unknown signal '{signal}'", self.id))
    }

    fn raw_value(&self, state: &ChannelState) -> f64 {
        match &state.fixed {
            Some(value) => value.as_f64().unwrap_or(0.0),
            None => state.waveform.sample(self.epoch.elapsed().as_secs_f64()),
        }
    }

    fn set_connected(&self, connected: bool) {
        let previous = self.connected.swap(connected, Ordering::SeqCst);
        if previous != connected {
            let status = if connected {
                ConnectionStatus::Connected
            } else {
                ConnectionStatus::Disconnected
            };
            let _ = self.events.send(DeviceEvent::StatusChanged {
                device_id: self.id.clone(),
                status,
            });
        }
    }
}

#[async_trait]
impl DeviceCapability for SimulatedDevice {
    fn device_id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<()> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            sleep(latency).await;
        }
        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            bail!("{}: simulated connection refused", self.id);
        }
        self.set_connected(true);
        debug!(device_id = %self.id, "Simulated device connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.set_connected(false);
        debug!(device_id = %self.id, "Simulated device disconnected");
        Ok(())
    }

    async fn test_connection(&self) -> Result<bool> {
        let _call = self.begin_io().await?;
        Ok(true)
    }

    async fn read_signal(&self, signal: &str) -> Result<ParameterValue> {
        let _call = self.begin_io().await?;
        self.require_signal(signal)?;
        let value = {
            let channels = self.channels.lock();
            let state = channels
                .get(signal)
                .ok_or_else(|| anyhow!("{}: unknown signal '{signal}'", self.id))?;
            match &state.fixed {
                Some(value) if value.as_f64().is_none() => value.clone(),
                _ => ParameterValue::Float((self.raw_value(state) - state.zero) * state.gain),
            }
        };
        trace!(device_id = %self.id, signal, %value, "Simulated read");
        let _ = self.events.send(DeviceEvent::ChannelData {
            device_id: self.id.clone(),
            signal: signal.to_string(),
            value: value.clone(),
            timestamp: Utc::now(),
        });
        Ok(value)
    }

    async fn write_signal(&self, signal: &str, value: ParameterValue) -> Result<()> {
        let _call = self.begin_io().await?;
        let channel = self.require_signal(signal)?;
        if !channel.direction().is_writable() {
            let _ = self.events.send(DeviceEvent::ChannelError {
                device_id: self.id.clone(),
                signal: signal.to_string(),
                message: "write to input-only signal".to_string(),
            });
            bail!("{}: signal '{signal}' is not writable", self.id);
        }
        if let Some(number) = value.as_f64() {
            if !channel.range().contains(number) {
                bail!(
                    "{}: value {number} outside [{}, {}] for '{signal}'",
                    self.id,
                    channel.range().min,
                    channel.range().max
                );
            }
        }
        if let Some(state) = self.channels.lock().get_mut(signal) {
            state.fixed = Some(value);
        }
        Ok(())
    }

    async fn configure_signal(&self, signal: &str, config: SignalConfig) -> Result<()> {
        let _call = self.begin_io().await?;
        let channel = self.require_signal(signal)?;
        if config.address != channel.address() {
            bail!(
                "{}: address of '{signal}' is fixed at '{}'",
                self.id,
                channel.address()
            );
        }
        config.validate()?;
        if let Some(state) = self.channels.lock().get_mut(signal) {
            state.runtime = config;
        }
        Ok(())
    }

    async fn calibrate_channel(&self, signal: &str, reference: f64) -> Result<()> {
        let _call = self.begin_io().await?;
        self.require_signal(signal)?;
        let mut channels = self.channels.lock();
        let state = channels
            .get_mut(signal)
            .ok_or_else(|| anyhow!("{}: unknown signal '{signal}'", self.id))?;
        let tared = self.raw_value(state) - state.zero;
        if tared.abs() < f64::EPSILON {
            bail!("{}: cannot calibrate '{signal}' at zero reading", self.id);
        }
        state.gain = reference / tared;
        debug!(device_id = %self.id, signal, gain = state.gain, "Channel calibrated");
        Ok(())
    }

    async fn zero_channel(&self, signal: &str) -> Result<()> {
        let _call = self.begin_io().await?;
        self.require_signal(signal)?;
        let mut channels = self.channels.lock();
        let state = channels
            .get_mut(signal)
            .ok_or_else(|| anyhow!("{}: unknown signal '{signal}'", self.id))?;
        state.zero = self.raw_value(state);
        debug!(device_id = %self.id, signal, zero = state.zero, "Channel zeroed");
        Ok(())
    }

    fn supported_signals(&self) -> &[SignalChannel] {
        &self.signals
    }

    fn events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

/// Builds [`SimulatedDevice`]s for configured devices.
#[derive(Clone, Debug, Default)]
pub struct SimulatedProvider {
    latency: Duration,
}

impl SimulatedProvider {
    /// Provider whose devices answer after `latency`.
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl DeviceProvider for SimulatedProvider {
    fn create(&self, device: &Device, signals: &[SignalConfig]) -> Result<Arc<dyn DeviceCapability>> {
        let simulated = SimulatedDevice::new(device.id.clone(), signals)?;
        simulated.set_latency(self.latency);
        Ok(Arc::new(simulated))
    }
}

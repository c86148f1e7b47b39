//! Continuous acquisition pipeline.
//!
//! One poller task per pipeline ticks on a `tokio::time::interval`. Every tick
//! spawns a read of the [`SampleSource`]; reads never block the ticker, and at most
//! `max_in_flight` of them run at once per start. A read that outlives
//! `read_timeout_ms` is dropped and reported as a fault. Results come back to
//! the poller, which filters them and broadcasts the survivors:
//!
//! ```text
//! interval ──tick──> spawn read ──> results ──> gate ──> broadcast ──> subscribers
//!                   (≤ max_in_flight)          │
//!                                              ├─ Ok(None) / non-finite  -> filtered
//!                                              ├─ older than last tick   -> stale
//!                                              └─ Err / timed out        -> Fault, stop
//! ```
//!
//! Delivery happens while holding the gate lock that [`AcquisitionPipeline::stop`]
//! takes, so once `stop` returns no further sample reaches subscribers. A slow
//! subscriber only lags itself and loses its oldest samples.

use super::sample::{RawSample, SampleSource};
use crate::bus::{EventBus, StationEvent};
use crate::error::{StationError, StationResult};
use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Pipeline tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Reads allowed to run concurrently; extra ticks are skipped.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Events buffered per subscriber before the oldest are dropped.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Budget for one read in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl PipelineSettings {
    /// Read budget as a duration.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn default_max_in_flight() -> usize {
    4
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_read_timeout_ms() -> u64 {
    1000
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            channel_capacity: default_channel_capacity(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

/// Events delivered to pipeline subscribers.
#[derive(Clone, Debug)]
pub enum AcquisitionEvent {
    /// A valid sample.
    Sample(Arc<RawSample>),
    /// A read failed; the pipeline has stopped.
    Fault {
        /// Polled device.
        device_id: String,
        /// Fault text.
        message: String,
    },
    /// The pipeline stopped normally.
    Completed {
        /// Polled device.
        device_id: String,
    },
}

/// Pipeline counters since construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Ticks observed.
    pub ticks: u64,
    /// Samples broadcast.
    pub delivered: u64,
    /// Empty or non-finite reads dropped.
    pub filtered: u64,
    /// Ticks skipped because too many reads were in flight.
    pub skipped: u64,
    /// Results dropped for arriving behind a newer sample.
    pub stale: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    delivered: AtomicU64,
    filtered: AtomicU64,
    skipped: AtomicU64,
    stale: AtomicU64,
}

struct Gate {
    collecting: bool,
    disposed: bool,
    generation: u64,
    last_sequence: Option<u64>,
    last_timestamp: Option<DateTime<Utc>>,
    shutdown: Option<oneshot::Sender<()>>,
}

struct Shared {
    device_id: String,
    gate: Mutex<Gate>,
    sender: broadcast::Sender<AcquisitionEvent>,
    bus: Option<Arc<EventBus>>,
    counters: Counters,
}

impl Shared {
    fn publish_state(&self, collecting: bool) {
        if let Some(bus) = &self.bus {
            bus.publish(StationEvent::AcquisitionStateChanged {
                device_id: self.device_id.clone(),
                collecting,
                timestamp: Utc::now(),
            });
        }
    }

    /// Handles one read result. Returns false when the poller should exit.
    fn deliver(&self, generation: u64, sequence: u64, result: Result<Option<RawSample>>) -> bool {
        let mut gate = self.gate.lock();
        if !gate.collecting || gate.generation != generation {
            return false;
        }

        let sample = match result {
            Err(err) => {
                let message = format!("{err:#}");
                gate.collecting = false;
                gate.shutdown = None;
                let _ = self.sender.send(AcquisitionEvent::Fault {
                    device_id: self.device_id.clone(),
                    message: message.clone(),
                });
                drop(gate);

                warn!(device_id = %self.device_id, sequence, error = %message, "Acquisition fault, pipeline stopped");
                if let Some(bus) = &self.bus {
                    bus.publish(StationEvent::AcquisitionFault {
                        device_id: self.device_id.clone(),
                        message,
                        timestamp: Utc::now(),
                    });
                }
                self.publish_state(false);
                return false;
            }
            Ok(None) => {
                self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Ok(Some(sample)) if !sample.is_well_formed() => {
                debug!(device_id = %self.device_id, sequence, "Dropping non-finite sample");
                self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                return true;
            }
            Ok(Some(sample)) => sample,
        };

        let behind_sequence = gate.last_sequence.is_some_and(|last| sequence <= last);
        let behind_time = gate
            .last_timestamp
            .is_some_and(|last| sample.timestamp < last);
        if behind_sequence || behind_time {
            self.counters.stale.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        gate.last_sequence = Some(sequence);
        gate.last_timestamp = Some(sample.timestamp);
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        let _ = self.sender.send(AcquisitionEvent::Sample(Arc::new(sample)));
        true
    }
}

/// Polls one [`SampleSource`] and broadcasts its samples.
pub struct AcquisitionPipeline {
    shared: Arc<Shared>,
    settings: PipelineSettings,
}

impl std::fmt::Debug for AcquisitionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionPipeline")
            .field("device_id", &self.shared.device_id)
            .field("collecting", &self.is_collecting())
            .field("stats", &self.stats())
            .finish()
    }
}

impl AcquisitionPipeline {
    /// Idle pipeline for `device_id`. State changes and faults go to `bus` when
    /// one is given.
    pub fn new(
        device_id: impl Into<String>,
        settings: PipelineSettings,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        let (sender, _) = broadcast::channel(settings.channel_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                device_id: device_id.into(),
                gate: Mutex::new(Gate {
                    collecting: false,
                    disposed: false,
                    generation: 0,
                    last_sequence: None,
                    last_timestamp: None,
                    shutdown: None,
                }),
                sender,
                bus,
                counters: Counters::default(),
            }),
            settings,
        }
    }

    /// Device this pipeline polls.
    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    /// Starts polling `source` every `interval`.
    pub fn start(&self, source: Arc<dyn SampleSource>, interval: Duration) -> StationResult<()> {
        if interval.is_zero() {
            return Err(StationError::Configuration(
                "acquisition interval must be > 0".into(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| {
            StationError::Configuration("acquisition requires a Tokio runtime".into())
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let generation = {
            let mut gate = self.shared.gate.lock();
            if gate.disposed {
                return Err(StationError::PipelineDisposed(self.shared.device_id.clone()));
            }
            if gate.collecting {
                return Err(StationError::AlreadyCollecting(self.shared.device_id.clone()));
            }
            gate.collecting = true;
            gate.generation += 1;
            gate.last_sequence = None;
            gate.last_timestamp = None;
            gate.shutdown = Some(shutdown_tx);
            gate.generation
        };

        runtime.spawn(poll(
            Arc::clone(&self.shared),
            source,
            interval,
            self.settings.clone(),
            generation,
            shutdown_rx,
        ));
        info!(
            device_id = %self.shared.device_id,
            interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            "Acquisition started"
        );
        self.shared.publish_state(true);
        Ok(())
    }

    /// Stops polling. Returns immediately; in-flight reads finish in the
    /// background and their results are discarded. Calling it again is a no-op.
    pub fn stop(&self) {
        self.halt(false);
    }

    /// Stops and tears the pipeline down for good; `start` fails afterwards.
    pub fn dispose(&self) {
        self.halt(true);
    }

    fn halt(&self, dispose: bool) {
        let mut gate = self.shared.gate.lock();
        if dispose {
            gate.disposed = true;
        }
        if !gate.collecting {
            return;
        }
        gate.collecting = false;
        if let Some(shutdown) = gate.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = self.shared.sender.send(AcquisitionEvent::Completed {
            device_id: self.shared.device_id.clone(),
        });
        drop(gate);

        info!(device_id = %self.shared.device_id, "Acquisition stopped");
        self.shared.publish_state(false);
    }

    /// True while polling.
    pub fn is_collecting(&self) -> bool {
        self.shared.gate.lock().collecting
    }

    /// True after [`AcquisitionPipeline::dispose`].
    pub fn is_disposed(&self) -> bool {
        self.shared.gate.lock().disposed
    }

    /// New receiver. Only events sent after this call are delivered.
    pub fn subscribe(&self) -> broadcast::Receiver<AcquisitionEvent> {
        self.shared.sender.subscribe()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PipelineStats {
        let c = &self.shared.counters;
        PipelineStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            filtered: c.filtered.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
        }
    }
}

impl Drop for AcquisitionPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn poll(
    shared: Arc<Shared>,
    source: Arc<dyn SampleSource>,
    interval: Duration,
    settings: PipelineSettings,
    generation: u64,
    mut shutdown: oneshot::Receiver<()>,
) {
    let max_in_flight = settings.max_in_flight.max(1);
    let read_timeout = settings.read_timeout();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sequence: u64 = 0;

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            Some((seq, result)) = result_rx.recv() => {
                if !shared.deliver(generation, seq, result) {
                    break;
                }
            }
            _ = ticker.tick() => {
                shared.counters.ticks.fetch_add(1, Ordering::Relaxed);
                if !source.is_available() {
                    info!(device_id = %shared.device_id, "Sample source unavailable, stopping acquisition");
                    let stopped = {
                        let mut gate = shared.gate.lock();
                        let current = gate.collecting && gate.generation == generation;
                        if current {
                            gate.collecting = false;
                            gate.shutdown = None;
                            let _ = shared.sender.send(AcquisitionEvent::Completed {
                                device_id: shared.device_id.clone(),
                            });
                        }
                        current
                    };
                    if stopped {
                        shared.publish_state(false);
                    }
                    break;
                }
                if in_flight.load(Ordering::Acquire) >= max_in_flight {
                    shared.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                sequence += 1;
                in_flight.fetch_add(1, Ordering::AcqRel);
                let seq = sequence;
                let source = Arc::clone(&source);
                let in_flight = Arc::clone(&in_flight);
                let result_tx = result_tx.clone();
                tokio::spawn(async move {
                    let result = match tokio::time::timeout(read_timeout, source.read_sample(seq)).await {
                        Ok(result) => result,
                        Err(_) => Err(StationError::Timeout {
                            operation: "read_sample".into(),
                            timeout_ms: u64::try_from(read_timeout.as_millis()).unwrap_or(u64::MAX),
                        }
                        .into()),
                    };
                    in_flight.fetch_sub(1, Ordering::AcqRel);
                    let _ = result_tx.send((seq, result));
                });
            }
        }
    }
    debug!(device_id = %shared.device_id, generation, "Poller exited");
}

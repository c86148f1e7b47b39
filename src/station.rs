//! Station assembly: wires configuration, devices, dispatch, acquisition and
//! processing together.

use crate::acquisition::AcquisitionManager;
use crate::bus::EventBus;
use crate::command::{Command, CommandDispatcher, CommandHandle, CommandType, DispatchTable};
use crate::config::StationConfig;
use crate::device::{DeviceProvider, DeviceRegistry};
use crate::error::{StationError, StationResult};
use crate::processing::{
    AggregatedMetrics, ProcessedSample, ProcessingStage, SampleProcessor, SampleValidator,
};
use crate::session::TestSession;
use crate::settings::ControllerSettings;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// A configured test station.
pub struct TestStation {
    config: StationConfig,
    bus: Arc<EventBus>,
    registry: Arc<DeviceRegistry>,
    dispatcher: CommandDispatcher,
    acquisition: AcquisitionManager,
    stages: Mutex<HashMap<String, ProcessingStage>>,
    controller: Option<ControllerSettings>,
}

impl std::fmt::Debug for TestStation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestStation")
            .field("name", &self.config.application.name)
            .field("devices", &self.registry.ids())
            .field("processing", &self.stages.lock().len())
            .finish()
    }
}

impl TestStation {
    /// Builds a station from `config`, creating each device's capability with
    /// `provider`. Devices start disconnected.
    pub fn build(config: StationConfig, provider: &dyn DeviceProvider) -> StationResult<Self> {
        config.validate()?;
        let controller = config.load_controller_settings()?;

        let bus = Arc::new(EventBus::new(config.bus.capacity));
        let registry = Arc::new(DeviceRegistry::new(Arc::clone(&bus), config.retry.clone()));
        for device in &config.devices {
            let descriptor = device.descriptor();
            let capability = provider.create(&descriptor, &device.signals).map_err(|e| {
                StationError::Configuration(format!("device '{}': {e:#}", device.id))
            })?;
            registry.insert(descriptor, capability)?;
        }

        let dispatcher = CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            DispatchTable::standard(),
            config.dispatcher.settings(),
        )?;
        let acquisition = AcquisitionManager::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            config.acquisition.pipeline_settings(),
        );

        info!(
            station = %config.application.name,
            devices = config.devices.len(),
            "Station built"
        );
        Ok(Self {
            config,
            bus,
            registry,
            dispatcher,
            acquisition,
            stages: Mutex::new(HashMap::new()),
            controller,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// Controller settings block, when one was configured.
    pub fn controller_settings(&self) -> Option<&ControllerSettings> {
        self.controller.as_ref()
    }

    /// Notification bus.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Device registry.
    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Command dispatcher.
    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    /// Acquisition pipelines.
    pub fn acquisition(&self) -> &AcquisitionManager {
        &self.acquisition
    }

    /// Connects every device. Each device is attempted; the first failure is
    /// returned afterwards.
    pub async fn connect_all(&self) -> StationResult<()> {
        let mut first_error = None;
        for id in self.registry.ids() {
            if let Err(err) = self.registry.connect(&id).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Command for `device_id` carrying the configured default timeout.
    pub fn command(&self, device_id: impl Into<String>, command_type: CommandType) -> Command {
        Command::new(device_id, command_type).with_timeout_ms(self.config.dispatcher.default_timeout_ms)
    }

    /// Submits a command to the dispatcher.
    pub fn submit(&self, command: Command) -> StationResult<CommandHandle> {
        self.dispatcher.submit(command)
    }

    /// Starts polling `device_id` at the configured interval and processing its
    /// samples. Returns a receiver for the processed stream.
    pub fn start_acquisition(
        &self,
        device_id: &str,
    ) -> StationResult<broadcast::Receiver<Arc<ProcessedSample>>> {
        let processing = &self.config.processing;
        let validator = SampleValidator::new(processing.channel_limits.clone())?;
        let processor =
            SampleProcessor::new(validator, processing.window_size, processing.metric_source)?;

        let input = self.acquisition.subscribe(device_id)?;
        self.acquisition
            .start(device_id, self.config.acquisition.poll_interval())?;

        let stage = ProcessingStage::spawn(input, processor, self.config.acquisition.channel_capacity);
        let output = stage.subscribe();
        if let Some(previous) = self.stages.lock().insert(device_id.to_string(), stage) {
            previous.stop();
        }
        info!(device_id, "Acquisition started");
        Ok(output)
    }

    /// Stops polling `device_id`. The processing stage stays available for
    /// metrics until the next start.
    pub fn stop_acquisition(&self, device_id: &str) -> StationResult<()> {
        self.acquisition.stop(device_id)
    }

    /// Receiver for a device's processed samples.
    pub fn subscribe_processed(
        &self,
        device_id: &str,
    ) -> Option<broadcast::Receiver<Arc<ProcessedSample>>> {
        self.stages.lock().get(device_id).map(ProcessingStage::subscribe)
    }

    /// Current window metrics of a device.
    pub fn metrics(&self, device_id: &str) -> Option<AggregatedMetrics> {
        self.stages.lock().get(device_id).and_then(ProcessingStage::metrics)
    }

    /// New session publishing its transitions on the station bus.
    pub fn new_session(&self, name: Option<String>) -> TestSession {
        TestSession::new(name).with_bus(Arc::clone(&self.bus))
    }

    /// Stops acquisition and dispatch, disconnects every device and closes the
    /// bus.
    pub async fn shutdown(&self) {
        self.acquisition.dispose_all();
        let stages: Vec<_> = self.stages.lock().drain().collect();
        for (device_id, stage) in stages {
            stage.stop();
            if let Some(metrics) = stage.metrics() {
                info!(device_id = %device_id, count = metrics.count, mean = metrics.mean, "Final window");
            }
        }
        self.dispatcher.shutdown();
        self.registry.disconnect_all().await;
        if self.bus.is_open() {
            self.bus.shutdown();
        } else {
            warn!("Bus already closed at shutdown");
        }
        info!(station = %self.config.application.name, "Station shut down");
    }
}

//! Per-device acquisition pipelines over the device registry.

use super::pipeline::{AcquisitionEvent, AcquisitionPipeline, PipelineSettings, PipelineStats};
use super::sample::{ChannelSampler, Wiring};
use crate::bus::EventBus;
use crate::device::DeviceRegistry;
use crate::error::{StationError, StationResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

/// Owns one [`AcquisitionPipeline`] per device, created on first use.
pub struct AcquisitionManager {
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    settings: PipelineSettings,
    pipelines: Mutex<HashMap<String, Arc<AcquisitionPipeline>>>,
    wiring: Mutex<HashMap<String, Wiring>>,
}

impl std::fmt::Debug for AcquisitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<String> = self.pipelines.lock().keys().cloned().collect();
        ids.sort();
        f.debug_struct("AcquisitionManager")
            .field("pipelines", &ids)
            .field("settings", &self.settings)
            .finish()
    }
}

impl AcquisitionManager {
    /// Creates a manager with no pipelines.
    pub fn new(registry: Arc<DeviceRegistry>, bus: Arc<EventBus>, settings: PipelineSettings) -> Self {
        Self {
            registry,
            bus,
            settings,
            pipelines: Mutex::new(HashMap::new()),
            wiring: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the catalogue-derived wiring for a device. Applies from the
    /// next `start`.
    pub fn set_wiring(&self, device_id: impl Into<String>, wiring: Wiring) {
        self.wiring.lock().insert(device_id.into(), wiring);
    }

    fn pipeline(&self, device_id: &str) -> StationResult<Arc<AcquisitionPipeline>> {
        if let Some(pipeline) = self.pipelines.lock().get(device_id) {
            return Ok(Arc::clone(pipeline));
        }
        self.registry.get(device_id)?;
        let mut pipelines = self.pipelines.lock();
        let pipeline = pipelines.entry(device_id.to_string()).or_insert_with(|| {
            debug!(device_id, "Creating acquisition pipeline");
            Arc::new(AcquisitionPipeline::new(
                device_id,
                self.settings.clone(),
                Some(Arc::clone(&self.bus)),
            ))
        });
        Ok(Arc::clone(pipeline))
    }

    /// Starts polling a device every `interval`. An unknown device id is a
    /// hard failure.
    pub fn start(&self, device_id: &str, interval: Duration) -> StationResult<()> {
        let entry = self.registry.get(device_id)?;
        if entry.is_retired() {
            return Err(StationError::UnknownDevice(device_id.to_string()));
        }
        let wiring = self
            .wiring
            .lock()
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| Wiring::from_catalogue(entry.channels()));
        let source = ChannelSampler::new(entry, wiring);
        self.pipeline(device_id)?.start(Arc::new(source), interval)
    }

    /// Stops polling a device. Stopping an idle pipeline is a no-op.
    pub fn stop(&self, device_id: &str) -> StationResult<()> {
        let pipeline = self.pipelines.lock().get(device_id).cloned();
        match pipeline {
            Some(pipeline) => {
                pipeline.stop();
                Ok(())
            }
            None => self.registry.get(device_id).map(|_| ()),
        }
    }

    /// Receiver for a device's acquisition events.
    pub fn subscribe(&self, device_id: &str) -> StationResult<broadcast::Receiver<AcquisitionEvent>> {
        Ok(self.pipeline(device_id)?.subscribe())
    }

    /// True while the device's pipeline is polling.
    pub fn is_collecting(&self, device_id: &str) -> bool {
        self.pipelines
            .lock()
            .get(device_id)
            .is_some_and(|pipeline| pipeline.is_collecting())
    }

    /// Counters of a device's pipeline.
    pub fn stats(&self, device_id: &str) -> Option<PipelineStats> {
        self.pipelines.lock().get(device_id).map(|p| p.stats())
    }

    /// Stops every pipeline.
    pub fn stop_all(&self) {
        let pipelines: Vec<_> = self.pipelines.lock().values().cloned().collect();
        for pipeline in pipelines {
            pipeline.stop();
        }
    }

    /// Stops and disposes every pipeline.
    pub fn dispose_all(&self) {
        let pipelines: Vec<_> = self.pipelines.lock().drain().map(|(_, p)| p).collect();
        for pipeline in pipelines {
            pipeline.dispose();
        }
    }
}

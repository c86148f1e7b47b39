//! Device registry.
//!
//! Read-mostly map from device id to its capability, descriptor and operation lock.
//! Every physical operation on a device (connect, disconnect, command execution,
//! poll reads, removal) holds the entry's operation lock while it runs. Commands
//! and poll reads give the lock up when their timeout elapses; a capability call
//! abandoned that way may still be running on the device when the next
//! operation starts.

use super::{ConnectionStatus, Device, DeviceCapability, SignalChannel};
use crate::bus::{EventBus, StationEvent};
use crate::error::{StationError, StationResult};
use crate::error_recovery::{retry_async, RetryPolicy};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// One registered device.
pub struct DeviceEntry {
    capability: Arc<dyn DeviceCapability>,
    descriptor: RwLock<Device>,
    channels: Vec<SignalChannel>,
    op_lock: Mutex<()>,
    retired: watch::Sender<bool>,
}

impl std::fmt::Debug for DeviceEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceEntry")
            .field("device", &*self.descriptor.read())
            .field("channels", &self.channels.len())
            .field("retired", &self.is_retired())
            .finish()
    }
}

impl DeviceEntry {
    fn new(device: Device, capability: Arc<dyn DeviceCapability>) -> Self {
        let channels = capability
            .supported_signals()
            .iter()
            .map(|channel| channel.attach(&capability))
            .collect();
        Self {
            capability,
            descriptor: RwLock::new(device),
            channels,
            op_lock: Mutex::new(()),
            retired: watch::Sender::new(false),
        }
    }

    /// Device identifier.
    pub fn id(&self) -> String {
        self.descriptor.read().id.clone()
    }

    /// The capability implementation.
    pub fn capability(&self) -> Arc<dyn DeviceCapability> {
        Arc::clone(&self.capability)
    }

    /// Snapshot of the descriptor.
    pub fn descriptor(&self) -> Device {
        self.descriptor.read().clone()
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionStatus {
        self.descriptor.read().status
    }

    /// Signal catalogue with every channel attached to this device.
    pub fn channels(&self) -> &[SignalChannel] {
        &self.channels
    }

    /// True once the entry was removed from the registry.
    pub fn is_retired(&self) -> bool {
        *self.retired.borrow()
    }

    /// Resolves once the entry is removed from the registry.
    pub async fn retired(&self) {
        let mut receiver = self.retired.subscribe();
        let _ = receiver.wait_for(|retired| *retired).await;
    }

    /// Waits for exclusive access to the physical device.
    pub async fn lock_operation(&self) -> MutexGuard<'_, ()> {
        self.op_lock.lock().await
    }

    fn swap_status(&self, new: ConnectionStatus) -> ConnectionStatus {
        let mut descriptor = self.descriptor.write();
        std::mem::replace(&mut descriptor.status, new)
    }
}

/// Registry of devices known to the station.
pub struct DeviceRegistry {
    entries: RwLock<HashMap<String, Arc<DeviceEntry>>>,
    bus: Arc<EventBus>,
    retry: RetryPolicy,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.ids())
            .field("retry", &self.retry)
            .finish()
    }
}

impl DeviceRegistry {
    /// Creates an empty registry publishing status changes on `bus`.
    pub fn new(bus: Arc<EventBus>, retry: RetryPolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            bus,
            retry,
        }
    }

    /// Registers a device. The capability must serve `device.id`.
    pub fn insert(
        &self,
        device: Device,
        capability: Arc<dyn DeviceCapability>,
    ) -> StationResult<Arc<DeviceEntry>> {
        if capability.device_id() != device.id {
            return Err(StationError::Configuration(format!(
                "capability serves '{}' but was registered as '{}'",
                capability.device_id(),
                device.id
            )));
        }
        let mut entries = self.entries.write();
        if entries.contains_key(&device.id) {
            return Err(StationError::Configuration(format!(
                "device '{}' is already registered",
                device.id
            )));
        }
        let id = device.id.clone();
        let entry = Arc::new(DeviceEntry::new(device, capability));
        entries.insert(id.clone(), Arc::clone(&entry));
        debug!(device_id = %id, "Device registered");
        Ok(entry)
    }

    /// Looks up a device.
    pub fn get(&self, device_id: &str) -> StationResult<Arc<DeviceEntry>> {
        self.entries
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| StationError::UnknownDevice(device_id.to_string()))
    }

    /// True if `device_id` is registered.
    pub fn contains(&self, device_id: &str) -> bool {
        self.entries.read().contains_key(device_id)
    }

    /// Registered device ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Connection status of a device.
    pub fn status(&self, device_id: &str) -> StationResult<ConnectionStatus> {
        Ok(self.get(device_id)?.status())
    }

    /// Connects a device, retrying per the registry's policy.
    pub async fn connect(&self, device_id: &str) -> StationResult<()> {
        let entry = self.get(device_id)?;
        let _guard = entry.lock_operation().await;
        if entry.is_retired() {
            return Err(StationError::UnknownDevice(device_id.to_string()));
        }
        if entry.status().accepts_commands() {
            return Ok(());
        }

        let capability = entry.capability();
        let result = retry_async(&self.retry, "connect", || capability.connect()).await;
        match result {
            Ok(()) => {
                self.update_status(&entry, ConnectionStatus::Connected);
                info!(device_id, "Device connected");
                Ok(())
            }
            Err(err) => {
                self.update_status(&entry, ConnectionStatus::Error);
                warn!(device_id, error = %err, "Device connection failed");
                Err(StationError::ExecutionFault(format!(
                    "connect '{device_id}': {err:#}"
                )))
            }
        }
    }

    /// Disconnects a device. Waits for any in-flight operation first.
    pub async fn disconnect(&self, device_id: &str) -> StationResult<()> {
        let entry = self.get(device_id)?;
        let _guard = entry.lock_operation().await;
        self.disconnect_locked(&entry).await
    }

    async fn disconnect_locked(&self, entry: &DeviceEntry) -> StationResult<()> {
        if entry.status() == ConnectionStatus::Disconnected {
            return Ok(());
        }
        let result = entry.capability.disconnect().await;
        self.update_status(entry, ConnectionStatus::Disconnected);
        result.map_err(|err| {
            StationError::ExecutionFault(format!("disconnect '{}': {err:#}", entry.id()))
        })
    }

    /// Removes a device. The entry is retired immediately so new submissions and
    /// pipeline polls stop; the call then waits for the in-flight operation and
    /// disconnects the device.
    pub async fn remove(&self, device_id: &str) -> StationResult<()> {
        let entry = self
            .entries
            .write()
            .remove(device_id)
            .ok_or_else(|| StationError::UnknownDevice(device_id.to_string()))?;
        entry.retired.send_replace(true);

        let _guard = entry.lock_operation().await;
        if let Err(err) = self.disconnect_locked(&entry).await {
            warn!(device_id, error = %err, "Disconnect during removal failed");
        }
        info!(device_id, "Device removed");
        Ok(())
    }

    /// Disconnects every device. Errors are logged and skipped.
    pub async fn disconnect_all(&self) {
        for id in self.ids() {
            if let Err(err) = self.disconnect(&id).await {
                warn!(device_id = %id, error = %err, "Disconnect failed");
            }
        }
    }

    /// Sets a device's status and publishes the change on the bus.
    pub fn update_status(&self, entry: &DeviceEntry, new: ConnectionStatus) {
        let old = entry.swap_status(new);
        if old == new {
            return;
        }
        let device_id = entry.id();
        debug!(device_id = %device_id, %old, %new, "Device status changed");
        self.bus.publish(StationEvent::DeviceStatusChanged {
            device_id,
            old,
            new,
            timestamp: Utc::now(),
        });
    }

    /// The bus this registry publishes on.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceKind, SignalConfig, SimulatedDevice, ValueRange};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn registry() -> (Arc<EventBus>, DeviceRegistry) {
        let bus = Arc::new(EventBus::new(64));
        let retry = RetryPolicy {
            max_attempts: 2,
            backoff_delay: Duration::from_millis(1),
        };
        (Arc::clone(&bus), DeviceRegistry::new(bus, retry))
    }

    fn simulated(id: &str) -> Arc<SimulatedDevice> {
        let signals = vec![SignalConfig::input("force", "AI0", ValueRange::new(-10.0, 10.0))];
        Arc::new(SimulatedDevice::new(id, &signals).unwrap())
    }

    #[tokio::test]
    async fn test_unknown_device_is_hard_failure() {
        let (_, registry) = registry();
        assert!(matches!(
            registry.get("missing"),
            Err(StationError::UnknownDevice(_))
        ));
        assert!(registry.connect("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_publishes_status_change() {
        let (bus, registry) = registry();
        let mut events = bus.subscribe().unwrap();
        registry
            .insert(Device::new("lc1", "Load cell", DeviceKind::Sensor), simulated("lc1"))
            .unwrap();

        registry.connect("lc1").await.unwrap();
        assert_eq!(registry.status("lc1").unwrap(), ConnectionStatus::Connected);
        match events.recv().await {
            Some(StationEvent::DeviceStatusChanged { device_id, old, new, .. }) => {
                assert_eq!(device_id, "lc1");
                assert_eq!(old, ConnectionStatus::Disconnected);
                assert_eq!(new, ConnectionStatus::Connected);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_failure_sets_error_status() {
        let (_, registry) = registry();
        let device = simulated("lc1");
        device.fail_connects(5);
        registry
            .insert(Device::new("lc1", "Load cell", DeviceKind::Sensor), device.clone())
            .unwrap();

        assert!(registry.connect("lc1").await.is_err());
        assert_eq!(registry.status("lc1").unwrap(), ConnectionStatus::Error);
        assert_eq!(device.connect_attempts(), 2);
        assert!(logs_contain("Device connection failed"));
    }

    #[tokio::test]
    async fn test_connect_retries_transient_failure() {
        let (_, registry) = registry();
        let device = simulated("lc1");
        device.fail_connects(1);
        registry
            .insert(Device::new("lc1", "Load cell", DeviceKind::Sensor), device)
            .unwrap();
        registry.connect("lc1").await.unwrap();
        assert_eq!(registry.status("lc1").unwrap(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_channels_are_attached() {
        let (_, registry) = registry();
        let entry = registry
            .insert(Device::new("lc1", "Load cell", DeviceKind::Sensor), simulated("lc1"))
            .unwrap();
        let device = entry.channels()[0].connected_device().unwrap();
        assert_eq!(device.device_id(), "lc1");
    }

    #[tokio::test]
    async fn test_duplicate_and_mismatched_ids_rejected() {
        let (_, registry) = registry();
        registry
            .insert(Device::new("lc1", "Load cell", DeviceKind::Sensor), simulated("lc1"))
            .unwrap();
        assert!(registry
            .insert(Device::new("lc1", "Again", DeviceKind::Sensor), simulated("lc1"))
            .is_err());
        assert!(registry
            .insert(Device::new("lc2", "Wrong", DeviceKind::Sensor), simulated("lc3"))
            .is_err());
    }

    #[tokio::test]
    async fn test_remove_retires_and_disconnects() {
        let (_, registry) = registry();
        let entry = registry
            .insert(Device::new("lc1", "Load cell", DeviceKind::Sensor), simulated("lc1"))
            .unwrap();
        registry.connect("lc1").await.unwrap();

        registry.remove("lc1").await.unwrap();
        assert!(entry.is_retired());
        assert_eq!(entry.status(), ConnectionStatus::Disconnected);
        assert!(!registry.contains("lc1"));
        assert!(registry.remove("lc1").await.is_err());
    }

    #[tokio::test]
    async fn test_retired_wakes_waiters() {
        let (_, registry) = registry();
        let entry = registry
            .insert(Device::new("lc1", "Load cell", DeviceKind::Sensor), simulated("lc1"))
            .unwrap();
        let waiter = {
            let entry = Arc::clone(&entry);
            tokio::spawn(async move { entry.retired().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        registry.remove("lc1").await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        // Already retired: resolves immediately.
        entry.retired().await;
    }
}

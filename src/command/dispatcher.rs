//! Command dispatcher.
//!
//! One worker task per device drains a bounded FIFO queue, so commands for the
//! same device run strictly in submission order while different devices run
//! concurrently. A submission for a device whose queue is full is rejected with
//! [`StationError::DeviceBusy`] before any record exists.
//!
//! A command's timeout covers both the wait for the device's operation lock and
//! the capability call. The call itself runs on a detached task; if the budget
//! elapses first, the record goes to `Error` and whatever the call returns later
//! is discarded. The physical operation is not cancelled.
//!
//! A worker exits when its device is removed from the registry. Commands still
//! queued for it fail.

use super::record::{CommandRecord, CommandStatus, TrackedCommand};
use super::table::DispatchTable;
use super::{Command, Response};
use crate::bus::{EventBus, StationEvent};
use crate::core::ParameterValue;
use crate::device::{ConnectionStatus, DeviceEntry, DeviceRegistry};
use crate::error::{StationError, StationResult};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Dispatcher tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Commands that may wait per device behind the one executing.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Finished records kept for inspection.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_queue_capacity() -> usize {
    64
}

fn default_history_capacity() -> usize {
    256
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            history_capacity: default_history_capacity(),
        }
    }
}

struct Job {
    tracked: Arc<TrackedCommand>,
    respond: oneshot::Sender<Response>,
}

struct WorkerSlot {
    entry: Arc<DeviceEntry>,
    sender: mpsc::Sender<Job>,
}

/// State shared between the dispatcher and its workers.
struct Shared {
    workers: Mutex<HashMap<String, WorkerSlot>>,
    active: RwLock<HashMap<Uuid, Arc<TrackedCommand>>>,
    history: Mutex<VecDeque<CommandRecord>>,
    history_capacity: usize,
    closed: AtomicBool,
}

impl Shared {
    fn archive(&self, record: CommandRecord) {
        self.active.write().remove(&record.command.id());
        let mut history = self.history.lock();
        if self.history_capacity == 0 {
            return;
        }
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    fn release_worker(&self, device_id: &str, entry: &Arc<DeviceEntry>) {
        let mut workers = self.workers.lock();
        if workers
            .get(device_id)
            .is_some_and(|slot| Arc::ptr_eq(&slot.entry, entry))
        {
            workers.remove(device_id);
        }
    }
}

/// Routes commands to per-device workers and tracks them to completion.
pub struct CommandDispatcher {
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    table: DispatchTable,
    settings: DispatcherSettings,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("settings", &self.settings)
            .field("workers", &self.worker_count())
            .field("active", &self.shared.active.read().len())
            .finish()
    }
}

impl CommandDispatcher {
    /// Creates a dispatcher. Fails if `table` does not cover every command type.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        bus: Arc<EventBus>,
        table: DispatchTable,
        settings: DispatcherSettings,
    ) -> StationResult<Self> {
        table.validate()?;
        if settings.queue_capacity == 0 {
            return Err(StationError::Configuration(
                "dispatcher queue_capacity must be > 0".into(),
            ));
        }
        let shared = Arc::new(Shared {
            workers: Mutex::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            history: Mutex::new(VecDeque::with_capacity(settings.history_capacity)),
            history_capacity: settings.history_capacity,
            closed: AtomicBool::new(false),
        });
        Ok(Self {
            registry,
            bus,
            table,
            settings,
            shared,
        })
    }

    /// Submits a command.
    ///
    /// Fails with `UnknownDevice` when no device is registered under the command's
    /// device id, `DeviceNotConnected` when the device is not connected, and
    /// `DeviceBusy` when its queue is full. No record is created on failure.
    pub fn submit(&self, command: Command) -> StationResult<CommandHandle> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(StationError::Shutdown("command dispatcher is shut down".into()));
        }
        let device_id = command.device_id().to_string();
        let entry = self.registry.get(&device_id)?;
        if entry.is_retired() {
            return Err(StationError::UnknownDevice(device_id));
        }
        if !entry.status().accepts_commands() {
            return Err(StationError::DeviceNotConnected(device_id));
        }

        let sender = self.worker_for(&entry)?;
        let tracked = Arc::new(TrackedCommand::new(command));
        let command_id = tracked.command().id();
        let (respond, response) = oneshot::channel();

        self.shared
            .active
            .write()
            .insert(command_id, Arc::clone(&tracked));
        let job = Job {
            tracked: Arc::clone(&tracked),
            respond,
        };
        match sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.shared.active.write().remove(&command_id);
                debug!(device_id = %device_id, "Command queue full, rejecting");
                return Err(StationError::DeviceBusy(device_id));
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.active.write().remove(&command_id);
                return Err(StationError::Shutdown(format!(
                    "worker for '{device_id}' has stopped"
                )));
            }
        }

        debug!(command_id = %command_id, device_id = %device_id, "Command queued");
        Ok(CommandHandle { tracked, response })
    }

    fn worker_for(&self, entry: &Arc<DeviceEntry>) -> StationResult<mpsc::Sender<Job>> {
        let device_id = entry.id();
        let mut workers = self.shared.workers.lock();
        if let Some(slot) = workers.get(&device_id) {
            if Arc::ptr_eq(&slot.entry, entry) && !slot.sender.is_closed() {
                return Ok(slot.sender.clone());
            }
        }

        let runtime = Handle::try_current().map_err(|_| {
            StationError::Configuration("command dispatch requires a Tokio runtime".into())
        })?;
        let (sender, receiver) = mpsc::channel(self.settings.queue_capacity);
        let worker = DeviceWorker {
            device_id: device_id.clone(),
            entry: Arc::clone(entry),
            registry: Arc::clone(&self.registry),
            bus: Arc::clone(&self.bus),
            table: self.table.clone(),
            shared: Arc::clone(&self.shared),
        };
        runtime.spawn(worker.run(receiver));
        workers.insert(
            device_id.clone(),
            WorkerSlot {
                entry: Arc::clone(entry),
                sender: sender.clone(),
            },
        );
        debug!(device_id = %device_id, "Command worker started");
        Ok(sender)
    }

    /// Devices with a live command worker.
    pub fn worker_count(&self) -> usize {
        self.shared.workers.lock().len()
    }

    /// Records accepted but not yet archived.
    pub fn active(&self) -> Vec<CommandRecord> {
        self.shared
            .active
            .read()
            .values()
            .map(|tracked| tracked.snapshot())
            .collect()
    }

    /// Finished records, oldest first.
    pub fn history(&self) -> Vec<CommandRecord> {
        self.shared.history.lock().iter().cloned().collect()
    }

    /// Stops accepting commands. Queued commands fail; the one executing on each
    /// device runs to completion.
    pub fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.workers.lock().clear();
        info!("Command dispatcher shut down");
    }
}

impl Drop for CommandDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct DeviceWorker {
    device_id: String,
    entry: Arc<DeviceEntry>,
    registry: Arc<DeviceRegistry>,
    bus: Arc<EventBus>,
    table: DispatchTable,
    shared: Arc<Shared>,
}

impl DeviceWorker {
    async fn run(self, mut receiver: mpsc::Receiver<Job>) {
        loop {
            tokio::select! {
                biased;
                _ = self.entry.retired() => break,
                job = receiver.recv() => match job {
                    Some(job) => self.process(job).await,
                    None => break,
                },
            }
        }

        receiver.close();
        while let Ok(job) = receiver.try_recv() {
            self.process(job).await;
        }
        self.shared.release_worker(&self.device_id, &self.entry);
        debug!(device_id = %self.device_id, "Command worker stopped");
    }

    async fn process(&self, job: Job) {
        let Job { tracked, respond } = job;
        let command = Arc::new(tracked.command());

        let outcome = if self.shared.closed.load(Ordering::Acquire) {
            Err("command dispatcher shut down before execution".to_string())
        } else {
            self.execute(&tracked, &command).await
        };

        let (success, result) = match outcome {
            Ok(value) => (tracked.complete(), value),
            Err(message) => {
                tracked.fail(message);
                (false, ParameterValue::Null)
            }
        };
        let record = tracked.snapshot();
        match record.status {
            CommandStatus::Completed => info!(
                command_id = %command.id(),
                device_id = %self.device_id,
                command_type = %command.command_type(),
                duration_ms = record.execution_duration_ms(),
                "Command completed"
            ),
            _ => warn!(
                command_id = %command.id(),
                device_id = %self.device_id,
                command_type = %command.command_type(),
                error = record.error_message.as_deref().unwrap_or_default(),
                "Command failed"
            ),
        }

        self.bus
            .publish(StationEvent::CommandStatusChanged(record.clone()));
        let response = Response {
            command_id: command.id(),
            device_id: self.device_id.clone(),
            success,
            result,
            error_message: record.error_message.clone(),
            execution_duration_ms: record.execution_duration_ms(),
            timestamp: Utc::now(),
        };
        self.shared.archive(record);
        let _ = respond.send(response);
    }

    async fn execute(
        &self,
        tracked: &TrackedCommand,
        command: &Arc<Command>,
    ) -> Result<ParameterValue, String> {
        let entry = &self.entry;
        let timed_out = || {
            StationError::Timeout {
                operation: command.command_type().to_string(),
                timeout_ms: command.timeout_ms(),
            }
            .to_string()
        };
        let deadline = Instant::now() + Duration::from_millis(command.timeout_ms());
        if entry.is_retired() {
            return Err(format!("device '{}' was removed", self.device_id));
        }
        let _operation = tokio::time::timeout_at(deadline, entry.lock_operation())
            .await
            .map_err(|_| timed_out())?;
        if entry.is_retired() {
            return Err(format!("device '{}' was removed", self.device_id));
        }
        if !entry.status().accepts_commands() {
            return Err(StationError::DeviceNotConnected(self.device_id.clone()).to_string());
        }
        let handler = self
            .table
            .handler(command.command_type())
            .ok_or_else(|| format!("no handler for {}", command.command_type()))?;

        tracked.begin();
        self.registry.update_status(entry, ConnectionStatus::Busy);

        let call = tokio::spawn(handler(entry.capability(), Arc::clone(command)));
        let result = match tokio::time::timeout_at(deadline, call).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(StationError::ExecutionFault(format!("{err:#}")).to_string()),
            Ok(Err(join)) => Err(StationError::ExecutionFault(format!(
                "capability call aborted: {join}"
            ))
            .to_string()),
            Err(_) => Err(timed_out()),
        };

        if entry.status() == ConnectionStatus::Busy {
            self.registry
                .update_status(entry, ConnectionStatus::Connected);
        }
        result
    }
}

/// Caller's view of a submitted command.
#[derive(Debug)]
pub struct CommandHandle {
    tracked: Arc<TrackedCommand>,
    response: oneshot::Receiver<Response>,
}

impl CommandHandle {
    /// Command id.
    pub fn id(&self) -> Uuid {
        self.record().command.id()
    }

    /// Current record snapshot.
    pub fn record(&self) -> CommandRecord {
        self.tracked.snapshot()
    }

    /// Current status.
    pub fn status(&self) -> CommandStatus {
        self.tracked.status()
    }

    /// Waits for the command's single response.
    pub async fn wait(self) -> StationResult<Response> {
        self.response
            .await
            .map_err(|_| StationError::Shutdown("command worker stopped before responding".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceKind, SignalConfig, SimulatedDevice, ValueRange};
    use crate::error_recovery::RetryPolicy;

    async fn setup(settings: DispatcherSettings) -> (Arc<SimulatedDevice>, CommandDispatcher) {
        let bus = Arc::new(EventBus::new(256));
        let registry = Arc::new(DeviceRegistry::new(Arc::clone(&bus), RetryPolicy::none()));
        let signals = vec![SignalConfig::input("force", "AI0", ValueRange::new(-10.0, 10.0))];
        let device = Arc::new(SimulatedDevice::new("lc1", &signals).unwrap());
        registry
            .insert(Device::new("lc1", "Load cell", DeviceKind::Sensor), device.clone())
            .unwrap();
        registry.connect("lc1").await.unwrap();
        let dispatcher =
            CommandDispatcher::new(registry, bus, DispatchTable::standard(), settings).unwrap();
        (device, dispatcher)
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let (_, dispatcher) = setup(DispatcherSettings::default()).await;
        let err = dispatcher
            .submit(Command::test_connection("missing"))
            .unwrap_err();
        assert!(matches!(err, StationError::UnknownDevice(_)));
        assert!(dispatcher.active().is_empty());
    }

    #[tokio::test]
    async fn test_completed_command_response() {
        let (_, dispatcher) = setup(DispatcherSettings::default()).await;
        let handle = dispatcher
            .submit(Command::read_signal("lc1", "force"))
            .unwrap();
        let id = handle.id();
        let response = handle.wait().await.unwrap();
        assert!(response.success);
        assert_eq!(response.command_id, id);
        assert!(response.result.as_f64().is_some());
        assert!(response.execution_duration_ms.is_some());

        let history = dispatcher.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, CommandStatus::Completed);
        assert!(dispatcher.active().is_empty());
    }

    #[tokio::test]
    async fn test_capability_fault_recorded_as_error() {
        let (device, dispatcher) = setup(DispatcherSettings::default()).await;
        device.set_fail_io(true);
        let response = dispatcher
            .submit(Command::read_signal("lc1", "force"))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(!response.success);
        assert!(response
            .error_message
            .unwrap()
            .contains("simulated I/O failure"));
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let settings = DispatcherSettings {
            history_capacity: 2,
            ..DispatcherSettings::default()
        };
        let (_, dispatcher) = setup(settings).await;
        for _ in 0..5 {
            dispatcher
                .submit(Command::test_connection("lc1"))
                .unwrap()
                .wait()
                .await
                .unwrap();
        }
        assert_eq!(dispatcher.history().len(), 2);
    }

    #[tokio::test]
    async fn test_removed_device_releases_worker() {
        let (device, dispatcher) = setup(DispatcherSettings::default()).await;
        device.set_latency(Duration::from_millis(30));
        let running = dispatcher
            .submit(Command::test_connection("lc1"))
            .unwrap();
        let queued = dispatcher
            .submit(Command::test_connection("lc1"))
            .unwrap();
        assert_eq!(dispatcher.worker_count(), 1);
        while running.status() != CommandStatus::Executing {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        dispatcher.registry.remove("lc1").await.unwrap();
        assert!(running.wait().await.unwrap().success);
        let response = queued.wait().await.unwrap();
        assert!(!response.success);
        assert!(response.error_message.unwrap().contains("was removed"));

        tokio::time::timeout(Duration::from_secs(1), async {
            while dispatcher.worker_count() > 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_commands() {
        let (_, dispatcher) = setup(DispatcherSettings::default()).await;
        dispatcher.shutdown();
        assert!(matches!(
            dispatcher.submit(Command::test_connection("lc1")),
            Err(StationError::Shutdown(_))
        ));
    }
}

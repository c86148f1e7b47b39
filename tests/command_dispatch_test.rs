//! Command dispatch against simulated devices: per-device FIFO, queue
//! saturation, timeouts and serialised device access.

use std::sync::Arc;
use std::time::Duration;
use test_station::acquisition::{AcquisitionManager, PipelineSettings};
use test_station::bus::{EventBus, StationEvent};
use test_station::command::{
    Command, CommandDispatcher, CommandStatus, DispatchTable, DispatcherSettings,
};
use test_station::device::{
    Device, DeviceKind, DeviceRegistry, SignalConfig, SignalDirection, SimulatedDevice, ValueRange,
};
use test_station::error_recovery::RetryPolicy;
use test_station::StationError;

struct Bench {
    bus: Arc<EventBus>,
    registry: Arc<DeviceRegistry>,
    device: Arc<SimulatedDevice>,
    dispatcher: Arc<CommandDispatcher>,
}

async fn bench(settings: DispatcherSettings) -> Bench {
    let bus = Arc::new(EventBus::new(1024));
    let registry = Arc::new(DeviceRegistry::new(Arc::clone(&bus), RetryPolicy::none()));
    let signals = vec![
        SignalConfig::input("force", "AI0", ValueRange::new(-100.0, 100.0)),
        SignalConfig::input("valve", "AO0", ValueRange::new(0.0, 10.0))
            .with_direction(SignalDirection::Output),
    ];
    let device = Arc::new(SimulatedDevice::new("frame", &signals).unwrap());
    registry
        .insert(
            Device::new("frame", "Load frame", DeviceKind::Controller),
            device.clone(),
        )
        .unwrap();
    registry.connect("frame").await.unwrap();
    let dispatcher = Arc::new(
        CommandDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&bus),
            DispatchTable::standard(),
            settings,
        )
        .unwrap(),
    );
    Bench {
        bus,
        registry,
        device,
        dispatcher,
    }
}

async fn wait_for_status(dispatcher: &CommandDispatcher, status: CommandStatus) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !dispatcher.active().iter().any(|r| r.status == status) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn commands_for_one_device_run_in_submission_order() {
    let bench = bench(DispatcherSettings::default()).await;
    bench.device.set_latency(Duration::from_millis(3));

    let mut handles = Vec::new();
    for step in 0..6 {
        let command = Command::write_signal("frame", "valve", step as f64);
        handles.push(bench.dispatcher.submit(command).unwrap());
    }
    let submitted: Vec<_> = handles.iter().map(|h| h.id()).collect();
    for handle in handles {
        assert!(handle.wait().await.unwrap().success);
    }

    let history = bench.dispatcher.history();
    let completed: Vec<_> = history.iter().map(|r| r.command.id()).collect();
    assert_eq!(completed, submitted);
    for pair in history.windows(2) {
        assert!(pair[0].completed_at <= pair[1].started_at);
    }
}

#[tokio::test]
async fn saturated_queue_rejects_with_device_busy() {
    let settings = DispatcherSettings {
        queue_capacity: 1,
        ..DispatcherSettings::default()
    };
    let bench = bench(settings).await;
    bench.device.set_hang(true);

    let first = bench
        .dispatcher
        .submit(Command::test_connection("frame").with_timeout_ms(200))
        .unwrap();
    wait_for_status(&bench.dispatcher, CommandStatus::Executing).await;

    let queued = bench
        .dispatcher
        .submit(Command::test_connection("frame").with_timeout_ms(200))
        .unwrap();
    assert_eq!(queued.status(), CommandStatus::NoExecute);

    let rejected = bench
        .dispatcher
        .submit(Command::test_connection("frame").with_timeout_ms(200));
    assert!(matches!(rejected, Err(StationError::DeviceBusy(_))));
    assert_eq!(bench.dispatcher.active().len(), 2);

    bench.device.set_hang(false);
    first.wait().await.unwrap();
    queued.wait().await.unwrap();
}

#[tokio::test]
async fn hung_device_times_out_with_error_record() {
    let bench = bench(DispatcherSettings::default()).await;
    bench.device.set_hang(true);

    let handle = bench
        .dispatcher
        .submit(Command::read_signal("frame", "force").with_timeout_ms(50))
        .unwrap();
    let response = handle.wait().await.unwrap();
    assert!(!response.success);
    let message = response.error_message.unwrap();
    assert!(message.contains("Timed out after 50 ms"), "{message}");

    let record = &bench.dispatcher.history()[0];
    assert_eq!(record.status, CommandStatus::Error);
    assert!(record.completed_at >= record.started_at);

    // The device is usable again once it stops hanging.
    bench.device.set_hang(false);
    let response = bench
        .dispatcher
        .submit(Command::read_signal("frame", "force"))
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert!(response.success);
}

#[tokio::test]
async fn disconnected_device_is_rejected_without_record() {
    let bench = bench(DispatcherSettings::default()).await;
    bench.registry.disconnect("frame").await.unwrap();
    let err = bench
        .dispatcher
        .submit(Command::test_connection("frame"))
        .unwrap_err();
    assert!(matches!(err, StationError::DeviceNotConnected(_)));
    assert!(bench.dispatcher.active().is_empty());
    assert!(bench.dispatcher.history().is_empty());
}

#[tokio::test]
async fn completion_is_published_on_the_bus() {
    let bench = bench(DispatcherSettings::default()).await;
    let mut events = bench.bus.subscribe().unwrap();
    let id = bench
        .dispatcher
        .submit(Command::zero_channel("frame", "force"))
        .unwrap()
        .id();

    let record = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(StationEvent::CommandStatusChanged(record)) = events.recv().await {
                if record.command.id() == id && record.status.is_terminal() {
                    return record;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(record.status, CommandStatus::Completed);
    assert!(record.execution_duration_ms().is_some());
}

#[tokio::test]
async fn commands_and_acquisition_never_overlap_on_a_device() {
    let bench = bench(DispatcherSettings::default()).await;
    bench.device.set_latency(Duration::from_millis(1));

    let manager = AcquisitionManager::new(
        Arc::clone(&bench.registry),
        Arc::clone(&bench.bus),
        Default::default(),
    );
    manager.start("frame", Duration::from_millis(1)).unwrap();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let dispatcher = Arc::clone(&bench.dispatcher);
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let handle = loop {
                    match dispatcher.submit(Command::read_signal("frame", "force")) {
                        Ok(handle) => break handle,
                        Err(StationError::DeviceBusy(_)) => {
                            tokio::time::sleep(Duration::from_millis(1)).await
                        }
                        Err(err) => panic!("unexpected submit error: {err}"),
                    }
                };
                handle.wait().await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    manager.stop("frame").unwrap();

    assert!(bench.device.call_count() > 20);
    assert_eq!(bench.device.max_concurrent_calls(), 1);
}

#[tokio::test]
async fn hung_poll_read_cannot_starve_a_command() {
    let bench = bench(DispatcherSettings::default()).await;
    let manager = AcquisitionManager::new(
        Arc::clone(&bench.registry),
        Arc::clone(&bench.bus),
        PipelineSettings {
            read_timeout_ms: 1_000,
            ..PipelineSettings::default()
        },
    );
    bench.device.set_hang(true);
    manager.start("frame", Duration::from_millis(5)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    manager.stop("frame").unwrap();

    let handle = bench
        .dispatcher
        .submit(Command::test_connection("frame").with_timeout_ms(100))
        .unwrap();
    let response = tokio::time::timeout(Duration::from_millis(500), handle.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(!response.success);
    let message = response.error_message.unwrap();
    assert!(message.contains("Timed out after 100 ms"), "{message}");
    assert_eq!(bench.dispatcher.history()[0].status, CommandStatus::Error);

    // Stalled reads finish once the device recovers and release it.
    bench.device.set_hang(false);
    let response = tokio::time::timeout(
        Duration::from_secs(3),
        bench
            .dispatcher
            .submit(Command::test_connection("frame").with_timeout_ms(2_000))
            .unwrap()
            .wait(),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(response.success, "{:?}", response.error_message);
}

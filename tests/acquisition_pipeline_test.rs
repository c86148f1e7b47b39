//! Acquisition through the device registry into the processing stage.

use std::sync::Arc;
use std::time::Duration;
use test_station::acquisition::{AcquisitionEvent, AcquisitionManager, PipelineSettings};
use test_station::bus::{EventBus, StationEvent};
use test_station::device::{
    simulated::Waveform, Device, DeviceKind, DeviceRegistry, SignalConfig, SimulatedDevice,
    ValueRange,
};
use test_station::error_recovery::RetryPolicy;
use test_station::processing::{
    ChannelLimits, MetricSource, ProcessedSample, ProcessingStage, Quality, SampleProcessor,
    SampleValidator, ValidationIssue,
};
use test_station::StationError;
use tokio::sync::broadcast;

struct Rig {
    bus: Arc<EventBus>,
    registry: Arc<DeviceRegistry>,
    device: Arc<SimulatedDevice>,
    manager: AcquisitionManager,
}

async fn rig() -> Rig {
    rig_with(PipelineSettings::default()).await
}

async fn rig_with(settings: PipelineSettings) -> Rig {
    let bus = Arc::new(EventBus::new(1024));
    let registry = Arc::new(DeviceRegistry::new(Arc::clone(&bus), RetryPolicy::none()));
    let signals = vec![
        SignalConfig::input("force", "AI0", ValueRange::new(0.0, 100.0)),
        SignalConfig::input("position", "AI1", ValueRange::new(0.0, 50.0)),
        SignalConfig::input("temperature", "AI2", ValueRange::new(0.0, 1000.0)),
    ];
    let device = Arc::new(SimulatedDevice::new("press", &signals).unwrap());
    device.set_waveform("force", Waveform::constant(40.0)).unwrap();
    device.set_waveform("temperature", Waveform::constant(25.0)).unwrap();
    registry
        .insert(
            Device::new("press", "Press", DeviceKind::Controller),
            device.clone(),
        )
        .unwrap();
    registry.connect("press").await.unwrap();
    let manager = AcquisitionManager::new(
        Arc::clone(&registry),
        Arc::clone(&bus),
        settings,
    );
    Rig {
        bus,
        registry,
        device,
        manager,
    }
}

async fn next(rx: &mut broadcast::Receiver<Arc<ProcessedSample>>) -> Arc<ProcessedSample> {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn out_of_range_sample_is_bad_and_not_aggregated() {
    let rig = rig().await;
    let validator = SampleValidator::new(vec![ChannelLimits::new(0, 0.0, 100.0)]).unwrap();
    let processor = SampleProcessor::new(validator, 100, MetricSource::Force).unwrap();
    let stage = ProcessingStage::spawn(rig.manager.subscribe("press").unwrap(), processor, 256);
    let mut processed = stage.subscribe();
    rig.manager.start("press", Duration::from_millis(2)).unwrap();

    for _ in 0..5 {
        let sample = next(&mut processed).await;
        assert_eq!(sample.quality, Quality::Good);
        assert_eq!(sample.raw.analog[0], Some(25.0));
    }

    rig.device.set_value("temperature", 500.0).unwrap();
    rig.device.set_value("force", 9999.0).unwrap();
    let bad = loop {
        let sample = next(&mut processed).await;
        if sample.quality == Quality::Bad {
            break sample;
        }
    };
    assert!(bad
        .issues
        .iter()
        .any(|i| matches!(i, ValidationIssue::OutOfRange { channel: 0, .. })));
    let metrics = bad.metrics.unwrap();
    assert_eq!(metrics.max, 40.0);
    assert_eq!(metrics.mean, 40.0);

    rig.manager.stop("press").unwrap();
}

#[tokio::test]
async fn stop_emits_completed_and_nothing_after() {
    let rig = rig().await;
    let mut events = rig.manager.subscribe("press").unwrap();
    rig.manager.start("press", Duration::from_millis(1)).unwrap();
    assert!(rig.manager.is_collecting("press"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    rig.manager.stop("press").unwrap();
    rig.manager.stop("press").unwrap();
    assert!(!rig.manager.is_collecting("press"));

    let mut completed = 0;
    let mut after_completed = 0;
    while let Ok(event) = events.try_recv() {
        match event {
            AcquisitionEvent::Completed { .. } => completed += 1,
            _ if completed > 0 => after_completed += 1,
            _ => {}
        }
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    while let Ok(event) = events.try_recv() {
        if completed > 0 && !matches!(event, AcquisitionEvent::Completed { .. }) {
            after_completed += 1;
        }
    }
    assert_eq!(completed, 1);
    assert_eq!(after_completed, 0);
}

#[tokio::test]
async fn device_fault_stops_pipeline_and_reaches_bus() {
    let rig = rig().await;
    let mut bus_events = rig.bus.subscribe().unwrap();
    rig.manager.start("press", Duration::from_millis(2)).unwrap();
    rig.device.set_fail_io(true);

    let fault = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(StationEvent::AcquisitionFault { device_id, message, .. }) =
                bus_events.recv().await
            {
                return (device_id, message);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(fault.0, "press");
    assert!(fault.1.contains("simulated I/O failure"));

    tokio::time::timeout(Duration::from_secs(1), async {
        while rig.manager.is_collecting("press") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    rig.device.set_fail_io(false);
    rig.manager.start("press", Duration::from_millis(2)).unwrap();
    assert!(rig.manager.is_collecting("press"));
    rig.manager.stop("press").unwrap();
}

#[tokio::test]
async fn unknown_device_and_double_start_are_rejected() {
    let rig = rig().await;
    assert!(matches!(
        rig.manager.start("ghost", Duration::from_millis(5)),
        Err(StationError::UnknownDevice(_))
    ));
    assert!(matches!(
        rig.manager.stop("ghost"),
        Err(StationError::UnknownDevice(_))
    ));

    rig.manager.start("press", Duration::from_millis(5)).unwrap();
    assert!(matches!(
        rig.manager.start("press", Duration::from_millis(5)),
        Err(StationError::AlreadyCollecting(_))
    ));
    rig.manager.dispose_all();
    assert!(!rig.manager.is_collecting("press"));
}

#[tokio::test]
async fn removed_device_ends_acquisition() {
    let rig = rig().await;
    let mut events = rig.manager.subscribe("press").unwrap();
    rig.manager.start("press", Duration::from_millis(2)).unwrap();
    rig.registry.remove("press").await.unwrap();

    let completed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(AcquisitionEvent::Completed { device_id }) => return device_id,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return String::new(),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(completed, "press");
    assert!(!rig.manager.is_collecting("press"));
    assert!(!rig.device.is_connected());
}

#[tokio::test]
async fn hung_read_faults_instead_of_stalling() {
    let rig = rig_with(PipelineSettings {
        read_timeout_ms: 30,
        ..PipelineSettings::default()
    })
    .await;
    let mut bus_events = rig.bus.subscribe().unwrap();
    rig.device.set_hang(true);
    rig.manager.start("press", Duration::from_millis(2)).unwrap();

    let message = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(StationEvent::AcquisitionFault { message, .. }) = bus_events.recv().await {
                return message;
            }
        }
    })
    .await
    .unwrap();
    assert!(message.contains("Timed out after 30 ms"), "{message}");
    assert!(!rig.manager.is_collecting("press"));

    rig.device.set_hang(false);
    let mut events = rig.manager.subscribe("press").unwrap();
    rig.manager.start("press", Duration::from_millis(2)).unwrap();
    let sample = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(AcquisitionEvent::Sample(sample)) = events.recv().await {
                return sample;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(sample.force, Some(40.0));
    rig.manager.stop("press").unwrap();
}

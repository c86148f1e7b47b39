//! Sample processing: validation plus aggregation, one output per input.

use super::stats::{AggregatedMetrics, WindowedStats};
use super::validation::{Quality, SampleValidator, ValidationIssue};
use crate::acquisition::{AcquisitionEvent, RawSample, ANALOG_CHANNELS};
use crate::error::{StationError, StationResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Quantity fed into the trailing window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricSource {
    /// The force scalar.
    #[default]
    Force,
    /// The position scalar.
    Position,
    /// One analog slot.
    Analog(usize),
}

impl MetricSource {
    /// Picks the quantity out of `sample`.
    pub fn extract(self, sample: &RawSample) -> Option<f64> {
        match self {
            MetricSource::Force => sample.force,
            MetricSource::Position => sample.position,
            MetricSource::Analog(i) => sample.analog.get(i).copied().flatten(),
        }
    }

    /// Checks an analog index is in range.
    pub fn validate(self) -> StationResult<()> {
        match self {
            MetricSource::Analog(i) if i >= ANALOG_CHANNELS => Err(StationError::Configuration(
                format!("metric source analog index {i} out of range"),
            )),
            _ => Ok(()),
        }
    }
}

/// Output of [`SampleProcessor::process`].
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProcessedSample {
    /// The input sample.
    pub raw: Arc<RawSample>,
    /// Quality verdict.
    pub quality: Quality,
    /// Validation findings.
    pub issues: Vec<ValidationIssue>,
    /// Window metrics after this sample (or the latest, for Bad samples).
    pub metrics: Option<AggregatedMetrics>,
    /// When processing happened.
    pub processed_at: DateTime<Utc>,
}

/// Validates samples and maintains the trailing window.
#[derive(Debug)]
pub struct SampleProcessor {
    validator: SampleValidator,
    stats: WindowedStats,
    source: MetricSource,
}

impl SampleProcessor {
    /// Processor aggregating `source` over a window of `window` samples.
    pub fn new(validator: SampleValidator, window: usize, source: MetricSource) -> StationResult<Self> {
        if window == 0 {
            return Err(StationError::Configuration(
                "aggregation window must be > 0".into(),
            ));
        }
        source.validate()?;
        Ok(Self {
            validator,
            stats: WindowedStats::new(window),
            source,
        })
    }

    /// Processes one sample. Bad samples are not aggregated but still carry the
    /// latest metrics.
    pub fn process(&mut self, raw: Arc<RawSample>) -> ProcessedSample {
        let (quality, issues) = self.validator.validate(&raw);
        if quality != Quality::Bad {
            if let Some(value) = self.source.extract(&raw) {
                self.stats.push(value);
            }
        } else {
            debug!(
                device_id = %raw.device_id,
                sequence = raw.sequence,
                issues = issues.len(),
                "Bad sample excluded from aggregation"
            );
        }
        ProcessedSample {
            raw,
            quality,
            issues,
            metrics: self.stats.snapshot(),
            processed_at: Utc::now(),
        }
    }

    /// Current window metrics.
    pub fn metrics(&self) -> Option<AggregatedMetrics> {
        self.stats.snapshot()
    }

    /// Empties the window.
    pub fn reset(&mut self) {
        self.stats.clear();
    }
}

/// Task turning an acquisition stream into a processed stream.
pub struct ProcessingStage {
    sender: broadcast::Sender<Arc<ProcessedSample>>,
    processor: Arc<Mutex<SampleProcessor>>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingStage")
            .field("subscribers", &self.sender.receiver_count())
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl ProcessingStage {
    /// Spawns the stage on the current runtime. The task ends when the
    /// acquisition stream closes or [`ProcessingStage::stop`] is called.
    pub fn spawn(
        mut input: broadcast::Receiver<AcquisitionEvent>,
        processor: SampleProcessor,
        capacity: usize,
    ) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        let processor = Arc::new(Mutex::new(processor));
        let out = sender.clone();
        let shared = Arc::clone(&processor);
        let task = tokio::spawn(async move {
            loop {
                match input.recv().await {
                    Ok(AcquisitionEvent::Sample(raw)) => {
                        let processed = shared.lock().process(raw);
                        let _ = out.send(Arc::new(processed));
                    }
                    Ok(AcquisitionEvent::Fault { device_id, message }) => {
                        warn!(device_id = %device_id, error = %message, "Upstream acquisition fault");
                    }
                    Ok(AcquisitionEvent::Completed { device_id }) => {
                        debug!(device_id = %device_id, "Upstream acquisition completed");
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(dropped = n, "Processing stage lagged, samples dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        Self {
            sender,
            processor,
            task,
        }
    }

    /// Receiver for processed samples emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ProcessedSample>> {
        self.sender.subscribe()
    }

    /// Current window metrics.
    pub fn metrics(&self) -> Option<AggregatedMetrics> {
        self.processor.lock().metrics()
    }

    /// Aborts the stage task.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ProcessingStage {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::ChannelLimits;

    fn sample(seq: u64, force: f64, analog0: f64) -> Arc<RawSample> {
        let mut sample = RawSample::new("dev", seq);
        sample.force = Some(force);
        sample.position = Some(0.0);
        sample.analog[0] = Some(analog0);
        Arc::new(sample)
    }

    fn processor() -> SampleProcessor {
        let validator = SampleValidator::new(vec![ChannelLimits::new(0, 0.0, 10.0)]).unwrap();
        SampleProcessor::new(validator, 10, MetricSource::Force).unwrap()
    }

    #[test]
    fn test_bad_sample_excluded_but_carries_metrics() {
        let mut processor = processor();
        let first = processor.process(sample(1, 4.0, 1.0));
        assert_eq!(first.quality, Quality::Good);
        assert_eq!(first.metrics.unwrap().count, 1);

        let bad = processor.process(sample(2, 1000.0, 50.0));
        assert_eq!(bad.quality, Quality::Bad);
        let metrics = bad.metrics.unwrap();
        assert_eq!(metrics.count, 1);
        assert_eq!(metrics.max, 4.0);
    }

    #[test]
    fn test_analog_metric_source() {
        let validator = SampleValidator::default();
        let mut processor = SampleProcessor::new(validator, 5, MetricSource::Analog(0)).unwrap();
        processor.process(sample(1, 0.0, 2.0));
        let out = processor.process(sample(2, 0.0, 4.0));
        assert_eq!(out.metrics.unwrap().mean, 3.0);
        assert!(SampleProcessor::new(SampleValidator::default(), 5, MetricSource::Analog(8)).is_err());
        assert!(SampleProcessor::new(SampleValidator::default(), 0, MetricSource::Force).is_err());
    }

    #[test]
    fn test_processed_sample_serializes() {
        let mut processor = processor();
        let out = processor.process(sample(7, 2.5, 1.0));
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["quality"], "Good");
        assert_eq!(json["raw"]["sequence"], 7);
        assert_eq!(json["metrics"]["count"], 1);
    }

    #[tokio::test]
    async fn test_stage_emits_one_output_per_sample() {
        let (tx, rx) = broadcast::channel(16);
        let stage = ProcessingStage::spawn(rx, processor(), 16);
        let mut out = stage.subscribe();

        for seq in 1..=3 {
            tx.send(AcquisitionEvent::Sample(sample(seq, seq as f64, 1.0)))
                .unwrap();
        }
        for seq in 1..=3 {
            let processed = out.recv().await.unwrap();
            assert_eq!(processed.raw.sequence, seq);
        }
        assert_eq!(stage.metrics().unwrap().count, 3);
    }
}

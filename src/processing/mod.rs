//! Sample validation and aggregation.

pub mod processor;
pub mod stats;
pub mod validation;

pub use processor::{MetricSource, ProcessedSample, ProcessingStage, SampleProcessor};
pub use stats::{AggregatedMetrics, WindowedStats, DEFAULT_WINDOW};
pub use validation::{ChannelLimits, Quality, SampleValidator, ValidationIssue};

//! Continuous data acquisition.
//!
//! - [`sample`]: raw sample layout, status flags and sample sources
//! - [`pipeline`]: the interval poller with broadcast fan-out
//! - [`manager`]: one pipeline per registered device

pub mod manager;
pub mod pipeline;
pub mod sample;

pub use manager::AcquisitionManager;
pub use pipeline::{AcquisitionEvent, AcquisitionPipeline, PipelineSettings, PipelineStats};
pub use sample::{
    ChannelSampler, RawSample, SampleSlot, SampleSource, StatusFlags, Wiring, ANALOG_CHANNELS,
};

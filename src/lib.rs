//! Core library for the mechanical test station.
//!
//! This library contains the device capability model, command dispatch,
//! continuous acquisition, sample validation and aggregation, and the test-session
//! lifecycle. It is used by the `test_station` binary and by integration tests,
//! which drive it with simulated devices.

pub mod acquisition;
pub mod bus;
pub mod command;
pub mod config;
pub mod core;
pub mod device;
pub mod error;
pub mod error_recovery;
pub mod fsm;
pub mod logging;
pub mod processing;
pub mod session;
pub mod settings;
pub mod station;

pub use error::{StationError, StationResult};
pub use station::TestStation;

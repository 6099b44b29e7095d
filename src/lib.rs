#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # rowgate
//!
//! Gateway core for the WaterRower S4 performance monitor.
//!
//! The crate does three things at once and keeps them consistent:
//!
//! - **Drives the S4 over its serial protocol**: polls memory registers,
//!   decodes the small family of ASCII reply frames, and exposes a hot
//!   stream of typed telemetry samples, with record/replay of raw traffic.
//! - **Broadcasts the rower as a Fitness Machine**: a standards-compliant
//!   FTMS peripheral (service `0x1826`) named `WaterRower`, so fitness
//!   apps treat it as a recognised indoor trainer.
//! - **Ingests a BLE heart-rate monitor**: subscribes to Heart Rate
//!   Measurement notifications and merges them with the serial telemetry
//!   into a training session with pause accounting, summary statistics,
//!   and a FIT activity encoding at the end.
//!
//! The outer daemon (config store, HTTP control plane, web UI, upload
//! client) lives elsewhere and drives this crate through its public API.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rowgate::{S4Config, S4Driver, SessionConfig, TrainingSession};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // find the rower on USB and start polling telemetry
//!     let driver = Arc::new(S4Driver::new(S4Config::default()));
//!     driver.connect().await?;
//!
//!     // collect a session; heart-rate monitor optional
//!     let session = TrainingSession::new(SessionConfig::default());
//!     session.start(driver.clone(), None).await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60 * 10)).await;
//!
//!     let samples = session.stop().await?;
//!     println!("session finished with {} samples", samples.len());
//!     Ok(())
//! }
//! ```

/// Typed capability traits over the host Bluetooth stack
pub mod ble;
/// btleplug-backed central adapter
pub mod central;
/// Component configuration structs
pub mod config;
/// S4 serial driver
pub mod driver;
/// Error types and handling
pub mod error;
/// FIT activity-file boundary
pub mod fit;
/// FTMS peripheral
pub mod ftms;
/// Heart-rate monitor client
pub mod hrm;
/// BlueZ-backed peripheral adapter
#[cfg(target_os = "linux")]
pub mod peripheral;
/// S4 wire protocol codec and command builders
pub mod protocol;
/// Raw-read recording and replay file format
pub mod recording;
/// S4 register map and current-value table
pub mod registers;
/// Training session aggregation
pub mod session;
/// Shared data model
pub mod types;

// Re-export the main types for convenient usage
pub use config::{FtmsConfig, HrmConfig, S4Config, SessionConfig};
pub use driver::{DriverEvent, S4Driver};
pub use error::{GatewayError, Result};
pub use ftms::FtmsPeripheral;
pub use hrm::HrmClient;
pub use session::{HeartRateSource, SessionEvent, TelemetrySource, TrainingSession};
pub use types::{
    DataPoint, DriverState, HeartRateSample, HrmState, SessionState, SessionSummary,
    TrainingSample,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

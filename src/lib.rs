#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Voltra
//!
//! Device communication core for the Voltra cable resistance trainer over
//! Bluetooth Low Energy.
//!
//! The crate covers everything between the radio and a workout UI:
//!
//! - **Command table**: every legal weight, chains and eccentric value mapped
//!   to the exact bytes the unit expects, so out-of-range values never reach
//!   the wire
//! - **Telemetry decoding**: classification and parsing of notification
//!   packets into typed frames and rep/set boundaries
//! - **Connection lifecycle**: authenticate/initialize handshake with the
//!   unit's required settle times, reconnection and link-loss handling
//! - **Recording lifecycle**: prepare, engage, disengage and stop, gated on
//!   the connection so the motor is never believed engaged on a dead link
//! - **Telemetry session**: frame buffering, sequence-gap detection and
//!   recording timing
//!
//! The core talks to the unit only through the [`Transport`] trait;
//! [`BleTransport`] is the `btleplug` implementation.
//!
//! ## Quick Start
//!
//! ```no_run
//! use voltra::VoltraDevice;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let device = VoltraDevice::connect_first().await?;
//!
//!     device.recording().set_weight(40).await?;
//!     device.recording().prepare().await?;
//!     device.recording().engage().await?;
//!
//!     // ... lift ...
//!
//!     device.recording().stop().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth Low Energy transport
pub mod ble;
/// Setting values to command payloads
pub mod commands;
/// Connection handshake and lifecycle
pub mod connection;
/// Telemetry notification decoding
pub mod decoder;
/// Per-device component wiring
pub mod device;
/// Error types and handling
pub mod error;
/// Raw to physical unit conversion
pub mod normalize;
/// Wire constants and command frames
pub mod protocol;
/// Workout recording lifecycle
pub mod recording;
/// Telemetry buffering and timing
pub mod session;
/// Transport capability consumed by the core
pub mod transport;
/// Type definitions and data structures
pub mod types;

pub use ble::BleTransport;
pub use commands::{CommandEntry, CommandTable};
pub use connection::{ConnectionEvent, ConnectionStateMachine};
pub use decoder::decode;
pub use device::VoltraDevice;
pub use error::{Result, Setting, TransportError, TransportErrorKind, VoltraError};
pub use normalize::normalize;
pub use recording::{RecordingEvent, RecordingStateMachine};
pub use session::{SessionSnapshot, TelemetryEvent, TelemetrySession};
pub use transport::Transport;
pub use types::{
    ConnectedDevice, ConnectionState, DecodedEvent, DeviceConfig, DeviceId, DiscoveredDevice,
    LinkState, Phase, RecordingState, Sample, TelemetryFrame, TimingConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Voltra GATT service UUID
pub const VOLTRA_SERVICE_UUID: &str = "E4DADA34-0867-8783-9F70-2CA29216C7E4";

/// Characteristic the unit sends telemetry and command echoes on
pub const VOLTRA_NOTIFY_CHAR_UUID: &str = "55CA1E52-7354-25DE-6AFC-B7DF1E8816AC";

/// Characteristic commands are written to
pub const VOLTRA_WRITE_CHAR_UUID: &str = "A010891D-F50F-44F0-901F-9A2421A9E050";

/// Advertised local name prefix of every Voltra unit
pub const VOLTRA_NAME_PREFIX: &str = "VTR-";

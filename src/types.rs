use serde::{Deserialize, Serialize};
use std::{fmt, time::SystemTime};

use crate::error::{Result, VoltraError};

/// Opaque device identifier assigned by the transport at discovery time
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a transport-specific identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as the transport reported it
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device found while scanning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Identifier to pass to `connect`
    pub id: DeviceId,
    /// Advertised local name (`VTR-...`)
    pub name: String,
    /// Signal strength in dBm, if reported
    pub rssi: Option<i16>,
}

/// Handle returned by a successful connect, bound to one device identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDevice {
    /// Device the session is bound to
    pub id: DeviceId,
    /// Wall-clock time the handshake completed
    pub connected_at: SystemTime,
}

/// Raw link state as reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No link
    Disconnected,
    /// Link being established
    Connecting,
    /// Link up
    Connected,
}

/// Connection lifecycle owned by the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Rest state
    Disconnected,
    /// Transport connect in progress
    Connecting,
    /// Auth payload and init sequence in progress
    Authenticating,
    /// Handshake complete, commands may be written
    Connected,
    /// Transport disconnect in progress
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Connected => write!(f, "Connected"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

/// Recording / motor engagement lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordingState {
    /// Motor disengaged, no workout mode loaded
    Idle,
    /// PREPARE/SETUP sequence in progress
    Preparing,
    /// Workout mode loaded, motor disengaged
    Ready,
    /// Motor engaged and streaming
    Active,
    /// Final STOP in progress
    Stopping,
}

impl fmt::Display for RecordingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Preparing => write!(f, "Preparing"),
            Self::Ready => write!(f, "Ready"),
            Self::Active => write!(f, "Active"),
            Self::Stopping => write!(f, "Stopping"),
        }
    }
}

/// Movement phase reported in each telemetry frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// No movement
    Idle = 0,
    /// Lifting
    Concentric = 1,
    /// Paused under load
    Hold = 2,
    /// Lowering
    Eccentric = 3,
}

impl From<u8> for Phase {
    /// Values outside the known range clamp to [`Phase::Idle`]
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Concentric,
            2 => Self::Hold,
            3 => Self::Eccentric,
            _ => Self::Idle,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Concentric => write!(f, "Concentric"),
            Self::Hold => write!(f, "Hold"),
            Self::Eccentric => write!(f, "Eccentric"),
        }
    }
}

/// One decoded telemetry sample in device units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    /// Device sequence counter
    pub sequence: u32,
    /// Device clock in milliseconds
    pub timestamp_ms: u64,
    /// Movement phase
    pub phase: Phase,
    /// Cable extension, 0 at rest
    pub position_raw: i32,
    /// Signed cable speed
    pub velocity_raw: i32,
    /// Signed force reading
    pub force_raw: i32,
}

/// Result of decoding one notification buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedEvent {
    /// Telemetry frame
    Frame(TelemetryFrame),
    /// Device-detected end of a repetition
    RepBoundary,
    /// Device-detected end of a set
    SetBoundary,
    /// Not a telemetry packet; ignored
    Unrecognized,
}

/// Hardware-agnostic sample in physical units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Device sequence counter
    pub sequence: u32,
    /// Device clock in milliseconds
    pub timestamp_ms: u64,
    /// Movement phase
    pub phase: Phase,
    /// Fraction of full extension
    pub position: f64,
    /// Cable speed in m/s
    pub velocity: f64,
    /// Force magnitude
    pub force: f64,
}

/// Timing used by the handshake and workout command sequences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait after writing the auth payload before the init sequence
    pub auth_timeout_ms: u64,
    /// Gap between consecutive init commands
    pub init_command_delay_ms: u64,
    /// Settle time after PREPARE
    pub prepare_delay_ms: u64,
    /// Settle time after SETUP
    pub setup_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: 500,
            init_command_delay_ms: 100,
            prepare_delay_ms: 200,
            setup_delay_ms: 500,
        }
    }
}

impl TimingConfig {
    /// Check internal consistency
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::InvalidConfig`] if SETUP does not get more
    /// settling time than PREPARE.
    pub fn validate(&self) -> Result<()> {
        if self.setup_delay_ms <= self.prepare_delay_ms {
            return Err(VoltraError::InvalidConfig(format!(
                "setup_delay_ms ({}) must exceed prepare_delay_ms ({})",
                self.setup_delay_ms, self.prepare_delay_ms
            )));
        }
        Ok(())
    }
}

/// Configuration for one device controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Command sequence timing
    pub timing: TimingConfig,
    /// Capacity of the recent-frame ring buffer
    pub recent_frame_capacity: usize,
    /// Capacity of each event broadcast channel
    pub event_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            timing: TimingConfig::default(),
            recent_frame_capacity: 256,
            event_capacity: 64,
        }
    }
}

impl DeviceConfig {
    /// Check internal consistency
    ///
    /// # Errors
    ///
    /// Returns [`VoltraError::InvalidConfig`] for zero capacities or
    /// inconsistent timing.
    pub fn validate(&self) -> Result<()> {
        if self.recent_frame_capacity == 0 || self.event_capacity == 0 {
            return Err(VoltraError::InvalidConfig(
                "capacities must be non-zero".to_string(),
            ));
        }
        self.timing.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_from_u8_clamps() {
        assert_eq!(Phase::from(0), Phase::Idle);
        assert_eq!(Phase::from(1), Phase::Concentric);
        assert_eq!(Phase::from(2), Phase::Hold);
        assert_eq!(Phase::from(3), Phase::Eccentric);
        assert_eq!(Phase::from(4), Phase::Idle);
        assert_eq!(Phase::from(0xFF), Phase::Idle);
    }

    #[test]
    fn test_timing_config_defaults() {
        let config = TimingConfig::default();

        assert_eq!(config.auth_timeout_ms, 500);
        assert_eq!(config.init_command_delay_ms, 100);
        assert_eq!(config.prepare_delay_ms, 200);
        assert_eq!(config.setup_delay_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timing_config_rejects_short_setup() {
        let config = TimingConfig {
            prepare_delay_ms: 300,
            setup_delay_ms: 300,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(VoltraError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_device_config_rejects_zero_capacity() {
        let config = DeviceConfig {
            recent_frame_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(DeviceConfig::default().validate().is_ok());
    }

    #[test]
    fn test_device_id_display() {
        let id = DeviceId::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(id.as_str(), "AA:BB:CC:DD:EE:FF");
    }
}

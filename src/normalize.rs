use crate::types::{Sample, TelemetryFrame};

/// Raw position reading at full cable extension
pub const FULL_EXTENSION_RAW: f64 = 600.0;

/// Raw velocity units per m/s
pub const VELOCITY_SCALE: f64 = 1000.0;

/// Convert a frame from device units to physical units
///
/// Position becomes a fraction of full extension (it may exceed 1.0 if the
/// cable is pulled past the calibrated range), velocity becomes m/s, and force
/// keeps only its magnitude.
#[must_use]
pub fn normalize(frame: &TelemetryFrame) -> Sample {
    Sample {
        sequence: frame.sequence,
        timestamp_ms: frame.timestamp_ms,
        phase: frame.phase,
        position: f64::from(frame.position_raw) / FULL_EXTENSION_RAW,
        velocity: f64::from(frame.velocity_raw) / VELOCITY_SCALE,
        force: f64::from(frame.force_raw).abs(),
    }
}

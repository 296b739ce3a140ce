//! Notification decoding.
//!
//! Telemetry notification layout, all numerics little-endian:
//!
//! | offset | field        | type |
//! |--------|--------------|------|
//! | 0      | magic `0x55` | u8   |
//! | 1      | kind         | u8   |
//! | 2      | sequence     | u32  |
//! | 6      | timestamp ms | u64  |
//! | 14     | phase        | u8   |
//! | 15     | position     | u16  |
//! | 17     | velocity     | i16  |
//! | 19     | force        | i16  |
//!
//! Boundary markers carry only the header. Bytes past the declared layout are
//! ignored.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    error::DecodeError,
    protocol::{
        FRAME_LEN, KIND_FRAME, KIND_REP_BOUNDARY, KIND_SET_BOUNDARY, NOTIFICATION_HEADER_LEN,
        TELEMETRY_MAGIC,
    },
    types::{DecodedEvent, Phase, TelemetryFrame},
};

/// Classify and parse one notification buffer
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] when the buffer cannot hold the header or
/// the layout its kind selects, and [`DecodeError::UnknownDiscriminant`] for a
/// telemetry packet of unknown kind. Buffers that are not telemetry at all
/// decode to [`DecodedEvent::Unrecognized`].
pub fn decode(buffer: &[u8]) -> Result<DecodedEvent, DecodeError> {
    ensure_len(buffer, NOTIFICATION_HEADER_LEN)?;

    if buffer[0] != TELEMETRY_MAGIC {
        return Ok(DecodedEvent::Unrecognized);
    }

    match buffer[1] {
        KIND_FRAME => {
            ensure_len(buffer, FRAME_LEN)?;
            Ok(DecodedEvent::Frame(parse_frame(&buffer[NOTIFICATION_HEADER_LEN..])))
        }
        KIND_REP_BOUNDARY => Ok(DecodedEvent::RepBoundary),
        KIND_SET_BOUNDARY => Ok(DecodedEvent::SetBoundary),
        kind => Err(DecodeError::UnknownDiscriminant(kind)),
    }
}

const fn ensure_len(buffer: &[u8], expected: usize) -> Result<(), DecodeError> {
    if buffer.len() < expected {
        return Err(DecodeError::TooShort {
            expected,
            actual: buffer.len(),
        });
    }
    Ok(())
}

/// Caller guarantees `body` holds at least `FRAME_LEN - NOTIFICATION_HEADER_LEN` bytes
fn parse_frame(mut body: &[u8]) -> TelemetryFrame {
    let sequence = body.get_u32_le();
    let timestamp_ms = body.get_u64_le();
    let phase = Phase::from(body.get_u8());
    let position_raw = i32::from(body.get_u16_le());
    let velocity_raw = i32::from(body.get_i16_le());
    let force_raw = i32::from(body.get_i16_le());

    TelemetryFrame {
        sequence,
        timestamp_ms,
        phase,
        position_raw,
        velocity_raw,
        force_raw,
    }
}

/// Encode a frame in the notification layout
///
/// Used to build fixtures and by simulated transports. Values outside the
/// wire field widths are saturated.
pub fn encode_frame(frame: &TelemetryFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_LEN);
    buf.put_u8(TELEMETRY_MAGIC);
    buf.put_u8(KIND_FRAME);
    buf.put_u32_le(frame.sequence);
    buf.put_u64_le(frame.timestamp_ms);
    buf.put_u8(frame.phase as u8);
    buf.put_u16_le(u16::try_from(frame.position_raw.max(0)).unwrap_or(u16::MAX));
    buf.put_i16_le(saturate_i16(frame.velocity_raw));
    buf.put_i16_le(saturate_i16(frame.force_raw));
    buf.freeze()
}

fn saturate_i16(value: i32) -> i16 {
    i16::try_from(value).unwrap_or(if value < 0 { i16::MIN } else { i16::MAX })
}

//! Voltra wire format.
//!
//! Outbound commands are framed as:
//!
//! - Byte 0: command magic `0xAA`
//! - Byte 1: opcode
//! - Byte 2: payload length
//! - Bytes 3..: payload (little-endian numerics)
//! - Last byte: XOR of bytes 1 through the end of the payload
//!
//! Inbound notifications start with the telemetry magic `0x55` followed by a
//! kind byte; see [`crate::decoder`] for the field layout. Command echoes that
//! arrive on the subscribed write characteristic carry the command magic and
//! are therefore never mistaken for telemetry.

use bytes::{BufMut, Bytes, BytesMut};

/// First byte of every outbound command
pub const COMMAND_MAGIC: u8 = 0xAA;

/// First byte of every telemetry notification
pub const TELEMETRY_MAGIC: u8 = 0x55;

/// Notification header: magic + kind
pub const NOTIFICATION_HEADER_LEN: usize = 2;

/// Notification kind: telemetry frame
pub const KIND_FRAME: u8 = 0x01;
/// Notification kind: repetition boundary
pub const KIND_REP_BOUNDARY: u8 = 0x02;
/// Notification kind: set boundary
pub const KIND_SET_BOUNDARY: u8 = 0x03;

/// Full telemetry frame length including header
pub const FRAME_LEN: usize = 21;

/// Largest payload a command frame's length byte can describe
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Key sent in the authentication payload
pub const AUTH_KEY: [u8; 4] = [0x56, 0x54, 0x52, 0x01];

/// Command opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Authenticate the session
    Authenticate = 0x01,
    /// Turn on notifications from the controller
    EnableNotifications = 0x10,
    /// Select pounds as the display unit
    SetUnits = 0x11,
    /// Start the telemetry stream
    EnableTelemetry = 0x12,
    /// Ask the unit to report its firmware and serial
    RequestDeviceInfo = 0x13,
    /// Enter workout mode
    Prepare = 0x20,
    /// Load the configured resistance profile
    Setup = 0x21,
    /// Engage the motor
    Go = 0x22,
    /// Disengage the motor
    Stop = 0x23,
    /// Set base weight
    SetWeight = 0x30,
    /// Select the parameter the next `SetParameter` addresses
    SelectParameter = 0x31,
    /// Set the value of the selected parameter
    SetParameter = 0x32,
}

/// Parameter identifiers used with [`Opcode::SelectParameter`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Parameter {
    /// Chains load
    Chains = 0x01,
    /// Eccentric offset
    Eccentric = 0x02,
}

/// One outbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    /// Opcode
    pub opcode: Opcode,
    /// Payload data
    pub payload: Vec<u8>,
}

impl CommandFrame {
    /// Create a command with a payload
    pub fn new(opcode: Opcode, payload: Vec<u8>) -> Self {
        Self { opcode, payload }
    }

    /// Create a command with an empty payload
    pub fn bare(opcode: Opcode) -> Self {
        Self::new(opcode, Vec::new())
    }

    /// Serialize to wire bytes
    ///
    /// The length byte limits payloads to [`MAX_PAYLOAD_LEN`]; every
    /// constructor in this module stays far below it. Longer payloads are a
    /// programming error: debug builds panic, release builds truncate.
    pub fn to_bytes(&self) -> Bytes {
        debug_assert!(
            self.payload.len() <= MAX_PAYLOAD_LEN,
            "command payload of {} bytes exceeds {MAX_PAYLOAD_LEN}",
            self.payload.len()
        );
        let len = u8::try_from(self.payload.len()).unwrap_or(u8::MAX);
        let mut buf = BytesMut::with_capacity(4 + self.payload.len());

        buf.put_u8(COMMAND_MAGIC);
        buf.put_u8(self.opcode as u8);
        buf.put_u8(len);
        buf.extend_from_slice(&self.payload[..usize::from(len)]);

        let checksum = buf[1..].iter().fold(0u8, |acc, b| acc ^ b);
        buf.put_u8(checksum);

        buf.freeze()
    }
}

/// Authentication payload written right after the link comes up
pub fn authenticate() -> Bytes {
    CommandFrame::new(Opcode::Authenticate, AUTH_KEY.to_vec()).to_bytes()
}

/// Ordered initialization commands written after authentication
pub fn init_sequence() -> Vec<Bytes> {
    vec![
        CommandFrame::new(Opcode::EnableNotifications, vec![0x01]).to_bytes(),
        CommandFrame::new(Opcode::SetUnits, vec![0x00]).to_bytes(),
        CommandFrame::new(Opcode::EnableTelemetry, vec![0x01]).to_bytes(),
        CommandFrame::bare(Opcode::RequestDeviceInfo).to_bytes(),
    ]
}

/// Enter workout mode
pub fn prepare() -> Bytes {
    CommandFrame::bare(Opcode::Prepare).to_bytes()
}

/// Load the resistance profile
pub fn setup() -> Bytes {
    CommandFrame::bare(Opcode::Setup).to_bytes()
}

/// Engage the motor
pub fn go() -> Bytes {
    CommandFrame::bare(Opcode::Go).to_bytes()
}

/// Disengage the motor
pub fn stop() -> Bytes {
    CommandFrame::bare(Opcode::Stop).to_bytes()
}

/// Base weight in pounds
pub fn set_weight(pounds: u16) -> Bytes {
    CommandFrame::new(Opcode::SetWeight, pounds.to_le_bytes().to_vec()).to_bytes()
}

/// First half of a two-step parameter change
pub fn select_parameter(parameter: Parameter) -> Bytes {
    CommandFrame::new(Opcode::SelectParameter, vec![parameter as u8]).to_bytes()
}

/// Second half of a two-step parameter change
pub fn set_parameter(value: i16) -> Bytes {
    CommandFrame::new(Opcode::SetParameter, value.to_le_bytes().to_vec()).to_bytes()
}

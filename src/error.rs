use std::fmt;

use thiserror::Error;

/// Coarse classification of a transport failure, reported by the transport itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// A relay between this process and the radio could not be reached
    RelayUnreachable,
    /// The operation did not complete in time
    Timeout,
    /// Any other transport failure
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RelayUnreachable => write!(f, "relay unreachable"),
            Self::Timeout => write!(f, "timeout"),
            Self::Other => write!(f, "transport failure"),
        }
    }
}

/// Failure reported by a [`Transport`](crate::transport::Transport) implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    /// Classification used for user messaging
    pub kind: TransportErrorKind,
    /// Free-form detail from the underlying stack
    pub message: String,
}

impl TransportError {
    /// Create a transport error of the given kind
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for [`TransportErrorKind::Timeout`]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    /// Shorthand for [`TransportErrorKind::Other`]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }
}

/// Malformed notification buffer
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer is shorter than the layout selected by its discriminant
    #[error("notification too short: {actual} bytes, expected at least {expected}")]
    TooShort {
        /// Minimum length for the classified packet
        expected: usize,
        /// Length actually received
        actual: usize,
    },

    /// Discriminant byte does not name a known packet kind
    #[error("unknown notification kind {0:#04X}")]
    UnknownDiscriminant(u8),
}

/// Physical setting addressed by a command table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    /// Base resistance
    Weight,
    /// Chains (resistance increasing with extension)
    Chains,
    /// Eccentric offset
    Eccentric,
}

impl fmt::Display for Setting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Weight => write!(f, "weight"),
            Self::Chains => write!(f, "chains"),
            Self::Eccentric => write!(f, "eccentric"),
        }
    }
}

/// Errors that can occur when driving a Voltra unit
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VoltraError {
    /// Connect, write or disconnect failed at the transport boundary
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Setting value is not present in its command table
    #[error("Unsupported {setting} value: {value}")]
    InvalidSettingValue {
        /// Table that was consulted
        setting: Setting,
        /// Requested value
        value: i32,
    },

    /// Operation requires a connected device
    #[error("Device not connected")]
    NotConnected,

    /// `connect` was called while a connection exists or is being set up
    #[error("Device already connected or connecting")]
    AlreadyConnected,

    /// A state machine was asked to take a transition it does not have
    #[error("Invalid transition from {from} on {input}")]
    InvalidStateTransition {
        /// State the machine was in
        from: String,
        /// Input that was rejected
        input: String,
    },

    /// Notification buffer could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// No Voltra device was found during scanning
    #[error("Voltra device not found")]
    DeviceNotFound,

    /// Configuration values are inconsistent
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for Voltra operations
pub type Result<T> = std::result::Result<T, VoltraError>;

impl VoltraError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::NotConnected | Self::DeviceNotFound
        )
    }

    /// Check if retrying the same call may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport(e) => matches!(e.kind, TransportErrorKind::Timeout),
            Self::NotConnected => true,
            _ => false,
        }
    }

    /// Short message suitable for showing to the person using the device
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Transport(e) => match e.kind {
                TransportErrorKind::RelayUnreachable => {
                    "Cannot reach the Bluetooth relay. Check that it is running.".to_string()
                }
                TransportErrorKind::Timeout => {
                    "The device did not respond in time. Move closer and try again.".to_string()
                }
                TransportErrorKind::Other => format!("Connection problem: {}", e.message),
            },
            Self::InvalidSettingValue { setting, value } => {
                format!("{value} is not a supported {setting} setting")
            }
            Self::NotConnected => "Connect to a device first.".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = VoltraError::from(TransportError::timeout("no ack"));
        assert!(timeout.is_connection_error());
        assert!(timeout.is_recoverable());

        let relay = VoltraError::from(TransportError::new(
            TransportErrorKind::RelayUnreachable,
            "ws closed",
        ));
        assert!(relay.is_connection_error());
        assert!(!relay.is_recoverable());

        let setting = VoltraError::InvalidSettingValue {
            setting: Setting::Chains,
            value: 37,
        };
        assert!(!setting.is_connection_error());
        assert!(!setting.is_recoverable());
    }

    #[test]
    fn test_user_message_uses_kind() {
        let relay = VoltraError::from(TransportError::new(
            TransportErrorKind::RelayUnreachable,
            "connection refused",
        ));
        assert!(relay.user_message().contains("relay"));

        let timeout = VoltraError::from(TransportError::timeout("connect"));
        assert!(timeout.user_message().contains("in time"));
    }

    #[test]
    fn test_error_display() {
        let error = VoltraError::InvalidSettingValue {
            setting: Setting::Weight,
            value: 7,
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("weight"));
        assert!(error_string.contains('7'));

        let decode = VoltraError::from(DecodeError::UnknownDiscriminant(0x7F));
        assert!(decode.to_string().contains("0x7F"));
    }
}

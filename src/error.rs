//! Error types for decoding trap data and talking to the trap over GATT.
//!
//! None of these are fatal. Decode errors mean "ignore this advertisement",
//! reset and name errors are handed back to whoever asked for the operation.

use thiserror::Error;

/// Failure to interpret bytes coming from (or going to) the trap.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("manufacturer data under company id 0x{0:04X} is not from a trap")]
    NotThisDevice(u16),

    #[error("payload too short: {len} bytes (need at least {needed})")]
    Truncated { len: usize, needed: usize },

    #[error("unknown trigger byte 0x{0:02X}")]
    UnknownTriggerByte(u8),

    #[error("invalid device name: {0}")]
    InvalidName(String),
}

/// What a [`crate::transport::GattTransport`] reports when a connected
/// operation does not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("device {0} not found")]
    NotFound(String),

    #[error("GATT operation failed: {0}")]
    Failure(String),

    #[error("GATT operation timed out")]
    Timeout,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResetError {
    #[error("failed to write reset command: {0}")]
    TransportFailure(String),

    #[error("reset timed out")]
    Timeout,
}

impl From<TransportError> for ResetError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => ResetError::Timeout,
            other => ResetError::TransportFailure(other.to_string()),
        }
    }
}

/// Errors from connected reads and name writes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("GATT transfer failed: {0}")]
    TransportFailure(String),

    #[error("GATT transfer timed out")]
    Timeout,
}

impl From<TransportError> for GattError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => GattError::Timeout,
            other => GattError::TransportFailure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_are_translated() {
        assert_eq!(ResetError::from(TransportError::Timeout), ResetError::Timeout);
        assert_eq!(
            ResetError::from(TransportError::NotFound("AA:BB:CC:DD:EE:FF".into())),
            ResetError::TransportFailure("device AA:BB:CC:DD:EE:FF not found".into())
        );
        assert_eq!(
            GattError::from(TransportError::Failure("link lost".into())),
            GattError::TransportFailure("GATT operation failed: link lost".into())
        );
    }
}

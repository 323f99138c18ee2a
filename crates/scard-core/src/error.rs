//! Error kinds surfaced by every smartcard backend.
//!
//! Errors are small enumerated kinds. Lower layers keep their own error
//! enums ([`TransportError`], [`FrameError`]) and convert into [`Error`] at
//! the backend boundary.

use thiserror::Error;

use crate::protocol::frame::FrameError;
use crate::transport::TransportError;

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Invalid argument")]
    InvalidArgument,

    #[error("No smartcard device available")]
    NoDevice,

    #[error("Operation not supported by the active backend")]
    NotSupported,

    #[error("Malformed frame or response")]
    Protocol,

    #[error("Checksum mismatch")]
    BadMessage,

    #[error("Message too large")]
    MessageTooLarge,

    /// The reader chip (NACK status byte) or the card (status word) refused
    /// the request.
    #[error("Remote I/O error (status 0x{status:02X})")]
    RemoteIo { status: u16 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("No ATR available")]
    NoData,

    #[error("Timed out")]
    Timeout,

    #[error("Device busy, retry")]
    Busy,
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout { .. } => Error::Timeout,
            TransportError::NotFound(_) | TransportError::OpenFailed(_) => Error::NoDevice,
            other => Error::Io(other.to_string()),
        }
    }
}

impl From<FrameError> for Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::BadLeadByte(_) | FrameError::LengthMismatch { .. } => Error::Protocol,
            FrameError::TooLarge(_) => Error::MessageTooLarge,
            FrameError::Checksum { .. } => Error::BadMessage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transport_timeout_maps_to_timeout() {
        let err: Error = TransportError::Timeout {
            wait: Duration::from_millis(1000),
        }
        .into();
        assert_eq!(err, Error::Timeout);
    }

    #[test]
    fn test_frame_errors_map_to_kinds() {
        assert_eq!(Error::from(FrameError::BadLeadByte(0x12)), Error::Protocol);
        assert_eq!(Error::from(FrameError::TooLarge(600)), Error::MessageTooLarge);
        assert_eq!(
            Error::from(FrameError::Checksum {
                expected: 1,
                actual: 2
            }),
            Error::BadMessage
        );
    }
}

//! Serial line abstraction.
//!
//! Defines the `SerialLine` trait the ALPAR engine talks through,
//! allowing different implementations (serialport, mock).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {wait:?}")]
    Timeout { wait: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Byte-oriented serial line.
///
/// Every read carries its own bounded wait; no call blocks forever.
pub trait SerialLine: Send {
    /// Write raw bytes, returning how many were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError>;

    /// Fill `buf` completely or fail with `Timeout` once `wait` elapses.
    ///
    /// A zero `wait` only succeeds if the bytes are already buffered.
    fn read_exact_within(&mut self, buf: &mut [u8], wait: Duration) -> Result<(), TransportError>;

    /// Drop everything received but not yet read.
    fn discard_input(&mut self) -> Result<(), TransportError>;

    /// Write all of `data`, treating a partial write as an error.
    fn write_all_or_fail(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let written = self.write(data)?;
        if written != data.len() {
            return Err(TransportError::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }
}

impl<L: SerialLine + ?Sized> SerialLine for Box<L> {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        (**self).write(data)
    }

    fn read_exact_within(&mut self, buf: &mut [u8], wait: Duration) -> Result<(), TransportError> {
        (**self).read_exact_within(buf, wait)
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        (**self).discard_input()
    }
}

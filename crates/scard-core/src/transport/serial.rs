//! serialport-based line to the reader chip.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, instrument};

use super::traits::{SerialLine, TransportError};
use crate::protocol::constants::{ALPAR_WAIT, NXP_BAUD_RATE};

/// Raw 8N1 serial line without flow control.
pub struct SerialPortLine {
    port: Box<dyn SerialPort>,
    path: String,
}

impl SerialPortLine {
    /// Open `path` at the chip's fixed line speed.
    #[instrument(level = "info")]
    pub fn open(path: &str) -> Result<Self, TransportError> {
        let port = serialport::new(path, NXP_BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(ALPAR_WAIT)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::NotFound(path.to_string()),
                _ => TransportError::OpenFailed(format!("{path}: {e}")),
            })?;

        info!(path = %path, baud = NXP_BAUD_RATE, "Serial line opened");
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn buffered(&self) -> Result<usize, TransportError> {
        self.port
            .bytes_to_read()
            .map(|n| n as usize)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }
}

impl SerialLine for SerialPortLine {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let n = self
            .port
            .write(data)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
        self.port.flush()?;
        Ok(n)
    }

    fn read_exact_within(&mut self, buf: &mut [u8], wait: Duration) -> Result<(), TransportError> {
        if wait.is_zero() {
            // Poll only: never consume a partial frame.
            if self.buffered()? < buf.len() {
                return Err(TransportError::Timeout { wait });
            }
        }

        let deadline = Instant::now() + wait;
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() && !wait.is_zero() {
                return Err(TransportError::Timeout { wait });
            }
            self.port
                .set_timeout(remaining.max(Duration::from_millis(1)))
                .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => return Err(TransportError::Disconnected),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::TimedOut => {
                    debug!(filled, wanted = buf.len(), "Serial read timed out");
                    return Err(TransportError::Timeout { wait });
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))
    }
}

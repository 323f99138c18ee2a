//! ALPAR link: frame transmit and receive over a [`SerialLine`].
//!
//! The link knows nothing about card state. Intercepting unsolicited
//! frames is left to the caller.

use std::time::Duration;

use tracing::{debug, trace, warn};

use super::traits::SerialLine;
use crate::error::Result;
use crate::protocol::constants::{ALPAR_HEADER_LEN, ALPAR_WAIT, ALPAR_WAKE_UP_BYTE};
use crate::protocol::frame::{AlparFrame, FrameHeader};
use crate::protocol::status::ChipStatus;

/// Framed link to the reader chip.
pub struct AlparLink<L> {
    line: L,
}

impl<L: SerialLine> AlparLink<L> {
    pub fn new(line: L) -> Self {
        Self { line }
    }

    pub fn line(&self) -> &L {
        &self.line
    }

    /// Encode and write one frame. A partial write is an I/O error.
    pub fn send_frame(&mut self, frame: &AlparFrame) -> Result<()> {
        let bytes = frame.encode()?;
        trace!(cmd = %format!("0x{:02X}", frame.command), len = frame.payload.len(), "ALPAR TX");
        self.line.write_all_or_fail(&bytes)?;
        Ok(())
    }

    /// Nudge the chip before a command exchange.
    pub fn send_wake_up(&mut self) -> Result<()> {
        self.line.write_all_or_fail(&[ALPAR_WAKE_UP_BYTE])?;
        Ok(())
    }

    /// Drop any bytes still queued on the input side.
    pub fn discard_input(&mut self) -> Result<()> {
        self.line.discard_input()?;
        Ok(())
    }

    /// Receive one frame.
    ///
    /// `wait` bounds the arrival of the header. Once a header is in, the
    /// body is read with at least [`ALPAR_WAIT`] so a frame that starts
    /// arriving during a non-blocking drain is not torn.
    ///
    /// NACK frames are returned as frames; their status is logged here.
    pub fn receive_frame(&mut self, wait: Duration) -> Result<AlparFrame> {
        let mut raw_header = [0u8; ALPAR_HEADER_LEN];
        self.line.read_exact_within(&mut raw_header, wait)?;
        let header = FrameHeader::from_bytes(raw_header)?;

        let mut rest = vec![0u8; header.remaining_len()];
        self.line.read_exact_within(&mut rest, wait.max(ALPAR_WAIT))?;

        let frame = AlparFrame::from_parts(header, &raw_header, &rest)?;
        trace!(
            cmd = %format!("0x{:02X}", frame.command),
            len = frame.payload.len(),
            ack = frame.is_ack(),
            "ALPAR RX"
        );

        if let Some(status) = frame.status() {
            warn!(
                cmd = %format!("0x{:02X}", frame.command),
                status = %ChipStatus(status),
                "Chip rejected command"
            );
        } else if !frame.is_ack() {
            debug!(cmd = %format!("0x{:02X}", frame.command), "NACK without status byte");
        }

        Ok(frame)
    }
}

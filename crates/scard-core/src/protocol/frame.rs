//! ALPAR frame codec.
//!
//! Wire layout:
//!
//! ```text
//! +------+---------+---------+-----------------+----------+
//! | lead | len(hi) | len(lo) | command | data  | checksum |
//! +------+---------+---------+-----------------+----------+
//!   1B       2B big-endian       1B     len B      1B
//! ```
//!
//! `lead` is ACK (0x60) or NACK (0xE0); `checksum` is the XOR of every
//! preceding byte, so the XOR over a whole valid frame is zero.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use super::constants::{
    ALPAR_ACK, ALPAR_HEADER_LEN, ALPAR_MAX_PAYLOAD, ALPAR_NACK, CMD_CARD_ACTION, CMD_WAKE_UP,
};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Invalid lead byte 0x{0:02X}")]
    BadLeadByte(u8),
    #[error("Payload of {0} bytes exceeds {max}", max = ALPAR_MAX_PAYLOAD)]
    TooLarge(usize),
    #[error("Frame length mismatch: expected {expected}, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("Checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Checksum { expected: u8, actual: u8 },
}

/// Frame polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Ack,
    Nack,
}

impl FrameKind {
    pub fn lead_byte(self) -> u8 {
        match self {
            FrameKind::Ack => ALPAR_ACK,
            FrameKind::Nack => ALPAR_NACK,
        }
    }

    pub fn from_lead_byte(b: u8) -> Result<Self, FrameError> {
        match b {
            ALPAR_ACK => Ok(FrameKind::Ack),
            ALPAR_NACK => Ok(FrameKind::Nack),
            other => Err(FrameError::BadLeadByte(other)),
        }
    }
}

/// Running XOR of `bytes`.
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

/// Decoded frame header (first four bytes on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub length: u16,
    pub command: u8,
}

impl FrameHeader {
    pub const SIZE: usize = ALPAR_HEADER_LEN;

    pub fn from_bytes(data: [u8; ALPAR_HEADER_LEN]) -> Result<Self, FrameError> {
        let kind = FrameKind::from_lead_byte(data[0])?;
        let length = u16::from_be_bytes([data[1], data[2]]);
        if length as usize > ALPAR_MAX_PAYLOAD {
            return Err(FrameError::TooLarge(length as usize));
        }
        Ok(Self {
            kind,
            length,
            command: data[3],
        })
    }

    /// Bytes following the header: payload plus checksum.
    pub fn remaining_len(&self) -> usize {
        self.length as usize + 1
    }
}

/// One ALPAR frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlparFrame {
    pub kind: FrameKind,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl AlparFrame {
    /// Positive frame, as sent by the host and by the chip on success.
    pub fn ack(command: u8, payload: &[u8]) -> Self {
        Self {
            kind: FrameKind::Ack,
            command,
            payload: payload.to_vec(),
        }
    }

    /// Negative frame carrying a chip status byte.
    pub fn nack(command: u8, status: u8) -> Self {
        Self {
            kind: FrameKind::Nack,
            command,
            payload: vec![status],
        }
    }

    pub fn is_ack(&self) -> bool {
        self.kind == FrameKind::Ack
    }

    /// Status byte of a NACK frame.
    pub fn status(&self) -> Option<u8> {
        match self.kind {
            FrameKind::Nack => self.payload.first().copied(),
            FrameKind::Ack => None,
        }
    }

    /// Unsolicited card inserted/removed notification.
    pub fn card_action(&self) -> Option<bool> {
        (self.is_ack() && self.command == CMD_CARD_ACTION && self.payload.len() == 1)
            .then(|| self.payload[0] != 0)
    }

    /// Chip asking the host to echo the frame back.
    pub fn is_wake_up(&self) -> bool {
        self.is_ack() && self.command == CMD_WAKE_UP && self.payload == [0x01]
    }

    /// Serialize including the trailing checksum.
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > ALPAR_MAX_PAYLOAD {
            return Err(FrameError::TooLarge(self.payload.len()));
        }
        let mut buf = Vec::with_capacity(ALPAR_HEADER_LEN + self.payload.len() + 1);
        buf.push(self.kind.lead_byte());
        // Writing into a Vec cannot fail.
        let _ = buf.write_u16::<BigEndian>(self.payload.len() as u16);
        buf.push(self.command);
        buf.extend_from_slice(&self.payload);
        buf.push(lrc(&buf));
        Ok(buf)
    }

    /// Assemble a frame from a parsed header and the bytes that followed it.
    pub fn from_parts(header: FrameHeader, raw_header: &[u8], rest: &[u8]) -> Result<Self, FrameError> {
        if rest.len() != header.remaining_len() {
            return Err(FrameError::LengthMismatch {
                expected: header.remaining_len(),
                actual: rest.len(),
            });
        }
        let (payload, checksum) = rest.split_at(header.length as usize);
        let expected = lrc(raw_header) ^ lrc(payload);
        if expected != checksum[0] {
            return Err(FrameError::Checksum {
                expected,
                actual: checksum[0],
            });
        }
        Ok(Self {
            kind: header.kind,
            command: header.command,
            payload: payload.to_vec(),
        })
    }

    /// Decode one complete frame. `data` must hold exactly one frame.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < ALPAR_HEADER_LEN + 1 {
            return Err(FrameError::LengthMismatch {
                expected: ALPAR_HEADER_LEN + 1,
                actual: data.len(),
            });
        }
        let mut cursor = Cursor::new(data);
        let lead = cursor.read_u8().map_err(|_| FrameError::BadLeadByte(0))?;
        let kind = FrameKind::from_lead_byte(lead)?;
        let length = cursor
            .read_u16::<BigEndian>()
            .map_err(|_| FrameError::LengthMismatch {
                expected: ALPAR_HEADER_LEN,
                actual: data.len(),
            })?;
        if length as usize > ALPAR_MAX_PAYLOAD {
            return Err(FrameError::TooLarge(length as usize));
        }
        let header = FrameHeader {
            kind,
            length,
            command: data[3],
        };
        let (raw_header, rest) = data.split_at(ALPAR_HEADER_LEN);
        Self::from_parts(header, raw_header, rest)
    }
}

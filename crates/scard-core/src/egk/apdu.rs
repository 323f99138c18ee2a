//! APDU exchange and segmented READ BINARY on top of a [`CardBackend`].

use byteorder::{BigEndian, ByteOrder};
use tracing::{debug, trace};

use crate::backend::CardBackend;
use crate::error::{Error, Result};
use crate::session::APDU_SUCCESS;

/// Longest response fetched after a command.
const RESPONSE_LIMIT: usize = 0x1000;

/// Largest READ BINARY block requested at once.
pub const READ_BLOCK: usize = 0xFE;

pub use crate::session::REQUEST_ICC;

pub const SELECT_EGK_ROOT: [u8; 12] = [
    0x00, 0xA4, 0x04, 0x0C, 0x07, 0xD2, 0x76, 0x00, 0x01, 0x44, 0x80, 0x00,
];
pub const SELECT_DF_HCA: [u8; 11] = [
    0x00, 0xA4, 0x04, 0x0C, 0x06, 0xD2, 0x76, 0x00, 0x00, 0x01, 0x02,
];
pub const READ_EF_GDO: [u8; 5] = [0x00, 0xB0, 0x82, 0x00, 0x00];
pub const READ_EF_ATR: [u8; 5] = [0x00, 0xB0, 0x9D, 0x00, 0x00];

/// How a transparent file announces the extent of its content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Two-byte big-endian length, content follows it.
    LengthPrefixed,
    /// Four bytes `{start, end}`, content spans `start..=end`.
    OffsetPrefixed,
}

impl ReadMode {
    fn header_len(self) -> usize {
        match self {
            ReadMode::LengthPrefixed => 2,
            ReadMode::OffsetPrefixed => 4,
        }
    }
}

/// Send `apdu` and return the response payload without its `90 00`.
pub fn command(card: &dyn CardBackend, apdu: &[u8]) -> Result<Vec<u8>> {
    let written = card.write(0, apdu)?;
    if written != apdu.len() {
        return Err(Error::Io(format!(
            "short APDU write ({written} of {})",
            apdu.len()
        )));
    }

    let mut response = card.read(0, RESPONSE_LIMIT)?;
    let Some(n) = response.len().checked_sub(APDU_SUCCESS.len()) else {
        return Err(Error::Protocol);
    };
    if response[n..] != APDU_SUCCESS {
        let status = BigEndian::read_u16(&response[n..]);
        trace!(apdu = %hex::encode_upper(apdu), status = %format!("{status:04X}"), "APDU refused");
        return Err(Error::RemoteIo { status });
    }
    response.truncate(n);
    Ok(response)
}

fn read_binary(p1: u8, p2: u8, le: u8) -> [u8; 5] {
    [0x00, 0xB0, p1, p2, le]
}

/// Read a transparent file selected by its short id.
///
/// Stops once the announced content is in or `capacity` bytes have been
/// collected, whichever comes first.
pub fn read_file(
    card: &dyn CardBackend,
    short_id: u8,
    mode: ReadMode,
    capacity: usize,
) -> Result<Vec<u8>> {
    let header_len = mode.header_len();
    let header = command(card, &read_binary(0x80 | short_id, 0, header_len as u8))?;
    if header.len() != header_len {
        debug!(short_id, got = header.len(), "Short file header");
        return Err(Error::Protocol);
    }

    let (mut pos, end) = match mode {
        ReadMode::LengthPrefixed => {
            let len = usize::from(BigEndian::read_u16(&header));
            (header_len, header_len + len)
        }
        ReadMode::OffsetPrefixed => (
            usize::from(BigEndian::read_u16(&header[0..2])),
            usize::from(BigEndian::read_u16(&header[2..4])) + 1,
        ),
    };
    debug!(short_id, ?mode, start = pos, end, "Reading file");

    let mut data = Vec::with_capacity(end.saturating_sub(pos).min(capacity));
    while pos < end && data.len() < capacity {
        let block = (end - pos).min(READ_BLOCK).min(capacity - data.len());
        let [p1, p2] = u16::try_from(pos)
            .map_err(|_| Error::Protocol)?
            .to_be_bytes();
        let chunk = command(card, &read_binary(p1, p2, block as u8))?;
        if chunk.is_empty() {
            return Err(Error::Protocol);
        }
        let take = chunk.len().min(capacity - data.len());
        data.extend_from_slice(&chunk[..take]);
        pos += chunk.len();
    }
    Ok(data)
}

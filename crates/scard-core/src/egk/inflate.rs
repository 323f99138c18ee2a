//! Gzip member decoding for compressed card files.
//!
//! Only the fixed header written by the card personalisation is accepted:
//! deflate, no flags, no optional fields.

use byteorder::{ByteOrder, LittleEndian};
use miniz_oxide::inflate::stream::{InflateState, inflate};
use miniz_oxide::{DataFormat, MZFlush, MZStatus};
use thiserror::Error;

use crate::error::Error;

pub const GZIP_HEADER_LEN: usize = 10;
pub const GZIP_FOOTER_LEN: usize = 8;

/// Largest decompressed document accepted.
pub const INFLATE_LIMIT: usize = 0xFFF;

const GZIP_MAGIC: [u8; 4] = [0x1F, 0x8B, 0x08, 0x00];
/// Offset of the extra-flags byte, required to be zero.
const GZIP_XFL: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InflateError {
    #[error("Input of {0} bytes is too short")]
    TooShort(usize),
    #[error("Unsupported gzip header")]
    BadHeader,
    #[error("Deflate stream failed: {0}")]
    Stream(String),
    #[error("Missing gzip footer ({0} bytes left)")]
    MissingFooter(usize),
    #[error("CRC mismatch: expected 0x{expected:08X}, got 0x{actual:08X}")]
    Crc { expected: u32, actual: u32 },
    #[error("Length mismatch: expected {expected}, got {actual}")]
    Length { expected: u32, actual: usize },
}

impl From<InflateError> for Error {
    fn from(e: InflateError) -> Self {
        Error::Io(e.to_string())
    }
}

/// Decompress a gzip member and check its CRC32 and length.
pub fn inflate_checked(src: &[u8]) -> Result<Vec<u8>, InflateError> {
    if src.len() < GZIP_HEADER_LEN + GZIP_FOOTER_LEN {
        return Err(InflateError::TooShort(src.len()));
    }
    if src[..GZIP_MAGIC.len()] != GZIP_MAGIC || src[GZIP_XFL] != 0 {
        return Err(InflateError::BadHeader);
    }

    let body = &src[GZIP_HEADER_LEN..];
    let mut out = vec![0u8; INFLATE_LIMIT];
    let mut state = InflateState::new_boxed(DataFormat::Raw);
    let result = inflate(&mut state, body, &mut out, MZFlush::Finish);
    match result.status {
        Ok(MZStatus::StreamEnd) => {}
        Ok(status) => return Err(InflateError::Stream(format!("{status:?}"))),
        Err(e) => return Err(InflateError::Stream(format!("{e:?}"))),
    }
    out.truncate(result.bytes_written);

    let footer = &body[result.bytes_consumed..];
    if footer.len() < GZIP_FOOTER_LEN {
        return Err(InflateError::MissingFooter(footer.len()));
    }

    let expected = LittleEndian::read_u32(&footer[0..4]);
    let actual = crc32fast::hash(&out);
    if expected != actual {
        return Err(InflateError::Crc { expected, actual });
    }
    let expected = LittleEndian::read_u32(&footer[4..8]);
    if expected as usize != out.len() {
        return Err(InflateError::Length {
            expected,
            actual: out.len(),
        });
    }
    Ok(out)
}

/// Build a gzip member the way the card stores it.
#[cfg(test)]
pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
    let mut out = vec![0x1F, 0x8B, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0x03];
    out.extend(miniz_oxide::deflate::compress_to_vec(data, 6));
    out.extend_from_slice(&crc32fast::hash(data).to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out
}

//! Reader-side command helpers for PC/SC readers.
//!
//! PC/SC readers do not understand the CT-BCS commands (class byte `0x20`)
//! that callers send to NXP readers, so they are answered locally. Memory
//! cards are read through the ACR38-style pseudo APDUs below.

use crate::error::{Error, Result};
use crate::session::APDU_SUCCESS;

/// Class byte of CT-BCS commands.
pub const CTBCS_CLASS: u8 = 0x20;

/// CT-BCS answer: command not executed.
pub const SW_UNSUCCESSFUL: [u8; 2] = [0x64, 0x00];
/// CT-BCS answer: no card in the slot.
pub const SW_NO_CARD: [u8; 2] = [0x62, 0x00];

/// Select memory card type 1 (I2C cards up to 16 kbit).
pub const SELECT_MEMORY_CARD: [u8; 6] = [0xFF, 0xA4, 0x00, 0x00, 0x01, 0x01];

/// ATR reported by readers for memory cards.
const MEMORY_CARD_ATR: [u8; 2] = [0x3B, 0x00];

/// CT-BCS command decoded from an APDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtbcsCommand {
    /// `20 11`: reset the terminal (and card).
    ResetCt,
    /// `20 12`: request the card; P2 = 1 asks for the ATR in the answer.
    RequestIcc { with_atr: bool },
    /// `20 15`: eject the card.
    EjectIcc,
    Other(u8),
}

impl CtbcsCommand {
    /// Decode `apdu` if it is a CT-BCS command.
    ///
    /// Returns `None` for ordinary card APDUs.
    pub fn parse(apdu: &[u8]) -> Option<Result<Self>> {
        if apdu.first() != Some(&CTBCS_CLASS) {
            return None;
        }
        let Some(&ins) = apdu.get(1) else {
            return Some(Err(Error::InvalidArgument));
        };
        Some(Ok(match ins {
            0x11 => CtbcsCommand::ResetCt,
            0x12 => CtbcsCommand::RequestIcc {
                with_atr: apdu.get(3) == Some(&0x01),
            },
            0x15 => CtbcsCommand::EjectIcc,
            other => CtbcsCommand::Other(other),
        }))
    }
}

/// Answer to Request ICC for the card currently in the slot.
pub fn request_icc_response(atr: &[u8], with_atr: bool) -> Vec<u8> {
    if atr.is_empty() {
        return SW_NO_CARD.to_vec();
    }
    let mut response = Vec::with_capacity(atr.len() + APDU_SUCCESS.len());
    if with_atr {
        response.extend_from_slice(atr);
    }
    response.extend_from_slice(&APDU_SUCCESS);
    response
}

/// Memory card READ: at most 255 bytes per command.
pub fn memory_card_read_apdu(offset: u16, len: usize) -> [u8; 5] {
    let [hi, lo] = offset.to_be_bytes();
    [0xFF, 0xB0, hi, lo, len.min(0xFF) as u8]
}

/// Whether readers use the raw protocol for this ATR.
pub fn is_memory_card_atr(atr: &[u8]) -> bool {
    atr == MEMORY_CARD_ATR
}

/// Split off a `90 00` trailer, failing on any other status.
pub fn strip_success(response: &[u8]) -> Result<&[u8]> {
    match response.len().checked_sub(APDU_SUCCESS.len()) {
        Some(n) if response[n..] == APDU_SUCCESS => Ok(&response[..n]),
        _ => Err(Error::Io(format!(
            "memory card answered {}",
            hex::encode_upper(response)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::REQUEST_ICC;

    #[test]
    fn test_parse_ctbcs() {
        assert_eq!(
            CtbcsCommand::parse(&REQUEST_ICC),
            Some(Ok(CtbcsCommand::RequestIcc { with_atr: true }))
        );
        assert_eq!(
            CtbcsCommand::parse(&[0x20, 0x12, 0x01, 0x00, 0x00]),
            Some(Ok(CtbcsCommand::RequestIcc { with_atr: false }))
        );
        assert_eq!(CtbcsCommand::parse(&[0x20, 0x11, 0x01, 0x00]), Some(Ok(CtbcsCommand::ResetCt)));
        assert_eq!(CtbcsCommand::parse(&[0x20, 0x15, 0x01, 0x00]), Some(Ok(CtbcsCommand::EjectIcc)));
        assert_eq!(CtbcsCommand::parse(&[0x20, 0x13]), Some(Ok(CtbcsCommand::Other(0x13))));
        assert_eq!(CtbcsCommand::parse(&[0x20]), Some(Err(Error::InvalidArgument)));
        assert_eq!(CtbcsCommand::parse(&[0x00, 0xB0, 0x00, 0x00, 0x02]), None);
    }

    #[test]
    fn test_request_icc_response() {
        let atr = [0x3B, 0x8F];
        assert_eq!(request_icc_response(&atr, true), vec![0x3B, 0x8F, 0x90, 0x00]);
        assert_eq!(request_icc_response(&atr, false), vec![0x90, 0x00]);
        assert_eq!(request_icc_response(&[], true), SW_NO_CARD.to_vec());
    }

    #[test]
    fn test_memory_card_helpers() {
        assert_eq!(memory_card_read_apdu(0x0123, 600), [0xFF, 0xB0, 0x01, 0x23, 0xFF]);
        assert_eq!(memory_card_read_apdu(0x10, 16), [0xFF, 0xB0, 0x00, 0x10, 0x10]);
        assert!(is_memory_card_atr(&[0x3B, 0x00]));
        assert!(!is_memory_card_atr(&[0x3B, 0x00, 0x00]));
    }

    #[test]
    fn test_strip_success() {
        assert_eq!(strip_success(&[1, 2, 0x90, 0x00]).unwrap(), &[1, 2]);
        assert!(strip_success(&[0x6A, 0x82]).is_err());
        assert!(strip_success(&[0x90]).is_err());
    }
}

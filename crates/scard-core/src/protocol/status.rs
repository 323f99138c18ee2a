//! Chip status codes carried in the first payload byte of a NACK frame.
//!
//! Purely diagnostic: the description is logged, never returned.

use std::fmt;

/// Status byte reported by the reader chip.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ChipStatus(pub u8);

const STATUS_TABLE: &[(u8, &str)] = &[
    (0x08, "Length of the data buffer too short"),
    (0x20, "Wrong APDU"),
    (0x21, "Too short APDU"),
    (0x22, "Card mute now (during T=1 exchange)"),
    (0x24, "Bad NAD"),
    (0x26, "Resynchronized"),
    (0x27, "Chain aborted"),
    (0x29, "Overflow from card"),
    (0x30, "Non negotiable mode (TA2 present)"),
    (0x31, "Protocol is neither T=0 nor T=1 (negotiate command)"),
    (0x32, "T=1 is not accepted (negotiate command)"),
    (0x33, "PPS answer is different from PPS request"),
    (0x34, "Error on PCK (negotiate command)"),
    (0x35, "Bad parameter in command"),
    (0x38, "TB3 absent"),
    (0x39, "PPS not accepted (no answer from card)"),
    (0x3B, "Early answer of the card during the activation"),
    (0x40, "Card deactivated"),
    (0x55, "Unknown command"),
    (0x80, "Card mute (after power on)"),
    (0x81, "Time out (waiting time exceeded)"),
    (0x83, "5 parity errors in reception"),
    (0x84, "5 parity errors in transmission"),
    (0x86, "Bad FiDi"),
    (0x88, "ATR duration greater than 19200 etus (E.M.V.)"),
    (0x89, "CWI not supported (E.M.V.)"),
    (0x8A, "BWI not supported (E.M.V.)"),
    (0x8B, "WI (work waiting time) not supported (E.M.V.)"),
    (0x8C, "TC3 not accepted (E.M.V.)"),
    (0x8D, "Parity error during ATR"),
    (0x92, "Specific mode byte TA2 with b5 byte=1"),
    (0x93, "TB1 absent during a cold reset (E.M.V.)"),
    (0x94, "TB1 different from 00 during a cold reset (E.M.V.)"),
    (0x95, "IFSC<10H or IFSC=FFH"),
    (0x96, "Wrong TDi"),
    (0x97, "TB2 is present in the ATR (E.M.V.)"),
    (0x98, "TC1 is not compatible with CWT"),
    (0x99, "IFSD not accepted"),
    (0x9B, "Not T=1 card"),
    (0xA0, "Procedure byte error"),
    (0xB0, "Writing attempt in a protected byte (S9 cards)"),
    (0xB1, "Pin code error (S9 cards)"),
    (0xB2, "Writing error (S9 cards)"),
    (0xB3, "Too much data requested in a reading operation (S9 cards)"),
    (0xB4, "Error counter protected (S9 cards)"),
    (0xB5, "Writing attempt without pin code verification (S9 cards)"),
    (0xB6, "Protected bit already set (S9 cards)"),
    (0xB7, "Verify pin code error (S9 cards)"),
    (0xC0, "Card absent"),
    (0xC1, "I/O line locked while accessing an I2C or S10 card"),
    (0xC3, "Checksum error"),
    (0xC6, "ATR not supported"),
    (0xCC, "No acknowledge from the I2C synchronous card"),
    (0xCD, "Generic error during an exchange with an I2C synchronous card"),
    (0xE1, "Card clock frequency not accepted"),
    (0xE2, "UART overflow"),
    (0xE3, "Supply voltage drop-off"),
    (0xE4, "Temperature alarm"),
    (0xE5, "Card deactivated"),
    (0xE9, "Framing error"),
    (0xF0, "Serial LRC error"),
    (0xF1, "At least one command frame has been lost"),
    (0xFF, "Serial time out"),
];

impl ChipStatus {
    /// Human readable description.
    pub fn description(&self) -> &'static str {
        STATUS_TABLE
            .binary_search_by_key(&self.0, |&(code, _)| code)
            .map(|idx| STATUS_TABLE[idx].1)
            .unwrap_or("Unknown error")
    }
}

impl fmt::Debug for ChipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChipStatus(0x{:02X} '{}')", self.0, self.description())
    }
}

impl fmt::Display for ChipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02X} ({})", self.0, self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_sorted_for_binary_search() {
        assert!(STATUS_TABLE.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_known_status() {
        assert_eq!(ChipStatus(0x86).description(), "Bad FiDi");
        assert_eq!(ChipStatus(0xC0).description(), "Card absent");
        assert_eq!(ChipStatus(0xFF).to_string(), "0xFF (Serial time out)");
    }

    #[test]
    fn test_unknown_status() {
        assert_eq!(ChipStatus(0x01).description(), "Unknown error");
    }
}

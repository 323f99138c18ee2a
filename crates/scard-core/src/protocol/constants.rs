//! Protocol constants for the NXP TDA8029 ALPAR serial protocol.
//!
//! Derived from NXP application note AN10207.

use std::time::Duration;

// ============================================================================
// Framing
// ============================================================================

/// Lead byte of a positive frame.
pub const ALPAR_ACK: u8 = 0x60;
/// Lead byte of a negative frame (chip reports an error status).
pub const ALPAR_NACK: u8 = 0xE0;

/// Maximum payload of a single frame.
pub const ALPAR_MAX_PAYLOAD: usize = 506;
/// Lead byte + 16-bit length + command byte.
pub const ALPAR_HEADER_LEN: usize = 4;
/// Largest possible frame on the wire (header + payload + checksum).
pub const ALPAR_MAX_FRAME: usize = ALPAR_HEADER_LEN + ALPAR_MAX_PAYLOAD + 1;

/// Single byte sent to wake the chip before a command.
pub const ALPAR_WAKE_UP_BYTE: u8 = 0xAA;

// ============================================================================
// Timing
// ============================================================================

/// Bounded wait for a command reply.
pub const ALPAR_WAIT: Duration = Duration::from_millis(1000);

/// Non-blocking wait used while draining unsolicited frames.
pub const ALPAR_NO_WAIT: Duration = Duration::ZERO;

/// Period of the background scanner.
pub const NXP_SCAN_PERIOD: Duration = Duration::from_millis(100);

/// Line speed of the reader chip.
pub const NXP_BAUD_RATE: u32 = 38_400;

/// Device used when the configuration does not name one.
pub const NXP_FALLBACK_DEVICE: &str = "/dev/ttyUSB0";

// ============================================================================
// Host -> chip commands
// ============================================================================

/// Forward an APDU to the card.
pub const CMD_CARD_COMMAND: u8 = 0x00;
/// Query card presence.
pub const CMD_CHECK_PRESENT: u8 = 0x09;
/// Change the card baud rate.
pub const CMD_SET_BAUD: u8 = 0x0B;
/// Read from an I2C memory card (1-byte address range).
pub const CMD_READ_I2C: u8 = 0x12;
/// Read from an I2C memory card (extended address range).
pub const CMD_READ_I2C_EXT: u8 = 0x13;
/// Activate an ISO 7816 card; reply carries the ATR.
pub const CMD_POWER_UP_ISO: u8 = 0x69;
/// Activate an I2C memory card.
pub const CMD_POWER_UP_I2C: u8 = 0x6C;
/// Query negotiated card parameters; byte 2 of the reply is the protocol.
pub const CMD_GET_CARD_PARAM: u8 = 0xA6;

// ============================================================================
// Chip -> host unsolicited frames
// ============================================================================

/// Card inserted/removed notification, payload `[inserted]`.
pub const CMD_CARD_ACTION: u8 = 0xA0;
/// Chip wake-up request, payload `[0x01]`, must be echoed back.
pub const CMD_WAKE_UP: u8 = 0xBB;

// ============================================================================
// Status codes and retry policy
// ============================================================================

/// NACK status reported when FiDi negotiation fails during ISO power-up.
pub const STATUS_BAD_FIDI: u8 = 0x86;

/// Power-up attempts while the chip keeps reporting bad FiDi.
pub const POWER_UP_ATTEMPTS: usize = 3;

/// Slave address used for I2C memory card reads through the chip.
pub const I2C_CARD_ADDRESS: u8 = 0xA0;

//! Card session - presence and type state attached to a reader.
//!
//! Pure state; the insertion handshake that fills it in lives with the
//! backend that owns the wire. Callers mutate a session only while holding
//! the lock that also guards the reader.

use std::fmt;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::events::CardEvent;
use crate::protocol::constants::ALPAR_MAX_PAYLOAD;

/// Success trailer of an APDU response.
pub const APDU_SUCCESS: [u8; 2] = [0x90, 0x00];

/// CT-BCS Request ICC, asking for the ATR of the inserted card.
pub const REQUEST_ICC: [u8; 6] = [0x20, 0x12, 0x01, 0x01, 0x01, 0x01];

/// Detected card kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CardType {
    #[default]
    Unknown,
    T0,
    T1,
    I2c,
}

impl CardType {
    /// Processor card speaking an ISO 7816 transmission protocol.
    pub fn is_iso(self) -> bool {
        matches!(self, CardType::T0 | CardType::T1)
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardType::Unknown => write!(f, "unknown"),
            CardType::T0 => write!(f, "T=0"),
            CardType::T1 => write!(f, "T=1"),
            CardType::I2c => write!(f, "I2C"),
        }
    }
}

/// Outcome of a finished insertion handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    /// ISO power-up succeeded with this ATR; protocol may still be unknown.
    Iso { atr: Vec<u8>, card_type: CardType },
    /// I2C power-up succeeded.
    I2c,
    /// Nothing answered.
    Unrecognized,
}

/// Last APDU response, filled by `write` and consumed by `read`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CachedResponse {
    #[default]
    Empty,
    Data(Vec<u8>),
    Failed(Error),
}

impl CachedResponse {
    /// Copy up to `len` bytes starting at `offset`.
    ///
    /// Offsets past the end yield an empty slice. A cached failure is
    /// replayed.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        match self {
            CachedResponse::Empty => Ok(Vec::new()),
            CachedResponse::Failed(e) => Err(e.clone()),
            CachedResponse::Data(data) => {
                let start = offset.min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(data[start..end].to_vec())
            }
        }
    }
}

/// Presence/type state machine of one reader slot.
#[derive(Debug, Default)]
pub struct CardSession {
    card_type: CardType,
    atr: Vec<u8>,
    present: bool,
    response: CachedResponse,
}

impl CardSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Cached ATR; empty while no card is classified.
    pub fn atr(&self) -> &[u8] {
        &self.atr
    }

    /// Whether an `Inserted` event has been emitted for the current card.
    pub fn is_present(&self) -> bool {
        self.present
    }

    pub fn response(&self) -> &CachedResponse {
        &self.response
    }

    pub fn set_response(&mut self, response: CachedResponse) {
        self.response = response;
    }

    /// A new insertion handshake should run.
    ///
    /// False while a card is already reported present, so repeated
    /// notifications for the same insertion are ignored.
    pub fn wants_insertion(&self) -> bool {
        !self.present
    }

    /// Apply a finished handshake.
    ///
    /// Yields `Inserted` only if no card was reported present yet; a
    /// repeated handshake for the same card just reclassifies it.
    pub fn on_inserted(&mut self, outcome: Insertion) -> Option<CardEvent> {
        self.card_type = CardType::Unknown;
        self.atr.clear();
        match outcome {
            Insertion::Iso { atr, card_type } => {
                self.atr = atr;
                self.atr.truncate(ALPAR_MAX_PAYLOAD);
                self.card_type = card_type;
                self.response = CachedResponse::Data(self.atr.clone());
            }
            Insertion::I2c => {
                self.card_type = CardType::I2c;
                self.response = CachedResponse::Empty;
            }
            Insertion::Unrecognized => {
                self.response = CachedResponse::Empty;
            }
        }
        if std::mem::replace(&mut self.present, true) {
            debug!(card_type = %self.card_type, "Present card reclassified");
            return None;
        }
        info!(card_type = %self.card_type, atr_len = self.atr.len(), "Card inserted");
        Some(CardEvent::Inserted)
    }

    /// Removal: forget everything about the card.
    ///
    /// Yields `Removed` only if a card had been reported present.
    pub fn on_removed(&mut self) -> Option<CardEvent> {
        self.card_type = CardType::Unknown;
        self.atr.clear();
        self.response = CachedResponse::Empty;
        if std::mem::take(&mut self.present) {
            info!("Card removed");
            Some(CardEvent::Removed)
        } else {
            debug!("Removal notification without a present card");
            None
        }
    }

    /// Synthesized reply to the Request ICC command: `ATR ++ 90 00`.
    pub fn atr_response(&self) -> Option<Vec<u8>> {
        if self.atr.is_empty() {
            return None;
        }
        let keep = self.atr.len().min(ALPAR_MAX_PAYLOAD - APDU_SUCCESS.len());
        let mut data = self.atr[..keep].to_vec();
        data.extend_from_slice(&APDU_SUCCESS);
        Some(data)
    }
}

//! scard-core: smartcard subsystem in Rust.
//!
//! Drives an NXP TDA8029 reader chip over its ALPAR serial protocol, falls
//! back to PC/SC readers or I2C memory cards, and reads the personal and
//! insurance data of German health insurance cards (eGK).
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: ALPAR constants, frame codec, chip status table
//! - **Transport**: serial line abstraction (serialport, mock) and the
//!   ALPAR link built on it
//! - **Session**: card presence/type state and the cached APDU response
//! - **Scanner**: background thread observing card transitions
//! - **Backend**: NXP, PC/SC and I2C backends behind the [`Smartcard`]
//!   facade
//! - **eGK**: APDU file reads, gzip and XML decoding into a
//!   [`HealthCardRecord`]
//! - **Events**: sink trait for inserted/removed notifications
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use scard_core::{Config, Smartcard, TracingSink};
//!
//! let config = Config::load_from_file("/etc/scard.toml")?;
//! let card = Smartcard::create(&config, Arc::new(TracingSink))?;
//! for (key, value) in card.read_info()?.iter() {
//!     println!("{key}={}", value.unwrap_or(""));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backend;
pub mod config;
pub mod egk;
pub mod error;
pub mod events;
pub mod protocol;
pub mod scanner;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use backend::{Backend, CardBackend, Smartcard};
pub use config::{Config, ConfigError, SmartcardConfig};
pub use egk::HealthCardRecord;
pub use error::{Error, Result};
pub use events::{CardEvent, ChannelSink, Event, EventSink, NullSink, TracingSink};
pub use protocol::{AlparFrame, FrameError, FrameKind};
pub use session::CardType;
pub use transport::{MockLine, SerialLine, SerialPortLine, TransportError};

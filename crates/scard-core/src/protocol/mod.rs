//! Protocol module - ALPAR serial protocol definitions.

pub mod constants;
pub mod frame;
pub mod status;

pub use constants::*;
pub use frame::{AlparFrame, FrameError, FrameHeader, FrameKind, lrc};
pub use status::ChipStatus;

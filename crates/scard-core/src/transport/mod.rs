//! Transport layer module.

pub mod alpar;
pub mod mock;
pub mod serial;
pub mod traits;

pub use alpar::AlparLink;
pub use mock::MockLine;
pub use serial::SerialPortLine;
pub use traits::{SerialLine, TransportError};

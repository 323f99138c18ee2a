//! I2C EEPROM memory card wired straight to an I2C bus.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::CardBackend;
use crate::error::{Error, Result};
use crate::protocol::constants::ALPAR_MAX_PAYLOAD;
use crate::session::CardType;
use crate::transport::TransportError;

/// EEPROM page size; a write never crosses a page.
pub const I2C_PAGE_SIZE: usize = 16;
/// Internal write cycle of the EEPROM.
pub const I2C_WRITE_CYCLE: Duration = Duration::from_millis(5);

/// Addressed access to one I2C slave.
pub trait I2cBus: Send {
    /// Send `addr` followed by `data` in one transfer.
    fn write_at(&mut self, addr: &[u8], data: &[u8]) -> Result<(), TransportError>;
    /// Set the address pointer to `addr`, then fill `buf`.
    fn read_at(&mut self, addr: &[u8], buf: &mut [u8]) -> Result<(), TransportError>;
}

/// Address bytes for `offset`: one byte below 256, two otherwise.
fn address_bytes(offset: u16) -> Vec<u8> {
    match u8::try_from(offset) {
        Ok(low) => vec![low],
        Err(_) => offset.to_be_bytes().to_vec(),
    }
}

/// Memory card backend over an [`I2cBus`].
pub struct I2cBackend<B> {
    bus: Mutex<B>,
}

impl<B: I2cBus> I2cBackend<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus: Mutex::new(bus),
        }
    }

    fn check_range(offset: usize, len: usize) -> Result<u16> {
        let end = offset.checked_add(len).ok_or(Error::InvalidArgument)?;
        if end > usize::from(u16::MAX) + 1 {
            return Err(Error::InvalidArgument);
        }
        u16::try_from(offset).map_err(|_| Error::InvalidArgument)
    }
}

impl<B: I2cBus> CardBackend for I2cBackend<B> {
    fn card_type(&self) -> Result<CardType> {
        Ok(CardType::I2c)
    }

    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let len = len.min(ALPAR_MAX_PAYLOAD);
        let start = Self::check_range(offset, len)?;
        let mut data = vec![0u8; len];
        self.bus.lock().read_at(&address_bytes(start), &mut data)?;
        trace!(offset, len, "I2C read");
        Ok(data)
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<usize> {
        Self::check_range(offset, data.len())?;
        let mut bus = self.bus.lock();
        let mut pos = 0;
        while pos < data.len() {
            let addr = offset + pos;
            let room = I2C_PAGE_SIZE - addr % I2C_PAGE_SIZE;
            let chunk = &data[pos..data.len().min(pos + room)];
            bus.write_at(&address_bytes(addr as u16), chunk)?;
            thread::sleep(I2C_WRITE_CYCLE);
            pos += chunk.len();
        }
        debug!(offset, len = data.len(), "I2C write");
        Ok(data.len())
    }
}

/// In-memory EEPROM answering like a real card.
///
/// Clones share the same image.
#[derive(Clone, Default)]
pub struct MockI2cBus {
    image: Arc<Mutex<BTreeMap<u16, u8>>>,
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockI2cBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_image(data: &[u8]) -> Self {
        let bus = Self::new();
        bus.image
            .lock()
            .extend(data.iter().enumerate().map(|(i, b)| (i as u16, *b)));
        bus
    }

    /// Byte at `addr`; unwritten cells read as 0xFF.
    pub fn byte(&self, addr: u16) -> u8 {
        self.image.lock().get(&addr).copied().unwrap_or(0xFF)
    }

    /// Raw bus writes, address bytes included.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().clone()
    }
}

impl I2cBus for MockI2cBus {
    fn write_at(&mut self, addr: &[u8], data: &[u8]) -> Result<(), TransportError> {
        let mut logged = addr.to_vec();
        logged.extend_from_slice(data);
        self.writes.lock().push(logged);
        let start = decode_address(addr)?;
        let mut image = self.image.lock();
        for (i, b) in data.iter().enumerate() {
            image.insert(start.wrapping_add(i as u16), *b);
        }
        Ok(())
    }

    fn read_at(&mut self, addr: &[u8], buf: &mut [u8]) -> Result<(), TransportError> {
        self.writes.lock().push(addr.to_vec());
        let start = decode_address(addr)?;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = self.byte(start.wrapping_add(i as u16));
        }
        Ok(())
    }
}

fn decode_address(addr: &[u8]) -> Result<u16, TransportError> {
    match addr {
        [low] => Ok(u16::from(*low)),
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(TransportError::WriteFailed(format!(
            "bad I2C address of {} bytes",
            addr.len()
        ))),
    }
}

#[cfg(feature = "i2c")]
mod linux {
    use i2cdev::core::I2CDevice;
    use i2cdev::linux::LinuxI2CDevice;
    use tracing::{info, instrument};

    use super::{I2cBackend, I2cBus};
    use crate::config::I2cAddress;
    use crate::error::Result;
    use crate::transport::TransportError;

    /// `/dev/i2c-N` slave through the Linux i2c-dev interface.
    pub struct LinuxI2cBus {
        dev: LinuxI2CDevice,
    }

    impl LinuxI2cBus {
        pub fn open(address: &I2cAddress) -> Result<Self, TransportError> {
            let dev = LinuxI2CDevice::new(&address.path, address.slave)
                .map_err(|e| TransportError::OpenFailed(format!("{}: {e}", address.path)))?;
            Ok(Self { dev })
        }
    }

    impl I2cBus for LinuxI2cBus {
        fn write_at(&mut self, addr: &[u8], data: &[u8]) -> Result<(), TransportError> {
            let mut frame = Vec::with_capacity(addr.len() + data.len());
            frame.extend_from_slice(addr);
            frame.extend_from_slice(data);
            self.dev
                .write(&frame)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))
        }

        fn read_at(&mut self, addr: &[u8], buf: &mut [u8]) -> Result<(), TransportError> {
            self.dev
                .write(addr)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))?;
            self.dev
                .read(buf)
                .map_err(|e| TransportError::ReadFailed(e.to_string()))
        }
    }

    impl I2cBackend<LinuxI2cBus> {
        #[instrument(level = "info")]
        pub fn open(address: &I2cAddress) -> Result<Self> {
            let bus = LinuxI2cBus::open(address)?;
            info!(path = %address.path, slave = %format!("0x{:02X}", address.slave), "I2C card opened");
            Ok(Self::new(bus))
        }
    }
}

#[cfg(feature = "i2c")]
pub use linux::LinuxI2cBus;

//! Smartcard backends and the facade selecting one of them.
//!
//! [`Smartcard::create`] tries the NXP serial reader first, then a PC/SC
//! reader and an I2C memory card when those features are built in. The
//! first backend that opens stays active for the lifetime of the handle.

pub mod ctbcs;
pub mod i2c;
pub mod nxp;
#[cfg(feature = "pcsc")]
pub mod pcsc;

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::egk::{self, HealthCardRecord};
use crate::error::{Error, Result};
use crate::events::EventSink;
use crate::session::CardType;

#[cfg(feature = "i2c")]
pub use i2c::LinuxI2cBus;
pub use i2c::{I2cBackend, I2cBus, MockI2cBus};
pub use nxp::NxpBackend;
#[cfg(feature = "pcsc")]
pub use pcsc::PcscBackend;

/// Operations every backend provides.
///
/// `read` and `write` follow the reader's semantics: for processor cards a
/// `write` sends an APDU and the next `read` returns a slice of its
/// response, for memory cards both address the card's storage.
pub trait CardBackend: Send + Sync {
    fn card_type(&self) -> Result<CardType>;
    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>>;
    fn write(&self, offset: usize, data: &[u8]) -> Result<usize>;
}

/// The active backend of a [`Smartcard`].
pub enum Backend {
    Nxp(NxpBackend),
    #[cfg(feature = "pcsc")]
    Pcsc(PcscBackend),
    #[cfg(feature = "i2c")]
    I2c(I2cBackend<LinuxI2cBus>),
    /// Caller-supplied backend, e.g. a simulator.
    Custom(Box<dyn CardBackend>),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Nxp(_) => "nxp",
            #[cfg(feature = "pcsc")]
            Backend::Pcsc(_) => "pcsc",
            #[cfg(feature = "i2c")]
            Backend::I2c(_) => "i2c",
            Backend::Custom(_) => "custom",
        }
    }

    fn as_dyn(&self) -> &dyn CardBackend {
        match self {
            Backend::Nxp(b) => b,
            #[cfg(feature = "pcsc")]
            Backend::Pcsc(b) => b,
            #[cfg(feature = "i2c")]
            Backend::I2c(b) => b,
            Backend::Custom(b) => b.as_ref(),
        }
    }

    /// Stop background threads. Idempotent.
    pub fn close(&mut self) {
        match self {
            Backend::Nxp(b) => b.close(),
            #[cfg(feature = "pcsc")]
            Backend::Pcsc(b) => b.close(),
            #[cfg(feature = "i2c")]
            Backend::I2c(_) => {}
            Backend::Custom(_) => {}
        }
    }
}

impl CardBackend for Backend {
    fn card_type(&self) -> Result<CardType> {
        self.as_dyn().card_type()
    }

    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.as_dyn().read(offset, len)
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<usize> {
        self.as_dyn().write(offset, data)
    }
}

/// Smartcard handle owning exactly one backend until freed.
pub struct Smartcard {
    backend: Option<Backend>,
}

impl Smartcard {
    /// Open the first backend that answers.
    #[instrument(level = "info", skip_all)]
    pub fn create(config: &Config, sink: Arc<dyn EventSink>) -> Result<Self> {
        if config.smartcard.is_none() {
            warn!("No [smartcard] section in configuration, using defaults");
        }
        let settings = config.smartcard_or_default();

        let device = settings.nxp_device();
        match NxpBackend::open(device, Arc::clone(&sink)) {
            Ok(backend) => return Ok(Self::selected(Backend::Nxp(backend))),
            Err(e) => debug!(device, error = %e, "NXP backend unavailable"),
        }

        #[cfg(feature = "pcsc")]
        if let Some(pattern) = settings.pcsc.device.as_deref() {
            match PcscBackend::open(pattern, Arc::clone(&sink)) {
                Ok(backend) => return Ok(Self::selected(Backend::Pcsc(backend))),
                Err(e) => debug!(pattern, error = %e, "PC/SC backend unavailable"),
            }
        }

        #[cfg(feature = "i2c")]
        match settings.i2c_address() {
            Ok(address) => match I2cBackend::<LinuxI2cBus>::open(&address) {
                Ok(backend) => return Ok(Self::selected(Backend::I2c(backend))),
                Err(e) => debug!(path = %address.path, error = %e, "I2C backend unavailable"),
            },
            Err(e) => warn!(error = %e, "Ignoring I2C configuration"),
        }

        warn!("No smartcard backend available");
        Err(Error::NoDevice)
    }

    fn selected(backend: Backend) -> Self {
        info!(backend = backend.name(), "Smartcard backend selected");
        Self {
            backend: Some(backend),
        }
    }

    /// Wrap an already opened backend.
    pub fn from_backend(backend: Backend) -> Self {
        Self::selected(backend)
    }

    fn active(&self) -> Result<&Backend> {
        self.backend.as_ref().ok_or(Error::InvalidArgument)
    }

    /// Name of the active backend, `None` once freed.
    pub fn backend_name(&self) -> Option<&'static str> {
        self.backend.as_ref().map(Backend::name)
    }

    /// Release the backend, joining its scanner thread first.
    pub fn free(&mut self) -> Result<()> {
        let mut backend = self.backend.take().ok_or(Error::InvalidArgument)?;
        backend.close();
        debug!(backend = backend.name(), "Smartcard backend freed");
        Ok(())
    }

    pub fn card_type(&self) -> Result<CardType> {
        self.active()?.card_type()
    }

    /// Read up to `len` bytes. A zero-length read returns an empty buffer
    /// without touching the backend.
    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let backend = self.active()?;
        if len == 0 {
            return Ok(Vec::new());
        }
        backend.read(offset, len)
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<usize> {
        self.active()?.write(offset, data)
    }

    /// Read the personal and insurance data of an eGK.
    pub fn read_info(&self) -> Result<HealthCardRecord> {
        egk::read_info(self.active()?)
    }
}

impl Drop for Smartcard {
    fn drop(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            backend.close();
        }
    }
}

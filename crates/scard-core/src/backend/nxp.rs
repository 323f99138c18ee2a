//! NXP TDA8029 reader on a serial line.
//!
//! All wire access goes through one mutex shared with the background
//! scanner, so a foreground command and a scanner drain never interleave
//! bytes. Card-action notifications that arrive while a command waits for
//! its reply are queued and handled once the reply is in. Events are
//! collected under the lock and delivered after it is released, so a sink
//! may call back into the backend.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::CardBackend;
use crate::error::{Error, Result};
use crate::events::{Event, EventSink, deliver};
use crate::protocol::constants::*;
use crate::protocol::frame::AlparFrame;
use crate::scanner::BackgroundScanner;
use crate::session::{CachedResponse, CardSession, CardType, Insertion, REQUEST_ICC};
use crate::transport::{AlparLink, SerialLine, SerialPortLine};

/// Reader state guarded by the serial lock.
struct NxpInner {
    link: AlparLink<Box<dyn SerialLine>>,
    session: CardSession,
    /// Card-action notifications not yet handled.
    pending: VecDeque<bool>,
    /// Events waiting for delivery outside the lock.
    outbox: Vec<Event>,
}

impl NxpInner {
    fn new(line: Box<dyn SerialLine>) -> Self {
        Self {
            link: AlparLink::new(line),
            session: CardSession::new(),
            pending: VecDeque::new(),
            outbox: Vec::new(),
        }
    }

    fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.outbox)
    }

    /// Swallow unsolicited frames. Returns frames that need the caller.
    fn intercept(&mut self, frame: AlparFrame) -> Result<Option<AlparFrame>> {
        if let Some(inserted) = frame.card_action() {
            debug!(inserted, "Card action notification");
            self.pending.push_back(inserted);
            return Ok(None);
        }
        if frame.is_wake_up() {
            debug!("Echoing chip wake-up");
            self.link.send_frame(&frame)?;
            return Ok(None);
        }
        Ok(Some(frame))
    }

    /// Drain pending unsolicited frames.
    ///
    /// Before a command (`new_command`) the chip is woken first, the first
    /// frame may take [`ALPAR_WAIT`] and the input queue is discarded
    /// afterwards. Otherwise the drain never blocks waiting for a header.
    fn flush(&mut self, new_command: bool) -> Result<()> {
        let mut wait = if new_command {
            self.link.send_wake_up()?;
            ALPAR_WAIT
        } else {
            ALPAR_NO_WAIT
        };

        loop {
            match self.link.receive_frame(wait) {
                Ok(frame) => {
                    if let Some(stray) = self.intercept(frame)? {
                        debug!(cmd = %format!("0x{:02X}", stray.command), "Dropping stray frame");
                    }
                }
                Err(Error::Timeout) => break,
                Err(e) => {
                    debug!(error = %e, "Discarding unreadable input");
                    self.link.discard_input()?;
                    break;
                }
            }
            wait = ALPAR_NO_WAIT;
        }

        if new_command {
            self.link.discard_input()?;
        }
        Ok(())
    }

    /// One command round trip. Returns the reply payload.
    ///
    /// Card actions seen on the way are only queued.
    fn exchange(&mut self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        self.flush(true)?;
        self.link.send_frame(&AlparFrame::ack(cmd, payload))?;

        loop {
            let frame = self.link.receive_frame(ALPAR_WAIT)?;
            let Some(frame) = self.intercept(frame)? else {
                continue;
            };
            if frame.command != cmd {
                debug!(
                    sent = %format!("0x{:02X}", cmd),
                    got = %format!("0x{:02X}", frame.command),
                    "Skipping unrelated frame"
                );
                continue;
            }
            if !frame.is_ack() {
                let status = frame.status().unwrap_or_default();
                return Err(Error::RemoteIo {
                    status: u16::from(status),
                });
            }
            return Ok(frame.payload);
        }
    }

    /// Command round trip followed by any queued card actions.
    fn command(&mut self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let reply = self.exchange(cmd, payload);
        self.process_pending();
        reply
    }

    fn process_pending(&mut self) {
        while let Some(inserted) = self.pending.pop_front() {
            self.card_action(inserted);
        }
    }

    /// Unsolicited card action. Repeated insertions of a present card are
    /// ignored.
    fn card_action(&mut self, inserted: bool) {
        if inserted && !self.session.wants_insertion() {
            debug!("Card already reported present, ignoring insertion");
            return;
        }
        self.apply_presence(inserted);
    }

    /// Removal, or a fresh handshake for a present card.
    fn apply_presence(&mut self, inserted: bool) {
        let event = if inserted {
            let outcome = self.handshake();
            self.session.on_inserted(outcome)
        } else {
            self.session.on_removed()
        };
        if let Some(event) = event {
            self.outbox.push(Event::Smartcard(event));
        }
    }

    /// Power the card up and classify it.
    fn handshake(&mut self) -> Insertion {
        let mut power_up = Err(Error::NoData);
        for attempt in 1..=POWER_UP_ATTEMPTS {
            power_up = self.exchange(CMD_POWER_UP_ISO, &[]);
            match &power_up {
                Err(Error::RemoteIo { status }) if *status == u16::from(STATUS_BAD_FIDI) => {
                    warn!(attempt, "Bad FiDi during ISO power-up");
                }
                _ => break,
            }
        }

        match power_up {
            Ok(atr) => {
                let card_type = match self.exchange(CMD_GET_CARD_PARAM, &[]) {
                    Ok(param) if param.len() > 2 => match param[2] {
                        0 => CardType::T0,
                        1 => CardType::T1,
                        other => {
                            debug!(protocol = other, "Unrecognized card protocol");
                            CardType::Unknown
                        }
                    },
                    Ok(_) => CardType::Unknown,
                    Err(e) => {
                        debug!(error = %e, "Card parameter query failed");
                        CardType::Unknown
                    }
                };
                debug!(atr = %hex::encode_upper(&atr), %card_type, "ISO card powered up");
                Insertion::Iso { atr, card_type }
            }
            Err(e) => {
                debug!(error = %e, "ISO power-up failed, trying I2C");
                match self.exchange(CMD_POWER_UP_I2C, &[]) {
                    Ok(_) => Insertion::I2c,
                    Err(e) => {
                        debug!(error = %e, "I2C power-up failed");
                        Insertion::Unrecognized
                    }
                }
            }
        }
    }

    /// Query the chip. A present card is always powered up and classified
    /// again.
    fn check_presence(&mut self) -> Result<()> {
        let reply = self.exchange(CMD_CHECK_PRESENT, &[])?;
        self.process_pending();
        if reply.len() != 1 {
            return Err(Error::Io(format!(
                "presence reply of {} bytes",
                reply.len()
            )));
        }
        self.apply_presence(reply[0] != 0);
        Ok(())
    }

    /// One scanner iteration.
    fn scan(&mut self) {
        if let Err(e) = self.flush(false) {
            debug!(error = %e, "Scanner flush failed");
        }
        self.process_pending();
    }

    fn read_i2c(&mut self, offset: usize, size: usize) -> Result<Vec<u8>> {
        let size = size.min(ALPAR_MAX_PAYLOAD);
        let offset = u16::try_from(offset).map_err(|_| Error::InvalidArgument)?;
        let [off_hi, off_lo] = offset.to_be_bytes();
        let [size_hi, size_lo] = (size as u16).to_be_bytes();
        // Some cards ignore the offset of the extended read.
        let cmd = if offset > 0xFF {
            CMD_READ_I2C_EXT
        } else {
            CMD_READ_I2C
        };
        self.command(cmd, &[I2C_CARD_ADDRESS, off_hi, off_lo, size_hi, size_lo])
    }

    fn write_async(&mut self, data: &[u8]) -> Result<usize> {
        let data = &data[..data.len().min(ALPAR_MAX_PAYLOAD)];

        if data == REQUEST_ICC {
            if let Some(response) = self.session.atr_response() {
                self.session.set_response(CachedResponse::Data(response));
                return Ok(data.len());
            }
        }

        let result = self.exchange(CMD_CARD_COMMAND, data);
        self.session.set_response(match &result {
            Ok(reply) => CachedResponse::Data(reply.clone()),
            Err(e) => CachedResponse::Failed(e.clone()),
        });
        self.process_pending();
        result.map(|_| data.len())
    }

    fn read(&mut self, offset: usize, len: usize) -> Result<Vec<u8>> {
        match self.session.card_type() {
            CardType::I2c => self.read_i2c(offset, len),
            CardType::T0 | CardType::T1 => self.session.response().slice(offset, len),
            CardType::Unknown => Err(Error::NotSupported),
        }
    }

    fn write(&mut self, _offset: usize, data: &[u8]) -> Result<usize> {
        match self.session.card_type() {
            CardType::T0 | CardType::T1 => self.write_async(data),
            CardType::I2c | CardType::Unknown => Err(Error::NotSupported),
        }
    }
}

/// Backend driving an NXP TDA8029 over ALPAR.
pub struct NxpBackend {
    inner: Arc<Mutex<NxpInner>>,
    sink: Arc<dyn EventSink>,
    scanner: Option<BackgroundScanner>,
    device: String,
}

/// Run `f` under the lock, then deliver the events it produced.
fn locked<T>(
    inner: &Mutex<NxpInner>,
    sink: &dyn EventSink,
    f: impl FnOnce(&mut NxpInner) -> T,
) -> T {
    let (result, events) = {
        let mut guard = inner.lock();
        let result = f(&mut *guard);
        (result, guard.take_events())
    };
    for event in events {
        deliver(sink, event);
    }
    result
}

impl NxpBackend {
    /// Open the serial device, probe the reader and start the scanner.
    #[instrument(level = "info", skip(sink))]
    pub fn open(device: &str, sink: Arc<dyn EventSink>) -> Result<Self> {
        let line = SerialPortLine::open(device)?;
        Self::open_with_line(Box::new(line), device, sink)
    }

    /// Same as [`NxpBackend::open`] over an already opened line.
    pub fn open_with_line(
        line: Box<dyn SerialLine>,
        device: &str,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let mut backend = Self::open_unscanned(line, device, sink)?;
        let inner = Arc::clone(&backend.inner);
        let sink = Arc::clone(&backend.sink);
        backend.scanner = Some(BackgroundScanner::spawn(
            "nxp-scan",
            NXP_SCAN_PERIOD,
            move || locked(&inner, sink.as_ref(), NxpInner::scan),
        )?);
        Ok(backend)
    }

    /// Probe the reader without starting the scanner thread.
    pub(crate) fn open_unscanned(
        line: Box<dyn SerialLine>,
        device: &str,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self> {
        let mut inner = NxpInner::new(line);
        let probed = inner.check_presence();
        for event in inner.take_events() {
            deliver(sink.as_ref(), event);
        }
        probed.inspect_err(|e| {
            debug!(device, error = %e, "Reader did not answer presence check");
        })?;
        info!(device, card_type = %inner.session.card_type(), "NXP reader ready");

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            sink,
            scanner: None,
            device: device.to_string(),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    /// Ask the chip whether a card is present and re-run the handshake.
    pub fn check_presence(&self) -> Result<()> {
        locked(&self.inner, self.sink.as_ref(), NxpInner::check_presence)
    }

    /// Run one scanner iteration on the calling thread.
    pub fn scan_once(&self) {
        locked(&self.inner, self.sink.as_ref(), NxpInner::scan);
    }

    /// Cached ATR of the current card.
    pub fn atr(&self) -> Vec<u8> {
        self.inner.lock().session.atr().to_vec()
    }

    /// Stop the scanner. The line is released when the backend drops.
    pub fn close(&mut self) {
        if let Some(mut scanner) = self.scanner.take() {
            scanner.stop();
        }
    }
}

impl CardBackend for NxpBackend {
    fn card_type(&self) -> Result<CardType> {
        Ok(self.inner.lock().session.card_type())
    }

    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        locked(&self.inner, self.sink.as_ref(), |inner| inner.read(offset, len))
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<usize> {
        locked(&self.inner, self.sink.as_ref(), |inner| inner.write(offset, data))
    }
}

impl Drop for NxpBackend {
    fn drop(&mut self) {
        self.close();
    }
}

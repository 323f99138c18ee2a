//! PC/SC reader through pcsc-lite.
//!
//! A scan thread blocks in `get_status_change` without timeout and is
//! woken by `Context::cancel` at teardown.

use std::ffi::CString;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use pcsc::{Card, Context, Disposition, Protocol, Protocols, ReaderState, Scope, ShareMode, State};
use tracing::{debug, info, instrument, warn};

use super::CardBackend;
use super::ctbcs::{self, CtbcsCommand, SW_UNSUCCESSFUL};
use crate::error::{Error, Result};
use crate::events::{CardEvent, Event, EventSink, deliver};
use crate::scanner::BackgroundScanner;
use crate::session::{APDU_SUCCESS, CachedResponse, CardType};

/// Back-off after a failed status-change wait.
const STATUS_ERROR_DELAY: Duration = Duration::from_millis(500);

impl From<pcsc::Error> for Error {
    fn from(e: pcsc::Error) -> Self {
        match e {
            pcsc::Error::ResetCard => Error::Busy,
            pcsc::Error::RemovedCard
            | pcsc::Error::InvalidHandle
            | pcsc::Error::NoService
            | pcsc::Error::ReaderUnavailable
            | pcsc::Error::NoSmartcard => Error::NoDevice,
            pcsc::Error::InvalidValue | pcsc::Error::InvalidParameter => Error::InvalidArgument,
            other => Error::Io(other.to_string()),
        }
    }
}

/// State shared with the scan thread.
#[derive(Default)]
struct PcscState {
    protocol: Option<Protocol>,
    atr: Vec<u8>,
    present: bool,
    response: CachedResponse,
}

/// Backend driving one PC/SC reader.
pub struct PcscBackend {
    ctx: Context,
    reader: CString,
    state: Arc<Mutex<PcscState>>,
    scanner: Option<BackgroundScanner>,
}

/// First reader whose name contains `pattern`, ignoring case.
fn find_reader(readers: &[CString], pattern: &str) -> Option<CString> {
    let pattern = pattern.to_lowercase();
    readers.iter().find_map(|name| {
        let matched = name.to_string_lossy().to_lowercase().contains(&pattern);
        debug!(reader = %name.to_string_lossy(), matched, "PC/SC reader");
        matched.then(|| name.clone())
    })
}

/// Refresh protocol and ATR after a state change.
fn refresh(card: &mut Card, reader_atr: &[u8], state: &mut PcscState) {
    state.protocol = card
        .reconnect(ShareMode::Shared, Protocols::ANY, Disposition::LeaveCard)
        .and_then(|_| card.status2_owned())
        .ok()
        .and_then(|status| status.protocol2());
    if ctbcs::is_memory_card_atr(reader_atr) {
        state.protocol = Some(Protocol::RAW);
    }
    state.atr = reader_atr.to_vec();
    state.response = CachedResponse::Data(state.atr.clone());
    debug!(atr = %hex::encode_upper(&state.atr), protocol = ?state.protocol, "PC/SC card state");
}

impl PcscBackend {
    /// Connect to the first reader matching `pattern` and start scanning.
    #[instrument(level = "info", skip(sink))]
    pub fn open(pattern: &str, sink: Arc<dyn EventSink>) -> Result<Self> {
        let ctx = Context::establish(Scope::System)?;
        let readers = ctx.list_readers_owned()?;
        let reader = find_reader(&readers, pattern).ok_or(Error::NoDevice)?;

        let mut card = ctx.connect(&reader, ShareMode::Direct, Protocols::ANY)?;
        info!(reader = %reader.to_string_lossy(), "Using PC/SC reader");

        let state = Arc::new(Mutex::new(PcscState::default()));
        let scanner = Self::spawn_scanner(ctx.clone(), reader.clone(), &state, sink, move |atr, st| {
            refresh(&mut card, atr, st)
        })?;

        Ok(Self {
            ctx,
            reader,
            state,
            scanner: Some(scanner),
        })
    }

    fn spawn_scanner<F>(
        ctx: Context,
        reader: CString,
        state: &Arc<Mutex<PcscState>>,
        sink: Arc<dyn EventSink>,
        mut on_change: F,
    ) -> Result<BackgroundScanner>
    where
        F: FnMut(&[u8], &mut PcscState) + Send + 'static,
    {
        let state = Arc::clone(state);
        let mut reader_states = vec![ReaderState::new(reader, State::UNAWARE)];
        let stop = Arc::new(AtomicBool::new(false));
        let stopping = Arc::clone(&stop);

        BackgroundScanner::spawn_with_stop("pcsc-scan", Duration::ZERO, stop, move || {
            if let Err(e) = ctx.get_status_change(None, &mut reader_states) {
                if !stopping.load(Ordering::Acquire) {
                    debug!(error = %e, "get_status_change failed");
                    thread::sleep(STATUS_ERROR_DELAY);
                }
                return;
            }
            let rs = &mut reader_states[0];
            let event_state = rs.event_state();
            if !event_state.contains(State::CHANGED) {
                return;
            }
            rs.sync_current_state();

            let present = event_state.contains(State::PRESENT);
            let mut st = state.lock();
            let changed = st.present != present;
            st.present = present;
            on_change(rs.atr(), &mut st);
            drop(st);

            // Our own connects flip INUSE; only presence changes are events.
            if changed {
                let event = if present {
                    CardEvent::Inserted
                } else {
                    CardEvent::Removed
                };
                deliver(sink.as_ref(), Event::Smartcard(event));
            }
        })
    }

    pub fn reader_name(&self) -> String {
        self.reader.to_string_lossy().into_owned()
    }

    /// Stop the scan thread: flag, cancel the blocking wait, join.
    pub fn close(&mut self) {
        if let Some(mut scanner) = self.scanner.take() {
            scanner.signal_stop();
            if let Err(e) = self.ctx.cancel() {
                warn!(error = %e, "Failed to cancel PC/SC wait");
            }
            scanner.join();
        }
    }

    fn connect_shared(&self) -> Result<Card> {
        Ok(self
            .ctx
            .connect(&self.reader, ShareMode::Shared, Protocols::ANY)?)
    }

    fn transmit(card: &Card, apdu: &[u8]) -> Result<Vec<u8>> {
        let mut buf = [0u8; pcsc::MAX_BUFFER_SIZE_EXTENDED];
        Ok(card.transmit(apdu, &mut buf)?.to_vec())
    }

    /// Answer a CT-BCS command locally.
    fn ctbcs(&self, command: CtbcsCommand) -> Vec<u8> {
        let redo = |disposition: Disposition| {
            let outcome = self.connect_shared().and_then(|mut card| {
                card.reconnect(ShareMode::Shared, Protocols::ANY, disposition)?;
                Ok(())
            });
            match outcome {
                Ok(()) => APDU_SUCCESS.to_vec(),
                Err(e) => {
                    debug!(error = %e, ?disposition, "CT-BCS reconnect failed");
                    SW_UNSUCCESSFUL.to_vec()
                }
            }
        };
        match command {
            CtbcsCommand::ResetCt => redo(Disposition::ResetCard),
            CtbcsCommand::RequestIcc { with_atr } => {
                ctbcs::request_icc_response(&self.state.lock().atr, with_atr)
            }
            CtbcsCommand::EjectIcc => redo(Disposition::EjectCard),
            CtbcsCommand::Other(ins) => {
                debug!(ins = %format!("0x{ins:02X}"), "Unsupported CT-BCS command");
                SW_UNSUCCESSFUL.to_vec()
            }
        }
    }

    /// Memory card read through the reader's pseudo APDUs.
    fn read_memory_card(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let offset = u16::try_from(offset).map_err(|_| Error::InvalidArgument)?;
        let card = self
            .ctx
            .connect(&self.reader, ShareMode::Shared, Protocols::T0)?;
        let selected = Self::transmit(&card, &ctbcs::SELECT_MEMORY_CARD)?;
        ctbcs::strip_success(&selected)?;
        let response = Self::transmit(&card, &ctbcs::memory_card_read_apdu(offset, len))?;
        Ok(ctbcs::strip_success(&response)?.to_vec())
    }
}

impl CardBackend for PcscBackend {
    fn card_type(&self) -> Result<CardType> {
        Ok(match self.state.lock().protocol {
            Some(Protocol::T0) => CardType::T0,
            Some(Protocol::T1) => CardType::T1,
            Some(Protocol::RAW) => CardType::I2c,
            _ => CardType::Unknown,
        })
    }

    fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        if self.state.lock().protocol == Some(Protocol::RAW) {
            return self.read_memory_card(offset, len);
        }
        self.state.lock().response.slice(offset, len)
    }

    fn write(&self, _offset: usize, data: &[u8]) -> Result<usize> {
        if let Some(command) = CtbcsCommand::parse(data) {
            let response = self.ctbcs(command?);
            self.state.lock().response = CachedResponse::Data(response);
            return Ok(data.len());
        }

        let card = self.connect_shared()?;

        let result = Self::transmit(&card, data);
        let mut state = self.state.lock();
        if matches!(result, Err(Error::Busy)) {
            // Card was reset under us; pick up the new protocol.
            let mut card = card;
            let atr = state.atr.clone();
            refresh(&mut card, &atr, &mut state);
        }
        state.response = match &result {
            Ok(response) => CachedResponse::Data(response.clone()),
            Err(e) => CachedResponse::Failed(e.clone()),
        };
        result.map(|_| data.len())
    }
}

impl Drop for PcscBackend {
    fn drop(&mut self) {
        self.close();
    }
}

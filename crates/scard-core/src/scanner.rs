//! Background scanner thread.
//!
//! Runs a poll closure at a fixed period until stopped. Stopping is split
//! into [`BackgroundScanner::signal_stop`] and [`BackgroundScanner::join`]
//! so an owner can wake a blocked poll in between.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

pub struct BackgroundScanner {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    name: String,
}

impl BackgroundScanner {
    /// Spawn a thread calling `poll` every `period` until stopped.
    pub fn spawn<F>(name: &str, period: Duration, poll: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        Self::spawn_with_stop(name, period, Arc::new(AtomicBool::new(false)), poll)
    }

    /// Like [`BackgroundScanner::spawn`] with a caller-provided stop flag,
    /// for polls that must look at it mid-iteration.
    pub fn spawn_with_stop<F>(
        name: &str,
        period: Duration,
        stop: Arc<AtomicBool>,
        mut poll: F,
    ) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    poll();
                    if !period.is_zero() {
                        thread::sleep(period);
                    }
                }
            })
            .map_err(|e| Error::Io(e.to_string()))?;
        debug!(name, ?period, "Scanner started");

        Ok(Self {
            stop,
            handle: Some(handle),
            name: name.to_string(),
        })
    }

    pub fn signal_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for the thread to exit. Idempotent.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(name = %self.name, "Scanner thread panicked");
            }
            debug!(name = %self.name, "Scanner stopped");
        }
    }

    /// Signal and join.
    pub fn stop(&mut self) {
        self.signal_stop();
        self.join();
    }
}

impl Drop for BackgroundScanner {
    fn drop(&mut self) {
        self.stop();
    }
}

//! Mock serial line for testing.
//!
//! Plays the part of the reader chip: frames written by the host are
//! captured, and scripted replies are queued when a command frame with a
//! matching command byte is written.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::traits::{SerialLine, TransportError};
use crate::protocol::constants::{ALPAR_ACK, ALPAR_HEADER_LEN};
use crate::protocol::frame::AlparFrame;

/// Mock line. Clones share the same buffers, so a test can keep a handle
/// after moving the line into a backend.
#[derive(Clone, Default)]
pub struct MockLine {
    /// Bytes waiting to be read by the host.
    rx: Arc<Mutex<VecDeque<u8>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Replies released when the matching command is written.
    script: Arc<Mutex<VecDeque<(u8, Vec<u8>)>>>,
    /// Accept only this many bytes per write.
    short_write: Arc<Mutex<Option<usize>>>,
    discards: Arc<Mutex<usize>>,
}

impl MockLine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `reply` to be delivered once an ACK frame for `command` is written.
    ///
    /// Scripted replies are consumed in order; only the head of the script
    /// is matched.
    pub fn expect(&self, command: u8, reply: &AlparFrame) {
        let bytes = reply.encode().unwrap_or_default();
        self.script.lock().push_back((command, bytes));
    }

    /// Queue a sequence of reply frames for one command.
    pub fn expect_many(&self, command: u8, replies: &[AlparFrame]) {
        let bytes = replies
            .iter()
            .flat_map(|f| f.encode().unwrap_or_default())
            .collect();
        self.script.lock().push_back((command, bytes));
    }

    /// Make a frame readable right away, as if the chip had sent it unprompted.
    pub fn push_unsolicited(&self, frame: &AlparFrame) {
        let bytes = frame.encode().unwrap_or_default();
        self.push_raw(&bytes);
    }

    pub fn push_raw(&self, bytes: &[u8]) {
        self.rx.lock().extend(bytes.iter().copied());
    }

    /// Limit every following write to `n` bytes.
    pub fn set_short_write(&self, n: Option<usize>) {
        *self.short_write.lock() = n;
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().clone()
    }

    /// Captured writes that decode as ALPAR frames (skips wake-up bytes).
    pub fn written_frames(&self) -> Vec<AlparFrame> {
        self.get_writes()
            .iter()
            .filter_map(|w| AlparFrame::decode(w).ok())
            .collect()
    }

    /// Command bytes of every frame written so far.
    pub fn written_commands(&self) -> Vec<u8> {
        self.written_frames().iter().map(|f| f.command).collect()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.write_log.lock().clear();
    }

    /// Scripted replies not yet triggered.
    pub fn pending_script(&self) -> usize {
        self.script.lock().len()
    }

    /// Drop unread bytes without counting a discard.
    pub fn clear_rx(&self) {
        self.rx.lock().clear();
    }

    pub fn pending_rx(&self) -> usize {
        self.rx.lock().len()
    }

    pub fn discard_count(&self) -> usize {
        *self.discards.lock()
    }
}

impl SerialLine for MockLine {
    fn write(&mut self, data: &[u8]) -> Result<usize, TransportError> {
        let accepted = match *self.short_write.lock() {
            Some(n) => n.min(data.len()),
            None => data.len(),
        };
        self.write_log.lock().push(data[..accepted].to_vec());

        if accepted == data.len() && data.len() > ALPAR_HEADER_LEN && data[0] == ALPAR_ACK {
            let command = data[3];
            let mut script = self.script.lock();
            if script.front().is_some_and(|(cmd, _)| *cmd == command) {
                if let Some((_, reply)) = script.pop_front() {
                    self.rx.lock().extend(reply);
                }
            }
        }
        Ok(accepted)
    }

    fn read_exact_within(&mut self, buf: &mut [u8], wait: Duration) -> Result<(), TransportError> {
        let mut rx = self.rx.lock();
        let n = buf.len();
        if rx.len() < n {
            return Err(TransportError::Timeout { wait });
        }
        for (dst, src) in buf.iter_mut().zip(rx.drain(..n)) {
            *dst = src;
        }
        Ok(())
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.rx.lock().clear();
        *self.discards.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    #[test]
    fn test_script_released_on_matching_command() {
        let mut mock = MockLine::new();
        mock.expect(CMD_CHECK_PRESENT, &AlparFrame::ack(CMD_CHECK_PRESENT, &[0x01]));

        let mut buf = [0u8; 6];
        assert!(mock.read_exact_within(&mut buf, ALPAR_NO_WAIT).is_err());

        let request = AlparFrame::ack(CMD_CHECK_PRESENT, &[]).encode().unwrap();
        mock.write(&request).unwrap();
        mock.read_exact_within(&mut buf, ALPAR_WAIT).unwrap();
        assert_eq!(buf, [0x60, 0x00, 0x01, 0x09, 0x01, 0x69]);
        assert_eq!(mock.pending_script(), 0);
    }

    #[test]
    fn test_non_matching_command_keeps_script() {
        let mut mock = MockLine::new();
        mock.expect(CMD_POWER_UP_ISO, &AlparFrame::ack(CMD_POWER_UP_ISO, &[0x3B]));
        let request = AlparFrame::ack(CMD_CHECK_PRESENT, &[]).encode().unwrap();
        mock.write(&request).unwrap();
        assert_eq!(mock.pending_script(), 1);
        assert_eq!(mock.pending_rx(), 0);
    }

    #[test]
    fn test_short_read_consumes_nothing() {
        let mut mock = MockLine::new();
        mock.push_raw(&[0x60, 0x00]);
        let mut buf = [0u8; 4];
        assert!(matches!(
            mock.read_exact_within(&mut buf, ALPAR_NO_WAIT),
            Err(TransportError::Timeout { .. })
        ));
        assert_eq!(mock.pending_rx(), 2);
    }

    #[test]
    fn test_short_write_reported() {
        let mut mock = MockLine::new();
        mock.set_short_write(Some(2));
        assert!(matches!(
            mock.write_all_or_fail(&[1, 2, 3, 4]),
            Err(TransportError::ShortWrite {
                written: 2,
                expected: 4
            })
        ));
    }
}

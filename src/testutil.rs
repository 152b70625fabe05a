//! Shared helpers for unit tests.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::message::{self, Message};
use crate::radio::ControlPort;
use crate::{Error, Result};

/// A [`ControlPort`] that records every written message and fabricates a
/// matching success reply for the most recent control write, so the
/// synchronous channel sequences run without a radio.
pub(crate) struct FakePort {
    pub serial: u32,
    pub written: Vec<Message>,
    /// When set, replies carry this status instead of success.
    pub fail_with_status: Option<u8>,
}

impl FakePort {
    pub fn new(serial: u32) -> Self {
        FakePort {
            serial,
            written: Vec::new(),
            fail_with_status: None,
        }
    }

    /// Message ids written so far.
    pub fn written_ids(&self) -> Vec<u8> {
        self.written.iter().map(|m| m.id).collect()
    }
}

impl ControlPort for FakePort {
    fn write_message(&mut self, message: &Message) -> Result<()> {
        self.written.push(message.clone());
        Ok(())
    }

    fn read_reply(&mut self) -> Result<Vec<u8>> {
        let last = self.written.last().ok_or(Error::ReadTimeout)?;
        let channel = last.data.first().copied().unwrap_or(0);
        let status = self.fail_with_status.unwrap_or(0);
        Ok(Message::new(message::RESPONSE_CHANNEL, &[channel, last.id, status]).encode())
    }

    fn serial_number(&self) -> u32 {
        self.serial
    }
}

static TEMP_SEQ: AtomicU32 = AtomicU32::new(0);

/// A fresh directory under the system temp dir, unique per call.
pub(crate) fn temp_dir(tag: &str) -> PathBuf {
    let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "fit-sync-test-{}-{}-{}",
        tag,
        std::process::id(),
        seq
    ));
    std::fs::create_dir_all(&path).unwrap();
    path
}

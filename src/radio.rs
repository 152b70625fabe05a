use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, warn};
use rusb::UsbContext;

use crate::message::{self, FrameBuffer, Message};
use crate::usb::{BulkTransport, UsbDevice};
use crate::{error::Error, Result};

/// The well-known network key every ANT-FS device listens on.
pub const ANTFS_NETWORK_KEY: [u8; 8] = [0xA8, 0xA4, 0x23, 0xB9, 0xF5, 0x5E, 0x63, 0xC1];

// Only network 0 is ever used.
const ANTFS_NETWORK: u8 = 0;

const READ_CHUNK: usize = 128;
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);
const TICK_TIMEOUT: Duration = Duration::from_millis(10);
// How many frames to drain while waiting for the startup notification
// after a reset.
const RESET_REPLY_LIMIT: usize = 50;

/// The control surface the channel layer and the ANT-FS engine program
/// against: write a frame, synchronously await the matching control reply,
/// and identify the host radio. `Radio` is the production implementation.
pub trait ControlPort {
    fn write_message(&mut self, message: &Message) -> Result<()>;
    fn read_reply(&mut self) -> Result<Vec<u8>>;
    fn serial_number(&self) -> u32;
}

/// Radio owns the USB ANT stick: it performs the reset/identify startup
/// sequence, installs the network key, and feeds received frames to the
/// caller one at a time through [`Radio::tick`].
///
/// Data-class frames that arrive while `read_reply` is waiting for a
/// control reply are not dropped: they are pushed onto a FIFO delayed queue
/// and replayed, in order, before the transport is polled again. Control
/// replies therefore overtake data frames inside this classification, but
/// the per-channel ordering of the data stream itself is preserved.
pub struct Radio<D: BulkTransport> {
    transport: D,
    frames: FrameBuffer,
    delayed: VecDeque<Vec<u8>>,
    serial_number: u32,
    version: String,
    max_channels: u8,
    max_networks: u8,
    network: Option<u8>,
}

impl<T: UsbContext> Radio<UsbDevice<T>> {
    /// Find the radio on the USB bus and run the startup sequence: reset,
    /// wait for the startup notification, then query serial number, version
    /// and capabilities.
    pub fn open(ctx: &mut T) -> Result<Self> {
        let transport = UsbDevice::open(ctx)?;
        let mut radio = Radio::new(transport);
        radio.reset()?;
        radio.query_info()?;
        Ok(radio)
    }
}

impl<D: BulkTransport> Radio<D> {
    pub(crate) fn new(transport: D) -> Self {
        Radio {
            transport,
            frames: FrameBuffer::new(),
            delayed: VecDeque::new(),
            serial_number: 0,
            version: String::new(),
            max_channels: 0,
            max_networks: 0,
            network: None,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn max_channels(&self) -> u8 {
        self.max_channels
    }

    pub fn max_networks(&self) -> u8 {
        self.max_networks
    }

    pub fn network(&self) -> Option<u8> {
        self.network
    }

    /// Pull one frame for the asynchronous path: frames deferred during a
    /// synchronous wait replay first, then the transport is polled without
    /// blocking beyond the tick timeout. Returns `None` when nothing is
    /// pending.
    pub fn tick(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(frame) = self.delayed.pop_front() {
            return Ok(Some(frame));
        }
        self.read_frame(TICK_TIMEOUT)
    }

    fn reset(&mut self) -> Result<()> {
        self.write_message(&message::reset())?;
        for _ in 0..RESET_REPLY_LIMIT {
            let frame = self.read_reply()?;
            if frame[2] == message::STARTUP_MESSAGE {
                debug!("radio restarted, startup reason {:#04x}", frame[3]);
                return Ok(());
            }
        }
        warn!("no startup notification after reset, continuing anyway");
        Ok(())
    }

    fn query_info(&mut self) -> Result<()> {
        self.write_message(&message::request_message(
            0,
            message::RESPONSE_SERIAL_NUMBER,
        ))?;
        let frame = self.read_reply()?;
        if frame[2] != message::RESPONSE_SERIAL_NUMBER || frame.len() < 8 {
            return Err(Error::BadFrame);
        }
        self.serial_number = message::bytes_to_u32(&frame[3..7]);

        self.write_message(&message::request_message(0, message::RESPONSE_VERSION))?;
        let frame = self.read_reply()?;
        if frame[2] != message::RESPONSE_VERSION {
            return Err(Error::BadFrame);
        }
        let text = &frame[3..frame.len() - 1];
        let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
        self.version = String::from_utf8_lossy(&text[..end]).into_owned();

        self.write_message(&message::request_message(0, message::RESPONSE_CAPABILITIES))?;
        let frame = self.read_reply()?;
        if frame[2] != message::RESPONSE_CAPABILITIES || frame.len() < 6 {
            return Err(Error::BadFrame);
        }
        self.max_channels = frame[3];
        self.max_networks = frame[4];
        Ok(())
    }

    /// Install the network key on network 0 and verify the response.
    pub fn set_network_key(&mut self, key: &[u8; 8]) -> Result<()> {
        self.network = None;
        self.write_message(&message::set_network_key(ANTFS_NETWORK, key))?;
        let reply = self.read_reply()?;
        message::check_channel_response(&reply, ANTFS_NETWORK, message::SET_NETWORK_KEY)?;
        self.network = Some(ANTFS_NETWORK);
        Ok(())
    }

    /// Read one frame from the transport, buffering partial reads, waiting
    /// at most `timeout` for a complete frame to arrive.
    fn read_frame(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.frames.next_frame()? {
                return Ok(Some(frame));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let mut chunk = [0u8; READ_CHUNK];
            match self.transport.read(&mut chunk, remaining) {
                Ok(0) => return Ok(None),
                Ok(n) => self.frames.push(&chunk[..n]),
                Err(Error::Usb(rusb::Error::Timeout)) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<D: BulkTransport> ControlPort for Radio<D> {
    fn write_message(&mut self, message: &Message) -> Result<()> {
        self.transport.write(&message.encode(), REPLY_TIMEOUT)?;
        Ok(())
    }

    /// Block for the next frame that is a reply to a control write. Any
    /// data-class frame seen while waiting is set aside on the delayed
    /// queue for the next [`Radio::tick`].
    fn read_reply(&mut self) -> Result<Vec<u8>> {
        loop {
            match self.read_frame(REPLY_TIMEOUT)? {
                None => return Err(Error::ReadTimeout),
                Some(frame) => {
                    if message::is_data_frame(&frame) {
                        self.delayed.push_back(frame);
                    } else {
                        return Ok(frame);
                    }
                }
            }
        }
    }

    fn serial_number(&self) -> u32 {
        self.serial_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Transport fed from a script of byte chunks; reads past the script
    /// time out like an idle radio.
    struct ScriptedTransport {
        reads: VecDeque<Vec<u8>>,
        written: Vec<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn new(frames: &[Message]) -> Self {
            ScriptedTransport {
                reads: frames.iter().map(|m| m.encode()).collect(),
                written: Vec::new(),
            }
        }
    }

    impl BulkTransport for ScriptedTransport {
        fn read(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            match self.reads.pop_front() {
                Some(bytes) => {
                    buf[..bytes.len()].copy_from_slice(&bytes);
                    Ok(bytes.len())
                }
                None => Err(Error::Usb(rusb::Error::Timeout)),
            }
        }

        fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize> {
            self.written.push(data.to_vec());
            Ok(data.len())
        }
    }

    fn broadcast(tag: u8) -> Message {
        Message::new(message::BROADCAST_DATA, &[0, tag, 0, 0, 0, 0, 0, 0, 0])
    }

    #[test]
    fn read_reply_defers_data_frames() {
        // Two broadcasts arrive before the control reply; read_reply must
        // skip over them and tick must replay them afterwards, in order,
        // before touching the transport again.
        let reply = Message::new(message::RESPONSE_CHANNEL, &[0, message::OPEN_CHANNEL, 0]);
        let late = broadcast(3);
        let mut radio = Radio::new(ScriptedTransport::new(&[
            broadcast(1),
            broadcast(2),
            reply.clone(),
            late.clone(),
        ]));

        assert_eq!(radio.read_reply().unwrap(), reply.encode());
        assert_eq!(radio.tick().unwrap(), Some(broadcast(1).encode()));
        assert_eq!(radio.tick().unwrap(), Some(broadcast(2).encode()));
        // Delayed queue drained; the next tick polls the transport.
        assert_eq!(radio.tick().unwrap(), Some(late.encode()));
        assert_eq!(radio.tick().unwrap(), None);
    }

    #[test]
    fn read_reply_times_out() {
        let mut radio = Radio::new(ScriptedTransport::new(&[]));
        assert!(matches!(radio.read_reply(), Err(Error::ReadTimeout)));
    }

    #[test]
    fn set_network_key_checks_the_response() {
        let ok = Message::new(
            message::RESPONSE_CHANNEL,
            &[0, message::SET_NETWORK_KEY, 0],
        );
        let mut radio = Radio::new(ScriptedTransport::new(&[ok]));
        radio.set_network_key(&ANTFS_NETWORK_KEY).unwrap();
        assert_eq!(radio.network(), Some(0));

        let bad = Message::new(
            message::RESPONSE_CHANNEL,
            &[0, message::SET_NETWORK_KEY, 0x15],
        );
        let mut radio = Radio::new(ScriptedTransport::new(&[bad]));
        assert!(radio.set_network_key(&ANTFS_NETWORK_KEY).is_err());
        assert_eq!(radio.network(), None);
    }
}

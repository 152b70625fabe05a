//! Message module builds the frames sent to the ANT radio and reassembles
//! the byte stream received from it. An ANT frame is SYNC, LEN, ID, LEN
//! payload bytes and a checksum computed as the XOR of every preceding byte,
//! so a valid frame XORs to zero over its full length.
use crate::error::Error;
use crate::Result;

pub const SYNC_BYTE: u8 = 0xA4;

// Configuration messages
pub const UNASSIGN_CHANNEL: u8 = 0x41;
pub const ASSIGN_CHANNEL: u8 = 0x42;
pub const SET_CHANNEL_PERIOD: u8 = 0x43;
pub const SET_CHANNEL_SEARCH_TIMEOUT: u8 = 0x44;
pub const SET_CHANNEL_RF_FREQ: u8 = 0x45;
pub const SET_NETWORK_KEY: u8 = 0x46;
// Vendor extension, not in the official docs. Garmin devices need it before
// an ANT-FS search will find anything.
pub const SET_SEARCH_WAVEFORM: u8 = 0x49;
pub const SET_CHANNEL_ID: u8 = 0x51;

// Notifications
pub const STARTUP_MESSAGE: u8 = 0x6F;
pub const SERIAL_ERROR_MESSAGE: u8 = 0xAE;

// Control messages
pub const RESET_SYSTEM: u8 = 0x4A;
pub const OPEN_CHANNEL: u8 = 0x4B;
pub const CLOSE_CHANNEL: u8 = 0x4C;
pub const REQUEST_MESSAGE: u8 = 0x4D;
pub const OPEN_RX_SCAN_MODE: u8 = 0x5B;
pub const SLEEP_MESSAGE: u8 = 0xC5;

// Data messages
pub const BROADCAST_DATA: u8 = 0x4E;
pub const ACKNOWLEDGE_DATA: u8 = 0x4F;
pub const BURST_TRANSFER_DATA: u8 = 0x50;

// Responses
pub const RESPONSE_CHANNEL: u8 = 0x40;
pub const RESPONSE_CHANNEL_STATUS: u8 = 0x52;
pub const RESPONSE_CHANNEL_ID: u8 = 0x51;
pub const RESPONSE_VERSION: u8 = 0x3E;
pub const RESPONSE_CAPABILITIES: u8 = 0x54;
pub const RESPONSE_SERIAL_NUMBER: u8 = 0x61;

/// Channel events delivered in a RESPONSE_CHANNEL frame with message id 1.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChannelEvent {
    RxSearchTimeout,
    RxFail,
    Tx,
    TransferRxFailed,
    TransferTxCompleted,
    TransferTxFailed,
    ChannelClosed,
    RxFailGoToSearch,
    ChannelCollision,
    TransferTxStart,
}

impl ChannelEvent {
    pub fn from_code(code: u8) -> Option<ChannelEvent> {
        match code {
            0x01 => Some(ChannelEvent::RxSearchTimeout),
            0x02 => Some(ChannelEvent::RxFail),
            0x03 => Some(ChannelEvent::Tx),
            0x04 => Some(ChannelEvent::TransferRxFailed),
            0x05 => Some(ChannelEvent::TransferTxCompleted),
            0x06 => Some(ChannelEvent::TransferTxFailed),
            0x07 => Some(ChannelEvent::ChannelClosed),
            0x08 => Some(ChannelEvent::RxFailGoToSearch),
            0x09 => Some(ChannelEvent::ChannelCollision),
            0x0A => Some(ChannelEvent::TransferTxStart),
            _ => None,
        }
    }
}

// Message is the low-level representation of a frame to send to the ANT
// radio.
// id: Type of message being transmitted.
// data: Data payload to transmit with the message. Data length varies based
// on the type of message being transmitted.
//
// Byte layout of a message where N is length of data payload
// [0] - Sync byte
// [1] - Size of data payload
// [2] - ID of the message
// [3..N+2] - Data payload
// [N+3] - Checksum
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: u8,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(id: u8, data: &[u8]) -> Message {
        Message {
            id,
            data: data.to_vec(),
        }
    }

    // Converts a message into something that can be written out
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 4);
        buf.push(SYNC_BYTE);
        buf.push(self.data.len() as u8);
        buf.push(self.id);
        buf.extend_from_slice(&self.data);
        // Checksum is the XOR of all bytes of the message.
        buf.push(checksum(&buf));
        buf
    }
}

pub fn checksum(buf: &[u8]) -> u8 {
    buf.iter().fold(0, |acc, x| acc ^ x)
}

/// FrameBuffer reassembles ANT frames out of the raw byte stream read from
/// the radio's bulk IN endpoint. Bulk reads do not respect frame boundaries,
/// so bytes accumulate here until a full frame is available; leading bytes
/// that are not a sync byte are discarded.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        FrameBuffer {
            buf: Vec::with_capacity(512),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, verifying its checksum. Returns
    /// `Ok(None)` when the buffered bytes do not yet hold a full frame.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self.buf.iter().position(|&b| b == SYNC_BYTE) {
            Some(0) => {}
            Some(n) => {
                self.buf.drain(..n);
            }
            None => {
                self.buf.clear();
                return Ok(None);
            }
        }
        // SYNC, LEN, MSGID, DATA, CHECKSUM: an empty message is 4 bytes.
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = self.buf[1] as usize + 4;
        if self.buf.len() < len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..len).collect();
        if checksum(&frame) != 0 {
            return Err(Error::BadChecksum);
        }
        Ok(Some(frame))
    }
}

/// Data-class frames are broadcast data, burst transfers and the channel
/// responses that report transfer outcomes. They belong to the asynchronous
/// per-channel stream, while everything else is a reply to a control write.
pub fn is_data_frame(frame: &[u8]) -> bool {
    match frame[2] {
        BROADCAST_DATA | BURST_TRANSFER_DATA => true,
        RESPONSE_CHANNEL => {
            frame.len() > 4
                && (frame[4] == 0x01
                    || frame[4] == ACKNOWLEDGE_DATA
                    || frame[4] == BURST_TRANSFER_DATA)
        }
        _ => false,
    }
}

/// Channel number a received frame belongs to. Burst transfer frames carry
/// the burst sequence in the top three bits of the channel byte.
pub fn frame_channel(frame: &[u8]) -> u8 {
    if frame[2] == BURST_TRANSFER_DATA {
        frame[3] & 0x1F
    } else {
        frame[3]
    }
}

/// Verify the channel response to a control write: the reply must echo the
/// channel and command with a zero status.
pub fn check_channel_response(frame: &[u8], channel: u8, command: u8) -> Result<()> {
    if frame.len() < 6
        || frame[2] != RESPONSE_CHANNEL
        || frame[3] != channel
        || frame[4] != command
        || frame[5] != 0
    {
        return Err(Error::ChannelControl {
            command,
            status: frame.get(5).copied().unwrap_or(0xFF),
        });
    }
    Ok(())
}

pub fn reset() -> Message {
    Message::new(RESET_SYSTEM, &[0])
}

pub fn request_message(channel: u8, id: u8) -> Message {
    Message::new(REQUEST_MESSAGE, &[channel, id])
}

pub fn set_network_key(network_number: u8, key: &[u8]) -> Message {
    let mut data = vec![network_number];
    data.extend(key);
    Message::new(SET_NETWORK_KEY, &data)
}

pub fn assign_channel(channel: u8, channel_type: u8, network: u8) -> Message {
    Message::new(ASSIGN_CHANNEL, &[channel, channel_type, network])
}

pub fn set_channel_id(
    channel: u8,
    device_id: u16,
    device_type: u8,
    transmission_type: u8,
) -> Message {
    Message::new(
        SET_CHANNEL_ID,
        &[
            channel,
            (device_id & 0xFF) as u8,
            ((device_id >> 8) & 0xFF) as u8,
            device_type,
            transmission_type,
        ],
    )
}

pub fn set_search_waveform(channel: u8) -> Message {
    Message::new(SET_SEARCH_WAVEFORM, &[channel, 0x53, 0x00])
}

pub fn set_channel_period(channel: u8, period: u16) -> Message {
    Message::new(
        SET_CHANNEL_PERIOD,
        &[channel, (period & 0xFF) as u8, ((period >> 8) & 0xFF) as u8],
    )
}

pub fn set_channel_search_timeout(channel: u8, timeout: u8) -> Message {
    Message::new(SET_CHANNEL_SEARCH_TIMEOUT, &[channel, timeout])
}

pub fn set_channel_frequency(channel: u8, frequency: u8) -> Message {
    Message::new(SET_CHANNEL_RF_FREQ, &[channel, frequency])
}

pub fn open_channel(channel: u8) -> Message {
    Message::new(OPEN_CHANNEL, &[channel])
}

pub fn close_channel(channel: u8) -> Message {
    Message::new(CLOSE_CHANNEL, &[channel])
}

pub fn unassign_channel(channel: u8) -> Message {
    Message::new(UNASSIGN_CHANNEL, &[channel])
}

// bytes_to_u16 takes a byte slice formatted in [LSB, MSB] and combines the
// two fields together into a single u16.
pub(crate) fn bytes_to_u16(b: &[u8]) -> u16 {
    (b[0] as u16) | ((b[1] as u16) << 8)
}

// bytes_to_u32 takes a byte slice formatted in [LSB, .., MSB] and returns a
// combined u32 value.
pub(crate) fn bytes_to_u32(b: &[u8]) -> u32 {
    (b[0] as u32) | ((b[1] as u32) << 8) | ((b[2] as u32) << 16) | ((b[3] as u32) << 24)
}

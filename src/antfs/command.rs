//! ANT-FS wire payloads: the beacon broadcast by a client device and the
//! command/response payloads exchanged inside acknowledged and burst
//! transfers. Command bodies are zero-padded to an 8-byte boundary before
//! transmission.
use crate::message::{bytes_to_u16, bytes_to_u32};
use crate::{error::Error, Result};

pub const ANTFS_HEADER: u8 = 0x44;
pub const BEACON_ID: u8 = 0x43;

// Commands
pub const LINK: u8 = 0x02;
pub const DISCONNECT: u8 = 0x03;
pub const AUTHENTICATE: u8 = 0x04;
pub const PING: u8 = 0x05;
pub const DOWNLOAD_REQUEST: u8 = 0x09;
pub const UPLOAD_REQUEST: u8 = 0x0A;
pub const ERASE_REQUEST: u8 = 0x0B;
pub const UPLOAD_DATA: u8 = 0x0C;

// Responses carry the command id with the top bit set.
pub const AUTHENTICATE_RESPONSE: u8 = 0x84;
pub const DOWNLOAD_RESPONSE: u8 = 0x89;
pub const UPLOAD_RESPONSE: u8 = 0x8A;
pub const ERASE_RESPONSE: u8 = 0x8B;
pub const UPLOAD_DATA_RESPONSE: u8 = 0x8C;

const BEACON_DATA_AVAILABLE_FLAG: u8 = 0x20;
const BEACON_UPLOAD_ENABLED_FLAG: u8 = 0x10;
const BEACON_PAIRING_ENABLED_FLAG: u8 = 0x08;
const BEACON_CHANNEL_PERIOD_MASK: u8 = 0x07;
const BEACON_STATE_MASK: u8 = 0x0F;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BeaconState {
    Link,
    Auth,
    Transport,
    Busy,
    Unknown(u8),
}

/// The 8-byte broadcast an ANT-FS client emits on every channel period.
/// Bytes 4..8 hold the device id and manufacturer id while the client is in
/// LINK state, and the host serial it is talking to once a session is
/// established.
#[derive(Clone, Copy, Debug)]
pub struct Beacon {
    status1: u8,
    status2: u8,
    descriptor: [u8; 4],
}

impl Beacon {
    pub fn parse(data: &[u8]) -> Option<Beacon> {
        if data.len() < 8 || data[0] != BEACON_ID {
            return None;
        }
        Some(Beacon {
            status1: data[1],
            status2: data[2],
            descriptor: [data[4], data[5], data[6], data[7]],
        })
    }

    pub fn state(&self) -> BeaconState {
        match self.status2 & BEACON_STATE_MASK {
            0x00 => BeaconState::Link,
            0x01 => BeaconState::Auth,
            0x02 => BeaconState::Transport,
            0x03 => BeaconState::Busy,
            other => BeaconState::Unknown(other),
        }
    }

    /// `(manufacturer, device)` pair advertised in LINK state.
    pub fn device_pair(&self) -> (u16, u16) {
        (
            bytes_to_u16(&self.descriptor[2..4]),
            bytes_to_u16(&self.descriptor[0..2]),
        )
    }

    /// Host serial echoed in AUTH and TRANSPORT state.
    pub fn host_serial(&self) -> u32 {
        bytes_to_u32(&self.descriptor)
    }

    pub fn data_available(&self) -> bool {
        self.status1 & BEACON_DATA_AVAILABLE_FLAG != 0
    }

    pub fn upload_enabled(&self) -> bool {
        self.status1 & BEACON_UPLOAD_ENABLED_FLAG != 0
    }

    pub fn pairing_enabled(&self) -> bool {
        self.status1 & BEACON_PAIRING_ENABLED_FLAG != 0
    }

    pub fn channel_period(&self) -> u8 {
        self.status1 & BEACON_CHANNEL_PERIOD_MASK
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AuthRequestKind {
    PassThrough = 0,
    Serial = 1,
    Pairing = 2,
    PasskeyExchange = 3,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AuthResponseKind {
    NotAvailable,
    Accept,
    Reject,
    Unknown(u8),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DownloadResult {
    Ok,
    NotFound,
    NotReadable,
    NotReady,
    InvalidRequest,
    BadCrc,
    Unknown(u8),
}

impl DownloadResult {
    fn from_code(code: u8) -> DownloadResult {
        match code {
            0 => DownloadResult::Ok,
            1 => DownloadResult::NotFound,
            2 => DownloadResult::NotReadable,
            3 => DownloadResult::NotReady,
            4 => DownloadResult::InvalidRequest,
            5 => DownloadResult::BadCrc,
            other => DownloadResult::Unknown(other),
        }
    }
}

fn pad_to_block(b: &mut Vec<u8>) {
    let rem = b.len() % 8;
    if rem != 0 {
        b.resize(b.len() + 8 - rem, 0);
    }
}

/// LINK command: ask the client to hop to our transport frequency/period
/// and address further beacons to our serial.
pub fn link(rf_frequency: u8, period: u8, host_serial: u32) -> Vec<u8> {
    let mut b = vec![ANTFS_HEADER, LINK, rf_frequency, period];
    b.extend_from_slice(&host_serial.to_le_bytes());
    b
}

/// AUTHENTICATE command. `data` is empty for a serial request, the friendly
/// host name for a pairing request, or the stored key for a passkey
/// exchange.
pub fn authenticate(kind: AuthRequestKind, host_serial: u32, data: &[u8]) -> Vec<u8> {
    let mut b = vec![ANTFS_HEADER, AUTHENTICATE, kind as u8, data.len() as u8];
    b.extend_from_slice(&host_serial.to_le_bytes());
    b.extend_from_slice(data);
    pad_to_block(&mut b);
    b
}

pub fn disconnect(kind: u8, duration: u8, app_duration: u8) -> Vec<u8> {
    let mut b = vec![ANTFS_HEADER, DISCONNECT, kind, duration, app_duration];
    pad_to_block(&mut b);
    b
}

pub fn download_request(
    file_index: u16,
    offset: u32,
    initial: bool,
    crc_seed: u16,
    max_block_size: u32,
) -> Vec<u8> {
    let mut b = vec![ANTFS_HEADER, DOWNLOAD_REQUEST];
    b.extend_from_slice(&file_index.to_le_bytes());
    b.extend_from_slice(&offset.to_le_bytes());
    b.push(0); // reserved
    b.push(initial as u8);
    b.extend_from_slice(&crc_seed.to_le_bytes());
    b.extend_from_slice(&max_block_size.to_le_bytes());
    pad_to_block(&mut b);
    b
}

/// Parsed AUTHENTICATE response. In a NOT_AVAILABLE reply to a serial
/// request the serial field carries the client's serial (some devices send
/// zero here) and the body its NUL-terminated name; in an ACCEPT reply to a
/// pairing request the body is the new authentication key.
#[derive(Debug)]
pub struct AuthResponse<'a> {
    pub kind: AuthResponseKind,
    pub serial: u32,
    pub body: &'a [u8],
}

impl<'a> AuthResponse<'a> {
    pub fn parse(data: &'a [u8]) -> Result<AuthResponse<'a>> {
        if data.len() < 8 || data[0] != ANTFS_HEADER || data[1] != AUTHENTICATE_RESPONSE {
            return Err(Error::BadFrame);
        }
        let kind = match data[2] {
            0 => AuthResponseKind::NotAvailable,
            1 => AuthResponseKind::Accept,
            2 => AuthResponseKind::Reject,
            other => AuthResponseKind::Unknown(other),
        };
        let len = data[3] as usize;
        if data.len() < 8 + len {
            return Err(Error::BadFrame);
        }
        Ok(AuthResponse {
            kind,
            serial: bytes_to_u32(&data[4..8]),
            body: &data[8..8 + len],
        })
    }

    /// Device name from a NOT_AVAILABLE body, up to the terminating NUL.
    pub fn name(&self) -> String {
        let end = self
            .body
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.body.len());
        String::from_utf8_lossy(&self.body[..end]).into_owned()
    }
}

/// Parsed DOWNLOAD response: one chunk of the requested file plus the CRC
/// seed to echo in the next request.
#[derive(Debug)]
pub struct DownloadResponse<'a> {
    pub result: DownloadResult,
    pub offset: u32,
    pub total: u32,
    pub crc_seed: u16,
    pub chunk: &'a [u8],
}

impl<'a> DownloadResponse<'a> {
    pub fn parse(data: &'a [u8]) -> Result<DownloadResponse<'a>> {
        if data.len() < 18 || data[0] != ANTFS_HEADER || data[1] != DOWNLOAD_RESPONSE {
            return Err(Error::BadFrame);
        }
        let chunk_len = bytes_to_u32(&data[4..8]) as usize;
        if data.len() < 16 + chunk_len + 2 {
            return Err(Error::BadFrame);
        }
        Ok(DownloadResponse {
            result: DownloadResult::from_code(data[2]),
            offset: bytes_to_u32(&data[8..12]),
            total: bytes_to_u32(&data[12..16]),
            crc_seed: bytes_to_u16(&data[data.len() - 2..]),
            chunk: &data[16..16 + chunk_len],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_command_layout() {
        let b = link(19, 4, 0x2A);
        // LINK = 0x02
        assert_eq!(b, vec![0x44, 0x02, 19, 4, 0x2A, 0, 0, 0]);
    }

    #[test]
    fn authenticate_pads_to_eight_bytes() {
        let b = authenticate(AuthRequestKind::Serial, 0x2A, &[]);
        assert_eq!(b, vec![0x44, 0x04, 1, 0, 0x2A, 0, 0, 0]);

        let b = authenticate(AuthRequestKind::Pairing, 0x2A, b"Antfs-Sync\0");
        assert_eq!(b.len(), 24);
        assert_eq!(&b[..4], &[0x44, 0x04, 2, 11]);
        assert_eq!(&b[4..8], &[0x2A, 0, 0, 0]);
        assert_eq!(&b[8..19], b"Antfs-Sync\0");
        assert_eq!(&b[19..], &[0; 5]);
    }

    #[test]
    fn disconnect_command_layout() {
        let b = disconnect(1, 0, 0);
        // DISCONNECT = 0x03
        assert_eq!(b, vec![0x44, 0x03, 1, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn download_request_layout() {
        let b = download_request(3, 0x1234, true, 0xBEEF, 0);
        assert_eq!(b.len(), 16);
        assert_eq!(&b[..2], &[0x44, 0x09]);
        assert_eq!(&b[2..4], &[3, 0]);
        assert_eq!(&b[4..8], &[0x34, 0x12, 0, 0]);
        assert_eq!(b[8], 0);
        assert_eq!(b[9], 1);
        assert_eq!(&b[10..12], &[0xEF, 0xBE]);
        assert_eq!(&b[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn beacon_fields() {
        let data = [BEACON_ID, 0x2B, 0x00, 0x00, 0x37, 0x00, 0x01, 0x00];
        let beacon = Beacon::parse(&data).unwrap();
        assert_eq!(beacon.state(), BeaconState::Link);
        assert_eq!(beacon.device_pair(), (1, 0x37));
        assert!(beacon.data_available());
        assert!(beacon.pairing_enabled());
        assert!(!beacon.upload_enabled());
        assert_eq!(beacon.channel_period(), 3);

        let data = [BEACON_ID, 0x20, 0x01, 0x00, 0x2A, 0x00, 0x00, 0x00];
        let beacon = Beacon::parse(&data).unwrap();
        assert_eq!(beacon.state(), BeaconState::Auth);
        assert_eq!(beacon.host_serial(), 0x2A);

        assert!(Beacon::parse(&[0x00; 8]).is_none());
        assert!(Beacon::parse(&data[..7]).is_none());
    }

    #[test]
    fn auth_response_parse() {
        let mut data = vec![0x44, 0x84, 0x00, 6];
        data.extend_from_slice(&0xDEADBEEFu32.to_le_bytes());
        data.extend_from_slice(b"WATCH\0");
        data.extend_from_slice(&[0, 0]); // padding
        let resp = AuthResponse::parse(&data).unwrap();
        assert_eq!(resp.kind, AuthResponseKind::NotAvailable);
        assert_eq!(resp.serial, 0xDEADBEEF);
        assert_eq!(resp.name(), "WATCH");

        assert!(AuthResponse::parse(&data[..6]).is_err());
    }

    #[test]
    fn download_response_parse() {
        let mut data = vec![0x44, 0x89, 0x00, 0x00];
        data.extend_from_slice(&8u32.to_le_bytes()); // chunk length
        data.extend_from_slice(&0u32.to_le_bytes()); // offset
        data.extend_from_slice(&16u32.to_le_bytes()); // total
        data.extend_from_slice(b"abcdefgh");
        data.extend_from_slice(&0xCAFEu16.to_le_bytes());
        let resp = DownloadResponse::parse(&data).unwrap();
        assert_eq!(resp.result, DownloadResult::Ok);
        assert_eq!(resp.offset, 0);
        assert_eq!(resp.total, 16);
        assert_eq!(resp.crc_seed, 0xCAFE);
        assert_eq!(resp.chunk, b"abcdefgh");
    }
}

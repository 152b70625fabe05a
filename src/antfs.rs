//! The ANT-FS client state machine. A device in range broadcasts beacons;
//! the engine answers them, walking the session through LINK (hop to the
//! transport frequency), AUTH (serial discovery, then pairing or key
//! exchange) and TRANSPORT (directory download, file downloads,
//! disconnect). All file payloads arrive as burst transfers that are
//! reassembled here.
pub mod command;
pub mod directory;

use std::fmt::Write as _;

use chrono::Utc;
use log::{debug, info, warn};

use crate::channel::{Channel, Config, BIDIRECTIONAL_RECEIVE};
use crate::message::{self, ChannelEvent};
use crate::radio::ControlPort;
use crate::store::{self, Store};
use crate::{error::Error, Result};

use command::{
    AuthRequestKind, AuthResponse, AuthResponseKind, Beacon, BeaconState, DownloadResponse,
    DownloadResult,
};
use directory::DirectoryEntry;

// Search profile the channel opens with, and the transport profile it hops
// to once the device acknowledges the LINK command.
const SEARCH_PERIOD: u16 = 4096;
const SEARCH_TIMEOUT: u8 = 0xFF;
const SEARCH_FREQUENCY: u8 = 50;
const TRANSPORT_PERIOD: u16 = 4096;
const TRANSPORT_TIMEOUT: u8 = 4;
const TRANSPORT_FREQUENCY: u8 = 19;
// LINK command parameters: channel period code 4 = 8 Hz.
const TRANSPORT_PERIOD_CODE: u8 = 4;

/// Friendly name sent with pairing requests; this is what shows up on the
/// watch's confirmation screen.
const PAIRING_NAME: &[u8] = b"Antfs-Sync\0";

/// Devices synced more recently than this are disconnected immediately so
/// they can go back to sleep.
const MIN_SYNC_INTERVAL_SECS: i64 = 30 * 60;

// file_index values outside the u16 range used to sequence the session
// teardown.
const INDEX_NONE: i32 = -1;
const INDEX_DISCONNECT: i32 = -2;
const INDEX_CLOSING: i32 = -3;

#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Empty,
    LinkReqSent,
    SerialReqSent,
    PairReqSent,
    KeySent,
    AuthRejected,
    Downloading,
    SyncFinished,
    Closed,
}

/// One sync session over one channel. Create it with [`SyncEngine::start`]
/// and feed it every frame the radio delivers for its channel; the session
/// is over when [`SyncEngine::is_open`] returns false.
pub struct SyncEngine {
    channel: Channel,
    state: State,
    /// Replay the last command on the next broadcast after a failed
    /// transfer. The payload is owned because the retry can happen long
    /// after the frame that produced it.
    retry: bool,
    last_sent: Vec<u8>,
    burst: Vec<u8>,

    device: Option<(u16, u16)>, // (manufacturer, device id)
    device_serial: u32,
    device_name: String,

    file_index: i32,
    download_result: DownloadResult,
    file_data: Vec<u8>,
    offset: u32,
    crc_seed: u16,
    request_next_chunk: bool,
    backlog: Vec<DirectoryEntry>,
}

impl SyncEngine {
    /// Open the channel in the ANT-FS search profile and wait for beacons.
    pub fn start(port: &mut impl ControlPort) -> Result<SyncEngine> {
        let config = Config::new()
            .channel_type(BIDIRECTIONAL_RECEIVE)
            .period(SEARCH_PERIOD)
            .search_timeout(SEARCH_TIMEOUT)
            .rf_frequency(SEARCH_FREQUENCY);
        let channel = Channel::open(port, 0, &config)?;
        Ok(SyncEngine {
            channel,
            state: State::Empty,
            retry: false,
            last_sent: Vec::new(),
            burst: Vec::new(),
            device: None,
            device_serial: 0,
            device_name: String::new(),
            file_index: INDEX_NONE,
            download_result: DownloadResult::Ok,
            file_data: Vec::new(),
            offset: 0,
            crc_seed: 0,
            request_next_chunk: false,
            backlog: Vec::new(),
        })
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn channel_number(&self) -> u8 {
        self.channel.number()
    }

    /// Best-effort teardown for error paths.
    pub fn shutdown(&mut self, port: &mut impl ControlPort) {
        self.channel.shutdown(port);
        self.state = State::Closed;
    }

    /// Handle one frame delivered for this engine's channel.
    pub fn handle_frame(
        &mut self,
        port: &mut impl ControlPort,
        store: &mut Store,
        frame: &[u8],
    ) -> Result<()> {
        if self.channel.handle_close_event(port, frame)? {
            return Ok(());
        }
        if self.state == State::Closed {
            return Ok(());
        }
        if frame.len() < 5 {
            return Err(Error::BadFrame);
        }

        match frame[2] {
            message::BROADCAST_DATA => {
                if self.retry {
                    let data = std::mem::take(&mut self.last_sent);
                    self.send(port, &data)?;
                } else if frame[4] == command::BEACON_ID {
                    let payload = frame[4..frame.len() - 1].to_vec();
                    self.on_beacon(port, store, &payload)?;
                }
            }
            message::RESPONSE_CHANNEL if frame.len() > 5 && frame[4] == 0x01 => {
                self.on_channel_event(port, ChannelEvent::from_code(frame[5]))?;
            }
            message::RESPONSE_CHANNEL
                if frame[4] == message::ACKNOWLEDGE_DATA
                    || frame[4] == message::BURST_TRANSFER_DATA =>
            {
                // The radio confirmed our outgoing transfer; after a LINK
                // request this is the moment to hop to the transport
                // profile the device was told to meet us on.
                if self.state == State::LinkReqSent {
                    self.channel.configure(
                        port,
                        TRANSPORT_PERIOD,
                        TRANSPORT_TIMEOUT,
                        TRANSPORT_FREQUENCY,
                    )?;
                }
            }
            message::BURST_TRANSFER_DATA => {
                let seq = frame[3] >> 5;
                if seq == 0 {
                    self.burst.clear();
                }
                self.burst.extend_from_slice(&frame[4..frame.len() - 1]);
                if seq & 0x04 != 0 {
                    let data = std::mem::take(&mut self.burst);
                    if data.first() == Some(&command::BEACON_ID) {
                        self.on_beacon(port, store, &data)?;
                    } else {
                        warn!("unexpected burst transfer: {:02x?}", data);
                    }
                }
            }
            _ => {
                debug!("unhandled frame on channel {}: {:02x?}", frame[3], frame);
            }
        }
        Ok(())
    }

    fn on_channel_event(
        &mut self,
        port: &mut impl ControlPort,
        event: Option<ChannelEvent>,
    ) -> Result<()> {
        match event {
            Some(ChannelEvent::TransferTxCompleted) => {
                self.retry = false;
            }
            Some(ChannelEvent::TransferTxFailed)
            | Some(ChannelEvent::RxFail)
            | Some(ChannelEvent::TransferRxFailed) => {
                // Drained on the next beacon by resending the last command.
                self.retry = true;
            }
            Some(ChannelEvent::RxFailGoToSearch) => {
                // The device went away (synced devices do this after the
                // disconnect). Drop everything we knew about it.
                self.forget_device();
                self.channel.request_close(port)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn on_beacon(
        &mut self,
        port: &mut impl ControlPort,
        store: &mut Store,
        data: &[u8],
    ) -> Result<()> {
        let Some(beacon) = Beacon::parse(data) else {
            return Ok(());
        };
        match beacon.state() {
            BeaconState::Link => self.on_link_beacon(port, &beacon)?,
            BeaconState::Auth => self.on_auth_beacon(port, store, &beacon)?,
            BeaconState::Transport => self.on_transport_beacon(port)?,
            BeaconState::Busy => {}
            BeaconState::Unknown(state) => {
                warn!("beacon with unknown state {state:#x}: {data:02x?}");
            }
        }
        // A command can ride along in the same burst, right after the
        // 8-byte beacon.
        if data.len() > 8 && data[8] == command::ANTFS_HEADER {
            self.on_command(port, store, &data[8..])?;
        }
        Ok(())
    }

    fn on_link_beacon(&mut self, port: &mut impl ControlPort, beacon: &Beacon) -> Result<()> {
        let (manufacturer, device) = beacon.device_pair();
        match self.device {
            None => {
                self.device = Some((manufacturer, device));
                self.device_serial = 0;
                if store::is_blacklisted_device(manufacturer, device) {
                    info!("ignoring link request from blacklisted device {manufacturer}.{device}");
                    self.channel.request_close(port)?;
                    self.state = State::Closed;
                    return Ok(());
                }
                info!("received link request from {manufacturer}.{device}");
            }
            Some(pair) if pair != (manufacturer, device) => {
                return Err(Error::DeviceMismatch {
                    manufacturer: pair.0,
                    device: pair.1,
                    got_manufacturer: manufacturer,
                    got_device: device,
                });
            }
            Some(_) => {}
        }

        self.send(
            port,
            &command::link(
                TRANSPORT_FREQUENCY,
                TRANSPORT_PERIOD_CODE,
                port.serial_number(),
            ),
        )?;
        self.state = State::LinkReqSent;
        Ok(())
    }

    fn on_auth_beacon(
        &mut self,
        port: &mut impl ControlPort,
        store: &mut Store,
        beacon: &Beacon,
    ) -> Result<()> {
        let host_serial = beacon.host_serial();
        if host_serial != port.serial_number() {
            // The device is talking to some other host.
            return Err(Error::SerialMismatch {
                expected: port.serial_number(),
                got: host_serial,
            });
        }
        if self.device.is_none() {
            // The device pair is learned from the LINK beacon; jumping
            // straight to AUTH means we missed the start of the session.
            return Err(Error::BadFrame);
        }

        if self.device_serial == 0 {
            if self.state != State::SerialReqSent {
                self.send(
                    port,
                    &command::authenticate(AuthRequestKind::Serial, port.serial_number(), &[]),
                )?;
            }
            self.state = State::SerialReqSent;
            return Ok(());
        }

        let key = store.get_key(self.device_serial);
        if store::is_blacklisted_serial(self.device_serial)
            || (key.is_empty() && self.state == State::AuthRejected)
        {
            info!(
                "will not pair with {} ({})",
                self.device_name, self.device_serial
            );
            self.channel.request_close(port)?;
            self.state = State::Closed;
        } else if key.is_empty() {
            if self.state != State::PairReqSent {
                info!(
                    "attempting pair request with {} ({})",
                    self.device_name, self.device_serial
                );
                self.send(
                    port,
                    &command::authenticate(
                        AuthRequestKind::Pairing,
                        port.serial_number(),
                        PAIRING_NAME,
                    ),
                )?;
                self.state = State::PairReqSent;
            }
        } else if self.state != State::KeySent {
            info!(
                "attempting key exchange with {} ({})",
                self.device_name, self.device_serial
            );
            self.send(
                port,
                &command::authenticate(
                    AuthRequestKind::PasskeyExchange,
                    port.serial_number(),
                    &key,
                ),
            )?;
            self.state = State::KeySent;
        }
        Ok(())
    }

    fn on_transport_beacon(&mut self, port: &mut impl ControlPort) -> Result<()> {
        if self.file_index == INDEX_DISCONNECT {
            info!(
                "disconnecting from {} ({})",
                self.device_name, self.device_serial
            );
            self.send(port, &command::disconnect(1, 0, 0))?;
            self.file_index = INDEX_CLOSING;
            return Ok(());
        }

        if self.file_index == INDEX_NONE {
            // First transport beacon of the session: fetch the directory.
            info!(
                "downloading file index from {} ({})",
                self.device_name, self.device_serial
            );
            self.file_index = 0;
            self.file_data.clear();
            self.offset = 0;
            self.crc_seed = 0;
            self.request_next_chunk = true;
            self.state = State::Downloading;
        }

        if self.request_next_chunk {
            let request = command::download_request(
                self.file_index as u16,
                self.offset,
                true,
                self.crc_seed,
                0,
            );
            self.send(port, &request)?;
            self.request_next_chunk = false;
        }
        Ok(())
    }

    fn on_command(
        &mut self,
        port: &mut impl ControlPort,
        store: &mut Store,
        data: &[u8],
    ) -> Result<()> {
        if data.len() < 2 {
            return Err(Error::BadFrame);
        }
        match data[1] {
            command::AUTHENTICATE_RESPONSE => self.on_auth_response(port, store, data),
            command::DOWNLOAD_RESPONSE => self.on_download_response(port, store, data),
            other => {
                warn!("unknown command {other:#04x}: {data:02x?}");
                Ok(())
            }
        }
    }

    fn on_auth_response(
        &mut self,
        port: &mut impl ControlPort,
        store: &mut Store,
        data: &[u8],
    ) -> Result<()> {
        let response = AuthResponse::parse(data)?;

        // Some devices answer the serial request with serial 0 and only
        // reveal the real value later; a non-zero serial that changes
        // mid-session means we are suddenly talking to a different device.
        if response.serial != 0 && self.device_serial != 0 && response.serial != self.device_serial
        {
            return Err(Error::SerialMismatch {
                expected: self.device_serial,
                got: response.serial,
            });
        }

        match response.kind {
            AuthResponseKind::NotAvailable => {
                if self.state != State::SerialReqSent {
                    return Err(Error::BadFrame);
                }
                self.device_serial = response.serial;
                self.device_name = response.name();

                let last_sync = store.last_successful_sync(self.device_serial);
                let since = Utc::now().timestamp() - last_sync;
                let recently_synced = last_sync > 0 && since < MIN_SYNC_INTERVAL_SECS;
                info!(
                    "identified device {} ({}){}",
                    self.device_name,
                    self.device_serial,
                    if recently_synced {
                        format!(", recently synced ({since} seconds ago)")
                    } else {
                        String::new()
                    }
                );
                if recently_synced {
                    self.channel.request_close(port)?;
                    self.state = State::Closed;
                }
            }
            AuthResponseKind::Accept => match self.state {
                State::PairReqSent => {
                    // The body is the key to use from now on.
                    info!(
                        "device {} ({}) accepted pairing request",
                        self.device_name, self.device_serial
                    );
                    store.put_key(self.device_serial, response.body)?;
                }
                State::KeySent => {
                    info!(
                        "device {} ({}) accepted key exchange",
                        self.device_name, self.device_serial
                    );
                }
                _ => return Err(Error::BadFrame),
            },
            AuthResponseKind::Reject => match self.state {
                State::PairReqSent => {
                    info!(
                        "device {} ({}) rejected pairing",
                        self.device_name, self.device_serial
                    );
                    self.state = State::AuthRejected;
                }
                State::KeySent => {
                    info!(
                        "device {} ({}) rejected key",
                        self.device_name, self.device_serial
                    );
                    self.state = State::AuthRejected;
                }
                _ => return Err(Error::BadFrame),
            },
            AuthResponseKind::Unknown(kind) => {
                warn!("authenticate response with unknown type {kind}: {data:02x?}");
            }
        }
        Ok(())
    }

    fn on_download_response(
        &mut self,
        port: &mut impl ControlPort,
        store: &mut Store,
        data: &[u8],
    ) -> Result<()> {
        let response = DownloadResponse::parse(data)?;
        self.download_result = response.result;

        if response.offset != self.offset {
            // Stale or out-of-order chunk; ask again on the next beacon.
            self.retry = true;
            return Ok(());
        }

        let download_complete = if response.result == DownloadResult::Ok {
            self.file_data.extend_from_slice(response.chunk);
            self.offset += response.chunk.len() as u32;
            self.crc_seed = response.crc_seed;
            self.offset == response.total
        } else {
            // No point continuing after an error result.
            true
        };

        self.request_next_chunk = !download_complete;
        if download_complete {
            self.on_download_complete(port, store)?;
        }
        Ok(())
    }

    fn on_download_complete(
        &mut self,
        _port: &mut impl ControlPort,
        store: &mut Store,
    ) -> Result<()> {
        if self.download_result == DownloadResult::Ok {
            if self.file_index == 0 {
                self.on_directory_complete(store)?;
            } else {
                self.on_file_complete(store)?;
            }
        } else {
            warn!(
                "failed to download file index {} ({:?})",
                self.file_index, self.download_result
            );
        }

        if self.file_index > 0 {
            self.backlog.remove(0);
        }
        self.schedule_next_download(store);
        Ok(())
    }

    fn on_directory_complete(&mut self, store: &mut Store) -> Result<()> {
        let data = std::mem::take(&mut self.file_data);
        if data.len() < directory::ENTRY_SIZE {
            warn!("directory download too short ({} bytes)", data.len());
            return Ok(());
        }

        // 16-byte directory preamble, then one entry per file.
        let entries: Vec<DirectoryEntry> = data[directory::ENTRY_SIZE..]
            .chunks_exact(directory::ENTRY_SIZE)
            .map(DirectoryEntry::parse)
            .collect();

        let mut listing = String::new();
        let _ = writeln!(
            listing,
            "File list for {} ({})",
            self.device_name, self.device_serial
        );
        let _ = writeln!(
            listing,
            "Index\tType\tSubType\tFileNum\tDflags\tFlags\tSize\tTimestamp"
        );

        let mut total_size = 0u64;
        let mut activity_count = 0usize;
        let mut activity_size = 0u64;
        let mut wanted = Vec::new();
        for entry in &entries {
            total_size += entry.size as u64;
            if entry.file_type == directory::FILE_TYPE_FIT
                && entry.sub_type == directory::SUB_TYPE_ACTIVITY
            {
                activity_count += 1;
                activity_size += entry.size as u64;
            }
            if entry.file_type == directory::FILE_TYPE_FIT && entry.is_readable() {
                // Skip anything already downloaded on a previous run.
                let target = store
                    .file_path(self.device_serial, entry.sub_type)?
                    .join(entry.file_name());
                if !target.exists() {
                    wanted.push(entry.clone());
                }
            }
            let _ = writeln!(listing, "{entry}");
        }

        let total_k = total_size.div_ceil(1024);
        let activity_k = activity_size.div_ceil(1024);
        let _ = writeln!(
            listing,
            "Total of {total_k}k used ({activity_count} activities use {activity_k}k)"
        );
        store.write_file_list(self.device_serial, &listing)?;
        info!(
            "device {} ({}) has {}k used ({} activities use {}k)",
            self.device_name, self.device_serial, total_k, activity_count, activity_k
        );

        if wanted.is_empty() {
            info!(
                "nothing to download from {} ({})",
                self.device_name, self.device_serial
            );
        } else {
            let download_k: u64 = wanted
                .iter()
                .map(|e| e.size as u64)
                .sum::<u64>()
                .div_ceil(1024);
            info!(
                "downloading {} files, total of {}k, from {} ({})",
                wanted.len(),
                download_k,
                self.device_name,
                self.device_serial
            );
        }
        self.backlog = wanted;
        Ok(())
    }

    fn on_file_complete(&mut self, store: &mut Store) -> Result<()> {
        let entry = match self.backlog.first() {
            Some(entry) if entry.index as i32 == self.file_index => entry,
            _ => return Err(Error::BadFrame),
        };
        let path = store
            .file_path(self.device_serial, entry.sub_type)?
            .join(entry.file_name());
        store::write_atomic(&path, &self.file_data)?;
        info!("wrote {}, {} bytes", path.display(), self.file_data.len());
        Ok(())
    }

    fn schedule_next_download(&mut self, store: &mut Store) {
        if let Some(entry) = self.backlog.first() {
            self.file_index = entry.index as i32;
            self.download_result = DownloadResult::Ok;
            self.file_data.clear();
            self.offset = 0;
            self.crc_seed = 0;
            self.request_next_chunk = true;
            self.state = State::Downloading;
        } else {
            store.mark_successful_sync(self.device_serial);
            self.file_index = INDEX_DISCONNECT;
            self.state = State::SyncFinished;
        }
    }

    /// Send an ANT-FS command payload: a single acknowledged packet when it
    /// fits, otherwise a burst with the sequence number in the top three
    /// bits of the channel byte (0, then 1,2,3,1,2,3.., last OR'd with 4).
    fn send(&mut self, port: &mut impl ControlPort, data: &[u8]) -> Result<()> {
        debug_assert!(!data.is_empty() && data.len() % 8 == 0);

        if data.len() == 8 {
            let mut payload = vec![self.channel.number()];
            payload.extend_from_slice(data);
            port.write_message(&message::Message::new(message::ACKNOWLEDGE_DATA, &payload))?;
        } else {
            let npackets = data.len() / 8;
            for i in 0..npackets {
                let mut seq = if i == 0 { 0 } else { ((i - 1) % 3 + 1) as u8 };
                if i == npackets - 1 {
                    seq |= 0x04;
                }
                let mut payload = vec![(seq << 5) | self.channel.number()];
                payload.extend_from_slice(&data[i * 8..(i + 1) * 8]);
                port.write_message(&message::Message::new(
                    message::BURST_TRANSFER_DATA,
                    &payload,
                ))?;
            }
        }

        self.last_sent = data.to_vec();
        self.retry = false;
        Ok(())
    }

    fn forget_device(&mut self) {
        self.file_index = INDEX_NONE;
        self.download_result = DownloadResult::Ok;
        self.file_data.clear();
        self.offset = 0;
        self.crc_seed = 0;
        self.request_next_chunk = false;
        self.backlog.clear();
        self.burst.clear();

        self.device = None;
        self.device_serial = 0;
        self.device_name.clear();

        self.retry = false;
    }
}

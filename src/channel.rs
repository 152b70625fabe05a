//! A channel is the radio's connection to a single remote device. Opening
//! one is a fixed sequence of control writes, each acknowledged by the
//! radio before the next is sent: assign, set channel id, set the search
//! waveform, configure period/timeout/frequency, open. The channel stays
//! open until the radio reports EVENT_CHANNEL_CLOSED, at which point it is
//! unassigned.
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::message::{self, ChannelEvent, Message};
use crate::radio::ControlPort;
use crate::Result;

pub const BIDIRECTIONAL_RECEIVE: u8 = 0x00;

/// Channel configuration parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    channel_type: u8,
    network: u8,
    period: u16,
    search_timeout: u8,
    rf_frequency: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            channel_type: BIDIRECTIONAL_RECEIVE,
            network: 0,
            period: 8192,
            search_timeout: 30,
            rf_frequency: 66,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn channel_type(mut self, channel_type: u8) -> Self {
        self.channel_type = channel_type;
        self
    }

    pub fn network(mut self, network: u8) -> Self {
        self.network = network;
        self
    }

    pub fn period(mut self, period: u16) -> Self {
        self.period = period;
        self
    }

    pub fn search_timeout(mut self, search_timeout: u8) -> Self {
        self.search_timeout = search_timeout;
        self
    }

    pub fn rf_frequency(mut self, rf_frequency: u8) -> Self {
        self.rf_frequency = rf_frequency;
        self
    }
}

/// Channel maintains the channel number and the open flag. All operations
/// go through a [`ControlPort`], so the radio stays the single owner of the
/// USB device.
#[derive(Debug)]
pub struct Channel {
    number: u8,
    open: bool,
}

impl Channel {
    /// Assign and open a channel on the radio. Every step is synchronous:
    /// write the control frame, read the reply, verify the echo.
    pub fn open(port: &mut impl ControlPort, number: u8, config: &Config) -> Result<Channel> {
        control(
            port,
            &message::assign_channel(number, config.channel_type, config.network),
        )?;
        // Wildcard device id, device type 1: pair with whichever ANT-FS
        // client answers the search first.
        control(port, &message::set_channel_id(number, 0, 1, 0))?;
        control(port, &message::set_search_waveform(number))?;

        let channel = Channel {
            number,
            open: false,
        };
        channel.configure(
            port,
            config.period,
            config.search_timeout,
            config.rf_frequency,
        )?;

        control(port, &message::open_channel(number))?;
        info!("channel {} is open", number);
        Ok(Channel {
            number,
            open: true,
        })
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Re-issue the period, search timeout and RF frequency configuration.
    /// Used to hop an ANT-FS channel from the search profile to the
    /// transport profile after the link handshake.
    pub fn configure(
        &self,
        port: &mut impl ControlPort,
        period: u16,
        search_timeout: u8,
        rf_frequency: u8,
    ) -> Result<()> {
        control(port, &message::set_channel_period(self.number, period))?;
        control(
            port,
            &message::set_channel_search_timeout(self.number, search_timeout),
        )?;
        control(
            port,
            &message::set_channel_frequency(self.number, rf_frequency),
        )?;
        Ok(())
    }

    /// Ask the radio to close the channel. The channel stays open until the
    /// EVENT_CHANNEL_CLOSED event arrives on the inbound stream; keep
    /// feeding messages through [`Channel::handle_close_event`] until
    /// [`Channel::is_open`] goes false.
    pub fn request_close(&self, port: &mut impl ControlPort) -> Result<()> {
        debug!("requesting close of channel {}", self.number);
        control(port, &message::close_channel(self.number))
    }

    /// Intercept the channel-closed event. Returns true when the frame was
    /// the close event and has been fully handled (the channel is then
    /// unassigned and marked closed); the caller routes everything else to
    /// its protocol layer.
    pub fn handle_close_event(
        &mut self,
        port: &mut impl ControlPort,
        frame: &[u8],
    ) -> Result<bool> {
        if frame.len() > 5
            && frame[2] == message::RESPONSE_CHANNEL
            && frame[4] == 0x01
            && ChannelEvent::from_code(frame[5]) == Some(ChannelEvent::ChannelClosed)
        {
            info!("channel {} closed", self.number);
            self.open = false;
            control(port, &message::unassign_channel(self.number))?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Best-effort teardown for error paths: close, give the radio a moment
    /// to generate the close event, then unassign. Errors are logged and
    /// swallowed.
    pub fn shutdown(&mut self, port: &mut impl ControlPort) {
        if !self.open {
            return;
        }
        self.open = false;
        if let Err(e) = control(port, &message::close_channel(self.number)) {
            warn!("closing channel {}: {}", self.number, e);
            return;
        }
        // The close event will be generated but nothing is pumping the
        // inbound stream any more; wait for it rather than unassigning an
        // open channel.
        thread::sleep(Duration::from_secs(1));
        if let Err(e) = control(port, &message::unassign_channel(self.number)) {
            warn!("unassigning channel {}: {}", self.number, e);
        }
    }
}

fn control(port: &mut impl ControlPort, msg: &Message) -> Result<()> {
    let channel = msg.data.first().copied().unwrap_or(0);
    port.write_message(msg)?;
    let reply = port.read_reply()?;
    message::check_channel_response(&reply, channel, msg.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakePort;

    #[test]
    fn open_runs_the_full_control_sequence() {
        let mut port = FakePort::new(42);
        let config = Config::new()
            .period(4096)
            .search_timeout(0xFF)
            .rf_frequency(50);
        let channel = Channel::open(&mut port, 0, &config).unwrap();
        assert!(channel.is_open());
        assert_eq!(channel.number(), 0);

        let ids: Vec<u8> = port.written.iter().map(|m| m.id).collect();
        assert_eq!(
            ids,
            vec![
                message::ASSIGN_CHANNEL,
                message::SET_CHANNEL_ID,
                message::SET_SEARCH_WAVEFORM,
                message::SET_CHANNEL_PERIOD,
                message::SET_CHANNEL_SEARCH_TIMEOUT,
                message::SET_CHANNEL_RF_FREQ,
                message::OPEN_CHANNEL,
            ]
        );
        assert_eq!(port.written[3].data, vec![0, 0x00, 0x10]);
        assert_eq!(port.written[4].data, vec![0, 0xFF]);
        assert_eq!(port.written[5].data, vec![0, 50]);
    }

    #[test]
    fn open_fails_on_error_status() {
        let mut port = FakePort::new(42);
        port.fail_with_status = Some(0x15);
        assert!(Channel::open(&mut port, 0, &Config::new()).is_err());
    }

    #[test]
    fn close_event_unassigns_the_channel() {
        let mut port = FakePort::new(42);
        let mut channel = Channel::open(&mut port, 0, &Config::new()).unwrap();
        port.written.clear();

        let event = Message::new(message::RESPONSE_CHANNEL, &[0, 0x01, 0x07]).encode();
        assert!(channel.handle_close_event(&mut port, &event).unwrap());
        assert!(!channel.is_open());
        assert_eq!(port.written.last().unwrap().id, message::UNASSIGN_CHANNEL);

        // Anything else passes through untouched.
        let broadcast = Message::new(message::BROADCAST_DATA, &[0; 9]).encode();
        assert!(!channel.handle_close_event(&mut port, &broadcast).unwrap());
    }
}

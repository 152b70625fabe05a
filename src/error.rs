use thiserror::Error;

use crate::fit::FitError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("USB ANT radio not found")]
    RadioNotFound,
    #[error("ANT radio exposes no bulk IN/OUT endpoint pair")]
    NoBulkEndpoints,
    #[error("{0}")]
    Usb(#[from] rusb::Error),
    #[error("timed out writing to the ANT radio")]
    WriteTimeout,
    #[error("timed out waiting for a reply from the ANT radio")]
    ReadTimeout,
    #[error("received frame with bad checksum")]
    BadChecksum,
    #[error("received malformed frame")]
    BadFrame,
    #[error("channel control command {command:#04x} failed with status {status:#04x}")]
    ChannelControl { command: u8, status: u8 },
    #[error("serial mismatch (got {got}, expected {expected})")]
    SerialMismatch { expected: u32, got: u32 },
    #[error("link beacon from a different device ({got_manufacturer}.{got_device}, \
             session started with {manufacturer}.{device})")]
    DeviceMismatch {
        manufacturer: u16,
        device: u16,
        got_manufacturer: u16,
        got_device: u16,
    },
    #[error("{0}")]
    Fit(#[from] FitError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("cannot determine a home directory for storage")]
    NoHomeDirectory,
    #[error("another instance is already running as PID {0}")]
    AlreadyRunning(i32),
}

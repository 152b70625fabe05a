//! fit-sync is a Rust implementation of an ANT-FS sync host. It drives a
//! USB ANT radio as a receiving host: nearby fitness devices (watches, bike
//! computers) announce themselves with ANT-FS beacons, the sync engine links
//! with them, authenticates by pairing or stored-key exchange, downloads the
//! device's file directory, and pulls down any FIT files that are not
//! already in local storage.
//!
//! The library is layered bottom-up: `message` builds and verifies ANT
//! frames, `usb` owns the radio's bulk endpoints, `radio` runs the stick
//! lifecycle and dispatches inbound frames, `channel` handles per-channel
//! configuration, and `antfs` implements the beacon-driven client state
//! machine on top. The `fit` module is an independent decoder for the FIT
//! file format, and `store` owns the on-disk storage tree shared by both
//! the radio daemon and the USB batch processor.
pub mod antfs;
pub mod channel;
mod error;
pub mod fit;
pub mod message;
pub mod pidlock;
pub mod radio;
pub mod store;
pub mod usb;

#[cfg(test)]
pub(crate) mod testutil;

pub type Result<T> = std::result::Result<T, error::Error>;

pub use error::Error;
pub use radio::{ControlPort, Radio, ANTFS_NETWORK_KEY};

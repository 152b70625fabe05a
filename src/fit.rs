//! Decoder for the FIT (Flexible and Interoperable Data Transfer) file
//! format: self-describing binary records whose schema is carried in-band
//! by definition messages. A file is one or more concatenated chunks, each
//! with its own header and CRC.
//!
//! Only the two messages the sync tools need are decoded semantically
//! (`FileId` and `FileCreator`); everything else is skipped field-wise
//! while still tracking the running timestamp.
pub mod decode;
pub mod types;

pub use decode::{crc16, read_messages, FitError};
pub use types::{
    FitByte, FitChar, FitEnum, FitFloat32, FitFloat64, FitSint16, FitSint32, FitSint8, FitUint16,
    FitUint16z, FitUint32, FitUint32z, FitUint8, FitUint8z, Value,
};

/// Seconds between the FIT epoch (1989-12-31 00:00:00 UTC) and the Unix
/// epoch.
pub const FIT_EPOCH_OFFSET: u32 = 631_065_600;

/// Global message number 0: identifies the file and the device that wrote
/// it. `time_created` is converted to Unix seconds during decoding.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileId {
    pub file_type: FitEnum,
    pub manufacturer: FitEnum,
    pub product: FitUint16,
    pub serial_number: FitUint32z,
    pub time_created: FitUint32,
}

/// Global message number 49.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileCreator {
    pub software_version: FitUint16,
    pub hardware_version: FitUint8,
}

/// Whether to keep decoding after a visitor callback.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receives decoded messages. Returning [`Flow::Stop`] from any callback
/// ends decoding immediately; useful when only the file header matters and
/// the rest of a large file can be skipped.
pub trait FitVisitor {
    fn on_file_id(&mut self, _message: &FileId) -> Flow {
        Flow::Continue
    }

    fn on_file_creator(&mut self, _message: &FileCreator) -> Flow {
        Flow::Continue
    }

    /// Called for every data record with its global message number and
    /// effective timestamp (absolute, or expanded from a compressed
    /// header), when one is known.
    fn on_record(&mut self, _global: u16, _timestamp: Option<u32>) -> Flow {
        Flow::Continue
    }
}

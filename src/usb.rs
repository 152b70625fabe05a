use std::time::Duration;

pub use rusb::{Context, UsbContext};
use rusb::{Device, DeviceHandle, Direction, Error as UsbError, TransferType};

use crate::{error::Error, Result};

// ANT USB radios we know how to talk to. The first match wins.
const ANT_RADIO_IDS: [(u16, u16); 2] = [(0x0FCF, 0x1008), (0x0FCF, 0x1009)];

const USB_CONFIGURATION: u8 = 1;
const USB_INTERFACE: u8 = 0;

/// The pair of bulk endpoints the radio layer reads frames from and writes
/// frames to. Factored out as a trait so the radio state machine can be
/// exercised against a scripted transport in tests.
pub trait BulkTransport {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize>;
}

pub struct UsbDevice<T: UsbContext> {
    handle: DeviceHandle<T>,
    endpoint_in: u8,
    endpoint_out: u8,
}

impl<T: UsbContext> UsbDevice<T> {
    /// Find and claim the first ANT radio on the bus. Only one radio is
    /// supported at a time.
    pub fn open(ctx: &mut T) -> Result<UsbDevice<T>> {
        for device in ctx.devices()?.iter() {
            let desc = device.device_descriptor()?;
            let id = (desc.vendor_id(), desc.product_id());
            if ANT_RADIO_IDS.contains(&id) {
                return Self::claim(device);
            }
        }
        Err(Error::RadioNotFound)
    }

    fn claim(device: Device<T>) -> Result<UsbDevice<T>> {
        let mut handle = device.open()?;
        // A kernel driver may already own the interface; "not attached" is
        // not an error. This call is Linux only.
        match handle.detach_kernel_driver(USB_INTERFACE) {
            Ok(()) | Err(UsbError::NotFound) | Err(UsbError::NotSupported) => {}
            Err(e) => return Err(e.into()),
        }
        handle.claim_interface(USB_INTERFACE)?;
        if handle.active_configuration()? != USB_CONFIGURATION {
            handle.set_active_configuration(USB_CONFIGURATION)?;
        }
        handle.reset()?;

        let (endpoint_in, endpoint_out) = find_bulk_endpoints(&device)?;
        Ok(UsbDevice {
            handle,
            endpoint_in,
            endpoint_out,
        })
    }
}

impl<T: UsbContext> BulkTransport for UsbDevice<T> {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.handle
            .read_bulk(self.endpoint_in, buf, timeout)
            .map_err(Error::Usb)
    }

    fn write(&mut self, data: &[u8], timeout: Duration) -> Result<usize> {
        self.handle
            .write_bulk(self.endpoint_out, data, timeout)
            .map_err(|e| match e {
                UsbError::Timeout => Error::WriteTimeout,
                e => Error::Usb(e),
            })
    }
}

/// Locate the single bulk IN and bulk OUT endpoint on the default
/// alt-setting of interface 0.
fn find_bulk_endpoints<T: UsbContext>(device: &Device<T>) -> Result<(u8, u8)> {
    let config = device.config_descriptor(0)?;
    let mut endpoint_in = None;
    let mut endpoint_out = None;
    for interface in config.interfaces() {
        for descriptor in interface.descriptors() {
            for endpoint in descriptor.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => endpoint_in = Some(endpoint.address()),
                    Direction::Out => endpoint_out = Some(endpoint.address()),
                }
            }
        }
    }
    match (endpoint_in, endpoint_out) {
        (Some(i), Some(o)) => Ok((i, o)),
        _ => Err(Error::NoBulkEndpoints),
    }
}

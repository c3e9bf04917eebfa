//! USB transport layer.
//!
//! The FEL protocol engine only needs a bulk transfer primitive and the two
//! endpoint addresses, so that is the whole of the [`UsbTransport`] trait.
//! [`UsbHandle`] is the libusb-backed implementation used against real
//! hardware; the protocol tests drive the same engine through an in-memory
//! device instead.

use std::fmt;
use std::time::Duration;

use failure::{bail, Error, Fail, ResultExt};
use log::{debug, warn};

use crate::FelError;

/// Bulk USB transfer primitive.
///
/// Implementations perform a single bulk transfer and report how many bytes
/// were actually moved; callers loop until their buffer is satisfied.
pub trait UsbTransport {
    /// Address of the bulk IN endpoint.
    fn endpoint_in(&self) -> u8;

    /// Address of the bulk OUT endpoint.
    fn endpoint_out(&self) -> u8;

    /// Performs one bulk OUT transfer, returning the number of bytes sent.
    fn bulk_send(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, Error>;

    /// Performs one bulk IN transfer, returning the number of bytes received.
    fn bulk_recv(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize, Error>;
}

/// USB device handle for a FEL device, backed by libusb.
pub struct UsbHandle<'h> {
    device_handle: libusb::DeviceHandle<'h>,
    endpoint_in: u8,
    endpoint_out: u8,
    iface_detached: bool,
}

impl<'h> fmt::Debug for UsbHandle<'h> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UsbHandle")
            .field("endpoint_in", &self.endpoint_in)
            .field("endpoint_out", &self.endpoint_out)
            .field("iface_detached", &self.iface_detached)
            .finish()
    }
}

impl<'h> UsbHandle<'h> {
    /// Creates a USB handle from the given device, claiming interface 0 and
    /// discovering the bulk endpoint pair.
    pub(crate) fn from_device(device: &libusb::Device<'h>) -> Result<UsbHandle<'h>, Error> {
        let mut handle = UsbHandle {
            device_handle: device.open().context("unable to open device")?,
            endpoint_in: 0,
            endpoint_out: 0,
            iface_detached: false,
        };
        handle.claim(device)?;
        Ok(handle)
    }

    /// Claims interface 0 of the given device, detaching the kernel driver
    /// first on hosts that need it.
    fn claim(&mut self, device: &libusb::Device<'h>) -> Result<(), Error> {
        if let Err(e) = self.device_handle.claim_interface(0) {
            if cfg!(target_os = "linux") {
                self.device_handle
                    .detach_kernel_driver(0)
                    .context("unable to detach kernel driver")?;
                self.iface_detached = true;
                self.device_handle
                    .claim_interface(0)
                    .context("unable to claim device interface")?;
            } else {
                bail!(e.context("unable to claim device interface"));
            }
        }
        self.get_endpoints(device)
            .context("unable to get device endpoints")?;
        Ok(())
    }

    /// Discovers the first bulk IN and first bulk OUT endpoints on any
    /// alt-setting of the active configuration.
    fn get_endpoints(&mut self, device: &libusb::Device<'h>) -> Result<(), Error> {
        use libusb::{Direction, TransferType};

        let config_descriptor = device
            .active_config_descriptor()
            .context("unable to get active config descriptor")?;
        for interface in config_descriptor.interfaces() {
            for descriptor in interface.descriptors() {
                for endpoint in descriptor.endpoint_descriptors() {
                    if let TransferType::Bulk = endpoint.transfer_type() {
                        match endpoint.direction() {
                            Direction::In => {
                                if self.endpoint_in == 0 {
                                    self.endpoint_in = endpoint.address();
                                }
                            }
                            Direction::Out => {
                                if self.endpoint_out == 0 {
                                    self.endpoint_out = endpoint.address();
                                }
                            }
                        }
                    }
                }
            }
        }
        if self.endpoint_in == 0 || self.endpoint_out == 0 {
            bail!("failed to get FEL mode endpoint addresses");
        }
        debug!(
            "FEL endpoints: IN {:#04x}, OUT {:#04x}",
            self.endpoint_in, self.endpoint_out
        );
        Ok(())
    }
}

impl<'h> UsbTransport for UsbHandle<'h> {
    fn endpoint_in(&self) -> u8 {
        self.endpoint_in
    }

    fn endpoint_out(&self) -> u8 {
        self.endpoint_out
    }

    fn bulk_send(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, Error> {
        self.device_handle
            .write_bulk(endpoint, data, timeout)
            .map_err(|e| {
                FelError::UsbTransfer {
                    cause: e.to_string(),
                }
                .into()
            })
    }

    fn bulk_recv(&self, endpoint: u8, data: &mut [u8], timeout: Duration) -> Result<usize, Error> {
        self.device_handle
            .read_bulk(endpoint, data, timeout)
            .map_err(|e| {
                FelError::UsbTransfer {
                    cause: e.to_string(),
                }
                .into()
            })
    }
}

impl<'h> Drop for UsbHandle<'h> {
    fn drop(&mut self) {
        if let Err(e) = self.device_handle.release_interface(0) {
            warn!("error releasing device interface: {}", e);
        }
        if cfg!(target_os = "linux") && self.iface_detached {
            if let Err(e) = self.device_handle.attach_kernel_driver(0) {
                warn!("error reattaching kernel driver: {}", e);
            }
        }
    }
}

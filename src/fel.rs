//! AW-USB framing and the FEL command layer.
//!
//! Every FEL operation is framed the same way on the wire: the 16-byte FEL
//! request goes out as one AW-USB `WRITE` transaction, the data payload (if
//! any) follows as its own AW-USB transaction (`WRITE` for uploads, `READ`
//! for downloads), and an 8-byte FEL status is read back last. Each AW-USB
//! transaction is a 32-byte `AWUC` request, the raw data on the bulk
//! endpoint, and a 13-byte `AWUS` status reply.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use failure::{Error, ResultExt};
use log::debug;

use crate::progress::Progress;
use crate::soc::{SocInfo, SocVersion};
use crate::transport::UsbTransport;
use crate::{
    FelError, AW_FEL_1_EXEC, AW_FEL_1_READ, AW_FEL_1_WRITE, AW_FEL_VERSION,
    AW_USB_MAX_BULK_SEND, AW_USB_MAX_BULK_SEND_PROGRESS, AW_USB_READ, AW_USB_WRITE, USB_TIMEOUT,
};

/// FEL device handle.
///
/// Owns the USB transport plus all per-session state: the decoded version
/// reply, the resolved SoC record (when the SoC is known), the recorded
/// U-Boot memory region used by the overwrite guard, and the active progress
/// reporter.
pub struct FelHandle<T: UsbTransport> {
    transport: T,
    soc_version: SocVersion,
    soc_info: Option<SocInfo>,
    uboot_region: Cell<Option<(u32, u32)>>,
    progress: RefCell<Option<Progress>>,
}

impl<T: UsbTransport> fmt::Debug for FelHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FelHandle")
            .field("soc_version", &self.soc_version)
            .field("soc_info", &self.soc_info)
            .field("uboot_region", &self.uboot_region.get())
            .finish()
    }
}

impl<T: UsbTransport> FelHandle<T> {
    /// Creates a FEL handle over the given transport, probing the device
    /// version and resolving the SoC record.
    ///
    /// An unknown SoC ID is not an error here: the version reply is still
    /// available, and only operations that need SoC-specific addresses will
    /// fail.
    pub fn from_transport(transport: T) -> Result<FelHandle<T>, Error> {
        let mut handle = FelHandle {
            transport,
            soc_version: SocVersion::from_bytes([0; 32]),
            soc_info: None,
            uboot_region: Cell::new(None),
            progress: RefCell::new(None),
        };
        let version = handle
            .get_fel_version()
            .context("unable to probe the FEL device version")?;
        handle.soc_info = SocInfo::from_id(version.get_id());
        debug!("FEL version probe: {:?}", version);
        handle.soc_version = version;
        Ok(handle)
    }

    /// Creates a FEL handle with an explicit SoC record instead of the one
    /// resolved from the version probe.
    #[doc(hidden)]
    pub fn from_transport_with_soc(transport: T, soc_info: SocInfo) -> Result<FelHandle<T>, Error> {
        let mut handle = FelHandle::from_transport(transport)?;
        handle.soc_info = Some(soc_info);
        Ok(handle)
    }

    /// Gets the SoC version information probed during initialization.
    pub fn get_version_info(&self) -> &SocVersion {
        &self.soc_version
    }

    /// Gets the SoC record, or fails when the SoC is not supported.
    pub fn get_soc_info(&self) -> Result<&SocInfo, Error> {
        match self.soc_info {
            Some(ref info) => Ok(info),
            None => Err(FelError::UnsupportedSoc {
                id: self.soc_version.get_id(),
            }
            .into()),
        }
    }

    /// Gets the memory region of an uploaded U-Boot image, if one was
    /// recorded.
    pub fn uboot_region(&self) -> Option<(u32, u32)> {
        self.uboot_region.get()
    }

    /// Records the memory region of an uploaded U-Boot image, arming the
    /// overwrite guard for subsequent writes.
    pub(crate) fn record_uboot_region(&self, entry: u32, size: u32) {
        self.uboot_region.set(Some((entry, size)));
    }

    /// Installs (or clears) the progress reporter used by guarded writes.
    pub fn set_progress(&self, progress: Option<Progress>) {
        *self.progress.borrow_mut() = progress;
    }

    /// Reads from the FEL device memory at the given offset.
    ///
    /// It will fill all the given buffer, but it **will panic** if the buffer
    /// overflows the total memory address space.
    pub fn fel_read(&self, offset: u32, buf: &mut [u8]) -> Result<(), Error> {
        assert!(
            u32::max_value() - buf.len() as u32 > offset,
            "cannot read above {:#010x} - offset: {:#010x}, buffer length: {:#010x}",
            u32::max_value(),
            offset,
            buf.len()
        );
        self.send_fel_request(AW_FEL_1_READ, offset, buf.len() as u32)
            .context("unable to send FEL read request")?;
        self.usb_read(buf).context("unable to read data from USB")?;
        self.read_fel_status()
            .context("unable to read FEL status")?;
        Ok(())
    }

    /// Writes to the FEL device memory at the given offset.
    ///
    /// This is the raw protocol operation: no overwrite guard, no progress.
    /// It **will panic** if the buffer overflows the total memory address
    /// space.
    pub fn fel_write(&self, offset: u32, buf: &[u8]) -> Result<(), Error> {
        assert!(
            u32::max_value() - buf.len() as u32 > offset,
            "cannot write above {:#010x} - offset: {:#010x}, buffer length: {:#010x}",
            u32::max_value(),
            offset,
            buf.len()
        );
        self.send_fel_request(AW_FEL_1_WRITE, offset, buf.len() as u32)
            .context("unable to send FEL write request")?;
        self.usb_write(buf, false)
            .context("unable to write data to USB")?;
        self.read_fel_status()
            .context("unable to read FEL status")?;
        Ok(())
    }

    /// Writes to the FEL device memory at the given offset, with the U-Boot
    /// overwrite guard and optional progress reporting.
    ///
    /// This is the write path used by user-facing commands. Once a U-Boot
    /// image has been uploaded, any write that would touch its memory range
    /// is rejected before a single USB transfer happens.
    pub fn write_buffer(&self, offset: u32, buf: &[u8], progress: bool) -> Result<(), Error> {
        if let Some((entry, size)) = self.uboot_region.get() {
            if offset <= entry + size && offset + buf.len() as u32 >= entry {
                return Err(FelError::UbootOverwrite {
                    start: offset,
                    end: offset + buf.len() as u32,
                    uboot_start: entry,
                    uboot_end: entry + size,
                }
                .into());
            }
        }
        self.send_fel_request(AW_FEL_1_WRITE, offset, buf.len() as u32)
            .context("unable to send FEL write request")?;
        self.usb_write(buf, progress)
            .context("unable to write data to USB")?;
        self.read_fel_status()
            .context("unable to read FEL status")?;
        Ok(())
    }

    /// Fills `num_bytes` bytes of device memory at the given offset with the
    /// given byte value.
    pub fn fel_fill(&self, offset: u32, num_bytes: u32, byte: u8) -> Result<(), Error> {
        let buf = vec![byte; num_bytes as usize];
        self.write_buffer(offset, &buf, false)
            .context("unable to write fill buffer to device memory")?;
        Ok(())
    }

    /// Makes the FEL device execute the code at the given address.
    pub fn fel_execute(&self, offset: u32) -> Result<(), Error> {
        self.send_fel_request(AW_FEL_1_EXEC, offset, 0)
            .context("unable to send FEL exec request")?;
        self.read_fel_status()
            .context("unable to read FEL status")?;
        Ok(())
    }

    /// Gets the SoC version information.
    fn get_fel_version(&self) -> Result<SocVersion, Error> {
        self.send_fel_request(AW_FEL_VERSION, 0, 0)
            .context("unable to send FEL version request")?;
        let mut buf = [0_u8; 32];
        self.usb_read(&mut buf)
            .context("unable to read version from USB")?;
        self.read_fel_status()
            .context("unable to read FEL status")?;
        Ok(SocVersion::from_bytes(buf))
    }

    /// Reads the 8-byte FEL status that trails every FEL operation.
    ///
    /// The bytes are read but not inspected.
    fn read_fel_status(&self) -> Result<(), Error> {
        let mut buf = [0_u8; 8];
        self.usb_read(&mut buf)
    }

    /// Sends a 16-byte FEL request.
    fn send_fel_request(&self, req_type: u32, addr: u32, len: u32) -> Result<(), Error> {
        let mut request = [0_u8; 16];
        LittleEndian::write_u32(&mut request[..4], req_type);
        LittleEndian::write_u32(&mut request[4..8], addr);
        LittleEndian::write_u32(&mut request[8..12], len);
        // 4 byte padding.
        self.usb_write(&request, false)
    }

    /// Performs one framed AW-USB read: request, data on the IN endpoint,
    /// status.
    fn usb_read(&self, data: &mut [u8]) -> Result<(), Error> {
        self.send_usb_request(AW_USB_READ, data.len() as u32)?;
        self.usb_bulk_recv(self.transport.endpoint_in(), data)?;
        self.read_usb_response()
    }

    /// Performs one framed AW-USB write: request, data on the OUT endpoint,
    /// status.
    fn usb_write(&self, data: &[u8], progress: bool) -> Result<(), Error> {
        self.send_usb_request(AW_USB_WRITE, data.len() as u32)?;
        self.usb_bulk_send(self.transport.endpoint_out(), data, progress)?;
        self.read_usb_response()
    }

    /// Sends the 32-byte `AWUC` request that frames every transfer.
    fn send_usb_request(&self, req_type: u16, len: u32) -> Result<(), Error> {
        let mut request = [0_u8; 32];
        request[..4].clone_from_slice(b"AWUC");
        LittleEndian::write_u32(&mut request[8..12], len);
        LittleEndian::write_u32(&mut request[12..16], 0x0C00_0000); // Unknown data
        LittleEndian::write_u16(&mut request[16..18], req_type);
        LittleEndian::write_u32(&mut request[18..22], len); // Length is repeated
                                                            // Bytes from 22 to 32 are padding
        self.usb_bulk_send(self.transport.endpoint_out(), &request, false)
    }

    /// Reads the 13-byte `AWUS` status reply and verifies its signature.
    fn read_usb_response(&self) -> Result<(), Error> {
        let mut buf = [0_u8; 13];
        self.usb_bulk_recv(self.transport.endpoint_in(), &mut buf)?;
        if &buf[..4] == b"AWUS" {
            Ok(())
        } else {
            Err(FelError::Response {
                expected: "AWUS",
                found: String::from_utf8_lossy(&buf[..4]).into_owned(),
            }
            .into())
        }
    }

    /// Sends data on a bulk endpoint, splitting into chunks.
    ///
    /// With no progress reporter the maximum chunk size is used; otherwise
    /// the chunks shrink so status updates fire more often.
    fn usb_bulk_send(&self, endpoint: u8, data: &[u8], progress: bool) -> Result<(), Error> {
        let max_chunk = if progress {
            AW_USB_MAX_BULK_SEND_PROGRESS
        } else {
            AW_USB_MAX_BULK_SEND
        };
        let timeout = Duration::from_secs(USB_TIMEOUT);
        let mut sent = 0;
        while sent < data.len() {
            let end = if data.len() - sent < max_chunk {
                data.len()
            } else {
                sent + max_chunk
            };
            let n = self
                .transport
                .bulk_send(endpoint, &data[sent..end], timeout)
                .with_context(|_| format!("unable to send data chunk, sent {} bytes", sent))?;
            sent += n;
            if progress {
                if let Some(ref mut reporter) = *self.progress.borrow_mut() {
                    reporter.update(n);
                }
            }
        }
        Ok(())
    }

    /// Receives data from a bulk endpoint, looping until the buffer is full.
    fn usb_bulk_recv(&self, endpoint: u8, data: &mut [u8]) -> Result<(), Error> {
        let timeout = Duration::from_secs(USB_TIMEOUT);
        let mut received = 0;
        while received < data.len() {
            let n = self
                .transport
                .bulk_recv(endpoint, &mut data[received..], timeout)
                .with_context(|_| {
                    format!("unable to read data chunk, received {} bytes", received)
                })?;
            received += n;
        }
        Ok(())
    }
}

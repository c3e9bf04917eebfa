//! Host-side driver library for the Allwinner *FEL* USB boot-ROM protocol.
//!
//! A *SoC* held in its factory *FEL* recovery mode exposes a small command
//! interface over a bulk USB endpoint pair. This crate drives that interface:
//! it can inspect device memory, upload code and data, execute arbitrary
//! entry points, and stage a multi-stage boot loader (U-Boot *SPL* plus main
//! image) on the target.
//!
//! The layering mirrors the wire protocol: [`transport`](UsbTransport) moves
//! raw bulk transfers, [`FelHandle`] adds the AW-USB framing and the four FEL
//! commands on top, and the higher-level operations (single-word memory
//! access, MMU management, the SPL loader) are built from those by uploading
//! small runtime-generated ARM thunks to the SoC scratch area.

#![forbid(anonymous_parameters)]
#![deny(
    variant_size_differences,
    unused_results,
    unused_qualifications,
    unused_import_braces,
    unsafe_code,
    trivial_numeric_casts,
    trivial_casts,
    missing_docs,
    unused_extern_crates,
    missing_debug_implementations,
    missing_copy_implementations
)]

use std::fmt;

use failure::{bail, Error, Fail, ResultExt};
use log::debug;

mod fel;
pub mod image;
mod mmu;
pub mod progress;
mod soc;
mod thunk;
mod transport;
mod uboot;

pub use crate::fel::FelHandle;
pub use crate::soc::{SocInfo, SocVersion, SramSwapBuffers};
pub use crate::transport::{UsbHandle, UsbTransport};

/// Maximum size of *SPL*, at the same time this is the start offset of the
/// main *U-Boot* image within `u-boot-sunxi-with-spl.bin`.
pub const SPL_LEN_LIMIT: u32 = 0x8000;

/// USB timeout (in seconds).
const USB_TIMEOUT: u64 = 10;

/// `AW_USB_MAX_BULK_SEND` and the timeout constant `USB_TIMEOUT` are related.
/// Both need to be selected in a way that transferring the maximum chunk size
/// with (*SoC*-specific) slow transfer speed won't time out.
///
/// The *512 KiB* here are chosen based on the assumption that we want a 10
/// seconds timeout, and "slow" transfers take place at approx. *64 KiB/sec*,
/// so we can expect the maximum chunk being transmitted within 8 seconds or
/// less.
const AW_USB_MAX_BULK_SEND: usize = 512 * 1024;

/// Chunk size used while a progress reporter is active.
///
/// Smaller chunks mean more frequent status updates; worst case of "slow"
/// transfers is still one update every two seconds.
const AW_USB_MAX_BULK_SEND_PROGRESS: usize = 128 * 1024;

/// Allwinner FEL device USB vendor ID.
const AW_VENDOR_ID: u16 = 0x1F3A;
/// Allwinner FEL device USB product ID.
const AW_PRODUCT_ID: u16 = 0xEFE8;

/// Allwinner USB read request.
const AW_USB_READ: u16 = 0x11;
/// Allwinner USB write request.
const AW_USB_WRITE: u16 = 0x12;

// Request types:
/// Allwinner FEL version request.
const AW_FEL_VERSION: u32 = 0x001;
/// Allwinner FEL write request.
const AW_FEL_1_WRITE: u32 = 0x101;
/// Allwinner FEL execution request.
const AW_FEL_1_EXEC: u32 = 0x102;
/// Allwinner FEL read request.
const AW_FEL_1_READ: u32 = 0x103;

// We don't want the scratch code/buffer to exceed a maximum size of `0x400`
// bytes (256 32-bit words) on `read_words()`/`write_words()` transfers. To
// guarantee this, we have to account for the amount of space the ARM code
// uses.

/// Word count of the `[read/write]_words()` scratch code.
const LCODE_ARM_RW_WORDS: usize = 12;
/// Code size in bytes.
const LCODE_ARM_RW_SIZE: usize = LCODE_ARM_RW_WORDS << 2;
/// Maximum total words in the scratch buffer.
const LCODE_MAX_TOTAL: usize = 0x100;
/// Data words per `read_words()`/`write_words()` round trip.
const LCODE_MAX_RW_WORDS: usize = LCODE_MAX_TOTAL - LCODE_ARM_RW_WORDS;

/// *DRAM* base address.
const DRAM_BASE: u32 = 0x4000_0000;
/// *DRAM* size, in bytes.
const DRAM_SIZE: u32 = 0x8000_0000;

/// FEL errors.
#[derive(Debug, Fail, PartialEq)]
pub enum FelError {
    /// USB response error.
    #[fail(
        display = "invalid response: expected '{}', found '{}'",
        expected, found
    )]
    Response {
        /// Expected string.
        expected: &'static str,
        /// Found string.
        found: String,
    },
    /// A bulk USB transfer failed or timed out.
    #[fail(display = "USB transfer failed: {}", cause)]
    UsbTransfer {
        /// Underlying transfer error.
        cause: String,
    },
    /// Unsupported SoC ID.
    #[fail(display = "unsupported SoC ID: {:#06x}", id)]
    UnsupportedSoc {
        /// The SoC ID reported by the device.
        id: u32,
    },
    /// SPL header error.
    #[fail(display = "SPL header error: {}", msg)]
    SplHeader {
        /// SPL header error message.
        msg: &'static str,
    },
    /// A write would overlap the uploaded U-Boot image.
    #[fail(
        display = "attempt to overwrite U-Boot: request {:#010x}-{:#010x} overlaps {:#010x}-{:#010x}",
        start, end, uboot_start, uboot_end
    )]
    UbootOverwrite {
        /// Start of the rejected write.
        start: u32,
        /// End of the rejected write.
        end: u32,
        /// Start of the recorded U-Boot region.
        uboot_start: u32,
        /// End of the recorded U-Boot region.
        uboot_end: u32,
    },
}

/// Converts a reference to a `u32` slice to a reference to a `u8` slice.
///
/// The new slice will have a 4 times bigger length.
#[inline(always)]
#[allow(unsafe_code)]
fn u32_as_u8(src: &[u32]) -> &[u8] {
    // Safe because both slices have the same size in bytes.
    unsafe { std::slice::from_raw_parts(src.as_ptr() as *const u8, src.len() * 4) }
}

/// Converts a mutable reference to a `u32` slice to a mutable reference to a
/// `u8` slice.
///
/// The new slice will have a 4 times bigger length.
#[inline(always)]
#[allow(unsafe_code)]
fn u32_as_u8_mut(src: &mut [u32]) -> &mut [u8] {
    // Safe because both slices have the same size in bytes.
    unsafe { std::slice::from_raw_parts_mut(src.as_mut_ptr() as *mut u8, src.len() * 4) }
}

/// Allwinner FEL devices context.
pub struct Fel {
    context: libusb::Context,
}

impl fmt::Debug for Fel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Fel").finish()
    }
}

impl Fel {
    /// Creates a new FEL context.
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            context: libusb::Context::new().context("unable to create libusb context")?,
        })
    }

    /// Opens the FEL device at the given bus and device number, or the first
    /// device matching the Allwinner FEL VID/PID when no selector is given.
    pub fn open_device(
        &self,
        selector: Option<(u8, u8)>,
    ) -> Result<FelHandle<UsbHandle<'_>>, Error> {
        for device in self
            .context
            .devices()
            .context("unable to list USB devices")?
            .iter()
        {
            let descriptor = device
                .device_descriptor()
                .context("unable to get USB device descriptor")?;
            match selector {
                Some((bus, devnum)) => {
                    if device.bus_number() != bus || device.address() != devnum {
                        continue;
                    }
                    if descriptor.vendor_id() != AW_VENDOR_ID
                        || descriptor.product_id() != AW_PRODUCT_ID
                    {
                        bail!(
                            "bus {:03} device {:03} is not a FEL device (expected {:04x}:{:04x}, \
                             got {:04x}:{:04x})",
                            bus,
                            devnum,
                            AW_VENDOR_ID,
                            AW_PRODUCT_ID,
                            descriptor.vendor_id(),
                            descriptor.product_id()
                        );
                    }
                }
                None => {
                    if descriptor.vendor_id() != AW_VENDOR_ID
                        || descriptor.product_id() != AW_PRODUCT_ID
                    {
                        continue;
                    }
                }
            }
            debug!(
                "opening FEL device at bus {:03} device {:03}",
                device.bus_number(),
                device.address()
            );
            let transport = UsbHandle::from_device(&device)?;
            return FelHandle::from_transport(transport);
        }
        match selector {
            Some((bus, devnum)) => bail!(
                "bus {:03} device {:03} not found in USB device list",
                bus,
                devnum
            ),
            None => bail!("Allwinner USB FEL device not found"),
        }
    }
}

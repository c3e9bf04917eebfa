//! Boot image header parsing.
//!
//! Two container formats show up on the FEL path: the U-Boot legacy
//! *mkimage* header (big-endian, 64 bytes) in front of main U-Boot images
//! and boot scripts, and Allwinner's *eGON* header at the start of every
//! *SPL*. This module decodes and validates both, plus the small "sunxi"
//! extension of the eGON header used to pass information from the host to
//! U-Boot.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use failure::Error;

use crate::FelError;

/// *U-Boot* image magic number.
pub const IH_MAGIC: u32 = 0x2705_1956;
/// ARM architecture constant in *U-Boot* headers.
pub const IH_ARCH_ARM: u8 = 0x02;
/// Firmware image type.
pub const IH_TYPE_FIRMWARE: u8 = 0x05;
/// Script file type.
pub const IH_TYPE_SCRIPT: u8 = 0x06;
/// *U-Boot* image name length.
pub const IH_NMLEN: usize = 32;
/// Offset of the name field.
pub const HEADER_NAME_OFFSET: usize = 32;
/// Total size of the *mkimage* header.
pub const HEADER_SIZE: usize = HEADER_NAME_OFFSET + IH_NMLEN;

/// The checksum stamp value of the *eGON* header.
const EGON_STAMP_VALUE: u32 = 0x5F0A_6C39;
/// The *eGON* boot tag, found at offset 4 of an SPL image.
pub const EGON_MAGIC: &[u8; 8] = b"eGON.BT0";
/// The tag the SPL writes over [`EGON_MAGIC`] to signal a successful
/// FEL-initiated boot.
pub const EGON_FEL_MAGIC: &[u8; 8] = b"eGON.FEL";

/// Offset of the "sunxi" SPL signature within the SPL header.
pub const SPL_SIGNATURE_OFFSET: u32 = 0x14;
/// Offset of the FEL handoff slots (`script_address`, `uEnv_length`) within
/// the SPL header.
pub const SPL_HANDOFF_OFFSET: u32 = 0x18;
/// The "sunxi" SPL signature (fourth byte is the header version).
pub const SPL_SIGNATURE: &[u8; 3] = b"SPL";
/// Minimum required "sunxi" SPL header version.
pub const SPL_MIN_VERSION: u8 = 1;
/// Maximum supported "sunxi" SPL header version.
pub const SPL_MAX_VERSION: u8 = 1;

/// Result of probing a buffer for a *mkimage* header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// Insufficient size or magic mismatch.
    Invalid,
    /// A valid header, but not for the ARM architecture.
    ArchMismatch,
    /// A valid ARM header with the given raw `ih_type` byte.
    Type(u8),
}

/// Determines the image type from a *mkimage*-compatible header at the given
/// buffer.
pub fn image_type(buf: &[u8]) -> ImageType {
    if buf.len() <= HEADER_SIZE {
        return ImageType::Invalid;
    }
    if BigEndian::read_u32(&buf[..4]) != IH_MAGIC {
        return ImageType::Invalid;
    }
    // For sunxi, we always expect the ARM architecture here.
    if buf[29] != IH_ARCH_ARM {
        return ImageType::ArchMismatch;
    }
    ImageType::Type(buf[30])
}

/// Checks a buffer for the `#=uEnv` magic, indicating `uEnv.txt` compatible
/// data.
pub fn is_uenv(buf: &[u8]) -> bool {
    buf.len() > 6 && &buf[..6] == b"#=uEnv"
}

/// Decoded fields of a *mkimage* header.
#[derive(Debug, Clone, Copy)]
pub struct MkimageHeader {
    data_size: u32,
    load_addr: u32,
    data_crc: u32,
    name: [u8; IH_NMLEN],
}

impl MkimageHeader {
    /// Decodes the *mkimage* header fields from a buffer already known to
    /// carry a valid header (see [`image_type`]).
    pub fn from_bytes(buf: &[u8]) -> MkimageHeader {
        debug_assert!(buf.len() > HEADER_SIZE, "insufficient image length");
        let mut name = [0_u8; IH_NMLEN];
        name.clone_from_slice(&buf[HEADER_NAME_OFFSET..HEADER_SIZE]);
        MkimageHeader {
            data_size: BigEndian::read_u32(&buf[12..16]),
            load_addr: BigEndian::read_u32(&buf[16..20]),
            data_crc: BigEndian::read_u32(&buf[24..28]),
            name,
        }
    }

    /// Gets the image data size.
    pub fn get_data_size(&self) -> u32 {
        self.data_size
    }

    /// Gets the data load address.
    pub fn get_load_addr(&self) -> u32 {
        self.load_addr
    }

    /// Gets the image data CRC.
    ///
    /// The CRC is decoded but currently not verified.
    pub fn get_data_crc(&self) -> u32 {
        self.data_crc
    }

    /// Gets the image name, with trailing NUL padding stripped.
    pub fn get_name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(IH_NMLEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// Validates the *eGON* header of an SPL buffer and returns the SPL byte
/// length.
///
/// The length must fit the buffer and be word aligned, and the whole SPL must
/// satisfy the eGON checksum: `2·stored − 0x5F0A6C39 − Σ words == 0`.
pub fn parse_spl_header(spl: &[u8]) -> Result<u32, Error> {
    if spl.len() < 32 || &spl[4..12] != EGON_MAGIC {
        return Err(FelError::SplHeader {
            msg: "eGON header not found",
        }
        .into());
    }

    let stored_checksum = LittleEndian::read_u32(&spl[12..16]);
    let spl_len = LittleEndian::read_u32(&spl[16..20]);
    if spl_len > spl.len() as u32 || (spl_len % 4) != 0 {
        return Err(FelError::SplHeader {
            msg: "bad length in the eGON header",
        }
        .into());
    }

    let mut checksum = (2_u32.wrapping_mul(stored_checksum)).wrapping_sub(EGON_STAMP_VALUE);
    for word in spl[..spl_len as usize].chunks(4) {
        checksum = checksum.wrapping_sub(LittleEndian::read_u32(word));
    }
    if checksum != 0 {
        return Err(FelError::SplHeader {
            msg: "checksum check failed",
        }
        .into());
    }

    Ok(spl_len)
}

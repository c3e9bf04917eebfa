//! *SPL* and *U-Boot* upload.
//!
//! Staging a boot loader over FEL is the delicate part of the protocol: the
//! SPL image overlaps SRAM regions the boot ROM itself is using, so those
//! bytes are staged at backup locations and a small thunk swaps them into
//! place at the last moment, runs the SPL, and swaps them back before
//! returning to FEL. The MMU state of the boot ROM is backed up and restored
//! around the run (or set up from scratch on SoCs that boot with it off).

use std::thread;
use std::time::Duration;

use failure::{bail, Error, ResultExt};
use log::{info, warn};

use crate::fel::FelHandle;
use crate::image::{self, ImageType, MkimageHeader};
use crate::mmu;
use crate::transport::UsbTransport;
use crate::{u32_as_u8, SPL_LEN_LIMIT};

mod fel2spl_thunk;
use self::fel2spl_thunk::FEL_TO_SPL_THUNK;

impl<T: UsbTransport> FelHandle<T> {
    /// Uploads a boot file: the *SPL* is written and executed, and when the
    /// file also contains a main *U-Boot* binary (as in
    /// `u-boot-sunxi-with-spl.bin`), that image is transferred to its load
    /// address as well — but not executed.
    pub fn process_spl_and_uboot(&self, buf: &[u8]) -> Result<(), Error> {
        self.write_and_execute_spl(buf)
            .context("unable to write and execute the SPL")?;
        if buf.len() > SPL_LEN_LIMIT as usize {
            let _ = self
                .write_uboot_image(&buf[SPL_LEN_LIMIT as usize..])
                .context("unable to write the main U-Boot image")?;
        }
        Ok(())
    }

    /// Writes the *U-Boot* *SPL* into *SRAM* and executes it, verifying the
    /// `eGON.FEL` handshake afterwards.
    pub fn write_and_execute_spl(&self, spl: &[u8]) -> Result<(), Error> {
        let soc_info = *self.get_soc_info()?;
        let spl_len = image::parse_spl_header(spl)?;
        let spl = &spl[..spl_len as usize];

        if soc_info.needs_l2en() {
            info!("enabling the L2 cache");
            self.enable_l2_cache()
                .context("the SoC requires the L2 cache but it couldn't be enabled")?;
        }

        let (sp_irq, sp) = self
            .get_stack_info()
            .context("could not retrieve stack information")?;
        info!("stack pointers: sp_irq={:#010x}, sp={:#010x}", sp_irq, sp);

        let tt = match self
            .backup_and_disable_mmu()
            .context("could not back up and disable the MMU")?
        {
            Some(tt) => Some(tt),
            None => {
                if let Some(mmu_tt_addr) = soc_info.get_mmu_tt_addr() {
                    if (mmu_tt_addr & 0x3FFF) != 0 {
                        bail!("the MMU translation table address must be 16 KiB aligned");
                    }
                    info!(
                        "generating a new MMU translation table at {:#010x}",
                        mmu_tt_addr
                    );
                    // These settings are used by the BROM in A10/A13/A20 and
                    // we replicate them here when enabling the MMU. The DACR
                    // value 0x55555555 means that accesses are checked
                    // against the permission bits in the translation tables
                    // for all domains. The TTBCR value 0x00000000 means that
                    // the short descriptor translation table format is used,
                    // TTBR0 is used for all the possible virtual addresses
                    // (N=0) and that the translation table must be aligned at
                    // a 16 KiB boundary.
                    self.set_dacr(0x5555_5555).context("could not set DACR")?;
                    self.set_ttbcr(0x0000_0000).context("could not set TTBCR")?;
                    self.set_ttbr0(mmu_tt_addr).context("could not set TTBR0")?;
                    Some(mmu::default_mmu_translation_table())
                } else {
                    None
                }
            }
        };

        // Stream the SPL through the swap-buffer map: bytes destined for a
        // region the BROM occupies are staged at its backup location instead.
        let mut spl_len_limit = SPL_LEN_LIMIT;
        let mut cur_addr = soc_info.get_spl_addr();
        let mut written = 0_usize;
        let mut left = spl.len();
        for swap_buffers in soc_info.get_swap_buffers() {
            if swap_buffers.get_buf2() >= soc_info.get_spl_addr()
                && swap_buffers.get_buf2() < soc_info.get_spl_addr() + spl_len_limit
            {
                spl_len_limit = swap_buffers.get_buf2() - soc_info.get_spl_addr();
            }
            if left > 0 && cur_addr < swap_buffers.get_buf1() {
                let mut tmp = (swap_buffers.get_buf1() - cur_addr) as usize;
                if tmp > left {
                    tmp = left;
                }
                self.fel_write(cur_addr, &spl[written..written + tmp])
                    .with_context(|_| {
                        format!("could not write the SPL chunk at {:#010x}", cur_addr)
                    })?;
                cur_addr += tmp as u32;
                written += tmp;
                left -= tmp;
            }
            if left > 0 && cur_addr == swap_buffers.get_buf1() {
                let mut tmp = swap_buffers.get_size() as usize;
                if tmp > left {
                    tmp = left;
                }
                self.fel_write(swap_buffers.get_buf2(), &spl[written..written + tmp])
                    .with_context(|_| {
                        format!(
                            "could not write the SPL chunk to the swap buffer at {:#010x}",
                            swap_buffers.get_buf2()
                        )
                    })?;
                cur_addr += tmp as u32;
                written += tmp;
                left -= tmp;
            }
        }

        // Clarify the SPL size limitations, and bail out if they are not met.
        if soc_info.get_thunk_addr() < spl_len_limit {
            spl_len_limit = soc_info.get_thunk_addr();
        }
        if spl_len > spl_len_limit {
            bail!(
                "SPL too large (need {} bytes, have {} bytes)",
                spl_len,
                spl_len_limit
            );
        }

        // Write the remaining part of the SPL.
        if left > 0 {
            self.fel_write(cur_addr, &spl[written..written + left])
                .with_context(|_| {
                    format!("could not write the SPL chunk at {:#010x}", cur_addr)
                })?;
        }

        let thunk_size = FEL_TO_SPL_THUNK.len() * 4
            + 4
            + (soc_info.get_swap_buffers().len() + 1) * 12;
        if thunk_size as u32 > soc_info.get_thunk_size() {
            bail!(
                "bad thunk size (need {} bytes, have {} bytes)",
                thunk_size,
                soc_info.get_thunk_size()
            );
        }

        // The thunk payload: the bootstrap code, the SPL address, and the
        // swap-buffer list with its zero-size terminator.
        let mut thunk_buf = Vec::with_capacity(thunk_size / 4);
        thunk_buf.extend_from_slice(&FEL_TO_SPL_THUNK);
        thunk_buf.push(soc_info.get_spl_addr());
        for swap_buffers in soc_info.get_swap_buffers() {
            thunk_buf.push(swap_buffers.get_buf1());
            thunk_buf.push(swap_buffers.get_buf2());
            thunk_buf.push(swap_buffers.get_size());
        }
        for word in &mut thunk_buf {
            *word = word.to_le();
        }
        thunk_buf.extend_from_slice(&[0_u32; 3]); // Zero-size terminator

        info!("=> executing the SPL");
        self.fel_write(soc_info.get_thunk_addr(), u32_as_u8(&thunk_buf))
            .context("could not write the FEL->SPL thunk")?;
        self.fel_execute(soc_info.get_thunk_addr())
            .context("could not execute the FEL->SPL thunk")?;

        // TODO: try to find and fix the bug which needs this workaround.
        thread::sleep(Duration::from_millis(250));

        // Read back the result and check if everything was fine.
        let mut signature = [0_u8; 8];
        self.fel_read(soc_info.get_spl_addr() + 4, &mut signature)
            .context("could not read back the SPL signature")?;
        if &signature != image::EGON_FEL_MAGIC {
            bail!(
                "SPL failure code '{}' (expected 'eGON.FEL')",
                String::from_utf8_lossy(&signature)
            );
        }

        // Re-enable the MMU if it was enabled by BROM.
        if let Some(tt) = tt {
            self.restore_and_enable_mmu(tt)
                .context("unable to restore and enable the MMU")?;
        }
        Ok(())
    }

    /// Tests a given buffer for a valid *U-Boot* image. Upon success, the
    /// image data gets transferred to the load address stored within the
    /// image header, the region is recorded for the overwrite guard, and the
    /// `(entry point, size)` pair is returned.
    pub fn write_uboot_image(&self, uboot: &[u8]) -> Result<(u32, u32), Error> {
        if uboot.len() <= image::HEADER_SIZE {
            bail!("insufficient U-Boot image size");
        }
        match image::image_type(uboot) {
            ImageType::Invalid => bail!("invalid U-Boot image: bad size or signature"),
            ImageType::ArchMismatch => bail!("invalid U-Boot image: wrong architecture"),
            ImageType::Type(image::IH_TYPE_FIRMWARE) => {}
            ImageType::Type(other) => bail!(
                "U-Boot image type mismatch: expected firmware ({:#04x}), got {:#04x}",
                image::IH_TYPE_FIRMWARE,
                other
            ),
        }

        let header = MkimageHeader::from_bytes(uboot);
        let data_size = header.get_data_size();
        let load_addr = header.get_load_addr();
        if data_size != (uboot.len() - image::HEADER_SIZE) as u32 {
            bail!(
                "U-Boot image data size mismatch: expected {:#010x}, got {:#010x}",
                uboot.len() - image::HEADER_SIZE,
                data_size
            );
        }
        // TODO: verify image data integrity using the checksum field
        // `ih_dcrc` (header.get_data_crc()). This requires CRC routines that
        // mimic their U-Boot counterparts, namely `image_check_dcrc()` in
        // ${U-BOOT}/common/image.c and `crc_wd()` in ${U-BOOT}/lib/crc32.c.

        info!(
            "writing image \"{}\", {} bytes @ {:#010x}",
            header.get_name(),
            data_size,
            load_addr
        );
        self.write_buffer(load_addr, &uboot[image::HEADER_SIZE..], false)
            .context("could not write the U-Boot image to the device")?;

        // Keep track of the U-Boot memory region for the overwrite guard and
        // autostart.
        self.record_uboot_region(load_addr, data_size);
        Ok((load_addr, data_size))
    }

    /// Tests the SPL header on the device for our "sunxi" variant, making
    /// sure that specific header fields can safely be used to pass
    /// information to U-Boot.
    ///
    /// A missing signature (e.g. Allwinner boot0) or a header version
    /// mismatch yields `false`.
    pub fn have_sunxi_spl(&self) -> Result<bool, Error> {
        let spl_addr = self.get_soc_info()?.get_spl_addr();
        let mut spl_signature = [0_u8; 4];
        self.fel_read(spl_addr + image::SPL_SIGNATURE_OFFSET, &mut spl_signature)
            .context("could not read the SPL signature")?;

        if &spl_signature[..3] != image::SPL_SIGNATURE {
            return Ok(false); // Signature mismatch, no "sunxi" SPL
        }
        if spl_signature[3] < image::SPL_MIN_VERSION {
            warn!(
                "sunxi SPL version mismatch: found {:#04x} < required minimum {:#04x}",
                spl_signature[3],
                image::SPL_MIN_VERSION
            );
            warn!("you need to update your U-Boot (mksunxiboot) to a more recent version");
            return Ok(false);
        }
        if spl_signature[3] > image::SPL_MAX_VERSION {
            warn!(
                "sunxi SPL version mismatch: found {:#04x} > maximum supported {:#04x}",
                spl_signature[3],
                image::SPL_MAX_VERSION
            );
            warn!("you need a more recent version of this fel utility");
            return Ok(false);
        }
        Ok(true)
    }

    /// Passes information to U-Boot via specialized fields in the SPL header,
    /// providing the boot script address (DRAM location of `boot.scr`) or the
    /// location and length of uploaded `uEnv.txt` data.
    ///
    /// Nothing is written unless a suitable sunxi SPL header is present at
    /// the SPL address.
    pub fn pass_fel_information(
        &self,
        script_address: u32,
        uenv_length: u32,
    ) -> Result<(), Error> {
        let spl_addr = self.get_soc_info()?.get_spl_addr();
        if self.have_sunxi_spl()? {
            info!(
                "passing boot info via sunxi SPL: script address = {:#010x}, uEnv length = {}",
                script_address, uenv_length
            );
            let transfer = [script_address.to_le(), uenv_length.to_le()];
            self.fel_write(spl_addr + image::SPL_HANDOFF_OFFSET, u32_as_u8(&transfer))
                .context("could not write the FEL handoff information")?;
        }
        Ok(())
    }
}

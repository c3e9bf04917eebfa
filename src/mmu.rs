//! MMU translation table management.
//!
//! The boot ROM of older SoCs runs with the MMU enabled, and its first-level
//! translation table must be preserved across an SPL run: the table is read
//! out, validated, the MMU is switched off for the SPL, and afterwards the
//! table is written back with better section attributes (write-combine for
//! DRAM, write-back cache for the BROM) and the MMU re-enabled. Newer SoCs
//! leave the MMU off; for those a flat table is synthesized from scratch.
//!
//! Everything here refuses to proceed when the registers or the table do not
//! look exactly like a known boot ROM configuration: guessing wrong means
//! scribbling over live SRAM.

use failure::{bail, Error, ResultExt};
use log::info;

use crate::fel::FelHandle;
use crate::transport::UsbTransport;
use crate::{u32_as_u8, u32_as_u8_mut, DRAM_BASE, DRAM_SIZE};

/// Number of entries in a first-level translation table.
const TT_ENTRIES: usize = 4096;

/// Generates the same MMU translation table as used by the *A20* *BROM*.
///
/// Direct mapping using 1 MiB sections with `TEXCB=00000` (Strongly ordered)
/// for all memory except the first and the last sections, which get
/// `TEXCB=00100` (Normal). Domain bits are set to `1111` and AP bits are set
/// to `11`, but this is mostly irrelevant.
pub(crate) fn default_mmu_translation_table() -> [u32; TT_ENTRIES] {
    let mut tt = [0_u32; TT_ENTRIES];
    for (i, word) in tt.iter_mut().enumerate() {
        *word = 0x0000_0DE2 | ((i as u32) << 20);
        if i == 0x000 || i == 0xFFF {
            *word |= 0x1000;
        }
    }
    tt
}

/// Checks that every entry of the table is a direct-mapped 1 MiB section
/// descriptor, i.e. that this really is a boot-ROM translation table.
fn validate_translation_table(tt: &[u32; TT_ENTRIES]) -> Result<(), Error> {
    for (i, &word) in tt.iter().enumerate() {
        if ((word >> 1) & 1) != 1 || ((word >> 18) & 1) != 0 {
            bail!("MMU: entry {:#05x} is not a section descriptor", i);
        }
        if (word >> 20) != i as u32 {
            bail!("MMU: entry {:#05x} is not a direct mapping", i);
        }
    }
    Ok(())
}

/// Rewrites the section attributes for the restore path: `TEXCB=00100`
/// (Normal uncached, write-combine) for all of DRAM and `TEXCB=00111`
/// (Normal write-back cached) for the BROM section.
fn apply_restore_attributes(tt: &mut [u32; TT_ENTRIES]) {
    let start = (DRAM_BASE >> 20) as usize;
    let end = ((DRAM_BASE + DRAM_SIZE) >> 20) as usize;
    for word in tt[start..end].iter_mut() {
        // Clear TEXCB bits
        *word &= !((7 << 12) | (1 << 3) | (1 << 2));
        // Set TEXCB to 00100 (Normal uncached mapping)
        *word |= 1 << 12;
    }

    // Clear TEXCB bits first
    tt[0xFFF] &= !((7 << 12) | (1 << 3) | (1 << 2));
    // Set TEXCB to 00111 (Normal write-back cached mapping)
    tt[0xFFF] |= (1 << 12) | // TEX
                 (1 << 3) | // C
                 (1 << 2); // B
}

impl<T: UsbTransport> FelHandle<T> {
    /// Gets the `TTBR0` register.
    pub(crate) fn get_ttbr0(&self) -> Result<u32, Error> {
        self.read_arm_cp_reg(15, 0, 2, 0, 0)
    }

    /// Sets the `TTBR0` register to the given value.
    pub(crate) fn set_ttbr0(&self, val: u32) -> Result<(), Error> {
        self.write_arm_cp_reg(15, 0, 2, 0, 0, val)
    }

    /// Gets the `TTBCR` register.
    pub(crate) fn get_ttbcr(&self) -> Result<u32, Error> {
        self.read_arm_cp_reg(15, 0, 2, 0, 2)
    }

    /// Sets the `TTBCR` register to the given value.
    pub(crate) fn set_ttbcr(&self, val: u32) -> Result<(), Error> {
        self.write_arm_cp_reg(15, 0, 2, 0, 2, val)
    }

    /// Gets the `DACR` register.
    pub(crate) fn get_dacr(&self) -> Result<u32, Error> {
        self.read_arm_cp_reg(15, 0, 3, 0, 0)
    }

    /// Sets the `DACR` register to the given value.
    pub(crate) fn set_dacr(&self, val: u32) -> Result<(), Error> {
        self.write_arm_cp_reg(15, 0, 3, 0, 0, val)
    }

    /// Gets the `SCTLR` register.
    pub(crate) fn get_sctlr(&self) -> Result<u32, Error> {
        self.read_arm_cp_reg(15, 0, 1, 0, 0)
    }

    /// Backs up the MMU translation table and disables the MMU.
    ///
    /// Returns `None` when the boot ROM never enabled the MMU. The register
    /// checks below compare against values known to be initialized in this
    /// particular way by the existing BROM implementations. We don't strictly
    /// need them to exactly match, but the guards detect any configuration
    /// changes in future SoC variants: a failure here more likely means a
    /// check needs to be relaxed than a real problem, and halting is the safe
    /// response.
    pub(crate) fn backup_and_disable_mmu(&self) -> Result<Option<[u32; TT_ENTRIES]>, Error> {
        // Ignore the M/Z/I/V/UNK bits and expect no TEX remap.
        let sctlr = self.get_sctlr().context("unable to read SCTLR")?;
        if (sctlr & !((0x7 << 11) | (1 << 6) | 1)) != 0x00C5_0038 {
            bail!("unexpected SCTLR ({:#010x})", sctlr);
        }
        if (sctlr & 1) == 0 {
            info!("MMU is not enabled by BROM");
            return Ok(None);
        }

        let dacr = self.get_dacr().context("unable to read DACR")?;
        if dacr != 0x5555_5555 {
            bail!("unexpected DACR ({:#010x})", dacr);
        }

        let ttbcr = self.get_ttbcr().context("unable to read TTBCR")?;
        if ttbcr != 0x0000_0000 {
            bail!("unexpected TTBCR ({:#010x})", ttbcr);
        }

        let ttbr0 = self.get_ttbr0().context("unable to read TTBR0")?;
        if (ttbr0 & 0x3FFF) != 0 {
            bail!("unexpected TTBR0 ({:#010x})", ttbr0);
        }

        info!("reading the MMU translation table from {:#010x}", ttbr0);
        let mut tt = [0_u32; TT_ENTRIES];
        self.fel_read(ttbr0, u32_as_u8_mut(&mut tt))
            .with_context(|_| {
                format!("could not read the MMU translation table from {:#010x}", ttbr0)
            })?;
        for word in tt.iter_mut() {
            *word = u32::from_le(*word);
        }
        validate_translation_table(&tt)?;

        let arm_code: [u32; 6] = [
            // Disable I-cache, MMU and branch prediction
            // mrc        15, 0, r0, cr1, cr0, {0}
            0x_ee_11_0f_10_u32.to_le(),
            // bic        r0, r0, #1
            0x_e3_c0_00_01_u32.to_le(),
            // bic        r0, r0, #4096
            0x_e3_c0_0a_01_u32.to_le(),
            // bic        r0, r0, #2048
            0x_e3_c0_0b_02_u32.to_le(),
            // mcr        15, 0, r0, cr1, cr0, {0}
            0x_ee_01_0f_10_u32.to_le(),
            // Return back to FEL
            // bx         lr
            0x_e1_2f_ff_1e_u32.to_le(),
        ];

        info!("disabling I-cache, MMU and branch prediction");
        let scratch_addr = self.get_soc_info()?.get_scratch_addr();
        self.fel_write(scratch_addr, u32_as_u8(&arm_code))
            .context("could not write the MMU disabling code")?;
        self.fel_execute(scratch_addr)
            .context("could not execute the MMU disabling code")?;
        Ok(Some(tt))
    }

    /// Writes the translation table back (with improved section attributes)
    /// and re-enables the MMU.
    pub(crate) fn restore_and_enable_mmu(&self, mut tt: [u32; TT_ENTRIES]) -> Result<(), Error> {
        let ttbr0 = self.get_ttbr0().context("unable to read TTBR0")?;

        info!("setting write-combine mapping for DRAM");
        info!("setting cached mapping for BROM");
        apply_restore_attributes(&mut tt);

        info!("writing back the MMU translation table");
        for word in tt.iter_mut() {
            *word = word.to_le();
        }
        self.fel_write(ttbr0, u32_as_u8(&tt))
            .context("could not write back the MMU translation table")?;

        let arm_code: [u32; 12] = [
            // Invalidate I-cache, TLB and BTB
            // mov        r0, #0
            0x_e3_a0_00_00_u32.to_le(),
            // mcr        15, 0, r0, cr8, cr7, {0}
            0x_ee_08_0f_17_u32.to_le(),
            // mcr        15, 0, r0, cr7, cr5, {0}
            0x_ee_07_0f_15_u32.to_le(),
            // mcr        15, 0, r0, cr7, cr5, {6}
            0x_ee_07_0f_d5_u32.to_le(),
            // dsb        sy
            0x_f5_7f_f0_4f_u32.to_le(),
            // isb        sy
            0x_f5_7f_f0_6f_u32.to_le(),
            // Enable I-cache, MMU and branch prediction
            // mrc        15, 0, r0, cr1, cr0, {0}
            0x_ee_11_0f_10_u32.to_le(),
            // orr        r0, r0, #1
            0x_e3_80_00_01_u32.to_le(),
            // orr        r0, r0, #4096
            0x_e3_80_0a_01_u32.to_le(),
            // orr        r0, r0, #2048
            0x_e3_80_0b_02_u32.to_le(),
            // mcr        15, 0, r0, cr1, cr0, {0}
            0x_ee_01_0f_10_u32.to_le(),
            // Return back to FEL
            // bx         lr
            0x_e1_2f_ff_1e_u32.to_le(),
        ];

        info!("enabling I-cache, MMU and branch prediction");
        let scratch_addr = self.get_soc_info()?.get_scratch_addr();
        self.fel_write(scratch_addr, u32_as_u8(&arm_code))
            .context("could not write the MMU enabling code")?;
        self.fel_execute(scratch_addr)
            .context("could not execute the MMU enabling code")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{apply_restore_attributes, default_mmu_translation_table,
                validate_translation_table};

    #[test]
    fn it_generates_a_valid_default_table() {
        let tt = default_mmu_translation_table();
        validate_translation_table(&tt).unwrap();
        // Strongly ordered everywhere except the first and last sections.
        assert_eq!(tt[0x000] & 0x1000, 0x1000);
        assert_eq!(tt[0xFFF] & 0x1000, 0x1000);
        assert_eq!(tt[0x001] & 0x1000, 0);
        assert_eq!(tt[0x400], 0x0000_0DE2 | (0x400 << 20));
    }

    #[test]
    fn it_rejects_malformed_tables() {
        let mut tt = default_mmu_translation_table();
        tt[42] &= !(1 << 1); // not a section descriptor
        assert!(validate_translation_table(&tt).is_err());

        let mut tt = default_mmu_translation_table();
        tt[42] |= 1 << 18; // supersection bit set
        assert!(validate_translation_table(&tt).is_err());

        let mut tt = default_mmu_translation_table();
        tt[42] = (43 << 20) | (tt[42] & 0x000F_FFFF); // not a direct mapping
        assert!(validate_translation_table(&tt).is_err());
    }

    #[test]
    fn it_only_touches_texcb_bits_on_restore() {
        let mut tt = default_mmu_translation_table();
        let before = default_mmu_translation_table();
        apply_restore_attributes(&mut tt);

        // The table still validates: section shape bits are untouched.
        validate_translation_table(&tt).unwrap();

        const TEXCB_MASK: u32 = (7 << 12) | (1 << 3) | (1 << 2);
        for (i, (&after, &orig)) in tt.iter().zip(before.iter()).enumerate() {
            assert_eq!(after & !TEXCB_MASK, orig & !TEXCB_MASK, "entry {:#05x}", i);
            if i == 0xFFF {
                // Normal write-back cached mapping for the BROM.
                assert_eq!(after & TEXCB_MASK, (1 << 12) | (1 << 3) | (1 << 2));
            } else if i >= 0x400 && i < 0xC00 {
                // Normal uncached (write-combine) mapping for DRAM.
                assert_eq!(after & TEXCB_MASK, 1 << 12);
            } else {
                assert_eq!(after & TEXCB_MASK, orig & TEXCB_MASK, "entry {:#05x}", i);
            }
        }
    }
}

//! Runtime-generated ARM thunks.
//!
//! The FEL protocol can only move bytes and call an entry point. Everything
//! else — coprocessor access, single-word memory access, cache and reset
//! management — is done by hand-assembling a small position-independent ARM
//! stub, uploading it (plus any inlined parameters) to the SoC scratch area,
//! issuing `EXEC`, and reading results back from a known offset. Every thunk
//! returns with `bx lr` so the boot ROM resumes its FEL command loop.
//!
//! The instruction words are fixed, hand-encoded values; when a parameter
//! varies, it is either inlined as a trailing literal word or folded into the
//! instruction encoding arithmetically (as the coprocessor helpers do).

use byteorder::{ByteOrder, LittleEndian};
use failure::{Error, ResultExt};
use log::{info, warn};

use crate::fel::FelHandle;
use crate::transport::UsbTransport;
use crate::{u32_as_u8, u32_as_u8_mut, LCODE_ARM_RW_SIZE, LCODE_ARM_RW_WORDS, LCODE_MAX_RW_WORDS};

/// Word count of the `rmr_request()` scratch code.
const LCODE_ARM_RMR_WORDS: usize = 15;

impl<T: UsbTransport> FelHandle<T> {
    /// Reads a single 32-bit value from device memory.
    ///
    /// Unlike [`FelHandle::fel_read`], this performs a real word-sized access
    /// on the device side, which MMIO registers require.
    pub fn readl(&self, addr: u32) -> Result<u32, Error> {
        let mut val = [0_u32; 1];
        self.read_words(addr, &mut val)?;
        Ok(val[0])
    }

    /// Writes a single 32-bit value to device memory.
    ///
    /// Unlike [`FelHandle::fel_write`], this performs a real word-sized
    /// access on the device side, which MMIO registers require.
    pub fn writel(&self, addr: u32, val: u32) -> Result<(), Error> {
        self.write_words(addr, &[val])
    }

    /// Reads words from sequential device addresses into `words`.
    ///
    /// Large transfers are split into chunks of no more than 244 words, the
    /// target address advancing by `4·n` between rounds.
    pub fn read_words(&self, offset: u32, words: &mut [u32]) -> Result<(), Error> {
        assert!(
            u32::max_value() - (words.len() * 4) as u32 > offset,
            "cannot read above {:#010x} - offset: {:#010x}, length: {:#x} words",
            u32::max_value(),
            offset,
            words.len()
        );
        let mut addr = offset;
        for chunk in words.chunks_mut(LCODE_MAX_RW_WORDS) {
            self.read_words_chunk(addr, chunk)
                .context("could not read word chunk from device memory")?;
            addr += (chunk.len() * 4) as u32;
        }
        Ok(())
    }

    /// Writes `words` to sequential device addresses.
    ///
    /// Large transfers are split into chunks of no more than 244 words, the
    /// target address advancing by `4·n` between rounds.
    pub fn write_words(&self, offset: u32, words: &[u32]) -> Result<(), Error> {
        assert!(
            u32::max_value() - (words.len() * 4) as u32 > offset,
            "cannot write above {:#010x} - offset: {:#010x}, length: {:#x} words",
            u32::max_value(),
            offset,
            words.len()
        );
        let mut addr = offset;
        for chunk in words.chunks(LCODE_MAX_RW_WORDS) {
            self.write_words_chunk(addr, chunk)
                .context("could not write word chunk to device memory")?;
            addr += (chunk.len() * 4) as u32;
        }
        Ok(())
    }

    /// Reads the 128-bit SID key from the SoC, if it has one.
    pub fn read_sid(&self) -> Result<Option<[u32; 4]>, Error> {
        if let Some(sid_addr) = self.get_soc_info()?.get_sid_addr() {
            info!("SID key (e-fuses) at {:#010x}", sid_addr);
            let mut sid = [0_u32; 4];
            self.read_words(sid_addr, &mut sid)
                .context("unable to read SID registers")?;
            Ok(Some(sid))
        } else {
            Ok(None)
        }
    }

    /// Performs a FEL RMR request.
    ///
    /// This stores the given entry point to the `RVBAR` address for *CPU0*,
    /// and then writes the Reset Management Register to request a warm boot.
    /// It is useful for some *AArch64* transitions, e.g. when passing control
    /// to ARM Trusted Firmware (ATF) during the boot process of Pine64.
    ///
    /// On SoCs whose `RVBAR` address is unknown this logs a warning and does
    /// nothing.
    pub fn rmr_request(&self, entry_point: u32, aarch64: bool) -> Result<(), Error> {
        let soc_info = self.get_soc_info()?;
        let rvbar_reg = match soc_info.get_rvbar_reg() {
            Some(reg) => reg,
            None => {
                warn!(
                    "can't issue RMR request: RVBAR is not supported or unknown for your SoC \
                     (id={:#06x})",
                    soc_info.get_soc_id()
                );
                return Ok(());
            }
        };
        let rmr_mode: u32 = (1 << 1) | u32::from(aarch64); // RR, AA64 flag

        let arm_code: [u32; LCODE_ARM_RMR_WORDS] = [
            // ldr        r0, [rvbar_reg]
            0x_e5_9f_00_28_u32.to_le(),
            // ldr        r1, [entry_point]
            0x_e5_9f_10_28_u32.to_le(),
            // str        r1, [r0]
            0x_e5_80_10_00_u32.to_le(),
            // dsb        sy
            0x_f5_7f_f0_4f_u32.to_le(),
            // isb        sy
            0x_f5_7f_f0_6f_u32.to_le(),
            // ldr        r1, [rmr_mode]
            0x_e5_9f_10_1c_u32.to_le(),
            // mrc        15, 0, r0, cr12, cr0, {2}
            0x_ee_1c_0f_50_u32.to_le(),
            // orr        r0, r0, r1
            0x_e1_80_00_01_u32.to_le(),
            // mcr        15, 0, r0, cr12, cr0, {2}
            0x_ee_0c_0f_50_u32.to_le(),
            // isb        sy
            0x_f5_7f_f0_6f_u32.to_le(),
            // loop:      wfi
            0x_e3_20_f0_03_u32.to_le(),
            // b          <loop>
            0x_ea_ff_ff_fd_u32.to_le(),
            rvbar_reg.to_le(),
            entry_point.to_le(),
            rmr_mode.to_le(),
        ];

        info!(
            "storing entry point {:#010x} to RVBAR {:#010x}, requesting warm reset with RMR mode \
             {}",
            entry_point, rvbar_reg, rmr_mode
        );
        self.fel_write(soc_info.get_scratch_addr(), u32_as_u8(&arm_code))
            .context("unable to write RMR request code to scratch address")?;
        self.fel_execute(soc_info.get_scratch_addr())
            .context("unable to execute RMR request code")?;
        Ok(())
    }

    /// Enables the L2 cache.
    pub(crate) fn enable_l2_cache(&self) -> Result<(), Error> {
        let scratch_addr = self.get_soc_info()?.get_scratch_addr();
        let arm_code: [u32; 4] = [
            // mrc        15, 0, r2, cr1, cr0, {1}
            0x_ee_11_2f_30_u32.to_le(),
            // orr        r2, r2, #2
            0x_e3_82_20_02_u32.to_le(),
            // mcr        15, 0, r2, cr1, cr0, {1}
            0x_ee_01_2f_30_u32.to_le(),
            // Return back to FEL
            // bx         lr
            0x_e1_2f_ff_1e_u32.to_le(),
        ];
        self.fel_write(scratch_addr, u32_as_u8(&arm_code))
            .context("could not write L2 cache enabling code")?;
        self.fel_execute(scratch_addr)
            .context("could not execute L2 cache enabling code")?;
        Ok(())
    }

    /// Captures the boot ROM stack pointers before they are disturbed.
    ///
    /// The result is the `(SP_irq, SP)` pair. The thunk switches the CPSR to
    /// IRQ mode to read the banked stack pointer, because `mrs r0, SP_irq`
    /// needs the Virtualization Extensions and does not work on Cortex-A8.
    pub(crate) fn get_stack_info(&self) -> Result<(u32, u32), Error> {
        let scratch_addr = self.get_soc_info()?.get_scratch_addr();
        let arm_code: [u32; 9] = [
            // mrs        r0, CPSR
            0x_e1_0f_00_00_u32.to_le(),
            // bic        r1, r0, #31
            0x_e3_c0_10_1f_u32.to_le(),
            // orr        r1, r1, #18
            0x_e3_81_10_12_u32.to_le(),
            // msr        CPSR_c, r1
            0x_e1_21_f0_01_u32.to_le(),
            // mov        r1, sp
            0x_e1_a0_10_0d_u32.to_le(),
            // msr        CPSR_c, r0
            0x_e1_21_f0_00_u32.to_le(),
            // str        r1, [pc, #4]
            0x_e5_8f_10_04_u32.to_le(),
            // str        sp, [pc, #4]
            0x_e5_8f_d0_04_u32.to_le(),
            // Return back to FEL
            // bx         lr
            0x_e1_2f_ff_1e_u32.to_le(),
        ];
        self.fel_write(scratch_addr, u32_as_u8(&arm_code))
            .context("could not write stack probe code")?;
        self.fel_execute(scratch_addr)
            .context("could not execute stack probe code")?;
        let mut result = [0_u8; 2 * 4];
        self.fel_read(scratch_addr + 9 * 4, &mut result)
            .context("could not read stack probe results")?;
        Ok((
            LittleEndian::read_u32(&result[..4]),
            LittleEndian::read_u32(&result[4..]),
        ))
    }

    /// Reads the given ARM coprocessor register.
    ///
    /// The `MRC` instruction word is computed from the operands; the value
    /// lands right after the three code words, at `scratch_addr + 12`.
    pub(crate) fn read_arm_cp_reg(
        &self,
        coproc: u32,
        opc1: u32,
        cr_n: u32,
        cr_m: u32,
        opc2: u32,
    ) -> Result<u32, Error> {
        let scratch_addr = self.get_soc_info()?.get_scratch_addr();
        let opcode = 0xEE00_0000
            | (1 << 20)
            | (1 << 4)
            | ((opc1 & 7) << 21)
            | ((cr_n & 15) << 16)
            | ((coproc & 15) << 8)
            | ((opc2 & 7) << 5)
            | (cr_m & 15);
        let arm_code: [u32; 3] = [
            // mrc  coproc, opc1, r0, cr_n, cr_m, opc2
            opcode.to_le(),
            // str  r0, [pc]
            0x_e5_8f_00_00_u32.to_le(),
            // bx   lr
            0x_e1_2f_ff_1e_u32.to_le(),
        ];
        self.fel_write(scratch_addr, u32_as_u8(&arm_code))
            .context("could not write coprocessor read code")?;
        self.fel_execute(scratch_addr)
            .context("could not execute coprocessor read code")?;
        let mut reg_value = [0_u8; 4];
        self.fel_read(scratch_addr + 3 * 4, &mut reg_value)
            .context("could not read back the coprocessor register value")?;
        Ok(LittleEndian::read_u32(&reg_value))
    }

    /// Writes the given value to the given ARM coprocessor register.
    ///
    /// The value is inlined as a trailing literal word after the code; `DSB`
    /// and `ISB` barriers make the write take effect before returning.
    pub(crate) fn write_arm_cp_reg(
        &self,
        coproc: u32,
        opc1: u32,
        cr_n: u32,
        cr_m: u32,
        opc2: u32,
        val: u32,
    ) -> Result<(), Error> {
        let scratch_addr = self.get_soc_info()?.get_scratch_addr();
        let opcode = 0xEE00_0000
            | (1 << 4)
            | ((opc1 & 7) << 21)
            | ((cr_n & 15) << 16)
            | ((coproc & 15) << 8)
            | ((opc2 & 7) << 5)
            | (cr_m & 15);
        let arm_code: [u32; 6] = [
            // ldr  r0, [pc, #12]
            0x_e5_9f_00_0c_u32.to_le(),
            // mcr  coproc, opc1, r0, cr_n, cr_m, opc2
            opcode.to_le(),
            // dsb  sy
            0x_f5_7f_f0_4f_u32.to_le(),
            // isb  sy
            0x_f5_7f_f0_6f_u32.to_le(),
            // bx   lr
            0x_e1_2f_ff_1e_u32.to_le(),
            val.to_le(),
        ];
        self.fel_write(scratch_addr, u32_as_u8(&arm_code))
            .context("could not write coprocessor write code")?;
        self.fel_execute(scratch_addr)
            .context("could not execute coprocessor write code")?;
        Ok(())
    }

    /// Reads one chunk of up to 244 words via the scratch-area copy loop.
    ///
    /// Requests above the cap are truncated with a warning; the trailing
    /// words of `words` are left untouched in that case.
    fn read_words_chunk(&self, offset: u32, words: &mut [u32]) -> Result<(), Error> {
        if words.is_empty() {
            return Ok(());
        }
        let words = if words.len() > LCODE_MAX_RW_WORDS {
            warn!("max word count exceeded, truncating read_words transfer");
            &mut words[..LCODE_MAX_RW_WORDS]
        } else {
            words
        };
        let scratch_addr = self.get_soc_info()?.get_scratch_addr();

        let arm_code: [u32; LCODE_ARM_RW_WORDS] = [
            // ldr   r0, [pc, #32] ; ldr r0,[read_addr]
            0x_e5_9f_00_20_u32.to_le(),
            // add   r1, pc, #36   ; adr r1, read_data
            0x_e2_8f_10_24_u32.to_le(),
            // ldr   r2, [pc, #28] ; ldr r2,[read_count]
            0x_e5_9f_20_1c_u32.to_le(),
            // cmp   r2, #LCODE_MAX_RW_WORDS
            (0x_e3_52_00_00_u32 + LCODE_MAX_RW_WORDS as u32).to_le(),
            // movgt r2, #LCODE_MAX_RW_WORDS
            (0x_c3_a0_20_00_u32 + LCODE_MAX_RW_WORDS as u32).to_le(),
            // read_loop:
            // subs  r2, r2, #1    ; r2 -= 1
            0x_e2_52_20_01_u32.to_le(),
            // bxmi  lr            ; return if (r2 < 0)
            0x_41_2f_ff_1e_u32.to_le(),
            // ldr   r3, [r0], #4  ; load and post-inc
            0x_e4_90_30_04_u32.to_le(),
            // str   r3, [r1], #4  ; store and post-inc
            0x_e4_81_30_04_u32.to_le(),
            // b     read_loop
            0x_ea_ff_ff_fa_u32.to_le(),
            offset.to_le(),
            (words.len() as u32).to_le(),
        ];
        // read_data (buffer) follows, i.e. values go here.

        // Scratch buffer setup: transfers the ARM code, including addr and
        // count.
        self.fel_write(scratch_addr, u32_as_u8(&arm_code))
            .context("unable to write read_words code to scratch address")?;
        // Execute the code, read back the result.
        self.fel_execute(scratch_addr)
            .context("unable to execute read_words code")?;
        self.fel_read(
            scratch_addr + LCODE_ARM_RW_SIZE as u32,
            u32_as_u8_mut(words),
        )
        .context("unable to read back the read_words buffer")?;

        if cfg!(not(target_endian = "little")) {
            for word in words.iter_mut() {
                *word = u32::from_le(*word);
            }
        }

        Ok(())
    }

    /// Writes one chunk of up to 244 words via the scratch-area copy loop.
    ///
    /// Code and data travel in a single FEL write; requests above the cap are
    /// truncated with a warning.
    fn write_words_chunk(&self, offset: u32, words: &[u32]) -> Result<(), Error> {
        if words.is_empty() {
            return Ok(());
        }
        let words = if words.len() > LCODE_MAX_RW_WORDS {
            warn!("max word count exceeded, truncating write_words transfer");
            &words[..LCODE_MAX_RW_WORDS]
        } else {
            words
        };
        let scratch_addr = self.get_soc_info()?.get_scratch_addr();

        let mut arm_code = Vec::with_capacity(LCODE_ARM_RW_WORDS + words.len());
        arm_code.extend_from_slice(&[
            // ldr   r0, [pc, #32] ; ldr r0,[write_addr]
            0x_e5_9f_00_20_u32.to_le(),
            // add   r1, pc, #36   ; adr r1, write_data
            0x_e2_8f_10_24_u32.to_le(),
            // ldr   r2, [pc, #28] ; ldr r2,[write_count]
            0x_e5_9f_20_1c_u32.to_le(),
            // cmp   r2, #LCODE_MAX_RW_WORDS
            (0x_e3_52_00_00_u32 + LCODE_MAX_RW_WORDS as u32).to_le(),
            // movgt r2, #LCODE_MAX_RW_WORDS
            (0x_c3_a0_20_00_u32 + LCODE_MAX_RW_WORDS as u32).to_le(),
            // write_loop:
            // subs  r2, r2, #1    ; r2 -= 1
            0x_e2_52_20_01_u32.to_le(),
            // bxmi  lr            ; return if (r2 < 0)
            0x_41_2f_ff_1e_u32.to_le(),
            // ldr   r3, [r1], #4  ; load and post-inc
            0x_e4_91_30_04_u32.to_le(),
            // str   r3, [r0], #4  ; store and post-inc
            0x_e4_80_30_04_u32.to_le(),
            // b     write_loop
            0x_ea_ff_ff_fa_u32.to_le(),
            offset.to_le(),
            (words.len() as u32).to_le(),
        ]);
        // write_data (buffer) follows, i.e. values are taken from here.
        for word in words {
            arm_code.push(word.to_le());
        }

        // Scratch buffer setup: transfers the ARM code and the data.
        self.fel_write(scratch_addr, u32_as_u8(&arm_code))
            .context("unable to write write_words code to scratch address")?;
        // Execute, and we're done.
        self.fel_execute(scratch_addr)
            .context("unable to execute write_words code")?;

        Ok(())
    }
}

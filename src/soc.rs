//! *SoC* identification and per-SoC data.
//!
//! The FEL version reply carries a SoC ID; everything else the tool needs to
//! know about a chip (where it is safe to upload code, where the SPL has to
//! live, which SRAM regions the boot ROM occupies) comes from the static
//! table in this module.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

/// Allwinner *A10*, *A13* and *A20* *SRAM* swap buffers.
///
/// The *FEL* code from *BROM* in *A10/A13/A20* sets up two stacks for itself.
/// One at `0x2000` (and growing down) for the *IRQ* handler. And another one
/// at `0x7000` (and also growing down) for the regular code. In order to use
/// the whole *32 KiB* in the *A1/A2* sections of *SRAM*, we need to
/// temporarily move these stacks elsewhere. And the addresses
/// `0x7D00`–`0x7FFF` contain something important too (overwriting them kills
/// *FEL*). On *A10/A13/A20* we can use the *SRAM* sections *A3/A4*
/// (`0x8000`–`0xBFFF`) for this purpose.
const A10_A13_A20_SRAM_SWAP_BUFFERS: [SramSwapBuffers; 3] = [
    // `0x1C00`-`0x1FFF` (IRQ stack)
    SramSwapBuffers::new(0x1C00, 0xA400, 0x0400),
    // `0x5C00`-`0x6FFF` (Stack)
    SramSwapBuffers::new(0x5C00, 0xA800, 0x1400),
    // `0x7C00`-`0x7FFF` (Something important)
    SramSwapBuffers::new(0x7C00, 0xBC00, 0x0400),
];

/// Allwinner *A31* *SRAM* swap buffers.
///
/// *A31* is very similar to *A10/A13/A20*, except that it has no *SRAM* at
/// `0x8000`. So we use the *SRAM* section *B* at `0x20000`–`0x2FFFF` instead.
/// In the *FEL* mode, the *MMU* translation table is allocated by the *BROM*
/// at `0x20000`. But we can also safely use it as the backup storage because
/// the *MMU* is temporarily disabled during the time of the *SPL* execution.
const A31_SRAM_SWAP_BUFFERS: [SramSwapBuffers; 2] = [
    SramSwapBuffers::new(0x1800, 0x20000, 0x800),
    SramSwapBuffers::new(0x5C00, 0x20800, 0x8000 - 0x5C00),
];

/// Allwinner *A64* *SRAM* swap buffers.
///
/// *A64* has *32 KiB* of *SRAM A* at `0x10000` and a large *SRAM C* at
/// `0x18000`. *SRAM A* and *SRAM C* reside in the address space back-to-back
/// without any gaps, thus representing a single large contiguous area.
/// Everything is the same as on *A10/A13/A20*, but just shifted by `0x10000`.
const A64_SRAM_SWAP_BUFFERS: [SramSwapBuffers; 3] = [
    // `0x11C00`-`0x11FFF` (IRQ stack)
    SramSwapBuffers::new(0x11C00, 0x1A400, 0x0400),
    // `0x15C00`-`0x16FFF` (Stack)
    SramSwapBuffers::new(0x15C00, 0x1A800, 0x1400),
    // `0x17C00`-`0x17FFF` (Something important)
    SramSwapBuffers::new(0x17C00, 0x1BC00, 0x0400),
];

/// *AR100* *SRAM* swap buffers.
///
/// Use the *SRAM* section at `0x44000` as the backup storage. This is the
/// memory, which is normally shared with the *OpenRISC* core (should we do an
/// extra check to ensure that this core is powered off and can't interfere?).
const AR100_ABUSING_SRAM_SWAP_BUFFERS: [SramSwapBuffers; 2] = [
    SramSwapBuffers::new(0x1800, 0x44000, 0x800),
    SramSwapBuffers::new(0x5C00, 0x44800, 0x8000 - 0x5C00),
];

/// *A80* *SRAM* swap buffers.
///
/// *A80* has *40 KiB* *SRAM A1* at `0x10000` where the *SPL* has to be loaded
/// to. The secure *SRAM B* at `0x20000` is used as backup area for *FEL*
/// stacks and data.
const A80_SRAM_SWAP_BUFFERS: [SramSwapBuffers; 2] = [
    SramSwapBuffers::new(0x11800, 0x20000, 0x800),
    SramSwapBuffers::new(0x15400, 0x20800, 0x18000 - 0x15400),
];

/// Table with all the supported *SoCs*.
const SOC_INFO_TABLE: [SocInfo; 12] = [
    SocInfo {
        soc_id: 0x1623, // Allwinner A10
        name: "A10",
        spl_addr: 0x0000_0000,
        scratch_addr: 0x1000,
        thunk_addr: 0xA200,
        thunk_size: 0x200,
        needs_l2en: true,
        mmu_tt_addr: None,
        sid_addr: Some(0x01C2_3800),
        rvbar_reg: None,
        swap_buffers: &A10_A13_A20_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1625, // Allwinner A10s, A13, R8
        name: "A10s/A13/R8",
        spl_addr: 0x0000_0000,
        scratch_addr: 0x1000,
        thunk_addr: 0xA200,
        thunk_size: 0x200,
        needs_l2en: true,
        mmu_tt_addr: None,
        sid_addr: Some(0x01C2_3800),
        rvbar_reg: None,
        swap_buffers: &A10_A13_A20_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1651, // Allwinner A20
        name: "A20",
        spl_addr: 0x0000_0000,
        scratch_addr: 0x1000,
        thunk_addr: 0xA200,
        thunk_size: 0x200,
        needs_l2en: false,
        mmu_tt_addr: None,
        sid_addr: Some(0x01C2_3800),
        rvbar_reg: None,
        swap_buffers: &A10_A13_A20_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1650, // Allwinner A23
        name: "A23",
        spl_addr: 0x0000_0000,
        scratch_addr: 0x1000,
        thunk_addr: 0x46E00,
        thunk_size: 0x200,
        needs_l2en: false,
        mmu_tt_addr: None,
        sid_addr: Some(0x01C2_3800),
        rvbar_reg: None,
        swap_buffers: &AR100_ABUSING_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1633, // Allwinner A31
        name: "A31",
        spl_addr: 0x0000_0000,
        scratch_addr: 0x1000,
        thunk_addr: 0x22E00,
        thunk_size: 0x200,
        needs_l2en: false,
        mmu_tt_addr: None,
        sid_addr: None,
        rvbar_reg: None,
        swap_buffers: &A31_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1667, // Allwinner A33, R16
        name: "A33/R16",
        spl_addr: 0x0000_0000,
        scratch_addr: 0x1000,
        thunk_addr: 0x46E00,
        thunk_size: 0x200,
        needs_l2en: false,
        mmu_tt_addr: None,
        sid_addr: Some(0x01C2_3800),
        rvbar_reg: None,
        swap_buffers: &AR100_ABUSING_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1689, // Allwinner A64
        name: "A64",
        spl_addr: 0x10000,
        scratch_addr: 0x11000,
        thunk_addr: 0x1A200,
        thunk_size: 0x200,
        needs_l2en: false,
        mmu_tt_addr: None,
        sid_addr: Some(0x01C1_4200),
        rvbar_reg: Some(0x0170_00A0),
        swap_buffers: &A64_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1639, // Allwinner A80
        name: "A80",
        spl_addr: 0x10000,
        scratch_addr: 0x11000,
        thunk_addr: 0x23400,
        thunk_size: 0x200,
        needs_l2en: false,
        mmu_tt_addr: None,
        sid_addr: Some(0x01C0_E200),
        rvbar_reg: None,
        swap_buffers: &A80_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1673, // Allwinner A83T
        name: "A83T",
        spl_addr: 0x0000_0000,
        scratch_addr: 0x1000,
        thunk_addr: 0x46E00,
        thunk_size: 0x200,
        needs_l2en: false,
        mmu_tt_addr: None,
        sid_addr: Some(0x01C1_4200),
        rvbar_reg: None,
        swap_buffers: &AR100_ABUSING_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1680, // Allwinner H3, H2+
        name: "H3/H2+",
        spl_addr: 0x0000_0000,
        scratch_addr: 0x1000,
        thunk_addr: 0xA200,
        thunk_size: 0x200,
        needs_l2en: false,
        mmu_tt_addr: Some(0x8000),
        sid_addr: Some(0x01C1_4200),
        rvbar_reg: None,
        swap_buffers: &A10_A13_A20_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1718, // Allwinner H5
        name: "H5",
        spl_addr: 0x10000,
        scratch_addr: 0x11000,
        thunk_addr: 0x1A200,
        thunk_size: 0x200,
        needs_l2en: false,
        mmu_tt_addr: None,
        sid_addr: Some(0x01C1_4200),
        rvbar_reg: Some(0x0170_00A0),
        swap_buffers: &A64_SRAM_SWAP_BUFFERS,
    },
    SocInfo {
        soc_id: 0x1701, // Allwinner R40
        name: "R40",
        spl_addr: 0x0000_0000,
        scratch_addr: 0x1000,
        thunk_addr: 0xA200,
        thunk_size: 0x200,
        needs_l2en: false,
        mmu_tt_addr: None,
        sid_addr: Some(0x01C1_B200),
        rvbar_reg: None,
        swap_buffers: &A10_A13_A20_SRAM_SWAP_BUFFERS,
    },
];

/// *SoC* version information, as retrieved by the *FEL* protocol.
///
/// All fields of the 32-byte reply are kept so the `version` command can
/// print them, including the ones whose meaning is unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocVersion {
    signature: [u8; 8],
    /// Decoded SoC ID (bits 8..23 of the raw id field).
    soc_id: u32,
    unknown_0a: u32,
    protocol: u16,
    unknown_12: u8,
    unknown_13: u8,
    /// Scratchpad address; only the low 16 bits are meaningful.
    scratchpad: u32,
    pad: [u32; 2],
}

impl SocVersion {
    /// Decodes a SoC version structure from the raw 32-byte reply.
    #[doc(hidden)]
    pub fn from_bytes(bytes: [u8; 32]) -> SocVersion {
        let mut signature = [0_u8; 8];
        signature.clone_from_slice(&bytes[..8]);
        SocVersion {
            signature,
            soc_id: (LittleEndian::read_u32(&bytes[8..12]) >> 8) & 0xFFFF,
            unknown_0a: LittleEndian::read_u32(&bytes[12..16]),
            protocol: LittleEndian::read_u16(&bytes[16..18]),
            unknown_12: bytes[18],
            unknown_13: bytes[19],
            scratchpad: LittleEndian::read_u32(&bytes[20..24]) & 0xFFFF,
            pad: [
                LittleEndian::read_u32(&bytes[24..28]),
                LittleEndian::read_u32(&bytes[28..32]),
            ],
        }
    }

    /// Gets the SoC ID.
    pub fn get_id(&self) -> u32 {
        self.soc_id
    }
}

impl fmt::Display for SocVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} soc={:08x}({}) {:08x} ver={:04x} {:02x} {:02x} scratchpad={:08x} {:08x} {:08x}",
            String::from_utf8_lossy(&self.signature),
            self.soc_id,
            get_soc_name_from_id(self.soc_id).unwrap_or("unknown"),
            self.unknown_0a,
            self.protocol,
            self.unknown_12,
            self.unknown_13,
            self.scratchpad,
            self.pad[0],
            self.pad[1]
        )
    }
}

/// Gets the *SoC* name from the given ID, if supported.
fn get_soc_name_from_id(soc_id: u32) -> Option<&'static str> {
    SOC_INFO_TABLE
        .iter()
        .find(|soc_info| soc_info.soc_id == soc_id)
        .map(|soc_info| soc_info.name)
}

/// A pair of *SRAM* regions whose contents are exchanged around the *SPL*
/// run.
///
/// Bytes destined for `buf1` (a region the boot ROM is using) are staged at
/// `buf2` instead; the FEL→SPL thunk swaps the two regions just before
/// branching into the SPL, and swaps them back before returning to FEL.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SramSwapBuffers {
    /// BROM buffer.
    buf1: u32,
    /// Backup storage location.
    buf2: u32,
    /// Buffer size.
    size: u32,
}

impl SramSwapBuffers {
    /// Creates a swap-buffer pair.
    pub const fn new(buf1: u32, buf2: u32, size: u32) -> SramSwapBuffers {
        SramSwapBuffers { buf1, buf2, size }
    }

    /// Gets the BROM buffer.
    pub fn get_buf1(&self) -> u32 {
        self.buf1
    }

    /// Gets the backup storage location.
    pub fn get_buf2(&self) -> u32 {
        self.buf2
    }

    /// Gets the buffer size.
    pub fn get_size(&self) -> u32 {
        self.size
    }
}

/// *SoC* information structure.
///
/// Each *SoC* variant may have its own list of memory buffers to be exchanged
/// and the information about the placement of the thunk code, which handles
/// the transition of execution from the *BROM* *FEL* code to the U-Boot *SPL*
/// and back.
///
/// **Note:** the entries in the `swap_buffers` tables need to be sorted by
/// `buf1` addresses.
///
/// Also for performance reasons, we optionally want to have the *MMU* enabled
/// with optimal section attributes configured (the code from the *BROM*
/// should use the *I-cache*, writing data to the *DRAM* area should use write
/// combining). The older *SoC* variants (*A10*/*A13*/*A20*/*A31*/*A23*)
/// already have the *MMU* enabled and we only need to adjust section
/// attributes. The *BROM* in newer *SoC* variants (*A33*/*A83T*/*H3*) doesn't
/// enable the *MMU* any more, so we need to find some *16 KiB* of spare space
/// in *SRAM* to place the translation table there and specify it as the
/// `mmu_tt_addr` field. The `mmu_tt_addr` address must be *16 KiB* aligned.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SocInfo {
    /// ID of the SoC.
    soc_id: u32,
    /// Human-readable SoC name string.
    name: &'static str,
    /// SPL load address.
    spl_addr: u32,
    /// A safe place to upload & run code.
    scratch_addr: u32,
    /// Address of the thunk code.
    thunk_addr: u32,
    /// Maximal size of the thunk code.
    thunk_size: u32,
    /// Set the `L2EN` bit before running the SPL.
    needs_l2en: bool,
    /// MMU translation table address, for SoCs whose BROM leaves the MMU off.
    mmu_tt_addr: Option<u32>,
    /// Base address for the `SID_KEY[0-3]` registers.
    sid_addr: Option<u32>,
    /// MMIO address of the `RVBARADDR0_L` register.
    rvbar_reg: Option<u32>,
    /// SRAM swap buffers, sorted by `buf1`.
    swap_buffers: &'static [SramSwapBuffers],
}

impl SocInfo {
    /// Gets the SoC information structure for the given ID, if supported.
    pub fn from_id(soc_id: u32) -> Option<SocInfo> {
        SOC_INFO_TABLE
            .iter()
            .find(|soc_info| soc_info.soc_id == soc_id)
            .cloned()
    }

    /// Builds a SoC information structure from explicit values.
    #[doc(hidden)]
    #[allow(clippy::too_many_arguments)]
    pub const fn custom(
        soc_id: u32,
        name: &'static str,
        spl_addr: u32,
        scratch_addr: u32,
        thunk_addr: u32,
        thunk_size: u32,
        needs_l2en: bool,
        mmu_tt_addr: Option<u32>,
        sid_addr: Option<u32>,
        rvbar_reg: Option<u32>,
        swap_buffers: &'static [SramSwapBuffers],
    ) -> SocInfo {
        SocInfo {
            soc_id,
            name,
            spl_addr,
            scratch_addr,
            thunk_addr,
            thunk_size,
            needs_l2en,
            mmu_tt_addr,
            sid_addr,
            rvbar_reg,
            swap_buffers,
        }
    }

    /// Gets the SoC ID.
    pub fn get_soc_id(&self) -> u32 {
        self.soc_id
    }

    /// Gets the name of the SoC.
    pub fn get_name(&self) -> &'static str {
        self.name
    }

    /// Gets the SPL load address for the SoC.
    pub fn get_spl_addr(&self) -> u32 {
        self.spl_addr
    }

    /// Gets the scratch address.
    pub fn get_scratch_addr(&self) -> u32 {
        self.scratch_addr
    }

    /// Gets the address of the thunk code.
    pub fn get_thunk_addr(&self) -> u32 {
        self.thunk_addr
    }

    /// Gets the maximal size of the thunk code.
    pub fn get_thunk_size(&self) -> u32 {
        self.thunk_size
    }

    /// Does the SoC need the L2 cache enabled before running the SPL?
    pub fn needs_l2en(&self) -> bool {
        self.needs_l2en
    }

    /// Gets the *MMU* translation table address.
    pub fn get_mmu_tt_addr(&self) -> Option<u32> {
        self.mmu_tt_addr
    }

    /// Gets the `SID` register address.
    pub fn get_sid_addr(&self) -> Option<u32> {
        self.sid_addr
    }

    /// Gets the `RVBAR` register address, if supported.
    pub fn get_rvbar_reg(&self) -> Option<u32> {
        self.rvbar_reg
    }

    /// Gets the SoC swap buffers.
    pub fn get_swap_buffers(&self) -> &'static [SramSwapBuffers] {
        self.swap_buffers
    }
}

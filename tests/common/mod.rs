//! An in-memory FEL device emulator.
//!
//! Implements the AW-USB framing state machine (`AWUC` requests, bulk data,
//! `AWUS` status replies) and the four FEL commands over a sparse memory
//! map, and recognises the ARM thunks the host generates well enough to
//! emulate their effect: scratch-area word copies, coprocessor accesses, the
//! stack probe, MMU disable/enable, the RMR request and the FEL→SPL
//! bootstrap. This lets the integration tests drive the real protocol engine
//! end to end with literal byte streams.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};
use failure::Error;
use sunxi_fel::UsbTransport;

/// Bulk IN endpoint address of the emulated device.
pub const EP_IN: u8 = 0x81;
/// Bulk OUT endpoint address of the emulated device.
pub const EP_OUT: u8 = 0x01;

/// Stack pointers reported by the emulated stack probe.
pub const MOCK_SP_IRQ: u32 = 0x2000;
pub const MOCK_SP: u32 = 0x7000;

/// Coprocessor register keys: `(coproc, opc1, crn, crm, opc2)`.
pub const REG_SCTLR: (u32, u32, u32, u32, u32) = (15, 0, 1, 0, 0);
pub const REG_ACR: (u32, u32, u32, u32, u32) = (15, 0, 1, 0, 1);
pub const REG_TTBR0: (u32, u32, u32, u32, u32) = (15, 0, 2, 0, 0);
pub const REG_TTBCR: (u32, u32, u32, u32, u32) = (15, 0, 2, 0, 2);
pub const REG_DACR: (u32, u32, u32, u32, u32) = (15, 0, 3, 0, 0);

/// One observable FEL-level action of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Version,
    FelWrite { addr: u32, len: usize },
    FelRead { addr: u32, len: usize },
    Exec { addr: u32 },
}

enum UsbState {
    /// Waiting for a 32-byte `AWUC` request.
    AwaitRequest,
    /// Receiving an OUT payload of the given total length.
    ReceiveData { expected: usize, buf: Vec<u8> },
}

enum FelState {
    /// The next OUT payload is a 16-byte FEL request.
    Idle,
    /// The next OUT payload is data for a FEL write.
    WritePending { addr: u32, len: usize },
}

struct Inner {
    mem: BTreeMap<u32, u8>,
    regs: BTreeMap<(u32, u32, u32, u32, u32), u32>,
    usb: UsbState,
    fel: FelState,
    /// Bytes queued for the IN endpoint (data chunks and `AWUS` statuses).
    in_queue: VecDeque<u8>,
    /// Pending FEL response bytes, claimed by `AWUC READ` requests.
    fel_out: VecDeque<u8>,
    events: Vec<Event>,
    version_reply: [u8; 32],
    /// RMR request observed: `(rvbar_reg, entry_point, rmr_mode)`.
    rmr: Option<(u32, u32, u32)>,
    transfers: usize,
}

/// The emulated FEL device. Wrap it in a shared reference to use it as the
/// transport: `FelHandle::from_transport(&mock)`.
pub struct MockFelDevice {
    inner: RefCell<Inner>,
}

impl MockFelDevice {
    /// Creates a device replying to the version probe with the given SoC id.
    pub fn new(soc_id: u32) -> MockFelDevice {
        let mut version_reply = [0_u8; 32];
        version_reply[..8].clone_from_slice(b"AWUSBFEX");
        LittleEndian::write_u32(&mut version_reply[8..12], soc_id << 8);
        LittleEndian::write_u32(&mut version_reply[12..16], 1);
        LittleEndian::write_u16(&mut version_reply[16..18], 1);
        version_reply[18] = 0x44;
        version_reply[19] = 0x08;
        LittleEndian::write_u32(&mut version_reply[20..24], 0x7E00);
        MockFelDevice {
            inner: RefCell::new(Inner {
                mem: BTreeMap::new(),
                regs: BTreeMap::new(),
                usb: UsbState::AwaitRequest,
                fel: FelState::Idle,
                in_queue: VecDeque::new(),
                fel_out: VecDeque::new(),
                events: Vec::new(),
                version_reply,
                rmr: None,
                transfers: 0,
            }),
        }
    }

    /// Writes bytes directly into the emulated memory.
    pub fn write_mem(&self, addr: u32, data: &[u8]) {
        let mut inner = self.inner.borrow_mut();
        for (i, &byte) in data.iter().enumerate() {
            let _ = inner.mem.insert(addr + i as u32, byte);
        }
    }

    /// Reads bytes directly from the emulated memory (unwritten bytes are 0).
    pub fn read_mem(&self, addr: u32, len: usize) -> Vec<u8> {
        let inner = self.inner.borrow();
        (0..len)
            .map(|i| *inner.mem.get(&(addr + i as u32)).unwrap_or(&0))
            .collect()
    }

    /// Reads a little-endian word from the emulated memory.
    pub fn read_mem_word(&self, addr: u32) -> u32 {
        LittleEndian::read_u32(&self.read_mem(addr, 4))
    }

    /// Sets a coprocessor register value.
    pub fn set_reg(&self, key: (u32, u32, u32, u32, u32), val: u32) {
        let _ = self.inner.borrow_mut().regs.insert(key, val);
    }

    /// Gets a coprocessor register value.
    pub fn reg(&self, key: (u32, u32, u32, u32, u32)) -> u32 {
        *self.inner.borrow().regs.get(&key).unwrap_or(&0)
    }

    /// Returns the FEL-level events observed so far.
    pub fn events(&self) -> Vec<Event> {
        self.inner.borrow().events.clone()
    }

    /// Forgets all recorded events.
    pub fn clear_events(&self) {
        self.inner.borrow_mut().events.clear();
    }

    /// Number of `Exec` events observed.
    pub fn exec_count(&self) -> usize {
        self.inner
            .borrow()
            .events
            .iter()
            .filter(|event| matches!(event, Event::Exec { .. }))
            .count()
    }

    /// Total raw bulk transfers performed.
    pub fn transfer_count(&self) -> usize {
        self.inner.borrow().transfers
    }

    /// The RMR request observed, as `(rvbar_reg, entry_point, rmr_mode)`.
    pub fn rmr_request(&self) -> Option<(u32, u32, u32)> {
        self.inner.borrow().rmr
    }

    /// Populates a valid direct-mapped BROM translation table at `addr`.
    pub fn install_brom_translation_table(&self, addr: u32) {
        let mut table = vec![0_u8; 4096 * 4];
        for i in 0..4096_u32 {
            let mut word = 0x0000_0DE2 | (i << 20);
            if i == 0 || i == 0xFFF {
                word |= 0x1000;
            }
            LittleEndian::write_u32(&mut table[(i as usize) * 4..][..4], word);
        }
        self.write_mem(addr, &table);
    }

    /// Configures the coprocessor registers the way an "MMU on" BROM leaves
    /// them, with the translation table at `ttbr0`.
    pub fn boot_with_mmu_on(&self, ttbr0: u32) {
        self.set_reg(REG_SCTLR, 0x00C5_0038 | 1 | (1 << 11) | (1 << 12));
        self.set_reg(REG_DACR, 0x5555_5555);
        self.set_reg(REG_TTBCR, 0);
        self.set_reg(REG_TTBR0, ttbr0);
        self.install_brom_translation_table(ttbr0);
    }

    /// Configures the coprocessor registers the way an "MMU off" BROM leaves
    /// them.
    pub fn boot_with_mmu_off(&self) {
        self.set_reg(REG_SCTLR, 0x00C5_0038);
    }
}

impl Inner {
    fn read_word(&self, addr: u32) -> u32 {
        let bytes: Vec<u8> = (0..4)
            .map(|i| *self.mem.get(&(addr + i)).unwrap_or(&0))
            .collect();
        LittleEndian::read_u32(&bytes)
    }

    fn write_word(&mut self, addr: u32, val: u32) {
        let mut bytes = [0_u8; 4];
        LittleEndian::write_u32(&mut bytes, val);
        for (i, &byte) in bytes.iter().enumerate() {
            let _ = self.mem.insert(addr + i as u32, byte);
        }
    }

    fn store(&mut self, addr: u32, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            let _ = self.mem.insert(addr + i as u32, byte);
        }
    }

    fn queue_status(&mut self) {
        self.fel_out.extend([0_u8; 8].iter());
    }

    fn handle_awuc(&mut self, request: &[u8]) {
        assert_eq!(request.len(), 32, "AWUC request must be 32 bytes");
        assert_eq!(&request[..4], b"AWUC", "bad AW-USB request signature");
        let len = LittleEndian::read_u32(&request[8..12]) as usize;
        assert_eq!(
            LittleEndian::read_u32(&request[12..16]),
            0x0C00_0000,
            "bad AW-USB request constant"
        );
        let sub_request = LittleEndian::read_u16(&request[16..18]);
        assert_eq!(
            LittleEndian::read_u32(&request[18..22]) as usize,
            len,
            "AW-USB length fields disagree"
        );
        match sub_request {
            // AW_USB_WRITE: the payload follows on the OUT endpoint.
            0x12 => {
                self.usb = UsbState::ReceiveData {
                    expected: len,
                    buf: Vec::with_capacity(len),
                };
            }
            // AW_USB_READ: serve the pending FEL response bytes.
            0x11 => {
                assert!(
                    self.fel_out.len() >= len,
                    "host requested {} bytes, device has {} pending",
                    len,
                    self.fel_out.len()
                );
                for _ in 0..len {
                    let byte = self.fel_out.pop_front().unwrap();
                    self.in_queue.push_back(byte);
                }
                self.push_awus();
            }
            other => panic!("unknown AW-USB sub-request {:#06x}", other),
        }
    }

    fn push_awus(&mut self) {
        let mut status = [0_u8; 13];
        status[..4].clone_from_slice(b"AWUS");
        self.in_queue.extend(status.iter());
    }

    fn handle_fel_payload(&mut self, payload: &[u8]) {
        match self.fel {
            FelState::Idle => {
                assert_eq!(payload.len(), 16, "FEL request must be 16 bytes");
                let opcode = LittleEndian::read_u32(&payload[..4]);
                let addr = LittleEndian::read_u32(&payload[4..8]);
                let len = LittleEndian::read_u32(&payload[8..12]) as usize;
                match opcode {
                    // AW_FEL_VERSION
                    0x001 => {
                        let reply = self.version_reply;
                        self.fel_out.extend(reply.iter());
                        self.queue_status();
                        self.events.push(Event::Version);
                    }
                    // AW_FEL_1_WRITE
                    0x101 => {
                        self.fel = FelState::WritePending { addr, len };
                    }
                    // AW_FEL_1_EXEC
                    0x102 => {
                        self.events.push(Event::Exec { addr });
                        self.exec(addr);
                        self.queue_status();
                    }
                    // AW_FEL_1_READ
                    0x103 => {
                        let data: Vec<u8> = (0..len)
                            .map(|i| *self.mem.get(&(addr + i as u32)).unwrap_or(&0))
                            .collect();
                        self.fel_out.extend(data.iter());
                        self.queue_status();
                        self.events.push(Event::FelRead { addr, len });
                    }
                    other => panic!("unknown FEL request {:#06x}", other),
                }
            }
            FelState::WritePending { addr, len } => {
                assert_eq!(payload.len(), len, "FEL write payload length mismatch");
                self.store(addr, payload);
                self.fel = FelState::Idle;
                self.queue_status();
                self.events.push(Event::FelWrite { addr, len });
            }
        }
    }

    /// Emulates the effect of `EXEC(addr)` by recognising the code that the
    /// host uploads.
    fn exec(&mut self, addr: u32) {
        let words: Vec<u32> = (0..16).map(|i| self.read_word(addr + i * 4)).collect();
        match words[0] {
            // FEL->SPL bootstrap: `b <setup_stack>`.
            0xEA00_0015 => self.exec_spl_thunk(addr),
            // readl_n / writel_n copy loops: `ldr r0, [pc, #32]`.
            0xE59F_0020 => {
                let target = words[10];
                let count = words[11];
                match words[7] {
                    // `ldr r3, [r0], #4`: device memory -> scratch.
                    0xE490_3004 => {
                        for k in 0..count {
                            let val = self.read_word(target + 4 * k);
                            self.write_word(addr + 48 + 4 * k, val);
                        }
                    }
                    // `ldr r3, [r1], #4`: scratch -> device memory.
                    0xE491_3004 => {
                        for k in 0..count {
                            let val = self.read_word(addr + 48 + 4 * k);
                            self.write_word(target + 4 * k, val);
                        }
                    }
                    other => panic!("unrecognised copy loop body {:#010x}", other),
                }
            }
            // Coprocessor write: `ldr r0, [pc, #12]`, MCR at word 1, value at
            // word 5.
            0xE59F_000C => {
                let key = decode_cp_opcode(words[1]);
                let _ = self.regs.insert(key, words[5]);
            }
            // L2 enable: `mrc 15, 0, r2, cr1, cr0, {1}`.
            0xEE11_2F30 => {
                let acr = *self.regs.get(&REG_ACR).unwrap_or(&0);
                let _ = self.regs.insert(REG_ACR, acr | 2);
            }
            // Stack probe: `mrs r0, CPSR`.
            0xE10F_0000 => {
                self.write_word(addr + 36, MOCK_SP_IRQ);
                self.write_word(addr + 40, MOCK_SP);
            }
            // MMU disable: `mrc 15, 0, r0, cr1, cr0, {0}` + `bic r0, r0, #1`.
            0xEE11_0F10 if words[1] == 0xE3C0_0001 => {
                let sctlr = *self.regs.get(&REG_SCTLR).unwrap_or(&0);
                let _ = self
                    .regs
                    .insert(REG_SCTLR, sctlr & !(1 | (1 << 11) | (1 << 12)));
            }
            // MMU enable (invalidate + orr sequence): `mov r0, #0`.
            0xE3A0_0000 => {
                let sctlr = *self.regs.get(&REG_SCTLR).unwrap_or(&0);
                let _ = self
                    .regs
                    .insert(REG_SCTLR, sctlr | 1 | (1 << 11) | (1 << 12));
            }
            // RMR request: `ldr r0, [rvbar_reg]`.
            0xE59F_0028 => {
                self.rmr = Some((words[12], words[13], words[14]));
            }
            // Coprocessor read: MRC at word 0, `str r0, [pc]`, `bx lr`.
            _ if words[1] == 0xE58F_0000 && words[2] == 0xE12F_FF1E => {
                let key = decode_cp_opcode(words[0]);
                let val = *self.regs.get(&key).unwrap_or(&0);
                self.write_word(addr + 12, val);
            }
            other => panic!("unrecognised thunk at {:#010x}: {:#010x}", addr, other),
        }
    }

    /// Emulates the FEL->SPL bootstrap: swaps the staged SRAM buffers into
    /// place and rewrites the eGON tag as the success handshake.
    fn exec_spl_thunk(&mut self, thunk_addr: u32) {
        let mut cursor = thunk_addr + 66 * 4;
        let spl_addr = self.read_word(cursor);
        cursor += 4;
        loop {
            let buf1 = self.read_word(cursor);
            let buf2 = self.read_word(cursor + 4);
            let size = self.read_word(cursor + 8);
            cursor += 12;
            if size == 0 {
                break;
            }
            for k in 0..size {
                let a = *self.mem.get(&(buf1 + k)).unwrap_or(&0);
                let b = *self.mem.get(&(buf2 + k)).unwrap_or(&0);
                let _ = self.mem.insert(buf1 + k, b);
                let _ = self.mem.insert(buf2 + k, a);
            }
        }
        self.store(spl_addr + 4, b"eGON.FEL");
    }
}

impl<'a> UsbTransport for &'a MockFelDevice {
    fn endpoint_in(&self) -> u8 {
        EP_IN
    }

    fn endpoint_out(&self) -> u8 {
        EP_OUT
    }

    fn bulk_send(&self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize, Error> {
        assert_eq!(endpoint, EP_OUT, "bulk send on wrong endpoint");
        let mut inner = self.inner.borrow_mut();
        inner.transfers += 1;
        let awaiting = matches!(inner.usb, UsbState::AwaitRequest);
        if awaiting {
            inner.handle_awuc(data);
        } else {
            let complete = {
                let (expected, buf) = match inner.usb {
                    UsbState::ReceiveData {
                        expected,
                        ref mut buf,
                    } => (expected, buf),
                    UsbState::AwaitRequest => unreachable!(),
                };
                buf.extend_from_slice(data);
                assert!(buf.len() <= expected, "OUT payload overrun");
                if buf.len() == expected {
                    Some(std::mem::replace(buf, Vec::new()))
                } else {
                    None
                }
            };
            if let Some(payload) = complete {
                inner.usb = UsbState::AwaitRequest;
                inner.handle_fel_payload(&payload);
                inner.push_awus();
            }
        }
        Ok(data.len())
    }

    fn bulk_recv(&self, endpoint: u8, data: &mut [u8], _timeout: Duration) -> Result<usize, Error> {
        assert_eq!(endpoint, EP_IN, "bulk recv on wrong endpoint");
        let mut inner = self.inner.borrow_mut();
        inner.transfers += 1;
        assert!(
            !inner.in_queue.is_empty(),
            "host reads {} bytes but device has nothing queued",
            data.len()
        );
        let n = data.len().min(inner.in_queue.len());
        for slot in data.iter_mut().take(n) {
            *slot = inner.in_queue.pop_front().unwrap();
        }
        Ok(n)
    }
}

/// Decodes an MRC/MCR instruction word back into the register key
/// `(coproc, opc1, crn, crm, opc2)`.
fn decode_cp_opcode(opcode: u32) -> (u32, u32, u32, u32, u32) {
    (
        (opcode >> 8) & 15,
        (opcode >> 21) & 7,
        (opcode >> 16) & 15,
        opcode & 15,
        (opcode >> 5) & 7,
    )
}

/// Builds a valid eGON SPL image of the given total length, with the "sunxi"
/// SPL tag set.
pub fn make_spl(len: usize) -> Vec<u8> {
    assert_eq!(len % 4, 0);
    let mut spl = vec![0_u8; len];
    spl[4..12].clone_from_slice(b"eGON.BT0");
    LittleEndian::write_u32(&mut spl[16..20], len as u32);
    spl[0x14..0x17].clone_from_slice(b"SPL");
    spl[0x17] = 1;
    let mut sum = 0_u32;
    for word in spl.chunks(4) {
        sum = sum.wrapping_add(LittleEndian::read_u32(word));
    }
    LittleEndian::write_u32(&mut spl[12..16], 0x5F0A_6C39_u32.wrapping_add(sum));
    spl
}

/// Builds a mkimage container around `data`.
pub fn make_mkimage(data: &[u8], load_addr: u32, img_type: u8) -> Vec<u8> {
    use byteorder::BigEndian;

    let mut image = vec![0_u8; 64 + data.len()];
    BigEndian::write_u32(&mut image[..4], 0x2705_1956);
    BigEndian::write_u32(&mut image[12..16], data.len() as u32);
    BigEndian::write_u32(&mut image[16..20], load_addr);
    image[29] = 0x02; // IH_ARCH_ARM
    image[30] = img_type;
    image[32..38].clone_from_slice(b"U-Boot");
    image[64..].clone_from_slice(data);
    image
}

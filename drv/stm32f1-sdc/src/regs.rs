// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SDIO controller registers (RM0008 section 22.9).

use vcell::VolatileCell;

/// The controller registers the driver uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reg {
    Power,
    Clkcr,
    Arg,
    Cmd,
    RespCmd,
    Resp1,
    Resp2,
    Resp3,
    Resp4,
    Dtimer,
    Dlen,
    Dctrl,
    Dcount,
    Sta,
    Icr,
    Mask,
    FifoCnt,
}

/// Access to the controller. Every call is a side effect on the device, in
/// program order; status bits only clear through writes to `Reg::Icr`.
pub trait SdioRegs {
    fn read(&self, reg: Reg) -> u32;

    fn write(&self, reg: Reg, value: u32);

    fn modify(&self, reg: Reg, f: impl FnOnce(u32) -> u32) {
        let v = self.read(reg);
        self.write(reg, f(v));
    }

    /// Bus address of the data FIFO, for the DMA controller.
    fn fifo_address(&self) -> usize;
}

bitflags::bitflags! {
    /// Status bits. `ICR` and `MASK` use the same positions.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Sta: u32 {
        const CCRCFAIL = 1 << 0;
        const DCRCFAIL = 1 << 1;
        const CTIMEOUT = 1 << 2;
        const DTIMEOUT = 1 << 3;
        const TXUNDERR = 1 << 4;
        const RXOVERR = 1 << 5;
        const CMDREND = 1 << 6;
        const CMDSENT = 1 << 7;
        const DATAEND = 1 << 8;
        const STBITERR = 1 << 9;
        const DBCKEND = 1 << 10;
    }
}

impl Sta {
    /// Any of these ends a command with a response.
    pub const CMD_DONE: Self = Self::CMDREND
        .union(Self::CTIMEOUT)
        .union(Self::CCRCFAIL);

    /// Any of these ends a data transfer.
    pub const DATA_DONE: Self = Self::DCRCFAIL
        .union(Self::DTIMEOUT)
        .union(Self::DATAEND)
        .union(Self::STBITERR);

    /// Every clearable flag, as written to `ICR`.
    pub const CLEAR_ALL: u32 = 0xFFFF_FFFF;
}

bitflags::bitflags! {
    /// Command register flags; the command index goes in the low six bits.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Cmd: u32 {
        const WAITRESP_0 = 1 << 6;
        const WAITRESP_1 = 1 << 7;
        const WAITINT = 1 << 8;
        const WAITPEND = 1 << 9;
        const CPSMEN = 1 << 10;
    }
}

impl Cmd {
    pub const INDEX_MASK: u32 = 0x3F;

    pub fn encode(self, index: u8) -> u32 {
        u32::from(index) & Self::INDEX_MASK | self.bits()
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Dctrl: u32 {
        const DTEN = 1 << 0;
        /// Card to controller.
        const DTDIR = 1 << 1;
        const DTMODE = 1 << 2;
        const DMAEN = 1 << 3;
        const DBLOCKSIZE = 0xF << 4;
        const RWSTART = 1 << 8;
        const RWSTOP = 1 << 9;
        const RWMOD = 1 << 10;
        const SDIOEN = 1 << 11;
    }
}

impl Dctrl {
    /// Block size field for blocks of `1 << log2` bytes.
    pub const fn block_size(log2: u32) -> Self {
        Self::from_bits_retain((log2 & 0xF) << 4)
    }
}

bitflags::bitflags! {
    /// Clock control flags; the divider goes in the low byte.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Clkcr: u32 {
        const CLKEN = 1 << 8;
        const PWRSAV = 1 << 9;
        const BYPASS = 1 << 10;
        const WIDBUS_0 = 1 << 11;
        const WIDBUS_1 = 1 << 12;
        const NEGEDGE = 1 << 13;
        const HWFC_EN = 1 << 14;
    }
}

impl Clkcr {
    pub const CLKDIV_MASK: u32 = 0xFF;
    pub const WIDBUS: Self = Self::WIDBUS_0.union(Self::WIDBUS_1);
}

/// `POWER.PWRCTRL` value for "powered on".
pub const POWER_ON: u32 = 0b11;

/// Memory layout of the controller.
#[repr(C)]
pub struct RegisterBlock {
    power: VolatileCell<u32>,
    clkcr: VolatileCell<u32>,
    arg: VolatileCell<u32>,
    cmd: VolatileCell<u32>,
    respcmd: VolatileCell<u32>,
    resp: [VolatileCell<u32>; 4],
    dtimer: VolatileCell<u32>,
    dlen: VolatileCell<u32>,
    dctrl: VolatileCell<u32>,
    dcount: VolatileCell<u32>,
    sta: VolatileCell<u32>,
    icr: VolatileCell<u32>,
    mask: VolatileCell<u32>,
    _reserved0: [u32; 2],
    fifocnt: VolatileCell<u32>,
    _reserved1: [u32; 13],
    fifo: VolatileCell<u32>,
}

static_assertions::const_assert_eq!(
    core::mem::offset_of!(RegisterBlock, sta),
    0x34
);
static_assertions::const_assert_eq!(
    core::mem::offset_of!(RegisterBlock, fifo),
    0x80
);

/// The real controller.
pub struct Sdio {
    block: *const RegisterBlock,
}

// Safety: the register block is hardware; every access is a single volatile
// load or store, and the driver serializes the sequences that matter.
unsafe impl Sync for Sdio {}
unsafe impl Send for Sdio {}

impl Sdio {
    /// Where the STM32F1 maps the controller.
    pub const BASE: usize = 0x4001_8000;

    /// Usable in a `static` initializer; nothing is touched until the first
    /// register access.
    ///
    /// # Safety
    ///
    /// `base` must be the address of an SDIO controller, and nothing else may
    /// drive it.
    pub const unsafe fn new(base: usize) -> Self {
        Self {
            block: base as *const RegisterBlock,
        }
    }

    fn block(&self) -> &RegisterBlock {
        // Safety: `new`'s contract says this is the register block.
        unsafe { &*self.block }
    }

    fn cell(&self, reg: Reg) -> &VolatileCell<u32> {
        let b = self.block();
        match reg {
            Reg::Power => &b.power,
            Reg::Clkcr => &b.clkcr,
            Reg::Arg => &b.arg,
            Reg::Cmd => &b.cmd,
            Reg::RespCmd => &b.respcmd,
            Reg::Resp1 => &b.resp[0],
            Reg::Resp2 => &b.resp[1],
            Reg::Resp3 => &b.resp[2],
            Reg::Resp4 => &b.resp[3],
            Reg::Dtimer => &b.dtimer,
            Reg::Dlen => &b.dlen,
            Reg::Dctrl => &b.dctrl,
            Reg::Dcount => &b.dcount,
            Reg::Sta => &b.sta,
            Reg::Icr => &b.icr,
            Reg::Mask => &b.mask,
            Reg::FifoCnt => &b.fifocnt,
        }
    }
}

impl SdioRegs for Sdio {
    fn read(&self, reg: Reg) -> u32 {
        self.cell(reg).get()
    }

    fn write(&self, reg: Reg, value: u32) {
        self.cell(reg).set(value)
    }

    fn fifo_address(&self) -> usize {
        self.block().fifo.as_ptr() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_encoding_keeps_index_in_low_bits() {
        let word = (Cmd::WAITRESP_0 | Cmd::CPSMEN).encode(18);
        assert_eq!(word, 18 | 1 << 6 | 1 << 10);
        assert_eq!(Cmd::CPSMEN.encode(0x7F), 0x3F | 1 << 10);
    }

    #[test]
    fn read_control_word_for_512_byte_blocks() {
        let dctrl = Dctrl::DTDIR
            | Dctrl::block_size(9)
            | Dctrl::DMAEN
            | Dctrl::DTEN;
        assert_eq!(dctrl.bits(), 0b1001_1011);
    }

    #[test]
    fn sdio_reads_and_writes_the_block() {
        let base = Box::into_raw(Box::new([0u32; 64])) as usize;
        // Safety: a RAM stand-in for the register block, used by nothing else.
        let sdio = unsafe { Sdio::new(base) };
        sdio.write(Reg::Dlen, 1024);
        sdio.modify(Reg::Clkcr, |v| v | Clkcr::CLKEN.bits());
        assert_eq!(sdio.read(Reg::Dlen), 1024);
        assert_eq!(sdio.read(Reg::Clkcr), 1 << 8);
        assert_eq!(sdio.fifo_address(), base + 0x80);
    }

    #[test]
    fn controller_can_live_in_a_static() {
        // Safety: never accessed.
        static SDIO: Sdio = unsafe { Sdio::new(Sdio::BASE) };
        assert_eq!(SDIO.block as usize, Sdio::BASE);
    }
}

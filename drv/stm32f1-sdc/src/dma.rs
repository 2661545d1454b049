// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The DMA channel that moves data out of the SDIO FIFO.

use vcell::VolatileCell;

bitflags::bitflags! {
    /// Channel configuration (`DMA_CCRx`).
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct Ccr: u32 {
        const EN = 1 << 0;
        const TCIE = 1 << 1;
        const HTIE = 1 << 2;
        const TEIE = 1 << 3;
        /// Memory to peripheral.
        const DIR = 1 << 4;
        const CIRC = 1 << 5;
        const PINC = 1 << 6;
        const MINC = 1 << 7;
        const PSIZE_0 = 1 << 8;
        const PSIZE_1 = 1 << 9;
        const MSIZE_0 = 1 << 10;
        const MSIZE_1 = 1 << 11;
        const PL_0 = 1 << 12;
        const PL_1 = 1 << 13;
        const MEM2MEM = 1 << 14;
    }
}

impl Ccr {
    /// Channel priority, 0 (low) to 3 (very high).
    pub const fn priority(level: u8) -> Self {
        Self::from_bits_retain(((level & 0b11) as u32) << 12)
    }
}

/// One DMA channel, already allocated to the driver.
pub trait DmaChannel {
    fn set_peripheral(&self, addr: usize);

    /// Programs a transfer of `count` items into `memory`. Doesn't start it.
    fn setup(&self, count: u16, memory: usize, ccr: Ccr);

    fn enable(&self);

    /// Stops the channel and clears its event flags.
    fn disable(&self);
}

#[repr(C)]
struct ChannelRegs {
    ccr: VolatileCell<u32>,
    cndtr: VolatileCell<u32>,
    cpar: VolatileCell<u32>,
    cmar: VolatileCell<u32>,
    _reserved: u32,
}

/// Memory layout of a DMA controller.
#[repr(C)]
pub struct DmaBlock {
    isr: VolatileCell<u32>,
    ifcr: VolatileCell<u32>,
    channels: [ChannelRegs; 7],
}

static_assertions::const_assert_eq!(core::mem::size_of::<DmaBlock>(), 0x94);

/// A channel of an STM32F1 DMA controller.
pub struct Stm32Dma {
    block: *const DmaBlock,
    /// Zero-based; channel 1 in the manual is 0 here.
    channel: usize,
}

// Safety: see `regs::Sdio`.
unsafe impl Sync for Stm32Dma {}
unsafe impl Send for Stm32Dma {}

impl Stm32Dma {
    pub const DMA2_BASE: usize = 0x4002_0400;
    /// DMA2 channel 4 is wired to SDIO.
    pub const SDIO_CHANNEL: usize = 3;

    /// Usable in a `static` initializer, where a bad `channel` is a build
    /// error.
    ///
    /// # Safety
    ///
    /// `base` must be the address of a DMA controller, and `channel` must not
    /// be driven by anything else.
    pub const unsafe fn new(base: usize, channel: usize) -> Self {
        assert!(channel < 7, "no such DMA channel");
        Self {
            block: base as *const DmaBlock,
            channel,
        }
    }

    fn block(&self) -> &DmaBlock {
        // Safety: `new`'s contract says this is the register block.
        unsafe { &*self.block }
    }

    fn regs(&self) -> &ChannelRegs {
        &self.block().channels[self.channel]
    }

    /// Raw interrupt status for this channel (GIF, TCIF, HTIF, TEIF).
    pub fn status(&self) -> u32 {
        (self.block().isr.get() >> (self.channel * 4)) & 0xF
    }
}

impl DmaChannel for Stm32Dma {
    fn set_peripheral(&self, addr: usize) {
        self.regs().cpar.set(addr as u32);
    }

    fn setup(&self, count: u16, memory: usize, ccr: Ccr) {
        let r = self.regs();
        r.cmar.set(memory as u32);
        r.cndtr.set(u32::from(count));
        r.ccr.set((ccr - Ccr::EN).bits());
    }

    fn enable(&self) {
        let r = self.regs();
        r.ccr.set(r.ccr.get() | Ccr::EN.bits());
    }

    fn disable(&self) {
        let r = self.regs();
        r.ccr.set(r.ccr.get() & !Ccr::EN.bits());
        self.block().ifcr.set(0xF << (self.channel * 4));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(ch: usize) -> (Stm32Dma, *mut [u32; 0x94 / 4]) {
        let mem = Box::into_raw(Box::new([0u32; 0x94 / 4]));
        // Safety: a RAM stand-in for the controller, used by nothing else.
        (unsafe { Stm32Dma::new(mem as usize, ch) }, mem)
    }

    #[test]
    fn setup_programs_the_right_channel_without_starting_it() {
        let (dma, mem) = channel(Stm32Dma::SDIO_CHANNEL);
        dma.set_peripheral(0x4001_8080);
        dma.setup(256, 0x2000_1000, Ccr::priority(3) | Ccr::MINC | Ccr::EN);

        // Safety: the test owns the stand-in memory.
        let words = unsafe { &*mem };
        let base = 2 + 5 * Stm32Dma::SDIO_CHANNEL;
        assert_eq!(words[base], (Ccr::priority(3) | Ccr::MINC).bits());
        assert_eq!(words[base + 1], 256);
        assert_eq!(words[base + 2], 0x4001_8080);
        assert_eq!(words[base + 3], 0x2000_1000);

        dma.enable();
        assert_eq!(words[base] & Ccr::EN.bits(), Ccr::EN.bits());
        dma.disable();
        assert_eq!(words[base] & Ccr::EN.bits(), 0);
        assert_eq!(words[1], 0xF << 12);
    }

    #[test]
    fn status_reads_only_this_channels_flags() {
        let (dma, mem) = channel(Stm32Dma::SDIO_CHANNEL);
        // TCIF and GIF for this channel; TEIF for the one after it.
        // Safety: the test owns the stand-in memory.
        unsafe { (*mem)[0] = 0b0011 << 12 | 0b1000 << 16 };
        assert_eq!(dma.status(), 0b0011);
        unsafe { (*mem)[0] = 0b1000 << 16 };
        assert_eq!(dma.status(), 0);
    }

    #[test]
    fn channel_can_live_in_a_static() {
        // Safety: never accessed.
        static DMA: Stm32Dma = unsafe {
            Stm32Dma::new(Stm32Dma::DMA2_BASE, Stm32Dma::SDIO_CHANNEL)
        };
        assert_eq!(DMA.channel, Stm32Dma::SDIO_CHANNEL);
    }

    #[test]
    #[should_panic(expected = "no such DMA channel")]
    fn channel_out_of_range_dies() {
        let _ = channel(7);
    }
}

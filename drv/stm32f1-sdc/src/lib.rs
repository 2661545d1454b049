// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Driver for the STM32F1 SDIO controller, in SD card mode.
//!
//! Commands are short exchanges and are polled. Block reads are moved by DMA
//! and completed by the controller's interrupt: the calling thread arms the
//! transfer, issues `READ_MULTIPLE_BLOCK`, and then waits in the driver's
//! `WaitSlot` until `serve_interrupt` reports the end of data (or an error),
//! or until `SdcConfig::transfer_timeout` ticks pass.
//!
//! Wiring it up on hardware looks like this:
//!
//! ```ignore
//! static KERNEL: Kernel = Kernel::new();
//! static SDC: SdcDriver<'static, Sdio, Stm32Dma> = SdcDriver::new(
//!     &KERNEL,
//!     unsafe { Sdio::new(Sdio::BASE) },
//!     unsafe { Stm32Dma::new(Stm32Dma::DMA2_BASE, Stm32Dma::SDIO_CHANNEL) },
//!     SdcConfig::DEFAULT,
//! );
//!
//! #[no_mangle]
//! extern "C" fn SDIO() {
//!     SDC.serve_interrupt();
//! }
//!
//! // From a thread, once the kernel is running:
//! SDC.start()?;
//! ```
//!
//! The interrupt priority in `SdcConfig::irq_priority` must be at or below
//! the kernel level, since the handler resumes threads. `start` refuses a
//! configuration that breaks this.

#![cfg_attr(not(test), no_std)]

pub mod dma;
pub mod file;
pub mod regs;

use kern::gate::{self, GateCell};
use kern::rendezvous::WaitSlot;
use kern::startup::{KERNEL_PRIORITY, PRIORITY_BITS};
use kern::{Kernel, ReadyMsg};
use ringbuf::{ringbuf, ringbuf_entry};
use serde::Deserialize;

use crate::dma::{Ccr, DmaChannel};
use crate::regs::{Clkcr, Cmd, Dctrl, Reg, SdioRegs, Sta, POWER_ON};

/// Bytes per block.
pub const BLOCK_SIZE: usize = 512;
const BLOCK_SIZE_LOG2: u32 = 9;
const WORDS_PER_BLOCK: usize = BLOCK_SIZE / 4;

/// Card status bits in an R1 response that mean the command failed.
pub const R1_ERROR_MASK: u32 = 0xFDFF_E008;

pub const CMD_STOP_TRANSMISSION: u8 = 12;
pub const CMD_READ_MULTIPLE_BLOCK: u8 = 18;

#[derive(Copy, Clone, Debug, PartialEq)]
enum Trace {
    None,
    Start,
    Stop,
    Clock(u32),
    Cmd(u8, u32),
    Read { startblk: u32, blocks: u32 },
    /// The transfer was over before the thread got to wait for it.
    Raced(u32),
    Woke(i32),
    Irq(u32),
    Failed(SdcError),
}

ringbuf!(Trace, 32, Trace::None);

/// Run-time settings.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct SdcConfig {
    /// Data timeout, in SDIO_CK periods.
    pub data_timeout: u32,
    /// `CLKDIV` during card identification (at most 400 kHz).
    pub clock_div_low_speed: u8,
    /// `CLKDIV` for data transfers.
    pub clock_div_high_speed: u8,
    /// DMA channel priority, 0 to 3.
    pub dma_priority: u8,
    pub irq: u32,
    pub irq_priority: u8,
    /// Kernel ticks a block read may take before it's abandoned. `None`
    /// waits for the controller indefinitely.
    pub transfer_timeout: Option<u32>,
}

impl SdcConfig {
    pub const DEFAULT: Self = Self {
        data_timeout: 0x000F_FFFF,
        clock_div_low_speed: 178,
        clock_div_high_speed: 1,
        dma_priority: 3,
        irq: 49,
        irq_priority: 9,
        transfer_timeout: Some(1000),
    };
}

impl SdcConfig {
    /// Checks the settings the hardware would otherwise take without
    /// complaint and then misbehave on.
    pub fn validate(&self) -> Result<(), SdcError> {
        let levels = 1u16 << PRIORITY_BITS;
        if self.irq_priority < KERNEL_PRIORITY
            || u16::from(self.irq_priority) >= levels
        {
            return Err(SdcError::BadConfig);
        }
        if self.dma_priority > 3 {
            return Err(SdcError::BadConfig);
        }
        Ok(())
    }
}

impl Default for SdcConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SdcError {
    /// No response to a command.
    CommandTimeout,
    CommandCrcFail,
    /// The card answered with error bits set in its R1 status.
    CardError(u32),
    DataTimeout,
    DataCrcFail,
    StartBitError,
    /// The controller reported nothing within `SdcConfig::transfer_timeout`.
    TransferTimeout,
    /// The wait ended without the controller flagging an outcome.
    Aborted,
    /// The driver is stopped.
    NotReady,
    /// Buffer is empty, not whole blocks, misaligned, or too long for one
    /// DMA transfer.
    BadBuffer,
    NotSupported,
    /// `SdcConfig::validate` turned the settings down.
    BadConfig,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusMode {
    OneBit,
    FourBit,
    EightBit,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    Stopped,
    /// Powered, at identification speed or with the clock off.
    Ready,
    /// Clocked for data transfer.
    Active,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Response {
    None,
    Short,
    ShortCrc,
    LongCrc,
}

pub struct SdcDriver<'k, R, D> {
    kernel: &'k Kernel,
    regs: R,
    dma: D,
    config: SdcConfig,
    state: GateCell<State>,
    wait: WaitSlot,
    last_error: GateCell<Option<SdcError>>,
}

impl<'k, R: SdioRegs, D: DmaChannel> SdcDriver<'k, R, D> {
    pub const fn new(
        kernel: &'k Kernel,
        regs: R,
        dma: D,
        config: SdcConfig,
    ) -> Self {
        Self {
            kernel,
            regs,
            dma,
            config,
            state: GateCell::new(State::Stopped),
            wait: WaitSlot::new(),
            last_error: GateCell::new(None),
        }
    }

    pub fn state(&self) -> State {
        gate::with(|cs| *self.state.borrow_mut(cs))
    }

    /// The cause of the most recent failed operation.
    pub fn last_error(&self) -> Option<SdcError> {
        gate::with(|cs| *self.last_error.borrow_mut(cs))
    }

    fn set_state(&self, state: State) {
        gate::with(|cs| *self.state.borrow_mut(cs) = state);
    }

    fn fail(&self, e: SdcError) -> SdcError {
        ringbuf_entry!(Trace::Failed(e));
        gate::with(|cs| *self.last_error.borrow_mut(cs) = Some(e));
        e
    }

    fn require_running(&self) -> Result<(), SdcError> {
        match self.state() {
            State::Stopped => Err(self.fail(SdcError::NotReady)),
            State::Ready | State::Active => Ok(()),
        }
    }

    /// Brings the controller out of reset with the card clock off, and
    /// hooks up its interrupt and DMA channel if they aren't already.
    pub fn start(&self) -> Result<(), SdcError> {
        ringbuf_entry!(Trace::Start);
        self.config.validate().map_err(|e| self.fail(e))?;
        if self.state() == State::Stopped {
            self.dma.set_peripheral(self.regs.fifo_address());
            kern::arch::enable_irq(self.config.irq, self.config.irq_priority);
        }
        self.regs.write(Reg::Power, 0);
        self.regs.write(Reg::Clkcr, 0);
        self.regs.write(Reg::Dctrl, 0);
        self.regs.write(Reg::Dtimer, self.config.data_timeout);
        self.set_state(State::Ready);
        Ok(())
    }

    /// Powers the controller down and releases its interrupt and DMA
    /// channel. Does nothing if already stopped.
    pub fn stop(&self) {
        if self.state() == State::Stopped {
            return;
        }
        ringbuf_entry!(Trace::Stop);
        self.regs.write(Reg::Power, 0);
        self.regs.write(Reg::Clkcr, 0);
        self.regs.write(Reg::Dctrl, 0);
        self.regs.write(Reg::Dtimer, 0);
        kern::arch::disable_irq(self.config.irq);
        self.dma.disable();
        self.set_state(State::Stopped);
    }

    /// Powers the card and starts the clock at identification speed.
    pub fn start_clk(&self) {
        let div = u32::from(self.config.clock_div_low_speed);
        ringbuf_entry!(Trace::Clock(div));
        self.regs.write(Reg::Clkcr, div);
        self.regs.modify(Reg::Power, |p| p | POWER_ON);
        self.regs.modify(Reg::Clkcr, |c| c | Clkcr::CLKEN.bits());
    }

    /// Switches the clock to data transfer speed.
    pub fn set_data_clk(&self) {
        let div = u32::from(self.config.clock_div_high_speed);
        ringbuf_entry!(Trace::Clock(div));
        self.regs.modify(Reg::Clkcr, |c| c & !Clkcr::CLKDIV_MASK | div);
        gate::with(|cs| {
            let mut state = self.state.borrow_mut(cs);
            if *state == State::Ready {
                *state = State::Active;
            }
        });
    }

    /// Stops the clock and removes power from the card.
    pub fn stop_clk(&self) {
        ringbuf_entry!(Trace::Clock(0));
        self.regs.write(Reg::Clkcr, 0);
        self.regs.write(Reg::Power, 0);
        gate::with(|cs| {
            let mut state = self.state.borrow_mut(cs);
            if *state == State::Active {
                *state = State::Ready;
            }
        });
    }

    pub fn set_bus_mode(&self, mode: BusMode) {
        let width = match mode {
            BusMode::OneBit => Clkcr::empty(),
            BusMode::FourBit => Clkcr::WIDBUS_0,
            BusMode::EightBit => Clkcr::WIDBUS_1,
        };
        self.regs
            .modify(Reg::Clkcr, |c| c & !Clkcr::WIDBUS.bits() | width.bits());
    }

    /// Sends a command that has no response.
    pub fn send_cmd_none(&self, cmd: u8, arg: u32) -> Result<(), SdcError> {
        self.command(cmd, arg, Response::None)
            .map(drop)
            .map_err(|e| self.fail(e))
    }

    /// Sends a command with a short response whose CRC isn't checked (R3).
    pub fn send_cmd_short(&self, cmd: u8, arg: u32) -> Result<u32, SdcError> {
        self.command(cmd, arg, Response::Short)
            .map(|r| r[0])
            .map_err(|e| self.fail(e))
    }

    /// Sends a command with a short, CRC-protected response.
    pub fn send_cmd_short_crc(
        &self,
        cmd: u8,
        arg: u32,
    ) -> Result<u32, SdcError> {
        self.command(cmd, arg, Response::ShortCrc)
            .map(|r| r[0])
            .map_err(|e| self.fail(e))
    }

    /// Sends a command with a 136-bit response (R2). The result is
    /// `RESP1..=RESP4`, most significant word first.
    pub fn send_cmd_long_crc(
        &self,
        cmd: u8,
        arg: u32,
    ) -> Result<[u32; 4], SdcError> {
        self.command(cmd, arg, Response::LongCrc)
            .map_err(|e| self.fail(e))
    }

    fn command(
        &self,
        index: u8,
        arg: u32,
        response: Response,
    ) -> Result<[u32; 4], SdcError> {
        ringbuf_entry!(Trace::Cmd(index, arg));
        let flags = match response {
            Response::None => Cmd::CPSMEN,
            Response::Short | Response::ShortCrc => {
                Cmd::CPSMEN | Cmd::WAITRESP_0
            }
            Response::LongCrc => {
                Cmd::CPSMEN | Cmd::WAITRESP_0 | Cmd::WAITRESP_1
            }
        };
        self.regs.write(Reg::Arg, arg);
        self.regs.write(Reg::Cmd, flags.encode(index));

        if response == Response::None {
            self.poll(Sta::CMDSENT);
            self.regs.write(Reg::Icr, Sta::CMDSENT.bits());
            return Ok([0; 4]);
        }

        let sta = self.poll(Sta::CMD_DONE);
        self.regs.write(Reg::Icr, Sta::CMD_DONE.bits());
        if sta.contains(Sta::CTIMEOUT) {
            return Err(SdcError::CommandTimeout);
        }
        if response != Response::Short && sta.contains(Sta::CCRCFAIL) {
            return Err(SdcError::CommandCrcFail);
        }

        let mut resp = [0; 4];
        resp[0] = self.regs.read(Reg::Resp1);
        if response == Response::LongCrc {
            resp[1] = self.regs.read(Reg::Resp2);
            resp[2] = self.regs.read(Reg::Resp3);
            resp[3] = self.regs.read(Reg::Resp4);
        }
        Ok(resp)
    }

    /// Spins until any of `any` shows up in the status register.
    fn poll(&self, any: Sta) -> Sta {
        loop {
            let sta = Sta::from_bits_truncate(self.regs.read(Reg::Sta));
            if sta.intersects(any) {
                return sta;
            }
        }
    }

    /// Reads `buf.len() / BLOCK_SIZE` blocks starting at block `startblk`.
    ///
    /// On any failure the controller and DMA channel are left idle and ready
    /// for the next request.
    pub fn read(&self, startblk: u32, buf: &mut [u8]) -> Result<(), SdcError> {
        self.require_running()?;
        let words = dma_word_count(buf).map_err(|e| self.fail(e))?;
        ringbuf_entry!(Trace::Read {
            startblk,
            blocks: (buf.len() / BLOCK_SIZE) as u32,
        });

        let r = self.read_blocks(startblk, buf, words);

        self.dma.disable();
        self.regs.write(Reg::Icr, Sta::CLEAR_ALL);
        self.regs.write(Reg::Mask, 0);
        self.regs.write(Reg::Dctrl, 0);
        r.map_err(|e| self.fail(e))
    }

    fn read_blocks(
        &self,
        startblk: u32,
        buf: &mut [u8],
        words: u16,
    ) -> Result<(), SdcError> {
        self.dma.setup(
            words,
            buf.as_mut_ptr() as usize,
            Ccr::priority(self.config.dma_priority)
                | Ccr::PSIZE_1
                | Ccr::MSIZE_1
                | Ccr::MINC,
        );

        self.regs.write(Reg::Icr, Sta::CLEAR_ALL);
        self.regs.write(Reg::Mask, Sta::DATA_DONE.bits());
        self.regs.write(Reg::Dlen, buf.len() as u32);
        self.regs.write(
            Reg::Dctrl,
            (Dctrl::DTDIR
                | Dctrl::block_size(BLOCK_SIZE_LOG2)
                | Dctrl::DMAEN
                | Dctrl::DTEN)
                .bits(),
        );
        self.dma.enable();

        let r1 = self.command(
            CMD_READ_MULTIPLE_BLOCK,
            startblk,
            Response::ShortCrc,
        )?[0];
        if r1 & R1_ERROR_MASK != 0 {
            return Err(SdcError::CardError(r1));
        }

        // From here on the card is streaming and has to be told to stop,
        // however the transfer ends.
        let data = self.await_data();
        let stop =
            self.command(CMD_STOP_TRANSMISSION, 0, Response::ShortCrc);
        data?;
        stop.map(drop)
    }

    fn await_data(&self) -> Result<(), SdcError> {
        let cs = gate::lock();
        let sta = Sta::from_bits_truncate(self.regs.read(Reg::Sta));
        let sta = if sta.intersects(Sta::DATA_DONE) {
            ringbuf_entry!(Trace::Raced(sta.bits()));
            sta
        } else {
            let msg = self.kernel.suspend_s(
                &cs,
                &self.wait,
                self.config.transfer_timeout,
            );
            ringbuf_entry!(Trace::Woke(msg.0));
            if msg == ReadyMsg::TIMEOUT {
                self.regs.write(Reg::Mask, 0);
                return Err(SdcError::TransferTimeout);
            }
            Sta::from_bits_truncate(self.regs.read(Reg::Sta))
        };
        self.regs.write(Reg::Mask, 0);
        drop(cs);
        data_outcome(sta)
    }

    /// Block writes aren't implemented.
    pub fn write(&self, _startblk: u32, _buf: &[u8]) -> Result<(), SdcError> {
        self.require_running()?;
        Err(self.fail(SdcError::NotSupported))
    }

    /// The SDIO interrupt handler body. Call this from the vector.
    pub fn serve_interrupt(&self) {
        kern::irq::isr(self.kernel, || {
            let cs = gate::lock_from_isr();
            // The status flags stay up until the thread clears them, so
            // leaving the sources enabled would bring us straight back.
            self.regs.write(Reg::Mask, 0);
            if self.wait.is_empty(&cs) {
                return;
            }
            let sta = self.regs.read(Reg::Sta);
            ringbuf_entry!(Trace::Irq(sta));
            let msg = if sta & Sta::DATAEND.bits() != 0 {
                ReadyMsg::OK
            } else {
                ReadyMsg::RESET
            };
            self.kernel.resume_i(&cs, &self.wait, msg);
        });
    }
}

/// Checks that `buf` can be the target of one DMA transfer and returns its
/// length in words.
fn dma_word_count(buf: &[u8]) -> Result<u16, SdcError> {
    if buf.is_empty()
        || buf.len() % BLOCK_SIZE != 0
        || buf.as_ptr() as usize % 4 != 0
    {
        return Err(SdcError::BadBuffer);
    }
    let words = buf.len() / BLOCK_SIZE * WORDS_PER_BLOCK;
    u16::try_from(words).map_err(|_| SdcError::BadBuffer)
}

/// Maps the final data status to an outcome. End of data wins over
/// anything else that got flagged along with it.
fn data_outcome(sta: Sta) -> Result<(), SdcError> {
    if sta.contains(Sta::DATAEND) {
        Ok(())
    } else if sta.contains(Sta::DCRCFAIL) {
        Err(SdcError::DataCrcFail)
    } else if sta.contains(Sta::DTIMEOUT) {
        Err(SdcError::DataTimeout)
    } else if sta.contains(Sta::STBITERR) {
        Err(SdcError::StartBitError)
    } else {
        Err(SdcError::Aborted)
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The card as a read-only `FileStream`.
//!
//! Reads move whole blocks only. The position starts at zero, must sit on a
//! block boundary for a read to make progress, and advances by what was
//! read. A buffer shorter than a block, or the end of the card, reads
//! nothing.

use file_stream::{FileError, FileOffset, FileStream, SequentialStream};

use crate::dma::DmaChannel;
use crate::regs::SdioRegs;
use crate::{SdcDriver, SdcError, BLOCK_SIZE};

/// Blocks moved per driver read, well inside one DMA transfer.
const CHUNK_BLOCKS: usize = 64;

pub struct SdcFile<'d, 'k, R, D> {
    sdc: &'d SdcDriver<'k, R, D>,
    /// Card capacity, in blocks.
    blocks: u32,
    pos: FileOffset,
    open: bool,
    error: Option<FileError>,
}

impl<'d, 'k, R: SdioRegs, D: DmaChannel> SdcFile<'d, 'k, R, D> {
    /// Opens a card of `blocks` blocks. The driver must already be started
    /// and clocked for data.
    pub fn new(sdc: &'d SdcDriver<'k, R, D>, blocks: u32) -> Self {
        Self {
            sdc,
            blocks,
            pos: 0,
            open: true,
            error: None,
        }
    }

    fn size(&self) -> u64 {
        u64::from(self.blocks) * BLOCK_SIZE as u64
    }

    /// What the driver reported for the last `FileError::Device`.
    pub fn device_error(&self) -> Option<SdcError> {
        match self.error {
            Some(FileError::Device) => self.sdc.last_error(),
            _ => None,
        }
    }
}

impl<R: SdioRegs, D: DmaChannel> SequentialStream for SdcFile<'_, '_, R, D> {
    fn write(&mut self, _buf: &[u8]) -> usize {
        self.error = Some(if self.open {
            FileError::Device
        } else {
            FileError::Closed
        });
        0
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        if !self.open {
            self.error = Some(FileError::Closed);
            return 0;
        }
        if self.pos as usize % BLOCK_SIZE != 0 {
            self.error = Some(FileError::OutOfRange);
            return 0;
        }
        let end = self.size().min(u64::from(FileOffset::MAX));
        let left = end.saturating_sub(u64::from(self.pos));
        let len = (buf.len() as u64).min(left) as usize;
        let len = len - len % BLOCK_SIZE;

        let mut done = 0;
        for chunk in buf[..len].chunks_mut(CHUNK_BLOCKS * BLOCK_SIZE) {
            let startblk = self.pos / BLOCK_SIZE as FileOffset;
            if self.sdc.read(startblk, chunk).is_err() {
                self.error = Some(FileError::Device);
                return done;
            }
            self.pos += chunk.len() as FileOffset;
            done += chunk.len();
        }
        self.error = None;
        done
    }
}

impl<R: SdioRegs, D: DmaChannel> FileStream for SdcFile<'_, '_, R, D> {
    fn close(&mut self) -> Result<(), FileError> {
        if !self.open {
            return Err(FileError::Closed);
        }
        self.open = false;
        Ok(())
    }

    fn get_error(&self) -> Result<(), FileError> {
        self.error.map_or(Ok(()), Err)
    }

    /// Fails with `OutOfRange` on cards too big for a `FileOffset`.
    fn get_size(&self) -> Result<FileOffset, FileError> {
        FileOffset::try_from(self.size()).map_err(|_| FileError::OutOfRange)
    }

    fn get_position(&self) -> Result<FileOffset, FileError> {
        Ok(self.pos)
    }

    fn seek(&mut self, offset: FileOffset) -> Result<(), FileError> {
        if !self.open {
            return Err(FileError::Closed);
        }
        if u64::from(offset) > self.size() {
            return Err(FileError::OutOfRange);
        }
        self.pos = offset;
        Ok(())
    }
}

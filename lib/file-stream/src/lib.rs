// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stream capability interfaces.
//!
//! These are the interfaces a block device or file exposes upward. They only
//! define names; implementations live with the things they describe.

#![cfg_attr(not(test), no_std)]

/// Position or size in a file, in bytes.
pub type FileOffset = u32;

/// Why a file operation failed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileError {
    /// The underlying device reported an error.
    Device,
    /// The offset is past the end of the file.
    OutOfRange,
    /// The stream has been closed.
    Closed,
}

/// Something bytes can be written to and read from in order.
pub trait SequentialStream {
    /// Writes as much of `buf` as possible, returning how much was taken.
    fn write(&mut self, buf: &[u8]) -> usize;

    /// Reads into `buf`, returning how many bytes were produced. Fewer than
    /// `buf.len()` means the end of the stream or an error.
    fn read(&mut self, buf: &mut [u8]) -> usize;
}

/// A sequential stream with a position that can be queried and moved.
pub trait FileStream: SequentialStream {
    fn close(&mut self) -> Result<(), FileError>;

    /// Reports the error that ended the last short read or write, if any.
    fn get_error(&self) -> Result<(), FileError>;

    fn get_size(&self) -> Result<FileOffset, FileError>;

    fn get_position(&self) -> Result<FileOffset, FileError>;

    fn seek(&mut self, offset: FileOffset) -> Result<(), FileError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fixed-size in-memory file.
    struct MemFile {
        data: Vec<u8>,
        pos: usize,
        open: bool,
        error: Option<FileError>,
    }

    impl MemFile {
        fn new(size: usize) -> Self {
            Self {
                data: vec![0; size],
                pos: 0,
                open: true,
                error: None,
            }
        }
    }

    impl SequentialStream for MemFile {
        fn write(&mut self, buf: &[u8]) -> usize {
            if !self.open {
                self.error = Some(FileError::Closed);
                return 0;
            }
            let n = buf.len().min(self.data.len() - self.pos);
            self.data[self.pos..self.pos + n].copy_from_slice(&buf[..n]);
            self.pos += n;
            n
        }

        fn read(&mut self, buf: &mut [u8]) -> usize {
            if !self.open {
                self.error = Some(FileError::Closed);
                return 0;
            }
            let n = buf.len().min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            n
        }
    }

    impl FileStream for MemFile {
        fn close(&mut self) -> Result<(), FileError> {
            self.open = false;
            Ok(())
        }

        fn get_error(&self) -> Result<(), FileError> {
            self.error.map_or(Ok(()), Err)
        }

        fn get_size(&self) -> Result<FileOffset, FileError> {
            Ok(self.data.len() as FileOffset)
        }

        fn get_position(&self) -> Result<FileOffset, FileError> {
            Ok(self.pos as FileOffset)
        }

        fn seek(&mut self, offset: FileOffset) -> Result<(), FileError> {
            let offset = offset as usize;
            if offset > self.data.len() {
                return Err(FileError::OutOfRange);
            }
            self.pos = offset;
            Ok(())
        }
    }

    #[test]
    fn streams_through_a_trait_object() {
        let mut file = MemFile::new(8);
        let f: &mut dyn FileStream = &mut file;
        assert_eq!(f.write(b"hello, world"), 8);
        assert_eq!(f.get_position(), Ok(8));
        f.seek(7).unwrap();
        let mut buf = [0; 4];
        assert_eq!(f.read(&mut buf), 1);
        assert_eq!(&buf[..1], b"w");
        assert_eq!(f.seek(9), Err(FileError::OutOfRange));
        assert_eq!(f.get_size(), Ok(8));
    }

    #[test]
    fn closed_file_reports_why_reads_stop() {
        let mut file = MemFile::new(4);
        file.close().unwrap();
        assert_eq!(file.read(&mut [0; 2]), 0);
        assert_eq!(file.get_error(), Err(FileError::Closed));
    }
}

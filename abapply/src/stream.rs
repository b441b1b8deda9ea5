// SPDX-FileCopyrightText: 2026 abapply contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, Read, Write},
};

use crate::{format::extent, protobuf::chromeos_update_engine::Extent, util::ZEROS};

/// Common function for reading a structure from a reader.
pub trait FromReader<R: Read>: Sized {
    type Error;

    fn from_reader(reader: R) -> Result<Self, Self::Error>;
}

/// Positional reads that do not depend on or modify a shared file position.
pub trait ReadAt {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
                Ok(n) => {
                    buf = &mut buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

/// Positional writes that do not depend on or modify a shared file position.
pub trait WriteAt {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    fn write_all_at(&self, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write_at(buf, offset) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => {
                    buf = &buf[n..];
                    offset += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }
}

impl ReadAt for File {
    /// Read data from offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_read(self, buf, offset)
    }

    /// Read data from offset. The kernel's file position will *not* be changed.
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::read_at(self, buf, offset)
    }
}

impl WriteAt for File {
    /// Write data to offset. The kernel's file position *will* be changed.
    #[cfg(windows)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        FileExt::seek_write(self, buf, offset)
    }

    /// Write data to offset. The kernel's file position will *not* be changed.
    #[cfg(unix)]
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        FileExt::write_at(self, buf, offset)
    }
}

impl<T: ?Sized + ReadAt> ReadAt for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

impl<T: ?Sized + WriteAt> WriteAt for &T {
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        (**self).write_at(buf, offset)
    }
}

fn extent_error(e: extent::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

/// A writer that scatters a byte stream across a list of extents. Sparse hole
/// extents consume their share of the stream without touching the target.
pub struct ExtentWriter<'a, W> {
    inner: W,
    extents: &'a [Extent],
    block_size: u32,
    /// Index of the extent currently being written.
    index: usize,
    /// Bytes written to the current extent.
    extent_written: u64,
    /// Total bytes written across all extents.
    written: u64,
}

impl<'a, W: WriteAt> ExtentWriter<'a, W> {
    pub fn new(inner: W, extents: &'a [Extent], block_size: u32) -> Self {
        Self {
            inner,
            extents,
            block_size,
            index: 0,
            extent_written: 0,
            written: 0,
        }
    }

    /// Zero-fill the remainder of the final partially written block and
    /// return the number of bytes of input that were written.
    pub fn finish(mut self) -> io::Result<u64> {
        let written = self.written;
        let remainder = written % u64::from(self.block_size);

        if remainder != 0 {
            let mut padding = u64::from(self.block_size) - remainder;

            while padding > 0 {
                let n = padding.min(ZEROS.len() as u64) as usize;
                self.write_all(&ZEROS[..n])?;
                padding -= n as u64;
            }
        }

        Ok(written)
    }
}

impl<W: WriteAt> Write for ExtentWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            let Some(extent) = self.extents.get(self.index) else {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "Data exceeds destination extents",
                ));
            };

            let (offset, length) =
                extent::byte_range(self.index, extent, self.block_size).map_err(extent_error)?;

            if self.extent_written == length {
                self.index += 1;
                self.extent_written = 0;
                continue;
            }

            let n = (length - self.extent_written).min(buf.len() as u64) as usize;

            if let Some(offset) = offset {
                self.inner
                    .write_all_at(&buf[..n], offset + self.extent_written)?;
            }

            self.extent_written += n as u64;
            self.written += n as u64;

            return Ok(n);
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Read the contents of `extents` into memory. Sparse holes read as zeros.
pub fn read_extents(reader: impl ReadAt, extents: &[Extent], block_size: u32) -> io::Result<Vec<u8>> {
    let total = extent::total_blocks(extents)
        .and_then(|b| b.checked_mul(block_size.into()))
        .and_then(|b| usize::try_from(b).ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Extents too large"))?;

    let mut buf = vec![0u8; total];
    let mut pos = 0;

    for (index, extent) in extents.iter().enumerate() {
        let (offset, length) = extent::byte_range(index, extent, block_size).map_err(extent_error)?;
        let length = length as usize;

        if let Some(offset) = offset {
            reader.read_exact_at(&mut buf[pos..pos + length], offset)?;
        }

        pos += length;
    }

    Ok(buf)
}

/// Zero-fill `[offset, offset + length)`.
pub fn write_zeros_at(writer: impl WriteAt, mut offset: u64, mut length: u64) -> io::Result<()> {
    while length > 0 {
        let n = length.min(ZEROS.len() as u64) as usize;
        writer.write_all_at(&ZEROS[..n], offset)?;
        offset += n as u64;
        length -= n as u64;
    }

    Ok(())
}

use std::borrow::Borrow;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::fs::FileExt;

/// A `Read` adapter over a byte range of a file, using positional reads.
///
/// Reading never moves the file position, so several readers can share one
/// file descriptor, across threads when `F` is an `Arc<File>`.
#[derive(Debug)]
pub(crate) struct ReadAtReader<F> {
    file: F,
    offset: u64,
    end: u64,
}

impl<F: Borrow<File>> ReadAtReader<F> {
    /// Read the whole file, starting at offset 0.
    pub(crate) fn new(file: F) -> Self {
        Self {
            file,
            offset: 0,
            end: u64::MAX,
        }
    }

    /// Read `len` bytes starting at `offset`.
    pub(crate) fn with_range(file: F, offset: u64, len: u64) -> Self {
        Self {
            file,
            offset,
            end: offset.saturating_add(len),
        }
    }
}

impl<F: Borrow<File>> Read for ReadAtReader<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.end - self.offset;
        if left == 0 {
            return Ok(0);
        }
        let want = buf.len().min(usize::try_from(left).unwrap_or(usize::MAX));
        let n = self.file.borrow().read_at(&mut buf[..want], self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }
}

/// A `Write` adapter that writes at an explicit offset with pwrite.
#[derive(Debug)]
pub(crate) struct WriteAtWriter<'a> {
    file: &'a File,
    offset: u64,
}

impl<'a> WriteAtWriter<'a> {
    pub(crate) fn new(file: &'a File, offset: u64) -> Self {
        Self { file, offset }
    }
}

impl Write for WriteAtWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write_at(buf, self.offset)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

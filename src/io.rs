//! Positional page I/O
//!
//! The doublewrite protocol depends on explicit write-then-fsync ordering,
//! so data files are accessed through positional reads and writes rather
//! than a shared memory map. The `PageIo` trait is the seam the rest of
//! the crate goes through; `FileIo` is the standard file-backed
//! implementation.

use crate::error::{Error, PageNo, Result};
use crate::page::PAGE_SIZE;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Positional page I/O backend
pub trait PageIo: Send + Sync {
    /// Read `buf.len()` bytes starting at the given page
    fn read_pages(&self, first: PageNo, buf: &mut [u8]) -> Result<()>;

    /// Write `bytes` starting at the given page
    fn write_pages(&self, first: PageNo, bytes: &[u8]) -> Result<()>;

    /// Flush all written data to stable storage
    fn sync(&self) -> Result<()>;

    /// Current size in whole pages
    fn size_in_pages(&self) -> u64;

    /// Grow the file to hold at least `new_pages` pages
    fn grow(&self, new_pages: u64) -> Result<()>;
}

/// File-backed page I/O
pub struct FileIo {
    file: File,
    /// Current file size in bytes
    size: AtomicU64,
}

impl FileIo {
    /// Open or create a data file, rounding its size down to whole pages
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_ref())?;

        let len = file.metadata()?.len();
        let size = (len / PAGE_SIZE as u64) * PAGE_SIZE as u64;
        if size != len {
            // A trailing partial page can only come from a crashed grow;
            // it holds no committed data.
            file.set_len(size)?;
        }

        Ok(Self { file, size: AtomicU64::new(size) })
    }

    fn check_bounds(&self, first: PageNo, len: usize) -> Result<()> {
        let offset = first.0 as u64 * PAGE_SIZE as u64;
        let end = offset + len as u64;
        if len % PAGE_SIZE != 0 {
            return Err(Error::InvalidParameter("I/O length must be a multiple of PAGE_SIZE"));
        }
        if end > self.size.load(Ordering::Acquire) {
            return Err(Error::Io(format!(
                "access of {} bytes at page {} is past end of file",
                len, first
            )));
        }
        Ok(())
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_at(file: &File, bytes: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(bytes, offset)
}

#[cfg(windows)]
fn read_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_at(file: &File, mut bytes: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !bytes.is_empty() {
        let n = file.seek_write(bytes, offset)?;
        bytes = &bytes[n..];
        offset += n as u64;
    }
    Ok(())
}

impl PageIo for FileIo {
    fn read_pages(&self, first: PageNo, buf: &mut [u8]) -> Result<()> {
        self.check_bounds(first, buf.len())?;
        read_at(&self.file, buf, first.0 as u64 * PAGE_SIZE as u64)?;
        Ok(())
    }

    fn write_pages(&self, first: PageNo, bytes: &[u8]) -> Result<()> {
        self.check_bounds(first, bytes.len())?;
        write_at(&self.file, bytes, first.0 as u64 * PAGE_SIZE as u64)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn size_in_pages(&self) -> u64 {
        self.size.load(Ordering::Acquire) / PAGE_SIZE as u64
    }

    fn grow(&self, new_pages: u64) -> Result<()> {
        let new_size = new_pages * PAGE_SIZE as u64;
        let current = self.size.load(Ordering::Acquire);
        if new_size <= current {
            return Ok(());
        }
        self.file.set_len(new_size)?;
        self.size.store(new_size, Ordering::Release);
        Ok(())
    }
}

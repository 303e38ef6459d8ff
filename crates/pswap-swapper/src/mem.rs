//! In-memory filesystem adapter for tests and benchmarks.
//!
//! `MemFs` keeps whole files in memory while preserving the semantics the
//! swapper depends on: short reads at end-of-file, file growth on write,
//! per-file exclusive locking tied to channel lifetime, and real scatter /
//! gather behavior on the vectored calls. The reported block size is
//! configurable so direct-I/O validation can be exercised without a disk.

use std::collections::HashMap;
use std::io::{self, IoSlice, IoSliceMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use pswap_error::{Result, SwapError};
use pswap_types::ByteOffset;

use crate::fs::{ChannelOptions, SwapChannel, SwapFs};

const DEFAULT_BLOCK_SIZE: u64 = 512;

#[derive(Debug, Default)]
struct MemFile {
    bytes: Mutex<Vec<u8>>,
    locked: AtomicBool,
}

/// In-memory [`SwapFs`].
#[derive(Debug)]
pub struct MemFs {
    files: Mutex<HashMap<PathBuf, Arc<MemFile>>>,
    block_size: u64,
}

impl MemFs {
    #[must_use]
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    /// A filesystem that reports the given block size.
    #[must_use]
    pub fn with_block_size(block_size: u64) -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            block_size,
        }
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl SwapFs for MemFs {
    type Channel = MemChannel;

    fn open(&self, path: &Path, _options: ChannelOptions) -> Result<MemChannel> {
        let file = Arc::clone(
            self.files
                .lock()
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(MemFile::default())),
        );
        Ok(MemChannel {
            path: path.to_path_buf(),
            file,
            open: AtomicBool::new(true),
            holds_lock: AtomicBool::new(false),
        })
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        match self.files.lock().remove(path) {
            Some(_) => Ok(()),
            None => Err(SwapError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such in-memory file: '{}'", path.display()),
            ))),
        }
    }

    fn block_size(&self, _path: &Path) -> Result<u64> {
        Ok(self.block_size)
    }
}

/// One handle to an in-memory file.
#[derive(Debug)]
pub struct MemChannel {
    path: PathBuf,
    file: Arc<MemFile>,
    open: AtomicBool,
    holds_lock: AtomicBool,
}

impl MemChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(SwapError::ClosedChannel {
                path: self.path.clone(),
                source: None,
            })
        }
    }
}

fn offset_to_index(offset: ByteOffset) -> Result<usize> {
    usize::try_from(offset.0).map_err(|_| {
        SwapError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("offset {offset} does not fit in memory"),
        ))
    })
}

impl SwapChannel for MemChannel {
    fn read_at(&self, buf: &mut [u8], offset: ByteOffset) -> Result<usize> {
        self.ensure_open()?;
        let start = offset_to_index(offset)?;
        let bytes = self.file.bytes.lock();
        if start >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }

    fn write_all_at(&self, buf: &[u8], offset: ByteOffset) -> Result<()> {
        self.ensure_open()?;
        let start = offset_to_index(offset)?;
        let end = start.checked_add(buf.len()).ok_or_else(|| {
            SwapError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write range overflow",
            ))
        })?;
        let mut bytes = self.file.bytes.lock();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn read_vectored_at(&self, bufs: &mut [IoSliceMut<'_>], offset: ByteOffset) -> Result<usize> {
        self.ensure_open()?;
        let start = offset_to_index(offset)?;
        let bytes = self.file.bytes.lock();
        let mut total = 0;
        for buf in bufs.iter_mut() {
            let position = start + total;
            if position >= bytes.len() {
                break;
            }
            let n = buf.len().min(bytes.len() - position);
            buf[..n].copy_from_slice(&bytes[position..position + n]);
            total += n;
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], offset: ByteOffset) -> Result<usize> {
        self.ensure_open()?;
        let start = offset_to_index(offset)?;
        let total: usize = bufs.iter().map(|buf| buf.len()).sum();
        let end = start.checked_add(total).ok_or_else(|| {
            SwapError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write range overflow",
            ))
        })?;
        let mut bytes = self.file.bytes.lock();
        if end > bytes.len() {
            bytes.resize(end, 0);
        }
        let mut position = start;
        for buf in bufs {
            bytes[position..position + buf.len()].copy_from_slice(buf);
            position += buf.len();
        }
        Ok(total)
    }

    fn supports_positioned_vectors(&self) -> bool {
        true
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.ensure_open()?;
        let size = usize::try_from(size).map_err(|_| {
            SwapError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "truncate size does not fit in memory",
            ))
        })?;
        self.file.bytes.lock().resize(size, 0);
        Ok(())
    }

    fn force(&self, _metadata: bool) -> Result<()> {
        self.ensure_open()
    }

    fn try_lock_exclusive(&self) -> Result<()> {
        self.ensure_open()?;
        if self
            .file
            .locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.holds_lock.store(true, Ordering::Release);
            Ok(())
        } else {
            Err(SwapError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                "file is locked through another channel",
            )))
        }
    }

    fn size(&self) -> Result<u64> {
        self.ensure_open()?;
        Ok(self.file.bytes.lock().len() as u64)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) && self.holds_lock.swap(false, Ordering::AcqRel)
        {
            self.file.locked.store(false, Ordering::Release);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_on_write_and_short_reads_at_eof() {
        let fs = MemFs::new();
        let ch = fs.write(Path::new("a.swp")).unwrap();
        ch.write_all_at(&[7_u8; 100], ByteOffset(50)).unwrap();
        assert_eq!(ch.size().unwrap(), 150);

        let mut buf = [0xAA_u8; 120];
        assert_eq!(ch.read_at(&mut buf, ByteOffset(100)).unwrap(), 50);
        assert_eq!(&buf[..50], &[7_u8; 50]);
    }

    #[test]
    fn vectored_read_stops_at_eof() {
        let fs = MemFs::new();
        let ch = fs.write(Path::new("a.swp")).unwrap();
        ch.write_all_at(&[3_u8; 12], ByteOffset(0)).unwrap();

        let mut a = [0_u8; 8];
        let mut b = [0xFF_u8; 8];
        let mut bufs = [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)];
        assert_eq!(ch.read_vectored_at(&mut bufs, ByteOffset(0)).unwrap(), 12);
        assert_eq!(a, [3_u8; 8]);
        assert_eq!(&b[..4], &[3_u8; 4]);
        // Bytes past end-of-file are left untouched by the channel.
        assert_eq!(&b[4..], &[0xFF_u8; 4]);
    }

    #[test]
    fn lock_is_released_on_close() {
        let fs = MemFs::new();
        let first = fs.write(Path::new("a.swp")).unwrap();
        let second = fs.write(Path::new("a.swp")).unwrap();

        first.try_lock_exclusive().unwrap();
        assert!(second.try_lock_exclusive().is_err());
        first.close().unwrap();
        second.try_lock_exclusive().unwrap();
    }

    #[test]
    fn closed_channel_refuses_everything() {
        let fs = MemFs::new();
        let ch = fs.write(Path::new("a.swp")).unwrap();
        ch.close().unwrap();
        assert!(!ch.is_open());
        assert!(ch.size().unwrap_err().is_closed_channel());
        assert!(ch.force(false).unwrap_err().is_closed_channel());
        let mut buf = [0_u8; 4];
        assert!(ch
            .read_at(&mut buf, ByteOffset::ZERO)
            .unwrap_err()
            .is_closed_channel());
    }

    #[test]
    fn delete_file_removes_the_backing_bytes() {
        let fs = MemFs::new();
        let ch = fs.write(Path::new("a.swp")).unwrap();
        ch.write_all_at(&[1_u8; 4], ByteOffset::ZERO).unwrap();
        fs.delete_file(Path::new("a.swp")).unwrap();
        assert!(fs.delete_file(Path::new("a.swp")).is_err());
    }
}

//! Filesystem adapter: the capability set the swapper consumes, plus the
//! standard OS-file implementation.
//!
//! The swapper never opens files itself. It goes through [`SwapFs`] so that
//! tests can substitute fault-injecting or in-memory filesystems, and so the
//! reopen protocol has a single place to obtain fresh channels from.
//!
//! All channel operations are positioned: they take an explicit offset and
//! never touch an externally visible cursor, which is what makes them safe
//! to issue concurrently from any number of threads over one handle.

use std::fs::{File, OpenOptions};
use std::io::{self, IoSlice, IoSliceMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use pswap_error::{Result, SwapError};
use pswap_types::ByteOffset;
use tracing::trace;

/// Options for opening a swap channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Bypass the OS page cache (`O_DIRECT`). Linux only; the swapper
    /// validates block-size alignment before requesting this.
    pub direct_io: bool,
}

/// Capability set for creating and removing swap files.
pub trait SwapFs: Send + Sync {
    type Channel: SwapChannel;

    /// Open `path` read-write with explicit options, creating it if missing.
    fn open(&self, path: &Path, options: ChannelOptions) -> Result<Self::Channel>;

    /// Plain read-write open with create-if-missing.
    fn write(&self, path: &Path) -> Result<Self::Channel> {
        self.open(path, ChannelOptions::default())
    }

    /// Remove the file at `path`.
    fn delete_file(&self, path: &Path) -> Result<()>;

    /// Preferred I/O block size of the filesystem holding `path`.
    fn block_size(&self, path: &Path) -> Result<u64>;
}

/// One handle to a swap file.
pub trait SwapChannel: Send + Sync {
    /// Positioned read into `buf`. Short reads are allowed; `Ok(0)` means
    /// end-of-file.
    fn read_at(&self, buf: &mut [u8], offset: ByteOffset) -> Result<usize>;

    /// Positioned write of the whole buffer; returns only once every byte
    /// has been handed to the file, or fails.
    fn write_all_at(&self, buf: &[u8], offset: ByteOffset) -> Result<()>;

    /// Positioned scatter read into `bufs`. `Ok(0)` means end-of-file.
    fn read_vectored_at(&self, bufs: &mut [IoSliceMut<'_>], offset: ByteOffset) -> Result<usize>;

    /// Positioned gather write from `bufs`.
    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], offset: ByteOffset) -> Result<usize>;

    /// Whether the vectored forms are backed by real scatter/gather
    /// syscalls. When false (or when a vectored call reports
    /// `Unsupported`), the swapper degrades to per-page scalar I/O.
    fn supports_positioned_vectors(&self) -> bool {
        false
    }

    fn truncate(&self, size: u64) -> Result<()>;

    /// Flush file content (and metadata, when `metadata` is set) to stable
    /// storage.
    fn force(&self, metadata: bool) -> Result<()>;

    /// Try to take the advisory exclusive lock for this file. Contention
    /// surfaces as `Io` with [`io::ErrorKind::WouldBlock`].
    fn try_lock_exclusive(&self) -> Result<()>;

    /// Current file length in bytes.
    fn size(&self) -> Result<u64>;

    fn is_open(&self) -> bool;

    /// Close the handle. Subsequent operations report
    /// [`SwapError::ClosedChannel`]; closing also releases any lock held
    /// through this handle.
    fn close(&self) -> Result<()>;
}

impl<F: SwapFs + ?Sized> SwapFs for Arc<F> {
    type Channel = F::Channel;

    fn open(&self, path: &Path, options: ChannelOptions) -> Result<Self::Channel> {
        (**self).open(path, options)
    }

    fn write(&self, path: &Path) -> Result<Self::Channel> {
        (**self).write(path)
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        (**self).delete_file(path)
    }

    fn block_size(&self, path: &Path) -> Result<u64> {
        (**self).block_size(path)
    }
}

// ── Standard OS filesystem ─────────────────────────────────────────────────

/// Standard-library filesystem adapter.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

impl SwapFs for StdFs {
    type Channel = FileChannel;

    fn open(&self, path: &Path, options: ChannelOptions) -> Result<FileChannel> {
        let mut open_options = OpenOptions::new();
        open_options.read(true).write(true).create(true);
        if options.direct_io {
            #[cfg(target_os = "linux")]
            {
                use std::os::unix::fs::OpenOptionsExt;
                open_options.custom_flags(libc::O_DIRECT);
            }
            #[cfg(not(target_os = "linux"))]
            return Err(SwapError::Config(
                "direct I/O support is available only on Linux".to_owned(),
            ));
        }
        let file = open_options.open(path)?;
        trace!(
            target: "pswap::fs",
            event = "channel_opened",
            path = %path.display(),
            direct_io = options.direct_io
        );
        Ok(FileChannel {
            path: path.to_path_buf(),
            file: RwLock::new(Some(Arc::new(file))),
        })
    }

    fn delete_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)?;
        Ok(())
    }

    #[cfg(unix)]
    fn block_size(&self, path: &Path) -> Result<u64> {
        use std::os::unix::fs::MetadataExt;
        Ok(std::fs::metadata(path)?.blksize())
    }

    #[cfg(not(unix))]
    fn block_size(&self, _path: &Path) -> Result<u64> {
        Err(SwapError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "block size queries are not supported on this platform",
        )))
    }
}

/// OS-file channel using `pread`/`pwrite` style positioned I/O.
///
/// `close` takes the file out of the slot, so in-flight operations finish
/// the syscall they already issued while every later operation reports a
/// closed channel. Dropping the last reference closes the descriptor, which
/// also releases any advisory lock taken through it.
#[derive(Debug)]
pub struct FileChannel {
    path: PathBuf,
    file: RwLock<Option<Arc<File>>>,
}

impl FileChannel {
    fn file(&self) -> Result<Arc<File>> {
        self.file.read().clone().ok_or_else(|| self.closed_error())
    }

    fn closed_error(&self) -> SwapError {
        SwapError::ClosedChannel {
            path: self.path.clone(),
            source: None,
        }
    }
}

#[cfg(unix)]
fn positioned_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(unix)]
fn positioned_write_all(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn positioned_read(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

#[cfg(windows)]
fn positioned_write_all(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                offset += n as u64;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn positioned_read_vectored(
    file: &File,
    bufs: &mut [IoSliceMut<'_>],
    offset: u64,
) -> Result<usize> {
    loop {
        match rustix::io::preadv(file, bufs, offset) {
            Ok(n) => return Ok(n),
            Err(errno) if errno == rustix::io::Errno::INTR => continue,
            Err(errno) => return Err(SwapError::Io(io::Error::from(errno))),
        }
    }
}

#[cfg(target_os = "linux")]
fn positioned_write_vectored(file: &File, bufs: &[IoSlice<'_>], offset: u64) -> Result<usize> {
    loop {
        match rustix::io::pwritev(file, bufs, offset) {
            Ok(n) => return Ok(n),
            Err(errno) if errno == rustix::io::Errno::INTR => continue,
            Err(errno) => return Err(SwapError::Io(io::Error::from(errno))),
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn positioned_read_vectored(
    _file: &File,
    _bufs: &mut [IoSliceMut<'_>],
    _offset: u64,
) -> Result<usize> {
    Err(SwapError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "positioned vectored I/O is not available on this platform",
    )))
}

#[cfg(not(target_os = "linux"))]
fn positioned_write_vectored(_file: &File, _bufs: &[IoSlice<'_>], _offset: u64) -> Result<usize> {
    Err(SwapError::Io(io::Error::new(
        io::ErrorKind::Unsupported,
        "positioned vectored I/O is not available on this platform",
    )))
}

impl SwapChannel for FileChannel {
    fn read_at(&self, buf: &mut [u8], offset: ByteOffset) -> Result<usize> {
        let file = self.file()?;
        loop {
            match positioned_read(&file, buf, offset.0) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn write_all_at(&self, buf: &[u8], offset: ByteOffset) -> Result<()> {
        let file = self.file()?;
        positioned_write_all(&file, buf, offset.0)?;
        Ok(())
    }

    fn read_vectored_at(&self, bufs: &mut [IoSliceMut<'_>], offset: ByteOffset) -> Result<usize> {
        let file = self.file()?;
        positioned_read_vectored(&file, bufs, offset.0)
    }

    fn write_vectored_at(&self, bufs: &[IoSlice<'_>], offset: ByteOffset) -> Result<usize> {
        let file = self.file()?;
        positioned_write_vectored(&file, bufs, offset.0)
    }

    fn supports_positioned_vectors(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn truncate(&self, size: u64) -> Result<()> {
        self.file()?.set_len(size)?;
        Ok(())
    }

    fn force(&self, metadata: bool) -> Result<()> {
        let file = self.file()?;
        if metadata {
            file.sync_all()?;
        } else {
            file.sync_data()?;
        }
        Ok(())
    }

    fn try_lock_exclusive(&self) -> Result<()> {
        let file = self.file()?;
        fs2::FileExt::try_lock_exclusive(&*file)?;
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        Ok(self.file()?.metadata()?.len())
    }

    fn is_open(&self) -> bool {
        self.file.read().is_some()
    }

    fn close(&self) -> Result<()> {
        if self.file.write().take().is_some() {
            trace!(
                target: "pswap::fs",
                event = "channel_closed",
                path = %self.path.display()
            );
        }
        Ok(())
    }
}

#![forbid(unsafe_code)]
//! Single-file page swapper: the lowest layer of a paged buffer pool.
//!
//! The swapper translates fixed-size page reads and writes into positioned
//! I/O against one backing file. It additionally tracks the logical file
//! size precisely, so size queries never call into the filesystem on the
//! hot path.
//!
//! # Design
//!
//! - **Channel striping.** A swapper holds K independent channels to the
//!   same file (K a power of two). A page id selects its stripe with plain
//!   arithmetic; no locks sit on the I/O path. POSIX positioned I/O is
//!   atomic per call, so K defaults to 1 there; Windows file handles
//!   serialize on an internal position lock, so one channel per core is
//!   opened instead.
//! - **File-size register.** A 64-bit atomic raised monotonically via CAS
//!   before each write is issued. Readers may observe a stale lower bound;
//!   that is safe because positioned reads tolerate end-of-file by
//!   zero-filling.
//! - **Reopen protocol.** Thread interruption may close a channel
//!   underneath in-flight I/O. The swapper reopens the stripe inside a
//!   per-swapper critical section and retries the operation up to
//!   [`MAX_REOPEN_ATTEMPTS`] times, reasserting the caller's interrupt
//!   status afterwards. An explicitly closed swapper refuses to reopen.
//! - **Vectored fast path.** A contiguous run of pages moves through one
//!   positioned scatter/gather call per iteration where the platform has
//!   one; the offset-parameterized syscalls make the batch atomic with
//!   respect to the file offset without a cursor lock. Everything else
//!   degrades to the scalar engine, byte-for-byte identically.
//!
//! # Zero-fill
//!
//! Upper layers treat the page array as a contiguous sparse file. Bytes a
//! short or past-end-of-file read did not cover are deterministically
//! zeroed so checksum and format parsers always observe defined content.

pub mod fs;
pub mod interrupt;
pub mod mem;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, IoSlice, IoSliceMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::fs::{ChannelOptions, SwapChannel, SwapFs};

pub use crate::fs::{FileChannel, StdFs};
pub use crate::mem::{MemChannel, MemFs};
pub use pswap_error::{Result, SwapError};
pub use pswap_types::{ByteOffset, PageId, PageSize, ParseError};

/// How many times a channel closed by thread interruption is reopened
/// before an operation fails with [`SwapError::Interrupted`].
pub const MAX_REOPEN_ATTEMPTS: u32 = 42;

/// Default number of low page-id bits consumed before striping: 16
/// consecutive pages hit the same stripe.
pub const DEFAULT_STRIPE_SHIFT: u32 = 4;

/// Upper bound on the stripe count (open channels) per swapper.
pub const MAX_STRIPE_COUNT: u32 = 64;

/// Stripe 0 holds the exclusive file lock and services `force`/`truncate`.
const TOKEN_STRIPE: usize = 0;
const TOKEN_PAGE: PageId = PageId(0);

/// Callback invoked when the enclosing cache evicts a page bound to this
/// swapper.
pub type EvictionCallback = Arc<dyn Fn(PageId) + Send + Sync>;

/// Construction-time configuration for a [`SingleFileSwapper`].
///
/// Resolved once at construction; the hot paths never consult process
/// globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapperConfig {
    /// Exponent of two of how many channels are opened per file.
    pub channel_stripe_power: u32,
    /// Exponent of two of how many consecutive pages go to the same
    /// stripe.
    pub channel_stripe_shift: u32,
    /// Force a single channel regardless of `channel_stripe_power`.
    pub no_channel_striping: bool,
    /// Bypass the OS page cache (`O_DIRECT`). Requires Linux and a page
    /// size that is a multiple of the filesystem block size.
    pub use_direct_io: bool,
}

impl Default for SwapperConfig {
    fn default() -> Self {
        Self {
            channel_stripe_power: default_channel_stripe_power(),
            channel_stripe_shift: DEFAULT_STRIPE_SHIFT,
            no_channel_striping: false,
            use_direct_io: false,
        }
    }
}

impl SwapperConfig {
    fn validate(self) -> Result<Self> {
        if self.channel_stripe_power > MAX_STRIPE_COUNT.ilog2() {
            return Err(SwapError::Config(format!(
                "channel_stripe_power={} exceeds the {MAX_STRIPE_COUNT}-stripe cap",
                self.channel_stripe_power
            )));
        }
        if self.channel_stripe_shift >= u64::BITS {
            return Err(SwapError::Config(format!(
                "channel_stripe_shift={} must be below 64",
                self.channel_stripe_shift
            )));
        }
        Ok(self)
    }

    fn stripe_count(self) -> u32 {
        if self.no_channel_striping {
            1
        } else {
            1 << self.channel_stripe_power
        }
    }
}

/// Platform default for the stripe exponent.
fn default_channel_stripe_power() -> u32 {
    if !cfg!(windows) {
        return 0;
    }
    let cores = std::thread::available_parallelism().map_or(1, usize::from);
    // Smallest exponent whose stripe count accommodates all cores.
    cores
        .next_power_of_two()
        .trailing_zeros()
        .clamp(1, MAX_STRIPE_COUNT.ilog2())
}

/// Page-granular positioned I/O against a single backing file.
///
/// Every method is callable concurrently from any number of threads; the
/// swapper has no internal worker pool.
pub trait PageSwapper: Send + Sync {
    /// Read one page into `buf`, zero-filling whatever a short or
    /// past-end-of-file read did not cover. Returns the bytes actually
    /// read (0 when the page lies entirely past end-of-file).
    fn read(&self, page: PageId, buf: &mut [u8]) -> Result<usize>;

    /// Read a contiguous run of pages starting at `start`, one buffer per
    /// page. Semantically identical to per-page [`PageSwapper::read`]
    /// calls, including zero-fill. Returns the total bytes read.
    fn read_vectored(&self, start: PageId, bufs: &mut [&mut [u8]]) -> Result<usize>;

    /// Write one page. The file-size register is raised before the bytes
    /// are issued, so a concurrent size observer cannot miss the region.
    /// Returns the page size.
    fn write(&self, page: PageId, buf: &[u8]) -> Result<usize>;

    /// Write a contiguous run of pages starting at `start`. Returns
    /// `page size × bufs.len()`.
    fn write_vectored(&self, start: PageId, bufs: &[&[u8]]) -> Result<usize>;

    /// Notify the swapper that the cache evicted `page`.
    fn evicted(&self, page: PageId);

    /// Path of the backing file.
    fn file(&self) -> &Path;

    /// Flush written pages to stable storage via the token stripe.
    fn force(&self) -> Result<()>;

    /// Largest valid page id, or `None` while the file is empty. A partial
    /// tail page counts as a valid page.
    fn last_page_id(&self) -> Option<PageId>;

    /// Discard all pages: reset the size register, then truncate the file.
    fn truncate(&self) -> Result<()>;

    /// Close every channel stripe and drop the eviction callback. Pages
    /// may stay bound to this swapper in the cache afterwards; observation
    /// remains safe, I/O is refused.
    fn close(&self) -> Result<()>;

    /// Close, then remove the backing file.
    fn close_and_delete(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct SwapperState {
    closed: bool,
}

/// A [`PageSwapper`] that directs all page swapping to a single file.
pub struct SingleFileSwapper<F: SwapFs> {
    fs: F,
    path: PathBuf,
    page_size: PageSize,
    channel_options: ChannelOptions,
    stripes: Vec<RwLock<Arc<F::Channel>>>,
    stripe_shift: u32,
    stripe_mask: u64,
    has_fast_path: bool,
    file_size: AtomicU64,
    on_evict: Mutex<Option<EvictionCallback>>,
    /// Serializes stripe replacement with explicit close. See
    /// [`Self::try_reopen`].
    state: Mutex<SwapperState>,
}

impl<F: SwapFs> SingleFileSwapper<F> {
    /// Open a swapper over `path`, creating the file if it does not exist.
    ///
    /// The logical file size is primed from the token stripe, and the
    /// exclusive region lock is taken on it (except on Windows, where
    /// locking would defeat striping and a higher-level lock file is
    /// presumed). On lock failure the already-opened channels are closed
    /// before the error is returned.
    pub fn open(
        fs: F,
        path: impl Into<PathBuf>,
        page_size: PageSize,
        config: SwapperConfig,
        on_evict: Option<EvictionCallback>,
    ) -> Result<Self> {
        let path = path.into();
        let config = config.validate()?;
        if config.use_direct_io {
            validate_direct_io(&fs, &path, page_size)?;
        }

        let channel_options = ChannelOptions {
            direct_io: config.use_direct_io,
        };
        let stripe_count = config.stripe_count();
        let mut stripes = Vec::with_capacity(stripe_count as usize);
        for _ in 0..stripe_count {
            stripes.push(RwLock::new(Arc::new(fs.open(&path, channel_options)?)));
        }
        let has_fast_path = stripes[TOKEN_STRIPE].read().supports_positioned_vectors();

        let swapper = Self {
            fs,
            path,
            page_size,
            channel_options,
            stripes,
            stripe_shift: config.channel_stripe_shift,
            stripe_mask: u64::from(stripe_count - 1),
            has_fast_path,
            file_size: AtomicU64::new(0),
            on_evict: Mutex::new(on_evict),
            state: Mutex::new(SwapperState::default()),
        };

        let initial_size = swapper.token_channel().size()?;
        swapper.increase_file_size_to(initial_size);

        if let Err(lock_error) = swapper.acquire_lock() {
            if let Err(close_error) = swapper.close_all_stripes() {
                warn!(
                    target: "pswap::swapper",
                    event = "close_after_lock_failure",
                    path = %swapper.path.display(),
                    error = %close_error
                );
            }
            return Err(lock_error);
        }

        debug!(
            target: "pswap::swapper",
            event = "swapper_opened",
            path = %swapper.path.display(),
            page_size = page_size.get(),
            stripes = stripe_count,
            fast_path = has_fast_path
        );
        Ok(swapper)
    }

    /// Read one page into `buf`; see [`PageSwapper::read`].
    pub fn read(&self, page: PageId, buf: &mut [u8]) -> Result<usize> {
        let offset = self.page_offset(page)?;
        self.check_buffer_len(buf.len())?;
        let page_bytes = self.page_bytes();
        self.retrying(page, |channel| {
            if offset < self.current_file_size() {
                self.swap_in(channel, buf, offset)
            } else {
                buf[..page_bytes].fill(0);
                Ok(0)
            }
        })
    }

    /// Write one page from `buf`; see [`PageSwapper::write`].
    pub fn write(&self, page: PageId, buf: &[u8]) -> Result<usize> {
        let offset = self.page_offset(page)?;
        self.check_buffer_len(buf.len())?;
        let end = offset
            .checked_add(self.page_bytes() as u64)
            .ok_or_else(|| offset_overflow(page))?;
        self.increase_file_size_to(end);
        self.retrying(page, |channel| self.swap_out(channel, buf, offset))
    }

    /// Read a contiguous run of pages; see [`PageSwapper::read_vectored`].
    pub fn read_vectored(&self, start: PageId, bufs: &mut [&mut [u8]]) -> Result<usize> {
        if bufs.is_empty() {
            return Ok(0);
        }
        for buf in bufs.iter() {
            self.check_buffer_len(buf.len())?;
        }
        if self.has_fast_path {
            match self.read_vectored_fast(start, bufs) {
                Err(SwapError::Io(error)) if error.kind() == io::ErrorKind::Unsupported => {
                    trace!(
                        target: "pswap::swapper",
                        event = "vectored_fallback",
                        op = "read",
                        error = %error
                    );
                }
                result => return result,
            }
        }
        self.read_vectored_fallback(start, bufs)
    }

    /// Write a contiguous run of pages; see [`PageSwapper::write_vectored`].
    pub fn write_vectored(&self, start: PageId, bufs: &[&[u8]]) -> Result<usize> {
        if bufs.is_empty() {
            return Ok(0);
        }
        for buf in bufs {
            self.check_buffer_len(buf.len())?;
        }
        if self.has_fast_path {
            match self.write_vectored_fast(start, bufs) {
                Err(SwapError::Io(error)) if error.kind() == io::ErrorKind::Unsupported => {
                    trace!(
                        target: "pswap::swapper",
                        event = "vectored_fallback",
                        op = "write",
                        error = %error
                    );
                }
                result => return result,
            }
        }
        self.write_vectored_fallback(start, bufs)
    }

    /// Notify the swapper that the cache evicted `page`.
    pub fn evicted(&self, page: PageId) {
        let callback = self.on_evict.lock().clone();
        if let Some(callback) = callback {
            callback(page);
        }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn file(&self) -> &Path {
        &self.path
    }

    /// Page size this swapper was opened with.
    #[must_use]
    pub fn page_size(&self) -> PageSize {
        self.page_size
    }

    /// Current logical file length in bytes.
    #[must_use]
    pub fn current_file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    /// Largest valid page id, or `None` while the file is empty.
    #[must_use]
    pub fn last_page_id(&self) -> Option<PageId> {
        let size = self.current_file_size();
        if size == 0 {
            return None;
        }
        let page_bytes = u64::from(self.page_size.get());
        let full_pages = size / page_bytes;
        if size % page_bytes == 0 {
            Some(PageId(full_pages - 1))
        } else {
            // The partial tail page counts as a valid page.
            Some(PageId(full_pages))
        }
    }

    /// Flush written pages to stable storage via the token stripe.
    pub fn force(&self) -> Result<()> {
        self.retrying(TOKEN_PAGE, |channel| channel.force(false))
    }

    /// Reset the size register, then truncate the file to zero length.
    pub fn truncate(&self) -> Result<()> {
        self.retrying(TOKEN_PAGE, |channel| {
            self.set_current_file_size(0);
            channel.truncate(0)
        })?;
        debug!(
            target: "pswap::swapper",
            event = "file_truncated",
            path = %self.path.display()
        );
        Ok(())
    }

    /// Close every channel stripe and drop the eviction callback.
    pub fn close(&self) -> Result<()> {
        let result = {
            let mut state = self.state.lock();
            state.closed = true;
            self.close_all_stripes()
        };
        // The callback is dropped even when a stripe failed to close: it
        // can retain a large translation structure, and evicted pages keep
        // the swapper itself alive until the eviction threads drain them.
        *self.on_evict.lock() = None;
        debug!(
            target: "pswap::swapper",
            event = "swapper_closed",
            path = %self.path.display()
        );
        result
    }

    /// Close, then remove the backing file.
    pub fn close_and_delete(&self) -> Result<()> {
        self.close()?;
        self.fs.delete_file(&self.path)
    }

    fn stripe(&self, page: PageId) -> usize {
        ((page.0 >> self.stripe_shift) & self.stripe_mask) as usize
    }

    fn channel(&self, page: PageId) -> Arc<F::Channel> {
        self.stripes[self.stripe(page)].read().clone()
    }

    fn token_channel(&self) -> Arc<F::Channel> {
        self.stripes[TOKEN_STRIPE].read().clone()
    }

    fn page_bytes(&self) -> usize {
        self.page_size.bytes()
    }

    fn page_offset(&self, page: PageId) -> Result<u64> {
        page.checked_offset(self.page_size)
            .map(|offset| offset.0)
            .ok_or_else(|| offset_overflow(page))
    }

    fn check_buffer_len(&self, len: usize) -> Result<()> {
        let page_bytes = self.page_bytes();
        if len < page_bytes {
            return Err(SwapError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("page buffer of {len} bytes is smaller than the page size {page_bytes}"),
            )));
        }
        Ok(())
    }

    fn increase_file_size_to(&self, new_size: u64) {
        let mut current = self.current_file_size();
        while current < new_size {
            match self.file_size.compare_exchange_weak(
                current,
                new_size,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    fn set_current_file_size(&self, size: u64) {
        self.file_size.store(size, Ordering::Release);
    }

    fn acquire_lock(&self) -> Result<()> {
        if cfg!(windows) {
            // An exclusive lock on Windows restricts subsequent I/O to the
            // locking handle, which would defeat channel striping on the
            // platform that needs it most.
            debug!(
                target: "pswap::swapper",
                event = "file_lock_skipped",
                path = %self.path.display()
            );
            return Ok(());
        }
        match self.token_channel().try_lock_exclusive() {
            Ok(()) => {
                trace!(
                    target: "pswap::swapper",
                    event = "file_lock_acquired",
                    path = %self.path.display()
                );
                Ok(())
            }
            Err(SwapError::Io(cause)) if cause.kind() == io::ErrorKind::WouldBlock => {
                Err(SwapError::FileLock {
                    path: self.path.clone(),
                    cause: None,
                })
            }
            Err(SwapError::Io(cause)) => Err(SwapError::FileLock {
                path: self.path.clone(),
                cause: Some(cause),
            }),
            Err(other) => Err(other),
        }
    }

    /// Run `operation` against the stripe channel for `page`, transparently
    /// reopening channels closed by thread interruption, up to
    /// [`MAX_REOPEN_ATTEMPTS`] times. The caller's interrupt status is
    /// captured per attempt and reasserted once the loop exits.
    fn retrying<T>(
        &self,
        page: PageId,
        mut operation: impl FnMut(&F::Channel) -> Result<T>,
    ) -> Result<T> {
        let mut attempts_left = MAX_REOPEN_ATTEMPTS;
        let mut was_interrupted = false;
        let result = loop {
            let channel = self.channel(page);
            match operation(&channel) {
                Err(error) if error.is_closed_channel() => {
                    let cause = match self.try_reopen(self.stripe(page), error) {
                        Ok(cause) => cause,
                        Err(fatal) => break Err(fatal),
                    };
                    if attempts_left == 0 {
                        break Err(SwapError::Interrupted {
                            path: self.path.clone(),
                            attempts: MAX_REOPEN_ATTEMPTS,
                            cause: Box::new(cause),
                        });
                    }
                    attempts_left -= 1;
                    was_interrupted |= interrupt::take();
                }
                result => break result,
            }
        };
        if was_interrupted {
            interrupt::interrupt();
        }
        result
    }

    /// Reopen a stripe whose channel was closed out from under us, unless
    /// the swapper itself has been closed.
    ///
    /// Returns the original error for the caller's retry bookkeeping. When
    /// the swapper was explicitly closed the original error is re-raised;
    /// when reopening fails, the failure is attached to the original
    /// closed-channel error and that is raised instead.
    fn try_reopen(&self, stripe: usize, error: SwapError) -> Result<SwapError> {
        let state = self.state.lock();
        let slot = &self.stripes[stripe];
        if slot.read().is_open() {
            // Another thread healed the stripe ahead of us.
            return Ok(error);
        }
        if state.closed {
            return Err(error);
        }

        let reopened = self.fs.open(&self.path, self.channel_options).map(|channel| {
            *slot.write() = Arc::new(channel);
        });
        let relocked = reopened.and_then(|()| {
            if stripe == TOKEN_STRIPE {
                // Closing a channel also released the file lock.
                self.acquire_lock()
            } else {
                Ok(())
            }
        });
        match relocked {
            Ok(()) => {
                warn!(
                    target: "pswap::swapper",
                    event = "channel_reopened",
                    path = %self.path.display(),
                    stripe
                );
                Ok(error)
            }
            Err(reopen_error) => Err(attach_reopen_failure(error, reopen_error)),
        }
    }

    fn swap_in(&self, channel: &F::Channel, buf: &mut [u8], offset: u64) -> Result<usize> {
        let page_bytes = self.page_bytes();
        let mut read_total = 0;
        while read_total < page_bytes {
            let n = channel
                .read_at(
                    &mut buf[read_total..page_bytes],
                    ByteOffset(offset + read_total as u64),
                )
                .map_err(|error| with_read_context(error, offset, page_bytes, read_total))?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        // Zero-fill the rest.
        buf[read_total..page_bytes].fill(0);
        Ok(read_total)
    }

    fn swap_out(&self, channel: &F::Channel, buf: &[u8], offset: u64) -> Result<usize> {
        let page_bytes = self.page_bytes();
        channel.write_all_at(&buf[..page_bytes], ByteOffset(offset))?;
        Ok(page_bytes)
    }

    fn read_vectored_fast(&self, start: PageId, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let file_offset = self.page_offset(start)?;
        self.run_end(start, file_offset, bufs.len())?;
        self.retrying(start, |channel| {
            self.scatter_read(channel, file_offset, bufs)
        })
    }

    fn write_vectored_fast(&self, start: PageId, bufs: &[&[u8]]) -> Result<usize> {
        let file_offset = self.page_offset(start)?;
        let end = self.run_end(start, file_offset, bufs.len())?;
        self.increase_file_size_to(end);
        self.retrying(start, |channel| {
            self.gather_write(channel, file_offset, bufs)
        })
    }

    fn run_end(&self, start: PageId, file_offset: u64, pages: usize) -> Result<u64> {
        (self.page_bytes() as u64)
            .checked_mul(pages as u64)
            .and_then(|run_bytes| file_offset.checked_add(run_bytes))
            .ok_or_else(|| offset_overflow(start))
    }

    /// One scatter-read batch. Restarted wholesale when the channel closes
    /// mid-batch; the EOF and zero-fill rules match `len` scalar reads.
    fn scatter_read(
        &self,
        channel: &F::Channel,
        file_offset: u64,
        bufs: &mut [&mut [u8]],
    ) -> Result<usize> {
        let page_bytes = self.page_bytes();
        let to_read = page_bytes * bufs.len();
        let mut read_total = 0_usize;
        while read_total < to_read {
            let page = read_total / page_bytes;
            let intra = read_total % page_bytes;
            let mut iov: Vec<IoSliceMut<'_>> = bufs[page..]
                .iter_mut()
                .enumerate()
                .map(|(i, buf)| {
                    if i == 0 {
                        IoSliceMut::new(&mut buf[intra..page_bytes])
                    } else {
                        IoSliceMut::new(&mut buf[..page_bytes])
                    }
                })
                .collect();
            let n = channel
                .read_vectored_at(&mut iov, ByteOffset(file_offset + read_total as u64))
                .map_err(|error| with_read_context(error, file_offset, to_read, read_total))?;
            if n == 0 {
                break;
            }
            read_total += n;
        }
        zero_fill_tail(bufs, page_bytes, read_total);
        Ok(read_total)
    }

    /// One gather-write batch, restarted wholesale on channel closure.
    fn gather_write(
        &self,
        channel: &F::Channel,
        file_offset: u64,
        bufs: &[&[u8]],
    ) -> Result<usize> {
        let page_bytes = self.page_bytes();
        let to_write = page_bytes * bufs.len();
        let mut written = 0_usize;
        while written < to_write {
            let page = written / page_bytes;
            let intra = written % page_bytes;
            let iov: Vec<IoSlice<'_>> = bufs[page..]
                .iter()
                .enumerate()
                .map(|(i, buf)| {
                    if i == 0 {
                        IoSlice::new(&buf[intra..page_bytes])
                    } else {
                        IoSlice::new(&buf[..page_bytes])
                    }
                })
                .collect();
            let n = channel.write_vectored_at(&iov, ByteOffset(file_offset + written as u64))?;
            if n == 0 {
                return Err(SwapError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!(
                        "gather write stalled after {written} of {to_write} bytes at file offset {file_offset}"
                    ),
                )));
            }
            written += n;
        }
        Ok(written)
    }

    fn read_vectored_fallback(&self, start: PageId, bufs: &mut [&mut [u8]]) -> Result<usize> {
        let mut bytes = 0;
        for (i, buf) in bufs.iter_mut().enumerate() {
            let page = start
                .checked_add(i as u64)
                .ok_or_else(|| offset_overflow(start))?;
            bytes += self.read(page, buf)?;
        }
        Ok(bytes)
    }

    fn write_vectored_fallback(&self, start: PageId, bufs: &[&[u8]]) -> Result<usize> {
        let mut bytes = 0;
        for (i, buf) in bufs.iter().enumerate() {
            let page = start
                .checked_add(i as u64)
                .ok_or_else(|| offset_overflow(start))?;
            bytes += self.write(page, buf)?;
        }
        Ok(bytes)
    }

    fn close_all_stripes(&self) -> Result<()> {
        let total = self.stripes.len();
        let mut failures = Vec::new();
        for slot in &self.stripes {
            if let Err(error) = slot.read().close() {
                failures.push(error);
            }
        }
        let failed = failures.len();
        let mut failures = failures.into_iter();
        match failures.next() {
            None => Ok(()),
            Some(first) => Err(SwapError::CloseChannels {
                path: self.path.clone(),
                failed,
                total,
                cause: Box::new(first),
                suppressed: failures.collect(),
            }),
        }
    }
}

fn validate_direct_io<F: SwapFs>(fs: &F, path: &Path, page_size: PageSize) -> Result<()> {
    if !cfg!(target_os = "linux") {
        return Err(SwapError::Config(
            "direct I/O support is available only on Linux".to_owned(),
        ));
    }
    let block_size = fs.block_size(path)?;
    if block_size == 0 || u64::from(page_size.get()) % block_size != 0 {
        return Err(SwapError::Config(format!(
            "direct I/O requires the page size to be a multiple of the block size \
             (page size: {page_size}, block size: {block_size})"
        )));
    }
    Ok(())
}

fn offset_overflow(page: PageId) -> SwapError {
    SwapError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("byte offset overflow for page {page}"),
    ))
}

fn with_read_context(error: SwapError, offset: u64, expected: usize, read_total: usize) -> SwapError {
    match error {
        // Closed channels must pass through untouched for the retry loop.
        SwapError::Io(cause) => SwapError::Io(io::Error::new(
            cause.kind(),
            format!(
                "read failed after {read_total} of {expected} bytes at file offset {offset}: {cause}"
            ),
        )),
        other => other,
    }
}

fn attach_reopen_failure(error: SwapError, reopen_error: SwapError) -> SwapError {
    match error {
        SwapError::ClosedChannel { path, .. } => SwapError::ClosedChannel {
            path,
            source: Some(Box::new(reopen_error)),
        },
        other => other,
    }
}

fn zero_fill_tail(bufs: &mut [&mut [u8]], page_bytes: usize, read_total: usize) {
    let full_pages = read_total / page_bytes;
    let partial = read_total % page_bytes;
    if partial > 0 {
        bufs[full_pages][partial..page_bytes].fill(0);
    }
    let first_unread = if partial > 0 { full_pages + 1 } else { full_pages };
    for buf in &mut bufs[first_unread..] {
        buf[..page_bytes].fill(0);
    }
}

impl<F: SwapFs> PageSwapper for SingleFileSwapper<F> {
    fn read(&self, page: PageId, buf: &mut [u8]) -> Result<usize> {
        SingleFileSwapper::read(self, page, buf)
    }

    fn read_vectored(&self, start: PageId, bufs: &mut [&mut [u8]]) -> Result<usize> {
        SingleFileSwapper::read_vectored(self, start, bufs)
    }

    fn write(&self, page: PageId, buf: &[u8]) -> Result<usize> {
        SingleFileSwapper::write(self, page, buf)
    }

    fn write_vectored(&self, start: PageId, bufs: &[&[u8]]) -> Result<usize> {
        SingleFileSwapper::write_vectored(self, start, bufs)
    }

    fn evicted(&self, page: PageId) {
        SingleFileSwapper::evicted(self, page);
    }

    fn file(&self) -> &Path {
        SingleFileSwapper::file(self)
    }

    fn force(&self) -> Result<()> {
        SingleFileSwapper::force(self)
    }

    fn last_page_id(&self) -> Option<PageId> {
        SingleFileSwapper::last_page_id(self)
    }

    fn truncate(&self) -> Result<()> {
        SingleFileSwapper::truncate(self)
    }

    fn close(&self) -> Result<()> {
        SingleFileSwapper::close(self)
    }

    fn close_and_delete(&self) -> Result<()> {
        SingleFileSwapper::close_and_delete(self)
    }
}

impl<F: SwapFs> fmt::Debug for SingleFileSwapper<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFileSwapper")
            .field("page_size", &self.page_size)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Swapper identity is the backing file alone; the cache de-duplicates
/// mappings keyed on file identity.
impl<F: SwapFs> PartialEq for SingleFileSwapper<F> {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path
    }
}

impl<F: SwapFs> Eq for SingleFileSwapper<F> {}

impl<F: SwapFs> Hash for SingleFileSwapper<F> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.path.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const PAGE: u32 = 512;

    fn page_size(bytes: u32) -> PageSize {
        PageSize::new(bytes).unwrap()
    }

    fn open_mem(
        fs: Arc<MemFs>,
        path: &str,
        bytes: u32,
        config: SwapperConfig,
    ) -> Result<SingleFileSwapper<Arc<MemFs>>> {
        SingleFileSwapper::open(fs, Path::new(path), page_size(bytes), config, None)
    }

    fn mem_swapper(bytes: u32) -> SingleFileSwapper<Arc<MemFs>> {
        open_mem(
            Arc::new(MemFs::new()),
            "store.swp",
            bytes,
            SwapperConfig::default(),
        )
        .unwrap()
    }

    fn patterned(page: u64, bytes: usize) -> Vec<u8> {
        (0..bytes)
            .map(|i| (page as u8).wrapping_mul(31).wrapping_add(i as u8))
            .collect()
    }

    #[test]
    fn default_config_is_single_stripe_on_non_windows() {
        let config = SwapperConfig::default();
        if cfg!(windows) {
            assert!(config.channel_stripe_power >= 1);
            assert!(config.stripe_count() <= MAX_STRIPE_COUNT);
        } else {
            assert_eq!(config.channel_stripe_power, 0);
            assert_eq!(config.stripe_count(), 1);
        }
        assert_eq!(config.channel_stripe_shift, DEFAULT_STRIPE_SHIFT);
    }

    #[test]
    fn config_rejects_oversized_stripe_power() {
        let config = SwapperConfig {
            channel_stripe_power: 7,
            ..SwapperConfig::default()
        };
        assert!(matches!(
            config.validate().unwrap_err(),
            SwapError::Config(_)
        ));
    }

    #[test]
    fn no_channel_striping_forces_one_stripe() {
        let config = SwapperConfig {
            channel_stripe_power: 3,
            no_channel_striping: true,
            ..SwapperConfig::default()
        };
        assert_eq!(config.stripe_count(), 1);
    }

    #[test]
    fn stripe_selection_rotates_per_shift_block() {
        let config = SwapperConfig {
            channel_stripe_power: 2,
            ..SwapperConfig::default()
        };
        let swapper = open_mem(Arc::new(MemFs::new()), "store.swp", PAGE, config).unwrap();

        // 16 consecutive pages share a stripe before rotating.
        for page in 0..16 {
            assert_eq!(swapper.stripe(PageId(page)), 0);
        }
        assert_eq!(swapper.stripe(PageId(16)), 1);
        assert_eq!(swapper.stripe(PageId(32)), 2);
        assert_eq!(swapper.stripe(PageId(48)), 3);
        // The mask wraps back around.
        assert_eq!(swapper.stripe(PageId(64)), 0);
    }

    #[test]
    fn sparse_write_then_read() {
        let swapper = mem_swapper(8192);
        let payload = patterned(3, 8192);
        assert_eq!(swapper.write(PageId(3), &payload).unwrap(), 8192);

        // Page 0 sits in the hole before the written page: it is inside the
        // file, so the read covers the whole page and observes zeros.
        let mut buf = vec![0xAA_u8; 8192];
        assert_eq!(swapper.read(PageId(0), &mut buf).unwrap(), 8192);
        assert!(buf.iter().all(|byte| *byte == 0));

        assert_eq!(swapper.read(PageId(3), &mut buf).unwrap(), 8192);
        assert_eq!(buf, payload);

        assert_eq!(swapper.last_page_id(), Some(PageId(3)));
    }

    #[test]
    fn last_page_id_counts_partial_tail() {
        let fs = Arc::new(MemFs::new());
        let seed = fs.write(Path::new("store.swp")).unwrap();
        seed.write_all_at(&[9_u8; 700], ByteOffset::ZERO).unwrap();

        let swapper = open_mem(fs, "store.swp", PAGE, SwapperConfig::default()).unwrap();
        assert_eq!(swapper.current_file_size(), 700);
        assert_eq!(swapper.last_page_id(), Some(PageId(1)));

        // The tail page reads back as its written prefix plus zeros.
        let mut buf = vec![0xFF_u8; PAGE as usize];
        assert_eq!(swapper.read(PageId(1), &mut buf).unwrap(), 700 - 512);
        assert!(buf[..188].iter().all(|byte| *byte == 9));
        assert!(buf[188..].iter().all(|byte| *byte == 0));
    }

    #[test]
    fn last_page_id_is_monotone_across_writes() {
        let swapper = mem_swapper(PAGE);
        let payload = patterned(0, PAGE as usize);
        let mut previous = None;
        for page in [0_u64, 5, 2, 9, 9, 1] {
            swapper.write(PageId(page), &payload).unwrap();
            let current = swapper.last_page_id();
            assert!(current >= previous, "size register went backwards");
            previous = current;
        }
        assert_eq!(previous, Some(PageId(9)));
    }

    #[test]
    fn size_register_never_lowers_on_stale_raise() {
        let swapper = mem_swapper(PAGE);
        swapper.increase_file_size_to(4096);
        swapper.increase_file_size_to(1024);
        assert_eq!(swapper.current_file_size(), 4096);
    }

    #[test]
    fn truncate_resets_everything() {
        let swapper = mem_swapper(8192);
        swapper.write(PageId(3), &patterned(3, 8192)).unwrap();
        assert_eq!(swapper.last_page_id(), Some(PageId(3)));

        swapper.truncate().unwrap();
        assert_eq!(swapper.last_page_id(), None);

        let mut buf = vec![0xAA_u8; 8192];
        assert_eq!(swapper.read(PageId(3), &mut buf).unwrap(), 0);
        assert!(buf.iter().all(|byte| *byte == 0));
    }

    #[test]
    fn vectored_write_matches_scalar_reads() {
        let swapper = mem_swapper(4096);
        let pages: Vec<Vec<u8>> = (0..4).map(|page| patterned(page, 4096)).collect();
        let bufs: Vec<&[u8]> = pages.iter().map(Vec::as_slice).collect();
        assert_eq!(
            swapper.write_vectored(PageId(0), &bufs).unwrap(),
            4 * 4096
        );

        let mut buf = vec![0_u8; 4096];
        for (page, expected) in pages.iter().enumerate() {
            assert_eq!(swapper.read(PageId(page as u64), &mut buf).unwrap(), 4096);
            assert_eq!(&buf, expected, "page {page} mismatch");
        }
    }

    #[test]
    fn vectored_read_matches_scalar_reads_including_zero_fill() {
        let swapper = mem_swapper(4096);
        for page in 0..4_u64 {
            swapper.write(PageId(page), &patterned(page, 4096)).unwrap();
        }

        // Read six pages: four resident, two past end-of-file.
        let mut storage = vec![vec![0xAA_u8; 4096]; 6];
        let mut bufs: Vec<&mut [u8]> = storage.iter_mut().map(Vec::as_mut_slice).collect();
        assert_eq!(
            swapper.read_vectored(PageId(0), &mut bufs).unwrap(),
            4 * 4096
        );

        let mut scalar = vec![0_u8; 4096];
        for page in 0..6_u64 {
            swapper.read(PageId(page), &mut scalar).unwrap();
            assert_eq!(&storage[page as usize], &scalar, "page {page} mismatch");
        }
    }

    #[test]
    fn vectored_read_of_empty_file_zeroes_buffers() {
        let swapper = mem_swapper(4096);
        let mut storage = vec![vec![0xAA_u8; 4096]; 3];
        let mut bufs: Vec<&mut [u8]> = storage.iter_mut().map(Vec::as_mut_slice).collect();
        assert_eq!(swapper.read_vectored(PageId(0), &mut bufs).unwrap(), 0);
        for buf in &storage {
            assert!(buf.iter().all(|byte| *byte == 0));
        }
    }

    #[test]
    fn eviction_callback_fires_until_close() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let callback: EvictionCallback = Arc::new(move |page| recorder.lock().push(page));

        let swapper = SingleFileSwapper::open(
            Arc::new(MemFs::new()),
            Path::new("store.swp"),
            page_size(PAGE),
            SwapperConfig::default(),
            Some(callback),
        )
        .unwrap();

        swapper.evicted(PageId(7));
        swapper.evicted(PageId(8));
        assert_eq!(&*seen.lock(), &[PageId(7), PageId(8)]);

        swapper.close().unwrap();
        swapper.evicted(PageId(9));
        assert_eq!(&*seen.lock(), &[PageId(7), PageId(8)]);
    }

    #[test]
    fn close_refuses_further_io_and_reopen() {
        let swapper = mem_swapper(PAGE);
        let payload = patterned(0, PAGE as usize);
        swapper.write(PageId(0), &payload).unwrap();
        swapper.close().unwrap();

        let mut buf = vec![0_u8; PAGE as usize];
        let err = swapper.read(PageId(0), &mut buf).unwrap_err();
        assert!(err.is_closed_channel());
        let err = swapper.write(PageId(0), &payload).unwrap_err();
        assert!(err.is_closed_channel());

        // Closing again is harmless.
        swapper.close().unwrap();
    }

    #[test]
    fn swappers_over_the_same_path_are_equal() {
        // Separate filesystems, same path: no lock conflict, same identity.
        let a = mem_swapper(PAGE);
        let b = mem_swapper(PAGE);
        let c = open_mem(
            Arc::new(MemFs::new()),
            "other.swp",
            PAGE,
            SwapperConfig::default(),
        )
        .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[cfg(not(windows))]
    #[test]
    fn second_swapper_on_the_same_file_fails_to_lock() {
        let fs = Arc::new(MemFs::new());
        let _first = open_mem(Arc::clone(&fs), "store.swp", PAGE, SwapperConfig::default())
            .unwrap();
        let err = open_mem(fs, "store.swp", PAGE, SwapperConfig::default()).unwrap_err();
        assert!(matches!(err, SwapError::FileLock { cause: None, .. }));
    }

    #[test]
    fn direct_io_requires_block_aligned_page_size() {
        let config = SwapperConfig {
            use_direct_io: true,
            ..SwapperConfig::default()
        };
        let err = open_mem(Arc::new(MemFs::with_block_size(512)), "store.swp", 100, config)
            .unwrap_err();
        assert!(matches!(err, SwapError::Config(_)));
    }

    #[test]
    fn undersized_buffer_is_rejected() {
        let swapper = mem_swapper(PAGE);
        let mut small = vec![0_u8; 64];
        let err = swapper.read(PageId(0), &mut small).unwrap_err();
        let SwapError::Io(io_err) = err else {
            panic!("expected Io error");
        };
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn page_offset_overflow_is_an_error() {
        let swapper = mem_swapper(PAGE);
        let mut buf = vec![0_u8; PAGE as usize];
        assert!(swapper.read(PageId(u64::MAX), &mut buf).is_err());
    }

    #[test]
    fn close_and_delete_removes_the_file() {
        let fs = Arc::new(MemFs::new());
        let swapper = open_mem(Arc::clone(&fs), "store.swp", PAGE, SwapperConfig::default())
            .unwrap();
        swapper.write(PageId(0), &patterned(0, PAGE as usize)).unwrap();
        swapper.close_and_delete().unwrap();
        assert!(fs.delete_file(Path::new("store.swp")).is_err());
    }

    #[test]
    fn force_flushes_through_the_token_stripe() {
        let swapper = mem_swapper(PAGE);
        swapper.write(PageId(0), &patterned(0, PAGE as usize)).unwrap();
        swapper.force().unwrap();
        swapper.close().unwrap();
        assert!(swapper.force().unwrap_err().is_closed_channel());
    }
}

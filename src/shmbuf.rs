//! Versioned frame buffers in named shared memory
//!
//! A [`SharedBuffer`] is a fixed-size payload preceded by a small header that
//! carries the access state: a writer-active flag, the number of active
//! readers, and a frame counter that advances modulo [`FRAME_SEQ_MODULUS`].
//! The state (never the payload) is guarded by one [`BinarySemaphore`].
//!
//! # Layout
//!
//! ```text
//! offset 0   BufferHeader (64 bytes): magic, version, payload_len, AccessState
//! offset 64  payload (payload_len bytes)
//! ```
//!
//! # Locking
//!
//! - Any number of readers may hold the read lock at once.
//! - A writer first announces itself (`writer_active`), which stops new
//!   readers from being admitted, then polls until the readers drain.
//! - Writers exclude each other because announcing is a check-and-set
//!   under the semaphore.
//!
//! Every wait is a busy poll: the semaphore is taken, the condition checked,
//! and the semaphore released between polls. There is no writer priority
//! while the writer is still waiting to announce, so a continuous stream of
//! readers can delay it indefinitely, and a blocked `read_lock`/`write_lock`
//! cannot be cancelled.

use crate::error::{Error, Result};
use crate::semaphore::{backoff, BinarySemaphore};
use crate::shm::{Access, ShmSegment};
use std::sync::atomic::{AtomicU32, Ordering};

/// Magic number for buffer validation
const SHMBUF_MAGIC: u32 = 0x4653_4246; // "FSBF"
const SHMBUF_VERSION: u32 = 1;

/// Frame numbers wrap at this value
pub const FRAME_SEQ_MODULUS: u32 = 32;

/// Lock bookkeeping shared by every process that maps the buffer
///
/// Each method other than the `*_lock` loops is a single step taken under
/// the semaphore, so the state machine can be driven one step at a time.
#[repr(C)]
pub struct AccessState {
    sem: BinarySemaphore,
    writer_active: AtomicU32,
    reader_count: AtomicU32,
    frame_seq: AtomicU32,
}

impl AccessState {
    pub const fn new() -> Self {
        Self {
            sem: BinarySemaphore::new(),
            writer_active: AtomicU32::new(0),
            reader_count: AtomicU32::new(0),
            frame_seq: AtomicU32::new(0),
        }
    }

    /// Admit one reader unless a writer is active.
    pub fn try_enter_read(&self) -> bool {
        self.sem.with(|| {
            if self.writer_active.load(Ordering::Relaxed) != 0 {
                return false;
            }
            let readers = self.reader_count.load(Ordering::Relaxed);
            self.reader_count.store(readers + 1, Ordering::Relaxed);
            true
        })
    }

    /// Drop one reader. Returns `false` for an unmatched release, which is
    /// otherwise ignored.
    pub fn leave_read(&self) -> bool {
        self.sem.with(|| {
            let readers = self.reader_count.load(Ordering::Relaxed);
            if readers == 0 {
                return false;
            }
            self.reader_count.store(readers - 1, Ordering::Relaxed);
            true
        })
    }

    /// Become the announced writer unless another writer already is.
    pub fn try_announce_write(&self) -> bool {
        self.sem.with(|| {
            if self.writer_active.load(Ordering::Relaxed) != 0 {
                return false;
            }
            self.writer_active.store(1, Ordering::Relaxed);
            true
        })
    }

    /// Whether every reader has left.
    pub fn readers_drained(&self) -> bool {
        self.sem
            .with(|| self.reader_count.load(Ordering::Relaxed) == 0)
    }

    pub fn leave_write(&self) {
        self.sem
            .with(|| self.writer_active.store(0, Ordering::Relaxed));
    }

    /// Advance the frame counter. Only the write-lock holder may call this.
    pub fn advance_frame(&self) -> u32 {
        self.sem.with(|| {
            let next = (self.frame_seq.load(Ordering::Relaxed) + 1) % FRAME_SEQ_MODULUS;
            self.frame_seq.store(next, Ordering::Release);
            next
        })
    }

    /// Block until admitted as a reader.
    pub fn read_lock(&self) {
        let mut attempt = 0u32;
        while !self.try_enter_read() {
            backoff(attempt);
            attempt = attempt.saturating_add(1);
        }
    }

    /// Block until this caller is the only writer and no readers remain.
    pub fn write_lock(&self) {
        let mut attempt = 0u32;
        while !self.try_announce_write() {
            backoff(attempt);
            attempt = attempt.saturating_add(1);
        }
        attempt = 0;
        while !self.readers_drained() {
            backoff(attempt);
            attempt = attempt.saturating_add(1);
        }
    }

    #[inline]
    pub fn frame(&self) -> u32 {
        self.frame_seq.load(Ordering::Acquire)
    }

    /// Snapshot of the active reader count
    #[inline]
    pub fn reader_count(&self) -> u32 {
        self.reader_count.load(Ordering::Acquire)
    }

    /// Snapshot of the writer flag
    #[inline]
    pub fn writer_active(&self) -> bool {
        self.writer_active.load(Ordering::Acquire) != 0
    }
}

impl Default for AccessState {
    fn default() -> Self {
        Self::new()
    }
}

/// Header stored at the beginning of the segment
#[repr(C, align(64))]
struct BufferHeader {
    magic: AtomicU32,
    version: u32,
    payload_len: u64,
    state: AccessState,
}

const HEADER_SIZE: usize = std::mem::size_of::<BufferHeader>();

fn segment_size(length: usize) -> Result<usize> {
    if length == 0 {
        return Err(Error::InvalidArgument(
            "buffer length must be non-zero".to_string(),
        ));
    }
    HEADER_SIZE.checked_add(length).ok_or_else(|| {
        Error::InvalidArgument(format!("buffer length {length} is too large"))
    })
}

/// Check that a mapped segment holds an initialized buffer of `length`.
fn validate(shm: &ShmSegment, length: usize) -> Result<()> {
    let header = unsafe { &*(shm.as_ptr() as *const BufferHeader) };
    let magic = header.magic.load(Ordering::Acquire);
    if magic != SHMBUF_MAGIC {
        return Err(Error::InvalidArgument(format!(
            "'{}' is not a frame buffer: expected magic 0x{SHMBUF_MAGIC:08X}, got 0x{magic:08X}",
            shm.name()
        )));
    }
    if header.version != SHMBUF_VERSION {
        return Err(Error::InvalidArgument(format!(
            "'{}' has buffer version {}, expected {SHMBUF_VERSION}",
            shm.name(),
            header.version
        )));
    }
    if header.payload_len != length as u64 {
        return Err(Error::InvalidArgument(format!(
            "'{}' holds {} payload bytes, expected {length}",
            shm.name(),
            header.payload_len
        )));
    }
    Ok(())
}

/// Read/write handle to a shared frame buffer
///
/// The producer creates and owns the buffer. Tools may open a non-owning
/// read/write handle with [`SharedBuffer::open_existing`]; consumers that only
/// copy frames use [`BufferView`].
pub struct SharedBuffer {
    shm: ShmSegment,
}

impl SharedBuffer {
    /// Exclusively create a buffer with `length` payload bytes.
    pub fn create(name: &str, length: usize) -> Result<Self> {
        let shm = ShmSegment::create(name, segment_size(length)?)?;

        let header = shm.as_ptr() as *mut BufferHeader;
        unsafe {
            std::ptr::addr_of_mut!((*header).version).write(SHMBUF_VERSION);
            std::ptr::addr_of_mut!((*header).payload_len).write(length as u64);
            std::ptr::addr_of_mut!((*header).state).write(AccessState::new());
            // Publish last so openers never see a half-built header.
            (*header).magic.store(SHMBUF_MAGIC, Ordering::Release);
        }

        tracing::debug!(name, length, "created shared buffer");
        Ok(Self { shm })
    }

    /// Open an existing buffer read/write without taking ownership.
    pub fn open_existing(name: &str, length: usize) -> Result<Self> {
        let shm = ShmSegment::open(name, segment_size(length)?, Access::ReadWrite)?;
        validate(&shm, length)?;
        tracing::debug!(name, length, "opened shared buffer");
        Ok(Self { shm })
    }

    #[inline(always)]
    fn state(&self) -> &AccessState {
        unsafe { &(*(self.shm.as_ptr() as *const BufferHeader)).state }
    }

    #[inline(always)]
    fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.shm.as_ptr().add(HEADER_SIZE) }
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.shm.size() - HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if this handle created the buffer
    pub fn is_owner(&self) -> bool {
        self.shm.is_owner()
    }

    /// Block until admitted as a reader. Pair with [`read_release`].
    ///
    /// [`read_release`]: SharedBuffer::read_release
    pub fn read_lock(&self) {
        self.state().read_lock();
    }

    /// Release one read lock. Extra releases are ignored.
    pub fn read_release(&self) {
        if !self.state().leave_read() {
            tracing::debug!(name = self.name(), "unmatched read release ignored");
        }
    }

    /// Block until this caller is the sole writer with no readers left.
    pub fn write_lock(&self) {
        self.state().write_lock();
    }

    pub fn write_release(&self) {
        self.state().leave_write();
    }

    /// Advance the frame counter. Only valid while holding the write lock.
    pub fn advance_frame(&self) -> u32 {
        debug_assert!(self.state().writer_active(), "advance_frame without write lock");
        self.state().advance_frame()
    }

    /// Frame counter of the last published frame
    pub fn current_frame(&self) -> u32 {
        self.state().frame()
    }

    pub fn reader_count(&self) -> u32 {
        self.state().reader_count()
    }

    pub fn writer_active(&self) -> bool {
        self.state().writer_active()
    }

    /// Take a read lock released when the guard drops.
    pub fn read(&self) -> ReadGuard<'_> {
        self.read_lock();
        ReadGuard { buf: self }
    }

    /// Take the write lock, released when the guard drops.
    pub fn write(&self) -> WriteGuard<'_> {
        self.write_lock();
        WriteGuard { buf: self }
    }

    /// Unmap the buffer and unlink it from the namespace.
    ///
    /// Only the creating handle may destroy a buffer; other handles get
    /// [`Error::NotOwner`] and are simply unmapped.
    pub fn destroy(mut self) -> Result<()> {
        if !self.shm.is_owner() {
            return Err(Error::NotOwner {
                name: self.name().to_string(),
            });
        }
        self.shm.unlink()?;
        tracing::debug!(name = self.name(), "destroyed shared buffer");
        Ok(())
    }
}

/// Shared access to the payload while a read lock is held
pub struct ReadGuard<'a> {
    buf: &'a SharedBuffer,
}

impl ReadGuard<'_> {
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf.payload_ptr(), self.buf.len()) }
    }

    pub fn frame(&self) -> u32 {
        self.buf.current_frame()
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.buf.read_release();
    }
}

/// Exclusive access to the payload while the write lock is held
pub struct WriteGuard<'a> {
    buf: &'a SharedBuffer,
}

impl WriteGuard<'_> {
    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.buf.payload_ptr(), self.buf.len()) }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.buf.payload_ptr(), self.buf.len()) }
    }

    /// Mark the payload as a new frame and return its number.
    pub fn publish(&mut self) -> u32 {
        self.buf.state().advance_frame()
    }

    pub fn frame(&self) -> u32 {
        self.buf.current_frame()
    }
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.buf.write_release();
    }
}

/// Read-only consumer mapping of a buffer owned by another process
///
/// A view cannot take locks itself. Consumers ask the producer to hold a
/// read lock on their behalf (over RPC) around [`BufferView::copy_to`].
pub struct BufferView {
    shm: ShmSegment,
}

impl BufferView {
    pub fn open(name: &str, length: usize) -> Result<Self> {
        let shm = ShmSegment::open(name, segment_size(length)?, Access::ReadOnly)?;
        validate(&shm, length)?;
        tracing::debug!(name, length, "opened read-only buffer view");
        Ok(Self { shm })
    }

    pub fn name(&self) -> &str {
        self.shm.name()
    }

    pub fn len(&self) -> usize {
        self.shm.size() - HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current_frame(&self) -> u32 {
        unsafe { (*(self.shm.as_ptr() as *const BufferHeader)).state.frame() }
    }

    /// Copy the payload into `dst`, returning the number of bytes copied.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let len = self.len().min(dst.len());
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr(), dst.as_mut_ptr(), len);
        }
        len
    }

    /// Raw pointer to the first payload byte
    pub fn as_ptr(&self) -> *const u8 {
        unsafe { self.shm.as_ptr().add(HEADER_SIZE) }
    }
}

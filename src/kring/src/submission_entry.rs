use std::os::fd::{AsRawFd, RawFd};

use bitflags::bitflags;
use kring_sys::{
    __kernel_timespec, io_uring_sqe, IORING_OP_CLOSE, IORING_OP_FSYNC, IORING_OP_NOP,
    IORING_OP_READ, IORING_OP_TIMEOUT, IORING_OP_WRITE, IOSQE_ASYNC, IOSQE_FIXED_FILE,
    IOSQE_IO_DRAIN, IOSQE_IO_HARDLINK, IOSQE_IO_LINK,
};

bitflags! {
    /// Changes how the kernel issues a submission queue entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SqeFlags: u8 {
        /// The file descriptor in the SQE refers to the index of a previously registered file,
        /// not a normal file descriptor.
        const FixedFile = IOSQE_FIXED_FILE;
        /// The SQE will not be started before previously submitted SQEs have completed, and new
        /// SQEs will not be started before this one completes.
        const IoDrain = IOSQE_IO_DRAIN;
        /// The SQE forms a link with the next SQE in the submission ring. That next SQE will not
        /// be started before this one completes. A chain is broken if any request in it fails.
        const IoLink = IOSQE_IO_LINK;
        /// Like [`SqeFlags::IoLink`], except the link survives an error or unexpected result.
        const IoHardlink = IOSQE_IO_HARDLINK;
        /// Issue the SQE asynchronously from the start, skipping the non-blocking attempt.
        const Async = IOSQE_ASYNC;
    }
}

/// An operation descriptor to be placed in the submission queue.
///
/// Entries are plain values: build one, then hand it to
/// [`SubmissionQueue::push`](crate::SubmissionQueue::push) or
/// [`Ring::submit`](crate::Ring::submit), which copy it into the next free slot.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmissionEntry {
    inner: io_uring_sqe,
}

impl SubmissionEntry {
    /// An entry for `opcode` with every other field zeroed.
    pub fn new(opcode: u8) -> Self {
        Self {
            inner: io_uring_sqe {
                opcode,
                ..Default::default()
            },
        }
    }

    /// Prepares a no-op request. Completes with a result of 0.
    pub fn nop() -> Self {
        Self::new(IORING_OP_NOP)
    }

    /// Prepares a read request of up to `buf.len()` bytes from `fd` at `offset`.
    ///
    /// See [read(2)](https://man.archlinux.org/man/read.2)
    ///
    /// # Safety
    /// The kernel writes into `buf` after submission; the caller must keep it alive and
    /// otherwise untouched until the corresponding completion has been reaped.
    pub unsafe fn read(fd: impl AsRawFd, buf: &mut [u8], offset: u64) -> Self {
        Self::new(IORING_OP_READ)
            .fd(fd.as_raw_fd())
            .addr(buf.as_mut_ptr() as u64)
            .len(buf.len() as u32)
            .offset(offset)
    }

    /// Prepares a write request of `buf` to `fd` at `offset`.
    ///
    /// See [write(2)](https://man.archlinux.org/man/write.2)
    ///
    /// # Safety
    /// The kernel reads `buf` after submission; the caller must keep it alive until the
    /// corresponding completion has been reaped.
    pub unsafe fn write(fd: impl AsRawFd, buf: &[u8], offset: u64) -> Self {
        Self::new(IORING_OP_WRITE)
            .fd(fd.as_raw_fd())
            .addr(buf.as_ptr() as u64)
            .len(buf.len() as u32)
            .offset(offset)
    }

    /// Prepares an fsync request.
    ///
    /// See [fsync(2)](https://man.archlinux.org/man/fsync.2)
    pub fn fsync(fd: impl AsRawFd) -> Self {
        Self::new(IORING_OP_FSYNC).fd(fd.as_raw_fd())
    }

    /// Prepares a close request.
    ///
    /// See [close(2)](https://man.archlinux.org/man/close.2)
    pub fn close(fd: RawFd) -> Self {
        Self::new(IORING_OP_CLOSE).fd(fd)
    }

    /// Prepares a timeout request. It completes after `ts` has elapsed, or once `count`
    /// other completions have been posted if `count` is non-zero.
    ///
    /// # Safety
    /// `ts` must stay alive until the request has been submitted.
    pub unsafe fn timeout(ts: &__kernel_timespec, count: u32, flags: u32) -> Self {
        Self::new(IORING_OP_TIMEOUT)
            .fd(-1)
            .addr(ts as *const __kernel_timespec as u64)
            .len(1)
            .offset(count as u64)
            .op_flags(flags)
    }

    /// Associates a 64-bit value with the entry. The kernel echoes it back in the
    /// corresponding [`CompletionEntry`](crate::CompletionEntry).
    #[inline]
    pub fn user_data(mut self, data: u64) -> Self {
        self.inner.user_data = data;
        self
    }

    /// Replaces the entry flags.
    #[inline]
    pub fn flags(mut self, flags: SqeFlags) -> Self {
        self.inner.flags = flags.bits();
        self
    }

    /// Sets the target file descriptor, or registered file index with
    /// [`SqeFlags::FixedFile`].
    #[inline]
    pub fn fd(mut self, fd: RawFd) -> Self {
        self.inner.fd = fd;
        self
    }

    /// Sets the buffer or argument address.
    #[inline]
    pub fn addr(mut self, addr: u64) -> Self {
        self.inner.addr = addr;
        self
    }

    /// Sets the buffer length or argument count.
    #[inline]
    pub fn len(mut self, len: u32) -> Self {
        self.inner.len = len;
        self
    }

    /// Sets the file offset.
    #[inline]
    pub fn offset(mut self, offset: u64) -> Self {
        self.inner.off = offset;
        self
    }

    /// Sets the operation-specific flags word.
    #[inline]
    pub fn op_flags(mut self, op_flags: u32) -> Self {
        self.inner.op_flags = op_flags;
        self
    }

    /// Sets the request priority.
    #[inline]
    pub fn ioprio(mut self, ioprio: u16) -> Self {
        self.inner.ioprio = ioprio;
        self
    }

    /// Selects a registered buffer for fixed-buffer operations.
    #[inline]
    pub fn buf_index(mut self, index: u16) -> Self {
        self.inner.buf_index = index;
        self
    }

    /// The operation code.
    pub fn opcode(&self) -> u8 {
        self.inner.opcode
    }

    /// The correlation tag set with [`SubmissionEntry::user_data`].
    pub fn get_user_data(&self) -> u64 {
        self.inner.user_data
    }

    /// The raw kernel representation.
    pub fn as_raw(&self) -> &io_uring_sqe {
        &self.inner
    }

    pub(crate) fn into_raw(self) -> io_uring_sqe {
        self.inner
    }
}

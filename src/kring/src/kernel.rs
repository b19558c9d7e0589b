use std::{fmt, os::fd::RawFd, ptr::NonNull};

use kring_sys::{io_uring_params, syscall};
use libc::{c_int, c_void};

/// The kernel side of a ring: the six calls a [`Ring`](crate::Ring) makes across the
/// user/kernel boundary.
///
/// Every method speaks the bridge's signed convention: a non-negative success value,
/// or the negated OS error code. [`Linux`] forwards to the real syscalls;
/// `sim::SimKernel`, behind the `sim` feature, implements the same protocol in-process.
pub trait Kernel: Clone + fmt::Debug {
    /// Creates a ring instance and fills in `params`. Returns its descriptor.
    fn setup(&self, entries: u32, params: &mut io_uring_params) -> c_int;

    /// Maps `len` bytes of the ring `fd` at the given `IORING_OFF_*` offset. Returns the
    /// base address.
    ///
    /// # Safety
    /// The mapping must be released with [`Kernel::unmap`] exactly once.
    unsafe fn map(&self, fd: RawFd, len: usize, offset: u64) -> isize;

    /// Releases a mapping.
    ///
    /// # Safety
    /// `addr`/`len` must come from a successful [`Kernel::map`] and the memory must not be
    /// dereferenced afterwards.
    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> c_int;

    /// Closes a ring descriptor.
    ///
    /// # Safety
    /// `fd` must come from [`Kernel::setup`] and not be used afterwards.
    unsafe fn close(&self, fd: RawFd) -> c_int;

    /// Submits and/or waits. Returns the number of submissions consumed.
    fn enter(&self, fd: RawFd, to_submit: u32, min_complete: u32, flags: u32) -> c_int;

    /// Registers auxiliary resources with the ring.
    ///
    /// # Safety
    /// `arg` must point to what `opcode` expects, valid for `nr_args` elements.
    unsafe fn register(&self, fd: RawFd, opcode: u32, arg: *const c_void, nr_args: u32) -> c_int;
}

/// The running Linux kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct Linux;

impl Kernel for Linux {
    #[inline]
    fn setup(&self, entries: u32, params: &mut io_uring_params) -> c_int {
        syscall::io_uring_setup(entries, params)
    }

    #[inline]
    unsafe fn map(&self, fd: RawFd, len: usize, offset: u64) -> isize {
        syscall::mmap_ring(fd, len, offset)
    }

    #[inline]
    unsafe fn unmap(&self, addr: NonNull<u8>, len: usize) -> c_int {
        syscall::munmap(addr.as_ptr().cast(), len)
    }

    #[inline]
    unsafe fn close(&self, fd: RawFd) -> c_int {
        syscall::close(fd)
    }

    #[inline]
    fn enter(&self, fd: RawFd, to_submit: u32, min_complete: u32, flags: u32) -> c_int {
        syscall::io_uring_enter(fd, to_submit, min_complete, flags)
    }

    #[inline]
    unsafe fn register(&self, fd: RawFd, opcode: u32, arg: *const c_void, nr_args: u32) -> c_int {
        syscall::io_uring_register(fd, opcode, arg, nr_args)
    }
}

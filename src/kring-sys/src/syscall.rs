//! Ring-control syscalls.
//!
//! Every wrapper reports failure the same way: the return value is the negated `errno`,
//! and anything non-negative is the call's success value. Callers never have to consult
//! `errno` themselves.

use std::{io, ptr};

use libc::{c_int, c_long, c_void};

use crate::io_uring_params;

#[inline]
fn errno() -> c_int {
    io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

macro_rules! syscall {
    ($fn: ident($($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            -errno()
        } else {
            res as c_int
        }
    }};
}

/// Creates a ring instance with room for `entries` submissions.
///
/// The kernel reads the requested flags from `params` and fills in the entry counts,
/// features and ring offsets. Returns the ring descriptor.
///
/// See [io_uring_setup(2)](https://man.archlinux.org/man/io_uring_setup.2)
pub fn io_uring_setup(entries: u32, params: &mut io_uring_params) -> c_int {
    syscall!(syscall(
        libc::SYS_io_uring_setup,
        entries as c_long,
        params as *mut io_uring_params as c_long,
    ))
}

/// Hands `to_submit` published submissions to the kernel and, with
/// `IORING_ENTER_GETEVENTS`, waits for `min_complete` completions.
///
/// Returns the number of submissions the kernel consumed.
///
/// See [io_uring_enter(2)](https://man.archlinux.org/man/io_uring_enter.2)
pub fn io_uring_enter(fd: c_int, to_submit: u32, min_complete: u32, flags: u32) -> c_int {
    syscall!(syscall(
        libc::SYS_io_uring_enter,
        fd as c_long,
        to_submit as c_long,
        min_complete as c_long,
        flags as c_long,
        ptr::null::<libc::sigset_t>() as c_long,
        0 as c_long,
    ))
}

/// Attaches or detaches auxiliary resources (buffers, files, eventfds).
///
/// See [io_uring_register(2)](https://man.archlinux.org/man/io_uring_register.2)
///
/// # Safety
/// `arg` must point to whatever `opcode` expects, valid for `nr_args` elements.
pub unsafe fn io_uring_register(fd: c_int, opcode: u32, arg: *const c_void, nr_args: u32) -> c_int {
    syscall!(syscall(
        libc::SYS_io_uring_register,
        fd as c_long,
        opcode as c_long,
        arg as c_long,
        nr_args as c_long,
    ))
}

/// Maps `len` bytes of the ring `fd` at one of the `IORING_OFF_*` offsets, shared with
/// the kernel and populated up front.
///
/// Returns the mapping address, or the negated `errno`. User-space addresses are never
/// negative when read as `isize` on the architectures io_uring supports.
///
/// # Safety
/// The returned mapping must be released with [`munmap`] using the same length.
pub unsafe fn mmap_ring(fd: c_int, len: usize, offset: u64) -> isize {
    let addr = libc::mmap(
        ptr::null_mut(),
        len,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_POPULATE,
        fd,
        offset as libc::off_t,
    );

    if addr == libc::MAP_FAILED {
        -(errno() as isize)
    } else {
        addr as isize
    }
}

/// Releases a mapping created by [`mmap_ring`].
///
/// # Safety
/// `addr`/`len` must describe a live mapping that nothing dereferences afterwards.
pub unsafe fn munmap(addr: *mut c_void, len: usize) -> c_int {
    syscall!(munmap(addr, len))
}

/// Closes a descriptor.
///
/// # Safety
/// `fd` must be owned by the caller and not used afterwards.
pub unsafe fn close(fd: c_int) -> c_int {
    syscall!(close(fd))
}
